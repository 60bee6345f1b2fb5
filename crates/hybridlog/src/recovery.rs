//! Recovery: rebuild a store from an index checkpoint plus a hybrid-log
//! checkpoint.
//!
//! The index files restore the bucket table as of some earlier tail; the
//! log range between that tail (or the checkpoint's flushed frontier,
//! whichever is older) and the checkpoint's final address is replayed
//! record by record, re-inserting chain heads. Records stamped with a
//! version newer than the recovered one belong to the interrupted next
//! version: they are invalidated, not indexed, so recovered chains skip
//! them. Per-session serial numbers are republished as continue tokens.

use crate::address::Address;
use crate::device::read_blocking;
use crate::functions::Functions;
use crate::index::{entry_with_address, key_hash};
use crate::record::{DiskRecord, RecordPtr};
use crate::state::{Phase, SystemState};
use crate::store::StoreInner;
use crate::{Error, Result};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;
use uuid::Uuid;

struct IndexMeta {
    table_size: u64,
    num_ofb_buckets: u64,
    final_addr: Address,
}

struct HlogMeta {
    use_snapshot: bool,
    version: u32,
    flushed: Address,
    start: Address,
    final_addr: Address,
    guids: Vec<Uuid>,
}

fn meta_lines(path: &Path) -> Result<Vec<String>> {
    let mut text = String::new();
    File::open(path)?.read_to_string(&mut text)?;
    Ok(text.lines().map(str::to_owned).collect())
}

fn parse_field<T: std::str::FromStr>(lines: &[String], i: usize, what: &str) -> Result<T> {
    lines
        .get(i)
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::Corruption(format!("bad or missing {what} field")))
}

fn read_index_meta(dir: &Path, token: Uuid) -> Result<IndexMeta> {
    let lines = meta_lines(&dir.join("index.meta"))?;
    let stored: Uuid = parse_field(&lines, 0, "index token")?;
    if stored != token {
        return Err(Error::Corruption(format!(
            "index token mismatch: wanted {token}, file holds {stored}"
        )));
    }
    Ok(IndexMeta {
        table_size: parse_field(&lines, 1, "table size")?,
        num_ofb_buckets: parse_field(&lines, 4, "overflow bucket count")?,
        final_addr: Address::new(parse_field(&lines, 6, "index final address")?),
    })
}

fn read_hlog_meta(dir: &Path, token: Uuid) -> Result<HlogMeta> {
    let lines = meta_lines(&dir.join("hlog.meta"))?;
    let stored: Uuid = parse_field(&lines, 0, "hlog token")?;
    if stored != token {
        return Err(Error::Corruption(format!(
            "hybrid log token mismatch: wanted {token}, file holds {stored}"
        )));
    }
    let use_snapshot: u8 = parse_field(&lines, 1, "snapshot flag")?;
    let num_threads: usize = parse_field(&lines, 6, "session count")?;
    let mut guids = Vec::with_capacity(num_threads);
    for i in 0..num_threads {
        guids.push(parse_field(&lines, 7 + i, "session guid")?);
    }
    Ok(HlogMeta {
        use_snapshot: use_snapshot != 0,
        version: parse_field(&lines, 2, "version")?,
        flushed: Address::new(parse_field(&lines, 3, "flushed address")?),
        start: Address::new(parse_field(&lines, 4, "start address")?),
        final_addr: Address::new(parse_field(&lines, 5, "final address")?),
        guids,
    })
}

fn read_session_file(dir: &Path, guid: Uuid) -> Result<u64> {
    let lines = meta_lines(&dir.join(format!("{guid}.session")))?;
    let stored: Uuid = parse_field(&lines, 1, "session guid")?;
    if stored != guid {
        return Err(Error::Corruption(format!(
            "session file for {guid} names {stored}"
        )));
    }
    parse_field(&lines, 2, "session serial")
}

impl<F: Functions> StoreInner<F> {
    pub(crate) fn recover(&self, index_token: Uuid, hlog_token: Uuid) -> Result<()> {
        {
            let ckpt = self.checkpoint.lock();
            if self.state.load().phase != Phase::Rest || !ckpt.live_sessions.is_empty() {
                return Err(Error::NotAtRest);
            }
        }
        let index_dir = self.settings.checkpoint_dir.join(index_token.to_string());
        let hlog_dir = self.settings.checkpoint_dir.join(hlog_token.to_string());
        let im = read_index_meta(&index_dir, index_token)?;
        let hm = read_hlog_meta(&hlog_dir, hlog_token)?;
        tracing::info!(
            version = hm.version,
            flushed = %hm.flushed,
            final_addr = %hm.final_addr,
            "recovery started"
        );

        let mut ht = BufReader::new(File::open(index_dir.join("ht.dat"))?);
        let mut ofb = BufReader::new(File::open(index_dir.join("ofb.dat"))?);
        self.index
            .load(im.table_size, &mut ht, im.num_ofb_buckets, &mut ofb)?;

        let page_bits = self.hlog.page_bits();
        let begin = hm.start;
        let final_addr = hm.final_addr;
        // Keep as much of the tail resident as the buffer allows, but the
        // whole fuzzy range [flushed, final) must fit: those pages hold
        // the records recovery may need to invalidate.
        let capacity = (self.hlog.num_buffer_pages() - 2) << page_bits;
        let mut head = if final_addr.raw() <= begin.raw() + capacity {
            begin
        } else {
            Address::new(final_addr.raw() - capacity).page_start(page_bits)
        };
        let flushed_page_start = hm.flushed.page_start(page_bits);
        if head > flushed_page_start {
            head = flushed_page_start.max(begin);
        }
        if final_addr.raw() - head.page_start(page_bits).raw() > capacity {
            return Err(Error::Corruption(
                "checkpointed tail range exceeds the in-memory buffer".into(),
            ));
        }

        let snapshot = if hm.use_snapshot {
            Some(File::open(hlog_dir.join("snapshot.dat"))?)
        } else {
            None
        };
        self.load_pages(head, final_addr, &hm, snapshot.as_ref())?;

        let replay_start = im.final_addr.min(hm.flushed).max(begin);
        self.replay(replay_start, final_addr, head, hm.version)?;

        self.hlog.recovery_reset(begin, head, hm.flushed, final_addr);
        self.state
            .reset(SystemState::new(Phase::Rest, hm.version.wrapping_add(1)));

        let mut tokens = HashMap::new();
        for guid in &hm.guids {
            tokens.insert(*guid, read_session_file(&hlog_dir, *guid)?);
        }
        let mut ckpt = self.checkpoint.lock();
        ckpt.continue_tokens = tokens;
        tracing::info!(
            sessions = ckpt.continue_tokens.len(),
            entries = self.index.entry_count(),
            "recovery complete"
        );
        Ok(())
    }

    /// Fill the in-memory frames for `[head, final)` from the log device
    /// and, for the range past the flushed frontier of a snapshot
    /// checkpoint, from the snapshot file.
    fn load_pages(
        &self,
        head: Address,
        final_addr: Address,
        hm: &HlogMeta,
        snapshot: Option<&File>,
    ) -> Result<()> {
        let page_bits = self.hlog.page_bits();
        let segment_bits = self.hlog.segment_bits();
        for page in head.page(page_bits)..=final_addr.page(page_bits) {
            let frame = self.hlog.frame_mut(page);
            frame.fill(0);

            let page_base = page << page_bits;
            let from = page_base.max(head.page_start(page_bits).raw());
            let to = (page_base + (1 << page_bits)).min(final_addr.raw());
            if from >= to {
                continue;
            }

            let (log_to, snap_from) = match snapshot {
                Some(_) => (to.min(hm.flushed.raw()), from.max(hm.flushed.raw())),
                None => (to, to),
            };

            if from < log_to {
                let addr = Address::new(from);
                let buf = read_blocking(
                    self.hlog.device().as_ref(),
                    addr.segment(segment_bits),
                    addr.segment_offset(segment_bits),
                    (log_to - from) as u32,
                )?;
                let offset = (from - page_base) as usize;
                frame[offset..offset + buf.len()].copy_from_slice(buf.as_slice());
            }
            if let Some(file) = snapshot {
                if snap_from < to {
                    let offset = (snap_from - page_base) as usize;
                    let file_offset = snap_from - hm.flushed.raw();
                    file.read_exact_at(&mut frame[offset..offset + (to - snap_from) as usize], file_offset)?;
                }
            }
        }
        Ok(())
    }

    /// Walk `[start, final)` in address order, indexing surviving records
    /// and invalidating interrupted next-version ones.
    fn replay(&self, start: Address, final_addr: Address, head: Address, version: u32) -> Result<()> {
        let page_bits = self.hlog.page_bits();
        let segment_bits = self.hlog.segment_bits();
        let page_size = 1u64 << page_bits;
        let mut replayed = 0u64;
        let mut addr = start;

        // Below the recovered head the records are device-only; page
        // buffers are pulled one at a time.
        let mut disk_page: Option<(u64, crate::device::AlignedBuf)> = None;

        while addr < final_addr {
            let page = addr.page(page_bits);
            let offset = addr.offset(page_bits) as usize;
            if offset + 16 > page_size as usize {
                addr = Address::new((page + 1) << page_bits);
                continue;
            }

            if addr >= head {
                let rec = unsafe { RecordPtr::from_raw(self.hlog.get_physical(addr)) };
                let info = rec.info();
                if info.0 == 0 {
                    addr = Address::new((page + 1) << page_bits);
                    continue;
                }
                if crate::store::version_newer(info.version(), version) {
                    // Belongs to the interrupted v+1: cut it out of every
                    // recovered chain.
                    rec.set_invalid();
                } else if !info.invalid() {
                    self.replay_record(rec.key(), addr);
                    replayed += 1;
                }
                addr = addr.add(rec.total_size());
            } else {
                if disk_page.as_ref().map(|(p, _)| *p) != Some(page) {
                    let base = Address::new(page << page_bits);
                    let buf = read_blocking(
                        self.hlog.device().as_ref(),
                        base.segment(segment_bits),
                        base.segment_offset(segment_bits),
                        page_size as u32,
                    )?;
                    disk_page = Some((page, buf));
                }
                let (_, buf) = disk_page.as_ref().unwrap();
                let bytes = &buf.as_slice()[offset..];
                let Some(record) = DiskRecord::parse(bytes) else {
                    addr = Address::new((page + 1) << page_bits);
                    continue;
                };
                if record.info.0 == 0 {
                    addr = Address::new((page + 1) << page_bits);
                    continue;
                }
                debug_assert!(!crate::store::version_newer(record.info.version(), version));
                if !record.info.invalid() {
                    self.replay_record(&record.key, addr);
                    replayed += 1;
                }
                addr = addr.add(crate::record::record_size(
                    record.key.len(),
                    record.value.len(),
                ));
            }
        }
        tracing::info!(from = %start, to = %final_addr, replayed, "log replay complete");
        Ok(())
    }

    fn replay_record(&self, key: &[u8], addr: Address) {
        let hash = key_hash(key);
        let (slot, entry) = self.index.find_or_create_tag(hash);
        // Single-threaded during recovery; replay runs in address order,
        // so the last insert for a chain is its head.
        let _ = slot.cas(entry, entry_with_address(entry, addr));
    }
}
