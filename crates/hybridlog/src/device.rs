//! The storage device capability.
//!
//! The log addresses the device as `segment = addr >> segment_bits`,
//! `offset = addr & segment_mask`. Writes and reads are asynchronous:
//! completions are boxed closures invoked from the device's worker
//! thread, which is also where the engine's response channels are fed.

use crate::Result;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::ptr::NonNull;

pub type ReadCompletion = Box<dyn FnOnce(io::Result<AlignedBuf>) + Send>;
pub type WriteCompletion = Box<dyn FnOnce(io::Result<()>) + Send>;

/// A sector-aligned owned byte buffer for device I/O.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes at `align` (a power of two).
    pub fn zeroed(len: usize, align: usize) -> AlignedBuf {
        assert!(align.is_power_of_two() && len > 0);
        let layout = Layout::from_size_align(len, align).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        AlignedBuf { ptr, len, align }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, self.align).unwrap();
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AlignedBuf({} bytes @ {})", self.len, self.align)
    }
}

/// Block-device capability consumed by the hybrid log.
pub trait Device: Send + Sync + 'static {
    fn sector_size(&self) -> u32;

    fn segment_size(&self) -> u64;

    /// Write `buf` at `(segment, offset)`; `done` runs on completion.
    fn write(&self, buf: AlignedBuf, segment: u64, offset: u64, done: WriteCompletion);

    /// Read `len` bytes at `(segment, offset)`; short reads past the
    /// written extent come back zero-filled.
    fn read(&self, segment: u64, offset: u64, len: u32, done: ReadCompletion);

    /// Drop segments in `[from, to)`; storage below the begin address.
    fn delete_segment_range(&self, from: u64, to: u64);

    /// Flush and stop the device worker. Idempotent.
    fn close(&self);
}

enum IoRequest {
    Write {
        buf: AlignedBuf,
        segment: u64,
        offset: u64,
        done: WriteCompletion,
    },
    Read {
        segment: u64,
        offset: u64,
        len: u32,
        done: ReadCompletion,
    },
    DeleteRange {
        from: u64,
        to: u64,
    },
    Close,
}

/// A directory of `log.<segment>` files served by one worker thread.
pub struct FileDevice {
    tx: Sender<IoRequest>,
    sector_size: u32,
    segment_size: u64,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl FileDevice {
    pub fn new(dir: impl Into<PathBuf>, segment_size_bits: u32) -> Result<FileDevice> {
        let segment_size = 1u64 << segment_size_bits;
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let worker_dir = dir.clone();
        let worker = std::thread::Builder::new()
            .name("hlog-device".into())
            .spawn(move || worker_loop(worker_dir, rx))?;

        Ok(FileDevice {
            tx,
            sector_size: 512,
            segment_size,
            worker: Mutex::new(Some(worker)),
        })
    }
}

fn open_segment<'m>(
    segments: &'m mut HashMap<u64, File>,
    dir: &std::path::Path,
    segment: u64,
) -> io::Result<&'m File> {
    if !segments.contains_key(&segment) {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(format!("log.{segment}")))?;
        segments.insert(segment, file);
    }
    Ok(&segments[&segment])
}

fn worker_loop(dir: PathBuf, rx: Receiver<IoRequest>) {
    let mut segments: HashMap<u64, File> = HashMap::new();

    for req in rx.iter() {
        match req {
            IoRequest::Write {
                buf,
                segment,
                offset,
                done,
            } => {
                let result = open_segment(&mut segments, &dir, segment)
                    .and_then(|f| f.write_all_at(buf.as_slice(), offset));
                if let Err(err) = &result {
                    tracing::error!(segment, offset, %err, "segment write failed");
                }
                done(result);
            }
            IoRequest::Read {
                segment,
                offset,
                len,
                done,
            } => {
                let mut buf = AlignedBuf::zeroed(len as usize, 512);
                let result = open_segment(&mut segments, &dir, segment).and_then(|f| {
                    // Reads past the written extent are legal and come
                    // back zero-filled, so a short read is not an error.
                    let mut filled = 0;
                    while filled < buf.len() {
                        let n = f.read_at(&mut buf.as_mut_slice()[filled..], offset + filled as u64)?;
                        if n == 0 {
                            break;
                        }
                        filled += n;
                    }
                    Ok(())
                });
                match result {
                    Ok(()) => done(Ok(buf)),
                    Err(err) => {
                        tracing::error!(segment, offset, len, %err, "segment read failed");
                        done(Err(err));
                    }
                }
            }
            IoRequest::DeleteRange { from, to } => {
                for segment in from..to {
                    segments.remove(&segment);
                    match std::fs::remove_file(dir.join(format!("log.{segment}"))) {
                        Ok(()) => tracing::debug!(segment, "deleted log segment"),
                        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                        Err(err) => tracing::warn!(segment, %err, "failed to delete log segment"),
                    }
                }
            }
            IoRequest::Close => break,
        }
    }
}

impl Device for FileDevice {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn segment_size(&self) -> u64 {
        self.segment_size
    }

    fn write(&self, buf: AlignedBuf, segment: u64, offset: u64, done: WriteCompletion) {
        if self
            .tx
            .send(IoRequest::Write {
                buf,
                segment,
                offset,
                done,
            })
            .is_err()
        {
            tracing::error!(segment, "write issued after device close");
        }
    }

    fn read(&self, segment: u64, offset: u64, len: u32, done: ReadCompletion) {
        if let Err(err) = self.tx.send(IoRequest::Read {
            segment,
            offset,
            len,
            done,
        }) {
            if let IoRequest::Read { done, .. } = err.0 {
                done(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "device closed",
                )));
            }
        }
    }

    fn delete_segment_range(&self, from: u64, to: u64) {
        let _ = self.tx.send(IoRequest::DeleteRange { from, to });
    }

    fn close(&self) {
        let _ = self.tx.send(IoRequest::Close);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// A device for memory-only stores: writes succeed and vanish, reads
/// fail. Only correct while nothing is ever evicted below the head
/// watermark.
#[derive(Debug, Default)]
pub struct NullDevice;

impl Device for NullDevice {
    fn sector_size(&self) -> u32 {
        512
    }

    fn segment_size(&self) -> u64 {
        1 << 30
    }

    fn write(&self, _buf: AlignedBuf, _segment: u64, _offset: u64, done: WriteCompletion) {
        done(Ok(()));
    }

    fn read(&self, segment: u64, offset: u64, _len: u32, done: ReadCompletion) {
        tracing::error!(segment, offset, "read from null device");
        done(Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "null device holds no data",
        )));
    }

    fn delete_segment_range(&self, _from: u64, _to: u64) {}

    fn close(&self) {}
}

/// Read one whole page synchronously; recovery-path helper.
pub(crate) fn read_blocking(
    device: &dyn Device,
    segment: u64,
    offset: u64,
    len: u32,
) -> io::Result<AlignedBuf> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    device.read(
        segment,
        offset,
        len,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv()
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "device worker gone"))?
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::new(dir.path(), 20).unwrap();

        let mut buf = AlignedBuf::zeroed(1024, 512);
        buf.as_mut_slice()[..5].copy_from_slice(b"hello");
        let (tx, rx) = crossbeam_channel::bounded(1);
        device.write(
            buf,
            0,
            4096,
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        rx.recv().unwrap().unwrap();

        let read = read_blocking(&device, 0, 4096, 1024).unwrap();
        assert_eq!(&read.as_slice()[..5], b"hello");
        // Beyond the written extent reads as zeros.
        let read = read_blocking(&device, 0, 1 << 19, 512).unwrap();
        assert!(read.as_slice().iter().all(|&b| b == 0));

        device.close();
    }
}
