//! The global system state: a `{phase, version}` pair packed into one
//! atomic word so sessions always snapshot a consistent pair.
//!
//! The canonical checkpoint cycle is
//!
//! ```text
//! Rest -> [PrepIndexCheckpoint -> IndexCheckpoint] -> Prepare
//!      -> InProgress -> WaitPending -> WaitFlush
//!      -> PersistenceCallback -> Rest
//! ```
//!
//! with the version incremented on the `Prepare -> InProgress` edge. Two
//! orthogonal cycles, `Rest -> Gc -> Rest` and `Rest -> PrepareGrow ->
//! InProgressGrow -> Rest`, never overlap the checkpoint cycle or each
//! other: all of them begin with a CAS out of `Rest`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Phase {
    Rest = 0,
    PrepIndexCheckpoint,
    IndexCheckpoint,
    Prepare,
    InProgress,
    WaitPending,
    WaitFlush,
    PersistenceCallback,
    Gc,
    PrepareGrow,
    InProgressGrow,
}

impl Phase {
    fn from_u32(v: u32) -> Phase {
        match v {
            0 => Phase::Rest,
            1 => Phase::PrepIndexCheckpoint,
            2 => Phase::IndexCheckpoint,
            3 => Phase::Prepare,
            4 => Phase::InProgress,
            5 => Phase::WaitPending,
            6 => Phase::WaitFlush,
            7 => Phase::PersistenceCallback,
            8 => Phase::Gc,
            9 => Phase::PrepareGrow,
            10 => Phase::InProgressGrow,
            _ => unreachable!("corrupt phase discriminant {v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    pub phase: Phase,
    pub version: u32,
}

impl SystemState {
    pub fn new(phase: Phase, version: u32) -> SystemState {
        SystemState { phase, version }
    }

    #[inline]
    fn pack(self) -> u64 {
        ((self.phase as u64) << 32) | self.version as u64
    }

    #[inline]
    fn unpack(word: u64) -> SystemState {
        SystemState {
            phase: Phase::from_u32((word >> 32) as u32),
            version: word as u32,
        }
    }
}

#[derive(Debug)]
pub struct AtomicSystemState(AtomicU64);

impl AtomicSystemState {
    pub fn new(state: SystemState) -> Self {
        Self(AtomicU64::new(state.pack()))
    }

    #[inline]
    pub fn load(&self) -> SystemState {
        SystemState::unpack(self.0.load(Ordering::Acquire))
    }

    /// The only way the global state moves: a CAS from the exact expected
    /// pair. Losing the race means some other session already advanced it.
    pub fn global_move_to_next_state(&self, expected: SystemState, desired: SystemState) -> bool {
        self.0
            .compare_exchange(
                expected.pack(),
                desired.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn reset(&self, state: SystemState) {
        self.0.store(state.pack(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packed_state_round_trips() {
        for phase in [Phase::Rest, Phase::WaitFlush, Phase::InProgressGrow] {
            let s = SystemState::new(phase, 7);
            assert_eq!(SystemState::unpack(s.pack()), s);
        }
    }

    #[test]
    fn cas_requires_exact_pair() {
        let cell = AtomicSystemState::new(SystemState::new(Phase::Rest, 1));
        assert!(!cell.global_move_to_next_state(
            SystemState::new(Phase::Rest, 2),
            SystemState::new(Phase::Prepare, 2),
        ));
        assert!(cell.global_move_to_next_state(
            SystemState::new(Phase::Rest, 1),
            SystemState::new(Phase::Prepare, 1),
        ));
        assert_eq!(cell.load(), SystemState::new(Phase::Prepare, 1));
    }
}
