//! Per-vCPU run-state accounting
//!
//! Every vCPU accumulates the time it spends in each [`Runstate`]. The
//! tracker has no lock of its own: writers hold the run-queue lock of the
//! vCPU's current pCPU, which the [`Locked`] token proves. The one lock-free
//! reader is the vCPU inspecting its own state while it is executing,
//! proven by [`OwnRunning`]; the only mutator of a running vCPU's state is
//! the dispatcher on that same pCPU, so the read cannot race a write.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicI64, AtomicU8, Ordering};

use super::types::{Runstate, STime, NR_RUNSTATES};

/// Proof that the run-queue lock guarding a vCPU is held.
pub struct Locked<'a>(PhantomData<&'a ()>);

impl<'a> Locked<'a> {
    pub(crate) fn new() -> Self {
        Locked(PhantomData)
    }
}

/// Proof that the reader is the tracked vCPU and that it is running.
pub struct OwnRunning<'a>(PhantomData<&'a ()>);

impl<'a> OwnRunning<'a> {
    pub(crate) fn new() -> Self {
        OwnRunning(PhantomData)
    }
}

/// Copy of a vCPU's accounting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunstateInfo {
    pub state: Runstate,
    /// System time of the last transition
    pub state_entry_time: STime,
    /// Accumulated time per state, indexed by `Runstate as usize`
    pub time: [STime; NR_RUNSTATES],
}

impl RunstateInfo {
    pub fn time_in(&self, state: Runstate) -> STime {
        self.time[state as usize]
    }

    /// Sum over all states.
    pub fn total(&self) -> STime {
        self.time.iter().sum()
    }
}

pub struct RunstateTracker {
    state: AtomicU8,
    state_entry_time: AtomicI64,
    time: [AtomicI64; NR_RUNSTATES],
}

impl RunstateTracker {
    pub(crate) const fn new(initial: Runstate, now: STime) -> Self {
        Self {
            state: AtomicU8::new(initial as u8),
            state_entry_time: AtomicI64::new(now),
            time: [
                AtomicI64::new(0),
                AtomicI64::new(0),
                AtomicI64::new(0),
                AtomicI64::new(0),
            ],
        }
    }

    /// Current state. Unsynchronized; only stable under the run-queue lock.
    pub fn state(&self) -> Runstate {
        Runstate::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `new_state` at `now`, charging the time since the last
    /// transition to the state being left.
    pub(crate) fn change(&self, _lock: &Locked<'_>, new_state: Runstate, now: STime) {
        let old = self.state();
        if old == new_state {
            crate::kpanic!("runstate change to current state {}", old.as_str());
        }

        let entry = self.state_entry_time.load(Ordering::Relaxed);
        self.time[old as usize].fetch_add(now - entry, Ordering::Relaxed);
        self.state_entry_time.store(now, Ordering::Relaxed);
        self.state.store(new_state as u8, Ordering::Release);
    }

    /// Accounting with the in-flight interval folded in as of `now`.
    pub(crate) fn read(&self, _lock: &Locked<'_>, now: STime) -> RunstateInfo {
        let mut info = self.raw();
        info.time[info.state as usize] += now - info.state_entry_time;
        info
    }

    /// Lock-free read by the running vCPU itself.
    pub(crate) fn read_own(&self, _own: &OwnRunning<'_>, now: STime) -> RunstateInfo {
        let mut info = self.raw();
        debug_assert_eq!(info.state, Runstate::Running);
        info.time[Runstate::Running as usize] += now - info.state_entry_time;
        info
    }

    /// Stored accounting without folding in the in-flight interval.
    pub(crate) fn raw(&self) -> RunstateInfo {
        let mut time = [0; NR_RUNSTATES];
        for (slot, acc) in time.iter_mut().zip(self.time.iter()) {
            *slot = acc.load(Ordering::Relaxed);
        }
        RunstateInfo {
            state: self.state(),
            state_entry_time: self.state_entry_time.load(Ordering::Relaxed),
            time,
        }
    }
}
