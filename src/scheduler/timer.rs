//! Countdown timers used by the scheduler
//!
//! A timer is an absolute deadline bound to one pCPU. Arming, cancelling
//! and expiry all go through one atomic word, so a cancel racing an expiry
//! on another pCPU either wins (the callback never runs) or loses (the
//! callback runs exactly once); there is no duplicate delivery.
//!
//! The scheduler owns four timer roles:
//! - `Schedule`: per pCPU, rearmed on every dispatch to end the quantum
//! - `Tick`: per pCPU, fixed period, drives the virtual timer tick
//! - `Vcpu`: per vCPU one-shot deadline requested by the guest
//! - `Poll`: per vCPU timeout of a poll request

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use super::types::{CpuId, STime};

const INACTIVE: STime = STime::MIN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerRole {
    Schedule,
    Tick,
    Vcpu,
    Poll,
}

pub struct Timer {
    role: TimerRole,
    expires: AtomicI64,
    cpu: AtomicUsize,
    killed: AtomicBool,
}

impl Timer {
    pub const fn new(role: TimerRole, cpu: CpuId) -> Self {
        Self {
            role,
            expires: AtomicI64::new(INACTIVE),
            cpu: AtomicUsize::new(cpu),
            killed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn role(&self) -> TimerRole {
        self.role
    }

    /// pCPU whose timer interrupt services this timer
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Relaxed)
    }

    /// (Re)arm for the absolute time `expires`. Returns false if the timer
    /// has been killed.
    pub fn set(&self, expires: STime) -> bool {
        if self.killed.load(Ordering::Acquire) {
            return false;
        }
        // Deadlines at or before the epoch still fire on the next interrupt.
        let expires = if expires == INACTIVE { INACTIVE + 1 } else { expires };
        self.expires.store(expires, Ordering::SeqCst);
        true
    }

    /// Disarm. Returns whether the timer was pending. Idempotent.
    pub fn stop(&self) -> bool {
        self.expires.swap(INACTIVE, Ordering::SeqCst) != INACTIVE
    }

    /// Disarm for good; later `set` calls are ignored.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.stop();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.expires.load(Ordering::SeqCst) != INACTIVE
    }

    /// Armed deadline, if any
    pub fn expires(&self) -> Option<STime> {
        match self.expires.load(Ordering::SeqCst) {
            INACTIVE => None,
            t => Some(t),
        }
    }

    /// Rebind to another pCPU's timer interrupt.
    pub fn migrate(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    /// Claim an expired timer. Exactly one caller observes `true` per
    /// arming; a concurrent `stop` makes every caller observe `false`.
    pub(crate) fn try_expire(&self, now: STime) -> bool {
        let expires = self.expires.load(Ordering::SeqCst);
        if expires == INACTIVE || expires > now {
            return false;
        }
        self.expires
            .compare_exchange(expires, INACTIVE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
