//! Per-CPU run queues
//!
//! One [`PerCpuRunQueue`] exists per pCPU for the lifetime of the
//! scheduler. Its lock serializes every scheduling decision for that pCPU
//! and guards the run state of every vCPU currently bound to it.
//!
//! ## Lock Hierarchy
//!
//! To avoid deadlocks, locks must be acquired in this order:
//! 1. Domain table (control plane only, never on the dispatch path)
//! 2. Per-CPU run queue lock (at most one, except during migration where
//!    the lower-numbered CPU is locked first)
//! 3. Policy-private locks
//!
//! Counters and timers are atomics and need no lock to read.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::domain::Vcpu;

use super::runstate::Locked;
use super::timer::{Timer, TimerRole};
use super::types::CpuId;

/// Softirq bit requesting a pass through the dispatcher
pub const SCHEDULE_SOFTIRQ: u32 = 1 << 0;

struct RunQueueState {
    /// vCPU loaded on this pCPU; the idle vCPU when nothing else runs
    curr: Arc<Vcpu>,
}

/// Per-pCPU scheduling container.
/// Cache-line aligned to prevent false sharing between CPUs.
#[repr(C, align(64))]
pub struct PerCpuRunQueue {
    cpu: CpuId,
    lock: Mutex<RunQueueState>,
    idle: Arc<Vcpu>,
    /// Preemption timer, rearmed with every dispatch decision
    pub(crate) s_timer: Timer,
    /// Periodic tick timer
    pub(crate) t_timer: Timer,
    tick: AtomicU64,
    softirq_pending: AtomicU32,
    in_scheduler: AtomicBool,
    pub(crate) counters: PerCpuCounters,
}

impl PerCpuRunQueue {
    pub(crate) fn new(cpu: CpuId, idle: Arc<Vcpu>) -> Self {
        Self {
            cpu,
            lock: Mutex::new(RunQueueState { curr: idle.clone() }),
            idle,
            s_timer: Timer::new(TimerRole::Schedule, cpu),
            t_timer: Timer::new(TimerRole::Tick, cpu),
            tick: AtomicU64::new(0),
            softirq_pending: AtomicU32::new(0),
            in_scheduler: AtomicBool::new(false),
            counters: PerCpuCounters::new(),
        }
    }

    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// This pCPU's dedicated idle vCPU
    #[inline]
    pub fn idle(&self) -> &Arc<Vcpu> {
        &self.idle
    }

    pub fn lock(&self) -> SchedLock<'_> {
        SchedLock {
            rq: self,
            state: self.lock.lock(),
        }
    }

    /// Number of tick timer expiries so far
    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub(crate) fn bump_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn set_softirq(&self, bits: u32) {
        self.softirq_pending.fetch_or(bits, Ordering::SeqCst);
    }

    pub(crate) fn take_softirq(&self) -> u32 {
        self.softirq_pending.swap(0, Ordering::SeqCst)
    }

    pub fn softirq_pending(&self) -> bool {
        self.softirq_pending.load(Ordering::SeqCst) != 0
    }

    /// Mark the dispatcher as entered. Returns false if it already was.
    pub(crate) fn enter_dispatch(&self) -> bool {
        !self.in_scheduler.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn leave_dispatch(&self) {
        self.in_scheduler.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> PerCpuStats {
        PerCpuStats {
            cpu: self.cpu,
            tick: self.tick_count(),
            sched_run: self.counters.sched_run.load(Ordering::Relaxed),
            sched_ctx: self.counters.sched_ctx.load(Ordering::Relaxed),
            sched_irq: self.counters.sched_irq.load(Ordering::Relaxed),
            continue_running: self.counters.continue_running.load(Ordering::Relaxed),
        }
    }
}

/// Held run-queue lock of one pCPU
pub struct SchedLock<'a> {
    rq: &'a PerCpuRunQueue,
    state: MutexGuard<'a, RunQueueState>,
}

impl<'a> SchedLock<'a> {
    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.rq.cpu
    }

    /// vCPU currently loaded on this pCPU
    #[inline]
    pub fn curr(&self) -> &Arc<Vcpu> {
        &self.state.curr
    }

    #[inline]
    pub fn idle(&self) -> &Arc<Vcpu> {
        &self.rq.idle
    }

    #[inline]
    pub fn tick_count(&self) -> u64 {
        self.rq.tick_count()
    }

    /// Whether `v` is the vCPU loaded on this pCPU
    pub fn is_curr(&self, v: &Vcpu) -> bool {
        core::ptr::eq(Arc::as_ptr(&self.state.curr), v)
    }

    pub(crate) fn set_curr(&mut self, next: Arc<Vcpu>) {
        self.state.curr = next;
    }

    /// Proof of holding this lock for run-state accounting.
    pub(crate) fn token(&self) -> Locked<'_> {
        Locked::new()
    }
}

pub(crate) struct PerCpuCounters {
    /// Passes through the dispatcher
    pub sched_run: AtomicU64,
    /// Context switches performed
    pub sched_ctx: AtomicU64,
    /// Preemption timer expiries
    pub sched_irq: AtomicU64,
    /// Dispatches that kept the running vCPU
    pub continue_running: AtomicU64,
}

impl PerCpuCounters {
    const fn new() -> Self {
        Self {
            sched_run: AtomicU64::new(0),
            sched_ctx: AtomicU64::new(0),
            sched_irq: AtomicU64::new(0),
            continue_running: AtomicU64::new(0),
        }
    }
}

/// Snapshot of one pCPU's scheduler counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerCpuStats {
    pub cpu: CpuId,
    pub tick: u64,
    pub sched_run: u64,
    pub sched_ctx: u64,
    pub sched_irq: u64,
    pub continue_running: u64,
}
