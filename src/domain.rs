//! Domains and their virtual CPUs
//!
//! A [`Domain`] owns a fixed array of [`Vcpu`]s allocated when it is
//! created. Run queues and policies hold `Arc` references to vCPUs but never
//! own them. Scheduling fields inside a vCPU are atomics: they are *written*
//! only under the run-queue lock of the vCPU's current pCPU, and the flag
//! bits use atomic read-modify-write so wake-up races resolve without that
//! lock.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Once;

use crate::scheduler::runstate::RunstateTracker;
use crate::scheduler::timer::{Timer, TimerRole};
use crate::scheduler::types::{
    CpuId, DomId, Runstate, STime, VcpuId, IDLE_DOMAIN_ID, MAX_CPUS, MAX_EVTCHNS,
};

bitflags! {
    /// Per-vCPU condition bits. Independent of the run state: they capture
    /// the wake-up and poll races a run-state snapshot cannot.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct VcpuFlags: u32 {
        /// Loaded on a pCPU (set at dispatch, cleared once its state is saved)
        const RUNNING = 1 << 0;
        /// Waiting for an event
        const BLOCKED = 1 << 1;
        /// Blocked inside a poll request
        const POLLING = 1 << 2;
        /// Taken offline by the guest
        const DOWN = 1 << 3;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct DomainFlags: u32 {
        /// At least one vCPU may be waiting in a poll request
        const POLLING = 1 << 0;
        /// Shut down; the finalizer owns the rest of the teardown
        const SHUTDOWN = 1 << 1;
        /// Paused by the control plane
        const CTRL_PAUSE = 1 << 2;
        /// Being destroyed
        const DYING = 1 << 3;
    }
}

/// Set of physical CPUs (bit per CPU)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn none() -> Self {
        CpuMask(0)
    }

    pub const fn all() -> Self {
        CpuMask(u64::MAX)
    }

    /// The first `nr_cpus` CPUs
    pub const fn first_n(nr_cpus: usize) -> Self {
        if nr_cpus >= MAX_CPUS {
            CpuMask(u64::MAX)
        } else {
            CpuMask((1u64 << nr_cpus) - 1)
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        CpuMask(bits)
    }

    pub const fn of(cpu: CpuId) -> Self {
        CpuMask(1u64 << cpu)
    }

    #[inline]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_set(&self, cpu: CpuId) -> bool {
        cpu < MAX_CPUS && (self.0 & (1u64 << cpu)) != 0
    }

    pub fn set(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.0 |= 1u64 << cpu;
        }
    }

    pub fn clear(&mut self, cpu: CpuId) {
        if cpu < MAX_CPUS {
            self.0 &= !(1u64 << cpu);
        }
    }

    pub const fn and(&self, other: &CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest CPU in the set
    pub fn first(&self) -> Option<CpuId> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as CpuId)
        }
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}

/// Policy-private bookkeeping attached to a vCPU or domain
type SchedPriv = Box<dyn Any + Send + Sync>;

/// One schedulable unit of a domain
pub struct Vcpu {
    vcpu_id: VcpuId,
    domain_id: DomId,
    domain: Weak<Domain>,
    is_idle: bool,
    processor: AtomicUsize,
    affinity: AtomicU64,
    flags: AtomicU32,
    pause_count: AtomicU32,
    pub(crate) runstate: RunstateTracker,
    /// Tick count of the pCPU when this vCPU was last descheduled
    sleep_tick: AtomicU64,
    /// Guest one-shot deadline timer
    pub(crate) timer: Timer,
    /// Poll timeout timer
    pub(crate) poll_timer: Timer,
    pub(crate) upcall_pending: AtomicBool,
    pub(crate) upcall_mask: AtomicBool,
    created_at: STime,
    sched_priv: Once<SchedPriv>,
}

impl Vcpu {
    fn new(
        vcpu_id: VcpuId,
        domain_id: DomId,
        domain: Weak<Domain>,
        processor: CpuId,
        now: STime,
    ) -> Self {
        let is_idle = domain_id == IDLE_DOMAIN_ID;
        let initial = if is_idle {
            Runstate::Running
        } else {
            Runstate::Offline
        };

        Self {
            vcpu_id,
            domain_id,
            domain,
            is_idle,
            processor: AtomicUsize::new(processor),
            affinity: AtomicU64::new(CpuMask::all().bits()),
            flags: AtomicU32::new(0),
            pause_count: AtomicU32::new(0),
            runstate: RunstateTracker::new(initial, now),
            sleep_tick: AtomicU64::new(0),
            timer: Timer::new(TimerRole::Vcpu, processor),
            poll_timer: Timer::new(TimerRole::Poll, processor),
            upcall_pending: AtomicBool::new(false),
            upcall_mask: AtomicBool::new(true),
            created_at: now,
            sched_priv: Once::new(),
        }
    }

    #[inline]
    pub fn vcpu_id(&self) -> VcpuId {
        self.vcpu_id
    }

    #[inline]
    pub fn domain_id(&self) -> DomId {
        self.domain_id
    }

    pub fn domain(&self) -> Option<Arc<Domain>> {
        self.domain.upgrade()
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    /// pCPU this vCPU is bound to
    #[inline]
    pub fn processor(&self) -> CpuId {
        self.processor.load(Ordering::Acquire)
    }

    pub(crate) fn set_processor(&self, cpu: CpuId) {
        self.processor.store(cpu, Ordering::Release);
    }

    pub fn cpu_affinity(&self) -> CpuMask {
        CpuMask::from_bits(self.affinity.load(Ordering::Relaxed))
    }

    pub fn set_cpu_affinity(&self, mask: CpuMask) {
        self.affinity.store(mask.bits(), Ordering::Relaxed);
    }

    /// System time at which the vCPU was created
    #[inline]
    pub fn created_at(&self) -> STime {
        self.created_at
    }

    /// Current run state. Only stable under the owning run-queue lock.
    pub fn runstate(&self) -> Runstate {
        self.runstate.state()
    }

    pub fn flags(&self) -> VcpuFlags {
        VcpuFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn test_flag(&self, flag: VcpuFlags) -> bool {
        self.flags().intersects(flag)
    }

    pub fn set_flag(&self, flag: VcpuFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: VcpuFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    /// Clear `flag`, returning whether it was set.
    pub fn test_and_clear_flag(&self, flag: VcpuFlags) -> bool {
        let old = self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
        VcpuFlags::from_bits_truncate(old).intersects(flag)
    }

    pub fn pause_count(&self) -> u32 {
        self.pause_count.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_pause(&self) {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true when the count dropped to zero.
    pub(crate) fn dec_pause(&self) -> bool {
        let prev = self.pause_count.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            crate::kpanic!("{} unpaused more often than paused", self);
        }
        prev == 1
    }

    /// Runnability predicate: not blocked or down, not paused, and the
    /// owning domain is neither paused nor shut down.
    pub fn is_runnable(&self) -> bool {
        if self.test_flag(VcpuFlags::BLOCKED | VcpuFlags::DOWN) {
            return false;
        }
        if self.pause_count() != 0 {
            return false;
        }
        match self.domain() {
            Some(d) => {
                d.pause_count() == 0
                    && !d.test_flag(
                        DomainFlags::SHUTDOWN | DomainFlags::CTRL_PAUSE | DomainFlags::DYING,
                    )
            }
            None => false,
        }
    }

    pub fn sleep_tick(&self) -> u64 {
        self.sleep_tick.load(Ordering::Relaxed)
    }

    pub(crate) fn set_sleep_tick(&self, tick: u64) {
        self.sleep_tick.store(tick, Ordering::Relaxed);
    }

    /// The guest one-shot timer
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// The poll timeout timer
    pub fn poll_timer(&self) -> &Timer {
        &self.poll_timer
    }

    /// Policy-private data, if the active policy attached data of type `T`.
    pub fn sched_priv<T: Any>(&self) -> Option<&T> {
        self.sched_priv.get()?.downcast_ref::<T>()
    }

    /// Attach policy-private data. Runs `init` at most once per vCPU;
    /// returns `None` if data of another type is already attached.
    pub fn init_sched_priv<T, F>(&self, init: F) -> Option<&T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.sched_priv
            .call_once(|| Box::new(init()) as SchedPriv)
            .downcast_ref::<T>()
    }
}

impl fmt::Display for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_idle {
            write!(f, "idle{}", self.vcpu_id)
        } else {
            write!(f, "d{}v{}", self.domain_id, self.vcpu_id)
        }
    }
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("domain", &self.domain_id)
            .field("vcpu", &self.vcpu_id)
            .field("processor", &self.processor())
            .field("runstate", &self.runstate())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Words in the per-domain event pending bitmap
pub(crate) const EVTCHN_WORDS: usize = (MAX_EVTCHNS as usize) / 64;

/// An isolated guest: a fixed set of vCPUs plus domain-wide state
pub struct Domain {
    domain_id: DomId,
    privileged: bool,
    vcpus: Box<[Arc<Vcpu>]>,
    flags: AtomicU32,
    pause_count: AtomicU32,
    shutdown_code: AtomicU8,
    pub(crate) evtchn_pending: [AtomicU64; EVTCHN_WORDS],
    sched_priv: Once<SchedPriv>,
}

impl Domain {
    /// Allocate a domain and its vCPUs. `placement` maps a vCPU id to its
    /// initial pCPU. Guest domains start controller-paused.
    pub(crate) fn new<F>(
        domain_id: DomId,
        nr_vcpus: usize,
        privileged: bool,
        now: STime,
        placement: F,
    ) -> Arc<Domain>
    where
        F: Fn(VcpuId) -> CpuId,
    {
        let is_idle = domain_id == IDLE_DOMAIN_ID;
        let initial_flags = if is_idle {
            DomainFlags::empty()
        } else {
            DomainFlags::CTRL_PAUSE
        };

        Arc::new_cyclic(|weak: &Weak<Domain>| Domain {
            domain_id,
            privileged,
            vcpus: (0..nr_vcpus)
                .map(|id| Arc::new(Vcpu::new(id, domain_id, weak.clone(), placement(id), now)))
                .collect(),
            flags: AtomicU32::new(initial_flags.bits()),
            pause_count: AtomicU32::new(0),
            shutdown_code: AtomicU8::new(0),
            evtchn_pending: core::array::from_fn(|_| AtomicU64::new(0)),
            sched_priv: Once::new(),
        })
    }

    #[inline]
    pub fn domain_id(&self) -> DomId {
        self.domain_id
    }

    #[inline]
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.domain_id == IDLE_DOMAIN_ID
    }

    pub fn vcpus(&self) -> &[Arc<Vcpu>] {
        &self.vcpus
    }

    pub fn vcpu(&self, id: VcpuId) -> Option<&Arc<Vcpu>> {
        self.vcpus.get(id)
    }

    pub fn flags(&self) -> DomainFlags {
        DomainFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn test_flag(&self, flag: DomainFlags) -> bool {
        self.flags().intersects(flag)
    }

    pub fn set_flag(&self, flag: DomainFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub fn clear_flag(&self, flag: DomainFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
    }

    /// Clear `flag`, returning whether it was set.
    pub fn test_and_clear_flag(&self, flag: DomainFlags) -> bool {
        let old = self.flags.fetch_and(!flag.bits(), Ordering::SeqCst);
        DomainFlags::from_bits_truncate(old).intersects(flag)
    }

    /// Set `flag`, returning whether it was already set.
    pub fn test_and_set_flag(&self, flag: DomainFlags) -> bool {
        let old = self.flags.fetch_or(flag.bits(), Ordering::SeqCst);
        DomainFlags::from_bits_truncate(old).intersects(flag)
    }

    pub fn pause_count(&self) -> u32 {
        self.pause_count.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_pause(&self) {
        self.pause_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns true when the count dropped to zero.
    pub(crate) fn dec_pause(&self) -> bool {
        let prev = self.pause_count.fetch_sub(1, Ordering::SeqCst);
        if prev == 0 {
            crate::kpanic!("domain {} unpaused more often than paused", self.domain_id);
        }
        prev == 1
    }

    pub fn is_shutdown(&self) -> bool {
        self.test_flag(DomainFlags::SHUTDOWN)
    }

    /// Reason recorded by the last shutdown request
    pub fn shutdown_code(&self) -> u8 {
        self.shutdown_code.load(Ordering::Acquire)
    }

    pub(crate) fn set_shutdown_code(&self, reason: u8) {
        self.shutdown_code.store(reason, Ordering::Release);
    }

    /// Policy-private data, if the active policy attached data of type `T`.
    pub fn sched_priv<T: Any>(&self) -> Option<&T> {
        self.sched_priv.get()?.downcast_ref::<T>()
    }

    /// Attach policy-private data. Runs `init` at most once per domain;
    /// returns `None` if data of another type is already attached.
    pub fn init_sched_priv<T, F>(&self, init: F) -> Option<&T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.sched_priv
            .call_once(|| Box::new(init()) as SchedPriv)
            .downcast_ref::<T>()
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.domain_id)
            .field("vcpus", &self.vcpus.len())
            .field("flags", &self.flags())
            .field("pause_count", &self.pause_count())
            .finish()
    }
}
