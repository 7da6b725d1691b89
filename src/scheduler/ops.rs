//! Scheduling policy interface and the boot-time policy registry
//!
//! A policy decides which vCPU runs next on a pCPU; the framework owns
//! everything else. Exactly one policy is active hypervisor-wide. Unless
//! stated otherwise, hooks run with the run-queue lock of the affected
//! pCPU held and must neither block nor allocate.

use alloc::boxed::Box;
use alloc::sync::Arc;

use crate::domain::{CpuMask, Domain, Vcpu};

use super::core::SchedCore;
use super::percpu::SchedLock;
use super::types::{CpuId, SchedAdjdomCmd, SchedCtlCmd, SchedError, STime, TaskSlice};

pub trait SchedulerOps: Send + Sync {
    /// Display name, e.g. "SMP Credit Scheduler".
    fn name(&self) -> &'static str;

    /// Keyword matched against `sched=` on the command line.
    fn opt_name(&self) -> &'static str;

    /// Stable numeric id checked by control-plane requests.
    fn sched_id(&self) -> u32;

    /// One-time global setup, called once the run queues exist.
    fn init(&self, _core: &SchedCore) -> Result<(), SchedError> {
        Ok(())
    }

    /// Attach policy-private bookkeeping to a newly created vCPU. Called
    /// without any run-queue lock held; may allocate.
    fn init_vcpu(&self, core: &SchedCore, v: &Arc<Vcpu>) -> Result<(), SchedError>;

    /// Release policy-private state of a dying domain. Every vCPU of `d`
    /// is paused and descheduled.
    fn destroy_domain(&self, _core: &SchedCore, _d: &Domain) {}

    /// `v` stopped being runnable.
    fn sleep(&self, core: &SchedCore, rq: &SchedLock<'_>, v: &Arc<Vcpu>);

    /// `v` became runnable.
    fn wake(&self, core: &SchedCore, rq: &SchedLock<'_>, v: &Arc<Vcpu>);

    /// Restrict `v` to `mask`. Called without any run-queue lock held;
    /// `mask` intersects the online pCPUs.
    fn set_affinity(&self, core: &SchedCore, v: &Arc<Vcpu>, mask: &CpuMask)
        -> Result<(), SchedError>;

    /// Pick the vCPU to run next on `rq`'s pCPU. Must return a positive
    /// quantum and a vCPU bound to this pCPU that is either runnable or
    /// the idle vCPU.
    fn do_schedule(&self, core: &SchedCore, rq: &SchedLock<'_>, now: STime) -> TaskSlice;

    /// Read or update per-domain parameters. Every other vCPU of `d` is
    /// paused; if the caller belongs to `d` its run-queue lock is held.
    fn adjdom(&self, core: &SchedCore, d: &Domain, cmd: &mut SchedAdjdomCmd)
        -> Result<(), SchedError>;

    /// Periodic per-pCPU bookkeeping, from the tick timer. No lock held.
    fn tick(&self, _core: &SchedCore, _cpu: CpuId) {}

    /// Read or update policy-wide parameters. No lock held.
    fn control(&self, _core: &SchedCore, _cmd: &mut SchedCtlCmd) -> Result<(), SchedError> {
        Ok(())
    }

    fn dump_settings(&self, _core: &SchedCore) {}

    fn dump_cpu_state(&self, _core: &SchedCore, _rq: &SchedLock<'_>) {}
}

/// Registry entry for a selectable policy
#[derive(Clone, Copy)]
pub struct SchedulerDef {
    pub opt_name: &'static str,
    pub name: &'static str,
    pub sched_id: u32,
    pub create: fn() -> Box<dyn SchedulerOps>,
}

/// Policy used when the configured keyword matches nothing
pub const FALLBACK_SCHED: &str = "rrobin";

/// Built-in policies, in match order
pub static SCHEDULERS: &[SchedulerDef] = &[
    #[cfg(feature = "sched_credit")]
    super::policies::credit::DEF,
    super::policies::rrobin::DEF,
];

/// Resolve `opt_name` against `registry`, failing closed to the fallback
/// policy (or the first entry if the registry lacks it).
pub fn select(registry: &[SchedulerDef], opt_name: &str) -> SchedulerDef {
    if let Some(def) = registry.iter().find(|def| def.opt_name == opt_name) {
        return *def;
    }

    crate::kwarn!("Could not find scheduler: {}", opt_name);

    match registry
        .iter()
        .find(|def| def.opt_name == FALLBACK_SCHED)
        .or_else(|| registry.first())
    {
        Some(def) => *def,
        None => crate::kpanic!("no scheduling policy registered"),
    }
}
