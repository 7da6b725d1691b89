//! Round-robin policy
//!
//! Each pCPU keeps a FIFO of runnable vCPUs. The running vCPU goes to the
//! back when its quantum ends; the quantum is its domain's slice. With
//! nothing queued the pCPU runs its idle vCPU.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI64, Ordering};

use crate::domain::{CpuMask, Domain, Vcpu};
use crate::scheduler::core::SchedCore;
use crate::scheduler::ops::{SchedulerDef, SchedulerOps};
use crate::scheduler::percpu::SchedLock;
use crate::scheduler::types::{
    millisecs, AdjdomParams, SchedAdjdomCmd, SchedCtlCmd, SchedCtlParams, SchedError,
    SchedInfoDirection, STime, TaskSlice,
};

use super::{apply_affinity, PerCpuRings};

pub const SCHED_RROBIN: u32 = 6;

/// Slice of a domain that never set its own
pub const RR_DEFAULT_SLICE: STime = millisecs(10);

/// Accepted slice range for `adjdom` and `sched_ctl`
pub const RR_MIN_SLICE: STime = millisecs(1);
pub const RR_MAX_SLICE: STime = millisecs(1000);

pub const DEF: SchedulerDef = SchedulerDef {
    opt_name: "rrobin",
    name: "Round-Robin Scheduler",
    sched_id: SCHED_RROBIN,
    create,
};

fn create() -> Box<dyn SchedulerOps> {
    Box::new(RoundRobin::new())
}

/// Per-domain parameters
struct RrDom {
    slice: AtomicI64,
}

pub struct RoundRobin {
    runqs: PerCpuRings,
    default_slice: AtomicI64,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            runqs: PerCpuRings::new(),
            default_slice: AtomicI64::new(RR_DEFAULT_SLICE),
        }
    }

    fn slice_of(&self, v: &Vcpu) -> STime {
        v.domain()
            .and_then(|d| d.sched_priv::<RrDom>().map(|p| p.slice.load(Ordering::Relaxed)))
            .unwrap_or_else(|| self.default_slice.load(Ordering::Relaxed))
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

fn valid_slice(slice: STime) -> bool {
    (RR_MIN_SLICE..=RR_MAX_SLICE).contains(&slice)
}

impl SchedulerOps for RoundRobin {
    fn name(&self) -> &'static str {
        DEF.name
    }

    fn opt_name(&self) -> &'static str {
        DEF.opt_name
    }

    fn sched_id(&self) -> u32 {
        SCHED_RROBIN
    }

    fn init(&self, core: &SchedCore) -> Result<(), SchedError> {
        self.runqs.init(core.nr_cpus());
        Ok(())
    }

    fn init_vcpu(&self, _core: &SchedCore, v: &Arc<Vcpu>) -> Result<(), SchedError> {
        if v.is_idle() {
            return Ok(());
        }
        let d = v.domain().ok_or(SchedError::InvalidArgument)?;
        let default = self.default_slice.load(Ordering::Relaxed);
        d.init_sched_priv(|| RrDom {
            slice: AtomicI64::new(default),
        })
        .map(|_| ())
        .ok_or(SchedError::InvalidArgument)
    }

    fn destroy_domain(&self, core: &SchedCore, d: &Domain) {
        for v in d.vcpus() {
            let _rq = core.vcpu_schedule_lock(v);
            self.runqs.get(v.processor()).lock().remove(v);
        }
    }

    fn sleep(&self, core: &SchedCore, rq: &SchedLock<'_>, v: &Arc<Vcpu>) {
        if v.is_idle() {
            return;
        }
        if rq.is_curr(v) {
            core.raise_softirq(rq.cpu());
        } else {
            self.runqs.get(rq.cpu()).lock().remove(v);
        }
    }

    fn wake(&self, core: &SchedCore, rq: &SchedLock<'_>, v: &Arc<Vcpu>) {
        if v.is_idle() || rq.is_curr(v) {
            return;
        }
        let queued = self.runqs.get(rq.cpu()).lock().push_back(v);
        if queued && rq.curr().is_idle() {
            core.raise_softirq(rq.cpu());
        }
    }

    fn set_affinity(&self, core: &SchedCore, v: &Arc<Vcpu>, mask: &CpuMask)
        -> Result<(), SchedError>
    {
        apply_affinity(core, v, mask)
    }

    fn do_schedule(&self, _core: &SchedCore, rq: &SchedLock<'_>, _now: STime) -> TaskSlice {
        let mut runq = self.runqs.get(rq.cpu()).lock();

        let prev = rq.curr();
        if !prev.is_idle() && prev.is_runnable() {
            runq.push_back(prev);
        }

        match runq.take_first(|v| v.is_runnable()) {
            Some(next) => TaskSlice {
                time: self.slice_of(&next),
                task: next,
            },
            None => TaskSlice {
                task: rq.idle().clone(),
                time: self.default_slice.load(Ordering::Relaxed),
            },
        }
    }

    fn adjdom(&self, _core: &SchedCore, d: &Domain, cmd: &mut SchedAdjdomCmd)
        -> Result<(), SchedError>
    {
        let dom = d.sched_priv::<RrDom>().ok_or(SchedError::InvalidArgument)?;

        match (cmd.direction, cmd.params) {
            (SchedInfoDirection::Put, AdjdomParams::Rrobin { slice }) => {
                if !valid_slice(slice) {
                    return Err(SchedError::InvalidArgument);
                }
                dom.slice.store(slice, Ordering::Relaxed);
                crate::kdebug!("rrobin: dom {} slice {}ns", d.domain_id(), slice);
                Ok(())
            }
            (SchedInfoDirection::Get, AdjdomParams::Rrobin { .. }) => {
                cmd.params = AdjdomParams::Rrobin {
                    slice: dom.slice.load(Ordering::Relaxed),
                };
                Ok(())
            }
            _ => Err(SchedError::InvalidArgument),
        }
    }

    fn control(&self, _core: &SchedCore, cmd: &mut SchedCtlCmd) -> Result<(), SchedError> {
        match (cmd.direction, cmd.params) {
            (SchedInfoDirection::Put, SchedCtlParams::Rrobin { default_slice }) => {
                if !valid_slice(default_slice) {
                    return Err(SchedError::InvalidArgument);
                }
                self.default_slice.store(default_slice, Ordering::Relaxed);
                Ok(())
            }
            (SchedInfoDirection::Get, SchedCtlParams::Rrobin { .. }) => {
                cmd.params = SchedCtlParams::Rrobin {
                    default_slice: self.default_slice.load(Ordering::Relaxed),
                };
                Ok(())
            }
            _ => Err(SchedError::InvalidArgument),
        }
    }

    fn dump_settings(&self, _core: &SchedCore) {
        crate::kinfo!(
            "rrobin: default slice {}us",
            self.default_slice.load(Ordering::Relaxed) / 1000
        );
    }

    fn dump_cpu_state(&self, _core: &SchedCore, rq: &SchedLock<'_>) {
        let runq = self.runqs.get(rq.cpu()).lock();
        crate::kinfo!("  runq: {} queued", runq.len());
        for (pos, v) in runq.iter().enumerate() {
            crate::kinfo!("  {:3}: {} slice={}us", pos, v, self.slice_of(v) / 1000);
        }
    }
}
