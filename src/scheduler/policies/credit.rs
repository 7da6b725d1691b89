//! Credit policy
//!
//! Proportional share by domain weight. Every accounting period the
//! credits worth one period of every pCPU are divided among the active
//! domains by weight, optionally limited by a cap (percent of one pCPU),
//! and split evenly across each domain's active vCPUs. The running vCPU
//! pays for every tick it is caught running.
//!
//! Queued vCPUs with positive credit (UNDER) run before those without
//! (OVER). A capped vCPU that has run out of credit is parked and not
//! picked at all until a later period refills it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU16, AtomicU64, Ordering};

use spin::Mutex;

use crate::domain::{CpuMask, Domain, Vcpu, VcpuFlags};
use crate::scheduler::core::SchedCore;
use crate::scheduler::ops::{SchedulerDef, SchedulerOps};
use crate::scheduler::percpu::SchedLock;
use crate::scheduler::types::{
    millisecs, AdjdomParams, CpuId, SchedAdjdomCmd, SchedCtlCmd, SchedCtlParams, SchedError,
    SchedInfoDirection, STime, TaskSlice, MAX_DOMAINS,
};

use super::{apply_affinity, PerCpuRings};

pub const SCHED_CREDIT: u32 = 5;

pub const CSCHED_DEFAULT_WEIGHT: u16 = 256;
pub const CSCHED_DEFAULT_TSLICE: STime = millisecs(30);
pub const CSCHED_TICKS_PER_ACCT: u64 = 3;
pub const CSCHED_CREDITS_PER_TICK: i32 = 100;
pub const CSCHED_CREDITS_PER_ACCT: i32 = CSCHED_CREDITS_PER_TICK * CSCHED_TICKS_PER_ACCT as i32;

/// `adjdom` value leaving the cap unchanged
pub const CSCHED_CAP_UNCHANGED: u16 = u16::MAX;

pub const DEF: SchedulerDef = SchedulerDef {
    opt_name: "credit",
    name: "SMP Credit Scheduler",
    sched_id: SCHED_CREDIT,
    create,
};

fn create() -> Box<dyn SchedulerOps> {
    Box::new(Credit::new())
}

struct CreditVcpu {
    credit: AtomicI32,
    parked: AtomicBool,
}

struct CreditDom {
    weight: AtomicU16,
    /// Percent of one pCPU; 0 is uncapped
    cap: AtomicU16,
}

pub struct Credit {
    runqs: PerCpuRings,
    domains: Mutex<Vec<Arc<Domain>>>,
    tslice: AtomicI64,
    acct_runs: AtomicU64,
}

fn vcpu_priv(v: &Vcpu) -> Option<&CreditVcpu> {
    v.sched_priv::<CreditVcpu>()
}

fn credit_of(v: &Vcpu) -> i32 {
    vcpu_priv(v).map_or(0, |cv| cv.credit.load(Ordering::Relaxed))
}

fn is_parked(v: &Vcpu) -> bool {
    vcpu_priv(v).is_some_and(|cv| cv.parked.load(Ordering::Relaxed))
}

/// A vCPU that competes for time this period
fn is_active(v: &Vcpu) -> bool {
    v.is_runnable() || v.test_flag(VcpuFlags::RUNNING)
}

impl Credit {
    pub fn new() -> Self {
        Self {
            runqs: PerCpuRings::new(),
            domains: Mutex::new(Vec::new()),
            tslice: AtomicI64::new(CSCHED_DEFAULT_TSLICE),
            acct_runs: AtomicU64::new(0),
        }
    }

    /// Number of completed accounting periods
    pub fn acct_runs(&self) -> u64 {
        self.acct_runs.load(Ordering::Relaxed)
    }

    /// Distribute one period's credits over the active domains.
    fn acct(&self, core: &SchedCore) {
        let domains = self.domains.lock();
        self.acct_runs.fetch_add(1, Ordering::Relaxed);

        let weight_of = |d: &Domain| {
            d.sched_priv::<CreditDom>()
                .map_or(0, |sd| sd.weight.load(Ordering::Relaxed) as i64)
        };

        let total_weight: i64 = domains
            .iter()
            .filter(|d| d.vcpus().iter().any(|v| is_active(v)))
            .map(|d| weight_of(d))
            .sum();
        if total_weight == 0 {
            return;
        }

        let credit_total = CSCHED_CREDITS_PER_ACCT as i64 * core.nr_cpus() as i64;

        for d in domains.iter() {
            let nr_active = d.vcpus().iter().filter(|v| is_active(v)).count() as i64;
            if nr_active == 0 {
                continue;
            }
            let cap = d
                .sched_priv::<CreditDom>()
                .map_or(0, |sd| sd.cap.load(Ordering::Relaxed) as i64);

            let mut fair = credit_total * weight_of(d) / total_weight;
            if cap != 0 {
                fair = fair.min(CSCHED_CREDITS_PER_ACCT as i64 * cap / 100);
            }
            let share = ((fair + nr_active - 1) / nr_active) as i32;

            for v in d.vcpus().iter().filter(|v| is_active(v)) {
                let Some(cv) = vcpu_priv(v) else { continue };

                let credit = (cv.credit.load(Ordering::Relaxed) + share)
                    .min(CSCHED_CREDITS_PER_ACCT);
                cv.credit.store(credit, Ordering::Relaxed);

                if cap != 0 && credit < 0 {
                    if !cv.parked.swap(true, Ordering::Relaxed) {
                        crate::ktrace!("credit: park {} ({})", v, credit);
                        core.raise_softirq(v.processor());
                    }
                } else if cv.parked.swap(false, Ordering::Relaxed) {
                    crate::ktrace!("credit: unpark {} ({})", v, credit);
                    core.raise_softirq(v.processor());
                }
            }
        }
    }
}

impl Default for Credit {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerOps for Credit {
    fn name(&self) -> &'static str {
        DEF.name
    }

    fn opt_name(&self) -> &'static str {
        DEF.opt_name
    }

    fn sched_id(&self) -> u32 {
        SCHED_CREDIT
    }

    fn init(&self, core: &SchedCore) -> Result<(), SchedError> {
        self.runqs.init(core.nr_cpus());
        self.domains.lock().reserve(MAX_DOMAINS);
        Ok(())
    }

    fn init_vcpu(&self, _core: &SchedCore, v: &Arc<Vcpu>) -> Result<(), SchedError> {
        if v.is_idle() {
            return Ok(());
        }
        let d = v.domain().ok_or(SchedError::InvalidArgument)?;

        if d.sched_priv::<CreditDom>().is_none() {
            d.init_sched_priv(|| CreditDom {
                weight: AtomicU16::new(CSCHED_DEFAULT_WEIGHT),
                cap: AtomicU16::new(0),
            })
            .ok_or(SchedError::InvalidArgument)?;
            self.domains.lock().push(d.clone());
        }

        v.init_sched_priv(|| CreditVcpu {
            credit: AtomicI32::new(0),
            parked: AtomicBool::new(false),
        })
        .map(|_| ())
        .ok_or(SchedError::InvalidArgument)
    }

    fn destroy_domain(&self, core: &SchedCore, d: &Domain) {
        for v in d.vcpus() {
            let _rq = core.vcpu_schedule_lock(v);
            self.runqs.get(v.processor()).lock().remove(v);
        }
        self.domains
            .lock()
            .retain(|other| other.domain_id() != d.domain_id());
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
        if !self.runqs.get(rq.cpu()).lock().push_back(v) {
            return;
        }

        let curr = rq.curr();
        let preempt = curr.is_idle() || (credit_of(v) > 0 && credit_of(curr) <= 0);
        if preempt && !is_parked(v) {
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

        let eligible = |v: &Arc<Vcpu>| v.is_runnable() && !is_parked(v);
        let next = runq
            .take_first(|v| eligible(v) && credit_of(v) > 0)
            .or_else(|| runq.take_first(eligible))
            .unwrap_or_else(|| rq.idle().clone());

        TaskSlice {
            task: next,
            time: self.tslice.load(Ordering::Relaxed),
        }
    }

    fn adjdom(&self, _core: &SchedCore, d: &Domain, cmd: &mut SchedAdjdomCmd)
        -> Result<(), SchedError>
    {
        let sd = d.sched_priv::<CreditDom>().ok_or(SchedError::InvalidArgument)?;

        match (cmd.direction, cmd.params) {
            (SchedInfoDirection::Put, AdjdomParams::Credit { weight, cap }) => {
                if weight != 0 {
                    sd.weight.store(weight, Ordering::Relaxed);
                }
                if cap != CSCHED_CAP_UNCHANGED {
                    sd.cap.store(cap, Ordering::Relaxed);
                }
                crate::kdebug!(
                    "credit: dom {} weight={} cap={}",
                    d.domain_id(),
                    sd.weight.load(Ordering::Relaxed),
                    sd.cap.load(Ordering::Relaxed)
                );
                Ok(())
            }
            (SchedInfoDirection::Get, AdjdomParams::Credit { .. }) => {
                cmd.params = AdjdomParams::Credit {
                    weight: sd.weight.load(Ordering::Relaxed),
                    cap: sd.cap.load(Ordering::Relaxed),
                };
                Ok(())
            }
            _ => Err(SchedError::InvalidArgument),
        }
    }

    fn tick(&self, core: &SchedCore, cpu: CpuId) {
        let rq = core.run_queue(cpu);
        {
            let guard = rq.lock();
            let curr = guard.curr();
            if let Some(cv) = vcpu_priv(curr) {
                let credit = cv.credit.fetch_sub(CSCHED_CREDITS_PER_TICK, Ordering::Relaxed)
                    - CSCHED_CREDITS_PER_TICK;

                // Out of credit while an UNDER vCPU waits: preempt now.
                if credit <= 0
                    && self
                        .runqs
                        .get(cpu)
                        .lock()
                        .iter()
                        .any(|v| v.is_runnable() && credit_of(v) > 0 && !is_parked(v))
                {
                    core.raise_softirq(cpu);
                }
            }
        }

        if cpu == 0 && rq.tick_count() % CSCHED_TICKS_PER_ACCT == 0 {
            self.acct(core);
        }
    }

    fn control(&self, _core: &SchedCore, cmd: &mut SchedCtlCmd) -> Result<(), SchedError> {
        match (cmd.direction, cmd.params) {
            (SchedInfoDirection::Put, SchedCtlParams::Credit { tslice }) => {
                if !(millisecs(1)..=millisecs(1000)).contains(&tslice) {
                    return Err(SchedError::InvalidArgument);
                }
                self.tslice.store(tslice, Ordering::Relaxed);
                Ok(())
            }
            (SchedInfoDirection::Get, SchedCtlParams::Credit { .. }) => {
                cmd.params = SchedCtlParams::Credit {
                    tslice: self.tslice.load(Ordering::Relaxed),
                };
                Ok(())
            }
            _ => Err(SchedError::InvalidArgument),
        }
    }

    fn dump_settings(&self, _core: &SchedCore) {
        crate::kinfo!(
            "credit: tslice={}ms ticks/acct={} credits/tick={} acct runs={}",
            self.tslice.load(Ordering::Relaxed) / millisecs(1),
            CSCHED_TICKS_PER_ACCT,
            CSCHED_CREDITS_PER_TICK,
            self.acct_runs()
        );
        for d in self.domains.lock().iter() {
            if let Some(sd) = d.sched_priv::<CreditDom>() {
                crate::kinfo!(
                    "  dom {}: weight={} cap={}",
                    d.domain_id(),
                    sd.weight.load(Ordering::Relaxed),
                    sd.cap.load(Ordering::Relaxed)
                );
            }
        }
    }

    fn dump_cpu_state(&self, _core: &SchedCore, rq: &SchedLock<'_>) {
        let runq = self.runqs.get(rq.cpu()).lock();
        crate::kinfo!("  curr credit={} runq: {} queued", credit_of(rq.curr()), runq.len());
        for (pos, v) in runq.iter().enumerate() {
            crate::kinfo!(
                "  {:3}: {} credit={}{}",
                pos,
                v,
                credit_of(v),
                if is_parked(v) { " parked" } else { "" }
            );
        }
    }
}
