//! Dispatcher tests
//!
//! Fast path, context switch protocol and the sanity checks applied to
//! every policy decision. Rigged policies produce the decisions no
//! built-in policy would.

use std::sync::{Arc, Mutex};

use hvsched::scheduler::policies::rrobin::RoundRobin;
use hvsched::scheduler::types::{CpuId, Runstate, STime, IDLE_DOMAIN_ID};
use hvsched::scheduler::{
    AdjdomParams, DomainConfig, SchedAdjdomCmd, SchedCore, SchedError, SchedInfoDirection,
    SchedLock, SchedulerDef, SchedulerOps, TaskSlice,
};
use hvsched::{CpuMask, Domain, Vcpu, VcpuFlags};
use serial_test::serial;

use super::{ms, runstate, set_rr_slice, vcpu};
use crate::mock::{key, set_in_irq, Harness, VcpuKey};

// ============================================================================
// Rigged policies
// ============================================================================

#[derive(Clone, Copy)]
enum Pick {
    ZeroQuantum,
    NonRunnable,
    ForeignCpu,
}

struct Rigged {
    pick: Pick,
    seen: Mutex<Vec<Arc<Vcpu>>>,
}

impl Rigged {
    fn new(pick: Pick) -> Self {
        Self {
            pick,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl SchedulerOps for Rigged {
    fn name(&self) -> &'static str {
        "Rigged Scheduler"
    }

    fn opt_name(&self) -> &'static str {
        "rigged"
    }

    fn sched_id(&self) -> u32 {
        90
    }

    fn init_vcpu(&self, _core: &SchedCore, v: &Arc<Vcpu>) -> Result<(), SchedError> {
        if !v.is_idle() {
            self.seen.lock().unwrap().push(v.clone());
        }
        Ok(())
    }

    fn sleep(&self, _core: &SchedCore, _rq: &SchedLock<'_>, _v: &Arc<Vcpu>) {}

    fn wake(&self, _core: &SchedCore, _rq: &SchedLock<'_>, _v: &Arc<Vcpu>) {}

    fn set_affinity(&self, _core: &SchedCore, _v: &Arc<Vcpu>, _mask: &CpuMask)
        -> Result<(), SchedError>
    {
        Ok(())
    }

    fn do_schedule(&self, core: &SchedCore, rq: &SchedLock<'_>, _now: STime) -> TaskSlice {
        match self.pick {
            Pick::ZeroQuantum => TaskSlice {
                task: rq.idle().clone(),
                time: 0,
            },
            Pick::NonRunnable => TaskSlice {
                task: self
                    .seen
                    .lock()
                    .unwrap()
                    .first()
                    .cloned()
                    .unwrap_or_else(|| rq.idle().clone()),
                time: ms(10),
            },
            Pick::ForeignCpu => {
                let other: CpuId = (rq.cpu() + 1) % core.nr_cpus();
                TaskSlice {
                    task: core.run_queue(other).idle().clone(),
                    time: ms(10),
                }
            }
        }
    }

    fn adjdom(&self, _core: &SchedCore, _d: &Domain, _cmd: &mut SchedAdjdomCmd)
        -> Result<(), SchedError>
    {
        Ok(())
    }
}

fn rigged_def(create: fn() -> Box<dyn SchedulerOps>) -> [SchedulerDef; 1] {
    [SchedulerDef {
        opt_name: "rigged",
        name: "Rigged Scheduler",
        sched_id: 90,
        create,
    }]
}

fn create_zero_quantum() -> Box<dyn SchedulerOps> {
    Box::new(Rigged::new(Pick::ZeroQuantum))
}

fn create_non_runnable() -> Box<dyn SchedulerOps> {
    Box::new(Rigged::new(Pick::NonRunnable))
}

fn create_foreign_cpu() -> Box<dyn SchedulerOps> {
    Box::new(Rigged::new(Pick::ForeignCpu))
}

// ============================================================================
// Decision sanity checks
// ============================================================================

#[test]
#[should_panic(expected = "non-positive quantum")]
fn test_zero_quantum_is_fatal() {
    let h = Harness::with_registry(1, "rigged", &rigged_def(create_zero_quantum));
    h.on_cpu(0, |s| s.enter_scheduler());
}

#[test]
#[should_panic(expected = "picked non-runnable")]
fn test_non_runnable_pick_is_fatal() {
    let h = Harness::with_registry(1, "rigged", &rigged_def(create_non_runnable));
    // Still paused by the controller
    h.sched.create_domain(DomainConfig::new(1, 1)).unwrap();
    h.on_cpu(0, |s| s.enter_scheduler());
}

#[test]
#[should_panic(expected = "bound to cpu1")]
fn test_foreign_cpu_pick_is_fatal() {
    let h = Harness::with_registry(2, "rigged", &rigged_def(create_foreign_cpu));
    h.on_cpu(0, |s| s.enter_scheduler());
}

#[test]
#[should_panic(expected = "interrupt context")]
fn test_scheduler_entry_from_irq_is_fatal() {
    let h = Harness::new(1, "rrobin");
    h.on_cpu(0, |s| {
        set_in_irq(true);
        s.enter_scheduler()
    });
}

#[test]
#[should_panic(expected = "cannot pause itself")]
fn test_self_pause_is_fatal() {
    let h = Harness::new(1, "rrobin");
    h.on_cpu(0, |s| s.vcpu_pause(s.idle_vcpu(0)));
}

#[test]
#[should_panic(expected = "unpaused more often than paused")]
fn test_unbalanced_unpause_is_fatal() {
    let h = Harness::new(2, "rrobin");
    let d = h.guest(DomainConfig::new(1, 1).on_cpu(1));
    h.on_cpu(0, |s| s.vcpu_unpause(&vcpu(&d, 0)));
}

// ============================================================================
// Fast path
// ============================================================================

#[test]
fn test_fast_path_keeps_runstate_and_rearms() {
    let h = Harness::new(2, "rrobin");
    let d = h.sched.create_domain(DomainConfig::new(1, 1).pinned_to(1)).unwrap();
    set_rr_slice(&h, &d, ms(4));
    h.sched.domain_unpause_by_systemcontroller(&d);
    let v = vcpu(&d, 0);

    h.softirq_all();
    let before = runstate(&h, &v);
    assert_eq!(before.state, Runstate::Running);
    assert_eq!(before.state_entry_time, 0);
    h.mock.clear_records();

    // Sole runnable vCPU: the quantum expiry picks it again.
    h.run_until(ms(4));

    let after = runstate(&h, &v);
    assert_eq!(after.state, Runstate::Running);
    assert_eq!(after.state_entry_time, before.state_entry_time);
    assert_eq!(after.time_in(Runstate::Running), ms(4));
    assert!(h.mock.switches().is_empty());
    assert_eq!(h.mock.continued(), 1);

    let stats = h.sched.percpu_stats(1).unwrap();
    assert_eq!(stats.sched_ctx, 1);
    assert_eq!(stats.continue_running, 1);
    assert_eq!(stats.sched_irq, 1);
    assert_eq!(h.sched.next_timer_deadline(1), Some(ms(8)));
}

// ============================================================================
// Context switch protocol
// ============================================================================

#[test]
fn test_switch_moves_running_flag() {
    let h = Harness::new(2, "rrobin");
    let d = h.guest(DomainConfig::new(1, 1).pinned_to(1));
    let v = vcpu(&d, 0);
    let idle = h.sched.idle_vcpu(1).clone();

    h.softirq_all();
    assert!(v.test_flag(VcpuFlags::RUNNING));
    assert!(!idle.test_flag(VcpuFlags::RUNNING));
    assert_eq!(idle.runstate(), Runstate::Runnable);

    let switches = h.mock.switches();
    assert_eq!(switches.len(), 1);
    assert_eq!(switches[0].cpu, 1);
    assert_eq!(switches[0].prev, (IDLE_DOMAIN_ID, 1));
    assert_eq!(switches[0].next, key(&v));
}

#[test]
fn test_yield_returns_when_rescheduled() {
    let h = Harness::new(2, "rrobin");
    let d1 = h.guest(DomainConfig::new(1, 1).pinned_to(1));
    let d2 = h.guest(DomainConfig::new(2, 1).pinned_to(1));
    let (a, b) = (vcpu(&d1, 0), vcpu(&d2, 0));
    h.softirq_all();
    assert_eq!(h.loaded(1), key(&a));

    let t = h.spawn_vcpu(&a, |s| {
        s.do_yield();
        s.core().now()
    });
    t.wait_parked();
    assert!(t.is_parked());
    assert_eq!(h.loaded(1), key(&b));
    assert_eq!(a.runstate(), Runstate::Runnable);

    h.run_until(ms(10));
    assert_eq!(t.join(), ms(10));
    assert_eq!(h.loaded(1), key(&a));
}

#[test]
fn test_softirq_without_request_does_nothing() {
    let h = Harness::new(2, "rrobin");
    h.softirq_all();
    assert!(h.mock.switches().is_empty());
    assert_eq!(h.sched.percpu_stats(0).unwrap().sched_run, 0);
}

// ============================================================================
// Adjdom choreography
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Observation {
    vcpu: VcpuKey,
    pause_count: u32,
    running: bool,
}

static OBSERVED: Mutex<Vec<Observation>> = Mutex::new(Vec::new());

/// Round-robin whose `adjdom` records what it can see of the domain.
struct Observer {
    inner: RoundRobin,
}

impl SchedulerOps for Observer {
    fn name(&self) -> &'static str {
        "Observer Scheduler"
    }

    fn opt_name(&self) -> &'static str {
        "observer"
    }

    fn sched_id(&self) -> u32 {
        91
    }

    fn init(&self, core: &SchedCore) -> Result<(), SchedError> {
        self.inner.init(core)
    }

    fn init_vcpu(&self, core: &SchedCore, v: &Arc<Vcpu>) -> Result<(), SchedError> {
        self.inner.init_vcpu(core, v)
    }

    fn destroy_domain(&self, core: &SchedCore, d: &Domain) {
        self.inner.destroy_domain(core, d)
    }

    fn sleep(&self, core: &SchedCore, rq: &SchedLock<'_>, v: &Arc<Vcpu>) {
        self.inner.sleep(core, rq, v)
    }

    fn wake(&self, core: &SchedCore, rq: &SchedLock<'_>, v: &Arc<Vcpu>) {
        self.inner.wake(core, rq, v)
    }

    fn set_affinity(&self, core: &SchedCore, v: &Arc<Vcpu>, mask: &CpuMask)
        -> Result<(), SchedError>
    {
        self.inner.set_affinity(core, v, mask)
    }

    fn do_schedule(&self, core: &SchedCore, rq: &SchedLock<'_>, now: STime) -> TaskSlice {
        self.inner.do_schedule(core, rq, now)
    }

    fn adjdom(&self, core: &SchedCore, d: &Domain, cmd: &mut SchedAdjdomCmd)
        -> Result<(), SchedError>
    {
        let mut observed = OBSERVED.lock().unwrap();
        for v in d.vcpus() {
            observed.push(Observation {
                vcpu: key(v),
                pause_count: v.pause_count(),
                running: v.test_flag(VcpuFlags::RUNNING),
            });
        }
        drop(observed);
        self.inner.adjdom(core, d, cmd)
    }
}

fn create_observer() -> Box<dyn SchedulerOps> {
    Box::new(Observer {
        inner: RoundRobin::new(),
    })
}

fn observer_registry() -> [SchedulerDef; 1] {
    [SchedulerDef {
        opt_name: "observer",
        name: "Observer Scheduler",
        sched_id: 91,
        create: create_observer,
    }]
}

fn slice_put(h: &Harness, d: &Domain, slice: STime) -> SchedAdjdomCmd {
    SchedAdjdomCmd {
        sched_id: h.sched.sched_id(),
        domain: d.domain_id(),
        direction: SchedInfoDirection::Put,
        params: AdjdomParams::Rrobin { slice },
    }
}

#[test]
#[serial]
fn test_adjdom_from_control_sees_whole_domain_paused() {
    OBSERVED.lock().unwrap().clear();
    let h = Harness::with_registry(4, "observer", &observer_registry());
    let d = h.guest(DomainConfig::new(1, 3).on_cpu(1));
    h.softirq_all();
    for v in d.vcpus() {
        assert!(v.test_flag(VcpuFlags::RUNNING), "{} should be running", v);
    }

    let mut cmd = slice_put(&h, &d, ms(5));
    h.on_cpu(0, |s| s.sched_adjdom(&mut cmd)).unwrap();

    let observed = OBSERVED.lock().unwrap().clone();
    assert_eq!(observed.len(), 3);
    for o in &observed {
        assert_eq!(o.pause_count, 1, "{:?}", o);
        assert!(!o.running, "{:?}", o);
    }

    for v in d.vcpus() {
        assert_eq!(v.pause_count(), 0);
    }
    h.softirq_all();
    for v in d.vcpus() {
        assert_eq!(v.runstate(), Runstate::Running);
    }
}

#[test]
#[serial]
fn test_adjdom_from_own_vcpu_pauses_the_others() {
    OBSERVED.lock().unwrap().clear();
    let h = Harness::with_registry(4, "observer", &observer_registry());
    let d = h.guest(DomainConfig::new(1, 3).on_cpu(1));
    h.softirq_all();

    let caller = vcpu(&d, 0);
    let mut cmd = slice_put(&h, &d, ms(6));
    let rc = h
        .spawn_vcpu(&caller, move |s| s.sched_adjdom(&mut cmd))
        .join();
    assert_eq!(rc, Ok(()));

    let observed = OBSERVED.lock().unwrap().clone();
    assert_eq!(observed.len(), 3);
    for o in &observed {
        if o.vcpu == key(&caller) {
            assert_eq!(o.pause_count, 0);
            assert!(o.running);
        } else {
            assert_eq!(o.pause_count, 1, "{:?}", o);
            assert!(!o.running, "{:?}", o);
        }
    }

    h.softirq_all();
    super::assert_mutual_exclusion(&h, &[d.clone()]);
    for v in d.vcpus() {
        assert_eq!(v.runstate(), Runstate::Running);
    }
}
