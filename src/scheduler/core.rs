//! Dispatcher core
//!
//! Owns the per-pCPU run queues, the active policy and the domain table,
//! and implements the single routine that may change the vCPU running on a
//! pCPU ([`Scheduler::enter_scheduler`]) together with the softirq and
//! timer plumbing that leads into it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use spin::RwLock;

use crate::config::BootOptions;
use crate::domain::{CpuMask, Domain, Vcpu, VcpuFlags};
use crate::platform::{ContextSaved, Platform};

use super::ops::{self, SchedulerDef, SchedulerOps};
use super::percpu::{PerCpuRunQueue, SchedLock, SCHEDULE_SOFTIRQ};
use super::types::{
    CpuId, Runstate, STime, TaskSlice, IDLE_DOMAIN_ID, MAX_CPUS, MAX_DOMAINS, TICK_PERIOD,
};

/// State shared between the framework and the active policy
pub struct SchedCore {
    platform: Arc<dyn Platform>,
    cpus: Box<[PerCpuRunQueue]>,
    online: CpuMask,
}

impl SchedCore {
    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn online(&self) -> CpuMask {
        self.online
    }

    #[inline]
    pub fn now(&self) -> STime {
        self.platform.now()
    }

    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    /// Run queue of `cpu`. Out-of-range ids are a caller bug.
    pub fn run_queue(&self, cpu: CpuId) -> &PerCpuRunQueue {
        match self.cpus.get(cpu) {
            Some(rq) => rq,
            None => crate::kpanic!("cpu{} is not online", cpu),
        }
    }

    pub fn run_queues(&self) -> &[PerCpuRunQueue] {
        &self.cpus
    }

    /// Lock the run queue `v` is bound to. Retries if `v` migrates while
    /// the lock is being taken.
    pub fn vcpu_schedule_lock(&self, v: &Vcpu) -> SchedLock<'_> {
        loop {
            let cpu = v.processor();
            let guard = self.run_queue(cpu).lock();
            if v.processor() == cpu {
                return guard;
            }
        }
    }

    /// Request a pass through the dispatcher on `cpu`.
    pub fn raise_softirq(&self, cpu: CpuId) {
        self.run_queue(cpu).set_softirq(SCHEDULE_SOFTIRQ);
        if cpu != self.platform.processor_id() {
            self.platform.send_ipi(cpu);
        }
    }
}

/// The scheduling core: run queues, active policy and domain table
pub struct Scheduler {
    pub(crate) core: SchedCore,
    pub(crate) ops: Box<dyn SchedulerOps>,
    idle_domain: Arc<Domain>,
    pub(crate) domains: RwLock<[Option<Arc<Domain>>; MAX_DOMAINS]>,
}

impl Scheduler {
    /// Bootstrap with the built-in policies.
    pub fn new(platform: Arc<dyn Platform>, opts: &BootOptions) -> Self {
        Self::with_registry(platform, opts, ops::SCHEDULERS)
    }

    /// Bootstrap choosing the policy from `registry`.
    ///
    /// Creates one idle vCPU per pCPU, loaded as that pCPU's current vCPU,
    /// and initializes the per-pCPU run queues and timers. Periodic ticks
    /// start with [`Scheduler::schedulers_start`].
    pub fn with_registry(
        platform: Arc<dyn Platform>,
        opts: &BootOptions,
        registry: &[SchedulerDef],
    ) -> Self {
        opts.apply();

        let nr_cpus = platform.nr_cpus();
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            crate::kpanic!("unsupported number of cpus: {}", nr_cpus);
        }

        let now = platform.now();
        let idle_domain = Domain::new(IDLE_DOMAIN_ID, nr_cpus, false, now, |id| id);
        let cpus: Box<[PerCpuRunQueue]> = idle_domain
            .vcpus()
            .iter()
            .map(|idle| {
                idle.set_flag(VcpuFlags::RUNNING);
                idle.set_cpu_affinity(CpuMask::of(idle.processor()));
                PerCpuRunQueue::new(idle.processor(), idle.clone())
            })
            .collect();

        let core = SchedCore {
            platform,
            cpus,
            online: CpuMask::first_n(nr_cpus),
        };

        let def = ops::select(registry, opts.sched());
        crate::kinfo!("Using scheduler: {} ({})", def.name, def.opt_name);

        let policy = (def.create)();
        if let Err(err) = policy.init(&core) {
            crate::kpanic!("scheduler {} failed to initialize: {:?}", def.opt_name, err);
        }
        for idle in idle_domain.vcpus() {
            if let Err(err) = policy.init_vcpu(&core, idle) {
                crate::kpanic!("scheduler {} rejected {}: {:?}", def.opt_name, idle, err);
            }
        }

        crate::kinfo!("Scheduler initialized on {} cpus", nr_cpus);

        Self {
            core,
            ops: policy,
            idle_domain,
            domains: RwLock::new(core::array::from_fn(|_| None)),
        }
    }

    pub fn core(&self) -> &SchedCore {
        &self.core
    }

    pub fn platform(&self) -> &dyn Platform {
        self.core.platform()
    }

    pub fn nr_cpus(&self) -> usize {
        self.core.nr_cpus()
    }

    /// Active policy
    pub fn policy(&self) -> &dyn SchedulerOps {
        &*self.ops
    }

    /// Id of the active policy
    pub fn sched_id(&self) -> u32 {
        self.ops.sched_id()
    }

    pub fn idle_vcpu(&self, cpu: CpuId) -> &Arc<Vcpu> {
        self.core.run_queue(cpu).idle()
    }

    pub fn idle_domain(&self) -> &Arc<Domain> {
        &self.idle_domain
    }

    /// vCPU loaded on the calling pCPU
    pub fn current(&self) -> Arc<Vcpu> {
        let cpu = self.core.platform.processor_id();
        self.core.run_queue(cpu).lock().curr().clone()
    }

    /// vCPU loaded on `cpu`
    pub fn curr_on(&self, cpu: CpuId) -> Arc<Vcpu> {
        self.core.run_queue(cpu).lock().curr().clone()
    }

    /// Arm the periodic tick on every pCPU.
    pub fn schedulers_start(&self) {
        for rq in self.core.run_queues() {
            self.t_timer_fn(rq.cpu());
        }
    }

    /// Run the policy and switch the calling pCPU to its choice.
    ///
    /// Returns once the calling vCPU has been scheduled back in (for the
    /// fast path, immediately).
    pub fn enter_scheduler(&self) {
        let core = &self.core;
        let platform = core.platform();
        let cpu = platform.processor_id();
        let rq = core.run_queue(cpu);

        if platform.in_irq() {
            crate::kpanic!("scheduler entered from interrupt context on cpu{}", cpu);
        }
        if !rq.enter_dispatch() {
            crate::kpanic!("scheduler re-entered on cpu{}", cpu);
        }
        rq.counters.sched_run.fetch_add(1, Ordering::Relaxed);

        let mut guard = rq.lock();
        let now = core.now();

        rq.s_timer.stop();

        let prev = guard.curr().clone();
        let TaskSlice { task: next, time: quantum } = self.ops.do_schedule(core, &guard, now);

        let policy = self.ops.opt_name();
        if quantum <= 0 {
            crate::kpanic!("{} granted non-positive quantum {} to {}", policy, quantum, next);
        }
        if next.processor() != cpu {
            crate::kpanic!(
                "{} picked {} bound to cpu{} for cpu{}",
                policy,
                next,
                next.processor(),
                cpu
            );
        }
        if !next.is_idle() && !next.is_runnable() {
            crate::kpanic!("{} picked non-runnable {}", policy, next);
        }

        guard.set_curr(next.clone());
        rq.s_timer.set(now + quantum);

        if Arc::ptr_eq(&prev, &next) {
            drop(guard);
            rq.leave_dispatch();
            rq.counters.continue_running.fetch_add(1, Ordering::Relaxed);
            platform.continue_running(&prev);
            return;
        }

        {
            let token = guard.token();
            let prev_state = if prev.test_flag(VcpuFlags::BLOCKED) {
                Runstate::Blocked
            } else if prev.is_runnable() {
                Runstate::Runnable
            } else {
                Runstate::Offline
            };
            prev.runstate.change(&token, prev_state, now);

            if next.runstate() == Runstate::Running || next.test_flag(VcpuFlags::RUNNING) {
                crate::kpanic!("{} dispatched while still running", next);
            }
            next.runstate.change(&token, Runstate::Running, now);
            next.set_flag(VcpuFlags::RUNNING);
        }
        drop(guard);

        rq.counters.sched_ctx.fetch_add(1, Ordering::Relaxed);

        let tick = rq.tick_count();
        prev.set_sleep_tick(tick);

        if !next.is_idle() {
            platform.update_system_time(&next);
            if next.sleep_tick() != tick {
                platform.send_timer_event(&next);
            }
        }

        crate::ktrace!("cpu{}: switch {} -> {} ({}ns)", cpu, prev, next, quantum);

        rq.leave_dispatch();
        platform.context_switch(&prev, &next, ContextSaved::new(&prev));
    }

    /// Run pending scheduling softirqs of the calling pCPU.
    pub fn do_softirq(&self) {
        let rq = self.core.run_queue(self.core.platform.processor_id());
        while rq.take_softirq() & SCHEDULE_SOFTIRQ != 0 {
            self.enter_scheduler();
        }
    }

    /// Run every expired timer bound to the calling pCPU. Timer handlers
    /// never enter the dispatcher; they raise the scheduling softirq.
    pub fn timer_interrupt(&self) {
        let cpu = self.core.platform.processor_id();
        let rq = self.core.run_queue(cpu);
        let now = self.core.now();

        if rq.s_timer.try_expire(now) {
            self.s_timer_fn(cpu);
        }
        if rq.t_timer.try_expire(now) {
            self.t_timer_fn(cpu);
        }

        let domains = self.domains.read();
        for d in domains.iter().flatten() {
            for v in d.vcpus() {
                if v.timer.cpu() == cpu && v.timer.try_expire(now) {
                    self.vcpu_timer_fn(v);
                }
                if v.poll_timer.cpu() == cpu && v.poll_timer.try_expire(now) {
                    self.poll_timer_fn(v);
                }
            }
        }
    }

    /// Earliest armed deadline among the timers of `cpu`.
    pub fn next_timer_deadline(&self, cpu: CpuId) -> Option<STime> {
        let rq = self.core.run_queue(cpu);
        let mut earliest = [rq.s_timer.expires(), rq.t_timer.expires()]
            .into_iter()
            .flatten()
            .min();

        let domains = self.domains.read();
        for d in domains.iter().flatten() {
            for v in d.vcpus() {
                for timer in [&v.timer, &v.poll_timer] {
                    if timer.cpu() != cpu {
                        continue;
                    }
                    if let Some(t) = timer.expires() {
                        earliest = Some(earliest.map_or(t, |e| e.min(t)));
                    }
                }
            }
        }
        earliest
    }

    fn s_timer_fn(&self, cpu: CpuId) {
        let rq = self.core.run_queue(cpu);
        rq.counters.sched_irq.fetch_add(1, Ordering::Relaxed);
        self.core.raise_softirq(cpu);
    }

    fn t_timer_fn(&self, cpu: CpuId) {
        let rq = self.core.run_queue(cpu);
        rq.bump_tick();

        let curr = rq.lock().curr().clone();
        if !curr.is_idle() {
            self.core.platform.update_system_time(&curr);
            self.core.platform.send_timer_event(&curr);
        }

        self.ops.tick(&self.core, cpu);

        rq.t_timer.set(self.core.now() + TICK_PERIOD);
    }

    fn vcpu_timer_fn(&self, v: &Arc<Vcpu>) {
        self.core.platform.send_timer_event(v);
    }

    fn poll_timer_fn(&self, v: &Arc<Vcpu>) {
        if v.test_and_clear_flag(VcpuFlags::POLLING) {
            self.vcpu_unblock(v);
        }
    }
}
