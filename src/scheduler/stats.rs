//! Scheduler statistics and run-queue dump
//!
//! Read-only and best effort: each pCPU is inspected under its own lock,
//! so the dump as a whole is not an atomic snapshot.

use super::core::Scheduler;
use super::percpu::PerCpuStats;
use super::types::CpuId;

impl Scheduler {
    /// Log the active policy, its settings and the state of every pCPU.
    pub fn dump_runq(&self) {
        let now = self.core.now();

        crate::kinfo!("Scheduler: {} ({})", self.ops.name(), self.ops.opt_name());
        self.ops.dump_settings(&self.core);
        crate::kinfo!("NOW=0x{:08X}{:08X}", (now >> 32) as u32, now as u32);

        for rq in self.core.run_queues() {
            let guard = rq.lock();
            let stats = rq.stats();
            crate::kinfo!(
                "CPU[{:02}] curr={} tick={} run={} ctx={} irq={} fast={}",
                rq.cpu(),
                guard.curr(),
                stats.tick,
                stats.sched_run,
                stats.sched_ctx,
                stats.sched_irq,
                stats.continue_running
            );
            self.ops.dump_cpu_state(&self.core, &guard);
        }
    }

    /// Counters of `cpu`, if it is online.
    pub fn percpu_stats(&self, cpu: CpuId) -> Option<PerCpuStats> {
        self.core.run_queues().get(cpu).map(|rq| rq.stats())
    }
}
