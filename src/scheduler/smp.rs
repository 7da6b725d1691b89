//! CPU affinity and vCPU migration

use alloc::sync::Arc;

use crate::domain::{CpuMask, Vcpu, VcpuFlags};

use super::core::{SchedCore, Scheduler};
use super::types::{CpuId, SchedError};

impl Scheduler {
    /// Restrict `v` to the pCPUs in `mask`.
    pub fn vcpu_set_affinity(&self, v: &Arc<Vcpu>, mask: CpuMask) -> Result<(), SchedError> {
        if v.is_idle() {
            return Err(SchedError::InvalidArgument);
        }
        let online = mask.and(&self.core.online());
        if online.is_empty() {
            return Err(SchedError::InvalidArgument);
        }

        self.ops.set_affinity(&self.core, v, &online)?;
        crate::kdebug!("{}: affinity {:?}", v, online);
        Ok(())
    }
}

impl SchedCore {
    /// Move a vCPU that is neither runnable nor executing to `cpu`, taking
    /// both run-queue locks in ascending pCPU order. Its timers follow it.
    pub fn migrate_vcpu(&self, v: &Vcpu, cpu: CpuId) -> Result<(), SchedError> {
        if cpu >= self.nr_cpus() {
            return Err(SchedError::InvalidArgument);
        }

        loop {
            let old = v.processor();
            if old == cpu {
                return Ok(());
            }

            let (low, high) = if old < cpu { (old, cpu) } else { (cpu, old) };
            let _low = self.run_queue(low).lock();
            let _high = self.run_queue(high).lock();

            if v.processor() != old {
                continue;
            }
            if v.is_runnable() || v.test_flag(VcpuFlags::RUNNING) {
                return Err(SchedError::Busy);
            }

            v.set_processor(cpu);
            v.timer.migrate(cpu);
            v.poll_timer.migrate(cpu);

            crate::ktrace!("{}: migrated cpu{} -> cpu{}", v, old, cpu);
            return Ok(());
        }
    }
}
