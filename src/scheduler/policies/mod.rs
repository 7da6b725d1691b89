//! Built-in scheduling policies
//!
//! - `rrobin`: FIFO per pCPU with a per-domain slice; the fallback policy
//! - `credit`: proportional share by weight with optional caps

#[cfg(feature = "sched_credit")]
pub mod credit;
pub mod rrobin;
pub mod runq;

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::{Mutex, Once};

use crate::domain::{CpuMask, Vcpu};

use self::runq::{VcpuRing, RUNQ_CAPACITY};
use super::core::SchedCore;
use super::types::{CpuId, SchedError};

/// One ring per pCPU, allocated by the policy's `init`. Rings are only
/// touched with the owning pCPU's run-queue lock held.
pub(crate) struct PerCpuRings {
    rings: Once<Box<[Mutex<VcpuRing>]>>,
}

impl PerCpuRings {
    pub const fn new() -> Self {
        Self { rings: Once::new() }
    }

    pub fn init(&self, nr_cpus: usize) {
        self.rings.call_once(|| {
            (0..nr_cpus)
                .map(|_| Mutex::new(VcpuRing::new(RUNQ_CAPACITY)))
                .collect()
        });
    }

    pub fn get(&self, cpu: CpuId) -> &Mutex<VcpuRing> {
        match self.rings.get().and_then(|rings| rings.get(cpu)) {
            Some(ring) => ring,
            None => crate::kpanic!("policy run queue for cpu{} used before init", cpu),
        }
    }
}

/// Move `v` off its pCPU if that pCPU is not in `mask`, then record
/// `mask` as its affinity. Moving requires `v` to be paused and
/// descheduled; otherwise the affinity is left unchanged.
pub(crate) fn apply_affinity(
    core: &SchedCore,
    v: &Arc<Vcpu>,
    mask: &CpuMask,
) -> Result<(), SchedError> {
    if !mask.is_set(v.processor()) {
        let target = mask.first().ok_or(SchedError::InvalidArgument)?;
        core.migrate_vcpu(v, target)?;
    }

    v.set_cpu_affinity(*mask);
    Ok(())
}
