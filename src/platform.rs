//! Services the scheduler consumes from the surrounding hypervisor
//!
//! The scheduler never touches hardware directly. Clock reads, the
//! register/FPU context switch, inter-processor interrupts and virtual
//! interrupt injection are all reached through [`Platform`].

use alloc::sync::Arc;

use crate::domain::{Domain, Vcpu, VcpuFlags};
use crate::scheduler::types::{CpuId, STime};

pub trait Platform: Send + Sync {
    /// Current system time in nanoseconds.
    fn now(&self) -> STime;

    /// Number of online pCPUs, numbered `0..nr_cpus()`.
    fn nr_cpus(&self) -> usize;

    /// Index of the pCPU executing the caller.
    fn processor_id(&self) -> CpuId;

    /// Whether the caller runs in hard interrupt context.
    fn in_irq(&self) -> bool {
        false
    }

    /// Transfer this pCPU from `prev` to `next`.
    ///
    /// Once `prev`'s register state is saved the implementation must
    /// complete `saved` (dropping it also completes it). In a real
    /// hypervisor this call returns only when `prev` is scheduled back in.
    fn context_switch(&self, prev: &Arc<Vcpu>, next: &Arc<Vcpu>, saved: ContextSaved<'_>);

    /// Resume `v` without a switch (the scheduler picked the running vCPU).
    fn continue_running(&self, _v: &Arc<Vcpu>) {}

    /// Flush any lazily held execution state of `v` to memory.
    fn sync_execstate(&self, _v: &Vcpu) {}

    /// Bring the guest-visible time base of `v` up to date.
    fn update_system_time(&self, _v: &Vcpu) {}

    /// Inject a virtual timer interrupt into `v`.
    fn send_timer_event(&self, v: &Vcpu);

    /// Interrupt `cpu` so it notices a raised softirq.
    fn send_ipi(&self, _cpu: CpuId) {}

    /// Pause hint for spin-wait loops.
    fn cpu_relax(&self) {
        core::hint::spin_loop();
    }

    /// Finalize shutdown of `d` after its vCPUs have been put to sleep.
    fn domain_shutdown(&self, _d: &Domain, _reason: u8) {}
}

/// Completion token for [`Platform::context_switch`]: marks `prev` as no
/// longer loaded on any pCPU.
pub struct ContextSaved<'a> {
    prev: Option<&'a Vcpu>,
}

impl<'a> ContextSaved<'a> {
    pub(crate) fn new(prev: &'a Vcpu) -> Self {
        Self { prev: Some(prev) }
    }

    /// `prev`'s state is saved; it may now be dispatched elsewhere.
    pub fn complete(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if let Some(prev) = self.prev.take() {
            prev.clear_flag(VcpuFlags::RUNNING);
        }
    }
}

impl Drop for ContextSaved<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
