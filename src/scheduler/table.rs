//! Domain table and domain lifecycle
//!
//! The table is a fixed array of slots sized at build time. It is only
//! written on the control plane (create, destroy); the timer interrupt
//! path takes it for reading to find per-vCPU timers.

use alloc::sync::Arc;

use crate::domain::{CpuMask, Domain, DomainFlags};

use super::core::Scheduler;
use super::types::{CpuId, DomId, SchedError, VcpuId, IDLE_DOMAIN_ID, MAX_VIRT_CPUS};

/// Parameters of a new domain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DomainConfig {
    pub domain_id: DomId,
    pub nr_vcpus: usize,
    pub privileged: bool,
    /// pCPU of vCPU 0; later vCPUs follow round-robin over online pCPUs
    pub first_cpu: CpuId,
    /// Keep every vCPU on `first_cpu` and restrict its affinity to it
    pub pinned: bool,
}

impl DomainConfig {
    pub fn new(domain_id: DomId, nr_vcpus: usize) -> Self {
        Self {
            domain_id,
            nr_vcpus,
            privileged: false,
            first_cpu: 0,
            pinned: false,
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    pub fn on_cpu(mut self, cpu: CpuId) -> Self {
        self.first_cpu = cpu;
        self
    }

    pub fn pinned_to(mut self, cpu: CpuId) -> Self {
        self.first_cpu = cpu;
        self.pinned = true;
        self
    }

    fn placement(&self, nr_cpus: usize, vcpu_id: VcpuId) -> CpuId {
        if self.pinned {
            self.first_cpu
        } else {
            (self.first_cpu + vcpu_id) % nr_cpus
        }
    }
}

impl Scheduler {
    /// Create a domain and initialize scheduling state for its vCPUs.
    ///
    /// The domain starts paused by the system controller; release it with
    /// [`Scheduler::domain_unpause_by_systemcontroller`].
    pub fn create_domain(&self, config: DomainConfig) -> Result<Arc<Domain>, SchedError> {
        let nr_cpus = self.core.nr_cpus();
        if config.domain_id == IDLE_DOMAIN_ID
            || config.nr_vcpus == 0
            || config.nr_vcpus > MAX_VIRT_CPUS
            || config.first_cpu >= nr_cpus
        {
            return Err(SchedError::InvalidArgument);
        }

        let mut table = self.domains.write();
        if table
            .iter()
            .flatten()
            .any(|d| d.domain_id() == config.domain_id)
        {
            return Err(SchedError::InvalidArgument);
        }
        let slot = table
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(SchedError::NoMemory)?;

        let d = Domain::new(
            config.domain_id,
            config.nr_vcpus,
            config.privileged,
            self.core.now(),
            |id| config.placement(nr_cpus, id),
        );

        for v in d.vcpus() {
            // A new vCPU has not missed any tick of its pCPU yet.
            v.set_sleep_tick(self.core.run_queue(v.processor()).tick_count());
            if config.pinned {
                v.set_cpu_affinity(CpuMask::of(config.first_cpu));
            }
            if let Err(err) = self.ops.init_vcpu(&self.core, v) {
                crate::kerror!("{}: scheduler init failed: {:?}", v, err);
                self.ops.destroy_domain(&self.core, &d);
                return Err(err);
            }
        }

        *slot = Some(d.clone());

        crate::kinfo!(
            "Created domain {} with {} vCPUs{}",
            config.domain_id,
            config.nr_vcpus,
            if config.privileged { " (privileged)" } else { "" }
        );

        Ok(d)
    }

    /// Look up a live domain.
    pub fn domain_by_id(&self, domain_id: DomId) -> Option<Arc<Domain>> {
        self.domains
            .read()
            .iter()
            .flatten()
            .find(|d| d.domain_id() == domain_id)
            .cloned()
    }

    /// Tear down a domain's scheduling state. Must not be called from one
    /// of the domain's own vCPUs.
    pub fn destroy_domain(&self, domain_id: DomId) -> Result<(), SchedError> {
        let d = self.domain_by_id(domain_id).ok_or(SchedError::NoSuchDomain)?;

        if d.test_and_set_flag(DomainFlags::DYING) {
            return Ok(());
        }
        self.domain_pause(&d);

        for v in d.vcpus() {
            v.timer.kill();
            v.poll_timer.kill();
        }
        self.ops.destroy_domain(&self.core, &d);

        let mut table = self.domains.write();
        for slot in table.iter_mut() {
            if slot.as_ref().is_some_and(|s| Arc::ptr_eq(s, &d)) {
                *slot = None;
            }
        }

        crate::kinfo!("Destroyed domain {}", domain_id);
        Ok(())
    }

    /// Shut `d` down with `reason`: stop all its vCPUs and hand over to
    /// the platform finalizer.
    pub fn domain_shutdown(&self, d: &Arc<Domain>, reason: u8) {
        d.set_shutdown_code(reason);
        d.set_flag(DomainFlags::SHUTDOWN);

        for v in d.vcpus() {
            self.vcpu_sleep_nosync(v);
        }

        crate::kinfo!("Domain {} shutdown: reason {}", d.domain_id(), reason);
        self.core.platform().domain_shutdown(d, reason);
    }

    /// Number of live guest domains
    pub fn nr_domains(&self) -> usize {
        self.domains.read().iter().flatten().count()
    }
}
