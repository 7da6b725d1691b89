//! Control-plane access to policy parameters
//!
//! `sched_adjdom` pauses every vCPU of the target domain except the
//! caller, then (only if the caller belongs to that domain) takes the
//! caller's own run-queue lock. The dispatcher locks its run queue before
//! anything it may wait on, so pausing must come first.

use alloc::sync::Arc;

use super::core::Scheduler;
use super::types::{SchedAdjdomCmd, SchedCtlCmd, SchedError, SchedInfoDirection};

impl TryFrom<u32> for SchedInfoDirection {
    type Error = SchedError;

    fn try_from(raw: u32) -> Result<Self, SchedError> {
        match raw {
            0 => Ok(SchedInfoDirection::Put),
            1 => Ok(SchedInfoDirection::Get),
            _ => Err(SchedError::InvalidArgument),
        }
    }
}

impl Scheduler {
    /// Read or update policy-wide parameters.
    pub fn sched_ctl(&self, cmd: &mut SchedCtlCmd) -> Result<(), SchedError> {
        if cmd.sched_id != self.ops.sched_id() {
            return Err(SchedError::InvalidArgument);
        }

        self.ops.control(&self.core, cmd)
    }

    /// Read or update one domain's policy parameters.
    pub fn sched_adjdom(&self, cmd: &mut SchedAdjdomCmd) -> Result<(), SchedError> {
        if cmd.sched_id != self.ops.sched_id() {
            return Err(SchedError::InvalidArgument);
        }

        let d = self.domain_by_id(cmd.domain).ok_or(SchedError::NoSuchDomain)?;
        let me = self.current();

        for v in d.vcpus() {
            if !Arc::ptr_eq(v, &me) {
                self.vcpu_pause(v);
            }
        }

        let own = if me.domain_id() == d.domain_id() {
            Some(self.core.vcpu_schedule_lock(&me))
        } else {
            None
        };

        crate::ktrace!("adjdom: dom {} {:?}", d.domain_id(), cmd.direction);
        let rc = self.ops.adjdom(&self.core, &d, cmd);

        drop(own);

        for v in d.vcpus() {
            if !Arc::ptr_eq(v, &me) {
                self.vcpu_unpause(v);
            }
        }

        rc
    }
}
