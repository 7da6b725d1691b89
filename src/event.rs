//! Event-port pending state and the event wake path
//!
//! Only the part of the event subsystem the scheduler depends on lives
//! here: the per-domain pending bitmap, the per-vCPU upcall bits and the
//! path that wakes blocked or polling vCPUs when a port becomes pending.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::domain::{Domain, Vcpu, VcpuFlags};
use crate::scheduler::types::{EvtchnPort, MAX_EVTCHNS};
use crate::scheduler::{SchedError, Scheduler};

#[inline]
fn port_word_bit(port: EvtchnPort) -> (usize, u64) {
    ((port / 64) as usize, 1u64 << (port % 64))
}

impl Domain {
    /// Whether `port` has an undelivered event. Out-of-range ports never do.
    pub fn evtchn_is_pending(&self, port: EvtchnPort) -> bool {
        if port >= MAX_EVTCHNS {
            return false;
        }
        let (word, bit) = port_word_bit(port);
        self.evtchn_pending[word].load(Ordering::SeqCst) & bit != 0
    }

    /// Returns whether the bit was already set.
    pub(crate) fn evtchn_test_and_set_pending(&self, port: EvtchnPort) -> bool {
        let (word, bit) = port_word_bit(port);
        self.evtchn_pending[word].fetch_or(bit, Ordering::SeqCst) & bit != 0
    }

    /// Acknowledge `port` (guest side).
    pub fn evtchn_clear_pending(&self, port: EvtchnPort) {
        if port < MAX_EVTCHNS {
            let (word, bit) = port_word_bit(port);
            self.evtchn_pending[word].fetch_and(!bit, Ordering::SeqCst);
        }
    }
}

impl Vcpu {
    /// An upcall is pending and the guest has event delivery enabled.
    pub fn local_events_need_delivery(&self) -> bool {
        self.upcall_pending.load(Ordering::SeqCst) && !self.upcall_mask.load(Ordering::SeqCst)
    }

    pub fn event_delivery_enable(&self) {
        self.upcall_mask.store(false, Ordering::SeqCst);
    }

    pub fn event_delivery_disable(&self) {
        self.upcall_mask.store(true, Ordering::SeqCst);
    }

    pub fn upcall_pending(&self) -> bool {
        self.upcall_pending.load(Ordering::SeqCst)
    }

    /// Guest acknowledged the upcall.
    pub fn clear_upcall_pending(&self) {
        self.upcall_pending.store(false, Ordering::SeqCst);
    }
}

impl Scheduler {
    /// Mark `port` pending for the domain of `v` and notify `v`.
    ///
    /// The pending bit is published before any flag is inspected: a vCPU
    /// that sets Blocked/Polling and then checks its ports either sees the
    /// bit or is seen as blocked here.
    pub fn evtchn_set_pending(&self, v: &Arc<Vcpu>, port: EvtchnPort) -> Result<(), SchedError> {
        if port >= MAX_EVTCHNS {
            return Err(SchedError::InvalidArgument);
        }
        let d = v.domain().ok_or(SchedError::NoSuchDomain)?;

        if d.evtchn_test_and_set_pending(port) {
            return Ok(());
        }
        crate::ktrace!("evtchn: {} port {} pending", v, port);

        if !v.upcall_pending.swap(true, Ordering::SeqCst) {
            self.vcpu_unblock(v);
        }

        // The domain Polling flag may be momentarily clear while a poller
        // exits, so check each vCPU. A polling vCPU keeps its Polling flag;
        // only the poll timeout or the poller itself clears it.
        for polled in d.vcpus() {
            if polled.test_flag(VcpuFlags::POLLING) {
                self.vcpu_unblock(polled);
            }
        }

        Ok(())
    }
}
