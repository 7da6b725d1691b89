//! Self-service scheduling primitives: block, poll, yield and the guest
//! one-shot timer
//!
//! All of them act on the vCPU loaded on the calling pCPU.

use crate::domain::{Domain, DomainFlags, Vcpu, VcpuFlags};

use super::core::Scheduler;
use super::types::{PollOutcome, SchedError, SchedPoll, STime, MAX_EVTCHNS, MAX_POLL_PORTS};

impl Scheduler {
    /// Block the current vCPU until an event is delivered to it.
    pub fn do_block(&self) {
        let v = self.current();

        v.event_delivery_enable();
        v.set_flag(VcpuFlags::BLOCKED);

        // Check for events only after the flag is visible to the wake path.
        if v.local_events_need_delivery() {
            v.clear_flag(VcpuFlags::BLOCKED);
        } else {
            crate::ktrace!("block {}", v);
            self.enter_scheduler();
        }
    }

    /// Block the current vCPU until one of `poll.ports` is pending or the
    /// absolute deadline `poll.timeout` (0: none) passes.
    pub fn do_poll(&self, poll: &SchedPoll<'_>) -> Result<PollOutcome, SchedError> {
        let v = self.current();
        let d = v.domain().ok_or(SchedError::InvalidArgument)?;

        if poll.nr_ports > MAX_POLL_PORTS {
            return Err(SchedError::InvalidArgument);
        }
        if !poll.ports.okay(poll.nr_ports as usize) {
            return Err(SchedError::Fault);
        }

        v.set_flag(VcpuFlags::BLOCKED | VcpuFlags::POLLING);
        d.set_flag(DomainFlags::POLLING);

        let outcome = match self.poll_ports_pending(&d, poll) {
            Ok(true) => Ok(PollOutcome::Event),
            Ok(false) => {
                if poll.timeout != 0 {
                    v.poll_timer.set(poll.timeout);
                }
                crate::ktrace!("poll {} ({} ports)", v, poll.nr_ports);
                self.enter_scheduler();
                v.poll_timer.stop();

                // The timeout handler consumes the Polling flag, but it may
                // also fire after an event woke us and before we ran again.
                let timer_fired = !v.test_flag(VcpuFlags::POLLING);
                self.poll_ports_pending(&d, poll).map(|pending| {
                    if timer_fired && !pending {
                        PollOutcome::TimedOut
                    } else {
                        PollOutcome::Event
                    }
                })
            }
            Err(err) => Err(err),
        };

        poll_cleanup(&v, &d);
        outcome
    }

    fn poll_ports_pending(&self, d: &Domain, poll: &SchedPoll<'_>) -> Result<bool, SchedError> {
        for i in 0..poll.nr_ports as usize {
            let port = poll.ports.copy_from_offset(i)?;
            if port >= MAX_EVTCHNS {
                return Err(SchedError::InvalidArgument);
            }
            if d.evtchn_is_pending(port) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Give up the rest of the current quantum.
    pub fn do_yield(&self) {
        crate::ktrace!("yield {}", self.current());
        self.enter_scheduler();
    }

    /// Arm the current vCPU's one-shot timer for the absolute time
    /// `timeout`; 0 cancels it.
    pub fn set_vcpu_timer(&self, timeout: STime) {
        let v = self.current();
        if timeout == 0 {
            v.timer.stop();
        } else {
            v.timer.set(timeout);
        }
    }
}

fn poll_cleanup(v: &Vcpu, d: &Domain) {
    v.clear_flag(VcpuFlags::POLLING | VcpuFlags::BLOCKED);

    let others_polling = || d.vcpus().iter().any(|o| o.test_flag(VcpuFlags::POLLING));
    if others_polling() {
        return;
    }

    // A vCPU starting to poll now publishes its own flag before the
    // domain's, so re-check after clearing.
    d.clear_flag(DomainFlags::POLLING);
    if others_polling() {
        d.set_flag(DomainFlags::POLLING);
    }
}
