//! vCPU state changes: sleep, wake, pause and run-state queries
//!
//! These are the only paths, besides the dispatcher, that move a vCPU
//! between run states. Each takes the run-queue lock of the vCPU's
//! current pCPU for the duration of the transition.

use alloc::sync::Arc;

use crate::domain::{Domain, DomainFlags, Vcpu, VcpuFlags};

use super::core::Scheduler;
use super::runstate::{OwnRunning, RunstateInfo};
use super::types::Runstate;

impl Scheduler {
    /// Take `v` off its pCPU's schedule if it is no longer runnable.
    /// Does not wait for `v` to stop executing.
    pub fn vcpu_sleep_nosync(&self, v: &Arc<Vcpu>) {
        let guard = self.core.vcpu_schedule_lock(v);

        if !v.is_runnable() {
            if v.runstate() == Runstate::Runnable {
                v.runstate.change(&guard.token(), Runstate::Offline, self.core.now());
            }
            self.ops.sleep(&self.core, &guard, v);
        }

        crate::ktrace!("sleep {}", v);
    }

    /// Like [`Scheduler::vcpu_sleep_nosync`], then wait until `v`'s
    /// execution state is saved.
    pub fn vcpu_sleep_sync(&self, v: &Arc<Vcpu>) {
        self.vcpu_sleep_nosync(v);

        while !v.is_runnable() && v.test_flag(VcpuFlags::RUNNING) {
            self.core.platform().cpu_relax();
        }

        self.core.platform().sync_execstate(v);
    }

    /// Make `v` schedulable again if it is runnable.
    ///
    /// A vCPU that is neither runnable nor flagged blocked but still
    /// accounted as blocked (its domain was paused or shut down while it
    /// waited) is demoted to offline.
    pub fn vcpu_wake(&self, v: &Arc<Vcpu>) {
        let guard = self.core.vcpu_schedule_lock(v);
        let now = self.core.now();

        if v.is_runnable() {
            if v.runstate() >= Runstate::Blocked {
                v.runstate.change(&guard.token(), Runstate::Runnable, now);
            }
            self.ops.wake(&self.core, &guard, v);
        } else if !v.test_flag(VcpuFlags::BLOCKED) && v.runstate() == Runstate::Blocked {
            v.runstate.change(&guard.token(), Runstate::Offline, now);
        }

        crate::ktrace!("wake {}", v);
    }

    /// Clear `v`'s Blocked flag and wake it if the flag was set.
    pub fn vcpu_unblock(&self, v: &Arc<Vcpu>) {
        if v.test_and_clear_flag(VcpuFlags::BLOCKED) {
            self.vcpu_wake(v);
        }
    }

    /// Accounting snapshot of `v` as of now.
    ///
    /// A vCPU inspecting itself while it runs is served without the
    /// run-queue lock.
    pub fn vcpu_runstate_get(&self, v: &Vcpu) -> RunstateInfo {
        let cpu = self.core.platform().processor_id();

        if v.processor() == cpu
            && v.test_flag(VcpuFlags::RUNNING)
            && v.runstate() == Runstate::Running
        {
            return v.runstate.read_own(&OwnRunning::new(), self.core.now());
        }

        let guard = self.core.vcpu_schedule_lock(v);
        v.runstate.read(&guard.token(), self.core.now())
    }

    /// Raise `v`'s pause count and wait until it is descheduled.
    pub fn vcpu_pause(&self, v: &Arc<Vcpu>) {
        if Arc::ptr_eq(v, &self.current()) {
            crate::kpanic!("{} cannot pause itself", v);
        }
        v.inc_pause();
        self.vcpu_sleep_sync(v);
    }

    pub fn vcpu_unpause(&self, v: &Arc<Vcpu>) {
        if v.dec_pause() {
            self.vcpu_wake(v);
        }
    }

    pub fn domain_pause(&self, d: &Domain) {
        if self.current().domain_id() == d.domain_id() {
            crate::kpanic!("domain {} cannot pause itself", d.domain_id());
        }
        d.inc_pause();
        for v in d.vcpus() {
            self.vcpu_sleep_sync(v);
        }
    }

    pub fn domain_unpause(&self, d: &Domain) {
        if d.dec_pause() {
            for v in d.vcpus() {
                self.vcpu_wake(v);
            }
        }
    }

    pub fn domain_pause_by_systemcontroller(&self, d: &Domain) {
        if !d.test_and_set_flag(DomainFlags::CTRL_PAUSE) {
            for v in d.vcpus() {
                self.vcpu_sleep_sync(v);
            }
        }
    }

    /// Release the control-plane pause. New domains start paused this way.
    pub fn domain_unpause_by_systemcontroller(&self, d: &Domain) {
        if d.test_and_clear_flag(DomainFlags::CTRL_PAUSE) {
            for v in d.vcpus() {
                self.vcpu_wake(v);
            }
        }
    }

    /// Take `v` offline at the guest's request.
    pub fn vcpu_down(&self, v: &Arc<Vcpu>) {
        if v.is_idle() {
            return;
        }
        v.set_flag(VcpuFlags::DOWN);
        self.vcpu_sleep_nosync(v);
    }

    /// Bring `v` back online.
    pub fn vcpu_up(&self, v: &Arc<Vcpu>) {
        if v.test_and_clear_flag(VcpuFlags::DOWN) {
            self.vcpu_wake(v);
        }
    }
}
