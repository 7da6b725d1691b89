//! Scheduling hypercall ABI
//!
//! Guest-facing entry points. Arguments arrive through [`GuestHandle`]s
//! that may fail to read; results are 0 or a negative errno.

use crate::scheduler::types::{DomId, STime, SchedError};

pub use crate::scheduler::types::{GuestHandle, SchedPoll};
use crate::scheduler::Scheduler;

/// `SCHEDOP_*` command numbers
pub mod cmd {
    pub const SCHEDOP_YIELD: u32 = 0;
    pub const SCHEDOP_BLOCK: u32 = 1;
    pub const SCHEDOP_SHUTDOWN: u32 = 2;
    pub const SCHEDOP_POLL: u32 = 3;
    pub const SCHEDOP_REMOTE_SHUTDOWN: u32 = 4;
}

/// `SCHEDOP_shutdown` argument
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedShutdown {
    pub reason: u8,
}

/// `SCHEDOP_remote_shutdown` argument
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedRemoteShutdown {
    pub domain_id: DomId,
    pub reason: u8,
}

/// Decoded `sched_op` request
#[derive(Clone, Copy, Debug)]
pub enum SchedOp<'a> {
    Yield,
    Block,
    Shutdown(GuestHandle<'a, SchedShutdown>),
    Poll(GuestHandle<'a, SchedPoll<'a>>),
    RemoteShutdown(GuestHandle<'a, SchedRemoteShutdown>),
}

impl SchedOp<'_> {
    pub fn cmd(&self) -> u32 {
        match self {
            SchedOp::Yield => cmd::SCHEDOP_YIELD,
            SchedOp::Block => cmd::SCHEDOP_BLOCK,
            SchedOp::Shutdown(_) => cmd::SCHEDOP_SHUTDOWN,
            SchedOp::Poll(_) => cmd::SCHEDOP_POLL,
            SchedOp::RemoteShutdown(_) => cmd::SCHEDOP_REMOTE_SHUTDOWN,
        }
    }
}

fn ret(result: Result<(), SchedError>) -> i64 {
    match result {
        Ok(()) => 0,
        Err(err) => err.to_errno(),
    }
}

impl Scheduler {
    /// `sched_op` hypercall issued by the current vCPU.
    pub fn do_sched_op(&self, op: SchedOp<'_>) -> i64 {
        match op {
            SchedOp::Yield => {
                self.do_yield();
                0
            }
            SchedOp::Block => {
                self.do_block();
                0
            }
            SchedOp::Shutdown(arg) => ret(self.sched_op_shutdown(arg)),
            SchedOp::Poll(arg) => ret(arg
                .copy_from_guest()
                .and_then(|poll| self.do_poll(&poll))
                .map(|_| ())),
            SchedOp::RemoteShutdown(arg) => ret(self.sched_op_remote_shutdown(arg)),
        }
    }

    fn sched_op_shutdown(&self, arg: GuestHandle<'_, SchedShutdown>) -> Result<(), SchedError> {
        let shutdown = arg.copy_from_guest()?;
        let d = self.current().domain().ok_or(SchedError::NoSuchDomain)?;

        crate::ktrace!("sched_op shutdown: dom {} reason {}", d.domain_id(), shutdown.reason);
        self.domain_shutdown(&d, shutdown.reason);
        Ok(())
    }

    fn sched_op_remote_shutdown(
        &self,
        arg: GuestHandle<'_, SchedRemoteShutdown>,
    ) -> Result<(), SchedError> {
        let caller = self.current().domain().ok_or(SchedError::PermissionDenied)?;
        if !caller.is_privileged() {
            return Err(SchedError::PermissionDenied);
        }

        let req = arg.copy_from_guest()?;
        let d = self.domain_by_id(req.domain_id).ok_or(SchedError::NoSuchDomain)?;

        self.domain_shutdown(&d, req.reason);
        Ok(())
    }

    /// Legacy `sched_op` with the argument passed by value.
    pub fn do_sched_op_compat(&self, cmd: u32, arg: u64) -> i64 {
        match cmd {
            cmd::SCHEDOP_YIELD => {
                self.do_yield();
                0
            }
            cmd::SCHEDOP_BLOCK => {
                self.do_block();
                0
            }
            cmd::SCHEDOP_SHUTDOWN => {
                let reason = arg as u8;
                match self.current().domain() {
                    Some(d) => {
                        self.domain_shutdown(&d, reason);
                        0
                    }
                    None => SchedError::NoSuchDomain.to_errno(),
                }
            }
            _ => SchedError::NotImplemented.to_errno(),
        }
    }

    /// `set_timer_op` hypercall: arm the current vCPU's one-shot timer for
    /// the absolute time `timeout`; 0 cancels.
    pub fn do_set_timer_op(&self, timeout: STime) -> i64 {
        self.set_vcpu_timer(timeout);
        0
    }
}
