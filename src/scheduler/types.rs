//! Scheduler type definitions
//!
//! This module contains the types and design constants shared by the
//! dispatcher, the timers and the scheduling policies.

use alloc::sync::Arc;
use core::fmt;

use crate::domain::Vcpu;
use crate::posix::errno;

/// System time in nanoseconds since boot. Signed so deltas and guest
/// supplied deadlines in the past stay representable.
pub type STime = i64;

pub type CpuId = usize;
pub type DomId = u16;
pub type VcpuId = usize;
pub type EvtchnPort = u32;

/// Maximum number of physical CPUs the scheduler manages
pub const MAX_CPUS: usize = 64;

/// Maximum number of vCPUs in one domain
pub const MAX_VIRT_CPUS: usize = 32;

/// Maximum number of live guest domains
pub const MAX_DOMAINS: usize = 64;

/// Number of event ports per domain
pub const MAX_EVTCHNS: u32 = 1024;

/// Upper bound on the port list of a single poll request
pub const MAX_POLL_PORTS: u32 = 128;

/// Domain id of the per-pCPU idle vCPUs
pub const IDLE_DOMAIN_ID: DomId = 0x7FFF;

/// Period of the per-pCPU tick timer
pub const TICK_PERIOD: STime = millisecs(10);

pub const fn millisecs(ms: i64) -> STime {
    ms * 1_000_000
}

pub const fn microsecs(us: i64) -> STime {
    us * 1_000
}

/// vCPU run states. The ordering matters: everything `>= Blocked` is a
/// state from which a wake-up moves the vCPU to `Runnable`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Runstate {
    Running = 0,
    Runnable = 1,
    Blocked = 2,
    Offline = 3,
}

pub const NR_RUNSTATES: usize = 4;

impl Runstate {
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Runstate::Running,
            1 => Runstate::Runnable,
            2 => Runstate::Blocked,
            _ => Runstate::Offline,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Runstate::Running => "running",
            Runstate::Runnable => "runnable",
            Runstate::Blocked => "blocked",
            Runstate::Offline => "offline",
        }
    }
}

/// Output of a policy decision: the vCPU to run and for how long.
#[derive(Clone)]
pub struct TaskSlice {
    pub task: Arc<Vcpu>,
    pub time: STime,
}

/// Error type for scheduler operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Bad argument from the caller
    InvalidArgument,
    /// Guest memory could not be read
    Fault,
    /// Caller lacks the privilege for the operation
    PermissionDenied,
    /// No domain with the requested id
    NoSuchDomain,
    /// A fixed-size table is full
    NoMemory,
    /// The vCPU is executing and cannot be changed now
    Busy,
    /// Unknown operation
    NotImplemented,
}

impl SchedError {
    /// Convert to a negative POSIX errno value
    pub fn to_errno(&self) -> i64 {
        let code = match self {
            SchedError::InvalidArgument => errno::EINVAL,
            SchedError::Fault => errno::EFAULT,
            SchedError::PermissionDenied => errno::EPERM,
            SchedError::NoSuchDomain => errno::ESRCH,
            SchedError::NoMemory => errno::ENOMEM,
            SchedError::Busy => errno::EBUSY,
            SchedError::NotImplemented => errno::ENOSYS,
        };
        -(code as i64)
    }
}

/// Direction of a parameter access
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedInfoDirection {
    Put,
    Get,
}

/// Policy specific per-domain parameters carried by `adjdom`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjdomParams {
    Credit { weight: u16, cap: u16 },
    Rrobin { slice: STime },
}

/// Policy specific global parameters carried by `sched_ctl`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedCtlParams {
    Credit { tslice: STime },
    Rrobin { default_slice: STime },
}

/// Control-plane request against the active policy as a whole
#[derive(Clone, Copy, Debug)]
pub struct SchedCtlCmd {
    pub sched_id: u32,
    pub direction: SchedInfoDirection,
    pub params: SchedCtlParams,
}

/// Control-plane request against one domain's parameters
#[derive(Clone, Copy, Debug)]
pub struct SchedAdjdomCmd {
    pub sched_id: u32,
    pub domain: DomId,
    pub direction: SchedInfoDirection,
    pub params: AdjdomParams,
}

/// How a poll request ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// A requested port was (or became) pending
    Event,
    /// The poll timeout fired first
    TimedOut,
}

/// Guest-memory array reference. A `None` buffer models an unmapped
/// guest address.
pub struct GuestHandle<'a, T> {
    buf: Option<&'a [T]>,
}

impl<T> Clone for GuestHandle<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for GuestHandle<'_, T> {}

impl<T> fmt::Debug for GuestHandle<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.buf {
            Some(buf) => write!(f, "GuestHandle({} elems)", buf.len()),
            None => write!(f, "GuestHandle(bad)"),
        }
    }
}

impl<'a, T: Copy> GuestHandle<'a, T> {
    pub fn new(buf: &'a [T]) -> Self {
        Self { buf: Some(buf) }
    }

    /// Handle whose memory cannot be read.
    pub fn bad() -> Self {
        Self { buf: None }
    }

    /// Whether `nr` elements are readable.
    pub fn okay(&self, nr: usize) -> bool {
        self.buf.is_some_and(|buf| nr <= buf.len())
    }

    /// Read the element at `idx`.
    pub fn copy_from_offset(&self, idx: usize) -> Result<T, SchedError> {
        self.buf
            .and_then(|buf| buf.get(idx).copied())
            .ok_or(SchedError::Fault)
    }

    /// Read the first element.
    pub fn copy_from_guest(&self) -> Result<T, SchedError> {
        self.copy_from_offset(0)
    }
}

/// `SCHEDOP_poll` argument
#[derive(Clone, Copy, Debug)]
pub struct SchedPoll<'a> {
    pub ports: GuestHandle<'a, EvtchnPort>,
    pub nr_ports: u32,
    /// Absolute system time; 0 waits forever
    pub timeout: STime,
}
