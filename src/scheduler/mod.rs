//! Scheduler subsystem
//!
//! Generic vCPU scheduling core. The policy decides which vCPU runs next;
//! this module owns the run-state machine around that decision.
//!
//! ## Per-CPU Architecture
//!
//! - Each pCPU has a run queue whose lock serializes every scheduling
//!   decision for it and guards the run state of vCPUs bound to it
//! - There is no global scheduling lock; cross-pCPU requests raise the
//!   target's scheduling softirq and interrupt it with an IPI
//! - Timers never call the dispatcher directly, they raise the softirq
//!
//! ## Module Organization
//!
//! - `types`: Type definitions and design constants
//! - `runstate`: Per-vCPU run-state accounting
//! - `timer`: Countdown timers
//! - `percpu`: Per-CPU run queues and counters
//! - `ops`: Policy interface and registry
//! - `core`: Bootstrap, dispatcher, softirq and timer handlers
//! - `vcpu`: Sleep, wake, pause and run-state queries
//! - `wait`: Block, poll, yield and the guest one-shot timer
//! - `table`: Domain table and domain lifecycle
//! - `smp`: CPU affinity and migration
//! - `control`: Control-plane parameter access
//! - `stats`: Statistics and run-queue dump
//! - `policies`: Built-in policies

mod control;
mod core;
pub mod ops;
pub mod percpu;
pub mod policies;
pub mod runstate;
mod smp;
mod stats;
mod table;
pub mod timer;
pub mod types;
mod vcpu;
mod wait;

pub use self::core::{SchedCore, Scheduler};
pub use ops::{SchedulerDef, SchedulerOps, FALLBACK_SCHED, SCHEDULERS};
pub use percpu::{PerCpuRunQueue, PerCpuStats, SchedLock};
pub use runstate::RunstateInfo;
pub use table::DomainConfig;
pub use timer::{Timer, TimerRole};
pub use types::{
    AdjdomParams, PollOutcome, Runstate, SchedAdjdomCmd, SchedCtlCmd, SchedCtlParams,
    SchedError, SchedInfoDirection, TaskSlice,
};
