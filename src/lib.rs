//! hvsched - generic vCPU scheduling core
//!
//! Multiplexes physical CPUs across the virtual CPUs of isolated guest
//! domains. The decision of *which* vCPU runs next belongs to a pluggable
//! policy selected at boot; this crate owns everything around that decision:
//! run-state accounting, per-pCPU run queues and their timers, the
//! block/wake/poll/yield primitives, the dispatch protocol and the
//! domain-wide parameter adjustment choreography.
//!
//! The crate is `no_std`. Everything architecture specific (context switch,
//! IPIs, the clock, virtual interrupt injection) is reached through the
//! [`platform::Platform`] trait.

#![no_std]

extern crate alloc;

pub mod config;
pub mod domain;
pub mod event;
pub mod hypercall;
pub mod logger;
pub mod platform;
pub mod posix;
pub mod scheduler;

pub use config::BootOptions;
pub use domain::{CpuMask, Domain, DomainFlags, Vcpu, VcpuFlags};
pub use platform::{ContextSaved, Platform};
pub use scheduler::{Scheduler, SchedError};

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        $crate::logger::log($level, format_args!($($arg)*));
    }};
}

/// Log at PANIC level and abort the current thread of control.
///
/// Reserved for scheduler contract violations: continuing with corrupted
/// scheduling state risks cross-domain isolation failures.
#[macro_export]
macro_rules! kpanic {
    ($($arg:tt)*) => {
        $crate::logger::bug(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::FATAL, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::ERROR, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::WARN, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::INFO, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::DEBUG, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!($crate::logger::LogLevel::TRACE, $($arg)*);
    }};
}
