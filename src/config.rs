//! Boot-time scheduler options
//!
//! Parsed from the hypervisor command line, e.g.
//! `sched=rrobin loglevel=debug`.

use crate::logger::{self, LogLevel};

/// Longest scheduler keyword accepted on the command line.
pub const SCHED_OPT_LEN: usize = 16;

/// Scheduler keyword used when the command line does not name one.
pub const DEFAULT_SCHED: &str = "credit";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BootOptions {
    sched: [u8; SCHED_OPT_LEN],
    sched_len: usize,
    /// Log level requested with `loglevel=`/`log=`, if any.
    pub log_level: Option<LogLevel>,
}

impl Default for BootOptions {
    fn default() -> Self {
        let mut opts = Self {
            sched: [0; SCHED_OPT_LEN],
            sched_len: 0,
            log_level: None,
        };
        opts.set_sched(DEFAULT_SCHED);
        opts
    }
}

impl BootOptions {
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut opts = Self::default();

        for token in cmdline.split_whitespace() {
            if let Some(value) = token.strip_prefix("sched=") {
                opts.set_sched(value);
            }
        }
        opts.log_level = logger::parse_level_directive(cmdline);

        opts
    }

    /// Options selecting the named scheduler, everything else default.
    pub fn with_sched(name: &str) -> Self {
        let mut opts = Self::default();
        opts.set_sched(name);
        opts
    }

    /// Scheduler keyword. Over-long keywords are truncated, like the fixed
    /// `opt_sched` buffer they are copied into.
    pub fn sched(&self) -> &str {
        core::str::from_utf8(&self.sched[..self.sched_len]).unwrap_or("")
    }

    fn set_sched(&mut self, name: &str) {
        let mut len = name.len().min(SCHED_OPT_LEN);
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        self.sched = [0; SCHED_OPT_LEN];
        self.sched[..len].copy_from_slice(&name.as_bytes()[..len]);
        self.sched_len = len;
    }

    /// Apply the global side effects of these options (log level).
    pub fn apply(&self) {
        if let Some(level) = self.log_level {
            logger::set_max_level(level);
        }
    }
}
