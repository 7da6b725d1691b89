//! Leveled scheduler log
//!
//! Records are filtered against a runtime maximum level and handed to a
//! single registered sink. The hypervisor image points the sink at its
//! serial console; with no sink registered, records are dropped.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::RwLock;

#[cfg(not(feature = "debug_verbose"))]
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::INFO.priority());
#[cfg(feature = "debug_verbose")]
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::DEBUG.priority());

/// Destination for log records.
pub type LogSink = fn(LogLevel, fmt::Arguments<'_>);

static SINK: RwLock<Option<LogSink>> = RwLock::new(None);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    PANIC,
    FATAL,
    ERROR,
    WARN,
    INFO,
    DEBUG,
    TRACE,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::PANIC => "PANIC",
            LogLevel::FATAL => "FATAL",
            LogLevel::ERROR => "ERROR",
            LogLevel::WARN => "WARN",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
            LogLevel::TRACE => "TRACE",
        }
    }

    const fn priority(self) -> u8 {
        match self {
            LogLevel::PANIC => 0,
            LogLevel::FATAL => 1,
            LogLevel::ERROR => 2,
            LogLevel::WARN => 3,
            LogLevel::INFO => 4,
            LogLevel::DEBUG => 5,
            LogLevel::TRACE => 6,
        }
    }

    fn from_priority(value: u8) -> Self {
        match value {
            0 => LogLevel::PANIC,
            1 => LogLevel::FATAL,
            2 => LogLevel::ERROR,
            3 => LogLevel::WARN,
            4 => LogLevel::INFO,
            5 => LogLevel::DEBUG,
            _ => LogLevel::TRACE,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("panic") {
            Some(LogLevel::PANIC)
        } else if value.eq_ignore_ascii_case("fatal") {
            Some(LogLevel::FATAL)
        } else if value.eq_ignore_ascii_case("error") {
            Some(LogLevel::ERROR)
        } else if value.eq_ignore_ascii_case("warn") || value.eq_ignore_ascii_case("warning") {
            Some(LogLevel::WARN)
        } else if value.eq_ignore_ascii_case("info") {
            Some(LogLevel::INFO)
        } else if value.eq_ignore_ascii_case("debug") {
            Some(LogLevel::DEBUG)
        } else if value.eq_ignore_ascii_case("trace") {
            Some(LogLevel::TRACE)
        } else {
            None
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    let current = LOG_LEVEL.load(Ordering::Relaxed);
    if level.priority() > current {
        return;
    }

    if let Some(sink) = *SINK.read() {
        sink(level, args);
    }
}

/// Emit the PANIC records for a scheduler bug at the caller's location,
/// then panic with the same message. Backs `kpanic!`.
#[doc(hidden)]
#[track_caller]
pub fn bug(args: fmt::Arguments<'_>) -> ! {
    let loc = core::panic::Location::caller();
    log(LogLevel::PANIC, format_args!("------------[ cut here ]------------"));
    log(
        LogLevel::PANIC,
        format_args!("Scheduler BUG at {}:{}: {}", loc.file(), loc.line(), args),
    );
    panic!("{}", args)
}

/// Register the record sink, replacing any previous one.
pub fn set_sink(sink: LogSink) {
    *SINK.write() = Some(sink);
}

/// Drop the registered sink; subsequent records are discarded.
pub fn clear_sink() {
    *SINK.write() = None;
}

pub fn set_max_level(level: LogLevel) {
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

pub fn max_level() -> LogLevel {
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn enabled(level: LogLevel) -> bool {
    level.priority() <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn parse_level_directive(cmdline: &str) -> Option<LogLevel> {
    for token in cmdline.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if key.eq_ignore_ascii_case("log") || key.eq_ignore_ascii_case("loglevel") {
                if let Some(level) = LogLevel::from_str(value) {
                    return Some(level);
                }
            }
        }
    }
    None
}
