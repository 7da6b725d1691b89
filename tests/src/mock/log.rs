//! Log capture
//!
//! Routes scheduler log records into memory. The sink is process-wide, so
//! tests that capture must be `#[serial]`.

use std::fmt;
use std::sync::Mutex;

use hvsched::logger::{self, LogLevel};

static RECORDS: Mutex<Vec<(LogLevel, String)>> = Mutex::new(Vec::new());

fn sink(level: LogLevel, args: fmt::Arguments<'_>) {
    let mut records = RECORDS.lock().unwrap_or_else(|e| e.into_inner());
    records.push((level, args.to_string()));
}

/// Active capture; the sink is removed when dropped.
pub struct LogCapture {
    _private: (),
}

pub fn capture() -> LogCapture {
    RECORDS.lock().unwrap_or_else(|e| e.into_inner()).clear();
    logger::set_sink(sink);
    LogCapture { _private: () }
}

impl LogCapture {
    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        RECORDS.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(l, line)| *l == level && line.contains(needle))
    }

    pub fn count(&self, level: LogLevel) -> usize {
        self.lines().iter().filter(|(l, _)| *l == level).count()
    }
}

impl Drop for LogCapture {
    fn drop(&mut self) {
        logger::clear_sink();
    }
}
