//! Kernel log sink.
//!
//! The subsystem has no direct device access, so log lines are buffered in
//! a bounded in-memory ring; the embedding kernel drains it to whatever
//! console it owns. Teardown paths log and keep going, they never abort.

use alloc::collections::VecDeque;
use alloc::string::String;
use core::fmt;
use core::fmt::Write;
use lazy_static::lazy_static;
use spin::Mutex;

const LOG_CAPACITY: usize = 256;

pub struct LogBuffer {
    lines: VecDeque<String>,
}

impl LogBuffer {
    pub fn new() -> Self {
        LogBuffer { lines: VecDeque::new() }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == LOG_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// Remove and return every buffered line, oldest first.
    pub fn drain(&mut self) -> VecDeque<String> {
        core::mem::take(&mut self.lines)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

lazy_static! {
    pub static ref KLOG: Mutex<LogBuffer> = Mutex::new(LogBuffer::new());
}

#[doc(hidden)]
pub fn _log(level: &str, args: fmt::Arguments) {
    let mut line = String::new();
    let _ = write!(line, "[{}] ", level);
    let _ = line.write_fmt(args);
    KLOG.lock().push(line);
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::klog::_log("INFO", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::klog::_log("WARN", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::klog::_log("ERROR", format_args!($($arg)*))
    };
}
