//! File logger for the scheduler and CLI.
//!
//! `init_in` points the logger at `<state dir>/grove.log`; before that every
//! macro is a no-op. The threshold is INFO, DEBUG with `--debug` or
//! `GROVE_DEBUG=1`, and `GROVE_LOG=<level>` names one explicitly.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_FILE: OnceLock<PathBuf> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    /// Case-insensitive level name, as accepted by `GROVE_LOG`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Level::Error),
            "warn" | "warning" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            "trace" => Some(Level::Trace),
            _ => None,
        }
    }
}

fn threshold_from_env(debug: bool) -> Level {
    if let Some(level) = std::env::var("GROVE_LOG").ok().as_deref().and_then(Level::parse) {
        return level;
    }
    let env_debug = std::env::var("GROVE_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug || env_debug {
        Level::Debug
    } else {
        Level::Info
    }
}

/// Start logging to `<dir>/grove.log`. The previous run's log is kept as
/// `grove.log.1`. Only the first call takes effect.
pub fn init_in(dir: &Path, debug: bool) {
    THRESHOLD.store(threshold_from_env(debug) as u8, Ordering::SeqCst);
    if LOG_FILE.get().is_some() {
        return;
    }
    let _ = fs::create_dir_all(dir);
    let path = dir.join("grove.log");
    if path.exists() {
        let _ = fs::rename(&path, dir.join("grove.log.1"));
    }
    LOG_FILE.set(path).ok();
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn write(level: Level, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_FILE.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(file, "{} {:<5} {}", now, level.label(), args);
    }
}

#[macro_export]
macro_rules! glog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! glog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! glog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! glog_debug {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Debug, format_args!($($arg)*))
    };
}

/// Per-tick bookkeeping; off unless `GROVE_LOG=trace`.
#[macro_export]
macro_rules! glog_trace {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::Level::Trace, format_args!($($arg)*))
    };
}
