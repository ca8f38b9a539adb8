//! File logging for the orchestrator.
//!
//! Every line carries the emitting module, so the two processor loops can
//! be told apart in `~/.devteam/devteam.log`:
//!
//! ```text
//! [14:02:11.532] [INFO ] orchestration::task_processor: Processing task 1a2b3c4d (feature)
//! ```
//!
//! The threshold is INFO, DEBUG with `--debug` or `DEVTEAM_DEBUG=1`, and
//! `DEVTEAM_LOG=<level>` overrides both.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static THRESHOLD: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Failures a loop recovered from.
    Error = 0,
    /// Stalled workflows, late results, refused shutdowns.
    Warn = 1,
    /// Task and workflow lifecycle.
    Info = 2,
    /// Step dispatch and agent traffic.
    Debug = 3,
    /// Per-pass processor state.
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = match s.trim().to_ascii_uppercase().as_str() {
            "WARNING" => "WARN".to_string(),
            other => other.to_string(),
        };
        Self::ALL
            .into_iter()
            .find(|level| level.label() == wanted)
            .ok_or_else(|| crate::Error::Validation(format!("unknown log level: {}", s)))
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Choose the threshold and truncate the log file.
pub fn init_with_debug(debug: bool) {
    let mut level = if debug || env_flag("DEVTEAM_DEBUG") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    if let Some(explicit) = std::env::var("DEVTEAM_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
    {
        level = explicit;
    }
    set_threshold(level);

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".devteam")) {
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("devteam.log");
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

pub fn set_threshold(level: LogLevel) {
    THRESHOLD.store(level as u8, Ordering::SeqCst);
}

pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

/// `devteam::workflow::engine` becomes `workflow::engine`.
fn short_target(module: &str) -> &str {
    module
        .split_once("::")
        .map_or(module, |(_, rest)| rest)
}

pub fn format_line(level: LogLevel, module: &str, msg: &str) -> String {
    format!(
        "[{}] [{:<5}] {}: {}",
        chrono::Local::now().format("%H:%M:%S%.3f"),
        level.label(),
        short_target(module),
        msg
    )
}

/// Append one line. Dropped until [`init_with_debug`] has picked a file.
pub fn write(level: LogLevel, module: &str, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", format_line(level, module, msg));
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __dlog_at {
    ($level:expr, $($arg:tt)*) => {
        if $crate::log::enabled($level) {
            $crate::log::write($level, module_path!(), &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! dlog {
    ($($arg:tt)*) => { $crate::__dlog_at!($crate::log::LogLevel::Info, $($arg)*) };
}

#[macro_export]
macro_rules! dlog_error {
    ($($arg:tt)*) => { $crate::__dlog_at!($crate::log::LogLevel::Error, $($arg)*) };
}

#[macro_export]
macro_rules! dlog_warn {
    ($($arg:tt)*) => { $crate::__dlog_at!($crate::log::LogLevel::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! dlog_debug {
    ($($arg:tt)*) => { $crate::__dlog_at!($crate::log::LogLevel::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! dlog_trace {
    ($($arg:tt)*) => { $crate::__dlog_at!($crate::log::LogLevel::Trace, $($arg)*) };
}
