use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// Accepts the node's debug-level vocabulary as well (`critical`, `crit`).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" | "err" | "critical" | "crit" => Some(Self::Error),
            "warn" | "warning" | "wrn" => Some(Self::Warn),
            "info" | "inf" => Some(Self::Info),
            "debug" | "dbg" => Some(Self::Debug),
            "trace" | "trc" => Some(Self::Trace),
            _ => None,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Error),
            2 => Some(Self::Warn),
            3 => Some(Self::Info),
            4 => Some(Self::Debug),
            5 => Some(Self::Trace),
            _ => None,
        }
    }
}

/// Parses a level filter; `Ok(None)` means logging is switched off.
pub fn parse_filter(raw: &str) -> Result<Option<Level>, String> {
    if raw.trim().eq_ignore_ascii_case("off") {
        return Ok(None);
    }
    Level::parse(raw)
        .map(Some)
        .ok_or_else(|| format!("invalid log level '{}'", raw.trim()))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Format {
    Text = 0,
    Json = 1,
}

impl Format {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LogConfig {
    /// `None` disables every sink.
    pub level: Option<Level>,
    pub format: Format,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Some(Level::Info),
            format: Format::Text,
            timestamps: true,
        }
    }
}

const LEVEL_OFF: u8 = 0;

static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);
static LOG_FORMAT: AtomicU8 = AtomicU8::new(Format::Text as u8);
static LOG_TIMESTAMPS: AtomicBool = AtomicBool::new(true);
static LOG_STDERR_ENABLED: AtomicBool = AtomicBool::new(true);
static LOG_FILE: OnceLock<Mutex<Option<File>>> = OnceLock::new();

#[derive(Clone, Debug)]
pub struct CapturedLog {
    pub ts_ms: u64,
    pub level: Level,
    pub target: &'static str,
    pub msg: String,
}

impl CapturedLog {
    /// Single text line as shown by the log viewer.
    pub fn render(&self) -> String {
        let ts = Timestamp {
            unix_seconds: self.ts_ms / 1000,
            millis: (self.ts_ms % 1000) as u32,
        };
        format!(
            "{ts} {} {}: {}",
            self.level.as_str(),
            component(self.target),
            self.msg
        )
    }
}

static LOG_CAPTURE_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_CAPTURE_CAPACITY: AtomicUsize = AtomicUsize::new(0);
static LOG_CAPTURE: OnceLock<Mutex<VecDeque<CapturedLog>>> = OnceLock::new();

pub fn init(config: LogConfig) {
    let level = config.level.map(|level| level as u8).unwrap_or(LEVEL_OFF);
    LOG_LEVEL.store(level, Ordering::Relaxed);
    LOG_FORMAT.store(config.format as u8, Ordering::Relaxed);
    LOG_TIMESTAMPS.store(config.timestamps, Ordering::Relaxed);
}

pub fn current_level() -> Option<Level> {
    Level::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Appends every record to `path` in text form, creating the file if needed.
pub fn set_file(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let slot = LOG_FILE.get_or_init(|| Mutex::new(None));
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(file);
    }
    Ok(())
}

pub fn close_file() {
    let Some(slot) = LOG_FILE.get() else {
        return;
    };
    if let Ok(mut guard) = slot.lock() {
        if let Some(mut file) = guard.take() {
            let _ = file.flush();
        }
    }
}

pub fn enable_capture(capacity: usize) {
    if capacity == 0 {
        disable_capture();
        return;
    }
    LOG_CAPTURE_CAPACITY.store(capacity, Ordering::Relaxed);
    LOG_CAPTURE.get_or_init(|| Mutex::new(VecDeque::with_capacity(capacity.min(4096))));
    LOG_CAPTURE_ENABLED.store(true, Ordering::Relaxed);
}

pub fn disable_capture() {
    LOG_CAPTURE_ENABLED.store(false, Ordering::Relaxed);
}

pub fn clear_captured_logs() {
    let Some(buf) = LOG_CAPTURE.get() else {
        return;
    };
    if let Ok(mut guard) = buf.lock() {
        guard.clear();
    }
}

/// Off while a full-screen UI owns the terminal.
pub fn set_stderr_enabled(enabled: bool) {
    LOG_STDERR_ENABLED.store(enabled, Ordering::Relaxed);
}

pub fn capture_snapshot(limit: usize) -> Vec<CapturedLog> {
    let Some(buf) = LOG_CAPTURE.get() else {
        return Vec::new();
    };
    let Ok(guard) = buf.lock() else {
        return Vec::new();
    };
    let len = guard.len();
    let start = len.saturating_sub(limit);
    guard.iter().skip(start).cloned().collect()
}

pub fn enabled(level: Level) -> bool {
    level as u8 <= LOG_LEVEL.load(Ordering::Relaxed)
}

pub fn log(
    level: Level,
    target: &'static str,
    file: &'static str,
    line: u32,
    args: fmt::Arguments<'_>,
) {
    if !enabled(level) {
        return;
    }

    let format = match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => Format::Json,
        _ => Format::Text,
    };
    let timestamps = LOG_TIMESTAMPS.load(Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ts_ms: u64 = now.as_millis().try_into().unwrap_or(u64::MAX);
    let ts = Timestamp {
        unix_seconds: now.as_secs(),
        millis: now.subsec_millis(),
    };
    let msg = args.to_string();

    if LOG_STDERR_ENABLED.load(Ordering::Relaxed) {
        let mut out = io::stderr().lock();
        match format {
            Format::Text => {
                if timestamps {
                    let _ = write!(out, "{ts} ");
                }
                let _ = writeln!(out, "{} {}: {msg}", level.as_str(), component(target));
            }
            Format::Json => {
                let record = json!({
                    "ts_ms": ts_ms,
                    "level": level.as_str(),
                    "target": target,
                    "file": file,
                    "line": line,
                    "msg": msg,
                });
                let _ = writeln!(out, "{record}");
            }
        }
    }

    if let Some(slot) = LOG_FILE.get() {
        if let Ok(mut guard) = slot.lock() {
            if let Some(out) = guard.as_mut() {
                let _ = writeln!(
                    out,
                    "{ts} {} {}: {msg}",
                    level.as_str(),
                    component(target)
                );
            }
        }
    }

    if LOG_CAPTURE_ENABLED.load(Ordering::Relaxed) {
        let Some(buf) = LOG_CAPTURE.get() else {
            return;
        };
        let Ok(mut guard) = buf.lock() else {
            return;
        };
        let cap = LOG_CAPTURE_CAPACITY.load(Ordering::Relaxed);
        if cap == 0 {
            return;
        }
        guard.push_back(CapturedLog {
            ts_ms,
            level,
            target,
            msg,
        });
        while guard.len() > cap {
            let _ = guard.pop_front();
        }
    }
}

/// Short component tag for a module path: `twallet_flnd::service` -> `FLND`.
pub fn component(target: &str) -> &'static str {
    let krate = target.split("::").next().unwrap_or(target);
    match krate {
        "twallet_flnd" => "FLND",
        "twallet" => "TWLT",
        _ => "MISC",
    }
}

#[macro_export]
macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if $crate::enabled($level) {
            $crate::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        $crate::log_at!($crate::Level::Trace, $($arg)*);
    }};
}

/// `HH:MM:SS` wall-clock time (UTC) used to prefix progress lines.
pub fn clock_time(at: SystemTime) -> String {
    let secs = at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

struct Timestamp {
    unix_seconds: u64,
    millis: u32,
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SECS_PER_DAY: u64 = 86_400;
        let days = (self.unix_seconds / SECS_PER_DAY) as i64;
        let secs_of_day = self.unix_seconds % SECS_PER_DAY;
        let (year, month, day) = civil_from_days(days);
        write!(
            f,
            "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}.{:03}",
            secs_of_day / 3600,
            (secs_of_day % 3600) / 60,
            secs_of_day % 60,
            self.millis
        )
    }
}

fn civil_from_days(days_since_unix_epoch: i64) -> (i32, u32, u32) {
    // Howard Hinnant's days-to-civil conversion.
    let z = days_since_unix_epoch + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe as i32) + (era as i32) * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = y + if m <= 2 { 1 } else { 0 };
    (year, m, d)
}
