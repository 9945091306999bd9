//! Application log sinks and the recent-lines tail behind the log page.

use std::fs;

use twallet_log::CapturedLog;

use crate::config::AppConfig;

/// Lines kept in memory for the log page.
pub const LOG_CAPTURE_LINES: usize = 4096;

/// Applies the configured level and format, then routes records to the
/// wallet's log file and the in-memory tail. Stderr stays quiet while the
/// terminal UI owns the screen; see [`release_terminal`].
pub fn install(config: &AppConfig) -> Result<(), String> {
    twallet_log::init(config.log_config());
    if config.log_level.is_none() {
        twallet_log::disable_capture();
        return Ok(());
    }

    let path = config.log_file();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
    }
    twallet_log::set_file(&path)
        .map_err(|err| format!("failed to open log file {}: {err}", path.display()))?;
    twallet_log::enable_capture(LOG_CAPTURE_LINES);
    twallet_log::set_stderr_enabled(false);
    Ok(())
}

/// Sends records to stderr again once the UI has left the terminal.
pub fn release_terminal() {
    twallet_log::set_stderr_enabled(true);
    twallet_log::close_file();
}

/// Up to `limit` of the most recent records, oldest first.
pub fn recent_lines(limit: usize) -> Vec<String> {
    twallet_log::capture_snapshot(limit)
        .iter()
        .map(CapturedLog::render)
        .collect()
}

pub fn clear() {
    twallet_log::clear_captured_logs();
}
