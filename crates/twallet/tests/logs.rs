use std::fs;

use twallet::config::{default_config, LOG_FILE_NAME};
use twallet::logs;
use twallet_log::{log_debug, log_info, log_warn, Level};

// Logging state is process global, so every step lives in one test.
#[test]
fn installed_sinks_feed_the_log_page_and_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = default_config();
    config.service.wallet_dir = dir.path().join("wallet");
    config.log_level = Some(Level::Info);
    logs::install(&config).expect("install");
    assert!(config.log_file().ends_with(LOG_FILE_NAME));

    log_debug!("below the configured level");
    log_info!("wallet page opened");
    log_warn!("node restarting");
    log_info!("balance refreshed");

    let tail = logs::recent_lines(2);
    assert_eq!(tail.len(), 2);
    assert!(tail[0].contains("WARN") && tail[0].ends_with("node restarting"), "{tail:?}");
    assert!(tail[1].ends_with("balance refreshed"), "{tail:?}");
    assert_eq!(logs::recent_lines(10).len(), 3);

    logs::clear();
    assert!(logs::recent_lines(10).is_empty());

    logs::release_terminal();
    let written = fs::read_to_string(config.log_file()).expect("log file");
    assert!(written.contains("wallet page opened"));
    assert!(written.contains("balance refreshed"));
    assert!(!written.contains("below the configured level"));
}
