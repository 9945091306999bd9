//! Application core of the terminal wallet: configuration, startup with
//! cache recovery, the user-requested rescan and the notification layer
//! between the node supervisor and the pages.

pub mod boot;
pub mod config;
pub mod control;
pub mod error;
pub mod health;
pub mod logs;
pub mod notify;
pub mod progress;
pub mod recovery;
pub mod rescan;
pub mod wait;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use boot::{lock_wallet_dir, Boot, BootOutcome, RecoveryTrigger, ServiceFactory};
pub use config::{parse_args, parse_args_from, AddressKind, AppConfig, CliAction};
pub use control::{Watch, WalletControl};
pub use error::RescanError;
pub use health::{check_wallet_health, WalletHealth};
pub use notify::{HealthLevel, HealthState, Notifier, NotifyEvent, WalletCache, WalletEvent};
pub use progress::{ProgressLog, ProgressSink, RescanEvent};
pub use recovery::{get_recovery_status, monitor_recovery, RecoveryStatus};
pub use rescan::{Rescan, RescanSettings, RescanSummary};
pub use wait::{unlock_wallet, wait_for_unlock, wait_for_wallet_ready, WaitError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
