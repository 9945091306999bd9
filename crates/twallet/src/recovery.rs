use std::time::Duration;

use tokio_util::sync::CancellationToken;
use twallet_flnd::rpc::RecoveryInfo;
use twallet_flnd::DaemonError;
use twallet_log::log_debug;

use crate::control::WalletControl;
use crate::error::RescanError;

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// One observation of an ongoing recovery.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RecoveryStatus {
    pub info: RecoveryInfo,
    pub utxo_count: usize,
}

impl RecoveryStatus {
    pub fn is_complete(&self) -> bool {
        self.info.recovery_finished || self.info.progress >= 1.0
    }

    /// A recovery the node is still working through.
    pub fn is_running(&self) -> bool {
        self.info.recovery_mode && !self.info.recovery_finished && self.info.progress < 1.0
    }
}

pub async fn get_recovery_status(
    wallet: &dyn WalletControl,
) -> Result<RecoveryStatus, DaemonError> {
    let info = wallet.recovery_info().await?;
    let utxos = wallet.list_unspent(0, i32::MAX).await?;
    Ok(RecoveryStatus {
        info,
        utxo_count: utxos.len(),
    })
}

/// Polls recovery progress until `on_status` returns false or the node
/// reports the recovery complete. A node between restarts is waited out.
pub async fn monitor_recovery<F>(
    wallet: &dyn WalletControl,
    interval: Duration,
    cancel: &CancellationToken,
    mut on_status: F,
) -> Result<RecoveryStatus, RescanError>
where
    F: FnMut(&RecoveryStatus) -> bool,
{
    let interval = if interval.is_zero() {
        DEFAULT_MONITOR_INTERVAL
    } else {
        interval
    };

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => return Err(RescanError::Cancelled),
            polled = get_recovery_status(wallet) => polled,
        };

        match polled {
            Ok(status) => {
                let keep_going = on_status(&status);
                if !keep_going || status.is_complete() {
                    return Ok(status);
                }
            }
            Err(DaemonError::NotRunning) => {
                log_debug!("recovery monitor: daemon not running, waiting");
            }
            Err(err) => return Err(err.into()),
        }

        pause(cancel, interval).await?;
    }
}

pub(crate) async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<(), RescanError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(RescanError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Keeps the observation with the highest UTXO count so a final snapshot
/// that under-reports never lowers the result.
#[derive(Clone, Debug, Default)]
pub struct BestStatus {
    best: Option<RecoveryStatus>,
    last: Option<RecoveryStatus>,
}

impl BestStatus {
    pub fn record(&mut self, status: &RecoveryStatus) {
        self.last = Some(*status);
        if status.utxo_count == 0 {
            return;
        }
        if self
            .best
            .map_or(true, |best| status.utxo_count >= best.utxo_count)
        {
            self.best = Some(*status);
        }
    }

    pub fn get(&self) -> Option<RecoveryStatus> {
        self.best.or(self.last)
    }
}

pub fn recovery_progress_message(status: &RecoveryStatus) -> String {
    let mut percent = (status.info.progress * 100.0).min(100.0);
    if status.info.recovery_finished {
        percent = 100.0;
    }
    let suffix = if percent > 0.0 {
        format!(" • {percent:.2}% complete")
    } else {
        String::new()
    };
    format!(
        "⏳ Recovery in progress… [{}] UTXO recovered{suffix}",
        status.utxo_count
    )
}

pub fn completion_message(utxo_count: usize) -> String {
    format!("✅ Rescan complete! [{utxo_count}] UTXO recovered")
}

pub fn summary_message(elapsed: Duration, utxo_count: usize) -> String {
    format!(
        "Rescan completed in {}.\nRecovered {utxo_count} UTXOs.",
        human_duration(elapsed)
    )
}

/// Whole seconds in `1h2m3s` form; anything under a second shows as `1s`.
pub fn human_duration(elapsed: Duration) -> String {
    if elapsed.is_zero() {
        return "0s".to_string();
    }
    if elapsed < Duration::from_secs(1) {
        return "1s".to_string();
    }
    let secs = (elapsed.as_millis() + 500) / 1000;
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
