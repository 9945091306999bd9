use std::time::Duration;

use tokio_util::sync::CancellationToken;
use twallet_flnd::Status;

use crate::control::{Watch, WalletControl};

pub const STARTUP_HEALTH_TIMEOUT: Duration = Duration::from_secs(20);

/// Availability of the wallet service after a (re)start.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WalletHealth {
    pub healthy: bool,
    pub state: Status,
    pub reason: Option<String>,
}

impl WalletHealth {
    fn healthy(state: Status) -> Self {
        Self {
            healthy: true,
            state,
            reason: None,
        }
    }

    fn unhealthy(state: Status, reason: impl Into<String>) -> Self {
        Self {
            healthy: false,
            state,
            reason: Some(reason.into()),
        }
    }
}

/// Waits for the first decisive state within `timeout`. A locked wallet is
/// healthy; only cancellation is an error.
pub async fn check_wallet_health(
    wallet: &dyn WalletControl,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<WalletHealth, &'static str> {
    let mut watch = Watch::new(wallet);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => return Err("health check cancelled"),
            _ = &mut deadline => {
                return Ok(WalletHealth::unhealthy(
                    Status::None,
                    "wallet did not become ready before timeout",
                ));
            }
            update = watch.recv() => update,
        };
        let Some(update) = update else {
            return Ok(WalletHealth::unhealthy(
                Status::Down,
                "wallet service closed unexpectedly",
            ));
        };

        let health = match update.state {
            Status::Ready
            | Status::Unlocked
            | Status::Syncing
            | Status::Transaction
            | Status::Block
            | Status::Scanning
            | Status::Locked => WalletHealth::healthy(update.state),
            Status::NoWallet => WalletHealth::unhealthy(update.state, "wallet not found"),
            Status::Down => WalletHealth::unhealthy(
                update.state,
                update
                    .err
                    .unwrap_or_else(|| "wallet daemon reported down state".to_string()),
            ),
            Status::Quit => WalletHealth::unhealthy(update.state, "wallet service quit unexpectedly"),
            Status::None | Status::Init => continue,
        };
        return Ok(health);
    }
}
