//! Waits used by the onboarding and unlock screens.

use std::fmt;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use twallet_flnd::{DaemonError, Status};

use crate::control::{Watch, WalletControl};

pub const UNLOCK_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone, Debug, PartialEq)]
pub enum WaitError {
    Cancelled,
    Closed(&'static str),
    Down(Option<String>),
    TimedOut,
    Unlock(DaemonError),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Cancelled => write!(f, "cancelled"),
            WaitError::Closed(waiting) => write!(f, "wallet subscription closed while {waiting}"),
            WaitError::Down(Some(err)) => write!(f, "{err}"),
            WaitError::Down(None) => write!(f, "wallet reported down"),
            WaitError::TimedOut => write!(f, "Unlock timed out. Try again."),
            WaitError::Unlock(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Resolves on the first `Ready`. Only a `Down` that carries an error fails.
pub async fn wait_for_wallet_ready(
    wallet: &dyn WalletControl,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    let mut watch = Watch::new(wallet);
    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            update = watch.recv() => update,
        };
        let Some(update) = update else {
            return Err(WaitError::Closed("waiting for RPC ready"));
        };
        match update.state {
            Status::Ready => return Ok(()),
            Status::Down if update.err.is_some() => return Err(WaitError::Down(update.err)),
            _ => {}
        }
    }
}

/// Waits for the node to confirm an unlock.
pub async fn wait_for_unlock(
    wallet: &dyn WalletControl,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    let mut watch = Watch::new(wallet);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = &mut deadline => return Err(WaitError::TimedOut),
            update = watch.recv() => update,
        };
        let Some(update) = update else {
            return Err(WaitError::Closed("unlocking"));
        };
        match update.state {
            Status::Ready | Status::Syncing | Status::Unlocked => return Ok(()),
            Status::Down => return Err(WaitError::Down(update.err)),
            _ => {}
        }
    }
}

/// The unlock screen's flow: submit the passphrase, then wait up to
/// [`UNLOCK_TIMEOUT`] for the node to confirm it.
pub async fn unlock_wallet(
    wallet: &dyn WalletControl,
    passphrase: &str,
    cancel: &CancellationToken,
) -> Result<(), WaitError> {
    wallet.unlock(passphrase).await.map_err(WaitError::Unlock)?;
    wait_for_unlock(wallet, UNLOCK_TIMEOUT, cancel).await
}
