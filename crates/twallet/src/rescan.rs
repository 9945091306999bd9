//! The user-requested rescan: restart the node with wallet transactions
//! reset, unlock it again, then follow the recovery until it finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use twallet_flnd::{DaemonError, Status};
use twallet_log::{log_error, log_info, log_warn};
use zeroize::Zeroizing;

use crate::control::{Watch, WalletControl};
use crate::error::RescanError;
use crate::progress::{ProgressSink, RescanEvent};
use crate::recovery::{
    completion_message, get_recovery_status, monitor_recovery, recovery_progress_message,
    BestStatus, RecoveryStatus, DEFAULT_MONITOR_INTERVAL,
};

pub const UNLOCK_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const MAX_UNLOCK_RETRIES: u32 = 30;
pub const INVALID_PASSPHRASE_PROMPT: &str = "Incorrect wallet passphrase. Please try again.";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RescanSettings {
    pub unlock_retry_delay: Duration,
    /// Unlock attempts allowed after the first one.
    pub max_unlock_retries: u32,
    pub monitor_interval: Duration,
}

impl Default for RescanSettings {
    fn default() -> Self {
        Self {
            unlock_retry_delay: UNLOCK_RETRY_DELAY,
            max_unlock_retries: MAX_UNLOCK_RETRIES,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RescanSummary {
    pub elapsed: Duration,
    pub utxo_count: usize,
    pub status: Option<RecoveryStatus>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnlockOutcome {
    AlreadyUnlocked,
    InvalidPassphrase,
    NotReady,
    Fatal,
}

/// How an unlock failure steers the retry loop. Errors that carry no RPC
/// status are retried.
pub fn classify_unlock_error(err: &DaemonError) -> UnlockOutcome {
    let message = match err.rpc() {
        Some(rpc) => rpc.message.to_ascii_lowercase(),
        None => err.to_string().to_ascii_lowercase(),
    };
    if message.contains("already unlocked") {
        return UnlockOutcome::AlreadyUnlocked;
    }
    if message.contains("invalid passphrase") {
        return UnlockOutcome::InvalidPassphrase;
    }
    match err.rpc() {
        Some(rpc) if rpc.is_not_ready() => UnlockOutcome::NotReady,
        Some(_) => UnlockOutcome::Fatal,
        None => UnlockOutcome::NotReady,
    }
}

/// Unlocks a wallet that is coming back from a restart. Each `Locked` event
/// triggers an attempt; an accepted unlock still has to be confirmed by the
/// node within `retry_delay`.
pub async fn auto_unlock(
    wallet: &dyn WalletControl,
    passphrase: &str,
    settings: &RescanSettings,
    cancel: &CancellationToken,
    sink: &ProgressSink,
) -> Result<(), RescanError> {
    let passphrase = passphrase.trim();
    if passphrase.is_empty() {
        return Err(RescanError::PassphraseRequired);
    }

    let retry_delay = settings.unlock_retry_delay;
    let total = settings.max_unlock_retries + 1;
    let mut watch = Watch::new(wallet);
    let timer = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(timer);
    let mut attempts = 0u32;
    let mut awaiting_confirmation = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(RescanError::Cancelled),
            update = watch.recv() => {
                let Some(update) = update else {
                    return Err(RescanError::SubscriptionClosed("unlocking"));
                };
                match update.state {
                    Status::Unlocked | Status::Ready | Status::Syncing => {
                        sink.line("🔓 Wallet unlock confirmed.");
                        return Ok(());
                    }
                    Status::Locked => {
                        if awaiting_confirmation {
                            sink.line("Wallet reported locked again. Retrying unlock…");
                        }
                        awaiting_confirmation = false;
                        timer.as_mut().reset(Instant::now());
                    }
                    Status::Down => {
                        match &update.err {
                            Some(err) => sink.line(format!("Wallet down: {err}")),
                            None => sink.line("Wallet service reported down state during unlock."),
                        }
                        awaiting_confirmation = false;
                        timer.as_mut().reset(Instant::now() + retry_delay);
                    }
                    Status::None => {
                        sink.line("Wallet initializing…");
                        awaiting_confirmation = false;
                        timer.as_mut().reset(Instant::now() + retry_delay);
                    }
                    _ => {}
                }
            }
            _ = &mut timer => {
                if awaiting_confirmation {
                    sink.line("Unlock confirmation timed out. Retrying…");
                    awaiting_confirmation = false;
                    timer.as_mut().reset(Instant::now());
                    continue;
                }

                if attempts >= total {
                    sink.line("Exceeded maximum unlock attempts.");
                    return Err(RescanError::UnlockAttemptsExhausted);
                }
                attempts += 1;
                sink.line(format!("Attempting to unlock wallet ({attempts}/{total})…"));

                let result = tokio::select! {
                    _ = cancel.cancelled() => return Err(RescanError::Cancelled),
                    result = wallet.unlock(passphrase) => result,
                };
                let err = match result {
                    Ok(()) => {
                        awaiting_confirmation = true;
                        sink.line("Unlock RPC accepted. Awaiting confirmation…");
                        timer.as_mut().reset(Instant::now() + retry_delay);
                        continue;
                    }
                    Err(err) => err,
                };

                match classify_unlock_error(&err) {
                    UnlockOutcome::AlreadyUnlocked => {
                        sink.line("Wallet already unlocked.");
                        return Ok(());
                    }
                    UnlockOutcome::InvalidPassphrase => {
                        sink.line("Unlock failed: invalid passphrase provided.");
                        return Err(RescanError::InvalidPassphrase);
                    }
                    UnlockOutcome::NotReady if err.rpc().is_some() => {
                        sink.line("Wallet service not ready. Waiting before retry…");
                    }
                    UnlockOutcome::NotReady => {
                        sink.line(format!("Unlock failed: {err}"));
                    }
                    UnlockOutcome::Fatal => {
                        sink.line(format!("Unlock failed: {err}"));
                        return Err(err.into());
                    }
                }
                timer.as_mut().reset(Instant::now() + retry_delay);
            }
        }
    }
}

/// Waits until the node serves wallet RPCs again. There is no deadline
/// here; callers wrap it when they need one.
pub async fn wait_for_wallet_rpc(
    wallet: &dyn WalletControl,
    cancel: &CancellationToken,
    sink: &ProgressSink,
) -> Result<(), RescanError> {
    let mut watch = Watch::new(wallet);
    sink.line("Waiting for wallet RPC readiness signals…");

    loop {
        let update = tokio::select! {
            _ = cancel.cancelled() => return Err(RescanError::Cancelled),
            update = watch.recv() => update,
        };
        let Some(update) = update else {
            return Err(RescanError::SubscriptionClosed("waiting for RPC"));
        };

        match update.state {
            Status::Ready | Status::Block | Status::Transaction | Status::Syncing => {
                sink.line("Wallet RPC ready.");
                return Ok(());
            }
            Status::Unlocked => sink.line("Wallet unlocked. Waiting for RPC to become active…"),
            Status::Down => match update.err {
                Some(err) => {
                    sink.line(format!("Wallet down: {err}"));
                    return Err(RescanError::Failed(err));
                }
                None => sink.line("Wallet service reported down state. Waiting…"),
            },
            Status::None => sink.line("Wallet initializing RPC services…"),
            Status::Locked => sink.line("Wallet locked; still waiting for RPC availability…"),
            _ => {}
        }
    }
}

/// Clears the orchestrator flags however a run ends.
struct RunGuard<'a> {
    busy: &'a AtomicBool,
    active: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.busy.store(false, Ordering::SeqCst);
    }
}

pub struct Rescan {
    wallet: Arc<dyn WalletControl>,
    sink: ProgressSink,
    settings: RescanSettings,
    busy: AtomicBool,
    active: AtomicBool,
}

impl Rescan {
    pub fn new(wallet: Arc<dyn WalletControl>, sink: ProgressSink) -> Self {
        Self::with_settings(wallet, sink, RescanSettings::default())
    }

    pub fn with_settings(
        wallet: Arc<dyn WalletControl>,
        sink: ProgressSink,
        settings: RescanSettings,
    ) -> Self {
        Self {
            wallet,
            sink,
            settings,
            busy: AtomicBool::new(false),
            active: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// True once the node has been asked to rescan and until the run ends.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Drives one rescan to completion. Failures are also reported through
    /// the sink and stop the wallet service; a rejected passphrase or a
    /// cancellation leaves the service running.
    pub async fn run(
        &self,
        passphrase: &str,
        cancel: &CancellationToken,
    ) -> Result<RescanSummary, RescanError> {
        let passphrase = Zeroizing::new(passphrase.trim().to_string());
        if passphrase.is_empty() {
            return Err(RescanError::PassphraseRequired);
        }
        if self.busy.swap(true, Ordering::SeqCst) {
            return Err(RescanError::Busy);
        }
        let _guard = RunGuard {
            busy: &self.busy,
            active: &self.active,
        };

        if let Ok(status) = get_recovery_status(self.wallet.as_ref()).await {
            if status.is_running() {
                log_warn!("rescan refused: recovery already in progress");
                return Err(RescanError::AlreadyRunning);
            }
        }

        self.active.store(true, Ordering::SeqCst);
        self.sink.line("Preparing wallet rescan…");
        let started = Instant::now();
        let mut best = BestStatus::default();

        let outcome = self.execute(&passphrase, cancel, &mut best).await;
        match outcome {
            Ok(status) => Ok(self.finish(started, best.get().or(status)).await),
            Err(err) if err.is_cancelled() => {
                log_info!("rescan cancelled");
                Err(err)
            }
            Err(RescanError::InvalidPassphrase) => {
                self.sink
                    .send(RescanEvent::PromptAgain(INVALID_PASSPHRASE_PROMPT.to_string()));
                Err(RescanError::InvalidPassphrase)
            }
            Err(err) => {
                log_error!("rescan failed: {err}");
                self.sink.line(format!("Rescan error: {err}"));
                self.sink.send(RescanEvent::Failed(format!("Rescan failed: {err}")));
                self.wallet.stop().await;
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        passphrase: &str,
        cancel: &CancellationToken,
        best: &mut BestStatus,
    ) -> Result<Option<RecoveryStatus>, RescanError> {
        let wallet = self.wallet.as_ref();
        let sink = &self.sink;

        sink.line("⏳ Restarting wallet for rescan…");
        let triggered = tokio::select! {
            _ = cancel.cancelled() => return Err(RescanError::Cancelled),
            result = wallet.trigger_rescan() => result,
        };
        triggered.map_err(|err| RescanError::step("failed to start rescan", err.into()))?;

        sink.line("⏳ Waiting for wallet to restart…");
        match auto_unlock(wallet, passphrase, &self.settings, cancel, sink).await {
            Ok(()) => {}
            Err(err @ (RescanError::InvalidPassphrase | RescanError::Cancelled)) => return Err(err),
            Err(err) => return Err(RescanError::step("failed to unlock wallet after restart", err)),
        }

        sink.line("🔓 Wallet unlocked. Waiting for wallet RPC…");
        wait_for_wallet_rpc(wallet, cancel, sink)
            .await
            .map_err(|err| match err {
                RescanError::Cancelled => err,
                err => RescanError::step("wallet RPC not ready", err),
            })?;

        sink.line("✅ Wallet RPC ready. Monitoring recovery…");
        let monitored = monitor_recovery(wallet, self.settings.monitor_interval, cancel, |status| {
            best.record(status);
            sink.progress(recovery_progress_message(status));
            !cancel.is_cancelled()
        })
        .await;

        match monitored {
            Ok(_) if cancel.is_cancelled() => Err(RescanError::Cancelled),
            Ok(status) => Ok(Some(status)),
            Err(RescanError::Cancelled) => Err(RescanError::Cancelled),
            Err(err) => Err(RescanError::step("rescan failed", err)),
        }
    }

    async fn finish(&self, started: Instant, status: Option<RecoveryStatus>) -> RescanSummary {
        let mut status = status;
        let mut utxo_count = status.map_or(0, |s| s.utxo_count);

        if utxo_count == 0 {
            if let Ok(latest) = get_recovery_status(self.wallet.as_ref()).await {
                if latest.utxo_count > utxo_count {
                    utxo_count = latest.utxo_count;
                    status = Some(latest);
                }
            }
        }

        let elapsed = started.elapsed();
        log_info!("rescan complete: {utxo_count} utxos recovered");
        self.sink.line(completion_message(utxo_count));
        self.sink.send(RescanEvent::Completed {
            elapsed,
            utxo_count,
        });
        RescanSummary {
            elapsed,
            utxo_count,
            status,
        }
    }
}
