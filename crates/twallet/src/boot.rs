//! Startup: wait for the first decisive node state, and repair a corrupted
//! chain-filter cache when the node cannot load it.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use fs2::FileExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use twallet_flnd::config::chain_dir;
use twallet_flnd::{Network, Status};
use twallet_log::{log_error, log_info, log_warn};

use crate::control::{Watch, WalletControl};
use crate::health::{check_wallet_health, STARTUP_HEALTH_TIMEOUT};

const LOCK_FILE_NAME: &str = "twallet.lock";
const NEUTRINO_CACHE_FILES: [&str; 4] = [
    "block_headers.bin",
    "reg_filter_headers.bin",
    "neutrino.db",
    "neutrino.sqlite",
];

/// Exclusive advisory lock on the wallet directory, held until dropped.
#[derive(Debug)]
pub struct WalletDirLock {
    _file: File,
}

pub fn lock_wallet_dir(wallet_dir: &Path) -> Result<WalletDirLock, String> {
    let lock_path = wallet_dir.join(LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = file.flush();
            Ok(WalletDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ = File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            let holder = holder.trim();
            let suffix = if holder.is_empty() {
                String::new()
            } else {
                format!(" ({holder})")
            };
            Err(format!(
                "Another instance is already running: wallet dir {} is locked{suffix}",
                wallet_dir.display()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock wallet dir {} (lock file {}): {err}",
            wallet_dir.display(),
            lock_path.display()
        )),
    }
}

/// Removes the node's chain-filter cache so headers are fetched again on the
/// next start. Missing files are not an error.
pub fn purge_neutrino_cache(
    wallet_dir: &Path,
    network: Network,
    mut report: impl FnMut(&str),
) -> Result<(), String> {
    if wallet_dir.as_os_str().is_empty() {
        return Err("walletdir not configured; cannot locate neutrino cache".to_string());
    }

    let base = chain_dir(wallet_dir, network);
    let mut removed = false;
    for name in NEUTRINO_CACHE_FILES {
        let path = base.join(name);
        match fs::remove_file(&path) {
            Ok(()) => {
                removed = true;
                report(&format!("Removed {}", path.display()));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(format!("failed to remove {}: {err}", path.display())),
        }
    }

    if removed {
        report("Neutrino cache cleared.");
    } else {
        report("No Neutrino cache files found to clear.");
    }
    Ok(())
}

pub fn format_boot_error(err: &str) -> String {
    if err.to_ascii_lowercase().contains("address already in use") {
        return format!("Another instance is already running: {err}");
    }
    err.to_string()
}

/// A node that fails while reading its header files reports an EOF.
pub fn is_eof_error(err: &str) -> bool {
    err.contains("EOF")
}

/// Creates a fresh wallet service; called again after each recovery.
pub type ServiceFactory = Box<dyn Fn() -> Arc<dyn WalletControl> + Send + Sync>;

/// Handle the UI uses to ask for a cache recovery during startup.
#[derive(Clone, Debug)]
pub struct RecoveryTrigger {
    tx: mpsc::Sender<()>,
}

impl RecoveryTrigger {
    /// At most one request is queued.
    pub fn request(&self) {
        let _ = self.tx.try_send(());
    }
}

pub enum BootOutcome {
    /// The node is up; the main UI takes over this service.
    Launch(Arc<dyn WalletControl>),
    Quit,
    /// Startup failed and the service was stopped.
    Failed(String),
    Cancelled,
}

impl std::fmt::Debug for BootOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootOutcome::Launch(_) => write!(f, "Launch"),
            BootOutcome::Quit => write!(f, "Quit"),
            BootOutcome::Failed(reason) => write!(f, "Failed({reason:?})"),
            BootOutcome::Cancelled => write!(f, "Cancelled"),
        }
    }
}

enum Step {
    Restart,
    Launch,
    Done(BootOutcome),
}

pub struct Boot {
    factory: ServiceFactory,
    wallet: Option<Arc<dyn WalletControl>>,
    wallet_dir: PathBuf,
    network: Network,
    notices: Sender<String>,
    recovery_rx: mpsc::Receiver<()>,
    health_timeout: Duration,
}

impl Boot {
    pub fn new(
        factory: ServiceFactory,
        wallet_dir: PathBuf,
        network: Network,
        notices: Sender<String>,
    ) -> (Self, RecoveryTrigger) {
        let (tx, recovery_rx) = mpsc::channel(1);
        let boot = Self {
            factory,
            wallet: None,
            wallet_dir,
            network,
            notices,
            recovery_rx,
            health_timeout: STARTUP_HEALTH_TIMEOUT,
        };
        (boot, RecoveryTrigger { tx })
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub async fn run(mut self, cancel: &CancellationToken) -> BootOutcome {
        loop {
            let wallet = match &self.wallet {
                Some(wallet) => wallet.clone(),
                None => {
                    let wallet = (self.factory)();
                    self.wallet = Some(wallet.clone());
                    wallet
                }
            };

            match self.follow(wallet.as_ref(), cancel).await {
                Step::Restart => continue,
                Step::Launch => return BootOutcome::Launch(wallet),
                Step::Done(outcome) => {
                    self.stop_service().await;
                    return outcome;
                }
            }
        }
    }

    async fn follow(&mut self, wallet: &dyn WalletControl, cancel: &CancellationToken) -> Step {
        let mut watch = Watch::new(wallet);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Step::Done(BootOutcome::Cancelled),
                Some(()) = self.recovery_rx.recv() => {
                    drop(watch);
                    return self.recover_or_fail("Recovery requested", cancel).await;
                }
                update = watch.recv() => {
                    let Some(update) = update else {
                        self.notice("Error: wallet service closed unexpectedly during startup");
                        return Step::Done(BootOutcome::Failed(
                            "wallet service closed unexpectedly during startup".to_string(),
                        ));
                    };
                    match update.state {
                        Status::None | Status::Init => continue,
                        Status::Down => {
                            drop(watch);
                            return self.handle_down(update.err, cancel).await;
                        }
                        Status::Quit => return Step::Done(BootOutcome::Quit),
                        _ => return Step::Launch,
                    }
                }
            }
        }
    }

    async fn handle_down(&mut self, err: Option<String>, cancel: &CancellationToken) -> Step {
        let message = err
            .as_deref()
            .map(format_boot_error)
            .unwrap_or_else(|| "wallet reported down during startup".to_string());

        if !err.as_deref().is_some_and(is_eof_error) {
            log_error!("startup failed: {message}");
            self.notice(&format!("Error: {message}"));
            return Step::Done(BootOutcome::Failed(message));
        }

        log_warn!("neutrino headers failed to load: {message}");
        self.notice(&format!(
            "Error: {message}\nNeutrino headers look corrupted. Press 'r' to run recovery.\nPress Ctrl+C to quit."
        ));
        self.stop_service().await;

        self.clear_recovery_requests();
        let confirmed = tokio::select! {
            _ = cancel.cancelled() => false,
            request = self.recovery_rx.recv() => request.is_some(),
        };
        if !confirmed {
            self.notice("Recovery cancelled. Exiting startup.");
            return Step::Done(BootOutcome::Failed("recovery cancelled".to_string()));
        }
        self.recover_or_fail("Neutrino headers failed to load during startup", cancel)
            .await
    }

    async fn recover_or_fail(&mut self, reason: &str, cancel: &CancellationToken) -> Step {
        match self.recover(reason, cancel).await {
            Ok(()) => Step::Restart,
            Err(err) => Step::Done(BootOutcome::Failed(err)),
        }
    }

    /// Stops the service, clears the cache and checks that a fresh service
    /// comes up healthy.
    pub async fn recover(&mut self, reason: &str, cancel: &CancellationToken) -> Result<(), String> {
        self.clear_recovery_requests();
        if reason.is_empty() {
            self.notice("Entering recovery mode…");
        } else {
            self.notice(&format!("Entering recovery mode: {reason}"));
        }
        log_info!("wallet recovery: {reason}");

        self.notice("Stopping wallet service…");
        self.stop_service().await;

        self.notice("Clearing cached chain data…");
        let notices = self.notices.clone();
        if let Err(err) = purge_neutrino_cache(&self.wallet_dir, self.network, |line| {
            let _ = notices.try_send(line.to_string());
        }) {
            self.notice(&format!("Recovery failed: {}", format_boot_error(&err)));
            return Err(err);
        }

        self.notice("Restarting wallet service…");
        let wallet = (self.factory)();
        self.wallet = Some(wallet.clone());

        let health = check_wallet_health(wallet.as_ref(), self.health_timeout, cancel)
            .await
            .map_err(|err| {
                self.notice(&format!("Recovery failed during health check: {err}"));
                err.to_string()
            })?;

        if !health.healthy {
            let reason = health
                .reason
                .unwrap_or_else(|| "wallet still unavailable".to_string());
            self.notice(&format!("Wallet still unhealthy after recovery: {reason}"));
            self.notice(
                "Please restore from your seed/mnemonic and restart twallet. Press Ctrl+C to quit.",
            );
            return Err("wallet remains unhealthy after recovery".to_string());
        }

        self.notice("Wallet recovered. Continuing startup…");
        Ok(())
    }

    async fn stop_service(&self) {
        if let Some(wallet) = &self.wallet {
            wallet.stop().await;
        }
    }

    fn clear_recovery_requests(&mut self) {
        while self.recovery_rx.try_recv().is_ok() {}
    }

    fn notice(&self, message: &str) {
        if message.trim().is_empty() {
            return;
        }
        let _ = self.notices.try_send(message.to_string());
    }
}
