use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use twallet_log::{log_debug, log_info, log_warn};

use crate::backend::NodeBackend;
use crate::backoff::RetryBackoff;
use crate::client::{Client, CreatedWallet, LightningConfig, SyncInfo};
use crate::config::{DaemonConfig, ServiceConfig};
use crate::daemon::Daemon;
use crate::error::DaemonError;
use crate::hub::{Subscription, UpdateHub};
use crate::lock;
use crate::rpc::{
    AccountAddresses, AddressType, FeeEstimate, FinalizedTransaction, FundedTransaction,
    OutputLock, RecoveryInfo, Transaction, Utxo, VerifiedMessage, WalletBalance,
};
use crate::status::{Status, Update};
use crate::tx_cache::FetchOptions;

type Connection = (Arc<Daemon>, Arc<Client>);

struct Inner {
    hub: UpdateHub,
    cancel: CancellationToken,
    backend: Arc<dyn NodeBackend>,
    config: Mutex<DaemonConfig>,
    conn: Mutex<Option<Connection>>,
    running: AtomicBool,
    max_transactions_limit: u32,
    stopped: tokio::sync::Mutex<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    generation: watch::Sender<u64>,
}

/// Keeps the embedded node running: starts it, restarts it with backoff
/// when it fails, and fans its lifecycle out to subscribers.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    /// Starts supervising in the background. Must be called inside a tokio
    /// runtime.
    pub fn new(
        parent: &CancellationToken,
        config: &ServiceConfig,
        backend: Arc<dyn NodeBackend>,
    ) -> Self {
        let (generation, _) = watch::channel(0);
        let inner = Arc::new(Inner {
            hub: UpdateHub::default(),
            cancel: parent.child_token(),
            backend,
            config: Mutex::new(DaemonConfig::from_service(config)),
            conn: Mutex::new(None),
            running: AtomicBool::new(false),
            max_transactions_limit: config.transaction_display_limit,
            stopped: tokio::sync::Mutex::new(false),
            task: Mutex::new(None),
            generation,
        });

        let runner = Arc::clone(&inner);
        let handle = tokio::spawn(async move { runner.run().await });
        *lock(&inner.task) = Some(handle);
        Self { inner }
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.hub.subscribe()
    }

    pub fn unsubscribe(&self, sub: &Subscription) {
        self.inner.hub.unsubscribe(sub);
    }

    pub fn last_event(&self) -> Update {
        self.inner.hub.last_event()
    }

    /// True while a started node is registered.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Snapshot of the configuration the next node run will use.
    pub fn config(&self) -> DaemonConfig {
        lock(&self.inner.config).clone()
    }

    /// Stops supervision for good. Every subscriber gets a final `Down` and
    /// is closed. Later calls return immediately.
    pub async fn stop(&self) {
        let mut stopped = self.inner.stopped.lock().await;
        if *stopped {
            return;
        }
        *stopped = true;

        log_info!("stopping wallet service");
        self.inner.cancel.cancel();
        self.inner.stop_daemon().await;
        self.inner.hub.close_all().await;

        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                log_warn!("service task ended abnormally: {err}");
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);
    }

    /// Stops the current node and waits until the supervisor has begun the
    /// next run. Returns at once when no node is registered.
    pub async fn restart(&self) {
        let daemon = lock(&self.inner.conn)
            .as_ref()
            .map(|(daemon, _)| Arc::clone(daemon));
        let Some(daemon) = daemon else {
            log_debug!("restart requested with no running node");
            return;
        };

        let mut generation = self.inner.generation.subscribe();
        let current = *generation.borrow_and_update();
        log_info!("restarting FLND daemon");
        daemon.stop().await;

        tokio::select! {
            _ = self.inner.cancel.cancelled() => {}
            _ = generation.wait_for(|next| *next != current) => {}
        }
    }

    /// Restarts the node with the one-shot transaction reset enabled.
    pub async fn trigger_rescan(&self) -> Result<(), DaemonError> {
        lock(&self.inner.config).reset_wallet_transactions = true;
        self.restart().await;
        Ok(())
    }

    fn client(&self) -> Result<Arc<Client>, DaemonError> {
        lock(&self.inner.conn)
            .as_ref()
            .map(|(_, client)| Arc::clone(client))
            .ok_or(DaemonError::NotRunning)
    }

    pub async fn create_wallet(&self, passphrase: &str) -> Result<CreatedWallet, DaemonError> {
        self.client()?.create(passphrase).await
    }

    pub async fn balance(&self) -> Result<WalletBalance, DaemonError> {
        self.client()?.balance().await
    }

    pub async fn is_locked(&self) -> Result<bool, DaemonError> {
        self.client()?.is_locked().await
    }

    pub async fn is_synced(&self) -> Result<SyncInfo, DaemonError> {
        self.client()?.is_synced().await
    }

    pub async fn unlock(&self, passphrase: &str) -> Result<(), DaemonError> {
        self.client()?.unlock(passphrase).await
    }

    pub async fn wallet_exists(&self) -> Result<bool, DaemonError> {
        self.client()?.wallet_exists().await
    }

    pub async fn recovery_info(&self) -> Result<RecoveryInfo, DaemonError> {
        self.client()?.recovery_info().await
    }

    pub async fn list_unspent(&self, min_confs: i32, max_confs: i32) -> Result<Vec<Utxo>, DaemonError> {
        self.client()?.list_unspent(min_confs, max_confs).await
    }

    pub async fn fetch_transactions(&self) -> Result<Vec<Transaction>, DaemonError> {
        self.client()?.fetch_transactions().await
    }

    pub async fn fetch_transactions_with(
        &self,
        options: FetchOptions,
    ) -> Result<Vec<Transaction>, DaemonError> {
        self.client()?.fetch_transactions_with(options).await
    }

    pub async fn next_address(&self, kind: AddressType) -> Result<String, DaemonError> {
        self.client()?.next_address(kind).await
    }

    pub async fn list_addresses(&self) -> Result<Vec<AccountAddresses>, DaemonError> {
        self.client()?.list_addresses().await
    }

    pub async fn sign_message(&self, address: &str, message: &str) -> Result<String, DaemonError> {
        self.client()?.sign_message(address, message).await
    }

    pub async fn verify_message(
        &self,
        address: &str,
        message: &str,
        signature: &str,
    ) -> Result<VerifiedMessage, DaemonError> {
        self.client()?.verify_message(address, message, signature).await
    }

    pub async fn restore_by_mnemonic(
        &self,
        mnemonic: &[String],
        passphrase: &str,
    ) -> Result<String, DaemonError> {
        self.client()?.restore_by_mnemonic(mnemonic, passphrase).await
    }

    pub async fn restore_by_enciphered_seed(
        &self,
        enciphered_seed_hex: &str,
        passphrase: &str,
    ) -> Result<Vec<String>, DaemonError> {
        self.client()?
            .restore_by_enciphered_seed(enciphered_seed_hex, passphrase)
            .await
    }

    pub async fn change_passphrase(&self, current: &str, new: &str) -> Result<(), DaemonError> {
        self.client()?.change_passphrase(current, new).await
    }

    pub async fn transfer(
        &self,
        address: &str,
        amount: i64,
        sat_per_vbyte: u64,
    ) -> Result<String, DaemonError> {
        self.client()?
            .simple_transfer(address, amount, sat_per_vbyte)
            .await
    }

    pub async fn fee(&self, address: &str, amount: i64) -> Result<FeeEstimate, DaemonError> {
        self.client()?.simple_transfer_fee(address, amount).await
    }

    pub async fn fund_psbt(
        &self,
        outputs: &HashMap<String, i64>,
        sat_per_vbyte: u64,
        lock_expiration_seconds: u64,
    ) -> Result<FundedTransaction, DaemonError> {
        self.client()?
            .fund_psbt(outputs, sat_per_vbyte, lock_expiration_seconds)
            .await
    }

    pub async fn finalize_psbt(
        &self,
        funded: &FundedTransaction,
    ) -> Result<FinalizedTransaction, DaemonError> {
        self.client()?.finalize_psbt(funded).await
    }

    pub async fn publish_transaction(&self, raw_tx: &[u8]) -> Result<(), DaemonError> {
        self.client()?.publish_transaction(raw_tx).await
    }

    pub async fn release_outputs(&self, locks: &[OutputLock]) -> Result<(), DaemonError> {
        if locks.is_empty() {
            return Ok(());
        }
        self.client()?.release_outputs(locks).await
    }

    pub async fn lightning_config(&self) -> Result<LightningConfig, DaemonError> {
        self.client()?.lightning_config().await
    }
}

impl Inner {
    async fn run(self: Arc<Self>) {
        let mut backoff = RetryBackoff::default();

        while !self.cancel.is_cancelled() {
            self.hub.publish(Update::new(Status::None));
            self.generation.send_modify(|generation| *generation += 1);

            let config = lock(&self.config).clone();
            let reset_requested = config.reset_wallet_transactions;
            let daemon = Arc::new(Daemon::new(config, Arc::clone(&self.backend), &self.cancel));
            let client = match daemon.start().await {
                Ok(client) => client,
                Err(err) => {
                    self.hub.publish(Update::down(Some(err.to_string())));
                    let delay = backoff.next_delay();
                    log_warn!("node start failed, retrying in {}s: {err}", delay.as_secs());
                    if !self.wait_for_retry(delay).await {
                        break;
                    }
                    continue;
                }
            };
            backoff.reset();

            self.register_connection(&daemon, &client, reset_requested);
            let forwarder = self.cancel.child_token();
            self.spawn_forwarder(&daemon, &client, forwarder.clone());

            tokio::select! {
                _ = daemon.wait_for_shutdown() => {}
                _ = self.cancel.cancelled() => daemon.stop().await,
            }
            forwarder.cancel();
            self.clear_connection(&daemon);
        }

        self.stop_daemon().await;
        log_debug!("service loop exited");
    }

    async fn wait_for_retry(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Only a start that carried the reset flag consumes it; a rescan requested
    /// while that start was in flight stays pending for the next one.
    fn register_connection(
        &self,
        daemon: &Arc<Daemon>,
        client: &Arc<Client>,
        reset_requested: bool,
    ) {
        client.set_max_transactions_limit(self.max_transactions_limit);
        *lock(&self.conn) = Some((Arc::clone(daemon), Arc::clone(client)));
        if reset_requested {
            lock(&self.config).reset_wallet_transactions = false;
        }
        self.running.store(true, Ordering::SeqCst);
    }

    fn clear_connection(&self, daemon: &Arc<Daemon>) {
        self.running.store(false, Ordering::SeqCst);
        let mut conn = lock(&self.conn);
        if conn
            .as_ref()
            .is_some_and(|(current, _)| Arc::ptr_eq(current, daemon))
        {
            *conn = None;
        }
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        daemon: &Arc<Daemon>,
        client: &Arc<Client>,
        cancel: CancellationToken,
    ) {
        let Some(mut health) = client.take_health() else {
            return;
        };
        let inner = Arc::clone(self);
        let daemon = Arc::clone(daemon);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        daemon.stop().await;
                        return;
                    }
                    update = health.recv() => {
                        let Some(update) = update else {
                            daemon.stop().await;
                            return;
                        };
                        let down = update.state == Status::Down;
                        log_debug!("node health: {update}");
                        inner.hub.publish(update);
                        if down {
                            daemon.stop().await;
                        }
                    }
                }
            }
        });
    }

    async fn stop_daemon(&self) {
        let conn = lock(&self.conn).take();
        if let Some((daemon, _)) = conn {
            daemon.stop().await;
        }
    }
}
