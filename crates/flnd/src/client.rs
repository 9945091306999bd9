use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use twallet_log::{log_debug, log_info, log_warn};

use crate::backend::NodeBackend;
use crate::config::{DaemonConfig, DEFAULT_PEER_PORT, DEFAULT_RPC_PORT};
use crate::error::{DaemonError, RpcCode, RpcError, MSG_NO_WALLET, MSG_WALLET_UNLOCKED};
use crate::lock;
use crate::rpc::{
    AccountAddresses, AddressType, CallMeta, EstimateFeeRequest, FeeEstimate,
    FinalizedTransaction, FundPsbtRequest, FundedTransaction, InitWalletRequest, OutputLock,
    RecoveryInfo, SendCoinsRequest, Transaction, TransactionQuery, Utxo, VerifiedMessage,
    WalletBalance, WalletRpc, WalletState,
};
use crate::status::{Status, Update};
use crate::tls;
use crate::tx_cache::{
    merge_transactions, truncated, FetchOptions, TxCache, FETCH_TIMEOUT, PAGE_SIZE, PEEK_TIMEOUT,
};

pub const HEALTH_BUFFER: usize = 16;
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);
pub const SYNC_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const RECENT_HEADER_THRESHOLD: Duration = Duration::from_secs(5 * 60);
pub const UNLOCK_RECOVERY_WINDOW: i32 = 255;
pub const RESTORE_RECOVERY_WINDOW: i32 = 255;

const LEGACY_SEED_LEN: usize = 32;
const ENCIPHERED_SEED_LEN: usize = 33;
const LEGACY_NOTICE: &str = "Wallets from tWallet 0.1.x must be restored using the same version";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SyncInfo {
    pub synced: bool,
    /// Best header is at most five minutes old.
    pub recent_header: bool,
    pub block_height: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedWallet {
    pub enciphered_seed_hex: String,
    pub mnemonic: Vec<String>,
}

/// What an external Lightning client needs to talk to this node.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct LightningConfig {
    pub rpc_address: String,
    pub peer_address: String,
    pub pubkey: String,
    pub macaroon_hex: String,
    pub tls_cert_hex: String,
}

impl LightningConfig {
    pub fn to_json(&self) -> Result<String, DaemonError> {
        serde_json::to_string_pretty(self)
            .map_err(|err| DaemonError::Config(format!("failed to encode lightning config: {err}")))
    }
}

#[derive(Default)]
struct SyncState {
    poll_active: bool,
    poll_stop: Option<oneshot::Sender<()>>,
    poll_done: Option<oneshot::Receiver<()>>,
    synced: bool,
    synced_height: u32,
}

/// Live RPC connection to one running node.
pub struct Client {
    rpc: Arc<dyn WalletRpc>,
    backend: Arc<dyn NodeBackend>,
    config: DaemonConfig,
    cancel: CancellationToken,
    health_tx: mpsc::Sender<Update>,
    health_rx: Mutex<Option<mpsc::Receiver<Update>>>,
    macaroon: Mutex<Option<String>>,
    closing: AtomicBool,
    streams_started: AtomicBool,
    sync: Mutex<SyncState>,
    cache: Mutex<TxCache>,
}

impl Client {
    /// Opens the connection and starts following the node's wallet state.
    pub(crate) fn new(
        rpc: Arc<dyn WalletRpc>,
        backend: Arc<dyn NodeBackend>,
        config: DaemonConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (health_tx, health_rx) = mpsc::channel(HEALTH_BUFFER);
        let mut cache = TxCache::new(0);
        cache.invalidate();
        let client = Arc::new(Self {
            rpc,
            backend,
            config,
            cancel,
            health_tx,
            health_rx: Mutex::new(Some(health_rx)),
            macaroon: Mutex::new(None),
            closing: AtomicBool::new(false),
            streams_started: AtomicBool::new(false),
            sync: Mutex::new(SyncState::default()),
            cache: Mutex::new(cache),
        });

        let watcher = Arc::clone(&client);
        tokio::spawn(async move { watcher.subscribe_state().await });
        client
    }

    /// Health events in node order. Can be taken once.
    pub fn take_health(&self) -> Option<mpsc::Receiver<Update>> {
        lock(&self.health_rx).take()
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub(crate) fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.rpc.close();
    }

    /// Reports the connection as down. Cancellation and deliberate closing
    /// carry no error.
    pub(crate) fn kill(&self, err: &RpcError) {
        if err.code == RpcCode::Canceled || self.is_closing() {
            self.submit_health(Update::down(None));
        } else {
            log_warn!("wallet connection lost: {err}");
            self.submit_health(Update::down(Some(err.message.clone())));
        }
    }

    pub(crate) fn fail(&self, message: String) {
        self.kill(&RpcError::new(RpcCode::Unknown, message));
    }

    fn submit_health(&self, update: Update) {
        if self.health_tx.try_send(update).is_err() {
            log_debug!("health channel full, dropping update");
        }
    }

    fn ensure_open(&self) -> Result<(), DaemonError> {
        if self.is_closing() {
            return Err(DaemonError::NotRunning);
        }
        Ok(())
    }

    fn meta(&self) -> CallMeta {
        CallMeta {
            macaroon_hex: lock(&self.macaroon).clone(),
        }
    }

    pub fn load_macaroon(&self) -> Result<(), DaemonError> {
        let hex = tls::read_macaroon(&self.config.admin_macaroon_path)?;
        *lock(&self.macaroon) = Some(hex);
        Ok(())
    }

    fn rpc_timeout(&self, timeout: Duration) -> Duration {
        let timeout = if timeout.is_zero() {
            DEFAULT_RPC_TIMEOUT
        } else {
            timeout
        };
        let ceiling = self.config.connection_timeout;
        if !ceiling.is_zero() && timeout > ceiling {
            ceiling
        } else {
            timeout
        }
    }

    async fn call<T>(
        &self,
        timeout: Duration,
        fut: impl Future<Output = Result<T, RpcError>>,
    ) -> Result<T, RpcError> {
        let limit = self.rpc_timeout(timeout);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RpcError::canceled()),
            res = tokio::time::timeout(limit, fut) => {
                res.unwrap_or_else(|_| Err(RpcError::deadline_exceeded()))
            }
        }
    }

    async fn call_unbounded<T>(
        &self,
        fut: impl Future<Output = Result<T, RpcError>>,
    ) -> Result<T, RpcError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RpcError::canceled()),
            res = fut => res,
        }
    }

    async fn subscribe_state(self: Arc<Self>) {
        let mut stream = match self.call_unbounded(self.rpc.subscribe_state()).await {
            Ok(stream) => stream,
            Err(err) => {
                self.kill(&err);
                return;
            }
        };

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.kill(&RpcError::canceled());
                    return;
                }
                item = stream.recv() => item,
            };
            let state = match item {
                Some(Ok(state)) => state,
                Some(Err(err)) => {
                    self.kill(&err);
                    return;
                }
                None => {
                    self.kill(&RpcError::eof());
                    return;
                }
            };
            log_debug!("node wallet state {state:?}");

            match state {
                WalletState::NonExisting => self.submit_health(Update::new(Status::NoWallet)),
                WalletState::Locked => self.submit_health(Update::new(Status::Locked)),
                WalletState::Unlocked => {
                    if let Err(err) = self.load_macaroon() {
                        self.fail(err.to_string());
                        return;
                    }
                    self.submit_health(Update::new(Status::Unlocked));
                }
                WalletState::WaitingToStart => self.submit_health(Update::new(Status::None)),
                WalletState::RpcActive => match self.is_synced().await {
                    Ok(sync) if sync.synced => {
                        self.submit_health(Update::new(Status::None).with_height(sync.block_height));
                    }
                    Ok(sync) => {
                        self.submit_health(
                            Update::new(Status::Syncing).with_height(sync.block_height),
                        );
                        Arc::clone(&self).poll_sync_status();
                    }
                    Err(err) => log_debug!("sync check failed while rpc active: {err}"),
                },
                WalletState::ServerActive => {
                    let sync = match self.is_synced().await {
                        Ok(sync) => sync,
                        Err(err) => {
                            match err.rpc() {
                                Some(rpc) => self.kill(rpc),
                                None => self.fail(err.to_string()),
                            }
                            return;
                        }
                    };
                    self.stop_sync_polling().await;
                    self.submit_health(Update::new(Status::Ready).with_height(sync.block_height));

                    if !self.streams_started.swap(true, Ordering::SeqCst) {
                        let txs = Arc::clone(&self);
                        tokio::spawn(async move { txs.subscribe_transactions().await });
                        let blocks = Arc::clone(&self);
                        tokio::spawn(async move { blocks.subscribe_blocks().await });
                    }
                }
            }
        }
    }

    async fn subscribe_transactions(self: Arc<Self>) {
        let meta = self.meta();
        let mut stream = match self.call_unbounded(self.rpc.subscribe_transactions(&meta)).await {
            Ok(stream) => stream,
            Err(err) => {
                self.kill(&err);
                return;
            }
        };

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return,
                item = stream.recv() => item,
            };
            match item {
                Some(Ok(tx)) => {
                    self.invalidate_tx_cache();
                    let mut update = Update::new(Status::Transaction);
                    update.transaction = Some(tx);
                    self.submit_health(update);
                }
                Some(Err(err)) => {
                    self.kill(&err);
                    return;
                }
                None => {
                    self.kill(&RpcError::eof());
                    return;
                }
            }
        }
    }

    async fn subscribe_blocks(self: Arc<Self>) {
        let meta = self.meta();
        let mut stream = match self.call_unbounded(self.rpc.subscribe_block_epochs(&meta)).await {
            Ok(stream) => stream,
            Err(err) => {
                self.kill(&err);
                return;
            }
        };

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return,
                item = stream.recv() => item,
            };
            let epoch = match item {
                Some(Ok(epoch)) => epoch,
                Some(Err(err)) => {
                    self.kill(&err);
                    return;
                }
                None => {
                    self.kill(&RpcError::eof());
                    return;
                }
            };

            let mut update = Update::new(Status::Block).with_height(epoch.height);
            {
                let sync = lock(&self.sync);
                if !sync.synced {
                    update.state = Status::Scanning;
                    update.synced_height = sync.synced_height;
                }
            }
            update.block_hash = hex::encode(&epoch.hash);
            self.invalidate_tx_cache();
            self.submit_health(update);
        }
    }

    fn poll_sync_status(self: Arc<Self>) {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        {
            let mut sync = lock(&self.sync);
            if sync.poll_active {
                return;
            }
            sync.poll_active = true;
            sync.poll_stop = Some(stop_tx);
            sync.poll_done = Some(done_rx);
        }

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + SYNC_POLL_INTERVAL, SYNC_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if self.poll_sync_once().await {
                            break;
                        }
                    }
                }
            }

            {
                let mut sync = lock(&self.sync);
                sync.poll_active = false;
                sync.poll_stop = None;
                sync.poll_done = None;
            }
            let _ = done_tx.send(());
        });
    }

    /// One poller tick; `true` once the node has caught up.
    async fn poll_sync_once(&self) -> bool {
        let sync = match self.is_synced().await {
            Ok(sync) => sync,
            Err(err) => {
                log_debug!("sync poll failed: {err}");
                return false;
            }
        };

        match self.recovery_info().await {
            Ok(info) if info.recovery_mode && info.recovery_finished => {
                self.submit_health(Update::new(Status::Ready).with_height(sync.block_height));
                return true;
            }
            Ok(_) => {}
            Err(err) => log_debug!("recovery info unavailable during sync poll: {err}"),
        }

        if sync.synced {
            self.submit_health(Update::new(Status::Ready).with_height(sync.block_height));
            return true;
        }

        self.submit_health(Update::new(Status::Syncing).with_height(sync.block_height));
        false
    }

    async fn stop_sync_polling(&self) {
        let (stop, done) = {
            let mut sync = lock(&self.sync);
            (sync.poll_stop.take(), sync.poll_done.take())
        };
        if let Some(stop) = stop {
            let _ = stop.send(());
        }
        if let Some(done) = done {
            let _ = done.await;
        }
    }

    fn invalidate_tx_cache(&self) {
        lock(&self.cache).invalidate();
    }

    pub async fn wallet_exists(&self) -> Result<bool, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        match self.call(Duration::ZERO, self.rpc.get_info(&meta)).await {
            Ok(_) => Ok(true),
            Err(err) if err.message == MSG_NO_WALLET => Ok(false),
            Err(err) => {
                log_debug!("wallet existence check inconclusive: {err}");
                Ok(true)
            }
        }
    }

    pub async fn is_synced(&self) -> Result<SyncInfo, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        let info = match self.call(Duration::ZERO, self.rpc.get_info(&meta)).await {
            Ok(info) => Some(info),
            Err(err) if err.is_rpc_starting() => None,
            Err(err) => return Err(err.into()),
        };

        let sync = match info {
            Some(info) => {
                let recent_header = info.synced_to_chain
                    || header_age(info.best_header_timestamp) <= RECENT_HEADER_THRESHOLD;
                SyncInfo {
                    synced: info.synced_to_chain,
                    recent_header,
                    block_height: info.block_height,
                }
            }
            None => SyncInfo::default(),
        };

        let mut state = lock(&self.sync);
        state.synced = sync.synced;
        state.synced_height = sync.block_height;
        Ok(sync)
    }

    pub async fn unlock(&self, passphrase: &str) -> Result<(), DaemonError> {
        self.ensure_open()?;
        let res = self
            .call_unbounded(
                self.rpc
                    .unlock_wallet(passphrase.as_bytes(), UNLOCK_RECOVERY_WINDOW),
            )
            .await;
        match res {
            Ok(()) => Ok(()),
            Err(err) if err.is_already_unlocked() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn is_locked(&self) -> Result<bool, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        if self.call(Duration::ZERO, self.rpc.get_info(&meta)).await.is_ok() {
            return Ok(false);
        }

        match self.call(Duration::ZERO, self.rpc.gen_seed()).await {
            Ok(_) => Ok(true),
            Err(err) if err.message == MSG_WALLET_UNLOCKED || err.message == "wallet already exists" => {
                Ok(true)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn create(&self, passphrase: &str) -> Result<CreatedWallet, DaemonError> {
        self.ensure_open()?;
        let seed = self.call_unbounded(self.rpc.gen_seed()).await?;
        self.call_unbounded(self.rpc.init_wallet(InitWalletRequest {
            password: passphrase.as_bytes().to_vec(),
            mnemonic: seed.mnemonic.clone(),
            recovery_window: 0,
        }))
        .await?;
        log_info!("wallet created");

        Ok(CreatedWallet {
            enciphered_seed_hex: hex::encode(&seed.enciphered_seed),
            mnemonic: seed.mnemonic,
        })
    }

    pub async fn restore_by_enciphered_seed(
        &self,
        enciphered_seed_hex: &str,
        passphrase: &str,
    ) -> Result<Vec<String>, DaemonError> {
        self.ensure_open()?;
        let seed = hex::decode(enciphered_seed_hex.trim())
            .map_err(|err| DaemonError::InvalidSeed(format!("invalid seed encoding: {err}")))?;
        if seed.len() == LEGACY_SEED_LEN {
            return Err(DaemonError::InvalidSeed(
                "wallets from tWallet 0.1.x must be restored using the same version".to_string(),
            ));
        }
        if seed.len() != ENCIPHERED_SEED_LEN {
            return Err(DaemonError::InvalidSeed(
                "invalid seed length: possibly corrupted or unsupported format".to_string(),
            ));
        }

        let mnemonic = self
            .backend
            .decode_enciphered_seed(&seed)
            .map_err(DaemonError::InvalidSeed)?;
        self.call_unbounded(self.rpc.init_wallet(InitWalletRequest {
            password: passphrase.as_bytes().to_vec(),
            mnemonic: mnemonic.clone(),
            recovery_window: RESTORE_RECOVERY_WINDOW,
        }))
        .await?;
        log_info!("wallet restored from enciphered seed");
        Ok(mnemonic)
    }

    pub async fn restore_by_mnemonic(
        &self,
        mnemonic: &[String],
        passphrase: &str,
    ) -> Result<String, DaemonError> {
        self.ensure_open()?;
        let seed = self
            .backend
            .encipher_mnemonic(mnemonic)
            .map_err(|err| DaemonError::InvalidSeed(format!("{err}. {LEGACY_NOTICE}")))?;
        self.call_unbounded(self.rpc.init_wallet(InitWalletRequest {
            password: passphrase.as_bytes().to_vec(),
            mnemonic: mnemonic.to_vec(),
            recovery_window: RESTORE_RECOVERY_WINDOW,
        }))
        .await?;
        log_info!("wallet restored from mnemonic");
        Ok(hex::encode(seed))
    }

    pub async fn change_passphrase(&self, current: &str, new: &str) -> Result<(), DaemonError> {
        self.ensure_open()?;
        if !self.is_locked().await? {
            return Err(DaemonError::WalletMustBeLocked);
        }
        let meta = self.meta();
        self.call_unbounded(
            self.rpc
                .change_password(&meta, current.as_bytes(), new.as_bytes()),
        )
        .await?;
        Ok(())
    }

    pub async fn balance(&self) -> Result<WalletBalance, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        Ok(self
            .call(Duration::ZERO, self.rpc.wallet_balance(&meta))
            .await?)
    }

    pub async fn recovery_info(&self) -> Result<RecoveryInfo, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        Ok(self
            .call(Duration::ZERO, self.rpc.get_recovery_info(&meta))
            .await?)
    }

    /// `max_confs == 0` means no upper bound.
    pub async fn list_unspent(&self, min_confs: i32, max_confs: i32) -> Result<Vec<Utxo>, DaemonError> {
        self.ensure_open()?;
        let max_confs = if max_confs == 0 { i32::MAX } else { max_confs };
        let meta = self.meta();
        Ok(self
            .call(Duration::ZERO, self.rpc.list_unspent(&meta, min_confs, max_confs))
            .await?)
    }

    pub async fn next_address(&self, kind: AddressType) -> Result<String, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        Ok(self.call_unbounded(self.rpc.new_address(&meta, kind)).await?)
    }

    pub async fn list_addresses(&self) -> Result<Vec<AccountAddresses>, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        Ok(self.call_unbounded(self.rpc.list_addresses(&meta)).await?)
    }

    pub async fn sign_message(&self, address: &str, message: &str) -> Result<String, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        Ok(self
            .call(
                Duration::ZERO,
                self.rpc.sign_message(&meta, address, message.as_bytes()),
            )
            .await?)
    }

    pub async fn verify_message(
        &self,
        address: &str,
        message: &str,
        signature: &str,
    ) -> Result<VerifiedMessage, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        Ok(self
            .call(
                Duration::ZERO,
                self.rpc
                    .verify_message(&meta, address, message.as_bytes(), signature),
            )
            .await?)
    }

    /// Sends `amount` lokis to `address`; returns the txid.
    pub async fn simple_transfer(
        &self,
        address: &str,
        amount: i64,
        sat_per_vbyte: u64,
    ) -> Result<String, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        let request = SendCoinsRequest {
            addr: address.to_string(),
            amount,
            sat_per_vbyte,
            spend_unconfirmed: true,
        };
        Ok(self.call_unbounded(self.rpc.send_coins(&meta, request)).await?)
    }

    pub async fn simple_transfer_fee(
        &self,
        address: &str,
        amount: i64,
    ) -> Result<FeeEstimate, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        let request = EstimateFeeRequest {
            addr_to_amount: HashMap::from([(address.to_string(), amount)]),
            target_conf: 1,
            spend_unconfirmed: true,
        };
        Ok(self.call_unbounded(self.rpc.estimate_fee(&meta, request)).await?)
    }

    pub async fn fund_psbt(
        &self,
        outputs: &HashMap<String, i64>,
        sat_per_vbyte: u64,
        lock_expiration_seconds: u64,
    ) -> Result<FundedTransaction, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        let request = FundPsbtRequest {
            outputs: outputs
                .iter()
                .map(|(addr, amount)| (addr.clone(), u64::try_from(*amount).unwrap_or(0)))
                .collect(),
            sat_per_vbyte,
            lock_expiration_seconds,
        };
        let mut funded = self.call_unbounded(self.rpc.fund_psbt(&meta, request)).await?;
        funded.locks.retain(OutputLock::is_valid);
        Ok(funded)
    }

    pub async fn finalize_psbt(
        &self,
        funded: &FundedTransaction,
    ) -> Result<FinalizedTransaction, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        Ok(self
            .call_unbounded(self.rpc.finalize_psbt(&meta, &funded.psbt))
            .await?)
    }

    pub async fn publish_transaction(&self, raw_tx: &[u8]) -> Result<(), DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();
        let result = self
            .call_unbounded(self.rpc.publish_transaction(&meta, raw_tx))
            .await?;
        if !result.publish_error.is_empty() {
            return Err(DaemonError::Publish(result.publish_error));
        }
        Ok(())
    }

    /// Releases coin-selection holds; malformed locks are skipped.
    pub async fn release_outputs(&self, locks: &[OutputLock]) -> Result<(), DaemonError> {
        if locks.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;
        let meta = self.meta();
        for lock in locks.iter().filter(|lock| lock.is_valid()) {
            self.call_unbounded(self.rpc.release_output(&meta, lock))
                .await?;
        }
        Ok(())
    }

    pub fn set_max_transactions_limit(&self, limit: u32) {
        lock(&self.cache).set_limit(limit);
    }

    pub async fn fetch_transactions(&self) -> Result<Vec<Transaction>, DaemonError> {
        self.fetch_transactions_with(FetchOptions::default()).await
    }

    pub async fn fetch_transactions_with(
        &self,
        options: FetchOptions,
    ) -> Result<Vec<Transaction>, DaemonError> {
        self.ensure_open()?;
        let meta = self.meta();

        let (limit, peek_from) = {
            let cache = lock(&self.cache);
            (
                cache.limit(options),
                cache.fast_path_cursor(options, Instant::now()),
            )
        };

        if let Some(last_index) = peek_from {
            let peek = self
                .call(
                    PEEK_TIMEOUT,
                    self.rpc.get_transactions(
                        &meta,
                        TransactionQuery {
                            index_offset: clamp_cursor(last_index.saturating_add(1)),
                            max_transactions: 1,
                        },
                    ),
                )
                .await;

            match peek {
                Err(err) if err.is_rpc_starting() => {
                    let cache = lock(&self.cache);
                    if !cache.is_empty() {
                        return Err(DaemonError::BackendStarting {
                            stale: cache.snapshot(limit),
                            source: err,
                        });
                    }
                }
                Ok(page) if page.transactions.is_empty() => {
                    let mut cache = lock(&self.cache);
                    cache.touch(Instant::now());
                    return Ok(cache.snapshot(limit));
                }
                Ok(page) if page.last_index < last_index => {
                    log_warn!(
                        "transaction index regressed ({} < {last_index}), rebuilding cache",
                        page.last_index
                    );
                    lock(&self.cache).invalidate();
                    let rebuild = FetchOptions {
                        force_rescan: true,
                        ..options
                    };
                    return self.page_transactions(&meta, limit, rebuild).await;
                }
                Ok(_) => {}
                Err(err) => log_debug!("transaction peek failed: {err}"),
            }
        }

        self.page_transactions(&meta, limit, options).await
    }

    async fn page_transactions(
        &self,
        meta: &CallMeta,
        limit: usize,
        options: FetchOptions,
    ) -> Result<Vec<Transaction>, DaemonError> {
        let (start, existing) = lock(&self.cache).resume_point(options);
        match self.collect_pages(meta, start).await? {
            Paged::Complete { collected, last_index } => {
                Ok(self.store_merged(existing, collected, last_index, limit))
            }
            Paged::Regressed => {
                log_warn!("transaction index regressed below {start}, rebuilding cache");
                match self.collect_pages(meta, 0).await? {
                    Paged::Complete { collected, last_index } => {
                        Ok(self.store_merged(Vec::new(), collected, last_index, limit))
                    }
                    Paged::Regressed => Err(DaemonError::Rpc(RpcError::new(
                        RpcCode::DataLoss,
                        "transaction index is not monotonic",
                    ))),
                }
            }
        }
    }

    async fn collect_pages(&self, meta: &CallMeta, start: u64) -> Result<Paged, DaemonError> {
        let mut cursor = start;
        let mut last_index = start;
        let mut collected = Vec::new();

        loop {
            let res = self
                .call(
                    FETCH_TIMEOUT,
                    self.rpc.get_transactions(
                        meta,
                        TransactionQuery {
                            index_offset: clamp_cursor(cursor),
                            max_transactions: PAGE_SIZE,
                        },
                    ),
                )
                .await;

            let page = match res {
                Ok(page) => page,
                Err(err) if err.is_rpc_starting() => {
                    let cache = lock(&self.cache);
                    let stale = cache.snapshot(cache.limit(FetchOptions::default()));
                    return Err(DaemonError::BackendStarting { stale, source: err });
                }
                Err(err) if err.code == RpcCode::DeadlineExceeded => {
                    return Err(DaemonError::Timeout);
                }
                Err(err) => return Err(err.into()),
            };

            if page.transactions.is_empty() {
                break;
            }
            if start > 0 && page.last_index < start {
                return Ok(Paged::Regressed);
            }

            let page_len = page.transactions.len();
            last_index = page.last_index;
            collected.extend(page.transactions);

            cursor = page.last_index.saturating_add(1);
            if cursor > u64::from(u32::MAX) {
                break;
            }
            if page_len < PAGE_SIZE as usize {
                break;
            }
        }

        Ok(Paged::Complete {
            collected,
            last_index,
        })
    }

    fn store_merged(
        &self,
        existing: Vec<Transaction>,
        collected: Vec<Transaction>,
        last_index: u64,
        limit: usize,
    ) -> Vec<Transaction> {
        let merged = merge_transactions(existing, collected);
        let mut cache = lock(&self.cache);
        let stored = cache.store(merged, last_index, Instant::now());
        truncated(stored, limit)
    }

    pub async fn lightning_config(&self) -> Result<LightningConfig, DaemonError> {
        self.ensure_open()?;

        let rpc_port = listener_port(self.config.rpc_listeners.first()).unwrap_or(DEFAULT_RPC_PORT);
        let peer_port = listener_port(self.config.listeners.first()).unwrap_or(DEFAULT_PEER_PORT);
        let (rpc_address, peer_address) = match local_ip().await {
            Some(ip) => (
                SocketAddr::new(ip, rpc_port).to_string(),
                SocketAddr::new(ip, peer_port).to_string(),
            ),
            None => (
                self.config.rpc_listeners.first().cloned().unwrap_or_default(),
                self.config.listeners.first().cloned().unwrap_or_default(),
            ),
        };

        let meta = self.meta();
        let info = self
            .call(DEFAULT_RPC_TIMEOUT, self.rpc.get_info(&meta))
            .await
            .map_err(|err| DaemonError::Network(format!("failed to get info: {err}")))?;
        let cert = std::fs::read(&self.config.tls_cert_path)
            .map_err(|err| DaemonError::Tls(format!("failed to read tls cert: {err}")))?;

        Ok(LightningConfig {
            rpc_address,
            peer_address,
            pubkey: info.identity_pubkey,
            macaroon_hex: meta.macaroon_hex.unwrap_or_default(),
            tls_cert_hex: hex::encode(cert),
        })
    }
}

enum Paged {
    Complete {
        collected: Vec<Transaction>,
        last_index: u64,
    },
    Regressed,
}

fn clamp_cursor(cursor: u64) -> u32 {
    u32::try_from(cursor).unwrap_or(u32::MAX)
}

fn header_age(best_header_timestamp: i64) -> Duration {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let header = u64::try_from(best_header_timestamp).unwrap_or(0);
    Duration::from_secs(now.saturating_sub(header))
}

fn listener_port(listener: Option<&String>) -> Option<u16> {
    let (_, port) = listener?.rsplit_once(':')?;
    port.parse().ok()
}

/// Address of the interface used for outbound traffic.
async fn local_ip() -> Option<IpAddr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
