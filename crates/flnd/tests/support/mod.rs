#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use twallet_flnd::config::{admin_macaroon_path, DaemonConfig, ServiceConfig};
use twallet_flnd::rpc::{
    AccountAddresses, AddressType, BlockEpoch, CallMeta, EstimateFeeRequest, FeeEstimate,
    FinalizedTransaction, FundPsbtRequest, FundedTransaction, GeneratedSeed, InitWalletRequest,
    NodeInfo, OutPoint, OutputLock, PublishResult, RecoveryInfo, RpcStream, SendCoinsRequest,
    Transaction, TransactionPage, TransactionQuery, Utxo, VerifiedMessage, WalletBalance,
    WalletRpc, WalletState,
};
use twallet_flnd::{
    DialOptions, NodeBackend, RpcCode, RpcError, ShutdownSignal, Status, Subscription, Update,
};

pub const TEST_CERT: &str = "-----BEGIN CERTIFICATE-----\nAQID\n-----END CERTIFICATE-----\n";
pub const SEED_WORDS: usize = 24;

pub fn mnemonic() -> Vec<String> {
    (0..SEED_WORDS).map(|i| format!("word{i}")).collect()
}

/// Wallet directory with the files a started node leaves behind.
pub fn wallet_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("tls.cert"), TEST_CERT).expect("cert");
    let macaroon = admin_macaroon_path(dir.path(), Default::default());
    std::fs::create_dir_all(macaroon.parent().expect("parent")).expect("chain dir");
    std::fs::write(&macaroon, [0xab, 0xcd]).expect("macaroon");
    dir
}

pub fn service_config(dir: &Path) -> ServiceConfig {
    ServiceConfig {
        wallet_dir: dir.to_path_buf(),
        transaction_display_limit: 100,
        ..ServiceConfig::default()
    }
}

pub fn tx(index: u64) -> Transaction {
    Transaction {
        tx_hash: format!("tx{index}"),
        amount: index as i64 * 1_000,
        time_stamp: 1_700_000_000 + index as i64,
        block_height: index as i32,
        ..Transaction::default()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Node-side behaviour shared by every connection the fake backend opens.
pub struct Script {
    pub synced: AtomicBool,
    pub block_height: AtomicU32,
    pub get_info_error: Mutex<Option<RpcError>>,
    pub unlock_results: Mutex<VecDeque<Result<(), RpcError>>>,
    pub unlock_calls: AtomicUsize,
    pub recovery: Mutex<RecoveryInfo>,
    pub utxos: Mutex<Vec<Utxo>>,
    pub transactions: Mutex<Vec<Transaction>>,
    pub tx_error: Mutex<Option<RpcError>>,
    pub tx_calls: AtomicUsize,
    pub init_requests: Mutex<Vec<InitWalletRequest>>,
    pub released: Mutex<Vec<OutputLock>>,
    pub publish_error: Mutex<String>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            synced: AtomicBool::new(false),
            block_height: AtomicU32::new(100),
            get_info_error: Mutex::new(None),
            unlock_results: Mutex::new(VecDeque::new()),
            unlock_calls: AtomicUsize::new(0),
            recovery: Mutex::new(RecoveryInfo::default()),
            utxos: Mutex::new(Vec::new()),
            transactions: Mutex::new(Vec::new()),
            tx_error: Mutex::new(None),
            tx_calls: AtomicUsize::new(0),
            init_requests: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            publish_error: Mutex::new(String::new()),
        }
    }
}

type Feed<T> = Mutex<Option<mpsc::Sender<Result<T, RpcError>>>>;
type Tap<T> = Mutex<Option<mpsc::Receiver<Result<T, RpcError>>>>;

fn feed<T>() -> (Feed<T>, Tap<T>) {
    let (tx, rx) = mpsc::channel(64);
    (Mutex::new(Some(tx)), Mutex::new(Some(rx)))
}

fn take_tap<T>(tap: &Tap<T>) -> Result<RpcStream<T>, RpcError> {
    tap.lock()
        .expect("tap")
        .take()
        .ok_or_else(|| RpcError::new(RpcCode::Unavailable, "stream already open"))
}

pub struct FakeRpc {
    script: Arc<Script>,
    states: Feed<WalletState>,
    state_tap: Tap<WalletState>,
    txs: Feed<Transaction>,
    tx_tap: Tap<Transaction>,
    blocks: Feed<BlockEpoch>,
    block_tap: Tap<BlockEpoch>,
    pub closed: AtomicBool,
}

impl FakeRpc {
    fn new(script: Arc<Script>) -> Self {
        let (states, state_tap) = feed();
        let (txs, tx_tap) = feed();
        let (blocks, block_tap) = feed();
        Self {
            script,
            states,
            state_tap,
            txs,
            tx_tap,
            blocks,
            block_tap,
            closed: AtomicBool::new(false),
        }
    }

    pub fn push_state(&self, state: WalletState) {
        if let Some(tx) = self.states.lock().expect("states").as_ref() {
            let _ = tx.try_send(Ok(state));
        }
    }

    pub fn fail_state_stream(&self, err: RpcError) {
        if let Some(tx) = self.states.lock().expect("states").as_ref() {
            let _ = tx.try_send(Err(err));
        }
    }

    pub fn push_transaction(&self, tx: Transaction) {
        if let Some(feed) = self.txs.lock().expect("txs").as_ref() {
            let _ = feed.try_send(Ok(tx));
        }
    }

    pub fn push_block(&self, height: u32, hash: Vec<u8>) {
        if let Some(feed) = self.blocks.lock().expect("blocks").as_ref() {
            let _ = feed.try_send(Ok(BlockEpoch { hash, height }));
        }
    }
}

#[async_trait]
impl WalletRpc for FakeRpc {
    async fn subscribe_state(&self) -> Result<RpcStream<WalletState>, RpcError> {
        take_tap(&self.state_tap)
    }

    async fn subscribe_transactions(&self, _meta: &CallMeta) -> Result<RpcStream<Transaction>, RpcError> {
        take_tap(&self.tx_tap)
    }

    async fn subscribe_block_epochs(&self, _meta: &CallMeta) -> Result<RpcStream<BlockEpoch>, RpcError> {
        take_tap(&self.block_tap)
    }

    async fn get_info(&self, _meta: &CallMeta) -> Result<NodeInfo, RpcError> {
        if let Some(err) = self.script.get_info_error.lock().expect("info").clone() {
            return Err(err);
        }
        Ok(NodeInfo {
            identity_pubkey: "02aa".to_string(),
            block_height: self.script.block_height.load(Ordering::SeqCst),
            block_hash: "00ff".to_string(),
            best_header_timestamp: unix_now(),
            synced_to_chain: self.script.synced.load(Ordering::SeqCst),
            version: "0.0.0-test".to_string(),
        })
    }

    async fn gen_seed(&self) -> Result<GeneratedSeed, RpcError> {
        Ok(GeneratedSeed {
            mnemonic: mnemonic(),
            enciphered_seed: vec![7; 33],
        })
    }

    async fn init_wallet(&self, request: InitWalletRequest) -> Result<(), RpcError> {
        self.script.init_requests.lock().expect("init").push(request);
        Ok(())
    }

    async fn unlock_wallet(&self, _password: &[u8], _recovery_window: i32) -> Result<(), RpcError> {
        self.script.unlock_calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .unlock_results
            .lock()
            .expect("unlock")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn change_password(&self, _meta: &CallMeta, _current: &[u8], _new: &[u8]) -> Result<(), RpcError> {
        Ok(())
    }

    async fn wallet_balance(&self, _meta: &CallMeta) -> Result<WalletBalance, RpcError> {
        Ok(WalletBalance {
            total: 1_500,
            confirmed: 1_000,
            unconfirmed: 500,
            locked: 0,
        })
    }

    async fn get_recovery_info(&self, _meta: &CallMeta) -> Result<RecoveryInfo, RpcError> {
        Ok(*self.script.recovery.lock().expect("recovery"))
    }

    async fn list_unspent(&self, _meta: &CallMeta, _min: i32, _max: i32) -> Result<Vec<Utxo>, RpcError> {
        Ok(self.script.utxos.lock().expect("utxos").clone())
    }

    async fn get_transactions(
        &self,
        _meta: &CallMeta,
        query: TransactionQuery,
    ) -> Result<TransactionPage, RpcError> {
        self.script.tx_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script.tx_error.lock().expect("tx error").clone() {
            return Err(err);
        }
        // Index of a transaction is its position plus one.
        let all = self.script.transactions.lock().expect("txs");
        let start = (query.index_offset as usize).saturating_sub(1);
        let page: Vec<Transaction> = all
            .iter()
            .skip(start)
            .take(query.max_transactions as usize)
            .cloned()
            .collect();
        let last_index = (start + page.len()) as u64;
        Ok(TransactionPage {
            transactions: page,
            last_index,
        })
    }

    async fn new_address(&self, _meta: &CallMeta, _kind: AddressType) -> Result<String, RpcError> {
        Ok("fc1qtest".to_string())
    }

    async fn list_addresses(&self, _meta: &CallMeta) -> Result<Vec<AccountAddresses>, RpcError> {
        Ok(Vec::new())
    }

    async fn sign_message(&self, _meta: &CallMeta, _address: &str, message: &[u8]) -> Result<String, RpcError> {
        Ok(format!("sig:{}", String::from_utf8_lossy(message)))
    }

    async fn verify_message(
        &self,
        _meta: &CallMeta,
        _address: &str,
        message: &[u8],
        signature: &str,
    ) -> Result<VerifiedMessage, RpcError> {
        Ok(VerifiedMessage {
            valid: signature == format!("sig:{}", String::from_utf8_lossy(message)),
            pubkey: "02aa".to_string(),
        })
    }

    async fn send_coins(&self, _meta: &CallMeta, request: SendCoinsRequest) -> Result<String, RpcError> {
        Ok(format!("txid-{}", request.amount))
    }

    async fn estimate_fee(&self, _meta: &CallMeta, _request: EstimateFeeRequest) -> Result<FeeEstimate, RpcError> {
        Ok(FeeEstimate {
            fee_sat: 141,
            sat_per_vbyte: 1,
        })
    }

    async fn fund_psbt(&self, _meta: &CallMeta, _request: FundPsbtRequest) -> Result<FundedTransaction, RpcError> {
        Ok(FundedTransaction {
            psbt: vec![0x70, 0x73, 0x62, 0x74],
            change_output_index: 1,
            locks: vec![
                OutputLock {
                    id: vec![1],
                    outpoint: Some(OutPoint {
                        txid: "aa".to_string(),
                        output_index: 0,
                    }),
                },
                OutputLock {
                    id: Vec::new(),
                    outpoint: None,
                },
            ],
        })
    }

    async fn finalize_psbt(&self, _meta: &CallMeta, funded_psbt: &[u8]) -> Result<FinalizedTransaction, RpcError> {
        Ok(FinalizedTransaction {
            signed_psbt: funded_psbt.to_vec(),
            raw_final_tx: vec![0x02, 0x00],
        })
    }

    async fn publish_transaction(&self, _meta: &CallMeta, _raw_tx: &[u8]) -> Result<PublishResult, RpcError> {
        Ok(PublishResult {
            publish_error: self.script.publish_error.lock().expect("publish").clone(),
        })
    }

    async fn release_output(&self, _meta: &CallMeta, lock: &OutputLock) -> Result<(), RpcError> {
        self.script.released.lock().expect("released").push(lock.clone());
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.states.lock().expect("states").take();
        self.txs.lock().expect("txs").take();
        self.blocks.lock().expect("blocks").take();
    }
}

/// How the next node run behaves.
#[derive(Clone, Debug)]
pub enum RunMode {
    Normal,
    FailStart(String),
    Panic(String),
    /// Starts after the given delay, then behaves like `Normal`.
    SlowStart(Duration),
    /// Starts, then exits with an error once the delay has passed.
    CrashAfter(Duration, String),
}

#[derive(Default)]
pub struct FakeBackend {
    pub script: Arc<Script>,
    pub modes: Mutex<VecDeque<RunMode>>,
    /// Used once `modes` is exhausted.
    pub fallback: Mutex<Option<RunMode>>,
    pub runs: AtomicUsize,
    pub configs: Mutex<Vec<DaemonConfig>>,
    pub rpcs: Mutex<Vec<Arc<FakeRpc>>>,
    /// When each run began.
    pub starts: Mutex<Vec<tokio::time::Instant>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_modes(modes: impl IntoIterator<Item = RunMode>) -> Arc<Self> {
        let backend = Self::default();
        backend.modes.lock().expect("modes").extend(modes);
        Arc::new(backend)
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn rpc(&self, n: usize) -> Option<Arc<FakeRpc>> {
        self.rpcs.lock().expect("rpcs").get(n).cloned()
    }

    pub fn config(&self, n: usize) -> Option<DaemonConfig> {
        self.configs.lock().expect("configs").get(n).cloned()
    }

    /// Time between consecutive runs.
    pub fn start_gaps(&self) -> Vec<Duration> {
        let starts = self.starts.lock().expect("starts");
        starts.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }

    /// Waits for the `n`th dialed connection (zero based).
    pub async fn wait_rpc(&self, n: usize) -> Arc<FakeRpc> {
        wait_until(|| self.rpc(n).is_some()).await;
        self.rpc(n).expect("rpc")
    }

    fn next_mode(&self) -> RunMode {
        if let Some(mode) = self.modes.lock().expect("modes").pop_front() {
            return mode;
        }
        self.fallback
            .lock()
            .expect("fallback")
            .clone()
            .unwrap_or(RunMode::Normal)
    }
}

#[async_trait]
impl NodeBackend for FakeBackend {
    fn validate_config(&self, mut config: DaemonConfig) -> Result<DaemonConfig, String> {
        if config.rpc_listeners.is_empty() {
            config.rpc_listeners.push("127.0.0.1:10005".to_string());
        }
        Ok(config)
    }

    async fn run(
        &self,
        config: DaemonConfig,
        started: oneshot::Sender<()>,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), String> {
        self.starts
            .lock()
            .expect("starts")
            .push(tokio::time::Instant::now());
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().expect("configs").push(config);
        match self.next_mode() {
            RunMode::Normal => {
                let _ = started.send(());
                shutdown.requested().await;
                Ok(())
            }
            RunMode::SlowStart(delay) => {
                tokio::select! {
                    _ = shutdown.requested() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
                let _ = started.send(());
                shutdown.requested().await;
                Ok(())
            }
            RunMode::CrashAfter(delay, message) => {
                let _ = started.send(());
                tokio::select! {
                    _ = shutdown.requested() => Ok(()),
                    _ = tokio::time::sleep(delay) => Err(message),
                }
            }
            RunMode::FailStart(message) => Err(message),
            RunMode::Panic(message) => panic!("{message}"),
        }
    }

    async fn dial(&self, _options: DialOptions) -> Result<Arc<dyn WalletRpc>, String> {
        let rpc = Arc::new(FakeRpc::new(Arc::clone(&self.script)));
        self.rpcs.lock().expect("rpcs").push(Arc::clone(&rpc));
        Ok(rpc)
    }

    fn decode_enciphered_seed(&self, seed: &[u8]) -> Result<Vec<String>, String> {
        if seed.first() == Some(&0xff) {
            return Err("invalid enciphered seed checksum".to_string());
        }
        Ok(mnemonic())
    }

    fn encipher_mnemonic(&self, words: &[String]) -> Result<Vec<u8>, String> {
        if words.len() != SEED_WORDS {
            return Err(format!("mnemonic must be {SEED_WORDS} words"));
        }
        Ok(vec![1; 33])
    }
}

pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next update in `state`, skipping anything else.
pub async fn next_state(sub: &mut Subscription, state: Status) -> Update {
    loop {
        let update = sub.recv().await.expect("subscription closed");
        if update.state == state {
            return update;
        }
    }
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub root: tokio_util::sync::CancellationToken,
    pub backend: Arc<FakeBackend>,
    pub service: twallet_flnd::Service,
}

impl Harness {
    pub fn start(backend: Arc<FakeBackend>) -> Self {
        Self::start_with(backend, |_| {})
    }

    pub fn start_with(backend: Arc<FakeBackend>, tweak: impl FnOnce(&mut ServiceConfig)) -> Self {
        let dir = wallet_dir();
        let mut config = service_config(dir.path());
        tweak(&mut config);
        let root = tokio_util::sync::CancellationToken::new();
        let service = twallet_flnd::Service::new(&root, &config, backend.clone());
        Self {
            dir,
            root,
            backend,
            service,
        }
    }

    /// Waits until a node run is registered and returns its connection.
    pub async fn connected(&self) -> Arc<FakeRpc> {
        wait_until(|| self.service.is_running()).await;
        let runs = self.backend.runs();
        self.backend.wait_rpc(runs - 1).await
    }
}
