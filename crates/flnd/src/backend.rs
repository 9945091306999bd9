//! Embedded node seam: how a node is launched, dialed and asked to stop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::config::DaemonConfig;
use crate::rpc::WalletRpc;

pub const MAX_RECV_MSG_SIZE: usize = 50 * 1024 * 1024;
pub const MAX_SEND_MSG_SIZE: usize = 20 * 1024 * 1024;
pub const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ConnectBackoff {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for ConnectBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Parameters for the secure control channel to a started node.
#[derive(Clone, Debug, PartialEq)]
pub struct DialOptions {
    pub endpoint: String,
    /// DER blocks of the node's TLS certificate chain.
    pub tls_certificates: Vec<Vec<u8>>,
    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,
    pub gzip: bool,
    pub min_connect_timeout: Duration,
    pub backoff: ConnectBackoff,
}

impl DialOptions {
    pub fn new(endpoint: impl Into<String>, tls_certificates: Vec<Vec<u8>>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls_certificates,
            max_recv_msg_size: MAX_RECV_MSG_SIZE,
            max_send_msg_size: MAX_SEND_MSG_SIZE,
            gzip: true,
            min_connect_timeout: MIN_CONNECT_TIMEOUT,
            backoff: ConnectBackoff::default(),
        }
    }
}

/// Shutdown request observed by a running node.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested or the requester is gone.
    pub async fn requested(&mut self) {
        let _ = self.rx.wait_for(|requested| *requested).await;
    }
}

#[async_trait]
pub trait NodeBackend: Send + Sync + 'static {
    /// Fills in node defaults and rejects unusable settings.
    fn validate_config(&self, config: DaemonConfig) -> Result<DaemonConfig, String>;

    /// Runs the node until `shutdown` is requested. `started` fires once the
    /// control API accepts connections; dropping it unsent means the node
    /// never came up.
    async fn run(
        &self,
        config: DaemonConfig,
        started: oneshot::Sender<()>,
        shutdown: ShutdownSignal,
    ) -> Result<(), String>;

    async fn dial(&self, options: DialOptions) -> Result<Arc<dyn WalletRpc>, String>;

    /// Mnemonic words for a raw enciphered seed.
    fn decode_enciphered_seed(&self, seed: &[u8]) -> Result<Vec<String>, String>;

    /// Raw enciphered seed for mnemonic words; fails on an invalid mnemonic.
    fn encipher_mnemonic(&self, mnemonic: &[String]) -> Result<Vec<u8>, String>;
}
