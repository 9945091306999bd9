use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(50);
pub const DEFAULT_RPC_PORT: u16 = 10005;
pub const DEFAULT_PEER_PORT: u16 = 5521;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet3,
    Testnet4,
    Simnet,
    Regtest,
    Signet,
}

impl Network {
    /// Directory name the node uses under `data/chain/flokicoin/`.
    pub fn dir_name(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet3 => "testnet",
            Network::Testnet4 => "testnet4",
            Network::Simnet => "simnet",
            Network::Regtest => "regtest",
            Network::Signet => "signet",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "testnet3" | "test" => Some(Network::Testnet3),
            "testnet4" => Some(Network::Testnet4),
            "simnet" => Some(Network::Simnet),
            "regtest" => Some(Network::Regtest),
            "signet" => Some(Network::Signet),
            _ => None,
        }
    }
}

/// Options the wallet front-end hands to the supervisor.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceConfig {
    pub wallet_dir: PathBuf,
    pub network: Network,
    pub connection_timeout: Duration,
    pub debug_level: String,
    pub transaction_display_limit: u32,
    pub reset_wallet_transactions: bool,

    pub connect_peers: Vec<String>,
    pub add_peers: Vec<String>,
    pub fee_url: Option<String>,

    pub tls_extra_ips: Vec<String>,
    pub tls_extra_domains: Vec<String>,
    pub tls_auto_refresh: bool,

    pub rpc_listeners: Vec<String>,
    pub rest_listeners: Vec<String>,
    pub listeners: Vec<String>,
    pub rest_cors: Vec<String>,

    pub max_pending_channels: Option<u32>,
    pub max_chan_size: Option<i64>,
    pub min_chan_size: Option<i64>,

    pub alias: Option<String>,
    pub color: Option<String>,

    pub watchtower_active: bool,
    pub watchtower_dir: Option<PathBuf>,

    pub external_ips: Vec<String>,
    pub external_hosts: Vec<String>,
    pub disable_listen: bool,
    pub nat: bool,
}

/// Value handed to one node start. Cloned per attempt so that later edits of
/// the long-lived config never reach a start in progress.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DaemonConfig {
    pub lnd_dir: PathBuf,
    pub network: Network,
    pub chain_backend: String,
    pub connection_timeout: Duration,
    pub debug_level: String,
    pub console_log_disabled: bool,
    pub reset_wallet_transactions: bool,

    pub connect_peers: Vec<String>,
    pub add_peers: Vec<String>,
    pub fee_url: Option<String>,

    pub tls_cert_path: PathBuf,
    pub admin_macaroon_path: PathBuf,
    pub tls_extra_ips: Vec<String>,
    pub tls_extra_domains: Vec<String>,
    pub tls_auto_refresh: bool,

    pub rpc_listeners: Vec<String>,
    pub rest_listeners: Vec<String>,
    pub listeners: Vec<String>,
    pub rest_cors: Vec<String>,

    pub max_pending_channels: Option<u32>,
    pub max_chan_size: Option<i64>,
    pub min_chan_size: Option<i64>,
    pub alias: Option<String>,
    pub color: Option<String>,
    pub watchtower_active: bool,
    pub watchtower_dir: Option<PathBuf>,

    pub external_ips: Vec<String>,
    pub external_hosts: Vec<String>,
    pub disable_listen: bool,
    pub nat: bool,
}

impl DaemonConfig {
    pub fn from_service(cfg: &ServiceConfig) -> Self {
        let lnd_dir = cfg.wallet_dir.clone();
        let connection_timeout = if cfg.connection_timeout.is_zero() {
            DEFAULT_CONNECTION_TIMEOUT
        } else {
            cfg.connection_timeout
        };
        let debug_level = if cfg.debug_level.trim().is_empty() {
            "info".to_string()
        } else {
            cfg.debug_level.clone()
        };
        let watchtower_dir = if cfg.watchtower_active {
            cfg.watchtower_dir.clone()
        } else {
            None
        };

        Self {
            tls_cert_path: lnd_dir.join("tls.cert"),
            admin_macaroon_path: admin_macaroon_path(&lnd_dir, cfg.network),
            lnd_dir,
            network: cfg.network,
            chain_backend: "neutrino".to_string(),
            connection_timeout,
            debug_level,
            console_log_disabled: true,
            reset_wallet_transactions: cfg.reset_wallet_transactions,
            connect_peers: cfg.connect_peers.clone(),
            add_peers: cfg.add_peers.clone(),
            fee_url: cfg.fee_url.clone(),
            tls_extra_ips: cfg.tls_extra_ips.clone(),
            tls_extra_domains: cfg.tls_extra_domains.clone(),
            tls_auto_refresh: cfg.tls_auto_refresh,
            rpc_listeners: cfg.rpc_listeners.clone(),
            rest_listeners: cfg.rest_listeners.clone(),
            listeners: cfg.listeners.clone(),
            rest_cors: cfg.rest_cors.clone(),
            max_pending_channels: cfg.max_pending_channels.filter(|v| *v > 0),
            max_chan_size: cfg.max_chan_size.filter(|v| *v > 0),
            min_chan_size: cfg.min_chan_size.filter(|v| *v > 0),
            alias: cfg.alias.clone().filter(|v| !v.is_empty()),
            color: cfg.color.clone().filter(|v| !v.is_empty()),
            watchtower_active: cfg.watchtower_active,
            watchtower_dir,
            external_ips: cfg.external_ips.clone(),
            external_hosts: cfg.external_hosts.clone(),
            disable_listen: cfg.disable_listen,
            nat: cfg.nat,
        }
    }

    /// First RPC listener; the node fills in its default during validation.
    pub fn rpc_endpoint(&self) -> Option<&str> {
        self.rpc_listeners.first().map(String::as_str)
    }

    pub fn chain_dir(&self) -> PathBuf {
        chain_dir(&self.lnd_dir, self.network)
    }
}

pub fn chain_dir(wallet_dir: &Path, network: Network) -> PathBuf {
    wallet_dir
        .join("data")
        .join("chain")
        .join("flokicoin")
        .join(network.dir_name())
}

pub fn admin_macaroon_path(wallet_dir: &Path, network: Network) -> PathBuf {
    chain_dir(wallet_dir, network).join("admin.macaroon")
}
