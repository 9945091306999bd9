use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use twallet_flnd::rpc::AddressType;
use twallet_flnd::{Network, ServiceConfig};
use twallet_log::{Format, Level, LogConfig};
use zeroize::Zeroizing;

pub const DEFAULT_CONFIG_FILE_NAME: &str = "twallet.conf";
pub const DEFAULT_WALLET_DIR_NAME: &str = ".twallet";
pub const LOG_FILE_NAME: &str = "twallet.log";
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_TRANSACTION_DISPLAY_LIMIT: u32 = 121;
pub const DEFAULT_RPC_LISTEN: &str = "127.0.0.1:10005";
pub const DEFAULT_REST_LISTEN: &str = "127.0.0.1:5050";
pub const DEFAULT_REST_CORS: &str = "http://localhost:3000";
pub const DEFAULT_PEER_LISTEN: &str = "0.0.0.0:5521";
pub const MAINNET_FEE_URL: &str = "https://lokichain.info/api/v1/fees/recommended";

/// Options that take no value on the command line.
const SWITCHES: &[&str] = &[
    "testnet",
    "testnet4",
    "regtest",
    "simnet",
    "signet",
    "resetwallettransactions",
    "tlsautorefresh",
    "nolisten",
    "nat",
];

const NETWORK_SWITCHES: [&str; 5] = ["testnet", "testnet4", "regtest", "simnet", "signet"];
const NETWORKS: [Network; 5] = [
    Network::Testnet3,
    Network::Testnet4,
    Network::Regtest,
    Network::Simnet,
    Network::Signet,
];

const VALUED: &[&str] = &[
    "walletdir",
    "connectiontimeout",
    "debuglevel",
    "loglevel",
    "logformat",
    "transactiondisplaylimit",
    "connect",
    "addpeer",
    "feeurl",
    "tlsextraip",
    "tlsextradomain",
    "rpclisten",
    "restlisten",
    "listen",
    "restcors",
    "externalip",
    "externalhosts",
    "alias",
    "color",
    "addresstype",
    "defaultpassword",
];

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AddressKind {
    Taproot,
    #[default]
    Segwit,
    NestedSegwit,
}

impl AddressKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "taproot" => Some(Self::Taproot),
            "segwit" => Some(Self::Segwit),
            "nested-segwit" => Some(Self::NestedSegwit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Taproot => "taproot",
            Self::Segwit => "segwit",
            Self::NestedSegwit => "nested-segwit",
        }
    }

    /// Type for addresses that may already have been used.
    pub fn used(self) -> AddressType {
        match self {
            Self::Taproot => AddressType::TaprootPubkey,
            Self::Segwit => AddressType::WitnessPubkeyHash,
            Self::NestedSegwit => AddressType::NestedPubkeyHash,
        }
    }

    /// Type that always yields a fresh address.
    pub fn unused(self) -> AddressType {
        match self {
            Self::Taproot => AddressType::UnusedTaprootPubkey,
            Self::Segwit => AddressType::UnusedWitnessPubkeyHash,
            Self::NestedSegwit => AddressType::UnusedNestedPubkeyHash,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub config_file: Option<PathBuf>,
    /// `None` switches application logging off.
    pub log_level: Option<Level>,
    pub log_format: Format,
    pub address_type: AddressKind,
    /// Prefills passphrase prompts. Testing only.
    pub default_password: Zeroizing<String>,
}

impl AppConfig {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level,
            format: self.log_format,
            timestamps: true,
        }
    }

    pub fn log_file(&self) -> PathBuf {
        self.service.wallet_dir.join(LOG_FILE_NAME)
    }
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<AppConfig>),
    PrintHelp,
    PrintVersion,
}

enum Origin<'a> {
    Cli,
    Conf(&'a Path),
}

impl fmt::Display for Origin<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Cli => Ok(()),
            Origin::Conf(path) => write!(f, " in {}", path.display()),
        }
    }
}

/// Raw values per option, last one wins for single-valued options.
type RawOptions = HashMap<String, Vec<String>>;

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = RawOptions::new();
    let mut config_file: Option<PathBuf> = None;
    let mut args = raw_args.into_iter().peekable();

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value.to_string())),
            _ => (arg.clone(), None),
        };

        let name = match flag.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-v" => return Ok(CliAction::PrintVersion),
            "-w" => "walletdir",
            "-c" | "--config" => "config",
            "-t" => "connectiontimeout",
            other => match other.strip_prefix("--") {
                Some(name) if SWITCHES.contains(&name) || VALUED.contains(&name) => name,
                _ => return Err(format!("unknown argument '{arg}'\n{}", usage())),
            },
        };

        if SWITCHES.contains(&name) {
            cli.entry(name.to_string())
                .or_default()
                .push(inline.unwrap_or_else(|| "1".to_string()));
            continue;
        }

        let value = match inline {
            Some(value) => value,
            None => args
                .next()
                .ok_or_else(|| format!("missing value for --{name}\n{}", usage()))?,
        };
        if name == "config" {
            config_file = Some(PathBuf::from(value));
            continue;
        }
        cli.entry(name.to_string()).or_default().push(value);
    }

    let (conf_path, explicit) = match config_file {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE_NAME), false),
    };
    let conf = load_twallet_conf(&conf_path)?;
    if explicit && conf.is_none() {
        return Err(format!("config file {} not found", conf_path.display()));
    }

    let mut config = build_config(&cli, Origin::Cli)?;
    if let Some(conf) = conf {
        let mut merged = conf;
        let cli_network = NETWORK_SWITCHES.iter().any(|key| cli.contains_key(*key));
        merged.retain(|key, _| {
            !cli.contains_key(key) && !(cli_network && NETWORK_SWITCHES.contains(&key.as_str()))
        });
        apply_options(&mut config, &merged, Origin::Conf(&conf_path))?;
        config.config_file = Some(conf_path);
    }
    validate(&mut config)?;
    Ok(CliAction::Run(Box::new(config)))
}

fn build_config(cli: &RawOptions, origin: Origin<'_>) -> Result<AppConfig, String> {
    let mut config = default_config();
    apply_options(&mut config, cli, origin)?;
    Ok(config)
}

pub fn default_config() -> AppConfig {
    let wallet_dir = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(DEFAULT_WALLET_DIR_NAME);

    AppConfig {
        service: ServiceConfig {
            wallet_dir,
            network: Network::Mainnet,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            debug_level: "info".to_string(),
            transaction_display_limit: DEFAULT_TRANSACTION_DISPLAY_LIMIT,
            tls_auto_refresh: true,
            rpc_listeners: vec![DEFAULT_RPC_LISTEN.to_string()],
            rest_listeners: vec![DEFAULT_REST_LISTEN.to_string()],
            listeners: vec![DEFAULT_PEER_LISTEN.to_string()],
            rest_cors: vec![DEFAULT_REST_CORS.to_string()],
            ..ServiceConfig::default()
        },
        config_file: None,
        log_level: Some(Level::Info),
        log_format: Format::Text,
        address_type: AddressKind::Segwit,
        default_password: Zeroizing::new(String::new()),
    }
}

fn apply_options(config: &mut AppConfig, opts: &RawOptions, origin: Origin<'_>) -> Result<(), String> {
    let service = &mut config.service;
    let last = |key: &str| opts.get(key).and_then(|values| values.last()).map(String::as_str);
    let list = |key: &str| -> Option<Vec<String>> {
        opts.get(key).map(|values| {
            values
                .iter()
                .flat_map(|value| value.split(','))
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
                .collect()
        })
    };
    let switch = |key: &str| -> Result<Option<bool>, String> {
        match last(key) {
            Some(raw) => parse_conf_bool(raw)
                .map(Some)
                .ok_or_else(|| format!("invalid {key} value '{raw}'{origin}")),
            None => Ok(None),
        }
    };

    if let Some(raw) = last("walletdir") {
        service.wallet_dir = expand_home(raw);
    }

    for (key, network) in NETWORK_SWITCHES.into_iter().zip(NETWORKS) {
        if switch(key)? == Some(true) {
            service.network = network;
        }
    }

    if let Some(raw) = last("connectiontimeout") {
        service.connection_timeout = parse_duration(raw)
            .ok_or_else(|| format!("invalid connectiontimeout '{raw}'{origin}"))?;
    }
    if let Some(raw) = last("debuglevel") {
        service.debug_level = raw.trim().to_string();
    }
    if let Some(raw) = last("loglevel") {
        config.log_level = parse_log_level(raw)
            .ok_or_else(|| format!("invalid loglevel '{raw}'{origin}"))?;
    }
    if let Some(raw) = last("logformat") {
        config.log_format =
            Format::parse(raw).ok_or_else(|| format!("invalid logformat '{raw}'{origin}"))?;
    }
    if let Some(raw) = last("transactiondisplaylimit") {
        service.transaction_display_limit = raw
            .trim()
            .parse()
            .map_err(|_| format!("invalid transactiondisplaylimit '{raw}'{origin}"))?;
    }
    if let Some(value) = switch("resetwallettransactions")? {
        service.reset_wallet_transactions = value;
    }
    if let Some(value) = switch("tlsautorefresh")? {
        service.tls_auto_refresh = value;
    }
    if let Some(value) = switch("nolisten")? {
        service.disable_listen = value;
    }
    if let Some(value) = switch("nat")? {
        service.nat = value;
    }

    if let Some(values) = list("connect") {
        service.connect_peers = values;
    }
    if let Some(values) = list("addpeer") {
        service.add_peers = values;
    }
    if let Some(values) = list("tlsextraip") {
        service.tls_extra_ips = values;
    }
    if let Some(values) = list("tlsextradomain") {
        service.tls_extra_domains = values;
    }
    if let Some(values) = list("rpclisten") {
        service.rpc_listeners = values;
    }
    if let Some(values) = list("restlisten") {
        service.rest_listeners = values;
    }
    if let Some(values) = list("listen") {
        service.listeners = values;
    }
    if let Some(values) = list("restcors") {
        service.rest_cors = values;
    }
    if let Some(values) = list("externalip") {
        service.external_ips = values;
    }
    if let Some(values) = list("externalhosts") {
        service.external_hosts = values;
    }

    if let Some(raw) = last("feeurl") {
        service.fee_url = Some(raw.trim().to_string()).filter(|url| !url.is_empty());
    }
    if let Some(raw) = last("alias") {
        service.alias = Some(raw.to_string());
    }
    if let Some(raw) = last("color") {
        service.color = Some(raw.trim().to_string());
    }
    if let Some(raw) = last("addresstype") {
        config.address_type = AddressKind::parse(raw).ok_or_else(|| {
            format!("invalid addresstype '{raw}'{origin} (expected taproot|segwit|nested-segwit)")
        })?;
    }
    if let Some(raw) = last("defaultpassword") {
        config.default_password = Zeroizing::new(raw.to_string());
    }
    Ok(())
}

fn validate(config: &mut AppConfig) -> Result<(), String> {
    let service = &mut config.service;
    if service.wallet_dir.as_os_str().is_empty() {
        return Err(format!("walletdir must not be empty\n{}", usage()));
    }
    if service.connection_timeout.is_zero() {
        return Err(format!("connectiontimeout must be positive\n{}", usage()));
    }
    if let Some(color) = &service.color {
        let hex = color.strip_prefix('#').unwrap_or_default();
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid color '{color}' (expected #RRGGBB)"));
        }
    }
    if service.network == Network::Mainnet && service.fee_url.is_none() {
        service.fee_url = Some(MAINNET_FEE_URL.to_string());
    }
    Ok(())
}

fn parse_log_level(raw: &str) -> Option<Option<Level>> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "fatal" | "panic" => Some(Some(Level::Error)),
        _ => twallet_log::parse_filter(raw).ok(),
    }
}

fn expand_home(raw: &str) -> PathBuf {
    let raw = raw.trim();
    match raw.strip_prefix("~/") {
        Some(rest) => std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(rest))
            .unwrap_or_else(|| PathBuf::from(raw)),
        None => PathBuf::from(raw),
    }
}

/// `500ms`, `45s`, `2m`, `1h`, or a sequence such as `1m30s`.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit..];
    }
    Some(total)
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// `key=value` lines; `#`/`;` start comments, `[section]` headers are
/// skipped, and a bare key means `1`.
fn load_twallet_conf(path: &Path) -> Result<Option<RawOptions>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out = RawOptions::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        if let Some(idx) = line.find(';') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn usage() -> String {
    [
        "Usage:",
        "  twallet [options]",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -v  Print version and exit",
        "  --walletdir, -w  Wallet data directory (default: ~/.twallet)",
        "  --config, -c  Config file path (default: ./twallet.conf)",
        "  --testnet | --testnet4 | --regtest | --simnet | --signet  Select network (default: mainnet)",
        "  --connectiontimeout, -t  Node RPC timeout, e.g. 45s, 2m (default: 60s)",
        "  --debuglevel  Embedded node log level (default: info)",
        "  --loglevel  twallet log level (trace|debug|info|warn|error|fatal|panic|off) (default: info)",
        "  --logformat  Log output format (text|json) (default: text)",
        "  --transactiondisplaylimit  Transactions shown in history (default: 121)",
        "  --resetwallettransactions  Drop wallet transactions and rescan on start",
        "  --connect  Connect only to this peer (repeatable)",
        "  --addpeer  Add a peer to connect with at startup (repeatable)",
        "  --feeurl  Fee estimation endpoint (default on mainnet: lokichain.info)",
        "  --tlsextraip  Extra IP for the generated TLS certificate (repeatable)",
        "  --tlsextradomain  Extra domain for the generated TLS certificate (repeatable)",
        "  --tlsautorefresh  Regenerate the TLS certificate when its IPs or domains change (default: on)",
        "  --rpclisten  gRPC listener (default: 127.0.0.1:10005)",
        "  --restlisten  REST listener (default: 127.0.0.1:5050)",
        "  --listen  Peer listener (default: 0.0.0.0:5521)",
        "  --restcors  Allowed REST CORS origin (default: http://localhost:3000)",
        "  --nolisten  Disable the peer listener",
        "  --nat  Try to forward the peer port via NAT traversal",
        "  --externalip  Advertised external IP (repeatable)",
        "  --externalhosts  Advertised external host name (repeatable)",
        "  --alias  Node alias",
        "  --color  Node color (#RRGGBB)",
        "  --addresstype  Address type to generate (taproot|segwit|nested-segwit) (default: segwit)",
        "  --defaultpassword  Prefill passphrase prompts (TESTING ONLY, never on mainnet)",
    ]
    .join("\n")
}
