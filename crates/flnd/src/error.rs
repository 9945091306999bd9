use std::fmt;

use crate::rpc::Transaction;

pub const MSG_RPC_STARTING: &str =
    "the RPC server is in the process of starting up, but not yet ready to accept calls";
pub const MSG_NO_WALLET: &str = "wallet not created, create one to enable full RPC access";
pub const MSG_WALLET_LOCKED: &str = "wallet locked, unlock it to enable full RPC access";
pub const MSG_WALLET_UNLOCKED: &str =
    "wallet already unlocked, WalletUnlocker service is no longer available";
pub const MSG_ALREADY_UNLOCKED: &str = "wallet already unlocked";
pub const MSG_INVALID_PASSPHRASE: &str = "invalid passphrase";

/// Status codes reported by the node's control API.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RpcCode {
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl RpcCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "Canceled",
            Self::Unknown => "Unknown",
            Self::InvalidArgument => "InvalidArgument",
            Self::DeadlineExceeded => "DeadlineExceeded",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::PermissionDenied => "PermissionDenied",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::Aborted => "Aborted",
            Self::OutOfRange => "OutOfRange",
            Self::Unimplemented => "Unimplemented",
            Self::Internal => "Internal",
            Self::Unavailable => "Unavailable",
            Self::DataLoss => "DataLoss",
            Self::Unauthenticated => "Unauthenticated",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcError {
    pub code: RpcCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn canceled() -> Self {
        Self::new(RpcCode::Canceled, "context canceled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::new(RpcCode::DeadlineExceeded, "context deadline exceeded")
    }

    /// A server stream that ended without a status.
    pub fn eof() -> Self {
        Self::new(RpcCode::Unavailable, "EOF")
    }

    /// Codes the node returns while its RPC server is still coming up.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self.code,
            RpcCode::Unavailable
                | RpcCode::Canceled
                | RpcCode::DeadlineExceeded
                | RpcCode::FailedPrecondition
                | RpcCode::Unknown
        )
    }

    pub fn is_rpc_starting(&self) -> bool {
        self.message == MSG_RPC_STARTING
    }

    pub fn is_already_unlocked(&self) -> bool {
        self.message.contains(MSG_ALREADY_UNLOCKED)
    }

    pub fn is_invalid_passphrase(&self) -> bool {
        self.message.contains(MSG_INVALID_PASSPHRASE)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rpc error: code = {} desc = {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for RpcError {}

#[derive(Clone, Debug, PartialEq)]
pub enum DaemonError {
    NotRunning,
    WalletMustBeLocked,
    Config(String),
    Launch(String),
    Tls(String),
    Connect(String),
    Credentials(String),
    Rpc(RpcError),
    /// The node is still starting; `stale` holds whatever was cached.
    BackendStarting {
        stale: Vec<Transaction>,
        source: RpcError,
    },
    Timeout,
    InvalidSeed(String),
    Publish(String),
    Network(String),
}

impl DaemonError {
    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            DaemonError::Rpc(err) => Some(err),
            DaemonError::BackendStarting { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::NotRunning => write!(f, "daemon is not running"),
            DaemonError::WalletMustBeLocked => write!(f, "wallet must be locked to change password"),
            DaemonError::Config(message) => write!(f, "{message}"),
            DaemonError::Launch(message) => write!(f, "{message}"),
            DaemonError::Tls(message) => write!(f, "{message}"),
            DaemonError::Connect(message) => write!(f, "{message}"),
            DaemonError::Credentials(message) => write!(f, "{message}"),
            DaemonError::Rpc(err) => write!(f, "{err}"),
            DaemonError::BackendStarting { source, .. } => write!(f, "backend starting: {source}"),
            DaemonError::Timeout => write!(f, "rpc connection timeout"),
            DaemonError::InvalidSeed(message) => write!(f, "{message}"),
            DaemonError::Publish(message) => write!(f, "{message}"),
            DaemonError::Network(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for DaemonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DaemonError::Rpc(err) => Some(err),
            DaemonError::BackendStarting { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<RpcError> for DaemonError {
    fn from(err: RpcError) -> Self {
        DaemonError::Rpc(err)
    }
}
