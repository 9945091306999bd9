use std::fmt;

use crate::rpc::Transaction;

/// Externally observable lifecycle stage of the embedded node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Status {
    Init,
    None,
    Locked,
    Unlocked,
    Syncing,
    Ready,
    NoWallet,
    Down,
    Transaction,
    Block,
    Scanning,
    Quit,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::None => "none",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
            Self::Syncing => "syncing",
            Self::Ready => "ready",
            Self::NoWallet => "noWallet",
            Self::Down => "down",
            Self::Transaction => "tx",
            Self::Block => "block",
            Self::Scanning => "scanning",
            Self::Quit => "quit",
        }
    }

    /// States in which authenticated wallet RPCs are being served.
    pub fn is_rpc_active(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Block | Self::Transaction | Self::Syncing | Self::Scanning
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event of the lifecycle pub/sub protocol.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub state: Status,
    pub err: Option<String>,
    pub transaction: Option<Transaction>,
    pub block_height: u32,
    pub synced_height: u32,
    pub block_hash: String,
}

impl Update {
    pub fn new(state: Status) -> Self {
        Self {
            state,
            err: None,
            transaction: None,
            block_height: 0,
            synced_height: 0,
            block_hash: String::new(),
        }
    }

    pub fn down(err: Option<String>) -> Self {
        Self {
            err,
            ..Self::new(Status::Down)
        }
    }

    pub fn with_height(mut self, block_height: u32) -> Self {
        self.block_height = block_height;
        self
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)?;
        if self.block_height > 0 {
            write!(f, " height={}", self.block_height)?;
        }
        if let Some(err) = &self.err {
            write!(f, " err={err}")?;
        }
        Ok(())
    }
}
