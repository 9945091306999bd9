use std::fmt;

use twallet_flnd::DaemonError;

#[derive(Clone, Debug, PartialEq)]
pub enum RescanError {
    /// The node rejected the passphrase. Never retried.
    InvalidPassphrase,
    PassphraseRequired,
    UnlockAttemptsExhausted,
    /// The update stream ended; carries what the flow was waiting for.
    SubscriptionClosed(&'static str),
    Cancelled,
    /// Another rescan owned by this orchestrator is still running.
    Busy,
    /// The node already reports an unfinished recovery.
    AlreadyRunning,
    Daemon(DaemonError),
    Failed(String),
    /// A flow step failed; `step` is the user-facing prefix.
    Step {
        step: &'static str,
        source: Box<RescanError>,
    },
}

impl RescanError {
    pub fn step(step: &'static str, source: RescanError) -> Self {
        RescanError::Step {
            step,
            source: Box::new(source),
        }
    }

    /// Innermost error with step prefixes removed.
    pub fn root(&self) -> &RescanError {
        match self {
            RescanError::Step { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), RescanError::Cancelled)
    }
}

impl fmt::Display for RescanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RescanError::InvalidPassphrase => write!(f, "invalid wallet passphrase"),
            RescanError::PassphraseRequired => write!(f, "wallet passphrase required"),
            RescanError::UnlockAttemptsExhausted => {
                write!(f, "wallet did not unlock after multiple attempts")
            }
            RescanError::SubscriptionClosed(waiting) => {
                write!(f, "wallet subscription closed while {waiting}")
            }
            RescanError::Cancelled => write!(f, "rescan cancelled"),
            RescanError::Busy => write!(f, "rescan already in progress"),
            RescanError::AlreadyRunning => {
                write!(f, "A wallet recovery/rescan is already in progress.")
            }
            RescanError::Daemon(err) => write!(f, "{err}"),
            RescanError::Failed(message) => write!(f, "{message}"),
            RescanError::Step { step, source } => write!(f, "{step}: {source}"),
        }
    }
}

impl std::error::Error for RescanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RescanError::Daemon(err) => Some(err),
            RescanError::Step { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<DaemonError> for RescanError {
    fn from(err: DaemonError) -> Self {
        RescanError::Daemon(err)
    }
}
