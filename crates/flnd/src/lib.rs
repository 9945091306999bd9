//! Supervision of the embedded FLND node: launching it, following its wallet
//! state over RPC and fanning lifecycle updates out to the front-end.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod backend;
pub mod backoff;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hub;
pub mod rpc;
pub mod service;
pub mod status;
pub mod tls;
pub mod tx_cache;

pub use backend::{DialOptions, NodeBackend, ShutdownSignal};
pub use client::{Client, CreatedWallet, LightningConfig, SyncInfo};
pub use config::{DaemonConfig, Network, ServiceConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, RpcCode, RpcError};
pub use hub::{Subscription, UpdateHub};
pub use service::Service;
pub use status::{Status, Update};
pub use tx_cache::FetchOptions;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
