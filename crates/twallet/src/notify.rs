//! Turns node updates into the header health indicator, toasts, and wallet
//! events for the pages. Everything goes out over channels; nothing here
//! touches display state.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tokio_util::sync::CancellationToken;
use twallet_flnd::{RpcCode, Status, Update};
use twallet_log::{log_debug, log_error, log_warn};

use crate::control::{Watch, WalletControl};
use crate::lock;

pub const RESPONSIVE_ATTEMPTS: u32 = 5;
pub const RESPONSIVE_DELAY: Duration = Duration::from_millis(300);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum HealthLevel {
    Red,
    Orange,
    Green,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HealthState {
    pub level: HealthLevel,
    pub info: String,
    pub err: Option<String>,
}

impl HealthState {
    fn new(level: HealthLevel, info: impl Into<String>) -> Self {
        Self {
            level,
            info: info.into(),
            err: None,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info)?;
        if let Some(err) = &self.err {
            write!(f, ": {err}")?;
        }
        Ok(())
    }
}

/// What the UI consumer receives.
#[derive(Clone, Debug, PartialEq)]
pub enum NotifyEvent {
    Health(HealthState),
    Toast(String),
}

/// Delivered to page subscribers; `None` asks them to refresh balances.
#[derive(Clone, Debug, PartialEq)]
pub struct WalletEvent {
    pub state: Status,
    pub block_height: u32,
    pub err: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Balances {
    pub confirmed: i64,
    pub unconfirmed: i64,
    pub locked: i64,
}

#[derive(Debug, Default)]
struct CacheState {
    balances: Balances,
    tip_height: i32,
}

/// Last known balances and chain tip, shared between pages.
#[derive(Debug, Default)]
pub struct WalletCache {
    state: Mutex<CacheState>,
}

impl WalletCache {
    pub fn set_balances(&self, balances: Balances) {
        lock(&self.state).balances = balances;
    }

    pub fn balances(&self) -> Balances {
        lock(&self.state).balances
    }

    /// The tip only moves forward.
    pub fn update_tip(&self, height: i32) {
        let mut state = lock(&self.state);
        if height > state.tip_height {
            state.tip_height = height;
        }
    }

    pub fn tip_height(&self) -> i32 {
        lock(&self.state).tip_height
    }
}

/// Maps one node update to the header indicator. `Ready` is decided
/// separately because it needs a responsive RPC.
pub fn health_for(update: &Update) -> Option<HealthState> {
    let height = update.block_height;
    let state = match update.state {
        Status::Down => HealthState {
            err: update.err.clone(),
            ..HealthState::new(HealthLevel::Red, "disconnected")
        },
        Status::Locked => HealthState::new(HealthLevel::Orange, "locked"),
        Status::None => HealthState::new(HealthLevel::Orange, "connecting..."),
        Status::NoWallet => HealthState::new(HealthLevel::Orange, "no wallet"),
        Status::Syncing | Status::Scanning if height == 0 => {
            HealthState::new(HealthLevel::Orange, "init...")
        }
        Status::Syncing | Status::Scanning => {
            HealthState::new(HealthLevel::Orange, format!("syncing... ({height})"))
        }
        Status::Unlocked => HealthState::new(HealthLevel::Green, "unlocked"),
        Status::Ready | Status::Block => {
            HealthState::new(HealthLevel::Green, format!("ready ({height})"))
        }
        Status::Transaction | Status::Init | Status::Quit => return None,
    };
    Some(state)
}

pub struct Notifier {
    wallet: Arc<dyn WalletControl>,
    cache: Arc<WalletCache>,
    events: Sender<NotifyEvent>,
    subscribers: Mutex<Vec<Sender<Option<WalletEvent>>>>,
    responsive_delay: Duration,
}

impl Notifier {
    pub fn new(
        wallet: Arc<dyn WalletControl>,
        cache: Arc<WalletCache>,
        events: Sender<NotifyEvent>,
    ) -> Self {
        Self {
            wallet,
            cache,
            events,
            subscribers: Mutex::new(Vec::new()),
            responsive_delay: RESPONSIVE_DELAY,
        }
    }

    pub fn cache(&self) -> &Arc<WalletCache> {
        &self.cache
    }

    /// One-slot channel; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<Option<WalletEvent>> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        lock(&self.subscribers).push(tx);
        rx
    }

    /// Never blocks: a subscriber whose slot is full misses this event.
    pub fn broadcast(&self, event: Option<WalletEvent>) {
        lock(&self.subscribers)
            .retain(|tx| !matches!(tx.try_send(event.clone()), Err(TrySendError::Disconnected(_))));
    }

    pub fn broadcast_balance_refresh(&self) {
        self.broadcast(None);
    }

    pub fn show_toast(&self, text: impl Into<String>) {
        let _ = self.events.try_send(NotifyEvent::Toast(text.into()));
    }

    fn report_health(&self, health: HealthState) {
        let _ = self.events.try_send(NotifyEvent::Health(health));
    }

    /// Follows the wallet's updates until the stream ends or `cancel` fires.
    pub async fn listen(&self, cancel: &CancellationToken) {
        let mut watch = Watch::new(self.wallet.as_ref());
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                update = watch.recv() => update,
            };
            let Some(update) = update else { break };
            self.process(&update, cancel).await;
        }
    }

    pub async fn process(&self, update: &Update, cancel: &CancellationToken) {
        let event = WalletEvent {
            state: update.state,
            block_height: update.block_height,
            err: update.err.clone(),
        };

        match update.state {
            Status::Ready => {
                log_debug!("wallet ready event at height {}", update.block_height);
                let responsive = self.ensure_wallet_responsive(cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
                if !responsive {
                    log_warn!("wallet ready reported but RPC still unavailable");
                    self.report_health(HealthState::new(HealthLevel::Orange, "waiting for wallet"));
                    return;
                }
                self.cache.update_tip(update.block_height as i32);
            }
            Status::Transaction => {
                match &update.transaction {
                    Some(tx) => {
                        log_debug!("transaction update {} at height {}", tx.tx_hash, tx.block_height);
                        self.cache.update_tip(tx.block_height);
                    }
                    None => log_debug!("transaction update received without payload"),
                }
                self.broadcast(Some(event));
                return;
            }
            Status::Block => {
                log_debug!("new block notification at height {}", update.block_height);
                self.cache.update_tip(update.block_height as i32);
            }
            Status::Init | Status::Quit => return,
            _ => {}
        }

        if let Some(health) = health_for(update) {
            self.report_health(health);
        }
        self.broadcast(Some(event));
    }

    /// Checks with a balance call; the node can report `Ready` slightly
    /// before its RPCs answer. Gives up quietly once `cancel` fires.
    async fn ensure_wallet_responsive(&self, cancel: &CancellationToken) -> bool {
        for _ in 0..RESPONSIVE_ATTEMPTS {
            let balance = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                balance = self.wallet.balance() => balance,
            };
            let err = match balance {
                Ok(_) => return true,
                Err(err) => err,
            };
            let transient = err.rpc().is_some_and(|rpc| {
                matches!(
                    rpc.code,
                    RpcCode::Unavailable | RpcCode::DeadlineExceeded | RpcCode::Canceled
                )
            });
            if transient {
                log_debug!("wallet RPC not ready yet: {err}");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(self.responsive_delay) => continue,
                }
            }
            log_error!("wallet balance failed: {err}");
            self.show_toast(format!("Error: {err}"));
            return false;
        }
        self.show_toast("Error: wallet not ready");
        false
    }

    /// Closes every page subscription.
    pub fn shutdown(&self) {
        lock(&self.subscribers).clear();
    }
}
