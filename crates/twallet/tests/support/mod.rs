#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::Receiver;
use twallet::WalletControl;
use twallet_flnd::rpc::{RecoveryInfo, Utxo, WalletBalance};
use twallet_flnd::{DaemonError, RpcCode, RpcError, Status, Subscription, Update, UpdateHub};

/// Wallet service double driven entirely by scripts. Updates are published
/// through a real [`UpdateHub`].
pub struct FakeWallet {
    pub hub: UpdateHub,
    unlock_results: Mutex<VecDeque<Result<(), DaemonError>>>,
    pub confirm_unlock: AtomicBool,
    balances: Mutex<VecDeque<Result<WalletBalance, DaemonError>>>,
    recovery: Mutex<VecDeque<(RecoveryInfo, usize)>>,
    utxo_count: AtomicUsize,
    trigger_error: Mutex<Option<DaemonError>>,
    pub unlock_calls: AtomicUsize,
    pub rescans: AtomicUsize,
    pub stops: AtomicUsize,
}

impl FakeWallet {
    pub fn new(initial: Update) -> Arc<Self> {
        Arc::new(Self {
            hub: UpdateHub::new(initial),
            unlock_results: Mutex::new(VecDeque::new()),
            confirm_unlock: AtomicBool::new(true),
            balances: Mutex::new(VecDeque::new()),
            recovery: Mutex::new(VecDeque::new()),
            utxo_count: AtomicUsize::new(0),
            trigger_error: Mutex::new(None),
            unlock_calls: AtomicUsize::new(0),
            rescans: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn in_state(state: Status) -> Arc<Self> {
        Self::new(Update::new(state))
    }

    pub fn publish(&self, update: Update) {
        self.hub.publish(update);
    }

    pub fn script_unlock(&self, results: impl IntoIterator<Item = Result<(), DaemonError>>) {
        self.unlock_results.lock().unwrap().extend(results);
    }

    pub fn script_balance(
        &self,
        results: impl IntoIterator<Item = Result<WalletBalance, DaemonError>>,
    ) {
        self.balances.lock().unwrap().extend(results);
    }

    /// Scripted balance results not yet consumed.
    pub fn pending_balances(&self) -> usize {
        self.balances.lock().unwrap().len()
    }

    /// Recovery observations in poll order; the last one repeats.
    pub fn script_recovery(&self, statuses: impl IntoIterator<Item = (RecoveryInfo, usize)>) {
        self.recovery.lock().unwrap().extend(statuses);
    }

    pub fn fail_trigger(&self, err: DaemonError) {
        *self.trigger_error.lock().unwrap() = Some(err);
    }

    pub fn unlock_calls(&self) -> usize {
        self.unlock_calls.load(Ordering::SeqCst)
    }

    pub fn rescans(&self) -> usize {
        self.rescans.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WalletControl for FakeWallet {
    fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    fn unsubscribe(&self, sub: &Subscription) {
        self.hub.unsubscribe(sub)
    }

    fn last_event(&self) -> Update {
        self.hub.last_event()
    }

    async fn unlock(&self, _passphrase: &str) -> Result<(), DaemonError> {
        self.unlock_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.unlock_results.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if result.is_ok() && self.confirm_unlock.load(Ordering::SeqCst) {
            self.hub.publish(Update::new(Status::Unlocked));
            self.hub.publish(Update::new(Status::Ready).with_height(100));
        }
        result
    }

    async fn balance(&self) -> Result<WalletBalance, DaemonError> {
        self.balances
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(WalletBalance::default()))
    }

    async fn recovery_info(&self) -> Result<RecoveryInfo, DaemonError> {
        let mut script = self.recovery.lock().unwrap();
        let current = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().copied()
        };
        let (info, utxos) = current.unwrap_or_default();
        self.utxo_count.store(utxos, Ordering::SeqCst);
        Ok(info)
    }

    async fn list_unspent(&self, _min: i32, _max: i32) -> Result<Vec<Utxo>, DaemonError> {
        Ok(vec![Utxo::default(); self.utxo_count.load(Ordering::SeqCst)])
    }

    async fn trigger_rescan(&self) -> Result<(), DaemonError> {
        if let Some(err) = self.trigger_error.lock().unwrap().take() {
            return Err(err);
        }
        self.rescans.fetch_add(1, Ordering::SeqCst);
        self.hub.publish(Update::new(Status::None));
        self.hub.publish(Update::new(Status::Locked));
        Ok(())
    }

    async fn restart(&self) {
        self.hub.publish(Update::new(Status::None));
    }

    async fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.hub.close_all().await;
    }
}

pub fn not_ready() -> DaemonError {
    DaemonError::Rpc(RpcError::new(RpcCode::Unavailable, "connection refused"))
}

pub fn invalid_passphrase() -> DaemonError {
    DaemonError::Rpc(RpcError::new(
        RpcCode::Unknown,
        "invalid passphrase for master public key",
    ))
}

pub fn idle() -> (RecoveryInfo, usize) {
    (RecoveryInfo::default(), 0)
}

pub fn recovering(progress: f64, utxos: usize) -> (RecoveryInfo, usize) {
    let info = RecoveryInfo {
        recovery_mode: true,
        recovery_finished: false,
        progress,
    };
    (info, utxos)
}

pub fn finished(utxos: usize) -> (RecoveryInfo, usize) {
    let info = RecoveryInfo {
        recovery_mode: true,
        recovery_finished: true,
        progress: 1.0,
    };
    (info, utxos)
}

/// Everything sent so far, without blocking.
pub fn drain<T>(rx: &Receiver<T>) -> Vec<T> {
    rx.try_iter().collect()
}

/// Polls `rx` until an item satisfies `pred`, letting paused time advance.
pub async fn wait_for<T>(rx: &Receiver<T>, mut pred: impl FnMut(&T) -> bool) -> T {
    for _ in 0..10_000 {
        while let Ok(item) = rx.try_recv() {
            if pred(&item) {
                return item;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected item never arrived");
}
