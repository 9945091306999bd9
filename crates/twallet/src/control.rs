//! The slice of the wallet service the application flows depend on.

use async_trait::async_trait;
use twallet_flnd::rpc::{RecoveryInfo, Utxo, WalletBalance};
use twallet_flnd::{DaemonError, Service, Subscription, Update};

#[async_trait]
pub trait WalletControl: Send + Sync {
    fn subscribe(&self) -> Subscription;
    fn unsubscribe(&self, sub: &Subscription);
    fn last_event(&self) -> Update;

    async fn unlock(&self, passphrase: &str) -> Result<(), DaemonError>;
    async fn balance(&self) -> Result<WalletBalance, DaemonError>;
    async fn recovery_info(&self) -> Result<RecoveryInfo, DaemonError>;
    async fn list_unspent(&self, min_confs: i32, max_confs: i32) -> Result<Vec<Utxo>, DaemonError>;
    async fn trigger_rescan(&self) -> Result<(), DaemonError>;
    async fn restart(&self);
    async fn stop(&self);
}

#[async_trait]
impl WalletControl for Service {
    fn subscribe(&self) -> Subscription {
        Service::subscribe(self)
    }

    fn unsubscribe(&self, sub: &Subscription) {
        Service::unsubscribe(self, sub)
    }

    fn last_event(&self) -> Update {
        Service::last_event(self)
    }

    async fn unlock(&self, passphrase: &str) -> Result<(), DaemonError> {
        Service::unlock(self, passphrase).await
    }

    async fn balance(&self) -> Result<WalletBalance, DaemonError> {
        Service::balance(self).await
    }

    async fn recovery_info(&self) -> Result<RecoveryInfo, DaemonError> {
        Service::recovery_info(self).await
    }

    async fn list_unspent(&self, min_confs: i32, max_confs: i32) -> Result<Vec<Utxo>, DaemonError> {
        Service::list_unspent(self, min_confs, max_confs).await
    }

    async fn trigger_rescan(&self) -> Result<(), DaemonError> {
        Service::trigger_rescan(self).await
    }

    async fn restart(&self) {
        Service::restart(self).await
    }

    async fn stop(&self) {
        Service::stop(self).await
    }
}

/// A subscription that unsubscribes itself when dropped.
pub struct Watch<'a> {
    wallet: &'a dyn WalletControl,
    sub: Subscription,
}

impl<'a> Watch<'a> {
    pub fn new(wallet: &'a dyn WalletControl) -> Self {
        Self {
            sub: wallet.subscribe(),
            wallet,
        }
    }

    pub async fn recv(&mut self) -> Option<Update> {
        self.sub.recv().await
    }
}

impl Drop for Watch<'_> {
    fn drop(&mut self) {
        self.wallet.unsubscribe(&self.sub);
    }
}
