use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use twallet_log::{log_debug, log_error, log_info};

use crate::backend::{DialOptions, NodeBackend, ShutdownSignal};
use crate::client::Client;
use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::{lock, tls};

const NOT_STARTED: &str = "node exited before signalling start";

/// Where a node exit is reported: the live client if one exists, otherwise
/// the pending start.
#[derive(Default)]
struct ExitSlot {
    client: Option<Arc<Client>>,
    start_err: Option<oneshot::Sender<String>>,
    pending: Option<String>,
}

impl ExitSlot {
    fn report(&mut self, message: String) {
        if let Some(client) = &self.client {
            client.fail(message);
            return;
        }
        self.pending = Some(message.clone());
        if let Some(tx) = self.start_err.take() {
            let _ = tx.send(message);
        }
    }
}

/// One run of the embedded node plus the connection opened to it.
pub struct Daemon {
    config: Mutex<DaemonConfig>,
    backend: Arc<dyn NodeBackend>,
    cancel: CancellationToken,
    shutdown_tx: watch::Sender<bool>,
    exited_tx: watch::Sender<bool>,
    stopping: AtomicBool,
    slot: Arc<Mutex<ExitSlot>>,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        backend: Arc<dyn NodeBackend>,
        parent: &CancellationToken,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (exited_tx, _) = watch::channel(true);
        Self {
            config: Mutex::new(config),
            backend,
            cancel: parent.child_token(),
            shutdown_tx,
            exited_tx,
            stopping: AtomicBool::new(false),
            slot: Arc::new(Mutex::new(ExitSlot::default())),
        }
    }

    /// Configuration after node validation; the raw one before `start`.
    pub fn config(&self) -> DaemonConfig {
        lock(&self.config).clone()
    }

    pub fn client(&self) -> Option<Arc<Client>> {
        lock(&self.slot).client.clone()
    }

    pub fn has_exited(&self) -> bool {
        *self.exited_tx.borrow()
    }

    /// Launches the node and connects to it. On failure everything already
    /// started is torn down again.
    pub async fn start(&self) -> Result<Arc<Client>, DaemonError> {
        match self.start_inner().await {
            Ok(client) => Ok(client),
            Err(err) => {
                log_error!("daemon start failed: {err}");
                self.stop().await;
                Err(err)
            }
        }
    }

    async fn start_inner(&self) -> Result<Arc<Client>, DaemonError> {
        let raw = self.config();
        let config = self
            .backend
            .validate_config(raw)
            .map_err(|err| DaemonError::Config(format!("failed to load config: {err}")))?;
        *lock(&self.config) = config.clone();

        log_info!("starting FLND daemon ({})", config.network.dir_name());
        let (started_rx, err_rx) = self.exec(config.clone());

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(DaemonError::Launch("daemon start cancelled".to_string()));
            }
            res = started_rx => {
                if res.is_err() {
                    let message = err_rx.await.unwrap_or_else(|_| NOT_STARTED.to_string());
                    return Err(DaemonError::Launch(message));
                }
            }
        }
        log_debug!("node signalled start");

        let certificates = tls::load_certificates(&config.tls_cert_path)?;
        let Some(endpoint) = config.rpc_endpoint() else {
            return Err(DaemonError::Connect(
                "unable to open rpc connection, rpc listener is empty".to_string(),
            ));
        };
        let rpc = self
            .backend
            .dial(DialOptions::new(endpoint, certificates))
            .await
            .map_err(DaemonError::Connect)?;

        let client = Client::new(
            rpc,
            Arc::clone(&self.backend),
            config,
            self.cancel.child_token(),
        );
        let pending = {
            let mut slot = lock(&self.slot);
            slot.client = Some(Arc::clone(&client));
            slot.pending.take()
        };
        if let Some(message) = pending {
            client.fail(message);
        }
        Ok(client)
    }

    /// Runs the node on its own task. Returns the start signal and the
    /// channel carrying an exit error that arrives before a client exists.
    fn exec(&self, config: DaemonConfig) -> (oneshot::Receiver<()>, oneshot::Receiver<String>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (err_tx, err_rx) = oneshot::channel();
        lock(&self.slot).start_err = Some(err_tx);
        self.exited_tx.send_replace(false);

        let backend = Arc::clone(&self.backend);
        let shutdown = ShutdownSignal::new(self.shutdown_tx.subscribe());
        let slot = Arc::clone(&self.slot);
        let exited_tx = self.exited_tx.clone();

        tokio::spawn(async move {
            let node = tokio::spawn(async move { backend.run(config, started_tx, shutdown).await });
            let outcome = match node.await {
                Ok(res) => res,
                Err(err) if err.is_panic() => Err(format!(
                    "unable to run FLND daemon: {}",
                    panic_message(err.into_panic())
                )),
                Err(err) => Err(format!("unable to run FLND daemon: {err}")),
            };

            {
                let mut slot = lock(&slot);
                if let Err(message) = outcome {
                    log_error!("FLND daemon exited: {message}");
                    slot.report(message);
                }
                slot.start_err = None;
            }
            log_info!("FLND daemon exited");
            exited_tx.send_replace(true);
        });

        (started_rx, err_rx)
    }

    /// Closes the connection and asks the node to shut down, then waits for
    /// it to exit. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            log_info!("stopping FLND daemon");
            if let Some(client) = self.client() {
                client.close();
            }
            self.cancel.cancel();
            self.shutdown_tx.send_replace(true);
        }
        self.wait_for_shutdown().await;
    }

    pub async fn wait_for_shutdown(&self) {
        let mut exited = self.exited_tx.subscribe();
        let _ = exited.wait_for(|exited| *exited).await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_render() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "panic");
    }

    #[test]
    fn exit_before_client_goes_to_pending_start() {
        let (tx, mut rx) = oneshot::channel();
        let mut slot = ExitSlot {
            start_err: Some(tx),
            ..ExitSlot::default()
        };
        slot.report("crashed".to_string());
        assert_eq!(slot.pending.as_deref(), Some("crashed"));
        assert_eq!(rx.try_recv().ok().as_deref(), Some("crashed"));
    }
}
