use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::lock;
use crate::status::{Status, Update};

pub const SUBSCRIBER_BUFFER: usize = 5;
pub const CLOSE_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiving end handed to one observer.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Update>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `None` once the hub has closed this subscriber.
    pub async fn recv(&mut self) -> Option<Update> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Update, TryRecvError> {
        self.rx.try_recv()
    }
}

struct HubState {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::Sender<Update>)>,
    last_event: Update,
    closed: bool,
}

/// Best-effort fan-out of lifecycle updates. Publishing never waits on a
/// subscriber: a full buffer drops that update for that subscriber only.
pub struct UpdateHub {
    state: Mutex<HubState>,
}

impl UpdateHub {
    pub fn new(initial: Update) -> Self {
        Self {
            state: Mutex::new(HubState {
                next_id: 0,
                subscribers: Vec::new(),
                last_event: initial,
                closed: false,
            }),
        }
    }

    /// New subscriber, already holding the last published update.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;

        if state.closed {
            let _ = tx.try_send(Update::down(None));
            return Subscription { id, rx };
        }

        let _ = tx.try_send(state.last_event.clone());
        state.subscribers.push((id, tx));
        Subscription { id, rx }
    }

    /// Stops delivery to `sub`. The channel itself stays open until the
    /// subscription is dropped.
    pub fn unsubscribe(&self, sub: &Subscription) {
        let mut state = lock(&self.state);
        state.subscribers.retain(|(id, _)| *id != sub.id);
    }

    pub fn publish(&self, update: Update) {
        let mut state = lock(&self.state);
        state.last_event = update.clone();
        state.subscribers.retain(|(_, tx)| match tx.try_send(update.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn last_event(&self) -> Update {
        lock(&self.state).last_event.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// Sends one final `Down` to every subscriber, waiting at most
    /// [`CLOSE_SEND_TIMEOUT`] each, then closes them all.
    pub async fn close_all(&self) {
        let subscribers = {
            let mut state = lock(&self.state);
            state.closed = true;
            state.last_event = Update::down(None);
            std::mem::take(&mut state.subscribers)
        };

        for (_, tx) in subscribers {
            let _ = tokio::time::timeout(CLOSE_SEND_TIMEOUT, tx.send(Update::down(None))).await;
        }
    }
}

impl Default for UpdateHub {
    fn default() -> Self {
        Self::new(Update::new(Status::Init))
    }
}
