//! Broadcast hub: the set of connected observers and fan-out to them.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{ClientId, StatusRecord, WsMessage};

/// Default per-observer queue capacity.
const DEFAULT_OBSERVER_CAPACITY: usize = 256;

/// A connected observer's receiving end.
pub struct Observer {
    pub id: Uuid,
    rx: mpsc::Receiver<WsMessage>,
}

impl Observer {
    /// Next message, or `None` once the hub has dropped this observer.
    pub async fn recv(&mut self) -> Option<WsMessage> {
        self.rx.recv().await
    }
}

/// Fan-out of status and log events to every connected observer.
pub struct BroadcastHub {
    observers: RwLock<HashMap<Uuid, mpsc::Sender<WsMessage>>>,
    capacity: usize,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_OBSERVER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new observer. The snapshot is queued as its first message
    /// before it becomes visible to `broadcast`.
    pub async fn connect(&self, snapshot: BTreeMap<ClientId, StatusRecord>) -> Observer {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();

        // Fresh channel with capacity >= 1, so this cannot fail.
        let _ = tx.try_send(WsMessage::InitialStatus { data: snapshot });

        let mut observers = self.observers.write().await;
        observers.insert(id, tx);
        info!(observer_id = %id, observers = observers.len(), "Observer connected");

        Observer { id, rx }
    }

    /// Remove an observer. Safe to call more than once.
    pub async fn disconnect(&self, id: Uuid) -> bool {
        let removed = self.observers.write().await.remove(&id).is_some();
        if removed {
            info!(observer_id = %id, "Observer disconnected");
        }
        removed
    }

    /// Drop every observer. Their sockets see the stream end and close.
    pub async fn disconnect_all(&self) -> usize {
        let mut observers = self.observers.write().await;
        let count = observers.len();
        observers.clear();
        if count > 0 {
            info!(observers = count, "Disconnected all observers");
        }
        count
    }

    /// Deliver a message to every open observer. Returns how many accepted it.
    ///
    /// Closed observers are pruned. An observer whose queue is full is dropped
    /// too, so it reconnects and resyncs instead of silently missing events.
    pub async fn broadcast(&self, msg: &WsMessage) -> usize {
        let mut delivered = 0;
        let mut stale = Vec::new();

        {
            let observers = self.observers.read().await;
            for (id, tx) in observers.iter() {
                match tx.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(observer_id = %id, "Skipping closed observer");
                        stale.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(observer_id = %id, "Observer lagged behind broadcast, dropping it");
                        stale.push(*id);
                    }
                }
            }
        }

        if !stale.is_empty() {
            let mut observers = self.observers.write().await;
            for id in stale {
                observers.remove(&id);
            }
        }

        delivered
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}
