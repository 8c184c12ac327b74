//! In-memory registry of live WebSocket sessions.
//!
//! A single dispatcher task owns every mutation of the registry. It drains
//! three bounded channels (register, unregister, broadcast) and fans payloads
//! out to per-session outbound queues with non-blocking sends. A session
//! whose queue is full is severed on the spot: its queue sender is dropped,
//! which the write pump observes as closure.

use std::{collections::HashMap, sync::Arc};

use parley_core::{Message, PresenceStatus, ServerEvent};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;

/// A pre-serialized server envelope.
pub type Payload = Arc<str>;

const CONTROL_CHANNEL_CAPACITY: usize = 1024;

type Clients = HashMap<Uuid, HashMap<Uuid, mpsc::Sender<Payload>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: Uuid,
    pub session_id: Uuid,
}

/// The hub-facing half of a session: its identity and the consumer end of
/// its outbound queue.
#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,
    pub outbound: mpsc::Receiver<Payload>,
}

struct Registration {
    key: SessionKey,
    queue: mpsc::Sender<Payload>,
}

enum Recipients {
    Users(Vec<Uuid>),
    Everyone,
    Session(SessionKey),
}

struct Delivery {
    recipients: Recipients,
    payload: Payload,
}

#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<SessionKey>,
    broadcast_tx: mpsc::Sender<Delivery>,
    queue_capacity: usize,
}

#[derive(Default)]
struct Shared {
    clients: RwLock<Clients>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl Hub {
    /// Spawn the dispatcher on the current runtime. The dispatcher stops once
    /// every clone of the returned handle has been dropped.
    pub fn start(queue_capacity: usize) -> Self {
        Self::spawn(queue_capacity, Shared::default())
    }

    #[cfg(feature = "metrics")]
    pub fn start_with_metrics(queue_capacity: usize, metrics: Option<Arc<MetricsContext>>) -> Self {
        Self::spawn(
            queue_capacity,
            Shared {
                clients: RwLock::default(),
                metrics,
            },
        )
    }

    fn spawn(queue_capacity: usize, shared: Shared) -> Self {
        let shared = Arc::new(shared);
        let (register_tx, register_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(CONTROL_CHANNEL_CAPACITY);

        tokio::spawn(dispatch(
            shared.clone(),
            register_rx,
            unregister_rx,
            broadcast_rx,
        ));

        Self {
            shared,
            register_tx,
            unregister_tx,
            broadcast_tx,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Open a session for `user_id`. The dispatcher answers with a
    /// `presence_list` on the new queue and, for a user's first session,
    /// announces them online to everyone.
    pub async fn register(&self, user_id: Uuid) -> Session {
        let key = SessionKey {
            user_id,
            session_id: Uuid::new_v4(),
        };
        let (queue, outbound) = mpsc::channel(self.queue_capacity);
        if self
            .register_tx
            .send(Registration { key, queue })
            .await
            .is_err()
        {
            warn!(%user_id, "hub dispatcher stopped; session not registered");
        }
        Session { key, outbound }
    }

    /// Remove a session. Unknown or already-evicted sessions are ignored.
    pub async fn unregister(&self, key: SessionKey) {
        if self.unregister_tx.send(key).await.is_err() {
            debug!(user_id = %key.user_id, "hub dispatcher stopped before unregister");
        }
    }

    pub async fn broadcast_to_users(&self, user_ids: Vec<Uuid>, payload: Payload) {
        self.enqueue(Delivery {
            recipients: Recipients::Users(user_ids),
            payload,
        })
        .await;
    }

    /// Serialize a `message` event once and deliver it to every session of
    /// every recipient.
    pub async fn broadcast_message(&self, message: &Message, recipients: Vec<Uuid>) {
        let event = ServerEvent::Message {
            data: message.clone(),
        };
        if let Some(payload) = encode(&event) {
            self.broadcast_to_users(recipients, payload).await;
        }
    }

    /// Queue an event for one session only.
    pub async fn send_to_session(&self, key: SessionKey, event: &ServerEvent) {
        if let Some(payload) = encode(event) {
            self.enqueue(Delivery {
                recipients: Recipients::Session(key),
                payload,
            })
            .await;
        }
    }

    pub async fn is_user_online(&self, user_id: Uuid) -> bool {
        self.shared.clients.read().await.contains_key(&user_id)
    }

    pub async fn online_users(&self) -> Vec<Uuid> {
        let clients = self.shared.clients.read().await;
        sorted_users(&clients)
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn session_count(&self) -> usize {
        self.shared
            .clients
            .read()
            .await
            .values()
            .map(HashMap::len)
            .sum()
    }

    async fn enqueue(&self, delivery: Delivery) {
        if self.broadcast_tx.send(delivery).await.is_err() {
            warn!("hub dispatcher stopped; dropping broadcast");
        }
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    mut register_rx: mpsc::Receiver<Registration>,
    mut unregister_rx: mpsc::Receiver<SessionKey>,
    mut broadcast_rx: mpsc::Receiver<Delivery>,
) {
    loop {
        tokio::select! {
            biased;
            Some(registration) = register_rx.recv() => shared.register(registration).await,
            Some(key) = unregister_rx.recv() => shared.unregister(key).await,
            Some(delivery) = broadcast_rx.recv() => shared.deliver(delivery).await,
            else => break,
        }
    }
    debug!("hub dispatcher stopped");
}

impl Shared {
    async fn register(&self, registration: Registration) {
        let Registration { key, queue } = registration;
        let mut clients = self.clients.write().await;

        let sessions = clients.entry(key.user_id).or_default();
        let first_session = sessions.is_empty();
        sessions.insert(key.session_id, queue);
        self.session_added();
        info!(user_id = %key.user_id, session_id = %key.session_id, "session registered");

        let mut offline = Vec::new();
        let list = ServerEvent::PresenceList {
            data: sorted_users(&clients),
        };
        if let Some(payload) = encode(&list) {
            offline.extend(self.fan_out(&mut clients, &Recipients::Session(key), &payload));
        }
        if first_session {
            if let Some(payload) =
                encode(&ServerEvent::presence(key.user_id, PresenceStatus::Online))
            {
                offline.extend(self.fan_out(&mut clients, &Recipients::Everyone, &payload));
            }
        }
        self.publish_offline(&mut clients, offline);
    }

    async fn unregister(&self, key: SessionKey) {
        let mut clients = self.clients.write().await;
        let Some(sessions) = clients.get_mut(&key.user_id) else {
            return;
        };
        if sessions.remove(&key.session_id).is_none() {
            return;
        }
        self.session_removed();
        info!(user_id = %key.user_id, session_id = %key.session_id, "session unregistered");

        if sessions.is_empty() {
            clients.remove(&key.user_id);
            self.publish_offline(&mut clients, vec![key.user_id]);
        }
    }

    async fn deliver(&self, delivery: Delivery) {
        let mut clients = self.clients.write().await;
        let offline = self.fan_out(&mut clients, &delivery.recipients, &delivery.payload);
        self.publish_offline(&mut clients, offline);
    }

    /// Non-blocking enqueue to every addressed session. Sessions whose queue
    /// is full or closed are dropped from the registry; returns the users
    /// that lost their last session in the process.
    fn fan_out(&self, clients: &mut Clients, recipients: &Recipients, payload: &Payload) -> Vec<Uuid> {
        let mut targets: Vec<Uuid> = match recipients {
            Recipients::Users(user_ids) => user_ids.clone(),
            Recipients::Everyone => clients.keys().copied().collect(),
            Recipients::Session(key) => vec![key.user_id],
        };
        targets.sort_unstable();
        targets.dedup();

        let mut went_offline = Vec::new();
        for user_id in targets {
            let Some(sessions) = clients.get_mut(&user_id) else {
                continue;
            };

            let mut evicted = Vec::new();
            for (session_id, queue) in sessions.iter() {
                if let Recipients::Session(key) = recipients {
                    if key.session_id != *session_id {
                        continue;
                    }
                }
                match queue.try_send(payload.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(%user_id, %session_id, "outbound queue full; evicting session");
                        self.session_evicted();
                        evicted.push(*session_id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(%user_id, %session_id, "outbound queue closed; dropping session");
                        evicted.push(*session_id);
                    }
                }
            }

            if evicted.is_empty() {
                continue;
            }
            for session_id in evicted {
                sessions.remove(&session_id);
                self.session_removed();
            }
            if sessions.is_empty() {
                clients.remove(&user_id);
                went_offline.push(user_id);
            }
        }
        went_offline
    }

    fn publish_offline(&self, clients: &mut Clients, mut pending: Vec<Uuid>) {
        while let Some(user_id) = pending.pop() {
            info!(%user_id, "user offline");
            if let Some(payload) = encode(&ServerEvent::presence(user_id, PresenceStatus::Offline))
            {
                pending.extend(self.fan_out(clients, &Recipients::Everyone, &payload));
            }
        }
    }

    fn session_added(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.ws_sessions.inc();
        }
    }

    fn session_removed(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.ws_sessions.dec();
        }
    }

    fn session_evicted(&self) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.hub_evictions_total.inc();
        }
    }
}

fn sorted_users(clients: &Clients) -> Vec<Uuid> {
    let mut users: Vec<Uuid> = clients.keys().copied().collect();
    users.sort_unstable();
    users
}

fn encode(event: &ServerEvent) -> Option<Payload> {
    match event.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(err) => {
            error!(?err, "failed to serialize server event");
            None
        }
    }
}
