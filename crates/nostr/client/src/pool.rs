//! Relay pool: many sessions behind one subscription set and one event stream.

use crate::dedup::EventDeduplicator;
use crate::descriptor::{RelayDescriptor, RelayInfo, RelayUrl};
use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter, RelayMessage};
use crate::publish::{OutboundEvent, PublishTracker};
use crate::session::{
    ConnectionState, RelaySession, SessionConfig, SessionEvent, SessionEventKind,
};
use crate::subscription::{Subscription, SubscriptionRegistry};
use nostr::{Event, verify_event};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Relay pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// Session template applied to every relay.
    pub session: SessionConfig,
    /// Number of event ids remembered for cross-relay dedup.
    pub dedup_capacity: usize,
    /// Optional age after which a seen id is forgotten.
    pub dedup_retention: Option<Duration>,
    /// Buffer of the notification broadcast; slow receivers lag past it.
    pub notification_capacity: usize,
    /// Drop incoming events whose id or signature does not verify.
    pub verify_events: bool,
    /// Prefix for generated subscription ids.
    pub subscription_prefix: String,
    /// Published events whose acknowledgements are tracked at once.
    pub pending_ack_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_relays: 64,
            session: SessionConfig::default(),
            dedup_capacity: 10_000,
            dedup_retention: None,
            notification_capacity: 1024,
            verify_events: true,
            subscription_prefix: "sub".to_string(),
            pending_ack_capacity: 1024,
        }
    }
}

/// What changed in the relay set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelaySetChange {
    Added(RelayDescriptor),
    Removed(RelayUrl),
    Reconfigured(RelayDescriptor),
}

/// Observable pool notifications.
#[derive(Debug, Clone)]
pub enum PoolNotification {
    /// First sighting of an event across all relays.
    IncomingEvent {
        relay: RelayUrl,
        subscription_id: String,
        event: Event,
    },
    EndOfStoredEvents {
        relay: RelayUrl,
        subscription_id: String,
    },
    /// The relay set changed; `descriptors` is the new set in insertion order.
    RelaySetChanged {
        change: RelaySetChange,
        descriptors: Vec<RelayDescriptor>,
    },
    RelayStatus {
        relay: RelayUrl,
        state: ConnectionState,
    },
    /// Relay notices plus best-effort transport and protocol errors.
    Notice { relay: RelayUrl, message: String },
    PublishAck {
        relay: RelayUrl,
        event_id: String,
        accepted: bool,
        message: String,
    },
}

struct PoolRelay {
    descriptor: RelayDescriptor,
    session: Arc<RelaySession>,
    seq: u64,
}

struct PoolInner {
    config: PoolConfig,
    relays: RwLock<HashMap<RelayUrl, PoolRelay>>,
    next_seq: AtomicU64,
    subscriptions: Mutex<SubscriptionRegistry>,
    dedup: EventDeduplicator,
    acks: Mutex<PublishTracker>,
    notify_tx: broadcast::Sender<PoolNotification>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
}

/// Multi-relay pool.
///
/// Sessions report into a single funnel consumed by one router task, so every
/// notification is produced in the order the pool observed it.
pub struct RelayPool {
    inner: Arc<PoolInner>,
    router: JoinHandle<()>,
}

impl RelayPool {
    /// Create an empty pool. Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig) -> Self {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (notify_tx, _) = broadcast::channel(config.notification_capacity.max(1));
        let inner = Arc::new(PoolInner {
            relays: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            subscriptions: Mutex::new(SubscriptionRegistry::new(
                config.subscription_prefix.clone(),
            )),
            dedup: EventDeduplicator::new(config.dedup_capacity, config.dedup_retention),
            acks: Mutex::new(PublishTracker::new(config.pending_ack_capacity)),
            notify_tx,
            session_tx,
            config,
        });
        let router = tokio::spawn(route_session_events(Arc::clone(&inner), session_rx));
        Self { inner, router }
    }

    /// Subscribe to pool notifications from this point on.
    pub fn notifications(&self) -> broadcast::Receiver<PoolNotification> {
        self.inner.notify_tx.subscribe()
    }

    /// Add a relay. It stays disconnected until `connect_all` or `connect_relays`.
    pub async fn add_relay(&self, url: &str, info: RelayInfo) -> Result<RelayUrl> {
        let url = RelayUrl::parse(url)?;
        let mut relays = self.inner.relays.write().await;
        if relays.contains_key(&url) {
            return Err(ClientError::DuplicateRelay(url.to_string()));
        }
        if relays.len() >= self.inner.config.max_relays {
            return Err(ClientError::InvalidRequest(format!(
                "maximum relay limit ({}) reached",
                self.inner.config.max_relays
            )));
        }

        let descriptor = RelayDescriptor::new(url.clone(), info);
        let session = Arc::new(RelaySession::new(
            url.clone(),
            self.inner.config.session.clone(),
            self.inner.session_tx.clone(),
        ));
        relays.insert(
            url.clone(),
            PoolRelay {
                descriptor: descriptor.clone(),
                session,
                seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
        let descriptors = ordered_descriptors(&relays);
        drop(relays);

        info!("added relay {} ({:?})", url, info);
        self.inner.notify(PoolNotification::RelaySetChanged {
            change: RelaySetChange::Added(descriptor),
            descriptors,
        });
        Ok(url)
    }

    /// Remove a relay and close its session. Removing an absent relay is a no-op.
    pub async fn remove_relay(&self, url: &str) -> Result<()> {
        let url = RelayUrl::parse(url)?;
        let mut relays = self.inner.relays.write().await;
        let Some(removed) = relays.remove(&url) else {
            debug!("relay {} not in pool; nothing to remove", url);
            return Ok(());
        };
        let descriptors = ordered_descriptors(&relays);
        drop(relays);

        removed.session.disconnect().await;
        self.inner.lock_acks().forget_relay(&url);

        info!("removed relay {}", url);
        self.inner.notify(PoolNotification::RelaySetChanged {
            change: RelaySetChange::Removed(url),
            descriptors,
        });
        Ok(())
    }

    /// Change a relay's read/write role.
    ///
    /// A relay that gains read access receives every live subscription; one
    /// that loses it has them closed.
    pub async fn set_relay_info(&self, url: &str, info: RelayInfo) -> Result<()> {
        let url = RelayUrl::parse(url)?;
        let mut relays = self.inner.relays.write().await;
        let entry = relays
            .get_mut(&url)
            .ok_or_else(|| ClientError::UnknownRelay(url.to_string()))?;
        let previous = entry.descriptor.info;
        if previous == info {
            return Ok(());
        }
        entry.descriptor.info = info;
        let descriptor = entry.descriptor.clone();
        let session = Arc::clone(&entry.session);
        let descriptors = ordered_descriptors(&relays);
        drop(relays);

        if session.is_connected() {
            let live = self.inner.lock_subscriptions().snapshot();
            match (previous.can_read(), info.can_read()) {
                (false, true) => {
                    for subscription in &live {
                        send_logged(&session, &subscription.req_message());
                    }
                }
                (true, false) => {
                    for subscription in &live {
                        send_logged(&session, &subscription.close_message());
                    }
                }
                _ => {}
            }
        }

        info!("relay {} is now {:?}", url, info);
        self.inner.notify(PoolNotification::RelaySetChanged {
            change: RelaySetChange::Reconfigured(descriptor),
            descriptors,
        });
        Ok(())
    }

    /// Start every disconnected relay. Returns how many were started.
    pub async fn connect_all(&self) -> usize {
        let sessions = self.inner.sessions_where(|_| true).await;
        start_disconnected(&sessions)
    }

    /// Start the named relays that are currently disconnected. Unknown URLs
    /// are skipped. Returns how many were started.
    pub async fn connect_relays(&self, urls: &[RelayUrl]) -> usize {
        let sessions = self
            .inner
            .sessions_where(|relay| urls.contains(&relay.descriptor.url))
            .await;
        if sessions.len() < urls.len() {
            debug!(
                "{} of {} requested relays are not in the pool",
                urls.len() - sessions.len(),
                urls.len()
            );
        }
        start_disconnected(&sessions)
    }

    /// Start one relay.
    pub async fn connect_relay(&self, url: &str) -> Result<()> {
        let url = RelayUrl::parse(url)?;
        let session = self
            .relay(&url)
            .await
            .ok_or_else(|| ClientError::UnknownRelay(url.to_string()))?;
        session.connect();
        Ok(())
    }

    /// Close every session. Relays and subscriptions stay registered.
    pub async fn disconnect_all(&self) {
        let sessions = self.inner.sessions_where(|_| true).await;
        for session in sessions {
            session.disconnect().await;
        }
    }

    /// Register a subscription under a generated id and send it to every
    /// connected read relay. Relays that connect later receive it on connect.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<String> {
        let subscription = self.inner.lock_subscriptions().add(filters)?;
        self.fan_out_req(&subscription).await;
        Ok(subscription.id)
    }

    /// Same as [`RelayPool::subscribe`] with a caller-chosen id.
    pub async fn subscribe_with_id(&self, id: &str, filters: Vec<Filter>) -> Result<String> {
        let subscription = self.inner.lock_subscriptions().add_with_id(id, filters)?;
        self.fan_out_req(&subscription).await;
        Ok(subscription.id)
    }

    /// Remove a subscription and send CLOSE to connected read relays.
    /// Unknown ids are a no-op.
    pub async fn unsubscribe(&self, id: &str) -> Result<()> {
        let Some(subscription) = self.inner.lock_subscriptions().remove(id) else {
            debug!("subscription {} is not live; nothing to close", id);
            return Ok(());
        };
        let close = subscription.close_message();
        for session in self.inner.connected_readers().await {
            send_logged(&session, &close);
        }
        Ok(())
    }

    /// Live subscriptions in insertion order.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock_subscriptions().snapshot()
    }

    /// Send a signed event to every write relay.
    ///
    /// Fire-and-forget: relays that are not connected are answered right away
    /// with a rejected `PublishAck`, and connected ones answer through `OK`.
    pub async fn publish(&self, event: &Event) -> Result<OutboundEvent> {
        let mut targets: Vec<(u64, RelayUrl, Arc<RelaySession>)> = self
            .inner
            .relays
            .read()
            .await
            .values()
            .filter(|relay| relay.descriptor.info.can_write())
            .map(|relay| {
                (
                    relay.seq,
                    relay.descriptor.url.clone(),
                    Arc::clone(&relay.session),
                )
            })
            .collect();
        if targets.is_empty() {
            return Err(ClientError::NotConnected);
        }
        targets.sort_by_key(|(seq, _, _)| *seq);

        let urls: Vec<RelayUrl> = targets.iter().map(|(_, url, _)| url.clone()).collect();
        // Tracked before sending so a fast OK cannot race the bookkeeping.
        self.inner.lock_acks().track(&event.id, urls.iter().cloned());

        let message = ClientMessage::Event(event.clone());
        for (_, url, session) in &targets {
            if let Err(error) = session.send(&message) {
                self.inner.lock_acks().resolve(&event.id, url);
                self.inner.notify(PoolNotification::PublishAck {
                    relay: url.clone(),
                    event_id: event.id.clone(),
                    accepted: false,
                    message: error.to_string(),
                });
            }
        }

        debug!("published {} to {} relays", event.id, urls.len());
        Ok(OutboundEvent {
            event_id: event.id.clone(),
            targets: urls,
        })
    }

    /// Route a raw client message through the matching pool operation.
    pub async fn send(&self, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => self.subscribe_with_id(&subscription_id, filters).await.map(drop),
            ClientMessage::Close { subscription_id } => self.unsubscribe(&subscription_id).await,
            ClientMessage::Event(event) => self.publish(&event).await.map(drop),
        }
    }

    /// Relays still expected to answer `OK` for `event_id`.
    pub fn pending_acks(&self, event_id: &str) -> Vec<RelayUrl> {
        self.inner.lock_acks().pending(event_id)
    }

    /// Current relay set in insertion order.
    pub async fn descriptors(&self) -> Vec<RelayDescriptor> {
        ordered_descriptors(&*self.inner.relays.read().await)
    }

    pub async fn relay_state(&self, url: &RelayUrl) -> Option<ConnectionState> {
        self.inner
            .relays
            .read()
            .await
            .get(url)
            .map(|relay| relay.session.state())
    }

    pub async fn relay(&self, url: &RelayUrl) -> Option<Arc<RelaySession>> {
        self.inner
            .relays
            .read()
            .await
            .get(url)
            .map(|relay| Arc::clone(&relay.session))
    }

    pub async fn relay_count(&self) -> usize {
        self.inner.relays.read().await.len()
    }

    /// Close every session and drop all subscriptions and pending answers.
    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        self.inner.lock_subscriptions().clear();
        self.inner.lock_acks().clear();
        info!("relay pool shut down");
    }

    async fn fan_out_req(&self, subscription: &Subscription) {
        let req = subscription.req_message();
        for session in self.inner.connected_readers().await {
            send_logged(&session, &req);
        }
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.router.abort();
    }
}

impl PoolInner {
    fn notify(&self, notification: PoolNotification) {
        // No receivers is fine.
        let _ = self.notify_tx.send(notification);
    }

    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, SubscriptionRegistry> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_acks(&self) -> std::sync::MutexGuard<'_, PublishTracker> {
        self.acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a REQ for every live subscription on `session`.
    ///
    /// The registry stays locked while the REQs are queued, so a racing
    /// `unsubscribe` either removes the entry before the replay sees it or
    /// queues its CLOSE behind the REQ.
    fn replay_subscriptions(&self, session: &RelaySession) {
        let subscriptions = self.lock_subscriptions();
        debug!("replaying {} subscriptions to {}", subscriptions.len(), session.url());
        for subscription in subscriptions.snapshot() {
            send_logged(session, &subscription.req_message());
        }
    }

    async fn sessions_where(&self, keep: impl Fn(&PoolRelay) -> bool) -> Vec<Arc<RelaySession>> {
        let relays = self.relays.read().await;
        let mut selected: Vec<&PoolRelay> = relays.values().filter(|relay| keep(relay)).collect();
        selected.sort_by_key(|relay| relay.seq);
        selected
            .into_iter()
            .map(|relay| Arc::clone(&relay.session))
            .collect()
    }

    async fn connected_readers(&self) -> Vec<Arc<RelaySession>> {
        self.sessions_where(|relay| {
            relay.descriptor.info.can_read() && relay.session.is_connected()
        })
        .await
    }

    /// The pool entry an event belongs to, if its session is still current.
    async fn current_entry(&self, event: &SessionEvent) -> Option<(RelayInfo, Arc<RelaySession>)> {
        let relays = self.relays.read().await;
        let relay = relays.get(&event.relay)?;
        (relay.session.id() == event.session_id)
            .then(|| (relay.descriptor.info, Arc::clone(&relay.session)))
    }

    async fn handle_session_event(&self, event: SessionEvent) {
        let Some((info, session)) = self.current_entry(&event).await else {
            debug!("dropping event from retired session for {}", event.relay);
            return;
        };
        let relay = event.relay;

        match event.kind {
            SessionEventKind::State(state) => {
                if state == ConnectionState::Connected && info.can_read() {
                    // Replay before announcing so observers never see a
                    // connected relay that lacks the live subscriptions.
                    self.replay_subscriptions(&session);
                }
                self.notify(PoolNotification::RelayStatus { relay, state });
            }
            SessionEventKind::Message(message) => self.handle_relay_message(relay, message),
            SessionEventKind::Failure(message) => {
                self.notify(PoolNotification::Notice { relay, message });
            }
        }
    }

    fn handle_relay_message(&self, relay: RelayUrl, message: RelayMessage) {
        match message {
            RelayMessage::Event(subscription_id, event) => {
                if !self.lock_subscriptions().contains(&subscription_id) {
                    debug!(
                        "dropping event {} for closed subscription {}",
                        event.id, subscription_id
                    );
                    return;
                }
                if self.config.verify_events && !matches!(verify_event(&event), Ok(true)) {
                    warn!("dropping event {} from {}: invalid signature", event.id, relay);
                    return;
                }
                if !self.dedup.observe(&event.id) {
                    debug!("suppressed duplicate event {} from {}", event.id, relay);
                    return;
                }
                self.notify(PoolNotification::IncomingEvent {
                    relay,
                    subscription_id,
                    event,
                });
            }
            RelayMessage::Eose(subscription_id) => {
                self.notify(PoolNotification::EndOfStoredEvents {
                    relay,
                    subscription_id,
                });
            }
            RelayMessage::Ok(event_id, accepted, message) => {
                self.lock_acks().resolve(&event_id, &relay);
                if !accepted {
                    warn!("relay {} rejected {}: {}", relay, event_id, message);
                }
                self.notify(PoolNotification::PublishAck {
                    relay,
                    event_id,
                    accepted,
                    message,
                });
            }
            RelayMessage::Notice(message) => {
                info!("notice from {}: {}", relay, message);
                self.notify(PoolNotification::Notice { relay, message });
            }
            RelayMessage::Closed(subscription_id, message) => {
                warn!(
                    "relay {} closed subscription {}: {}",
                    relay, subscription_id, message
                );
                self.notify(PoolNotification::Notice {
                    relay,
                    message: format!("subscription {subscription_id} closed: {message}"),
                });
            }
            RelayMessage::Auth(challenge) => {
                debug!("relay {} requested auth ({} byte challenge)", relay, challenge.len());
            }
            RelayMessage::Error(message) => {
                self.notify(PoolNotification::Notice { relay, message });
            }
        }
    }
}

async fn route_session_events(inner: Arc<PoolInner>, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        inner.handle_session_event(event).await;
    }
}

fn ordered_descriptors(relays: &HashMap<RelayUrl, PoolRelay>) -> Vec<RelayDescriptor> {
    let mut entries: Vec<&PoolRelay> = relays.values().collect();
    entries.sort_by_key(|relay| relay.seq);
    entries
        .into_iter()
        .map(|relay| relay.descriptor.clone())
        .collect()
}

fn start_disconnected(sessions: &[Arc<RelaySession>]) -> usize {
    sessions
        .iter()
        .filter(|session| session.state() == ConnectionState::Disconnected)
        .filter(|session| session.connect())
        .count()
}

fn send_logged(session: &RelaySession, message: &ClientMessage) {
    if let Err(error) = session.send(message) {
        debug!("{} to {} not sent: {}", message.label(), session.url(), error);
    }
}
