//! Publishing a relay addition to the user's relay lists.
//!
//! Fetches the newest kind-10002 and kind-3 events authored by the signing
//! key, appends the relay to each, and publishes the re-signed events through
//! the configured write relays.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, bail};
use nostr::{Event, KIND_CONTACTS, KIND_RELAY_LIST_METADATA};
use nostr_relay_pool::{
    ConnectionState, ContactListSync, Filter, PoolNotification, RelayInfo, RelayPool, RelayUrl,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{Duration, Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::config::CliConfig;

const FETCH_SUBSCRIPTION_ID: &str = "relay-list-sync";

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub timeout: Duration,
    /// Publish a fresh relay list when the user has none yet.
    pub bootstrap: bool,
}

/// Outcome of one published list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedList {
    pub kind: u16,
    pub event_id: String,
    pub accepted: Vec<RelayUrl>,
    pub rejected: Vec<(RelayUrl, String)>,
    /// Relays that never answered before the deadline.
    pub silent: Vec<RelayUrl>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub found_kinds: Vec<u16>,
    pub published: Vec<PublishedList>,
}

/// Append `relay` to the user's published relay lists.
pub async fn publish_relay_addition(
    config: &CliConfig,
    signer: &ContactListSync,
    relay: &RelayUrl,
    info: RelayInfo,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let Some(pubkey) = signer.public_key().map(str::to_string) else {
        bail!("no usable signing key");
    };
    if config.relays.is_empty() {
        bail!("no relays configured");
    }

    let pool = RelayPool::new(config.pool_config());
    let mut notifications = pool.notifications();
    for descriptor in &config.relays {
        pool.add_relay(descriptor.url.as_str(), descriptor.info)
            .await
            .with_context(|| format!("failed to add {}", descriptor.url))?;
    }
    let started = pool.connect_all().await;
    debug!("connecting to {} relays", started);

    let request = SyncRequest {
        config,
        signer,
        pubkey: &pubkey,
        relay,
        info,
        bootstrap: options.bootstrap,
        deadline: Instant::now() + options.timeout,
    };
    let result = run_sync(&pool, &mut notifications, &request).await;
    pool.shutdown().await;
    result
}

struct SyncRequest<'a> {
    config: &'a CliConfig,
    signer: &'a ContactListSync,
    pubkey: &'a str,
    relay: &'a RelayUrl,
    info: RelayInfo,
    bootstrap: bool,
    deadline: Instant,
}

async fn run_sync(
    pool: &RelayPool,
    notifications: &mut broadcast::Receiver<PoolNotification>,
    request: &SyncRequest<'_>,
) -> Result<SyncReport> {
    let SyncRequest {
        config,
        signer,
        pubkey,
        relay,
        info,
        bootstrap,
        deadline,
    } = *request;
    let readers: HashSet<RelayUrl> = config
        .relays
        .iter()
        .filter(|descriptor| descriptor.info.can_read())
        .map(|descriptor| descriptor.url.clone())
        .collect();
    let writers: HashSet<RelayUrl> = config
        .relays
        .iter()
        .filter(|descriptor| descriptor.info.can_write())
        .map(|descriptor| descriptor.url.clone())
        .collect();
    if writers.is_empty() {
        bail!("no write relay configured");
    }

    let mut connected = HashSet::new();
    let newest =
        fetch_relay_lists(pool, notifications, pubkey, &readers, &mut connected, deadline).await?;

    let mut report = SyncReport {
        found_kinds: newest.keys().copied().collect(),
        ..SyncReport::default()
    };
    report.found_kinds.sort_unstable();

    let mut updates = Vec::new();
    for kind in [KIND_RELAY_LIST_METADATA, KIND_CONTACTS] {
        if let Some(prior) = newest.get(&kind) {
            match signer.add_relay_to_list(Some(prior), relay, info) {
                Some(event) => updates.push(event),
                None => warn!("could not update kind {} relay list", kind),
            }
        }
    }
    if !newest.contains_key(&KIND_RELAY_LIST_METADATA) && bootstrap {
        info!("no relay list found; publishing a fresh one");
        if let Some(event) = signer.relay_list_event(&config.relays) {
            updates.push(event);
        }
    }
    if updates.is_empty() {
        info!("nothing to publish");
        return Ok(report);
    }

    wait_for_relays(notifications, &writers, &mut connected, deadline).await;

    for event in updates {
        let published = publish_and_collect(pool, notifications, &event, deadline).await?;
        report.published.push(published);
    }
    Ok(report)
}

/// Newest relay-list event per kind, gathered until every read relay sent
/// EOSE or the deadline passed.
async fn fetch_relay_lists(
    pool: &RelayPool,
    notifications: &mut broadcast::Receiver<PoolNotification>,
    pubkey: &str,
    readers: &HashSet<RelayUrl>,
    connected: &mut HashSet<RelayUrl>,
    deadline: Instant,
) -> Result<HashMap<u16, Event>> {
    let filter = Filter::new()
        .authors(vec![pubkey.to_string()])
        .kinds(vec![KIND_RELAY_LIST_METADATA, KIND_CONTACTS]);
    let subscription_id = pool.subscribe_with_id(FETCH_SUBSCRIPTION_ID, vec![filter]).await?;

    let mut newest: HashMap<u16, Event> = HashMap::new();
    let mut finished: HashSet<RelayUrl> = HashSet::new();
    while !readers.is_empty() && !readers.is_subset(&finished) {
        let Some(notification) = next_notification(notifications, deadline).await else {
            debug!(
                "stopped waiting for stored events; {} of {} read relays finished",
                finished.len(),
                readers.len()
            );
            break;
        };
        match notification {
            PoolNotification::IncomingEvent {
                subscription_id: id,
                event,
                ..
            } if id == subscription_id && event.pubkey == pubkey => {
                let replace = newest
                    .get(&event.kind)
                    .is_none_or(|current| event.created_at > current.created_at);
                if replace {
                    newest.insert(event.kind, event);
                }
            }
            PoolNotification::EndOfStoredEvents {
                relay,
                subscription_id: id,
            } if id == subscription_id => {
                finished.insert(relay);
            }
            // An unreachable reader has nothing to offer this run.
            PoolNotification::RelayStatus {
                ref relay,
                state: ConnectionState::Reconnecting(_),
            } => {
                finished.insert(relay.clone());
                track_connection(&notification, connected);
            }
            other => track_connection(&other, connected),
        }
    }

    pool.unsubscribe(&subscription_id).await?;
    Ok(newest)
}

async fn wait_for_relays(
    notifications: &mut broadcast::Receiver<PoolNotification>,
    wanted: &HashSet<RelayUrl>,
    connected: &mut HashSet<RelayUrl>,
    deadline: Instant,
) {
    while !wanted.is_subset(connected) {
        let Some(notification) = next_notification(notifications, deadline).await else {
            warn!(
                "{} of {} write relays connected before the deadline",
                wanted.intersection(connected).count(),
                wanted.len()
            );
            return;
        };
        track_connection(&notification, connected);
    }
}

async fn publish_and_collect(
    pool: &RelayPool,
    notifications: &mut broadcast::Receiver<PoolNotification>,
    event: &Event,
    deadline: Instant,
) -> Result<PublishedList> {
    let outbound = pool
        .publish(event)
        .await
        .with_context(|| format!("failed to publish kind {} relay list", event.kind))?;
    info!("published kind {} relay list {}", event.kind, outbound.event_id);

    let mut published = PublishedList {
        kind: event.kind,
        event_id: outbound.event_id.clone(),
        accepted: Vec::new(),
        rejected: Vec::new(),
        silent: Vec::new(),
    };
    let mut waiting: HashSet<RelayUrl> = outbound.targets.iter().cloned().collect();
    while !waiting.is_empty() {
        let Some(notification) = next_notification(notifications, deadline).await else {
            break;
        };
        if let PoolNotification::PublishAck {
            relay,
            event_id,
            accepted,
            message,
        } = notification
        {
            if event_id != outbound.event_id || !waiting.remove(&relay) {
                continue;
            }
            if accepted {
                published.accepted.push(relay);
            } else {
                published.rejected.push((relay, message));
            }
        }
    }
    published.silent = outbound
        .targets
        .into_iter()
        .filter(|relay| waiting.contains(relay))
        .collect();
    Ok(published)
}

fn track_connection(notification: &PoolNotification, connected: &mut HashSet<RelayUrl>) {
    if let PoolNotification::RelayStatus { relay, state } = notification {
        if *state == ConnectionState::Connected {
            connected.insert(relay.clone());
        } else {
            connected.remove(relay);
        }
    }
}

/// Next notification before `deadline`, or `None` once it passes or the pool
/// goes away.
async fn next_notification(
    notifications: &mut broadcast::Receiver<PoolNotification>,
    deadline: Instant,
) -> Option<PoolNotification> {
    loop {
        match timeout_at(deadline, notifications.recv()).await {
            Err(_) => return None,
            Ok(Ok(notification)) => return Some(notification),
            Ok(Err(RecvError::Lagged(skipped))) => {
                warn!("notification stream lagged; skipped {}", skipped);
            }
            Ok(Err(RecvError::Closed)) => return None,
        }
    }
}
