//! Relay-list updates for the user's contact list (kind 3) and relay list
//! metadata (kind 10002).
//!
//! Everything here is a pure transformation: nothing is published. Callers
//! hand the returned event to [`crate::RelayPool::publish`].

use crate::descriptor::{RelayDescriptor, RelayInfo, RelayUrl};
use crate::error::{ClientError, Result};
use nostr::nip65::{RELAY_TAG, create_relay_tag};
use nostr::{
    Event, EventTemplate, KIND_CONTACTS, KIND_RELAY_LIST_METADATA, finalize_event,
    get_public_key_hex, parse_secret_key,
};
use serde_json::{Map, Value, json};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Builds signed relay-list events for one identity.
#[derive(Clone)]
pub struct ContactListSync {
    secret_key: Option<[u8; 32]>,
    public_key: Option<String>,
}

impl std::fmt::Debug for ContactListSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactListSync")
            .field("public_key", &self.public_key)
            .field("secret_key", &self.secret_key.map(|_| "<redacted>"))
            .finish()
    }
}

impl ContactListSync {
    /// A sync without a key builds nothing; every update returns `None`.
    pub fn new(secret_key: Option<[u8; 32]>) -> Self {
        let public_key = secret_key.and_then(|key| match get_public_key_hex(&key) {
            Ok(public_key) => Some(public_key),
            Err(error) => {
                warn!("unusable signing key: {}", error);
                None
            }
        });
        Self {
            secret_key: public_key.as_ref().and(secret_key),
            public_key,
        }
    }

    /// Parse a 64-character hex secret key.
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let secret_key = parse_secret_key(secret_hex.trim())
            .map_err(|error| ClientError::InvalidRequest(format!("invalid secret key: {error}")))?;
        Ok(Self::new(Some(secret_key)))
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    /// The prior event with `new_relay` appended, re-signed.
    ///
    /// Returns `None` when the prior event or the key is unavailable, when
    /// the key does not belong to the prior event's author, or when the
    /// event cannot be rebuilt. A relay that is already listed leaves the
    /// tags unchanged.
    pub fn add_relay_to_list(
        &self,
        existing: Option<&Event>,
        new_relay: &RelayUrl,
        info: RelayInfo,
    ) -> Option<Event> {
        self.add_relay_to_list_at(existing, new_relay, info, unix_now())
    }

    /// [`ContactListSync::add_relay_to_list`] with an explicit timestamp.
    ///
    /// The result is always newer than the prior event so relays replace it.
    pub fn add_relay_to_list_at(
        &self,
        existing: Option<&Event>,
        new_relay: &RelayUrl,
        info: RelayInfo,
        created_at: u64,
    ) -> Option<Event> {
        let Some(existing) = existing else {
            debug!("no prior relay list; cannot add {}", new_relay);
            return None;
        };
        let (secret_key, public_key) = self.signing_identity()?;
        if existing.pubkey != public_key {
            warn!(
                "relay list {} belongs to {}, not the signing key",
                existing.id, existing.pubkey
            );
            return None;
        }
        if existing.kind != KIND_CONTACTS && existing.kind != KIND_RELAY_LIST_METADATA {
            warn!("event kind {} does not carry a relay list", existing.kind);
            return None;
        }

        let mut tags = existing.tags.clone();
        if lists_relay(&tags, new_relay) {
            debug!("relay {} already listed", new_relay);
        } else {
            tags.push(create_relay_tag(new_relay.as_str(), info.into()));
        }

        let content = if existing.kind == KIND_CONTACTS {
            merge_relay_map(&existing.content, new_relay, info)?
        } else {
            existing.content.clone()
        };

        let template = EventTemplate {
            created_at: created_at.max(existing.created_at.saturating_add(1)),
            kind: existing.kind,
            tags,
            content,
        };
        sign(&template, &secret_key)
    }

    /// A fresh kind-10002 relay list describing `descriptors`.
    pub fn relay_list_event(&self, descriptors: &[RelayDescriptor]) -> Option<Event> {
        self.relay_list_event_at(descriptors, unix_now())
    }

    pub fn relay_list_event_at(
        &self,
        descriptors: &[RelayDescriptor],
        created_at: u64,
    ) -> Option<Event> {
        let (secret_key, _) = self.signing_identity()?;
        let tags = descriptors
            .iter()
            .map(|descriptor| create_relay_tag(descriptor.url.as_str(), descriptor.info.into()))
            .collect();
        let template = EventTemplate {
            created_at,
            kind: KIND_RELAY_LIST_METADATA,
            tags,
            content: String::new(),
        };
        sign(&template, &secret_key)
    }

    fn signing_identity(&self) -> Option<([u8; 32], &str)> {
        match (self.secret_key, self.public_key.as_deref()) {
            (Some(secret_key), Some(public_key)) => Some((secret_key, public_key)),
            _ => {
                debug!("no signing key available for relay list update");
                None
            }
        }
    }
}

fn sign(template: &EventTemplate, secret_key: &[u8; 32]) -> Option<Event> {
    match finalize_event(template, secret_key) {
        Ok(event) => Some(event),
        Err(error) => {
            warn!("failed to sign relay list: {}", error);
            None
        }
    }
}

fn lists_relay(tags: &[Vec<String>], relay: &RelayUrl) -> bool {
    tags.iter()
        .filter(|tag| tag.first().map(String::as_str) == Some(RELAY_TAG))
        .filter_map(|tag| tag.get(1))
        .any(|url| same_relay(url, relay))
}

fn same_relay(candidate: &str, relay: &RelayUrl) -> bool {
    RelayUrl::parse(candidate).is_ok_and(|parsed| &parsed == relay)
}

/// Merge the relay into the `{url: {"read": bool, "write": bool}}` map that
/// contact lists keep in their content.
fn merge_relay_map(content: &str, relay: &RelayUrl, info: RelayInfo) -> Option<String> {
    let mut relays = if content.trim().is_empty() {
        Map::new()
    } else {
        match serde_json::from_str::<Value>(content) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!("contact list content is not a relay map; refusing to rewrite it");
                return None;
            }
        }
    };

    if !relays.keys().any(|url| same_relay(url, relay)) {
        relays.insert(
            relay.to_string(),
            json!({ "read": info.can_read(), "write": info.can_write() }),
        );
    }
    serde_json::to_string(&Value::Object(relays)).ok()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
