//! Live subscriptions that every read relay must carry.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter};
use std::collections::HashSet;

/// A standing query registered with relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            id: id.into(),
            filters,
        }
    }

    pub fn req_message(&self) -> ClientMessage {
        ClientMessage::Req {
            subscription_id: self.id.clone(),
            filters: self.filters.clone(),
        }
    }

    pub fn close_message(&self) -> ClientMessage {
        ClientMessage::Close {
            subscription_id: self.id.clone(),
        }
    }
}

/// Insertion-ordered set of live subscriptions.
///
/// Ids are never reused within one registry: an id stays reserved after the
/// subscription is removed.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    prefix: String,
    next_id: u64,
    live: Vec<Subscription>,
    issued: HashSet<String>,
}

impl SubscriptionRegistry {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: 0,
            live: Vec::new(),
            issued: HashSet::new(),
        }
    }

    /// Register filters under a fresh id.
    pub fn add(&mut self, filters: Vec<Filter>) -> Result<Subscription> {
        let id = loop {
            self.next_id += 1;
            let candidate = format!("{}-{}", self.prefix, self.next_id);
            if !self.issued.contains(&candidate) {
                break candidate;
            }
        };
        self.add_with_id(id, filters)
    }

    /// Register filters under a caller-supplied id.
    pub fn add_with_id(&mut self, id: impl Into<String>, filters: Vec<Filter>) -> Result<Subscription> {
        let id = id.into();
        if id.is_empty() || id.len() > 64 {
            return Err(ClientError::Subscription(
                "subscription id must be 1-64 characters".to_string(),
            ));
        }
        if filters.is_empty() {
            return Err(ClientError::Subscription(
                "subscription needs at least one filter".to_string(),
            ));
        }
        if !self.issued.insert(id.clone()) {
            return Err(ClientError::DuplicateSubscription(id));
        }

        let subscription = Subscription::new(id, filters);
        self.live.push(subscription.clone());
        Ok(subscription)
    }

    /// Unregister `id`; returns the removed subscription if it was live.
    pub fn remove(&mut self, id: &str) -> Option<Subscription> {
        let index = self.live.iter().position(|sub| sub.id == id)?;
        Some(self.live.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&Subscription> {
        self.live.iter().find(|sub| sub.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Live subscriptions in insertion order, for replay to a relay.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.live.clone()
    }

    /// Drop every live subscription. Ids stay reserved.
    pub fn clear(&mut self) -> Vec<Subscription> {
        std::mem::take(&mut self.live)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new("sub")
    }
}
