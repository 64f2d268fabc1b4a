//! Outstanding publish acknowledgements.

use crate::descriptor::RelayUrl;
use std::collections::{HashMap, HashSet, VecDeque};

/// Receipt returned by a publish: the event id and the relays it was sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub event_id: String,
    pub targets: Vec<RelayUrl>,
}

/// Relays that have not yet answered `OK` for each published event.
///
/// Bounded: once more than `capacity` events are tracked the oldest is
/// forgotten, since relays are not obliged to answer.
#[derive(Debug)]
pub struct PublishTracker {
    capacity: usize,
    pending: HashMap<String, HashSet<RelayUrl>>,
    order: VecDeque<String>,
}

impl PublishTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn track(&mut self, event_id: &str, relays: impl IntoIterator<Item = RelayUrl>) {
        let relays: HashSet<RelayUrl> = relays.into_iter().collect();
        if relays.is_empty() {
            return;
        }
        if self.pending.insert(event_id.to_string(), relays).is_none() {
            self.order.push_back(event_id.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.pending.remove(&evicted);
            }
        }
    }

    /// Mark `relay` as having answered for `event_id`.
    /// Returns `true` if that answer was outstanding.
    pub fn resolve(&mut self, event_id: &str, relay: &RelayUrl) -> bool {
        let Some(relays) = self.pending.get_mut(event_id) else {
            return false;
        };
        let removed = relays.remove(relay);
        if relays.is_empty() {
            self.forget(event_id);
        }
        removed
    }

    /// Drop every outstanding answer from `relay`.
    pub fn forget_relay(&mut self, relay: &RelayUrl) {
        let emptied: Vec<String> = self
            .pending
            .iter_mut()
            .filter_map(|(event_id, relays)| {
                relays.remove(relay);
                relays.is_empty().then(|| event_id.clone())
            })
            .collect();
        for event_id in emptied {
            self.forget(&event_id);
        }
    }

    /// Relays still expected to answer for `event_id`, sorted.
    pub fn pending(&self, event_id: &str) -> Vec<RelayUrl> {
        let mut relays: Vec<RelayUrl> = self
            .pending
            .get(event_id)
            .map(|relays| relays.iter().cloned().collect())
            .unwrap_or_default();
        relays.sort();
        relays
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.order.clear();
    }

    fn forget(&mut self, event_id: &str) {
        self.pending.remove(event_id);
        self.order.retain(|id| id != event_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn urls(inputs: &[&str]) -> Result<Vec<RelayUrl>> {
        inputs.iter().map(|input| RelayUrl::parse(input)).collect()
    }

    #[test]
    fn answers_resolve_until_empty() -> Result<()> {
        let relays = urls(&["wss://a.example", "wss://b.example"])?;
        let mut tracker = PublishTracker::new(8);
        tracker.track("e1", relays.clone());

        assert!(tracker.resolve("e1", &relays[0]));
        assert!(!tracker.resolve("e1", &relays[0]));
        assert_eq!(tracker.pending("e1"), vec![relays[1].clone()]);

        assert!(tracker.resolve("e1", &relays[1]));
        assert!(tracker.is_empty());
        Ok(())
    }

    #[test]
    fn forgetting_a_relay_clears_its_answers() -> Result<()> {
        let relays = urls(&["wss://a.example", "wss://b.example"])?;
        let mut tracker = PublishTracker::new(8);
        tracker.track("e1", vec![relays[0].clone()]);
        tracker.track("e2", relays.clone());

        tracker.forget_relay(&relays[0]);
        assert!(tracker.pending("e1").is_empty());
        assert_eq!(tracker.pending("e2"), vec![relays[1].clone()]);
        assert_eq!(tracker.len(), 1);
        Ok(())
    }

    #[test]
    fn oldest_event_is_forgotten_past_capacity() -> Result<()> {
        let relays = urls(&["wss://a.example"])?;
        let mut tracker = PublishTracker::new(2);
        for id in ["e1", "e2", "e3"] {
            tracker.track(id, relays.clone());
        }
        assert!(tracker.pending("e1").is_empty());
        assert_eq!(tracker.pending("e3"), relays);
        assert_eq!(tracker.len(), 2);
        Ok(())
    }
}
