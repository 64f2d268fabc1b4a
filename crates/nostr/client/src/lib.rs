//! Multi-relay Nostr connection pool.
//!
//! A [`RelayPool`] owns one [`RelaySession`] per relay, replays live
//! subscriptions to every relay that (re)connects, and merges the relays'
//! events into one deduplicated notification stream. [`ContactListSync`]
//! builds the signed relay-list updates a client publishes when its relay
//! set changes.

pub mod backoff;
pub mod config;
pub mod contact_list;
pub mod dedup;
pub mod descriptor;
pub mod error;
pub mod message;
pub mod pool;
pub mod publish;
pub mod session;
pub mod subscription;

pub use backoff::ReconnectBackoff;
pub use config::{PoolSettings, RelayListFile, SessionSettings};
pub use contact_list::ContactListSync;
pub use dedup::{EventDeduplicator, SeenEventCache};
pub use descriptor::{RelayDescriptor, RelayInfo, RelayUrl};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filter, RelayMessage, parse_relay_message};
pub use pool::{PoolConfig, PoolNotification, RelayPool, RelaySetChange};
pub use publish::{OutboundEvent, PublishTracker};
pub use session::{ConnectionState, RelaySession, SessionConfig, SessionEvent, SessionEventKind};
pub use subscription::{Subscription, SubscriptionRegistry};
