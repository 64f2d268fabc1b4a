//! Nostr event primitives: the signed event shape, canonical hashing,
//! Schnorr signing, and NIP-65 relay list tags.

pub mod nip01;
pub mod nip65;
mod tag_parsing;

pub use nip01::{
    Event, EventTemplate, KIND_CONTACTS, KIND_METADATA, KIND_RELAY_LIST_METADATA,
    KIND_SHORT_TEXT_NOTE, Nip01Error, UnsignedEvent, finalize_event, generate_secret_key,
    get_event_hash, get_public_key, get_public_key_hex, parse_secret_key, serialize_event,
    validate_event, verify_event,
};
pub use nip65::{Nip65Error, RelayEntry, RelayListMetadata, RelayMarker};
