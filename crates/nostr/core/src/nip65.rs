//! NIP-65: relay list metadata.
//!
//! A replaceable event (kind 10002) whose `r` tags advertise the relays a user
//! writes to and reads from. An `r` tag without a marker means both.

use crate::nip01::{Event, KIND_RELAY_LIST_METADATA};
use crate::tag_parsing::{collect_tag_values, tag_field, tags_named};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag name for relay entries.
pub const RELAY_TAG: &str = "r";

pub const READ_MARKER: &str = "read";
pub const WRITE_MARKER: &str = "write";

#[derive(Debug, Error)]
pub enum Nip65Error {
    #[error("event is not a relay list metadata event (kind {0})")]
    InvalidKind(u16),

    #[error("invalid relay tag format: {0}")]
    InvalidTag(String),
}

/// Relay marker indicating usage direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayMarker {
    Read,
    Write,
    ReadWrite,
}

impl RelayMarker {
    /// Tag marker string; read-write relays carry no marker.
    pub fn to_str(&self) -> Option<&'static str> {
        match self {
            RelayMarker::Read => Some(READ_MARKER),
            RelayMarker::Write => Some(WRITE_MARKER),
            RelayMarker::ReadWrite => None,
        }
    }

    /// Parse a tag marker. Missing or unknown markers mean read-write.
    pub fn from_marker(marker: Option<&str>) -> Self {
        match marker {
            Some(READ_MARKER) => RelayMarker::Read,
            Some(WRITE_MARKER) => RelayMarker::Write,
            _ => RelayMarker::ReadWrite,
        }
    }

    pub fn can_read(&self) -> bool {
        matches!(self, RelayMarker::Read | RelayMarker::ReadWrite)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, RelayMarker::Write | RelayMarker::ReadWrite)
    }
}

/// A relay entry in the relay list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntry {
    pub url: String,
    pub marker: RelayMarker,
}

impl RelayEntry {
    pub fn new(url: impl Into<String>, marker: RelayMarker) -> Self {
        Self {
            url: url.into(),
            marker,
        }
    }

    /// Encode as an `r` tag.
    pub fn to_tag(&self) -> Vec<String> {
        create_relay_tag(&self.url, self.marker)
    }
}

/// Parsed relay list metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelayListMetadata {
    pub relays: Vec<RelayEntry>,
}

impl RelayListMetadata {
    pub fn new(relays: Vec<RelayEntry>) -> Self {
        Self { relays }
    }

    pub fn from_event(event: &Event) -> Result<Self, Nip65Error> {
        if event.kind != KIND_RELAY_LIST_METADATA {
            return Err(Nip65Error::InvalidKind(event.kind));
        }
        Ok(Self {
            relays: get_relay_entries(&event.tags)?,
        })
    }

    pub fn read_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_read())
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn write_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_write())
            .map(|r| r.url.clone())
            .collect()
    }

    /// Encode all entries as `r` tags, in order.
    pub fn to_tags(&self) -> Vec<Vec<String>> {
        self.relays.iter().map(RelayEntry::to_tag).collect()
    }
}

pub fn is_relay_list_metadata_kind(kind: u16) -> bool {
    kind == KIND_RELAY_LIST_METADATA
}

/// Read relay entries from a tag set, ignoring non-`r` tags.
pub fn get_relay_entries(tags: &[Vec<String>]) -> Result<Vec<RelayEntry>, Nip65Error> {
    tags_named(tags, RELAY_TAG)
        .map(|tag| {
            let url = tag_field(tag, 1).ok_or_else(|| {
                Nip65Error::InvalidTag("relay tag must have at least URL".to_string())
            })?;
            Ok(RelayEntry::new(url, RelayMarker::from_marker(tag_field(tag, 2))))
        })
        .collect()
}

/// Relay URLs mentioned by `r` tags, ignoring malformed tags.
pub fn relay_urls(tags: &[Vec<String>]) -> Vec<String> {
    collect_tag_values(tags, RELAY_TAG)
}

pub fn create_relay_tag(url: &str, marker: RelayMarker) -> Vec<String> {
    let mut tag = vec![RELAY_TAG.to_string(), url.to_string()];
    if let Some(marker) = marker.to_str() {
        tag.push(marker.to_string());
    }
    tag
}
