//! File-backed pool settings and relay lists (TOML).

use crate::descriptor::{RelayDescriptor, RelayInfo, RelayUrl};
use crate::error::Result;
use crate::pool::PoolConfig;
use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Optional overrides for [`PoolConfig`], as written in a config file.
///
/// ```toml
/// [pool]
/// max_relays = 32
/// dedup_capacity = 5000
/// verify_events = true
///
/// [session]
/// connect_timeout_ms = 5000
/// reconnect_initial_ms = 1000
/// reconnect_max_ms = 60000
/// stability_window_secs = 30
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_relays: Option<usize>,
    pub dedup_capacity: Option<usize>,
    pub dedup_retention_secs: Option<u64>,
    pub notification_capacity: Option<usize>,
    pub verify_events: Option<bool>,
    pub subscription_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub connect_timeout_ms: Option<u64>,
    pub reconnect_initial_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub stability_window_secs: Option<u64>,
}

impl SessionSettings {
    pub fn apply(&self, mut config: SessionConfig) -> SessionConfig {
        if let Some(ms) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_initial_ms {
            config.reconnect_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect_max_ms {
            config.reconnect_max = Duration::from_millis(ms);
        }
        if let Some(secs) = self.stability_window_secs {
            config.stability_window = Duration::from_secs(secs);
        }
        config
    }
}

impl PoolSettings {
    /// Overlay these settings on the defaults.
    pub fn to_pool_config(&self, session: &SessionSettings) -> PoolConfig {
        let mut config = PoolConfig::default();
        if let Some(max_relays) = self.max_relays {
            config.max_relays = max_relays;
        }
        if let Some(capacity) = self.dedup_capacity {
            config.dedup_capacity = capacity;
        }
        if let Some(secs) = self.dedup_retention_secs {
            config.dedup_retention = Some(Duration::from_secs(secs));
        }
        if let Some(capacity) = self.notification_capacity {
            config.notification_capacity = capacity;
        }
        if let Some(verify) = self.verify_events {
            config.verify_events = verify;
        }
        if let Some(prefix) = &self.subscription_prefix {
            config.subscription_prefix = prefix.clone();
        }
        config.session = session.apply(config.session);
        config
    }
}

/// Persisted relay list.
///
/// ```toml
/// [[relays]]
/// url = "wss://relay.damus.io"
/// info = "read-write"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayListFile {
    #[serde(default)]
    pub relays: Vec<RelayDescriptor>,
}

impl RelayListFile {
    /// Wrap descriptors, keeping the first entry for each URL.
    pub fn from_descriptors(relays: Vec<RelayDescriptor>) -> Self {
        let mut list = Self { relays };
        list.dedup();
        list
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let list: Self = toml::from_str(text)?;
        Ok(Self::from_descriptors(list.relays))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load `path`, or an empty list if the file does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("relay list {} not found; starting empty", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Insert or update a relay. Returns `true` if the list changed.
    pub fn upsert(&mut self, url: RelayUrl, info: RelayInfo) -> bool {
        match self.relays.iter_mut().find(|relay| relay.url == url) {
            Some(existing) if existing.info == info => false,
            Some(existing) => {
                existing.info = info;
                true
            }
            None => {
                self.relays.push(RelayDescriptor::new(url, info));
                true
            }
        }
    }

    /// Returns `true` if the relay was present.
    pub fn remove(&mut self, url: &RelayUrl) -> bool {
        let before = self.relays.len();
        self.relays.retain(|relay| &relay.url != url);
        self.relays.len() != before
    }

    pub fn contains(&self, url: &RelayUrl) -> bool {
        self.relays.iter().any(|relay| &relay.url == url)
    }

    // Keeps the first occurrence of each URL.
    fn dedup(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.relays.retain(|relay| seen.insert(relay.url.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;

    #[test]
    fn parses_relay_list_and_normalizes_urls() -> Result<()> {
        let list = RelayListFile::from_toml_str(
            r#"
[[relays]]
url = "wss://Relay.Example/"
info = "read"

[[relays]]
url = "wss://relay.example"
info = "write"

[[relays]]
url = "wss://other.example"
"#,
        )?;

        assert_eq!(list.relays.len(), 2);
        assert_eq!(list.relays[0].url.as_str(), "wss://relay.example");
        assert_eq!(list.relays[0].info, RelayInfo::Read);
        assert_eq!(list.relays[1].info, RelayInfo::ReadWrite);
        Ok(())
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let result = RelayListFile::from_toml_str(
            r#"
[[relays]]
url = "https://relay.example"
"#,
        );
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn save_then_load_preserves_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("relays.toml");

        let mut list = RelayListFile::default();
        assert!(list.upsert(RelayUrl::parse("wss://b.example")?, RelayInfo::Read));
        assert!(list.upsert(RelayUrl::parse("wss://a.example")?, RelayInfo::ReadWrite));
        assert!(!list.upsert(RelayUrl::parse("wss://a.example")?, RelayInfo::ReadWrite));
        list.save(&path)?;

        let loaded = RelayListFile::load(&path)?;
        assert_eq!(loaded, list);

        let missing = RelayListFile::load_or_default(&dir.path().join("absent.toml"))?;
        assert!(missing.relays.is_empty());
        Ok(())
    }

    #[test]
    fn settings_overlay_defaults() -> Result<()> {
        let pool: PoolSettings = toml::from_str("max_relays = 4\nverify_events = false")?;
        let session: SessionSettings = toml::from_str("reconnect_max_ms = 5000")?;
        let config = pool.to_pool_config(&session);

        assert_eq!(config.max_relays, 4);
        assert!(!config.verify_events);
        assert_eq!(config.dedup_capacity, PoolConfig::default().dedup_capacity);
        assert_eq!(config.session.reconnect_max, Duration::from_secs(5));
        assert_eq!(config.session.reconnect_initial, Duration::from_secs(1));
        Ok(())
    }
}
