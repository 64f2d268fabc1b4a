//! `relay-cli` configuration file.

use anyhow::{Context, Result};
use delegation_client::DelegationConfig;
use nostr_relay_pool::{
    PoolConfig, PoolSettings, RelayDescriptor, RelayListFile, SessionSettings,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const CONFIG_PATH_ENV: &str = "NOSTR_RELAY_CLI_CONFIG";
pub const SECRET_KEY_ENV: &str = "NOSTR_SECRET_KEY";
pub const DEFAULT_CONFIG_FILE: &str = "relay-cli.toml";

/// Whole configuration file.
///
/// ```toml
/// [pool]
/// max_relays = 32
///
/// [session]
/// reconnect_max_ms = 60000
///
/// [delegation]
/// enabled = true
/// base_url = "https://delegation.example"
///
/// [[relays]]
/// url = "wss://relay.damus.io"
/// info = "read-write"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub pool: PoolSettings,
    pub session: SessionSettings,
    pub delegation: DelegationConfig,
    pub relays: Vec<RelayDescriptor>,
}

impl CliConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text).context("invalid relay-cli config")?;
        config.relays = RelayListFile::from_descriptors(config.relays).relays;
        Ok(config)
    }

    /// Load `path`; a missing file is an empty configuration.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("config {} not found; using defaults", path.display());
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let text = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.pool.to_pool_config(&self.session)
    }

    pub fn relay_list(&self) -> RelayListFile {
        RelayListFile::from_descriptors(self.relays.clone())
    }

    pub fn set_relay_list(&mut self, list: RelayListFile) {
        self.relays = list.relays;
    }
}

/// `--config`, then `$NOSTR_RELAY_CLI_CONFIG`, then `./relay-cli.toml`.
pub fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| {
        std::env::var_os(CONFIG_PATH_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    })
    .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

/// Hex signing key from the environment, if set.
pub fn secret_key_from_env() -> Option<String> {
    std::env::var(SECRET_KEY_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
