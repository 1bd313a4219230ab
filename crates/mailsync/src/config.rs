//! Sync configuration
//!
//! Settings are loaded (in order of priority):
//! 1. Runtime environment variables (`MAILSYNC_MAX_BODY_SIZE`,
//!    `MAILSYNC_METERED_METADATA_ONLY`)
//! 2. JSON file (~/.config/mailsync/sync-settings.json)
//! 3. Built-in defaults

use anyhow::{Context, Result};
use ::config::ConfigDir;
use serde::{Deserialize, Serialize};

/// Settings filename in the mailsync config directory
pub const SETTINGS_FILE: &str = "sync-settings.json";

const ENV_MAX_BODY_SIZE: &str = "MAILSYNC_MAX_BODY_SIZE";
const ENV_METERED_METADATA_ONLY: &str = "MAILSYNC_METERED_METADATA_ONLY";

/// Kind of network the device is on when a sync starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTier {
    #[default]
    Unmetered,
    Metered,
}

/// Per-invocation options for a folder sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Skip body downloads when on a metered network
    pub metadata_only_on_metered_network: bool,
    /// Bodies larger than this stay partial until explicitly requested
    pub max_auto_fetch_body_size: u64,
    /// Ignore the watermark and list the whole folder
    pub full_resync: bool,
    pub network: NetworkTier,
    /// Remove local messages the server no longer lists
    pub sync_remote_deletions: bool,
    /// Expunge the remote folder before listing it
    pub expunge_on_poll: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncSettings::default().sync_config(NetworkTier::Unmetered, false)
    }
}

impl SyncConfig {
    /// Whether message bodies may be downloaded in this run
    pub fn allows_content_fetch(&self) -> bool {
        !(self.metadata_only_on_metered_network && self.network == NetworkTier::Metered)
    }
}

/// Retry behaviour for transient account-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before the account is marked failed
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 30,
            max_delay_secs: 30 * 60,
        }
    }
}

/// Persistent sync settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub max_auto_fetch_body_size: u64,
    pub metadata_only_on_metered_network: bool,
    pub sync_remote_deletions: bool,
    pub expunge_on_poll: bool,
    /// Minimum seconds between automatic syncs of an account
    pub sync_cooldown_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_auto_fetch_body_size: 32 * 1024,
            metadata_only_on_metered_network: true,
            sync_remote_deletions: true,
            expunge_on_poll: false,
            sync_cooldown_secs: 60,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncSettings {
    /// Load settings from the default config directory
    pub fn load() -> Result<Self> {
        match ConfigDir::default_location() {
            Some(dir) => Self::load_from(&dir),
            None => {
                let mut settings = Self::default();
                settings.apply_env_overrides()?;
                Ok(settings)
            }
        }
    }

    /// Load settings from a specific config directory
    pub fn load_from(dir: &ConfigDir) -> Result<Self> {
        let mut settings: Self = dir.load_or_default(SETTINGS_FILE)?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    pub fn save_to(&self, dir: &ConfigDir) -> Result<()> {
        dir.save_json(SETTINGS_FILE, self)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_MAX_BODY_SIZE) {
            self.max_auto_fetch_body_size = value
                .trim()
                .parse()
                .with_context(|| format!("{ENV_MAX_BODY_SIZE} must be a byte count, got {value:?}"))?;
        }
        if let Some(value) = lookup(ENV_METERED_METADATA_ONLY) {
            self.metadata_only_on_metered_network = parse_bool(&value)
                .with_context(|| format!("{ENV_METERED_METADATA_ONLY} must be a boolean, got {value:?}"))?;
        }
        Ok(())
    }

    /// Build the options for one sync invocation
    pub fn sync_config(&self, network: NetworkTier, full_resync: bool) -> SyncConfig {
        SyncConfig {
            metadata_only_on_metered_network: self.metadata_only_on_metered_network,
            max_auto_fetch_body_size: self.max_auto_fetch_body_size,
            full_resync,
            network,
            sync_remote_deletions: self.sync_remote_deletions,
            expunge_on_poll: self.expunge_on_poll,
        }
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("not a boolean"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(config.metadata_only_on_metered_network);
        assert!(!config.full_resync);
        assert!(config.allows_content_fetch());
    }

    #[test]
    fn test_metered_network_blocks_content() {
        let settings = SyncSettings::default();
        assert!(!settings.sync_config(NetworkTier::Metered, false).allows_content_fetch());

        let settings = SyncSettings {
            metadata_only_on_metered_network: false,
            ..SyncSettings::default()
        };
        assert!(settings.sync_config(NetworkTier::Metered, false).allows_content_fetch());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ConfigDir::new(tmp.path());
        let mut settings: SyncSettings = dir.load_or_default(SETTINGS_FILE).unwrap();
        settings.apply_overrides(|_| None).unwrap();
        assert_eq!(settings, SyncSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ConfigDir::new(tmp.path());
        std::fs::write(dir.path(SETTINGS_FILE), r#"{"expunge_on_poll": true}"#).unwrap();

        let settings: SyncSettings = dir.load_json(SETTINGS_FILE).unwrap();
        assert!(settings.expunge_on_poll);
        assert_eq!(settings.retry, RetryPolicy::default());
    }

    #[test]
    fn test_save_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ConfigDir::new(tmp.path());
        let settings = SyncSettings {
            max_auto_fetch_body_size: 1024,
            ..SyncSettings::default()
        };
        settings.save_to(&dir).unwrap();
        let loaded: SyncSettings = dir.load_json(SETTINGS_FILE).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_MAX_BODY_SIZE, "4096"),
            (ENV_METERED_METADATA_ONLY, "off"),
        ]);
        let mut settings = SyncSettings::default();
        settings
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.max_auto_fetch_body_size, 4096);
        assert!(!settings.metadata_only_on_metered_network);
    }

    #[test]
    fn test_invalid_override_is_error() {
        let mut settings = SyncSettings::default();
        let result = settings.apply_overrides(|k| {
            (k == ENV_MAX_BODY_SIZE).then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }
}
