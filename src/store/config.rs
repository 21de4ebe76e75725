//! Store Configuration
//!
//! Limits and policies of one tiered store, resolved per role and storage id.
//!
//! Resolution order, per field (first hit wins):
//!
//! 1. `stores["<prefix>:<postfix>"]` in the settings file
//! 2. `roles.<role>` in the settings file
//! 3. built-in role defaults (history keeps 10 entries, ...)
//! 4. `defaults` in the settings file
//! 5. [`StoreConfig::default`]
//!
//! The result is validated and normalized: cache limits are clamped to the
//! store limits and unsupported policies are substituted, each with a warning.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::entry::StorageId;
use super::map::Capacity;
use crate::error::{Error, Result};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

// =============================================================================
// Policies
// =============================================================================

/// What happens to an entry rejected because the store is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Hand the entry to the dead message handler
    #[default]
    DeadMessage,
    /// Drop the oldest entry to make room (accepted, not supported)
    DiscardOldest,
}

/// What happens to an entry that could not be delivered or stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailurePolicy {
    /// Hand the entry to the dead message handler
    #[default]
    DeadMessage,
}

// =============================================================================
// Roles
// =============================================================================

/// Broker role a store plays, derived from its storage id prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreRole {
    /// Per-client callback queue
    Callback,
    /// Per-topic history queue
    History,
    /// Per-topic message body store
    MsgUnitStore,
    /// Session map
    Session,
    /// Subscription map
    Subscribe,
}

impl StoreRole {
    /// All roles
    pub const ALL: [StoreRole; 5] = [
        StoreRole::Callback,
        StoreRole::History,
        StoreRole::MsgUnitStore,
        StoreRole::Session,
        StoreRole::Subscribe,
    ];

    /// Storage id prefix of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreRole::Callback => "callback",
            StoreRole::History => "history",
            StoreRole::MsgUnitStore => "msgUnitStore",
            StoreRole::Session => "session",
            StoreRole::Subscribe => "subscribe",
        }
    }

    /// Role of a store, from its storage id prefix
    pub fn of(storage_id: &StorageId) -> Result<Self> {
        storage_id.prefix().parse()
    }
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        StoreRole::ALL
            .into_iter()
            .find(|role| role.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Configuration(format!("unknown store role '{}'", s)))
    }
}

// =============================================================================
// Store Config
// =============================================================================

/// Resolved limits and policies of one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Entry limit of the whole store
    pub max_entries: u64,
    /// Byte limit of the whole store
    pub max_bytes: u64,
    /// Entry limit of the transient tier
    pub max_entries_cache: u64,
    /// Byte limit of the transient tier
    pub max_bytes_cache: u64,
    /// Overflow handling
    pub on_overflow: OverflowPolicy,
    /// Failure handling
    pub on_failure: FailurePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: 10 * MIB,
            max_entries_cache: 1000,
            max_bytes_cache: 2 * MIB,
            on_overflow: OverflowPolicy::DeadMessage,
            on_failure: FailurePolicy::DeadMessage,
        }
    }
}

impl StoreConfig {
    /// Create a config with the given limits and default policies
    pub fn new(max_entries: u64, max_bytes: u64, max_entries_cache: u64, max_bytes_cache: u64) -> Self {
        Self {
            max_entries,
            max_bytes,
            max_entries_cache,
            max_bytes_cache,
            ..Default::default()
        }
    }

    /// Reject limits no store can work with
    pub fn validate(&self) -> Result<()> {
        let zero = [
            ("max_entries", self.max_entries),
            ("max_bytes", self.max_bytes),
            ("max_entries_cache", self.max_entries_cache),
            ("max_bytes_cache", self.max_bytes_cache),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        match zero {
            Some((name, _)) => Err(Error::Configuration(format!("{} must be greater than zero", name))),
            None => Ok(()),
        }
    }

    /// Clamp cache limits to the store limits and substitute unsupported policies
    pub fn normalized(mut self, storage_id: &StorageId) -> Self {
        if self.max_entries_cache > self.max_entries {
            warn!(
                storage = %storage_id,
                max_entries_cache = self.max_entries_cache,
                max_entries = self.max_entries,
                "cache entry limit exceeds store limit, clamping"
            );
            self.max_entries_cache = self.max_entries;
        }
        if self.max_bytes_cache > self.max_bytes {
            warn!(
                storage = %storage_id,
                max_bytes_cache = self.max_bytes_cache,
                max_bytes = self.max_bytes,
                "cache byte limit exceeds store limit, clamping"
            );
            self.max_bytes_cache = self.max_bytes;
        }
        if self.on_overflow == OverflowPolicy::DiscardOldest {
            warn!(
                storage = %storage_id,
                "onOverflow=discardOldest is not supported, using deadMessage"
            );
            self.on_overflow = OverflowPolicy::DeadMessage;
        }
        self
    }

    /// Limits of the transient tier
    pub fn cache_capacity(&self) -> Capacity {
        Capacity::new(self.max_entries_cache, self.max_bytes_cache)
    }

    /// Limits of the whole store (and of the persistent tier)
    pub fn store_capacity(&self) -> Capacity {
        Capacity::new(self.max_entries, self.max_bytes)
    }
}

/// Partial config: every field that is set overrides a lower layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries_cache: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_bytes_cache: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_overflow: Option<OverflowPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailurePolicy>,
}

impl StoreOverrides {
    /// Override the fields of `config` that are set here
    pub fn apply_to(&self, config: &mut StoreConfig) {
        if let Some(value) = self.max_entries {
            config.max_entries = value;
        }
        if let Some(value) = self.max_bytes {
            config.max_bytes = value;
        }
        if let Some(value) = self.max_entries_cache {
            config.max_entries_cache = value;
        }
        if let Some(value) = self.max_bytes_cache {
            config.max_bytes_cache = value;
        }
        if let Some(value) = self.on_overflow {
            config.on_overflow = value;
        }
        if let Some(value) = self.on_failure {
            config.on_failure = value;
        }
    }
}

/// Built-in per-role limits
static ROLE_DEFAULTS: Lazy<HashMap<StoreRole, StoreOverrides>> = Lazy::new(|| {
    let mut defaults = HashMap::new();
    defaults.insert(
        StoreRole::History,
        StoreOverrides {
            max_entries: Some(10),
            max_entries_cache: Some(10),
            ..Default::default()
        },
    );
    defaults.insert(
        StoreRole::MsgUnitStore,
        StoreOverrides {
            max_entries: Some(10_000_000),
            max_bytes: Some(2 * GIB),
            max_entries_cache: Some(10_000),
            max_bytes_cache: Some(10 * MIB),
            ..Default::default()
        },
    );
    for role in [StoreRole::Session, StoreRole::Subscribe] {
        defaults.insert(
            role,
            StoreOverrides {
                max_entries: Some(10_000),
                max_entries_cache: Some(10_000),
                ..Default::default()
            },
        );
    }
    defaults
});

// =============================================================================
// Settings
// =============================================================================

/// Store settings file
///
/// ```yaml
/// defaults:
///   max_bytes: 20971520
/// roles:
///   history:
///     max_entries: 100
/// stores:
///   "callback:client7":
///     max_entries_cache: 50
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreSettings {
    /// Overrides applied to every store
    pub defaults: StoreOverrides,
    /// Overrides per role
    pub roles: HashMap<StoreRole, StoreOverrides>,
    /// Overrides per storage id
    pub stores: HashMap<String, StoreOverrides>,
}

impl StoreSettings {
    /// Parse YAML settings
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse JSON settings
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| Error::Configuration(format!("invalid JSON settings: {}", err)))
    }

    /// Load a settings file; `.json` is parsed as JSON, anything else as YAML
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let settings = match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::from_json_str(&text)?,
            _ => Self::from_yaml_str(&text)?,
        };
        debug!(
            path = %path.display(),
            roles = settings.roles.len(),
            stores = settings.stores.len(),
            "loaded store settings"
        );
        Ok(settings)
    }

    /// Resolve the config of a store playing `role` under `storage_id`
    pub fn resolve(&self, role: StoreRole, storage_id: &StorageId) -> Result<StoreConfig> {
        let mut config = StoreConfig::default();
        self.defaults.apply_to(&mut config);
        if let Some(builtin) = ROLE_DEFAULTS.get(&role) {
            builtin.apply_to(&mut config);
        }
        if let Some(overrides) = self.roles.get(&role) {
            overrides.apply_to(&mut config);
        }
        if let Some(overrides) = self.stores.get(&storage_id.to_string()) {
            overrides.apply_to(&mut config);
        }

        config.validate()?;
        Ok(config.normalized(storage_id))
    }

    /// Resolve using the role implied by the storage id prefix
    pub fn resolve_for(&self, storage_id: &StorageId) -> Result<StoreConfig> {
        self.resolve(StoreRole::of(storage_id)?, storage_id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn id(s: &str) -> StorageId {
        s.parse().unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.max_entries, 1000);
        assert_eq!(config.max_bytes, 10 * MIB);
        assert_eq!(config.max_bytes_cache, 2 * MIB);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_role_from_prefix() {
        assert_eq!(StoreRole::of(&id("history:news")).unwrap(), StoreRole::History);
        assert_eq!(StoreRole::of(&id("msgUnitStore:news")).unwrap(), StoreRole::MsgUnitStore);
        assert_eq!("CALLBACK".parse::<StoreRole>().unwrap(), StoreRole::Callback);
        assert_matches!(StoreRole::of(&id("bogus:x")), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_builtin_role_defaults() {
        let settings = StoreSettings::default();

        let history = settings.resolve_for(&id("history:news")).unwrap();
        assert_eq!(history.max_entries, 10);
        assert_eq!(history.max_entries_cache, 10);
        assert_eq!(history.max_bytes, 10 * MIB);

        let msg_units = settings.resolve_for(&id("msgUnitStore:news")).unwrap();
        assert_eq!(msg_units.max_entries, 10_000_000);
        assert_eq!(msg_units.max_bytes, 2 * GIB);
        assert_eq!(msg_units.max_bytes_cache, 10 * MIB);

        let callback = settings.resolve_for(&id("callback:client7")).unwrap();
        assert_eq!(callback, StoreConfig::default());
    }

    #[test]
    fn test_resolution_order() {
        let yaml = r#"
defaults:
  max_bytes: 5000
  max_bytes_cache: 1000
roles:
  history:
    max_entries: 100
stores:
  "history:news":
    max_entries_cache: 7
"#;
        let settings = StoreSettings::from_yaml_str(yaml).unwrap();

        let news = settings.resolve(StoreRole::History, &id("history:news")).unwrap();
        assert_eq!(news.max_entries, 100);
        assert_eq!(news.max_entries_cache, 7);
        assert_eq!(news.max_bytes, 5000);
        assert_eq!(news.max_bytes_cache, 1000);

        let sport = settings.resolve(StoreRole::History, &id("history:sport")).unwrap();
        assert_eq!(sport.max_entries_cache, 10);
    }

    #[test]
    fn test_cache_limits_clamped() {
        let json = r#"{"stores": {"callback:c1": {"max_entries": 5, "max_entries_cache": 50, "max_bytes": 100}}}"#;
        let settings = StoreSettings::from_json_str(json).unwrap();
        let config = settings.resolve_for(&id("callback:c1")).unwrap();
        assert_eq!(config.max_entries_cache, 5);
        assert_eq!(config.max_bytes_cache, 100);
    }

    #[test]
    fn test_discard_oldest_substituted() {
        let yaml = "defaults:\n  on_overflow: discardOldest\n";
        let settings = StoreSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.defaults.on_overflow, Some(OverflowPolicy::DiscardOldest));

        let config = settings.resolve_for(&id("session:s1")).unwrap();
        assert_eq!(config.on_overflow, OverflowPolicy::DeadMessage);
    }

    #[test]
    fn test_failure_policy_is_dead_message_only() {
        let settings = StoreSettings::from_yaml_str("defaults:\n  on_failure: deadMessage\n").unwrap();
        assert_eq!(settings.defaults.on_failure, Some(FailurePolicy::DeadMessage));
        assert_matches!(
            StoreSettings::from_yaml_str("defaults:\n  on_failure: reject\n"),
            Err(Error::Serialization(_))
        );
    }

    #[test]
    fn test_zero_limits_rejected() {
        let settings = StoreSettings::from_yaml_str("defaults:\n  max_entries: 0\n").unwrap();
        assert_matches!(settings.resolve_for(&id("callback:c1")), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_malformed_settings() {
        assert_matches!(
            StoreSettings::from_yaml_str("defaults:\n  max_entriez: 3\n"),
            Err(Error::Serialization(_))
        );
        assert_matches!(StoreSettings::from_json_str("{"), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_load_by_extension() {
        let dir = std::env::temp_dir().join(format!("brokerstore-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let json_path = dir.join("settings.json");
        std::fs::write(&json_path, r#"{"roles": {"session": {"max_entries": 3}}}"#).unwrap();
        let settings = StoreSettings::load(&json_path).unwrap();
        assert_eq!(settings.resolve_for(&id("session:s")).unwrap().max_entries, 3);

        let yaml_path = dir.join("settings.yaml");
        std::fs::write(&yaml_path, "roles:\n  session:\n    max_entries: 4\n").unwrap();
        let settings = StoreSettings::load(&yaml_path).unwrap();
        assert_eq!(settings.resolve_for(&id("session:s")).unwrap().max_entries, 4);

        assert_matches!(StoreSettings::load(dir.join("missing.yaml")), Err(Error::Io(_)));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_capacities() {
        let config = StoreConfig::new(2, 200, 1, 100);
        assert_eq!(config.store_capacity(), Capacity::new(2, 200));
        assert_eq!(config.cache_capacity(), Capacity::new(1, 100));
    }
}
