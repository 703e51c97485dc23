//! Application configuration management.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then `BOND_*` environment variables (`BOND_IDENTITY__USERNAME=alice`,
//! `BOND_TIMING__LIVENESS_WINDOW_SECS=5`, ...). The merged result is
//! validated as a whole so every problem is reported at once.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::beacon::{PayloadCodec, BOND_SERVICE_UUID, DEFAULT_NAME_PREFIX, MAX_PAYLOAD_BYTES};
use crate::types::Identity;

/// Legacy advertising PDUs carry at most 31 bytes of data.
const MAX_ADVERTISEMENT_BYTES: usize = 31;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "BOND";

/// Errors raised while loading, saving or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// The configuration file could not be written.
    #[error("Failed to write configuration to {path}: {source}")]
    WriteError {
        /// Destination path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The layered sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] config::ConfigError),

    /// The configuration could not be serialized to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A single field holds an invalid value.
    #[error("{field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// Several fields hold invalid values.
    #[error("{} configuration errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),
}

/// Result alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BondConfig {
    /// Who this device belongs to.
    pub identity: IdentityConfig,
    /// Radio beacon settings.
    pub beacon: BeaconConfig,
    /// Liveness, sweep and accumulation cadence.
    pub timing: TimingConfig,
    /// Remote similarity endpoint.
    pub similarity: SimilarityConfig,
    /// Document store location.
    pub store: StoreConfig,
    /// Device HTTP surface.
    pub server: ServerConfig,
}

/// Account attributes of the device owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// The owner's identity. Required to start a session.
    pub username: Option<String>,
    /// Contact address stored on the identity record.
    pub email: String,
}

/// Beacon payload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Service UUID shared by every device.
    pub service_uuid: Uuid,
    /// Three character prefix of the advertised name.
    pub name_prefix: String,
    /// Byte budget of the advertised name, prefix included.
    pub max_payload_bytes: usize,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            service_uuid: BOND_SERVICE_UUID,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            max_payload_bytes: MAX_PAYLOAD_BYTES,
        }
    }
}

impl BeaconConfig {
    /// Codec for advertised names under these settings.
    #[must_use]
    pub fn codec(&self) -> PayloadCodec {
        PayloadCodec::new(self.name_prefix.clone(), self.max_payload_bytes)
    }
}

/// Timing parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// A peer not heard for this long leaves the nearby list.
    pub liveness_window_secs: u64,
    /// Cadence of the expiry sweep.
    pub sweep_interval_ms: u64,
    /// Minimum spacing between accumulated minutes per peer.
    pub accumulate_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: 5,
            sweep_interval_ms: 1000,
            accumulate_interval_secs: 60,
        }
    }
}

impl TimingConfig {
    /// Liveness window as a duration.
    #[must_use]
    pub const fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    /// Sweep cadence as a duration.
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Accumulation interval as a duration.
    #[must_use]
    pub const fn accumulate_interval(&self) -> Duration {
        Duration::from_secs(self.accumulate_interval_secs)
    }
}

/// Similarity endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    /// Endpoint URL. When absent every pair gets the fallback score.
    pub endpoint: Option<Url>,
    /// Request timeout.
    pub timeout_secs: u64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 10,
        }
    }
}

/// Document store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for the persisted snapshot. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
    /// Persist the store to disk after each mutation.
    pub persist: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            persist: true,
        }
    }
}

impl StoreConfig {
    /// Resolved data directory.
    #[must_use]
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address.
    pub bind_address: String,
    /// Production logging (JSON files plus compact stdout).
    pub production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            production: false,
        }
    }
}

/// Platform data directory for bond.
#[must_use]
pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "bond")
        .map_or_else(|| PathBuf::from("./data"), |dirs| dirs.data_dir().to_path_buf())
}

/// Platform configuration file path for bond.
#[must_use]
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "bond").map_or_else(
        || PathBuf::from("./bond.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

impl BondConfig {
    /// Load configuration from defaults, `path` (if it exists) and the
    /// environment, then validate it.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a source cannot be parsed or the merged
    /// configuration is invalid.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file that must exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if `path` does not exist, otherwise
    /// behaves like [`Self::load`].
    pub fn load_required(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load(Some(path))
    }

    /// Save configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        let write_error = |source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_error)?;
        }
        std::fs::write(path, content).map_err(write_error)
    }

    /// The owner's parsed identity.
    ///
    /// # Errors
    ///
    /// Returns a validation error if no username is configured or it is not a
    /// valid identity.
    pub fn owner(&self) -> ConfigResult<Identity> {
        let raw = self
            .identity
            .username
            .as_deref()
            .ok_or(ConfigError::ValidationError {
                field: "identity.username",
                message: "a username is required to start a session".to_string(),
            })?;
        self.parse_username(raw)
            .map_err(|message| ConfigError::ValidationError {
                field: "identity.username",
                message,
            })
    }

    /// Usernames must survive the beacon payload untruncated, otherwise peers
    /// would decode a different identity.
    fn parse_username(&self, raw: &str) -> Result<Identity, String> {
        let identity = Identity::parse(raw).map_err(|e| e.to_string())?;
        let budget = self.beacon.codec().identity_budget();
        if identity.as_str().len() > budget {
            return Err(format!(
                "'{identity}' is longer than the {budget} bytes a beacon can advertise"
            ));
        }
        Ok(identity)
    }

    /// Check every field, collecting all violations.
    ///
    /// # Errors
    ///
    /// Returns the single violation, or
    /// [`ConfigError::MultipleValidationErrors`] when there are several.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut fail = |field: &'static str, message: String| {
            errors.push(ConfigError::ValidationError { field, message });
        };

        if let Some(raw) = &self.identity.username {
            if let Err(message) = self.parse_username(raw) {
                fail("identity.username", message);
            }
        }

        let prefix = &self.beacon.name_prefix;
        if prefix.len() != 3 || !prefix.is_ascii() {
            fail(
                "beacon.name_prefix",
                format!("must be exactly 3 ASCII characters (got '{prefix}')"),
            );
        }
        if self.beacon.max_payload_bytes <= prefix.len()
            || self.beacon.max_payload_bytes > MAX_ADVERTISEMENT_BYTES
        {
            fail(
                "beacon.max_payload_bytes",
                format!(
                    "must leave room for an identity and fit \
                     {MAX_ADVERTISEMENT_BYTES} bytes (got {})",
                    self.beacon.max_payload_bytes
                ),
            );
        }
        if self.beacon.service_uuid.is_nil() {
            fail("beacon.service_uuid", "must not be the nil UUID".to_string());
        }

        if !(1..=3600).contains(&self.timing.liveness_window_secs) {
            fail(
                "timing.liveness_window_secs",
                format!("must be 1-3600 (got {})", self.timing.liveness_window_secs),
            );
        }
        if !(10..=60_000).contains(&self.timing.sweep_interval_ms) {
            fail(
                "timing.sweep_interval_ms",
                format!("must be 10-60000 (got {})", self.timing.sweep_interval_ms),
            );
        }
        if !(1..=86_400).contains(&self.timing.accumulate_interval_secs) {
            fail(
                "timing.accumulate_interval_secs",
                format!(
                    "must be 1-86400 (got {})",
                    self.timing.accumulate_interval_secs
                ),
            );
        }

        if self.similarity.timeout_secs == 0 {
            fail("similarity.timeout_secs", "must be positive".to_string());
        }
        if let Some(endpoint) = &self.similarity.endpoint {
            if !matches!(endpoint.scheme(), "http" | "https") {
                fail(
                    "similarity.endpoint",
                    format!("must be an http(s) URL (got '{endpoint}')"),
                );
            }
        }

        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            fail(
                "server.bind_address",
                format!("'{}' is not a socket address", self.server.bind_address),
            );
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BondConfig::default();
        config.validate().unwrap();
        assert_eq!(config.timing.liveness_window(), Duration::from_secs(5));
        assert_eq!(config.timing.accumulate_interval(), Duration::from_secs(60));
        assert_eq!(config.beacon.name_prefix, "BND");
    }

    #[test]
    fn test_owner_requires_username() {
        let mut config = BondConfig::default();
        assert!(matches!(
            config.owner(),
            Err(ConfigError::ValidationError { field: "identity.username", .. })
        ));
        config.identity.username = Some("Alice".into());
        assert_eq!(config.owner().unwrap().as_str(), "alice");
    }

    #[test]
    fn test_username_must_fit_beacon_payload() {
        let mut config = BondConfig::default();
        // 17 bytes fit the default 20-byte name after the "BND" prefix.
        config.identity.username = Some("alexandra.montgom".into());
        config.validate().unwrap();
        let owner = config.owner().unwrap();
        let codec = config.beacon.codec();
        assert_eq!(codec.decode(&codec.encode(&owner)), Some(owner.as_str()));

        config.identity.username = Some("alexandra.montgomery".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { field: "identity.username", .. })
        ));
        assert!(config.owner().is_err());
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = BondConfig::default();
        config.beacon.name_prefix = "TOOLONG".into();
        config.timing.liveness_window_secs = 0;
        config.server.bind_address = "nowhere".into();
        match config.validate() {
            Err(ConfigError::MultipleValidationErrors(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected multiple errors, got {other:?}"),
        }
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bond.toml");

        let mut config = BondConfig::default();
        config.identity.username = Some("bob".into());
        config.timing.accumulate_interval_secs = 30;
        config.save(&path).unwrap();

        let loaded = BondConfig::load_required(&path).unwrap();
        assert_eq!(loaded.identity.username.as_deref(), Some("bob"));
        assert_eq!(loaded.timing.accumulate_interval_secs, 30);
        assert_eq!(loaded.beacon.service_uuid, BOND_SERVICE_UUID);
    }

    #[test]
    fn test_missing_required_file() {
        let err = BondConfig::load_required(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
