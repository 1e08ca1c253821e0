//! Configuration types for the OpenStack secrets-store provider.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::template::DEFAULT_TEMPLATE;

/// Name of the socket created under the volume path.
pub const SOCKET_NAME: &str = "openstack.sock";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderConfig {
    /// Directory the driver scans for provider sockets.
    #[serde(default = "default_volume_path")]
    pub volume_path: PathBuf,

    /// Mount pipeline settings.
    #[serde(default)]
    pub mount: MountSettings,

    /// Identity service client settings.
    #[serde(default)]
    pub identity: IdentityConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            volume_path: default_volume_path(),
            mount: MountSettings::default(),
            identity: IdentityConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mount.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "mount.concurrency must be at least 1".to_string(),
            ));
        }
        if self.mount.suffix_length == 0 {
            return Err(ConfigError::Invalid(
                "mount.suffix-length must be at least 1".to_string(),
            ));
        }
        if self.mount.credential_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "mount.credential-ttl-secs must be at least 1".to_string(),
            ));
        }
        if self.mount.issue_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "mount.issue-timeout-ms must be at least 1".to_string(),
            ));
        }
        if self.identity.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "identity.timeout-ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the provider socket.
    pub fn socket_path(&self) -> PathBuf {
        self.volume_path.join(SOCKET_NAME)
    }
}

// Might be worth moving to /var/run/secrets-store-csi-providers once the
// driver stops scanning the legacy location.
fn default_volume_path() -> PathBuf {
    PathBuf::from("/etc/kubernetes/secrets-store-csi-providers")
}

/// Settings injected into the mount orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MountSettings {
    /// Lifetime of every issued application credential, in seconds.
    #[serde(default = "default_credential_ttl_secs")]
    pub credential_ttl_secs: u64,

    /// Prefix of generated application credential names.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Description attached to every application credential.
    #[serde(default = "default_description")]
    pub description: String,

    /// Number of random characters in the generated name suffix.
    #[serde(default = "default_suffix_length")]
    pub suffix_length: usize,

    /// Manifest entries issued and rendered at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Template used by entries that don't supply one.
    #[serde(default = "default_template")]
    pub default_template: String,

    /// Upper bound on one credential issuance, in milliseconds.
    #[serde(default = "default_issue_timeout_ms")]
    pub issue_timeout_ms: u64,
}

impl Default for MountSettings {
    fn default() -> Self {
        Self {
            credential_ttl_secs: default_credential_ttl_secs(),
            name_prefix: default_name_prefix(),
            description: default_description(),
            suffix_length: default_suffix_length(),
            concurrency: default_concurrency(),
            default_template: default_template(),
            issue_timeout_ms: default_issue_timeout_ms(),
        }
    }
}

impl MountSettings {
    /// Lifetime applied to every credential.
    pub fn credential_ttl(&self) -> Duration {
        Duration::from_secs(self.credential_ttl_secs)
    }

    pub fn issue_timeout(&self) -> Duration {
        Duration::from_millis(self.issue_timeout_ms)
    }
}

fn default_credential_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_name_prefix() -> String {
    "secrets-store-csi-".to_string()
}

fn default_description() -> String {
    "Created with love by secrets-store-csi-driver-provider-openstack".to_string()
}

fn default_suffix_length() -> usize {
    5
}

fn default_concurrency() -> usize {
    1
}

fn default_template() -> String {
    DEFAULT_TEMPLATE.to_string()
}

fn default_issue_timeout_ms() -> u64 {
    60_000 // 1 minute
}

/// Identity service client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdentityConfig {
    /// Timeout for each identity service call in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Endpoint interface used when OS_INTERFACE is not set.
    #[serde(default = "default_interface")]
    pub default_interface: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            default_interface: default_interface(),
        }
    }
}

impl IdentityConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_interface() -> String {
    "public".to_string()
}
