//! Mount request decoding and validation.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while validating a mount request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request should have a target mount path")]
    MissingTargetPath,

    #[error("failed to unmarshal attributes, error: {0}")]
    Attributes(#[source] serde_json::Error),

    #[error("attributes should be provided via SecretProviderClass.spec.parameters")]
    MissingAttributes,

    #[error("failed to unmarshal nodePublishSecretRef secrets, error: {0}")]
    Secrets(#[source] serde_json::Error),

    #[error("secrets should be provided via volume.csi.nodePublishSecretRef.name")]
    MissingSecrets,

    #[error("failed to unmarshal file permission, error: {0}")]
    Permission(#[source] serde_json::Error),
}

/// Object version reported by the driver or returned to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectVersion {
    pub id: String,
    pub version: String,
}

/// A mount request as received from the driver, before validation.
#[derive(Debug, Clone, Default)]
pub struct MountRequest {
    pub target_path: String,
    /// JSON object of SecretProviderClass parameters.
    pub attributes: String,
    /// JSON object of nodePublishSecretRef data.
    pub secrets: String,
    /// JSON number holding the file mode.
    pub permission: String,
    /// Versions already present in the mount; not consulted.
    pub current_object_version: Vec<ObjectVersion>,
}

/// Authentication secrets from the node publish secret.
///
/// Values are never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secrets(BTreeMap<String, String>);

impl Secrets {
    /// Look up a key, treating empty values as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Secrets {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "<redacted>")))
            .finish()
    }
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub target_path: PathBuf,
    pub attributes: HashMap<String, String>,
    pub secrets: Secrets,
    pub permission: u32,
}

impl MountRequest {
    /// Check structural preconditions and decode the JSON-encoded fields.
    pub fn validate(&self) -> Result<ValidatedRequest, RequestError> {
        if self.target_path.is_empty() {
            return Err(RequestError::MissingTargetPath);
        }

        let attributes: Option<HashMap<String, String>> =
            serde_json::from_str(&self.attributes).map_err(RequestError::Attributes)?;
        let attributes = attributes.ok_or(RequestError::MissingAttributes)?;

        let secrets: Option<Secrets> =
            serde_json::from_str(&self.secrets).map_err(RequestError::Secrets)?;
        let secrets = secrets
            .filter(|secrets| !secrets.is_empty())
            .ok_or(RequestError::MissingSecrets)?;

        let permission: u32 =
            serde_json::from_str(&self.permission).map_err(RequestError::Permission)?;

        Ok(ValidatedRequest {
            target_path: PathBuf::from(&self.target_path),
            attributes,
            secrets,
            permission,
        })
    }
}
