//! Application credential manifest parsing.
//!
//! The manifest is a YAML list carried in the `applicationCredentials`
//! attribute of the SecretProviderClass:
//!
//! ```yaml
//! - fileName: clouds.yaml
//! - fileName: env.sh
//!   template: |
//!     export OS_APPLICATION_CREDENTIAL_ID={{ .AuthInfo.ApplicationCredentialID }}
//! ```

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Attribute key holding the manifest.
pub const MANIFEST_ATTRIBUTE: &str = "applicationCredentials";

/// Entry keys, matched case-insensitively when no exact key is present.
const ENTRY_KEYS: &[&str] = &["fileName", "template"];

/// Errors raised while reading the manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("applicationCredentials should be provided via SecretProviderClass.spec.parameters.applicationCredentials")]
    Missing,

    #[error("failed to unmarshal applicationCredentials, error: {0}")]
    Decode(#[source] serde_yaml::Error),

    #[error("applicationCredentials entry {index} has an empty fileName")]
    EmptyFileName { index: usize },
}

/// One file to produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    /// Output path relative to the mount target.
    pub file_name: String,
    /// Template source; the default template applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Read the ordered manifest out of the request attributes.
///
/// A missing or empty attribute is an error; an explicit `[]` yields no
/// entries.
pub fn parse_manifest(
    attributes: &HashMap<String, String>,
) -> Result<Vec<ManifestEntry>, ManifestError> {
    let source = attributes
        .get(MANIFEST_ATTRIBUTE)
        .filter(|value| !value.is_empty())
        .ok_or(ManifestError::Missing)?;

    let mut document: Value = serde_yaml::from_str(source).map_err(ManifestError::Decode)?;
    if let Some(items) = document.as_sequence_mut() {
        items
            .iter_mut()
            .filter_map(Value::as_mapping_mut)
            .for_each(canonicalize_keys);
    }
    let entries: Vec<ManifestEntry> =
        serde_yaml::from_value(document).map_err(ManifestError::Decode)?;

    if let Some(index) = entries.iter().position(|e| e.file_name.is_empty()) {
        return Err(ManifestError::EmptyFileName { index });
    }

    debug!(entries = entries.len(), "Parsed application credential manifest");
    Ok(entries)
}

/// Rename keys such as `filename` or `FileName` to their canonical spelling.
fn canonicalize_keys(entry: &mut Mapping) {
    for key in ENTRY_KEYS {
        if entry.contains_key(*key) {
            continue;
        }
        let alias = entry
            .keys()
            .find(|k| k.as_str().is_some_and(|k| k.eq_ignore_ascii_case(key)))
            .cloned();
        if let Some(value) = alias.and_then(|alias| entry.remove(&alias)) {
            entry.insert(Value::String(key.to_string()), value);
        }
    }
}
