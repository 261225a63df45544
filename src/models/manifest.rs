//! Declarative catalog of downloadable model weights.
//!
//! The manifest is read once per process and validated here, so the rest of
//! the crate only ever sees fully-populated [`ModelManifestEntry`] records.
//! Absent fields get these defaults:
//!
//! | field         | default                                  |
//! |---------------|------------------------------------------|
//! | `name`        | the model key                            |
//! | `filename`    | last path segment of `url`               |
//! | `version`     | `"0"`                                    |
//! | `checksum`    | none, the download is not verified       |
//! | `required`    | `false`                                  |
//! | `size`        | none                                     |
//! | `description` | empty                                    |

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::download::normalize_digest;
use crate::error::ManifestError;
use crate::utils::filename_from_url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelManifestEntry {
    pub key: String,
    pub name: String,
    pub url: String,
    pub filename: String,
    pub version: String,
    /// Bare lower-case SHA-256 hex.
    pub checksum: Option<String>,
    pub required: bool,
    pub size: Option<u64>,
    pub description: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    models: serde_json::Map<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEntry {
    name: Option<String>,
    url: Option<String>,
    filename: Option<String>,
    version: Option<Value>,
    checksum: Option<String>,
    required: Option<bool>,
    size: Option<u64>,
    #[serde(alias = "desc")]
    description: Option<String>,
}

/// Validated manifest; iteration follows the document's key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ModelManifestEntry>,
}

impl Manifest {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest = Self::from_json_str(&content)?;
        tracing::debug!(path = %path.display(), models = manifest.len(), "loaded model manifest");
        Ok(manifest)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_json::from_str(content)?;
        let mut entries = Vec::with_capacity(raw.models.len());
        for (key, value) in raw.models {
            entries.push(validate_entry(key, value)?);
        }
        Ok(Self { entries })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelManifestEntry> {
        self.entries.iter()
    }

    pub fn get(&self, key: &str) -> Option<&ModelManifestEntry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn required(&self) -> impl Iterator<Item = &ModelManifestEntry> {
        self.entries.iter().filter(|entry| entry.required)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_entry(key: String, value: Value) -> Result<ModelManifestEntry, ManifestError> {
    let invalid = |reason: String| ManifestError::Invalid {
        key: key.clone(),
        reason,
    };

    if key.trim().is_empty() {
        return Err(invalid("model key is empty".into()));
    }

    let raw: RawEntry =
        serde_json::from_value(value).map_err(|err| invalid(format!("malformed entry: {err}")))?;

    let url = raw
        .url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .ok_or_else(|| invalid("missing url".into()))?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(invalid(format!("url must be http(s): {url}")));
    }

    let filename = match raw.filename.map(|name| name.trim().to_string()) {
        Some(name) if !name.is_empty() => name,
        _ => filename_from_url(&url)
            .ok_or_else(|| invalid("no filename and none derivable from url".into()))?,
    };
    if filename.contains(['/', '\\']) || filename == "." || filename == ".." {
        return Err(invalid(format!("unsafe filename: {filename}")));
    }

    let version = match raw.version {
        None | Some(Value::Null) => "0".to_string(),
        Some(Value::String(version)) if version.trim().is_empty() => "0".to_string(),
        Some(Value::String(version)) => version.trim().to_string(),
        Some(Value::Number(number)) => number.to_string(),
        Some(other) => return Err(invalid(format!("version must be a string, got {other}"))),
    };

    let checksum = match raw.checksum.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw_checksum) => Some(
            normalize_digest(raw_checksum)
                .ok_or_else(|| invalid(format!("unsupported checksum: {raw_checksum}")))?,
        ),
    };

    Ok(ModelManifestEntry {
        name: raw
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| key.clone()),
        url,
        filename,
        version,
        checksum,
        required: raw.required.unwrap_or(false),
        size: raw.size,
        description: raw.description.unwrap_or_default(),
        key,
    })
}
