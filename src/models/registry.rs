//! Durable record of verified model downloads.
//!
//! Stored as `<models_dir>/registry.json`. The file is small and written once
//! per completed download, so every write is a full-document rewrite. Only the
//! download queue's drain task writes it; concurrent downloads would need a
//! lock around the read-modify-write cycle.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::utils::files::{ensure_directory, safe_write};

pub const REGISTRY_SCHEMA: &str = "playe.models.registry.v1";
pub const REGISTRY_FILE: &str = "registry.json";
pub const MODELS_DIR_ENV: &str = "PLAYE_MODELS_DIR";
pub const DEFAULT_MODELS_DIR: &str = "models-data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub key: String,
    pub name: String,
    pub filename: String,
    pub version: String,
    pub digest: String,
    pub byte_size: u64,
    pub downloaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    pub schema: String,
    #[serde(default)]
    pub models: BTreeMap<String, RegistryEntry>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            schema: REGISTRY_SCHEMA.to_string(),
            models: BTreeMap::new(),
        }
    }
}

impl Registry {
    pub fn get(&self, key: &str) -> Option<&RegistryEntry> {
        self.models.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.models.contains_key(key)
    }

    /// Insert or replace the entry for `entry.key`.
    pub fn upsert(&mut self, entry: RegistryEntry) -> Option<RegistryEntry> {
        self.models.insert(entry.key.clone(), entry)
    }

    pub fn remove(&mut self, key: &str) -> Option<RegistryEntry> {
        self.models.remove(key)
    }
}

pub fn registry_path(models_dir: &Path) -> PathBuf {
    models_dir.join(REGISTRY_FILE)
}

/// Read the registry. Missing, unreadable, malformed or foreign-schema files
/// yield an empty registry; the next write reinitializes the document.
pub fn read(models_dir: &Path) -> Registry {
    let path = registry_path(models_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Registry::default(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "unreadable model registry, starting empty");
            return Registry::default();
        }
    };

    match serde_json::from_str::<Registry>(&content) {
        Ok(registry) if registry.schema == REGISTRY_SCHEMA => registry,
        Ok(registry) => {
            tracing::warn!(
                path = %path.display(),
                schema = %registry.schema,
                "unknown model registry schema, starting empty"
            );
            Registry::default()
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "malformed model registry, starting empty");
            Registry::default()
        }
    }
}

pub fn write(models_dir: &Path, registry: &Registry) -> Result<(), RegistryError> {
    let path = registry_path(models_dir);
    let content = serde_json::to_vec_pretty(registry)?;
    safe_write(&path, &content).map_err(|source| RegistryError::Io {
        path: path.clone(),
        source,
    })?;
    tracing::debug!(path = %path.display(), models = registry.models.len(), "model registry written");
    Ok(())
}

/// Models directory: `override_dir`, else `$PLAYE_MODELS_DIR`, else
/// `<current dir>/models-data`. The directory is created if missing.
pub fn resolve_models_dir(override_dir: Option<&Path>) -> Result<PathBuf, RegistryError> {
    let dir = match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => match std::env::var_os(MODELS_DIR_ENV).filter(|value| !value.is_empty()) {
            Some(value) => PathBuf::from(value),
            None => std::env::current_dir()
                .map_err(RegistryError::NoProjectDir)?
                .join(DEFAULT_MODELS_DIR),
        },
    };
    ensure_directory(&dir).map_err(|source| RegistryError::Io {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(key: &str, version: &str) -> RegistryEntry {
        RegistryEntry {
            key: key.to_string(),
            name: key.to_uppercase(),
            filename: format!("{key}.pth"),
            version: version.to_string(),
            digest: "ab".repeat(32),
            byte_size: 42,
            downloaded_at: Utc::now(),
        }
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let registry = read(dir.path());
        assert_eq!(registry, Registry::default());
        assert_eq!(registry.schema, REGISTRY_SCHEMA);
    }

    #[test]
    fn malformed_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(registry_path(dir.path()), "{ not json").unwrap();
        assert!(read(dir.path()).models.is_empty());
    }

    #[test]
    fn foreign_schema_reads_as_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(
            registry_path(dir.path()),
            r#"{"schema": "someone.else.v9", "models": {}}"#,
        )
        .unwrap();
        assert_eq!(read(dir.path()), Registry::default());
    }

    #[test]
    fn write_then_read_keeps_entries() {
        let dir = tempdir().unwrap();
        let mut registry = read(dir.path());
        registry.upsert(entry("nafnet", "1.0"));
        registry.upsert(entry("sam2", "2.1"));
        write(dir.path(), &registry).unwrap();

        let reloaded = read(dir.path());
        assert_eq!(reloaded, registry);

        let raw = std::fs::read_to_string(registry_path(dir.path())).unwrap();
        assert!(raw.contains("\"schema\": \"playe.models.registry.v1\""));
        assert!(raw.contains("\"byteSize\""));
        assert!(raw.contains("\"downloadedAt\""));
    }

    #[test]
    fn upsert_overwrites_existing_key() {
        let mut registry = Registry::default();
        assert!(registry.upsert(entry("nafnet", "1.0")).is_none());
        let previous = registry.upsert(entry("nafnet", "1.1")).unwrap();
        assert_eq!(previous.version, "1.0");
        assert_eq!(registry.get("nafnet").unwrap().version, "1.1");
        assert_eq!(registry.models.len(), 1);
        assert!(registry.remove("nafnet").is_some());
        assert!(!registry.contains("nafnet"));
    }

    #[test]
    fn explicit_override_is_created() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("weights").join("store");
        let resolved = resolve_models_dir(Some(&target)).unwrap();
        assert_eq!(resolved, target);
        assert!(target.is_dir());
    }
}
