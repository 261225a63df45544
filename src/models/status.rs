//! Per-model install state, used by the UI to lock actions whose weights are
//! not available.

use std::cmp::Ordering;
use std::path::Path;

use serde::Serialize;

use super::manifest::Manifest;
use super::registry::{self, Registry, RegistryEntry};
use super::updates::compare_versions;
use crate::error::RegistryError;
use crate::utils::files::{remove_if_exists, sibling_with_suffix};
use crate::utils::format_file_size;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallState {
    NotInstalled,
    Installed,
    /// Installed, but the manifest declares a newer version.
    Outdated,
    /// Registered, but the weight file is gone from disk.
    FileMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStatus {
    pub key: String,
    pub name: String,
    pub description: String,
    pub required: bool,
    pub state: InstallState,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    pub manifest_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub size_human: String,
}

pub fn model_statuses(manifest: &Manifest, registry: &Registry, models_dir: &Path) -> Vec<ModelStatus> {
    manifest
        .iter()
        .map(|entry| {
            let installed = registry.get(&entry.key);
            let state = match installed {
                None => InstallState::NotInstalled,
                Some(found) if !models_dir.join(&found.filename).is_file() => {
                    InstallState::FileMissing
                }
                Some(found) if compare_versions(&entry.version, &found.version) == Ordering::Greater => {
                    InstallState::Outdated
                }
                Some(_) => InstallState::Installed,
            };
            let size_bytes = installed.map(|found| found.byte_size).or(entry.size);

            ModelStatus {
                key: entry.key.clone(),
                name: entry.name.clone(),
                description: entry.description.clone(),
                required: entry.required,
                state,
                locked: matches!(state, InstallState::NotInstalled | InstallState::FileMissing),
                installed_version: installed.map(|found| found.version.clone()),
                manifest_version: entry.version.clone(),
                size_bytes,
                size_human: format_file_size(size_bytes.unwrap_or(0)),
            }
        })
        .collect()
}

/// Whether UI actions depending on `key` may run.
pub fn is_unlocked(registry: &Registry, models_dir: &Path, key: &str) -> bool {
    registry
        .get(key)
        .is_some_and(|entry| models_dir.join(&entry.filename).is_file())
}

/// Delete a model's weights (and any leftover partial file) and forget it in
/// the registry. Returns the removed registry entry, if there was one.
pub fn remove_model(
    models_dir: &Path,
    manifest: &Manifest,
    key: &str,
) -> Result<Option<RegistryEntry>, RegistryError> {
    let mut registry = registry::read(models_dir);
    let removed = registry.remove(key);

    let filename = removed
        .as_ref()
        .map(|entry| entry.filename.clone())
        .or_else(|| manifest.get(key).map(|entry| entry.filename.clone()));

    if let Some(filename) = filename {
        let path = models_dir.join(filename);
        for target in [sibling_with_suffix(&path, "partial"), path] {
            remove_if_exists(&target).map_err(|source| RegistryError::Io {
                path: target.clone(),
                source,
            })?;
        }
    }

    if removed.is_some() {
        registry::write(models_dir, &registry)?;
        tracing::info!(key, "model removed");
    }
    Ok(removed)
}
