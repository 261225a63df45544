use std::cmp::Ordering;
use std::path::PathBuf;

use serde::Serialize;

use super::manifest::{Manifest, ModelManifestEntry};
use super::queue::DownloadTask;
use super::registry::{self, Registry};
use crate::error::{ManifestError, UpdateError};

#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    pub manifest_path: PathBuf,
    pub models_dir: Option<PathBuf>,
    pub remote_manifest_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateReason {
    Missing,
    NewVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAction {
    pub key: String,
    pub name: String,
    pub reason: UpdateReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    pub target_version: String,
    pub url: String,
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl UpdateAction {
    fn for_entry(
        entry: &ModelManifestEntry,
        reason: UpdateReason,
        current_version: Option<String>,
    ) -> Self {
        Self {
            key: entry.key.clone(),
            name: entry.name.clone(),
            reason,
            current_version,
            target_version: entry.version.clone(),
            url: entry.url.clone(),
            filename: entry.filename.clone(),
            checksum: entry.checksum.clone(),
        }
    }

    pub fn to_task(&self) -> DownloadTask {
        DownloadTask {
            key: self.key.clone(),
            url: self.url.clone(),
            filename: self.filename.clone(),
            checksum: self.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReport {
    pub updates_available: bool,
    pub models_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_manifest_url: Option<String>,
    pub updates: Vec<UpdateAction>,
}

/// Component-wise numeric comparison. Missing components count as 0, and so
/// do components that are not plain numbers (`"1.2-beta"` compares as `1.0`).
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |version: &str| -> Vec<u64> {
        version
            .split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let left = parse(a);
    let right = parse(b);
    let len = left.len().max(right.len());
    for index in 0..len {
        let l = left.get(index).copied().unwrap_or(0);
        let r = right.get(index).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Diff `manifest` against `registry`.
///
/// `remote_used` enables version comparison; without it only missing required
/// models are reported. Optional models that are absent are never reported.
pub fn diff(manifest: &Manifest, registry: &Registry, remote_used: bool) -> Vec<UpdateAction> {
    let mut updates = Vec::new();
    for entry in manifest.iter() {
        match registry.get(&entry.key) {
            None if entry.required => {
                updates.push(UpdateAction::for_entry(entry, UpdateReason::Missing, None));
            }
            None => {}
            Some(installed) if remote_used => {
                if compare_versions(&entry.version, &installed.version) == Ordering::Greater {
                    updates.push(UpdateAction::for_entry(
                        entry,
                        UpdateReason::NewVersion,
                        Some(installed.version.clone()),
                    ));
                }
            }
            Some(_) => {}
        }
    }
    updates
}

pub async fn fetch_remote_manifest(
    client: &reqwest::Client,
    url: &str,
) -> Result<Manifest, UpdateError> {
    let remote_error = |message: String| UpdateError::RemoteFetch {
        url: url.to_string(),
        message,
    };
    let body = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|err| remote_error(err.to_string()))?
        .text()
        .await
        .map_err(|err| remote_error(err.to_string()))?;
    Manifest::from_json_str(&body).map_err(|err| remote_error(err.to_string()))
}

/// The manifest an update check compares against, and whether it is the
/// remote one. A remote manifest with no entries falls back to the local file.
/// A configured remote manifest that cannot be fetched is an error.
pub async fn effective_manifest(
    options: &CheckOptions,
    client: &reqwest::Client,
) -> Result<(Manifest, bool), UpdateError> {
    let local = Manifest::load(&options.manifest_path)?;
    let Some(url) = options.remote_manifest_url.as_deref() else {
        return Ok((local, false));
    };

    let remote = fetch_remote_manifest(client, url).await?;
    if remote.is_empty() {
        tracing::warn!(url, "remote manifest has no models, using local manifest");
        Ok((local, false))
    } else {
        Ok((remote, true))
    }
}

pub fn build_report(
    manifest: &Manifest,
    remote_used: bool,
    models_dir: PathBuf,
    remote_manifest_url: Option<String>,
) -> UpdateReport {
    let registry = registry::read(&models_dir);
    let updates = diff(manifest, &registry, remote_used);

    tracing::info!(
        models_dir = %models_dir.display(),
        remote = remote_used,
        updates = updates.len(),
        "update check finished"
    );

    UpdateReport {
        updates_available: !updates.is_empty(),
        models_dir,
        remote_manifest_url,
        updates,
    }
}

/// Check installed models against the local (or remote) manifest. Without a
/// remote URL no network request is made.
pub async fn check_for_updates(
    options: &CheckOptions,
    client: &reqwest::Client,
) -> Result<UpdateReport, UpdateError> {
    let (manifest, remote_used) = effective_manifest(options, client).await?;
    let models_dir = registry::resolve_models_dir(options.models_dir.as_deref())?;
    Ok(build_report(
        &manifest,
        remote_used,
        models_dir,
        options.remote_manifest_url.clone(),
    ))
}

/// Download tasks for every manifest entry selected by `keys`, or for all
/// required ones when `keys` is empty and `required_only` is set.
pub fn select_tasks(
    manifest: &Manifest,
    keys: &[String],
    required_only: bool,
) -> Result<Vec<DownloadTask>, ManifestError> {
    if !keys.is_empty() {
        return keys
            .iter()
            .map(|key| {
                manifest
                    .get(key)
                    .map(DownloadTask::from_entry)
                    .ok_or_else(|| ManifestError::Invalid {
                        key: key.clone(),
                        reason: "not in manifest".into(),
                    })
            })
            .collect();
    }
    let tasks: Vec<DownloadTask> = if required_only {
        manifest.required().map(DownloadTask::from_entry).collect()
    } else {
        manifest.iter().map(DownloadTask::from_entry).collect()
    };
    Ok(tasks)
}
