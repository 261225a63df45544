//! Serial download queue.
//!
//! One [`DownloadQueue`] is created per process. Tasks are drained strictly
//! FIFO by a single spawned task, so at most one transfer runs at any time.
//! A failed task is reported as an error event and the drain moves on.
//! Observers subscribe to a broadcast channel and never block the queue.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

use super::download::{DownloadOutcome, DownloadProgress, Downloader};
use super::manifest::{Manifest, ModelManifestEntry};
use super::registry::{self, RegistryEntry};
use crate::error::QueueError;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub key: String,
    pub url: String,
    pub filename: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl DownloadTask {
    pub fn new(key: impl Into<String>, url: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            filename: filename.into(),
            checksum: None,
        }
    }

    pub fn from_entry(entry: &ModelManifestEntry) -> Self {
        Self {
            key: entry.key.clone(),
            url: entry.url.clone(),
            filename: entry.filename.clone(),
            checksum: entry.checksum.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgressEvent {
    pub id: String,
    pub percent: u8,
    pub speed_bytes_per_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueueEvent {
    Progress(DownloadProgressEvent),
    /// Registry entry written; the model is now usable.
    Installed(RegistryEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePhase {
    Idle,
    Draining,
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<DownloadTask>,
    in_flight: Option<String>,
    phase: QueuePhase,
    closed: bool,
}

struct Inner {
    downloader: Downloader,
    models_dir: PathBuf,
    manifest: Arc<Manifest>,
    events: broadcast::Sender<QueueEvent>,
    phase_tx: watch::Sender<QueuePhase>,
    state: Mutex<QueueState>,
}

#[derive(Clone)]
pub struct DownloadQueue {
    inner: Arc<Inner>,
}

impl DownloadQueue {
    pub fn new(downloader: Downloader, models_dir: PathBuf, manifest: Arc<Manifest>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (phase_tx, _) = watch::channel(QueuePhase::Idle);
        Self {
            inner: Arc::new(Inner {
                downloader,
                models_dir,
                manifest,
                events,
                phase_tx,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    in_flight: None,
                    phase: QueuePhase::Idle,
                    closed: false,
                }),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    pub fn phase(&self) -> QueuePhase {
        self.inner.lock_state().phase
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    pub fn enqueue(&self, task: DownloadTask) -> Result<usize, QueueError> {
        self.enqueue_many(std::iter::once(task))
    }

    /// Append tasks and start draining if the queue was idle. Tasks whose key
    /// is already queued or transferring are skipped. Returns how many were
    /// added. Must be called from within a tokio runtime.
    pub fn enqueue_many<I>(&self, tasks: I) -> Result<usize, QueueError>
    where
        I: IntoIterator<Item = DownloadTask>,
    {
        let (added, start_drain) = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(QueueError::Closed);
            }

            let mut added = 0;
            for task in tasks {
                let duplicate = state.in_flight.as_deref() == Some(task.key.as_str())
                    || state.pending.iter().any(|queued| queued.key == task.key);
                if duplicate {
                    tracing::debug!(key = %task.key, "model already queued, skipping");
                    continue;
                }
                state.pending.push_back(task);
                added += 1;
            }

            let start_drain = added > 0 && state.phase == QueuePhase::Idle;
            if start_drain {
                state.phase = QueuePhase::Draining;
                self.inner.phase_tx.send_replace(QueuePhase::Draining);
            }
            (added, start_drain)
        };

        if start_drain {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(inner.drain());
        }
        Ok(added)
    }

    /// Resolve once the queue is idle with nothing pending.
    pub async fn wait_idle(&self) {
        let mut phase = self.inner.phase_tx.subscribe();
        let _ = phase.wait_for(|phase| *phase == QueuePhase::Idle).await;
    }

    /// Refuse new tasks, drop the ones not yet started and wait for the
    /// running transfer to settle. Returns the number of discarded tasks.
    pub async fn shutdown(&self) -> usize {
        let discarded = {
            let mut state = self.inner.lock_state();
            state.closed = true;
            let discarded = state.pending.len();
            state.pending.clear();
            discarded
        };
        if discarded > 0 {
            tracing::info!(discarded, "download queue shut down with pending tasks");
        }
        self.wait_idle().await;
        discarded
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn drain(self: Arc<Self>) {
        tracing::debug!("download queue draining");
        loop {
            let task = {
                let mut state = self.lock_state();
                match state.pending.pop_front() {
                    Some(task) => {
                        state.in_flight = Some(task.key.clone());
                        task
                    }
                    None => {
                        state.in_flight = None;
                        state.phase = QueuePhase::Idle;
                        self.phase_tx.send_replace(QueuePhase::Idle);
                        tracing::debug!("download queue idle");
                        return;
                    }
                }
            };
            self.process(task).await;
        }
    }

    async fn process(&self, task: DownloadTask) {
        let entry = self.manifest.get(&task.key);
        let checksum = task
            .checksum
            .clone()
            .or_else(|| entry.and_then(|entry| entry.checksum.clone()));
        let destination = self.models_dir.join(&task.filename);

        tracing::info!(key = %task.key, url = %task.url, "starting model download");

        let mut last_percent = 0u8;
        let mut last_speed = 0.0;
        let mut relay = |progress: DownloadProgress| {
            // 100 is announced only once the registry entry is written
            if progress.percent >= 100 {
                return;
            }
            last_percent = progress.percent;
            last_speed = progress.speed_bytes_per_sec;
            let _ = self.events.send(QueueEvent::Progress(DownloadProgressEvent {
                id: task.key.clone(),
                percent: progress.percent,
                speed_bytes_per_sec: progress.speed_bytes_per_sec,
                error: None,
            }));
        };

        let downloaded = self
            .downloader
            .download(&task.url, &destination, checksum.as_deref(), &mut relay)
            .await;
        let result = match downloaded {
            Ok(outcome) => self.record(&task, entry, outcome).await,
            Err(err) => Err(err.to_string()),
        };

        match result {
            Ok(installed) => {
                tracing::info!(key = %installed.key, version = %installed.version, "model installed");
                let _ = self.events.send(QueueEvent::Progress(DownloadProgressEvent {
                    id: task.key.clone(),
                    percent: 100,
                    speed_bytes_per_sec: last_speed,
                    error: None,
                }));
                let _ = self.events.send(QueueEvent::Installed(installed));
            }
            Err(message) => {
                tracing::warn!(key = %task.key, error = %message, "model download failed, continuing queue");
                let _ = self.events.send(QueueEvent::Progress(DownloadProgressEvent {
                    id: task.key.clone(),
                    percent: last_percent,
                    speed_bytes_per_sec: 0.0,
                    error: Some(message),
                }));
            }
        }
    }

    async fn record(
        &self,
        task: &DownloadTask,
        entry: Option<&ModelManifestEntry>,
        outcome: DownloadOutcome,
    ) -> Result<RegistryEntry, String> {
        let installed = RegistryEntry {
            key: task.key.clone(),
            name: entry
                .map(|entry| entry.name.clone())
                .unwrap_or_else(|| task.key.clone()),
            filename: task.filename.clone(),
            version: entry
                .map(|entry| entry.version.clone())
                .unwrap_or_else(|| "0".to_string()),
            digest: outcome.digest,
            byte_size: outcome.byte_count,
            downloaded_at: Utc::now(),
        };

        let models_dir = self.models_dir.clone();
        let update = installed.clone();
        tokio::task::spawn_blocking(move || {
            let mut registry = registry::read(&models_dir);
            registry.upsert(update);
            registry::write(&models_dir, &registry)
        })
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())?;
        Ok(installed)
    }
}
