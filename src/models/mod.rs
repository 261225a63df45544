pub mod download;
pub mod manifest;
pub mod queue;
pub mod registry;
pub mod status;
pub mod updates;

pub use download::{DownloadOutcome, DownloadProgress, Downloader, NoProgress, ProgressSink};
pub use manifest::{Manifest, ModelManifestEntry};
pub use queue::{DownloadProgressEvent, DownloadQueue, DownloadTask, QueueEvent, QueuePhase};
pub use registry::{Registry, RegistryEntry};
pub use status::{InstallState, ModelStatus};
pub use updates::{check_for_updates, CheckOptions, UpdateAction, UpdateReason, UpdateReport};
