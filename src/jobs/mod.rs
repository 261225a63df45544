//! Backend job protocol: submit an operation, poll it to a final state,
//! cancel it.
//!
//! The backend answers every call with an envelope
//! `{request_id, status, error, result}`; only `result` is interpreted here.

mod client;
pub mod params;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

pub use client::JobClient;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(700);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 600;

const SUCCESS_STATUSES: [&str; 2] = ["success", "done"];
const FAILURE_STATUSES: [&str; 3] = ["failure", "failed", "error"];

/// Backend job status. Unrecognized strings are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Retry,
    Done,
    Failed,
    Canceled,
    Other(String),
}

impl JobStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "pending" => Self::Pending,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "retry" => Self::Retry,
            "done" | "success" => Self::Done,
            "failed" | "failure" | "error" => Self::Failed,
            "canceled" | "cancelled" => Self::Canceled,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retry => "retry",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Other(raw) => raw,
        }
    }
}

impl Serialize for JobStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalState {
    Success,
    Failure,
    /// The client gave up. The backend job may still be running.
    Timeout,
}

/// One normalized status reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusSnapshot {
    pub task_id: Option<String>,
    /// Lower-cased status string as sent by the backend.
    pub status: String,
    pub progress: f64,
    pub is_final: bool,
    /// `None` when absent, null or empty.
    pub error: Option<String>,
    pub result: Option<Value>,
    pub poll_after_ms: Option<u64>,
    pub meta: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatus {
    #[serde(default)]
    task_id: Option<Value>,
    #[serde(default)]
    status: Option<Value>,
    #[serde(default)]
    progress: Option<Value>,
    #[serde(default)]
    is_final: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    poll_after_ms: Option<Value>,
    #[serde(default)]
    meta: Option<Value>,
}

fn text_of(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    }
}

impl JobStatusSnapshot {
    /// Normalize the `result` object of a status or cancel reply. Fields of
    /// the wrong type are treated as absent.
    pub fn from_result(result: &Value) -> Self {
        let raw: RawStatus = serde_json::from_value(result.clone()).unwrap_or_default();
        Self {
            task_id: raw.task_id.and_then(text_of),
            status: raw
                .status
                .and_then(text_of)
                .map(|status| status.trim().to_lowercase())
                .unwrap_or_else(|| "unknown".to_string()),
            progress: raw
                .progress
                .as_ref()
                .and_then(Value::as_f64)
                .filter(|p| p.is_finite())
                .unwrap_or(0.0),
            is_final: raw.is_final.as_ref().and_then(Value::as_bool).unwrap_or(false),
            error: raw
                .error
                .and_then(text_of)
                .filter(|error| !error.trim().is_empty()),
            result: raw.result.filter(|result| !result.is_null()),
            poll_after_ms: raw
                .poll_after_ms
                .as_ref()
                .and_then(Value::as_f64)
                .filter(|ms| ms.is_finite() && *ms >= 0.0)
                .map(|ms| ms.round() as u64),
            meta: raw.meta.filter(|meta| !meta.is_null()),
        }
    }

    pub fn job_status(&self) -> JobStatus {
        JobStatus::parse(&self.status)
    }

    /// Terminal decision for this reply, or `None` to keep polling.
    ///
    /// An explicit `is_final` wins and is a success unless an error is
    /// present. Otherwise the status string is matched against the success
    /// and failure sets.
    pub fn terminal_state(&self) -> Option<FinalState> {
        if self.is_final {
            return Some(if self.error.is_some() {
                FinalState::Failure
            } else {
                FinalState::Success
            });
        }
        let status = self.status.as_str();
        if SUCCESS_STATUSES.contains(&status) {
            Some(FinalState::Success)
        } else if FAILURE_STATUSES.contains(&status) {
            Some(FinalState::Failure)
        } else {
            None
        }
    }
}

/// Client-side view of one submitted job. Lives for one UI operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub task_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub is_final: bool,
    pub poll_after_ms: Option<u64>,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl JobHandle {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: JobStatus::Queued,
            progress: 0.0,
            is_final: false,
            poll_after_ms: None,
            error: None,
            result: None,
        }
    }

    /// Apply a status reply. Once the handle is final further replies are
    /// ignored; returns whether anything was applied.
    pub fn observe(&mut self, snapshot: &JobStatusSnapshot) -> bool {
        if self.is_final {
            return false;
        }
        self.status = snapshot.job_status();
        self.progress = snapshot.progress;
        self.is_final = snapshot.is_final || snapshot.terminal_state().is_some();
        self.poll_after_ms = snapshot.poll_after_ms;
        self.error = snapshot.error.clone();
        self.result = snapshot.result.clone();
        true
    }
}

/// Input image of a job: inline or a path the backend can read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    ImageBase64(String),
    FilePath(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRequest {
    pub operation: String,
    #[serde(flatten)]
    pub source: JobSource,
    pub params: Map<String, Value>,
}

impl JobRequest {
    pub fn new(operation: impl Into<String>, source: JobSource) -> Self {
        Self {
            operation: operation.into(),
            source,
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub max_attempts: u32,
    /// Wait before the first fetch; replaced by each `poll_after_ms` hint.
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollOutcome {
    pub final_state: FinalState,
    /// Last status reply; `None` on timeout.
    pub payload: Option<JobStatusSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_normalizes_fields() {
        let snapshot = JobStatusSnapshot::from_result(&json!({
            "task_id": "t-1",
            "status": "RUNNING",
            "progress": 55,
            "is_final": false,
            "error": "",
            "poll_after_ms": 700,
            "meta": {"stage": "detect"}
        }));
        assert_eq!(snapshot.task_id.as_deref(), Some("t-1"));
        assert_eq!(snapshot.status, "running");
        assert_eq!(snapshot.progress, 55.0);
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.poll_after_ms, Some(700));
        assert_eq!(snapshot.meta, Some(json!({"stage": "detect"})));
        assert_eq!(snapshot.job_status(), JobStatus::Running);
        assert_eq!(snapshot.terminal_state(), None);
    }

    #[test]
    fn empty_result_is_unknown_and_not_terminal() {
        let snapshot = JobStatusSnapshot::from_result(&json!({}));
        assert_eq!(snapshot.status, "unknown");
        assert_eq!(snapshot.terminal_state(), None);
        assert_eq!(snapshot.job_status(), JobStatus::Other("unknown".into()));
    }

    #[test]
    fn terminal_precedence() {
        let state = |value: Value| JobStatusSnapshot::from_result(&value).terminal_state();

        assert_eq!(state(json!({"status": "running", "is_final": true})), Some(FinalState::Success));
        assert_eq!(
            state(json!({"status": "done", "is_final": true, "error": "boom"})),
            Some(FinalState::Failure)
        );
        assert_eq!(state(json!({"status": "canceled", "is_final": true})), Some(FinalState::Success));
        assert_eq!(state(json!({"status": "Success"})), Some(FinalState::Success));
        assert_eq!(state(json!({"status": "done"})), Some(FinalState::Success));
        assert_eq!(state(json!({"status": "ERROR"})), Some(FinalState::Failure));
        assert_eq!(state(json!({"status": "failed", "error": null})), Some(FinalState::Failure));
        assert_eq!(state(json!({"status": "retry"})), None);
        assert_eq!(state(json!({"status": "canceled"})), None);
    }

    #[test]
    fn handle_ignores_updates_after_final() {
        let mut handle = JobHandle::new("t-9");
        let running = JobStatusSnapshot::from_result(&json!({"status": "running", "progress": 40}));
        let done = JobStatusSnapshot::from_result(&json!({"status": "done", "progress": 100, "is_final": true, "result": {"ok": true}}));

        assert!(handle.observe(&running));
        assert!(!handle.is_final);
        assert!(handle.observe(&done));
        assert!(handle.is_final);
        assert!(!handle.observe(&running));
        assert_eq!(handle.status, JobStatus::Done);
        assert_eq!(handle.progress, 100.0);
        assert_eq!(handle.result, Some(json!({"ok": true})));
    }

    #[test]
    fn request_serializes_source_inline() {
        let request = JobRequest::new("upscale", JobSource::FilePath(PathBuf::from("/tmp/frame.png")))
            .with_param("factor", 4);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"operation": "upscale", "file_path": "/tmp/frame.png", "params": {"factor": 4}})
        );

        let inline = JobRequest::new("denoise", JobSource::ImageBase64("aGk=".into()));
        let json = serde_json::to_value(&inline).unwrap();
        assert_eq!(json["image_base64"], "aGk=");
    }

    #[test]
    fn final_state_serializes_lowercase() {
        assert_eq!(serde_json::to_value(FinalState::Timeout).unwrap(), json!("timeout"));
        assert_eq!(serde_json::to_value(JobStatus::Other("paused".into())).unwrap(), json!("paused"));
    }
}
