use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;

use super::params::normalize_params;
use super::{FinalState, JobHandle, JobRequest, JobStatusSnapshot, PollOptions, PollOutcome};
use crate::error::JobError;

/// HTTP client for the backend's job endpoints.
#[derive(Debug, Clone)]
pub struct JobClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl JobClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` on every request.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// `base_url` with `segments` appended, each one percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, String> {
        let mut url = Url::parse(&self.base_url).map_err(|err| format!("invalid backend url: {err}"))?;
        url.path_segments_mut()
            .map_err(|()| format!("backend url cannot take a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn task_endpoint(&self, task_id: &str, action: &str) -> Result<Url, JobError> {
        self.endpoint(&["job", task_id, action])
            .map_err(|message| JobError::Status {
                task_id: task_id.to_string(),
                message,
            })
    }

    /// Validate the request parameters and submit the job.
    pub async fn submit_job(&self, request: &JobRequest) -> Result<JobHandle, JobError> {
        let (operation, params) = normalize_params(&request.operation, &request.params)?;
        let body = JobRequest {
            operation,
            source: request.source.clone(),
            params,
        };
        let request_id = uuid::Uuid::new_v4().to_string();

        let response = self
            .authorize(self.http.post(self.endpoint(&["job", "submit"]).map_err(JobError::Submit)?))
            .header("X-Request-ID", &request_id)
            .json(&body)
            .send()
            .await?;
        let (status, envelope) = read_envelope(response).await;
        if !status.is_success() {
            return Err(JobError::Submit(failure_message(status, &envelope)));
        }

        let task_id = envelope
            .get("result")
            .and_then(|result| result.get("task_id"))
            .and_then(|id| match id {
                Value::String(id) if !id.is_empty() => Some(id.clone()),
                Value::Number(id) => Some(id.to_string()),
                _ => None,
            })
            .ok_or_else(|| JobError::Submit("response carried no task id".into()))?;

        tracing::info!(task_id = %task_id, operation = %body.operation, %request_id, "job submitted");
        Ok(JobHandle::new(task_id))
    }

    pub async fn get_job_status(&self, task_id: &str) -> Result<JobStatusSnapshot, JobError> {
        let url = self.task_endpoint(task_id, "status")?;
        let response = self.authorize(self.http.get(url)).send().await?;
        self.snapshot_from(task_id, response).await
    }

    /// Ask the backend to cancel. Best effort: a job that already finished
    /// simply reports its terminal state, and nothing is aborted locally.
    pub async fn cancel_job(&self, task_id: &str) -> Result<JobStatusSnapshot, JobError> {
        let url = self.task_endpoint(task_id, "cancel")?;
        let response = self.authorize(self.http.post(url)).send().await?;
        let snapshot = self.snapshot_from(task_id, response).await?;
        tracing::info!(task_id, status = %snapshot.status, "job cancel requested");
        Ok(snapshot)
    }

    async fn snapshot_from(
        &self,
        task_id: &str,
        response: Response,
    ) -> Result<JobStatusSnapshot, JobError> {
        let (status, envelope) = read_envelope(response).await;
        if !status.is_success() {
            return Err(JobError::Status {
                task_id: task_id.to_string(),
                message: failure_message(status, &envelope),
            });
        }
        let result = envelope.get("result").cloned().unwrap_or(Value::Null);
        Ok(JobStatusSnapshot::from_result(&result))
    }

    /// Poll until the job reaches a final state or `max_attempts` replies
    /// were non-terminal.
    ///
    /// Each attempt waits, fetches, then reports the reply to `on_progress`.
    /// A `poll_after_ms` hint replaces the wait before the next attempt. A
    /// timeout leaves the backend job running.
    pub async fn poll_job_until_final<F>(
        &self,
        task_id: &str,
        options: &PollOptions,
        mut on_progress: F,
    ) -> Result<PollOutcome, JobError>
    where
        F: FnMut(&JobStatusSnapshot),
    {
        let mut interval = options.interval;
        for attempt in 1..=options.max_attempts {
            tokio::time::sleep(interval).await;
            let snapshot = self.get_job_status(task_id).await?;
            tracing::debug!(
                task_id,
                attempt,
                status = %snapshot.status,
                progress = snapshot.progress,
                "job polled"
            );
            on_progress(&snapshot);

            if let Some(final_state) = snapshot.terminal_state() {
                return Ok(PollOutcome {
                    final_state,
                    payload: Some(snapshot),
                });
            }
            if let Some(hint) = snapshot.poll_after_ms {
                interval = std::time::Duration::from_millis(hint);
            }
        }

        tracing::warn!(
            task_id,
            attempts = options.max_attempts,
            "job polling timed out, backend job may still be running"
        );
        Ok(PollOutcome {
            final_state: FinalState::Timeout,
            payload: None,
        })
    }

    /// Submit and poll to completion, returning the job's `result` value.
    pub async fn run_job<F>(
        &self,
        request: &JobRequest,
        options: &PollOptions,
        on_progress: F,
    ) -> Result<Value, JobError>
    where
        F: FnMut(&JobStatusSnapshot),
    {
        let handle = self.submit_job(request).await?;
        let outcome = self
            .poll_job_until_final(&handle.task_id, options, on_progress)
            .await?;

        match (outcome.final_state, outcome.payload) {
            (FinalState::Success, Some(snapshot)) => Ok(snapshot.result.unwrap_or(Value::Null)),
            (FinalState::Success, None) => Ok(Value::Null),
            (FinalState::Failure, snapshot) => Err(JobError::Failed(
                snapshot
                    .map(|snapshot| snapshot.error.unwrap_or(snapshot.status))
                    .unwrap_or_else(|| "unknown error".to_string()),
            )),
            (FinalState::Timeout, _) => Err(JobError::Timeout {
                task_id: handle.task_id,
                attempts: options.max_attempts,
            }),
        }
    }
}

/// Status code and JSON body; a body that is not JSON reads as `null`.
async fn read_envelope(response: Response) -> (StatusCode, Value) {
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

/// Prefer the envelope's `error`, then a framework `detail`, then the status.
fn failure_message(status: StatusCode, body: &Value) -> String {
    let detail = ["error", "detail"].iter().find_map(|field| match body.get(field) {
        Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    });
    match detail {
        Some(detail) => format!("HTTP {}: {}", status.as_u16(), detail),
        None => format!("HTTP {}", status),
    }
}
