use std::path::PathBuf;
use std::time::{Duration, Instant};

use playe_core::error::JobError;
use playe_core::jobs::{FinalState, JobClient, JobRequest, JobSource, PollOptions};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn envelope(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "request_id": "req-1",
        "status": "done",
        "error": null,
        "result": result
    }))
}

fn fast(max_attempts: u32) -> PollOptions {
    PollOptions {
        max_attempts,
        interval: Duration::from_millis(5),
    }
}

fn upscale_request() -> JobRequest {
    JobRequest::new("upscale", JobSource::FilePath(PathBuf::from("/cases/42/frame.png"))).with_param("factor", 4)
}

#[tokio::test]
async fn submit_sends_normalized_params_with_auth_and_request_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/job/submit"))
        .and(header("authorization", "Bearer case-token"))
        .and(header_exists("x-request-id"))
        .and(body_partial_json(json!({
            "operation": "upscale",
            "file_path": "/cases/42/frame.png",
            "params": {"factor": 8, "preset": "presentation"}
        })))
        .respond_with(
            ResponseTemplate::new(202).set_body_json(json!({"status": "queued", "result": {"task_id": "t-42"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = JobClient::new(format!("{}/api", server.uri())).with_token(Some("case-token".into()));
    let request = JobRequest::new("Upscale", JobSource::FilePath(PathBuf::from("/cases/42/frame.png")))
        .with_param("preset", "presentation");
    let handle = client.submit_job(&request).await.unwrap();

    assert_eq!(handle.task_id, "t-42");
    assert!(!handle.is_final);
}

#[tokio::test]
async fn submit_without_task_id_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/job/submit"))
        .respond_with(envelope(json!({})))
        .mount(&server)
        .await;

    let err = JobClient::new(server.uri()).submit_job(&upscale_request()).await.unwrap_err();
    assert!(matches!(err, JobError::Submit(_)), "{err:?}");
}

#[tokio::test]
async fn submit_http_error_carries_backend_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/job/submit"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({"detail": "file not found"})))
        .mount(&server)
        .await;

    match JobClient::new(server.uri()).submit_job(&upscale_request()).await {
        Err(JobError::Submit(message)) => assert!(message.contains("file not found"), "{message}"),
        other => panic!("expected submit error, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_params_never_reach_the_backend() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/job/submit"))
        .respond_with(envelope(json!({"task_id": "never"})))
        .expect(0)
        .mount(&server)
        .await;

    let request = JobRequest::new("upscale", JobSource::ImageBase64("aGk=".into())).with_param("factor", 3);
    let err = JobClient::new(server.uri()).submit_job(&request).await.unwrap_err();
    assert!(matches!(err, JobError::InvalidParams(_)), "{err:?}");
}

#[tokio::test]
async fn poll_succeeds_after_three_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/job/t-1/status"))
        .respond_with(envelope(json!({"status": "running", "progress": 40, "is_final": false})))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/job/t-1/status"))
        .respond_with(envelope(json!({
            "status": "done", "progress": 100, "is_final": true, "result": {"output": "/cases/42/out.png"}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut reported = Vec::new();
    let outcome = JobClient::new(server.uri())
        .poll_job_until_final("t-1", &fast(10), |snapshot| {
            reported.push((snapshot.status.clone(), snapshot.progress))
        })
        .await
        .unwrap();

    assert_eq!(outcome.final_state, FinalState::Success);
    assert_eq!(
        reported,
        vec![
            ("running".to_string(), 40.0),
            ("running".to_string(), 40.0),
            ("done".to_string(), 100.0)
        ]
    );
    let payload = outcome.payload.unwrap();
    assert_eq!(payload.result, Some(json!({"output": "/cases/42/out.png"})));
}

#[tokio::test]
async fn poll_times_out_after_exactly_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/job/slow/status"))
        .respond_with(envelope(json!({"status": "running", "progress": 10})))
        .expect(4)
        .mount(&server)
        .await;

    let mut calls = 0;
    let outcome = JobClient::new(server.uri())
        .poll_job_until_final("slow", &fast(4), |_| calls += 1)
        .await
        .unwrap();

    assert_eq!(outcome.final_state, FinalState::Timeout);
    assert!(outcome.payload.is_none());
    assert_eq!(calls, 4);
}

#[tokio::test]
async fn final_with_error_is_a_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/job/t-2/status"))
        .respond_with(envelope(json!({"status": "failed", "is_final": true, "error": "CUDA out of memory"})))
        .mount(&server)
        .await;

    let outcome = JobClient::new(server.uri())
        .poll_job_until_final("t-2", &fast(3), |_| {})
        .await
        .unwrap();

    assert_eq!(outcome.final_state, FinalState::Failure);
    assert_eq!(outcome.payload.unwrap().error.as_deref(), Some("CUDA out of memory"));
}

#[tokio::test]
async fn server_hint_replaces_the_poll_interval() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/job/t-3/status"))
        .respond_with(envelope(json!({"status": "running", "poll_after_ms": 5})))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/job/t-3/status"))
        .respond_with(envelope(json!({"status": "done", "is_final": true})))
        .mount(&server)
        .await;

    let options = PollOptions {
        max_attempts: 10,
        interval: Duration::from_secs(1),
    };
    let started = Instant::now();
    let outcome = JobClient::new(server.uri())
        .poll_job_until_final("t-3", &options, |_| {})
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.final_state, FinalState::Success);
    // one full interval before the first poll, then two 5 ms waits
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1900), "{elapsed:?}");
}

#[tokio::test]
async fn status_http_error_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/job/gone/status"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"status": "error", "error": "unknown task"})))
        .mount(&server)
        .await;

    match JobClient::new(server.uri()).get_job_status("gone").await {
        Err(JobError::Status { task_id, message }) => {
            assert_eq!(task_id, "gone");
            assert!(message.contains("unknown task"), "{message}");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn cancel_reports_the_backend_state() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/job/t-4/cancel"))
        .respond_with(envelope(json!({"task_id": "t-4", "status": "canceled", "is_final": true, "poll_after_ms": 0})))
        .expect(1)
        .mount(&server)
        .await;

    let snapshot = JobClient::new(server.uri()).cancel_job("t-4").await.unwrap();
    assert_eq!(snapshot.status, "canceled");
    assert!(snapshot.is_final);
    assert_eq!(snapshot.task_id.as_deref(), Some("t-4"));
}

#[tokio::test]
async fn run_job_maps_outcomes_to_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/job/submit"))
        .respond_with(envelope(json!({"task_id": "t-5"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/job/t-5/status"))
        .respond_with(envelope(json!({"status": "queued"})))
        .mount(&server)
        .await;

    let err = JobClient::new(server.uri())
        .run_job(&upscale_request(), &fast(2), |_| {})
        .await
        .unwrap_err();

    match &err {
        JobError::Timeout { task_id, attempts } => {
            assert_eq!(task_id, "t-5");
            assert_eq!(*attempts, 2);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(err.to_string().contains("may still be running"));
}

#[tokio::test]
async fn run_job_returns_result_value() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/job/submit"))
        .respond_with(envelope(json!({"task_id": "t-6"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/job/t-6/status"))
        .respond_with(envelope(json!({"status": "success", "result": {"objects": 3}})))
        .mount(&server)
        .await;

    let value = JobClient::new(server.uri())
        .run_job(&upscale_request(), &fast(5), |_| {})
        .await
        .unwrap();
    assert_eq!(value, json!({"objects": 3}));
}

#[tokio::test]
async fn task_id_with_reserved_characters_stays_in_its_segment() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/job/case%2F42%3Fx/status"))
        .respond_with(envelope(json!({"status": "running", "progress": 5})))
        .expect(1)
        .mount(&server)
        .await;

    let snapshot = JobClient::new(server.uri()).get_job_status("case/42?x").await.unwrap();
    assert_eq!(snapshot.status, "running");
}
