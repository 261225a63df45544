//! `playe`: manage forensic model weights and drive backend jobs from the
//! command line. Results go to stdout as JSON, logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::Engine;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use playe_core::config::AppConfig;
use playe_core::jobs::{FinalState, JobRequest, JobSource};
use playe_core::models::registry::{self, Registry};
use playe_core::models::status::{model_statuses, remove_model};
use playe_core::models::updates::{build_report, effective_manifest, select_tasks};
use playe_core::models::{check_for_updates, CheckOptions, DownloadQueue, DownloadTask, Manifest, QueueEvent};

/// PLAYE model manager and job client.
#[derive(Parser)]
#[command(name = "playe", version, about)]
struct Cli {
    /// Path to a JSON config file instead of the per-user one.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Backend API base URL.
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Bearer token for backend requests.
    #[arg(long, global = true, env = "PLAYE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ModelArgs {
    /// Local manifest file.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Remote manifest URL; enables version comparison.
    #[arg(long)]
    remote_url: Option<String>,

    /// Models directory (defaults to $PLAYE_MODELS_DIR, then ./models-data).
    #[arg(long)]
    models_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Compare installed models against the manifest.
    CheckUpdates(ModelArgs),

    /// Download every missing or outdated model.
    UpdateModels(ModelArgs),

    /// Download models from the manifest (required ones by default).
    DownloadModels {
        #[command(flatten)]
        models: ModelArgs,

        /// Every model in the manifest.
        #[arg(long, conflicts_with_all = ["required", "keys"])]
        all: bool,

        /// Only required models.
        #[arg(long, conflicts_with = "keys")]
        required: bool,

        /// Specific model keys.
        keys: Vec<String>,
    },

    /// Show install state of every manifest model.
    ModelsStatus(ModelArgs),

    /// Delete a model's weights and registry entry.
    RemoveModel {
        #[command(flatten)]
        models: ModelArgs,

        key: String,
    },

    /// Backend jobs.
    Job {
        #[command(subcommand)]
        command: JobCommand,
    },
}

#[derive(Subcommand)]
enum JobCommand {
    /// Submit a job; with --wait, poll it to completion.
    Submit {
        /// Operation name, e.g. upscale, denoise, detect_objects.
        operation: String,

        /// Image to send inline as base64.
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        image: Option<PathBuf>,

        /// Path the backend reads directly.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Operation parameter, `name=value`. Values are parsed as JSON when
        /// possible.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,

        #[arg(long)]
        wait: bool,
    },

    /// Fetch the current status once.
    Status { task_id: String },

    /// Request cancellation.
    Cancel { task_id: String },

    /// Poll until the job is final or polling times out.
    Wait {
        task_id: String,

        #[arg(long)]
        max_attempts: Option<u32>,

        #[arg(long)]
        interval_ms: Option<u64>,
    },
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got `{raw}`"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("parameter name missing in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

#[derive(Debug, Serialize)]
struct FailedModel {
    key: String,
    error: String,
}

#[derive(Debug, Default, Serialize)]
struct QueueSummary {
    installed: Vec<String>,
    failed: Vec<FailedModel>,
}

impl QueueSummary {
    fn record(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Installed(entry) => self.installed.push(entry.key),
            QueueEvent::Progress(progress) => match progress.error {
                Some(error) => self.failed.push(FailedModel {
                    key: progress.id,
                    error,
                }),
                None if progress.percent % 10 == 0 => {
                    tracing::info!(key = %progress.id, percent = progress.percent, "downloading");
                }
                None => {}
            },
        }
    }

    /// Settle keys whose terminal event was lost to a lagging receiver. A
    /// registry entry written since `started` counts as installed.
    fn reconcile(&mut self, keys: &[String], registry: &Registry, started: DateTime<Utc>) {
        for key in keys {
            let settled = self.installed.contains(key) || self.failed.iter().any(|failed| &failed.key == key);
            if settled {
                continue;
            }
            match registry.get(key) {
                Some(entry) if entry.downloaded_at >= started => self.installed.push(key.clone()),
                _ => self.failed.push(FailedModel {
                    key: key.clone(),
                    error: "download outcome was not observed".into(),
                }),
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("playe_core=info,playe=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns `Ok(false)` when the command ran but did not fully succeed.
async fn run(cli: Cli) -> Result<bool> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if let Some(url) = cli.backend_url {
        config.backend_url = url;
    }
    if let Some(token) = cli.token {
        config.auth_token = Some(token);
    }
    config.validate()?;

    match cli.command {
        Command::CheckUpdates(args) => {
            let options = check_options(&config, &args);
            let report = check_for_updates(&options, &config.http_client()?).await?;
            print_json(&report)?;
            Ok(true)
        }
        Command::UpdateModels(args) => {
            let options = check_options(&config, &args);
            let client = config.http_client()?;
            let (manifest, remote_used) = effective_manifest(&options, &client).await?;
            let models_dir = registry::resolve_models_dir(options.models_dir.as_deref())?;
            let report = build_report(
                &manifest,
                remote_used,
                models_dir.clone(),
                options.remote_manifest_url.clone(),
            );
            let tasks = report.updates.iter().map(|update| update.to_task()).collect();
            download(&config, manifest, models_dir, tasks).await
        }
        Command::DownloadModels {
            models,
            all,
            required: _,
            keys,
        } => {
            let manifest = load_manifest(&config, &models)?;
            let tasks = select_tasks(&manifest, &keys, !all)?;
            let models_dir = models_dir(&config, &models)?;
            download(&config, manifest, models_dir, tasks).await
        }
        Command::ModelsStatus(args) => {
            let manifest = load_manifest(&config, &args)?;
            let models_dir = models_dir(&config, &args)?;
            let registry = registry::read(&models_dir);
            print_json(&model_statuses(&manifest, &registry, &models_dir))?;
            Ok(true)
        }
        Command::RemoveModel { models, key } => {
            let manifest = load_manifest(&config, &models)?;
            let models_dir = models_dir(&config, &models)?;
            let removed = remove_model(&models_dir, &manifest, &key)?;
            print_json(&serde_json::json!({ "key": key, "removed": removed.is_some() }))?;
            Ok(true)
        }
        Command::Job { command } => run_job_command(&config, command).await,
    }
}

async fn run_job_command(config: &AppConfig, command: JobCommand) -> Result<bool> {
    let client = config.job_client()?;
    match command {
        JobCommand::Submit {
            operation,
            image,
            file,
            params,
            wait,
        } => {
            let source = match (image, file) {
                (Some(image), _) => {
                    let bytes = std::fs::read(&image)
                        .with_context(|| format!("reading image {}", image.display()))?;
                    JobSource::ImageBase64(base64::engine::general_purpose::STANDARD.encode(bytes))
                }
                (None, Some(file)) => JobSource::FilePath(file),
                (None, None) => anyhow::bail!("either --image or --file is required"),
            };
            let request = params
                .into_iter()
                .fold(JobRequest::new(operation, source), |request, (name, value)| {
                    request.with_param(name, value)
                });

            let handle = client.submit_job(&request).await?;
            if !wait {
                print_json(&handle)?;
                return Ok(true);
            }
            wait_for_job(&client, &handle.task_id, config.poll_options()).await
        }
        JobCommand::Status { task_id } => {
            print_json(&client.get_job_status(&task_id).await?)?;
            Ok(true)
        }
        JobCommand::Cancel { task_id } => {
            print_json(&client.cancel_job(&task_id).await?)?;
            Ok(true)
        }
        JobCommand::Wait {
            task_id,
            max_attempts,
            interval_ms,
        } => {
            let mut options = config.poll_options();
            if let Some(max_attempts) = max_attempts {
                options.max_attempts = max_attempts;
            }
            if let Some(interval_ms) = interval_ms {
                options.interval = std::time::Duration::from_millis(interval_ms);
            }
            wait_for_job(&client, &task_id, options).await
        }
    }
}

async fn wait_for_job(
    client: &playe_core::jobs::JobClient,
    task_id: &str,
    options: playe_core::jobs::PollOptions,
) -> Result<bool> {
    let outcome = client
        .poll_job_until_final(task_id, &options, |snapshot| {
            tracing::info!(task_id, status = %snapshot.status, progress = snapshot.progress, "job progress");
        })
        .await?;
    if outcome.final_state == FinalState::Timeout {
        tracing::warn!(task_id, "stopped polling; the backend job may still be running");
    }
    print_json(&outcome)?;
    Ok(outcome.final_state == FinalState::Success)
}

fn check_options(config: &AppConfig, args: &ModelArgs) -> CheckOptions {
    CheckOptions {
        manifest_path: args
            .manifest
            .clone()
            .unwrap_or_else(|| config.manifest_path.clone()),
        models_dir: args
            .models_dir
            .clone()
            .or_else(|| config.models_directory.clone()),
        remote_manifest_url: args
            .remote_url
            .clone()
            .or_else(|| config.remote_manifest_url.clone()),
    }
}

fn load_manifest(config: &AppConfig, args: &ModelArgs) -> Result<Manifest> {
    let path = check_options(config, args).manifest_path;
    Manifest::load(&path).with_context(|| format!("loading manifest {}", path.display()))
}

fn models_dir(config: &AppConfig, args: &ModelArgs) -> Result<PathBuf> {
    let options = check_options(config, args);
    Ok(registry::resolve_models_dir(options.models_dir.as_deref())?)
}

/// Run `tasks` through a download queue and print what happened. Returns
/// `false` if any model failed.
async fn download(
    config: &AppConfig,
    manifest: Manifest,
    models_dir: PathBuf,
    tasks: Vec<DownloadTask>,
) -> Result<bool> {
    let mut keys: Vec<String> = Vec::with_capacity(tasks.len());
    for task in &tasks {
        if !keys.contains(&task.key) {
            keys.push(task.key.clone());
        }
    }
    let started = Utc::now();
    let queue = DownloadQueue::new(config.downloader()?, models_dir.clone(), Arc::new(manifest));
    let mut events = queue.subscribe();
    let mut summary = QueueSummary::default();

    if queue.enqueue_many(tasks)? > 0 {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Ok(event) => summary.record(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed download events");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = queue.wait_idle() => break,
            }
        }
        while let Ok(event) = events.try_recv() {
            summary.record(event);
        }
        summary.reconcile(&keys, &registry::read(&models_dir), started);
    }

    let ok = summary.failed.is_empty();
    print_json(&summary)?;
    Ok(ok)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
