use crate::jobs::{JobClient, PollOptions};
use crate::models::download::{http_client, Downloader};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR_NAME: &str = "playe";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Base URL of the backend API, e.g. `http://127.0.0.1:8000/api`.
    pub backend_url: String,
    pub auth_token: Option<String>,
    pub manifest_path: PathBuf,
    pub remote_manifest_url: Option<String>,
    /// Overrides `$PLAYE_MODELS_DIR` and the working-directory default.
    pub models_directory: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
    pub max_redirects: usize,
    pub connect_timeout_secs: u64,
    /// Applies to job requests only; model transfers can take arbitrarily long.
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8000/api".to_string(),
            auth_token: None,
            manifest_path: PathBuf::from("models-data").join("manifest.json"),
            remote_manifest_url: None,
            models_directory: None,
            poll_interval_ms: 700,
            poll_max_attempts: 600,
            max_redirects: crate::models::download::DEFAULT_MAX_REDIRECTS,
            connect_timeout_secs: 30,
            request_timeout_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load the user config, writing the defaults on first run.
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Self::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        crate::utils::files::safe_write(config_path, content.as_bytes())?;

        tracing::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        Ok(config_dir.join(CONFIG_DIR_NAME).join("config.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if !is_http_url(&self.backend_url) {
            return Err(anyhow::anyhow!(
                "Backend URL must be http(s): {}",
                self.backend_url
            ));
        }

        if let Some(url) = &self.remote_manifest_url {
            if !is_http_url(url) {
                return Err(anyhow::anyhow!("Remote manifest URL must be http(s): {}", url));
            }
        }

        if self.poll_max_attempts == 0 {
            return Err(anyhow::anyhow!("Poll attempts must be greater than 0"));
        }

        if self.max_redirects == 0 {
            return Err(anyhow::anyhow!("Redirect limit must be greater than 0"));
        }

        Ok(())
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            max_attempts: self.poll_max_attempts,
            interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    /// Client for model transfers and manifest fetches.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        http_client(
            self.max_redirects,
            Duration::from_secs(self.connect_timeout_secs),
        )
        .context("building HTTP client")
    }

    pub fn downloader(&self) -> Result<Downloader> {
        Ok(Downloader::new(self.http_client()?))
    }

    pub fn job_client(&self) -> Result<JobClient> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .build()
            .context("building backend client")?;
        Ok(JobClient::with_client(http, self.backend_url.clone()).with_token(self.auth_token.clone()))
    }
}

fn is_http_url(url: &str) -> bool {
    let lower = url.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
