//! Processing backends
//!
//! Every backend turns a [`SubmissionRequest`] into a [`Job`] and reports on it
//! when polled:
//! - HTTP job service (multipart start + status polling)
//! - Offline demo backend that simulates progress locally

pub mod demo;
pub mod http;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use demo::{DemoBackend, DemoConfig};
pub use http::{resolve_artifact_uri, HttpBackend, UploadObserver};

use crate::job::{Job, JobId};
use crate::submission::SubmissionRequest;

/// Backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Remote job service
    Http,
    /// Local simulation, no network
    Demo,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Demo => write!(f, "demo"),
        }
    }
}

/// Coarse classification of a [`GatewayError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    Network,
    Server,
    Parse,
}

/// Failure of a single backend call. Backends never retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Transport failure: connect, timeout, interrupted body
    #[error("Network error: {0}")]
    Network(String),

    /// Backend answered with a non-success status or refused the job
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Backend answered with something we could not understand
    #[error("Invalid response: {0}")]
    Parse(String),
}

impl GatewayError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn kind(&self) -> GatewayErrorKind {
        match self {
            Self::Network(_) => GatewayErrorKind::Network,
            Self::Server { .. } => GatewayErrorKind::Server,
            Self::Parse(_) => GatewayErrorKind::Parse,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::server(status.as_u16(), err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Processing backend trait
#[async_trait::async_trait]
pub trait ProcessingBackend: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    /// Backend type
    fn backend_type(&self) -> BackendType;

    /// Start processing. Returns a completed job when the backend answered
    /// synchronously, otherwise a pending job carrying an id to poll.
    async fn start_job(&self, req: &SubmissionRequest) -> Result<Job, GatewayError>;

    /// Fetch the current state of a started job
    async fn poll_job(&self, id: &JobId) -> Result<Job, GatewayError>;
}

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend type
    pub backend_type: BackendType,

    /// Base URL of the job service, e.g. `https://api.example.com/api`
    #[serde(default)]
    pub api_url: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Delay before each status check
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up after this many status checks; unbounded when absent
    #[serde(default)]
    pub max_poll_attempts: Option<u32>,

    /// Multiplier applied to the delay after every status check
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Upper bound for the delay once backoff kicks in
    #[serde(default)]
    pub max_poll_interval_ms: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_backoff_factor() -> f64 {
    1.0
}

impl BackendConfig {
    /// Create new backend config
    pub fn new(backend_type: BackendType) -> Self {
        Self {
            backend_type,
            api_url: None,
            request_timeout_secs: Some(300),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: None,
            backoff_factor: default_backoff_factor(),
            max_poll_interval_ms: None,
        }
    }

    /// With API endpoint
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    /// With request timeout
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    /// With poll interval
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// With poll attempt ceiling
    pub fn with_max_poll_attempts(mut self, max: u32) -> Self {
        self.max_poll_attempts = Some(max);
        self
    }

    /// With exponential backoff between polls
    pub fn with_backoff(mut self, factor: f64, max_interval_ms: u64) -> Self {
        self.backoff_factor = factor;
        self.max_poll_interval_ms = Some(max_interval_ms);
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// Overlay `CLIPSMITH_*` environment variables
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(url) = std::env::var("CLIPSMITH_API_URL") {
            if !url.trim().is_empty() {
                self.api_url = Some(url.trim().to_string());
            }
        }
        if let Ok(ms) = std::env::var("CLIPSMITH_POLL_INTERVAL_MS") {
            self.poll_interval_ms = ms
                .trim()
                .parse()
                .context("CLIPSMITH_POLL_INTERVAL_MS must be an integer")?;
        }
        if let Ok(max) = std::env::var("CLIPSMITH_MAX_POLL_ATTEMPTS") {
            self.max_poll_attempts = Some(
                max.trim()
                    .parse()
                    .context("CLIPSMITH_MAX_POLL_ATTEMPTS must be an integer")?,
            );
        }
        Ok(self)
    }

    /// Save configuration to JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Load configuration from JSON
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new(BackendType::Http)
    }
}

/// Backend factory for creating backend instances
pub struct BackendFactory;

impl BackendFactory {
    /// Create backend from config
    pub fn create(config: &BackendConfig) -> Result<Box<dyn ProcessingBackend>> {
        match config.backend_type {
            BackendType::Http => Ok(Box::new(HttpBackend::new(config)?)),
            BackendType::Demo => Ok(Box::new(DemoBackend::new(DemoConfig::default()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_config() {
        let config = BackendConfig::new(BackendType::Http)
            .with_api_url("http://localhost:8000/api")
            .with_max_poll_attempts(30)
            .with_backoff(1.5, 10_000);

        assert_eq!(config.api_url.as_deref(), Some("http://localhost:8000/api"));
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.max_poll_attempts, Some(30));
        assert_eq!(config.max_poll_interval_ms, Some(10_000));
    }

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: BackendConfig = serde_json::from_str(r#"{"backend_type":"demo"}"#).unwrap();
        assert_eq!(config.backend_type, BackendType::Demo);
        assert_eq!(config.poll_interval_ms, 2000);
        assert_eq!(config.backoff_factor, 1.0);
        assert!(config.max_poll_attempts.is_none());
    }

    #[test]
    fn test_config_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("clipsmith.json");

        let config = BackendConfig::new(BackendType::Http)
            .with_api_url("https://api.example.com")
            .with_poll_interval_ms(500);
        config.save(&path).unwrap();

        assert_eq!(BackendConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = BackendConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("invalid config file"));
    }

    #[test]
    fn test_backend_type_display() {
        assert_eq!(BackendType::Http.to_string(), "http");
        assert_eq!(BackendType::Demo.to_string(), "demo");
    }

    #[test]
    fn test_factory() {
        let demo = BackendFactory::create(&BackendConfig::new(BackendType::Demo)).unwrap();
        assert_eq!(demo.backend_type(), BackendType::Demo);

        let http = BackendFactory::create(
            &BackendConfig::new(BackendType::Http).with_api_url("http://api"),
        )
        .unwrap();
        assert_eq!(http.backend_type(), BackendType::Http);

        assert!(BackendFactory::create(&BackendConfig::new(BackendType::Http)).is_err());
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(GatewayError::network("down").kind(), GatewayErrorKind::Network);
        assert_eq!(GatewayError::server(502, "bad").kind(), GatewayErrorKind::Server);
        assert_eq!(GatewayError::parse("junk").kind(), GatewayErrorKind::Parse);
        assert_eq!(
            GatewayError::server(500, "boom").to_string(),
            "Server error (500): boom"
        );
    }
}
