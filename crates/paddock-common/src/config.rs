//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Shared primitives and utilities for the replay runtime."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_batch_interval_ms() -> u64 {
    100
}

fn default_buffer_duration_seconds() -> u64 {
    30
}

fn default_state_retention_minutes() -> u64 {
    5
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

fn default_redis_pool_size() -> usize {
    8
}

fn default_redis_read_timeout() -> Duration {
    Duration::from_millis(2000)
}

fn default_ws_listen() -> SocketAddr {
    "0.0.0.0:8081".parse().expect("valid default ws address")
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("valid default api address")
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9898"
        .parse()
        .expect("valid default metrics address")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for the paddock daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub ws: WsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sessions: Vec<SessionConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "PADDOCK_CONFIG";

    /// Load configuration from disk, respecting the `PADDOCK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    /// Parse and validate a single configuration file.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read configuration file {}", path.display()))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("invalid configuration file {}", path.display()))?;
        config.validate()?;
        debug!(path = %path.display(), sessions = config.sessions.len(), "configuration parsed");
        Ok(config)
    }

    /// Reject configurations the daemon cannot serve. Invalid configuration
    /// is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.replay.batch.interval_ms == 0 {
            return Err(anyhow!("replay.batch.interval_ms must be positive"));
        }
        if self.replay.buffer.duration_seconds == 0 {
            return Err(anyhow!("replay.buffer.duration_seconds must be positive"));
        }
        let mut seen = HashSet::new();
        for session in &self.sessions {
            if session.key.trim().is_empty() {
                return Err(anyhow!("session entry with empty key"));
            }
            if !seen.insert(session.key.as_str()) {
                return Err(anyhow!("duplicate session key: {}", session.key));
            }
            if session.date_start >= session.date_end {
                return Err(anyhow!(
                    "session {}: date_start must precede date_end",
                    session.key
                ));
            }
        }
        Ok(())
    }
}

/// Replay pacing and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default = "default_state_retention_minutes")]
    pub state_retention_minutes: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            buffer: BufferConfig::default(),
            state_retention_minutes: default_state_retention_minutes(),
        }
    }
}

/// Wall-clock cadence of outbound telemetry batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_interval_ms")]
    pub interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_batch_interval_ms(),
        }
    }
}

/// How far ahead of the playback clock the pre-fetch buffer reaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_duration_seconds")]
    pub duration_seconds: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            duration_seconds: default_buffer_duration_seconds(),
        }
    }
}

/// Connection settings for the telemetry stream store.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(
        rename = "read_timeout_ms",
        default = "default_redis_read_timeout"
    )]
    pub read_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            read_timeout: default_redis_read_timeout(),
        }
    }
}

/// WebSocket listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsConfig {
    #[serde(default = "default_ws_listen")]
    pub listen: SocketAddr,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            listen: default_ws_listen(),
        }
    }
}

/// REST sidecar settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

/// Prometheus exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// One replayable session as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub key: String,
    pub name: String,
    pub date_start: DateTime<Utc>,
    pub date_end: DateTime<Utc>,
}
