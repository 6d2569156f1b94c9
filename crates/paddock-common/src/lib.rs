//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Shared primitives and utilities for the replay runtime."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
//! Core shared primitives for the paddock replay workspace.
//! This crate exposes configuration loading, logging, timestamp handling,
//! and the error kinds surfaced to replay clients.

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use config::{
    ApiConfig, AppConfig, BatchConfig, BufferConfig, LoadedAppConfig, LoggingConfig,
    MetricsConfig, RedisConfig, ReplayConfig, SessionConfig, WsConfig,
};
pub use error::ReplayError;
pub use logging::{init_tracing, LogFormat};
