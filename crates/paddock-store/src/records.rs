//! ---
//! pdk_section: "02-stream-store"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Stream store adapter and session catalog."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded car position. Immutable once emitted by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub session_key: i64,
    pub driver_number: u32,
    pub timestamp: DateTime<Utc>,
    pub x: f64,
    pub y: f64,
}

/// One recorded car performance sample. Immutable once emitted by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarSample {
    pub session_key: i64,
    pub driver_number: u32,
    pub timestamp: DateTime<Utc>,
    pub speed: i32,
    pub rpm: i32,
    pub gear: i32,
    pub throttle: i32,
    pub brake: i32,
}
