//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Playback state machine and replay engine."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use paddock_common::ReplayError;
use paddock_store::{CarSample, LocationSample};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Closed set of supported playback rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackSpeed {
    #[default]
    Normal,
    Double,
    Fast,
    SuperFast,
}

impl PlaybackSpeed {
    /// Ratio of logical session time to wall-clock time.
    pub fn multiplier(self) -> f64 {
        match self {
            Self::Normal => 1.0,
            Self::Double => 2.0,
            Self::Fast => 5.0,
            Self::SuperFast => 10.0,
        }
    }

    /// Map a requested multiplier onto the closed enumeration.
    pub fn from_multiplier(multiplier: f64) -> Result<Self, ReplayError> {
        if multiplier == 1.0 {
            Ok(Self::Normal)
        } else if multiplier == 2.0 {
            Ok(Self::Double)
        } else if multiplier == 5.0 {
            Ok(Self::Fast)
        } else if multiplier == 10.0 {
            Ok(Self::SuperFast)
        } else {
            Err(ReplayError::InvalidSpeed(multiplier))
        }
    }
}

// On the wire a speed travels as `{"multiplier": 2.0}`.
#[derive(Serialize, Deserialize)]
struct SpeedOnWire {
    multiplier: f64,
}

impl Serialize for PlaybackSpeed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SpeedOnWire {
            multiplier: self.multiplier(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PlaybackSpeed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = SpeedOnWire::deserialize(deserializer)?;
        Self::from_multiplier(wire.multiplier).map_err(D::Error::custom)
    }
}

/// Lifecycle of a replay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackStatus {
    Idle,
    Playing,
    Paused,
    Stopped,
    Completed,
}

/// Snapshot of one session's playback handed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub session_key: String,
    pub status: PlaybackStatus,
    pub current_time: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub speed: PlaybackSpeed,
    pub duration_ms: i64,
    pub elapsed_ms: i64,
}

/// One contiguous half-open window of samples shipped in a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryBatch {
    pub batch_timestamp: DateTime<Utc>,
    pub locations: Vec<LocationSample>,
    pub car_data: Vec<CarSample>,
}

/// Playback position preserved after the last subscriber leaves, so a
/// reconnecting client can resume where it left off.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectedState {
    pub current_time: DateTime<Utc>,
    pub speed: PlaybackSpeed,
    pub disconnected_at: DateTime<Utc>,
}
