//! ---
//! pdk_section: "05-networking-external-interfaces"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Network playback surface and REST sidecar."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
//! JSON wire codec for the playback protocol.
//!
//! Every frame is `{"type": <string>, "data": <object?>}`. Decoding
//! validates the command set and required sub-fields; encoding produces the
//! event frames of the protocol.

use chrono::{DateTime, Utc};
use paddock_common::time::parse_instant;
use paddock_common::ReplayError;
use paddock_replay::{PlaybackState, TelemetryBatch};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
}

/// A validated inbound command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
    Subscribe,
    Unsubscribe,
    Play { start_time: Option<DateTime<Utc>> },
    Pause,
    Stop,
    Seek { target_time: DateTime<Utc> },
    Speed { multiplier: f64 },
    GetState,
}

/// Decode and validate one inbound frame.
pub fn decode_command(text: &str) -> Result<ClientCommand, ReplayError> {
    let frame: Frame = serde_json::from_str(text)
        .map_err(|_| ReplayError::BadFrame("Invalid message format".to_owned()))?;

    match frame.kind.to_ascii_uppercase().as_str() {
        "SUBSCRIBE" => Ok(ClientCommand::Subscribe),
        "UNSUBSCRIBE" => Ok(ClientCommand::Unsubscribe),
        "PLAY" => Ok(ClientCommand::Play {
            start_time: optional_instant(frame.data.as_ref(), "startTime")?,
        }),
        "PAUSE" => Ok(ClientCommand::Pause),
        "STOP" => Ok(ClientCommand::Stop),
        "SEEK" => Ok(ClientCommand::Seek {
            target_time: required_instant(frame.data.as_ref(), "targetTime")?,
        }),
        "SPEED" => Ok(ClientCommand::Speed {
            multiplier: required_number(frame.data.as_ref(), "speed")?,
        }),
        "GET_STATE" => Ok(ClientCommand::GetState),
        other => Err(ReplayError::BadFrame(format!("Unknown command: {other}"))),
    }
}

fn optional_instant(
    data: Option<&Value>,
    field: &str,
) -> Result<Option<DateTime<Utc>>, ReplayError> {
    let Some(raw) = data.and_then(|value| value.get(field)) else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let text = raw
        .as_str()
        .ok_or_else(|| ReplayError::BadFrame(format!("Field {field} must be a string")))?;
    parse_instant(text)
        .map(Some)
        .ok_or_else(|| ReplayError::BadFrame(format!("Field {field} is not a valid timestamp")))
}

fn required_instant(data: Option<&Value>, field: &str) -> Result<DateTime<Utc>, ReplayError> {
    optional_instant(data, field)?
        .ok_or_else(|| ReplayError::BadFrame(format!("Missing required field {field}")))
}

fn required_number(data: Option<&Value>, field: &str) -> Result<f64, ReplayError> {
    data.and_then(|value| value.get(field))
        .and_then(Value::as_f64)
        .ok_or_else(|| ReplayError::BadFrame(format!("Missing required field {field}")))
}

fn frame(kind: &str, data: Value) -> String {
    json!({ "type": kind, "data": data }).to_string()
}

pub fn replay_state_event(state: Option<&PlaybackState>) -> String {
    let data = state
        .map(|state| serde_json::to_value(state).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    frame("REPLAY_STATE", data)
}

pub fn telemetry_batch_event(batch: &TelemetryBatch) -> String {
    frame(
        "TELEMETRY_BATCH",
        serde_json::to_value(batch).unwrap_or(Value::Null),
    )
}

pub fn subscribed_event(session_key: &str) -> String {
    frame("SUBSCRIBED", json!({ "sessionKey": session_key }))
}

pub fn unsubscribed_event() -> String {
    frame("UNSUBSCRIBED", Value::Null)
}

pub fn playback_complete_event() -> String {
    frame("PLAYBACK_COMPLETE", Value::Null)
}

pub fn error_event(message: &str) -> String {
    frame("ERROR", json!({ "message": message }))
}
