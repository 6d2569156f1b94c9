//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Playback state machine and replay engine."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
//! The replay core: per-session playback state, the pre-fetch buffer, and
//! the engine that walks logical session time under client control.
//!
//! Many concurrent subscribers to one session share a single
//! [`session::ReplaySession`]; the engine serialises all mutation behind a
//! per-session lock and keeps store I/O outside of it.

pub mod engine;
pub mod pacing;
pub mod playback;
pub mod session;

pub use engine::{ReplayEngine, ReplayEvent};
pub use pacing::BatchPacer;
pub use playback::{
    DisconnectedState, PlaybackSpeed, PlaybackState, PlaybackStatus, TelemetryBatch,
};
