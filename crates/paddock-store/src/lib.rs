//! ---
//! pdk_section: "02-stream-store"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Stream store adapter and session catalog."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
//! Read-side adapter over the external telemetry stream store, plus the
//! catalog of replayable sessions.
//!
//! The ingestion producer appends records to Redis Streams; this crate only
//! ever reads. All range semantics are by the `timestamp` field carried in
//! each record's payload, never by the stream's native record id.

pub mod catalog;
pub mod memory;
pub mod records;
pub mod stream;

pub use catalog::{SessionCatalog, SessionInfo};
pub use memory::MemoryTelemetryStore;
pub use records::{CarSample, LocationSample};
pub use stream::{cardata_stream_key, location_stream_key, RedisTelemetryStore, TelemetryStore};
