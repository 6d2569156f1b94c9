//! ---
//! pdk_section: "05-networking-external-interfaces"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Network playback surface and REST sidecar."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
//! The client-facing surface of the replay server: the WebSocket playback
//! protocol and the read-mostly REST sidecar. Both are thin over the
//! replay engine; all playback semantics live in `paddock-replay`.

pub mod protocol;
pub mod rest;
pub mod websocket;

pub use rest::{RestApiBuilder, RestApiHandle};
pub use websocket::{WsServerBuilder, WsServerHandle};
