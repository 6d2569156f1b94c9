//! ---
//! pdk_section: "05-networking-external-interfaces"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Network playback surface and REST sidecar."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
//! Read-mostly REST sidecar: session discovery plus playback-control
//! aliases over the same engine operations the WebSocket surface uses.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use paddock_common::time::parse_instant;
use paddock_common::ReplayError;
use paddock_replay::{PlaybackSpeed, ReplayEngine};
use paddock_store::SessionCatalog;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct RestState {
    engine: Arc<ReplayEngine>,
    catalog: Arc<SessionCatalog>,
}

/// Builder used to configure and spawn the REST sidecar.
pub struct RestApiBuilder {
    listen: SocketAddr,
    engine: Arc<ReplayEngine>,
    catalog: Arc<SessionCatalog>,
}

impl RestApiBuilder {
    pub fn new(
        listen: SocketAddr,
        engine: Arc<ReplayEngine>,
        catalog: Arc<SessionCatalog>,
    ) -> Self {
        Self {
            listen,
            engine,
            catalog,
        }
    }

    /// Spawn the REST server and return a handle that can be awaited for
    /// shutdown.
    pub async fn spawn(self) -> anyhow::Result<RestApiHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "rest api listening");

        let state = Arc::new(RestState {
            engine: self.engine,
            catalog: self.catalog,
        });
        let router = Router::new()
            .route("/api/sessions", get(list_sessions))
            .route("/api/sessions/:session_key", get(get_session))
            .route("/api/sessions/:session_key/status", get(session_status))
            .route("/api/sessions/:session_key/refresh", post(refresh_session))
            .route("/api/replay/:session_key/play", post(play))
            .route("/api/replay/:session_key/pause", post(pause))
            .route("/api/replay/:session_key/stop", post(stop))
            .route("/api/replay/:session_key/seek", post(seek))
            .route("/api/replay/:session_key/speed", post(set_speed))
            .route("/api/replay/:session_key/state", get(replay_state))
            .with_state(state);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        let task = tokio::spawn(async move {
            if let Err(err) = server.await {
                warn!(error = %err, "rest api server exited with error");
            }
        });

        Ok(RestApiHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle returned from [`RestApiBuilder::spawn`].
pub struct RestApiHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RestApiHandle {
    /// Retrieve the socket address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Request graceful shutdown and wait for the server task to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::anyhow!(err)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayRequest {
    #[serde(default)]
    start_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeekRequest {
    target_time: String,
}

#[derive(Debug, Deserialize)]
struct SpeedRequest {
    speed: f64,
}

async fn list_sessions(State(state): State<Arc<RestState>>) -> Response {
    Json(state.catalog.list()).into_response()
}

async fn get_session(
    State(state): State<Arc<RestState>>,
    Path(session_key): Path<String>,
) -> Response {
    match state.catalog.get(&session_key) {
        Some(info) => Json(info).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn session_status(
    State(state): State<Arc<RestState>>,
    Path(session_key): Path<String>,
) -> Response {
    if !state.catalog.exists(&session_key) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let has_data = state.catalog.has_data(&session_key).await;
    Json(json!({ "sessionKey": session_key, "hasData": has_data })).into_response()
}

async fn refresh_session(
    State(state): State<Arc<RestState>>,
    Path(session_key): Path<String>,
) -> Response {
    match state.catalog.refresh(&session_key).await {
        Some(info) => Json(info).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn play(
    State(state): State<Arc<RestState>>,
    Path(session_key): Path<String>,
    body: Option<Json<PlayRequest>>,
) -> Response {
    let start_time = match body.as_ref().and_then(|request| request.start_time.as_deref()) {
        Some(raw) => match parse_instant(raw) {
            Some(instant) => Some(instant),
            None => return bad_request("Invalid startTime"),
        },
        None => None,
    };
    info!(session = %session_key, "play requested");
    respond(&session_key, state.engine.play(&session_key, start_time).await)
}

async fn pause(
    State(state): State<Arc<RestState>>,
    Path(session_key): Path<String>,
) -> Response {
    info!(session = %session_key, "pause requested");
    respond(&session_key, state.engine.pause(&session_key))
}

async fn stop(State(state): State<Arc<RestState>>, Path(session_key): Path<String>) -> Response {
    info!(session = %session_key, "stop requested");
    respond(&session_key, state.engine.stop(&session_key))
}

async fn seek(
    State(state): State<Arc<RestState>>,
    Path(session_key): Path<String>,
    Json(request): Json<SeekRequest>,
) -> Response {
    let Some(target) = parse_instant(&request.target_time) else {
        return bad_request("Invalid targetTime");
    };
    info!(session = %session_key, target = %target, "seek requested");
    respond(&session_key, state.engine.seek(&session_key, target).await)
}

async fn set_speed(
    State(state): State<Arc<RestState>>,
    Path(session_key): Path<String>,
    Json(request): Json<SpeedRequest>,
) -> Response {
    info!(session = %session_key, speed = request.speed, "speed change requested");
    let result = PlaybackSpeed::from_multiplier(request.speed)
        .and_then(|speed| state.engine.set_speed(&session_key, speed));
    respond(&session_key, result)
}

async fn replay_state(
    State(state): State<Arc<RestState>>,
    Path(session_key): Path<String>,
) -> Response {
    match state.engine.get_state(&session_key) {
        Some(playback) => Json(playback).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn respond(
    session_key: &str,
    result: Result<paddock_replay::PlaybackState, ReplayError>,
) -> Response {
    match result {
        Ok(playback) => Json(playback).into_response(),
        Err(err) => replay_error_response(session_key, err),
    }
}

fn replay_error_response(session_key: &str, err: ReplayError) -> Response {
    match &err {
        ReplayError::UnknownSession(_) => {
            warn!(session = %session_key, error = %err, "request for unknown session");
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": err.client_message() })),
            )
                .into_response()
        }
        ReplayError::Internal(_) => {
            error!(session = %session_key, error = ?err, "request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.client_message() })),
            )
                .into_response()
        }
        _ => {
            warn!(session = %session_key, error = %err, "request rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": err.client_message() })),
            )
                .into_response()
        }
    }
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message })),
    )
        .into_response()
}
