//! ---
//! pdk_section: "05-networking-external-interfaces"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Network playback surface and REST sidecar."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use paddock_replay::{PlaybackSpeed, ReplayEngine, ReplayEvent};
use paddock_store::SessionCatalog;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::protocol::{
    decode_command, error_event, playback_complete_event, replay_state_event, subscribed_event,
    telemetry_batch_event, unsubscribed_event, ClientCommand,
};

struct WsState {
    engine: Arc<ReplayEngine>,
    catalog: Arc<SessionCatalog>,
    shutdown: watch::Receiver<bool>,
}

/// Builder for the WebSocket server that serves the playback protocol at
/// `/ws/telemetry/{sessionKey}`.
pub struct WsServerBuilder {
    listen: SocketAddr,
    engine: Arc<ReplayEngine>,
    catalog: Arc<SessionCatalog>,
}

impl WsServerBuilder {
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

    /// Spawn the WebSocket server and return a shutdown handle.
    pub async fn spawn(self) -> anyhow::Result<WsServerHandle> {
        let listener = TcpListener::bind(self.listen).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "websocket server listening");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(WsState {
            engine: self.engine,
            catalog: self.catalog,
            shutdown: shutdown_rx.clone(),
        });

        let app = Router::new()
            .route("/ws/telemetry/:session_key", get(upgrade_handler))
            .with_state(state);

        let mut server_shutdown = shutdown_rx;
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "websocket server exited with error");
            }
        });

        Ok(WsServerHandle {
            address: local_addr,
            shutdown: shutdown_tx,
            task,
        })
    }
}

/// Handle for the running WebSocket server.
pub struct WsServerHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WsServerHandle {
    /// Return the bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Drain clients, trigger graceful shutdown, and await completion.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(()) => Ok(()),
            Err(err) => Err(anyhow::anyhow!(err)),
        }
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    Path(session_key): Path<String>,
    State(state): State<Arc<WsState>>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| client_session(socket, session_key, state))
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// One logical client session: decode inbound commands, dispatch them to
/// the engine, and forward the session's event stream while subscribed.
async fn client_session(socket: WebSocket, session_key: String, state: Arc<WsState>) {
    let (mut sink, stream) = socket.split();

    if !state.catalog.exists(&session_key) {
        warn!(session = %session_key, "connection for unknown session rejected");
        let _ = sink
            .send(Message::Text(error_event(&format!(
                "Session not found: {session_key}"
            ))))
            .await;
        let _ = sink.close().await;
        return;
    }

    state.engine.register_client(&session_key);
    info!(session = %session_key, "websocket client connected");

    // Initial state, if any replay (live or preserved) exists.
    if let Some(current) = state.engine.get_state(&session_key) {
        if sink
            .send(Message::Text(replay_state_event(Some(&current))))
            .await
            .is_err()
        {
            state.engine.on_client_left(&session_key);
            return;
        }
    }

    run_client_loop(&state, &session_key, &mut sink, stream).await;

    state.engine.on_client_left(&session_key);
    info!(session = %session_key, "websocket client disconnected");
}

async fn run_client_loop(
    state: &Arc<WsState>,
    session_key: &str,
    sink: &mut WsSink,
    mut stream: WsStream,
) {
    let mut events = state.engine.subscribe(session_key);
    let mut shutdown = state.shutdown.clone();
    let mut streaming = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ReplayEvent::Batch(batch)) => {
                    if streaming
                        && sink
                            .send(Message::Text(telemetry_batch_event(&batch)))
                            .await
                            .is_err()
                    {
                        break;
                    }
                }
                Ok(ReplayEvent::Completed) => {
                    if streaming {
                        streaming = false;
                        if sink
                            .send(Message::Text(playback_complete_event()))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(session = %session_key, skipped, "client fell behind; batches dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            message = stream.next() => {
                let Some(Ok(message)) = message else {
                    break;
                };
                match message {
                    Message::Text(text) => {
                        if handle_frame(state, session_key, &text, sink, &mut streaming)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        if sink
                            .send(Message::Text(error_event("Binary frames unsupported")))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => break,
                }
            },
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Text(error_event("Server shutting down"))).await;
                let _ = sink.close().await;
                break;
            }
        }
    }
}

/// Dispatch one inbound frame. A malformed frame produces an `ERROR` event
/// and keeps the connection open; `Err` here means the socket write failed.
async fn handle_frame(
    state: &Arc<WsState>,
    session_key: &str,
    text: &str,
    sink: &mut WsSink,
    streaming: &mut bool,
) -> Result<(), ()> {
    let command = match decode_command(text) {
        Ok(command) => command,
        Err(err) => {
            warn!(session = %session_key, error = %err, "invalid frame");
            return send(sink, error_event(&err.client_message())).await;
        }
    };

    let reply = match command {
        ClientCommand::Subscribe => {
            *streaming = true;
            subscribed_event(session_key)
        }
        ClientCommand::Unsubscribe => {
            *streaming = false;
            unsubscribed_event()
        }
        ClientCommand::Play { start_time } => {
            match state.engine.play(session_key, start_time).await {
                Ok(playback) => {
                    *streaming = true;
                    replay_state_event(Some(&playback))
                }
                Err(err) => engine_error_event(session_key, &err),
            }
        }
        ClientCommand::Pause => match state.engine.pause(session_key) {
            Ok(playback) => {
                *streaming = false;
                replay_state_event(Some(&playback))
            }
            Err(err) => engine_error_event(session_key, &err),
        },
        ClientCommand::Stop => match state.engine.stop(session_key) {
            Ok(playback) => {
                *streaming = false;
                replay_state_event(Some(&playback))
            }
            Err(err) => engine_error_event(session_key, &err),
        },
        ClientCommand::Seek { target_time } => {
            match state.engine.seek(session_key, target_time).await {
                Ok(playback) => replay_state_event(Some(&playback)),
                Err(err) => engine_error_event(session_key, &err),
            }
        }
        ClientCommand::Speed { multiplier } => {
            match PlaybackSpeed::from_multiplier(multiplier)
                .and_then(|speed| state.engine.set_speed(session_key, speed))
            {
                Ok(playback) => replay_state_event(Some(&playback)),
                Err(err) => engine_error_event(session_key, &err),
            }
        }
        ClientCommand::GetState => {
            replay_state_event(state.engine.get_state(session_key).as_ref())
        }
    };
    send(sink, reply).await
}

fn engine_error_event(session_key: &str, err: &paddock_common::ReplayError) -> String {
    if err.is_client_error() {
        warn!(session = %session_key, error = %err, "command rejected");
    } else {
        error!(session = %session_key, error = ?err, "command failed");
    }
    error_event(&err.client_message())
}

async fn send(sink: &mut WsSink, text: String) -> Result<(), ()> {
    sink.send(Message::Text(text)).await.map_err(|_| ())
}
