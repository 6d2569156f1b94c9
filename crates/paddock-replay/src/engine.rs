//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Playback state machine and replay engine."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use paddock_common::config::ReplayConfig;
use paddock_common::time::millis_between;
use paddock_common::ReplayError;
use paddock_metrics::ReplayMetrics;
use paddock_store::catalog::SessionCatalog;
use paddock_store::TelemetryStore;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::pacing::BatchPacer;
use crate::playback::{
    DisconnectedState, PlaybackSpeed, PlaybackState, PlaybackStatus, TelemetryBatch,
};
use crate::session::ReplaySession;

type SharedSession = Arc<Mutex<ReplaySession>>;

/// Below this much pre-fetched session time a tick triggers a background
/// refill.
const LOW_WATER_MS: i64 = 10_000;

const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// Outbound events of one replay session, fanned out to every subscriber so
/// that all clients watching a session see the same stream.
#[derive(Debug, Clone)]
pub enum ReplayEvent {
    Batch(TelemetryBatch),
    Completed,
}

/// Owns every live [`ReplaySession`] plus the preserved state of recently
/// disconnected ones.
///
/// Batch production is driven by one ticker per playing session; clients
/// receive batches through [`ReplayEngine::subscribe`]. Store I/O (refills)
/// always runs outside the per-session lock; the lock scopes only in-memory
/// mutation, so tick callbacks stay short.
pub struct ReplayEngine {
    store: Arc<dyn TelemetryStore>,
    catalog: Arc<SessionCatalog>,
    config: ReplayConfig,
    active: RwLock<HashMap<String, SharedSession>>,
    disconnected: RwLock<HashMap<String, DisconnectedState>>,
    subscribers: RwLock<HashMap<String, usize>>,
    channels: RwLock<HashMap<String, broadcast::Sender<ReplayEvent>>>,
    metrics: Option<ReplayMetrics>,
}

impl ReplayEngine {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        catalog: Arc<SessionCatalog>,
        config: ReplayConfig,
        metrics: Option<ReplayMetrics>,
    ) -> Self {
        Self {
            store,
            catalog,
            config,
            active: RwLock::new(HashMap::new()),
            disconnected: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            channels: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Wall-clock cadence at which batches are produced.
    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.config.batch.interval_ms)
    }

    /// Receive the event stream for a session key. All receivers of one key
    /// observe identical events; a slow receiver lags and drops the oldest.
    pub fn subscribe(&self, session_key: &str) -> broadcast::Receiver<ReplayEvent> {
        self.channels
            .write()
            .entry(session_key.to_owned())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    /// Start or resume playback.
    ///
    /// Without an explicit `start_time`, a fresh disconnected state wins;
    /// otherwise playback starts at `start_time` or the session start.
    pub async fn play(
        self: &Arc<Self>,
        session_key: &str,
        start_time: Option<DateTime<Utc>>,
    ) -> Result<PlaybackState, ReplayError> {
        let info = self
            .catalog
            .get(session_key)
            .ok_or_else(|| ReplayError::UnknownSession(session_key.to_owned()))?;
        if let Some(requested) = start_time {
            if requested < info.date_start || requested > info.date_end {
                return Err(ReplayError::InvalidTime(
                    "Start time outside session bounds".to_owned(),
                ));
            }
        }

        let existing = self.active.read().get(session_key).cloned();
        let handle = match existing {
            Some(handle) => handle,
            None => {
                let preserved = self.disconnected.write().remove(session_key);
                let resume =
                    preserved.filter(|state| start_time.is_none() && self.is_fresh(state));
                let (origin, speed) = match &resume {
                    Some(state) => (state.current_time, state.speed),
                    None => (start_time.unwrap_or(info.date_start), PlaybackSpeed::default()),
                };
                if resume.is_some() {
                    info!(session = session_key, origin = %origin, "resuming playback from preserved state");
                } else {
                    info!(session = session_key, origin = %origin, "starting playback");
                }

                let created: SharedSession = Arc::new(Mutex::new(ReplaySession::new(
                    session_key,
                    origin,
                    info.date_start,
                    info.date_end,
                    speed,
                )));
                // The client expects an immediate first batch, so the
                // initial fill happens before the session goes live.
                refill_session(self.store.clone(), session_key, &created, self.buffer_span())
                    .await;
                // A concurrent play for the same key may have won the race
                // while the fill ran; whichever session is in the map is
                // the session.
                let (handle, count) = {
                    let mut active = self.active.write();
                    let handle = active
                        .entry(session_key.to_owned())
                        .or_insert_with(|| created.clone())
                        .clone();
                    (handle, active.len())
                };
                if let Some(metrics) = &self.metrics {
                    metrics.set_active_sessions(count);
                }
                handle
            }
        };

        {
            let mut session = handle.lock();
            session.set_status(PlaybackStatus::Playing);
            self.ensure_ticker(&handle, &mut session);
        }
        Ok(Self::snapshot(&handle))
    }

    /// Pause playback, keeping the session and its buffer.
    pub fn pause(&self, session_key: &str) -> Result<PlaybackState, ReplayError> {
        let handle = self.active_handle(session_key)?;
        {
            let mut session = handle.lock();
            session.set_status(PlaybackStatus::Paused);
            Self::cancel_ticker(&mut session);
            info!(session = session_key, at = %session.current_time(), "playback paused");
        }
        Ok(Self::snapshot(&handle))
    }

    /// Stop playback and drop the session.
    pub fn stop(&self, session_key: &str) -> Result<PlaybackState, ReplayError> {
        let (handle, count) = {
            let mut active = self.active.write();
            let handle = active
                .remove(session_key)
                .ok_or_else(|| ReplayError::NoActiveSession(session_key.to_owned()))?;
            (handle, active.len())
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_active_sessions(count);
        }
        {
            let mut session = handle.lock();
            session.set_status(PlaybackStatus::Stopped);
            Self::cancel_ticker(&mut session);
        }
        info!(session = session_key, "playback stopped");
        Ok(Self::snapshot(&handle))
    }

    /// Move the playback clock. Status is preserved; the buffer is cleared
    /// and synchronously refilled from the target position.
    pub async fn seek(
        &self,
        session_key: &str,
        target: DateTime<Utc>,
    ) -> Result<PlaybackState, ReplayError> {
        let handle = self.active_handle(session_key)?;
        {
            let mut session = handle.lock();
            if target < session.date_start() || target > session.date_end() {
                return Err(ReplayError::InvalidTime(
                    "Target time outside session bounds".to_owned(),
                ));
            }
            session.set_current_time(target);
            session.clear();
        }
        refill_session(
            self.store.clone(),
            session_key,
            &handle,
            self.buffer_span(),
        )
        .await;
        info!(session = session_key, target = %target, "seeked");
        Ok(Self::snapshot(&handle))
    }

    /// Change the playback rate. While playing, the ticker is rescheduled;
    /// the tick period itself never changes, only the logical window each
    /// tick covers.
    pub fn set_speed(
        self: &Arc<Self>,
        session_key: &str,
        speed: PlaybackSpeed,
    ) -> Result<PlaybackState, ReplayError> {
        let handle = self.active_handle(session_key)?;
        {
            let mut session = handle.lock();
            let previous = session.speed();
            session.set_speed(speed);
            if session.status() == PlaybackStatus::Playing {
                Self::cancel_ticker(&mut session);
                self.ensure_ticker(&handle, &mut session);
            }
            info!(
                session = session_key,
                from = previous.multiplier(),
                to = speed.multiplier(),
                "playback speed changed"
            );
        }
        Ok(Self::snapshot(&handle))
    }

    /// Snapshot of the active session, or a synthesised paused snapshot
    /// from preserved disconnected state, or `None`.
    pub fn get_state(&self, session_key: &str) -> Option<PlaybackState> {
        if let Some(handle) = self.active.read().get(session_key).cloned() {
            return Some(Self::snapshot(&handle));
        }
        let state = self.disconnected.read().get(session_key).cloned()?;
        if !self.is_fresh(&state) {
            return None;
        }
        let info = self.catalog.get(session_key)?;
        Some(PlaybackState {
            session_key: session_key.to_owned(),
            status: PlaybackStatus::Paused,
            current_time: state.current_time,
            start_time: state.current_time,
            end_time: info.date_end,
            speed: state.speed,
            duration_ms: millis_between(info.date_start, info.date_end),
            elapsed_ms: millis_between(info.date_start, state.current_time),
        })
    }

    /// Produce the batch for the next tick window and advance the clock.
    ///
    /// Returns `None` when the session is not playing, or at end of session
    /// (transitioning to `Completed`). Driven by the per-session ticker;
    /// exposed because it is the engine's unit of progress.
    pub fn next_batch(&self, session_key: &str) -> Option<TelemetryBatch> {
        let handle = self.active.read().get(session_key).cloned()?;
        let (batch, refill) = {
            let mut session = handle.lock();
            if session.status() != PlaybackStatus::Playing {
                return None;
            }
            let current = session.current_time();
            let end = session.date_end();
            if current >= end {
                session.set_status(PlaybackStatus::Completed);
                Self::cancel_ticker(&mut session);
                info!(session = session_key, "playback completed");
                return None;
            }

            let window_ms =
                (self.config.batch.interval_ms as f64 * session.speed().multiplier()) as i64;
            let window_end = (current + chrono::Duration::milliseconds(window_ms)).min(end);
            let (locations, car_data) = session.consume(current, window_end);
            session.set_current_time(window_end);

            let refill = window_end < end
                && session.buffer_remaining_ms() < LOW_WATER_MS
                && session.begin_refill();
            (
                TelemetryBatch {
                    batch_timestamp: current,
                    locations,
                    car_data,
                },
                refill,
            )
        };

        if refill {
            if let Some(metrics) = &self.metrics {
                metrics.record_refill(session_key);
            }
            let store = self.store.clone();
            let key = session_key.to_owned();
            let span = self.buffer_span();
            let task_handle = handle.clone();
            tokio::spawn(async move {
                refill_session(store, &key, &task_handle, span).await;
                task_handle.lock().end_refill();
            });
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_batch(session_key);
        }
        Some(batch)
    }

    /// A subscriber attached to this session key.
    pub fn register_client(&self, session_key: &str) {
        let mut subscribers = self.subscribers.write();
        let count = subscribers.entry(session_key.to_owned()).or_insert(0);
        *count += 1;
        debug!(session = session_key, subscribers = *count, "client registered");
        if let Some(metrics) = &self.metrics {
            metrics.client_connected();
        }
    }

    /// A subscriber detached. When it was the last one, the session is
    /// suspended: ticker cancelled, position preserved, session dropped.
    pub fn on_client_left(&self, session_key: &str) {
        let remaining = {
            let mut subscribers = self.subscribers.write();
            match subscribers.get_mut(session_key) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    let remaining = *count;
                    if remaining == 0 {
                        subscribers.remove(session_key);
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.client_disconnected();
                    }
                    remaining
                }
                None => 0,
            }
        };
        if remaining > 0 {
            debug!(session = session_key, remaining, "client left");
            return;
        }

        let (removed, count) = {
            let mut active = self.active.write();
            let removed = active.remove(session_key);
            (removed, active.len())
        };
        let Some(handle) = removed else {
            return;
        };
        if let Some(metrics) = &self.metrics {
            metrics.set_active_sessions(count);
        }
        let preserved = {
            let mut session = handle.lock();
            Self::cancel_ticker(&mut session);
            DisconnectedState {
                current_time: session.current_time(),
                speed: session.speed(),
                disconnected_at: Utc::now(),
            }
        };
        info!(
            session = session_key,
            at = %preserved.current_time,
            retention_minutes = self.config.state_retention_minutes,
            "last subscriber left; playback state preserved"
        );
        self.disconnected
            .write()
            .insert(session_key.to_owned(), preserved);
    }

    /// Periodically drop preserved states older than the retention window.
    pub fn spawn_retention_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(SWEEP_PERIOD);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                sweep.tick().await;
                engine.purge_expired();
            }
        })
    }

    /// Drop preserved states past the retention window. Exposed for the
    /// sweep task and for tests.
    pub fn purge_expired(&self) {
        let cutoff = Utc::now() - self.retention();
        self.disconnected.write().retain(|key, state| {
            let keep = state.disconnected_at >= cutoff;
            if !keep {
                debug!(session = %key, "expired disconnected state purged");
            }
            keep
        });
    }

    fn retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.config.state_retention_minutes as i64)
    }

    fn is_fresh(&self, state: &DisconnectedState) -> bool {
        Utc::now() - state.disconnected_at <= self.retention()
    }

    fn buffer_span(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.buffer.duration_seconds as i64)
    }

    fn active_handle(&self, session_key: &str) -> Result<SharedSession, ReplayError> {
        self.active
            .read()
            .get(session_key)
            .cloned()
            .ok_or_else(|| ReplayError::NoActiveSession(session_key.to_owned()))
    }

    fn broadcast(&self, session_key: &str, event: ReplayEvent) {
        if let Some(sender) = self.channels.read().get(session_key) {
            // No receivers is fine; batches of an unwatched session vanish.
            let _ = sender.send(event);
        }
    }

    /// Schedule the per-session ticker: one batch per wall-clock interval,
    /// fanned out to every subscriber, until playback stops or completes.
    fn ensure_ticker(self: &Arc<Self>, handle: &SharedSession, session: &mut ReplaySession) {
        if session.has_ticker() {
            return;
        }
        // Make sure the fan-out channel exists before the first tick.
        drop(self.subscribe(session.session_key()));

        let engine = Arc::clone(self);
        let session_key = session.session_key().to_owned();
        let interval = self.batch_interval();
        let task = tokio::spawn(async move {
            let mut pacer = BatchPacer::new(interval);
            loop {
                pacer.tick().await;
                match engine.next_batch(&session_key) {
                    Some(batch) => engine.broadcast(&session_key, ReplayEvent::Batch(batch)),
                    None => {
                        let completed = engine
                            .get_state(&session_key)
                            .map(|state| state.status == PlaybackStatus::Completed)
                            .unwrap_or(false);
                        if completed {
                            engine.broadcast(&session_key, ReplayEvent::Completed);
                        }
                        debug!(
                            session = %session_key,
                            ticks = pacer.ticks(),
                            period_ms = pacer.period().as_millis() as u64,
                            "session ticker stopped"
                        );
                        break;
                    }
                }
            }
        });
        session.set_ticker(task);
    }

    fn cancel_ticker(session: &mut ReplaySession) {
        if let Some(handle) = session.take_ticker() {
            handle.abort();
        }
    }

    fn snapshot(handle: &SharedSession) -> PlaybackState {
        let session = handle.lock();
        PlaybackState {
            session_key: session.session_key().to_owned(),
            status: session.status(),
            current_time: session.current_time(),
            start_time: session.start_time(),
            end_time: session.date_end(),
            speed: session.speed(),
            duration_ms: millis_between(session.date_start(), session.date_end()),
            elapsed_ms: millis_between(session.date_start(), session.current_time()),
        }
    }
}

/// Load `[current_time, current_time + span)` from the store and splice it
/// into the buffer. The store read runs without the session lock; the
/// result is only accepted when the buffer generation is unchanged.
async fn refill_session(
    store: Arc<dyn TelemetryStore>,
    session_key: &str,
    handle: &SharedSession,
    span: chrono::Duration,
) {
    let (from, to, generation) = {
        let session = handle.lock();
        let from = session.current_time();
        let to = (from + span).min(session.date_end());
        (from, to, session.generation())
    };
    if from >= to {
        return;
    }

    let locations = store.read_locations(session_key, from, to).await;
    let cars = store.read_car_data(session_key, from, to).await;

    let mut session = handle.lock();
    if session.generation() == generation {
        debug!(
            session = session_key,
            locations = locations.len(),
            cars = cars.len(),
            until = %to,
            "buffer refilled"
        );
        session.append(locations, cars, to);
    } else {
        debug!(session = session_key, "stale refill discarded");
    }
}
