//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "tests"
//! pdk_type: "source"
//! pdk_scope: "test"
//! pdk_description: "Playback state machine and replay engine."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
//! Engine-level integration tests over an in-memory telemetry store.
//!
//! Paced tests run under tokio's paused clock: virtual time only advances
//! while the test awaits, so every ticker tick is observed deterministically.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use paddock_common::config::{BatchConfig, BufferConfig, ReplayConfig, SessionConfig};
use paddock_common::ReplayError;
use paddock_replay::{PlaybackSpeed, PlaybackStatus, ReplayEngine, ReplayEvent, TelemetryBatch};
use paddock_store::catalog::SessionCatalog;
use paddock_store::{CarSample, LocationSample, MemoryTelemetryStore};
use tokio::sync::broadcast;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap()
}

fn location(offset_ms: i64, driver: u32) -> LocationSample {
    LocationSample {
        session_key: 9140,
        driver_number: driver,
        timestamp: base() + chrono::Duration::milliseconds(offset_ms),
        x: 100.0,
        y: 200.0,
    }
}

fn car(offset_ms: i64, driver: u32) -> CarSample {
    CarSample {
        session_key: 9140,
        driver_number: driver,
        timestamp: base() + chrono::Duration::milliseconds(offset_ms),
        speed: 287,
        rpm: 11230,
        gear: 8,
        throttle: 99,
        brake: 0,
    }
}

fn session_config(key: &str, duration_ms: i64) -> SessionConfig {
    SessionConfig {
        key: key.to_owned(),
        name: format!("Race {key}"),
        date_start: base(),
        date_end: base() + chrono::Duration::milliseconds(duration_ms),
    }
}

fn replay_config() -> ReplayConfig {
    ReplayConfig {
        batch: BatchConfig { interval_ms: 100 },
        buffer: BufferConfig {
            duration_seconds: 30,
        },
        state_retention_minutes: 5,
    }
}

async fn engine_for(
    store: Arc<MemoryTelemetryStore>,
    sessions: Vec<SessionConfig>,
    config: ReplayConfig,
) -> Arc<ReplayEngine> {
    let catalog = Arc::new(SessionCatalog::load(store.clone(), sessions).await);
    Arc::new(ReplayEngine::new(store, catalog, config, None))
}

async fn next_event(events: &mut broadcast::Receiver<ReplayEvent>) -> ReplayEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event within five virtual seconds")
        .expect("channel open")
}

async fn next_batch_event(events: &mut broadcast::Receiver<ReplayEvent>) -> TelemetryBatch {
    match next_event(events).await {
        ReplayEvent::Batch(batch) => batch,
        other => panic!("expected batch, got {other:?}"),
    }
}

#[tokio::test]
async fn play_rejects_unknown_sessions() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(store, vec![], replay_config()).await;
    let err = engine.play("9999", None).await.unwrap_err();
    assert!(matches!(err, ReplayError::UnknownSession(_)));
}

#[tokio::test]
async fn play_rejects_start_time_outside_bounds() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(store, vec![session_config("9140", 1_000)], replay_config()).await;
    let err = engine
        .play("9140", Some(base() + chrono::Duration::hours(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, ReplayError::InvalidTime(_)));
    assert!(engine.get_state("9140").is_none());
}

#[tokio::test(start_paused = true)]
async fn tick_window_scales_with_speed() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(
        store,
        vec![session_config("9140", 7_200_000)],
        replay_config(),
    )
    .await;

    let mut events = engine.subscribe("9140");
    engine.play("9140", None).await.unwrap();
    // No await between play and set_speed, so the rate applies from tick 0.
    engine
        .set_speed("9140", PlaybackSpeed::Double)
        .expect("active session");

    // At 2x a 100 ms wall tick covers 200 ms of session time.
    let first = next_batch_event(&mut events).await;
    let second = next_batch_event(&mut events).await;
    assert_eq!(first.batch_timestamp, base());
    assert_eq!(
        second.batch_timestamp,
        base() + chrono::Duration::milliseconds(200)
    );

    let state = engine.get_state("9140").unwrap();
    assert_eq!(state.elapsed_ms, 400);
    assert_eq!(state.speed, PlaybackSpeed::Double);
}

#[tokio::test(start_paused = true)]
async fn uninterrupted_playback_delivers_every_sample_exactly_once() {
    let store = Arc::new(MemoryTelemetryStore::new());
    store.seed_locations("9140", (0..10).map(|i| location(i * 100, 1)).collect());
    store.seed_car_data("9140", (0..10).map(|i| car(i * 100 + 50, 1)).collect());
    let engine = engine_for(store, vec![session_config("9140", 1_000)], replay_config()).await;

    let mut events = engine.subscribe("9140");
    engine.play("9140", None).await.unwrap();

    let mut batch_timestamps = Vec::new();
    let mut delivered = Vec::new();
    loop {
        match next_event(&mut events).await {
            ReplayEvent::Batch(batch) => {
                batch_timestamps.push(batch.batch_timestamp);
                for sample in &batch.locations {
                    assert!(sample.timestamp >= batch.batch_timestamp);
                    delivered.push((sample.driver_number, sample.timestamp));
                }
                for sample in &batch.car_data {
                    delivered.push((sample.driver_number, sample.timestamp));
                }
            }
            ReplayEvent::Completed => break,
        }
    }

    // Monotonic batch timestamps, bounded clock.
    assert!(batch_timestamps.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(batch_timestamps.len(), 10);
    let state = engine.get_state("9140").unwrap();
    assert_eq!(state.status, PlaybackStatus::Completed);
    assert_eq!(
        state.current_time,
        base() + chrono::Duration::milliseconds(1_000)
    );

    // Every stored sample delivered, no (driver, timestamp) pair twice.
    assert_eq!(delivered.len(), 20);
    let unique: std::collections::HashSet<_> = delivered.iter().collect();
    assert_eq!(unique.len(), 20);
}

#[tokio::test(start_paused = true)]
async fn empty_store_windows_still_advance_the_clock() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(store, vec![session_config("9140", 300)], replay_config()).await;

    let mut events = engine.subscribe("9140");
    engine.play("9140", None).await.unwrap();

    let mut batches = 0;
    loop {
        match next_event(&mut events).await {
            ReplayEvent::Batch(batch) => {
                assert!(batch.locations.is_empty());
                assert!(batch.car_data.is_empty());
                batches += 1;
            }
            ReplayEvent::Completed => break,
        }
    }
    assert_eq!(batches, 3);
    assert_eq!(
        engine.get_state("9140").unwrap().status,
        PlaybackStatus::Completed
    );
}

#[tokio::test]
async fn seek_validates_bounds_and_leaves_state_unchanged() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(
        store,
        vec![session_config("9140", 7_200_000)],
        replay_config(),
    )
    .await;
    engine.play("9140", None).await.unwrap();
    engine.pause("9140").unwrap();
    let before = engine.get_state("9140").unwrap();

    let err = engine
        .seek("9140", base() + chrono::Duration::hours(3))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Target time outside session bounds");
    assert_eq!(engine.get_state("9140").unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn seek_is_idempotent() {
    let store = Arc::new(MemoryTelemetryStore::new());
    store.seed_locations("9140", (0..20).map(|i| location(i * 100, 1)).collect());
    let engine = engine_for(store, vec![session_config("9140", 2_000)], replay_config()).await;

    let target = base() + chrono::Duration::milliseconds(500);
    let mut events = engine.subscribe("9140");

    engine.play("9140", None).await.unwrap();
    engine.pause("9140").unwrap();
    engine.seek("9140", target).await.unwrap();
    engine.play("9140", None).await.unwrap();
    let first = next_batch_event(&mut events).await;

    engine.pause("9140").unwrap();
    engine.seek("9140", target).await.unwrap();
    engine.seek("9140", target).await.unwrap();
    engine.play("9140", None).await.unwrap();
    let second = next_batch_event(&mut events).await;

    assert_eq!(first, second);
    assert_eq!(first.batch_timestamp, target);
}

#[tokio::test]
async fn seek_preserves_paused_status() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(
        store,
        vec![session_config("9140", 7_200_000)],
        replay_config(),
    )
    .await;
    engine.play("9140", None).await.unwrap();
    engine.pause("9140").unwrap();

    let state = engine
        .seek("9140", base() + chrono::Duration::minutes(30))
        .await
        .unwrap();
    assert_eq!(state.status, PlaybackStatus::Paused);
    // Paused sessions produce no batches.
    assert!(engine.next_batch("9140").is_none());
}

#[tokio::test(start_paused = true)]
async fn seek_to_the_end_boundary_completes_on_next_tick() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(store, vec![session_config("9140", 1_000)], replay_config()).await;

    let mut events = engine.subscribe("9140");
    engine.play("9140", None).await.unwrap();
    engine.pause("9140").unwrap();

    // Both boundaries are seekable.
    engine.seek("9140", base()).await.unwrap();
    let end = base() + chrono::Duration::milliseconds(1_000);
    engine.seek("9140", end).await.unwrap();

    engine.play("9140", None).await.unwrap();
    match next_event(&mut events).await {
        ReplayEvent::Completed => {}
        other => panic!("expected completion, got {other:?}"),
    }
    assert_eq!(
        engine.get_state("9140").unwrap().status,
        PlaybackStatus::Completed
    );
}

#[tokio::test(start_paused = true)]
async fn disconnect_preserves_position_and_play_resumes_it() {
    let store = Arc::new(MemoryTelemetryStore::new());
    store.seed_locations("9140", (0..20).map(|i| location(i * 100, 1)).collect());
    let engine = engine_for(store, vec![session_config("9140", 2_000)], replay_config()).await;

    let mut events = engine.subscribe("9140");
    engine.register_client("9140");
    engine.play("9140", None).await.unwrap();
    for _ in 0..3 {
        next_batch_event(&mut events).await;
    }
    engine.on_client_left("9140");

    let position = base() + chrono::Duration::milliseconds(300);
    // The session itself is gone but the preserved state answers get_state.
    let preserved = engine.get_state("9140").unwrap();
    assert_eq!(preserved.status, PlaybackStatus::Paused);
    assert_eq!(preserved.current_time, position);

    engine.play("9140", None).await.unwrap();
    let batch = next_batch_event(&mut events).await;
    assert_eq!(batch.batch_timestamp, position);
}

#[tokio::test(start_paused = true)]
async fn explicit_start_time_overrides_preserved_state() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(store, vec![session_config("9140", 2_000)], replay_config()).await;

    let mut events = engine.subscribe("9140");
    engine.register_client("9140");
    engine.play("9140", None).await.unwrap();
    next_batch_event(&mut events).await;
    engine.on_client_left("9140");

    let explicit = base() + chrono::Duration::milliseconds(700);
    engine.play("9140", Some(explicit)).await.unwrap();
    let batch = next_batch_event(&mut events).await;
    assert_eq!(batch.batch_timestamp, explicit);
}

#[tokio::test(start_paused = true)]
async fn only_the_last_subscriber_suspends_the_session() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(store, vec![session_config("9140", 5_000)], replay_config()).await;

    let mut events = engine.subscribe("9140");
    engine.register_client("9140");
    engine.register_client("9140");
    engine.play("9140", None).await.unwrap();
    next_batch_event(&mut events).await;

    engine.on_client_left("9140");
    // One subscriber remains; the session keeps playing.
    next_batch_event(&mut events).await;
    assert_eq!(
        engine.get_state("9140").unwrap().status,
        PlaybackStatus::Playing
    );

    engine.on_client_left("9140");
    assert_eq!(
        engine.get_state("9140").unwrap().status,
        PlaybackStatus::Paused
    );
    assert!(engine.next_batch("9140").is_none());
}

#[tokio::test(start_paused = true)]
async fn all_subscribers_observe_the_same_stream() {
    let store = Arc::new(MemoryTelemetryStore::new());
    store.seed_locations("9140", (0..10).map(|i| location(i * 100, 1)).collect());
    let engine = engine_for(store, vec![session_config("9140", 1_000)], replay_config()).await;

    let mut first = engine.subscribe("9140");
    let mut second = engine.subscribe("9140");
    engine.play("9140", None).await.unwrap();

    for _ in 0..10 {
        let a = next_batch_event(&mut first).await;
        let b = next_batch_event(&mut second).await;
        assert_eq!(a.batch_timestamp, b.batch_timestamp);
        assert_eq!(a.locations, b.locations);
    }
}

#[tokio::test]
async fn invalid_speed_multipliers_never_reach_the_engine() {
    let err = PlaybackSpeed::from_multiplier(3.0).unwrap_err();
    assert!(matches!(err, ReplayError::InvalidSpeed(_)));
    assert!(PlaybackSpeed::from_multiplier(0.25).is_err());

    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(store, vec![session_config("9140", 2_000)], replay_config()).await;
    engine.play("9140", None).await.unwrap();
    engine.pause("9140").unwrap();
    let before = engine.get_state("9140").unwrap();
    // The rejected multiplier never turns into a set_speed call.
    assert_eq!(engine.get_state("9140").unwrap(), before);
}

#[tokio::test]
async fn pause_and_stop_follow_the_state_machine() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(store, vec![session_config("9140", 2_000)], replay_config()).await;

    assert!(matches!(
        engine.pause("9140").unwrap_err(),
        ReplayError::NoActiveSession(_)
    ));

    engine.play("9140", None).await.unwrap();
    let paused = engine.pause("9140").unwrap();
    assert_eq!(paused.status, PlaybackStatus::Paused);
    assert!(engine.next_batch("9140").is_none());

    let resumed = engine.play("9140", None).await.unwrap();
    assert_eq!(resumed.status, PlaybackStatus::Playing);

    let stopped = engine.stop("9140").unwrap();
    assert_eq!(stopped.status, PlaybackStatus::Stopped);
    assert!(engine.get_state("9140").is_none());
    assert!(matches!(
        engine.stop("9140").unwrap_err(),
        ReplayError::NoActiveSession(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn low_buffer_triggers_background_refill() {
    let store = Arc::new(MemoryTelemetryStore::new());
    // 5 s session, 1 s buffer: playback outruns the initial fill.
    store.seed_locations("9140", (0..50).map(|i| location(i * 100, 1)).collect());
    let engine = engine_for(
        store,
        vec![session_config("9140", 5_000)],
        ReplayConfig {
            batch: BatchConfig { interval_ms: 100 },
            buffer: BufferConfig {
                duration_seconds: 1,
            },
            state_retention_minutes: 5,
        },
    )
    .await;

    let mut events = engine.subscribe("9140");
    engine.play("9140", None).await.unwrap();

    let mut delivered = 0;
    loop {
        match next_event(&mut events).await {
            ReplayEvent::Batch(batch) => delivered += batch.locations.len(),
            ReplayEvent::Completed => break,
        }
    }
    assert_eq!(delivered, 50);
}

#[tokio::test]
async fn purge_drops_only_expired_states() {
    let store = Arc::new(MemoryTelemetryStore::new());
    let engine = engine_for(
        store,
        vec![session_config("9140", 2_000)],
        ReplayConfig {
            batch: BatchConfig { interval_ms: 100 },
            buffer: BufferConfig {
                duration_seconds: 30,
            },
            state_retention_minutes: 0,
        },
    )
    .await;

    engine.register_client("9140");
    engine.play("9140", None).await.unwrap();
    engine.on_client_left("9140");

    std::thread::sleep(Duration::from_millis(5));
    engine.purge_expired();
    assert!(engine.get_state("9140").is_none());
}
