//! ---
//! pdk_section: "02-stream-store"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Stream store adapter and session catalog."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use paddock_common::config::RedisConfig;
use paddock_common::time::parse_instant;
use paddock_metrics::ReplayMetrics;
use tracing::{debug, error, warn};

use crate::records::{CarSample, LocationSample};

const LOCATION_STREAM_PREFIX: &str = "telemetry:location:";
const CARDATA_STREAM_PREFIX: &str = "telemetry:cardata:";

/// Stream key holding location records for a session.
pub fn location_stream_key(session_key: &str) -> String {
    format!("{LOCATION_STREAM_PREFIX}{session_key}")
}

/// Stream key holding car performance records for a session.
pub fn cardata_stream_key(session_key: &str) -> String {
    format!("{CARDATA_STREAM_PREFIX}{session_key}")
}

/// Read-side contract against the external telemetry stream store.
///
/// Range reads are inclusive on the lower bound and exclusive on the upper
/// bound, filtered by the `timestamp` payload field. Failures degrade to
/// empty results; the adapter never blocks past its configured deadline.
#[async_trait]
pub trait TelemetryStore: Send + Sync + 'static {
    async fn read_locations(
        &self,
        session_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<LocationSample>;

    async fn read_car_data(
        &self,
        session_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<CarSample>;

    /// Number of records in a stream. 0 on failure.
    async fn stream_length(&self, stream_key: &str) -> u64;

    /// True iff the stream exists and holds at least one record.
    async fn stream_exists(&self, stream_key: &str) -> bool;

    async fn first_timestamp(&self, stream_key: &str) -> Option<DateTime<Utc>>;

    async fn last_timestamp(&self, stream_key: &str) -> Option<DateTime<Utc>>;
}

type StreamEntry = (String, Vec<(String, String)>);

/// Production [`TelemetryStore`] over Redis Streams.
pub struct RedisTelemetryStore {
    pool: Pool,
    read_timeout: Duration,
    metrics: Option<ReplayMetrics>,
}

impl RedisTelemetryStore {
    /// Build the connection pool and verify the store is reachable.
    ///
    /// An unreachable store at boot is fatal; after boot, read failures
    /// degrade to empty results.
    pub async fn connect(config: &RedisConfig) -> anyhow::Result<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .builder()
            .map_err(|err| anyhow::anyhow!("invalid redis configuration: {err}"))?
            .max_size(config.pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|err| anyhow::anyhow!("failed to build redis pool: {err}"))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|err| anyhow::anyhow!("redis unreachable at {}: {err}", config.url))?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|err| anyhow::anyhow!("redis ping failed: {err}"))?;

        Ok(Self {
            pool,
            read_timeout: config.read_timeout,
            metrics: None,
        })
    }

    /// Attach the metrics handle that records read latency and failures.
    pub fn with_metrics(mut self, metrics: ReplayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn observe_read(&self, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_store_read(started.elapsed().as_secs_f64());
        }
    }

    fn record_read_failure(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_store_read_failure();
        }
    }

    /// Fetch every entry of a stream. The producer assigns ingestion-time
    /// record ids, so time filtering has to happen on the payload.
    async fn range_all(&self, stream_key: &str) -> Option<Vec<StreamEntry>> {
        let started = Instant::now();
        let fetch = async {
            let mut conn = self.pool.get().await.ok()?;
            redis::cmd("XRANGE")
                .arg(stream_key)
                .arg("-")
                .arg("+")
                .query_async::<Vec<StreamEntry>>(&mut *conn)
                .await
                .ok()
        };
        match tokio::time::timeout(self.read_timeout, fetch).await {
            Ok(Some(entries)) => {
                self.observe_read(started);
                Some(entries)
            }
            Ok(None) => {
                error!(stream = %stream_key, "stream range read failed");
                self.record_read_failure();
                None
            }
            Err(_) => {
                error!(stream = %stream_key, timeout_ms = self.read_timeout.as_millis() as u64, "stream range read timed out");
                self.record_read_failure();
                None
            }
        }
    }

    async fn edge_timestamp(&self, stream_key: &str, reverse: bool) -> Option<DateTime<Utc>> {
        let command = if reverse { "XREVRANGE" } else { "XRANGE" };
        let (lo, hi) = if reverse { ("+", "-") } else { ("-", "+") };
        let started = Instant::now();
        let fetch = async {
            let mut conn = self.pool.get().await.ok()?;
            redis::cmd(command)
                .arg(stream_key)
                .arg(lo)
                .arg(hi)
                .arg("COUNT")
                .arg(1)
                .query_async::<Vec<StreamEntry>>(&mut *conn)
                .await
                .ok()
        };
        let entries = match tokio::time::timeout(self.read_timeout, fetch).await {
            Ok(Some(entries)) => {
                self.observe_read(started);
                entries
            }
            _ => {
                error!(stream = %stream_key, command, "stream edge read failed");
                self.record_read_failure();
                return None;
            }
        };
        let (_, fields) = entries.into_iter().next()?;
        string_field(&fields, "timestamp").and_then(|ts| parse_instant(&ts))
    }

    /// Entries of `[start, end)` by payload timestamp. Records whose
    /// timestamp does not parse are dropped and logged.
    fn filter_window(
        stream_key: &str,
        entries: Vec<StreamEntry>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<(DateTime<Utc>, Vec<(String, String)>)> {
        let mut kept = Vec::new();
        for (record_id, fields) in entries {
            let Some(raw) = string_field(&fields, "timestamp") else {
                warn!(stream = %stream_key, record_id = %record_id, "record without timestamp field dropped");
                continue;
            };
            let Some(ts) = parse_instant(&raw) else {
                warn!(stream = %stream_key, record_id = %record_id, timestamp = %raw, "unparseable record timestamp dropped");
                continue;
            };
            if ts >= start && ts < end {
                kept.push((ts, fields));
            }
        }
        // Record ids are ingestion-ordered, not sample-ordered.
        kept.sort_by_key(|(ts, _)| *ts);
        kept
    }
}

#[async_trait]
impl TelemetryStore for RedisTelemetryStore {
    async fn read_locations(
        &self,
        session_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<LocationSample> {
        let stream_key = location_stream_key(session_key);
        let Some(entries) = self.range_all(&stream_key).await else {
            return Vec::new();
        };
        let session = int_field_from_str(session_key);
        let samples: Vec<LocationSample> =
            Self::filter_window(&stream_key, entries, start, end)
                .into_iter()
                .map(|(ts, fields)| parse_location(session, ts, &fields))
                .collect();
        debug!(
            stream = %stream_key,
            count = samples.len(),
            start = %start,
            end = %end,
            "location window read"
        );
        samples
    }

    async fn read_car_data(
        &self,
        session_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<CarSample> {
        let stream_key = cardata_stream_key(session_key);
        let Some(entries) = self.range_all(&stream_key).await else {
            return Vec::new();
        };
        let session = int_field_from_str(session_key);
        let samples: Vec<CarSample> = Self::filter_window(&stream_key, entries, start, end)
            .into_iter()
            .map(|(ts, fields)| parse_car(session, ts, &fields))
            .collect();
        debug!(
            stream = %stream_key,
            count = samples.len(),
            start = %start,
            end = %end,
            "car data window read"
        );
        samples
    }

    async fn stream_length(&self, stream_key: &str) -> u64 {
        let started = Instant::now();
        let fetch = async {
            let mut conn = self.pool.get().await.ok()?;
            redis::cmd("XLEN")
                .arg(stream_key)
                .query_async::<u64>(&mut *conn)
                .await
                .ok()
        };
        match tokio::time::timeout(self.read_timeout, fetch).await {
            Ok(Some(len)) => {
                self.observe_read(started);
                len
            }
            _ => {
                error!(stream = %stream_key, "stream length probe failed");
                self.record_read_failure();
                0
            }
        }
    }

    async fn stream_exists(&self, stream_key: &str) -> bool {
        self.stream_length(stream_key).await > 0
    }

    async fn first_timestamp(&self, stream_key: &str) -> Option<DateTime<Utc>> {
        self.edge_timestamp(stream_key, false).await
    }

    async fn last_timestamp(&self, stream_key: &str) -> Option<DateTime<Utc>> {
        self.edge_timestamp(stream_key, true).await
    }
}

fn string_field(fields: &[(String, String)], key: &str) -> Option<String> {
    fields
        .iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.clone())
}

fn int_field(fields: &[(String, String)], key: &str) -> i32 {
    string_field(fields, key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn uint_field(fields: &[(String, String)], key: &str) -> u32 {
    string_field(fields, key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn float_field(fields: &[(String, String)], key: &str) -> f64 {
    string_field(fields, key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(0.0)
}

fn int_field_from_str(value: &str) -> i64 {
    value.parse().unwrap_or(0)
}

fn parse_location(
    session_key: i64,
    timestamp: DateTime<Utc>,
    fields: &[(String, String)],
) -> LocationSample {
    LocationSample {
        session_key,
        driver_number: uint_field(fields, "driver_number"),
        timestamp,
        x: float_field(fields, "x"),
        y: float_field(fields, "y"),
    }
}

fn parse_car(
    session_key: i64,
    timestamp: DateTime<Utc>,
    fields: &[(String, String)],
) -> CarSample {
    CarSample {
        session_key,
        driver_number: uint_field(fields, "driver_number"),
        timestamp,
        speed: int_field(fields, "speed"),
        rpm: int_field(fields, "rpm"),
        gear: int_field(fields, "gear"),
        throttle: int_field(fields, "throttle"),
        brake: int_field(fields, "brake"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn stream_keys_are_fixed() {
        assert_eq!(location_stream_key("9140"), "telemetry:location:9140");
        assert_eq!(cardata_stream_key("9140"), "telemetry:cardata:9140");
    }

    #[test]
    fn malformed_numeric_fields_degrade_to_zero() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap();
        let sample = parse_car(
            9140,
            ts,
            &fields(&[
                ("driver_number", "1"),
                ("speed", "not-a-number"),
                ("rpm", "11200"),
                ("gear", ""),
                ("throttle", "98"),
                ("brake", "0"),
            ]),
        );
        assert_eq!(sample.driver_number, 1);
        assert_eq!(sample.speed, 0);
        assert_eq!(sample.rpm, 11200);
        assert_eq!(sample.gear, 0);
        assert_eq!(sample.throttle, 98);
    }

    #[test]
    fn missing_location_fields_degrade() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap();
        let sample = parse_location(9140, ts, &fields(&[("driver_number", "44")]));
        assert_eq!(sample.driver_number, 44);
        assert_eq!(sample.x, 0.0);
        assert_eq!(sample.y, 0.0);
    }

    #[test]
    fn window_filter_is_half_open_and_drops_bad_timestamps() {
        let start = Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap();
        let end = start + chrono::Duration::seconds(1);
        let entries = vec![
            (
                "1-0".to_string(),
                fields(&[("timestamp", "2024-05-12T13:59:59.900Z"), ("x", "1.0")]),
            ),
            (
                "2-0".to_string(),
                fields(&[("timestamp", "2024-05-12T14:00:00Z"), ("x", "2.0")]),
            ),
            (
                "3-0".to_string(),
                fields(&[("timestamp", "2024-05-12T14:00:00.500Z"), ("x", "3.0")]),
            ),
            (
                "4-0".to_string(),
                fields(&[("timestamp", "2024-05-12T14:00:01Z"), ("x", "4.0")]),
            ),
            ("5-0".to_string(), fields(&[("timestamp", "garbage")])),
            ("6-0".to_string(), fields(&[("x", "6.0")])),
        ];
        let kept = RedisTelemetryStore::filter_window("telemetry:location:9140", entries, start, end);
        let xs: Vec<f64> = kept.iter().map(|(_, f)| float_field(f, "x")).collect();
        assert_eq!(xs, vec![2.0, 3.0]);
    }

    // Requires a running Redis with seeded telemetry streams.
    #[tokio::test]
    #[ignore]
    async fn reads_from_live_redis() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:6379".into(),
            ..RedisConfig::default()
        };
        let store = RedisTelemetryStore::connect(&config).await.unwrap();
        let start = Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap();
        let end = start + chrono::Duration::hours(2);
        let locations = store.read_locations("9140", start, end).await;
        assert!(locations.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }
}
