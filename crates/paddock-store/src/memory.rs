//! ---
//! pdk_section: "02-stream-store"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Stream store adapter and session catalog."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
//! In-memory [`TelemetryStore`] backend for tests and local development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::records::{CarSample, LocationSample};
use crate::stream::TelemetryStore;

/// Telemetry store holding pre-seeded samples in process memory.
#[derive(Default)]
pub struct MemoryTelemetryStore {
    locations: RwLock<HashMap<String, Vec<LocationSample>>>,
    cars: RwLock<HashMap<String, Vec<CarSample>>>,
}

impl MemoryTelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed location records for a session, keeping them timestamp-ordered.
    pub fn seed_locations(&self, session_key: &str, mut samples: Vec<LocationSample>) {
        samples.sort_by_key(|sample| sample.timestamp);
        self.locations
            .write()
            .entry(session_key.to_owned())
            .or_default()
            .extend(samples);
    }

    /// Seed car records for a session, keeping them timestamp-ordered.
    pub fn seed_car_data(&self, session_key: &str, mut samples: Vec<CarSample>) {
        samples.sort_by_key(|sample| sample.timestamp);
        self.cars
            .write()
            .entry(session_key.to_owned())
            .or_default()
            .extend(samples);
    }

    fn session_of(stream_key: &str) -> Option<(&str, bool)> {
        if let Some(key) = stream_key.strip_prefix("telemetry:location:") {
            return Some((key, true));
        }
        stream_key
            .strip_prefix("telemetry:cardata:")
            .map(|key| (key, false))
    }
}

#[async_trait]
impl TelemetryStore for MemoryTelemetryStore {
    async fn read_locations(
        &self,
        session_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<LocationSample> {
        self.locations
            .read()
            .get(session_key)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.timestamp >= start && s.timestamp < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn read_car_data(
        &self,
        session_key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<CarSample> {
        self.cars
            .read()
            .get(session_key)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.timestamp >= start && s.timestamp < end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn stream_length(&self, stream_key: &str) -> u64 {
        match Self::session_of(stream_key) {
            Some((key, true)) => self
                .locations
                .read()
                .get(key)
                .map(|s| s.len() as u64)
                .unwrap_or(0),
            Some((key, false)) => self
                .cars
                .read()
                .get(key)
                .map(|s| s.len() as u64)
                .unwrap_or(0),
            None => 0,
        }
    }

    async fn stream_exists(&self, stream_key: &str) -> bool {
        self.stream_length(stream_key).await > 0
    }

    async fn first_timestamp(&self, stream_key: &str) -> Option<DateTime<Utc>> {
        match Self::session_of(stream_key)? {
            (key, true) => self
                .locations
                .read()
                .get(key)
                .and_then(|s| s.first().map(|sample| sample.timestamp)),
            (key, false) => self
                .cars
                .read()
                .get(key)
                .and_then(|s| s.first().map(|sample| sample.timestamp)),
        }
    }

    async fn last_timestamp(&self, stream_key: &str) -> Option<DateTime<Utc>> {
        match Self::session_of(stream_key)? {
            (key, true) => self
                .locations
                .read()
                .get(key)
                .and_then(|s| s.last().map(|sample| sample.timestamp)),
            (key, false) => self
                .cars
                .read()
                .get(key)
                .and_then(|s| s.last().map(|sample| sample.timestamp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn location(ts: DateTime<Utc>, driver: u32) -> LocationSample {
        LocationSample {
            session_key: 9140,
            driver_number: driver,
            timestamp: ts,
            x: 100.0,
            y: 200.0,
        }
    }

    #[tokio::test]
    async fn window_reads_are_half_open() {
        let store = MemoryTelemetryStore::new();
        let start = Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap();
        store.seed_locations(
            "9140",
            vec![
                location(start, 1),
                location(start + chrono::Duration::milliseconds(500), 1),
                location(start + chrono::Duration::seconds(1), 1),
            ],
        );

        let window = store
            .read_locations("9140", start, start + chrono::Duration::seconds(1))
            .await;
        assert_eq!(window.len(), 2);
        assert!(store.stream_exists("telemetry:location:9140").await);
        assert!(!store.stream_exists("telemetry:cardata:9140").await);
        assert_eq!(
            store.first_timestamp("telemetry:location:9140").await,
            Some(start)
        );
    }
}
