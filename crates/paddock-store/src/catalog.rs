//! ---
//! pdk_section: "02-stream-store"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Stream store adapter and session catalog."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use paddock_common::config::SessionConfig;
use paddock_common::time::millis_between;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::stream::{cardata_stream_key, location_stream_key, TelemetryStore};

/// Metadata for one replayable session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_key: String,
    pub name: String,
    pub date_start: DateTime<Utc>,
    pub date_end: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub location_count: Option<u64>,
    pub car_count: Option<u64>,
}

/// Read-mostly catalog of the sessions this server can replay.
///
/// Seeded once from static configuration; record counts are best-effort
/// probes against the store and stay `None` until a probe succeeds.
pub struct SessionCatalog {
    store: Arc<dyn TelemetryStore>,
    configs: Vec<SessionConfig>,
    sessions: RwLock<HashMap<String, SessionInfo>>,
}

impl SessionCatalog {
    /// Build the catalog and probe stream counts for every configured session.
    pub async fn load(store: Arc<dyn TelemetryStore>, configs: Vec<SessionConfig>) -> Self {
        let catalog = Self {
            store,
            configs,
            sessions: RwLock::new(HashMap::new()),
        };
        for config in catalog.configs.clone() {
            let info = catalog.build_info(&config).await;
            debug!(session = %info.session_key, name = %info.name, "session catalogued");
            catalog.sessions.write().insert(config.key.clone(), info);
        }
        info!(sessions = catalog.sessions.read().len(), "session catalog loaded");
        catalog
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.date_start.cmp(&b.date_start));
        sessions
    }

    pub fn get(&self, session_key: &str) -> Option<SessionInfo> {
        self.sessions.read().get(session_key).cloned()
    }

    pub fn exists(&self, session_key: &str) -> bool {
        self.sessions.read().contains_key(session_key)
    }

    /// True iff the location stream for this session holds data.
    pub async fn has_data(&self, session_key: &str) -> bool {
        self.store
            .stream_exists(&location_stream_key(session_key))
            .await
    }

    /// Recompute counts and duration for one session, replacing the cached
    /// entry atomically. Returns `None` for keys not in configuration.
    pub async fn refresh(&self, session_key: &str) -> Option<SessionInfo> {
        let config = self
            .configs
            .iter()
            .find(|config| config.key == session_key)?
            .clone();
        let info = self.build_info(&config).await;
        self.sessions
            .write()
            .insert(session_key.to_owned(), info.clone());
        Some(info)
    }

    async fn build_info(&self, config: &SessionConfig) -> SessionInfo {
        let location_len = self
            .store
            .stream_length(&location_stream_key(&config.key))
            .await;
        let car_len = self
            .store
            .stream_length(&cardata_stream_key(&config.key))
            .await;

        SessionInfo {
            session_key: config.key.clone(),
            name: config.name.clone(),
            date_start: config.date_start,
            date_end: config.date_end,
            duration_ms: Some(millis_between(config.date_start, config.date_end)),
            location_count: (location_len > 0).then_some(location_len),
            car_count: (car_len > 0).then_some(car_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTelemetryStore;
    use crate::records::LocationSample;
    use chrono::TimeZone;

    fn session_config(key: &str) -> SessionConfig {
        SessionConfig {
            key: key.to_owned(),
            name: format!("Race {key}"),
            date_start: Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap(),
            date_end: Utc.with_ymd_and_hms(2024, 5, 12, 16, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn loads_sessions_with_best_effort_counts() {
        let store = Arc::new(MemoryTelemetryStore::new());
        store.seed_locations(
            "9140",
            vec![LocationSample {
                session_key: 9140,
                driver_number: 1,
                timestamp: Utc.with_ymd_and_hms(2024, 5, 12, 14, 30, 0).unwrap(),
                x: 1.0,
                y: 2.0,
            }],
        );

        let catalog =
            SessionCatalog::load(store, vec![session_config("9140"), session_config("9141")])
                .await;

        assert!(catalog.exists("9140"));
        assert!(!catalog.exists("9999"));
        assert_eq!(catalog.list().len(), 2);

        let info = catalog.get("9140").expect("catalogued");
        assert_eq!(info.duration_ms, Some(2 * 60 * 60 * 1000));
        assert_eq!(info.location_count, Some(1));
        assert_eq!(info.car_count, None);

        assert!(catalog.has_data("9140").await);
        assert!(!catalog.has_data("9141").await);
    }

    #[tokio::test]
    async fn refresh_picks_up_new_data_and_rejects_unknown_keys() {
        let store = Arc::new(MemoryTelemetryStore::new());
        let catalog =
            SessionCatalog::load(store.clone(), vec![session_config("9140")]).await;
        assert_eq!(catalog.get("9140").unwrap().location_count, None);

        store.seed_locations(
            "9140",
            vec![LocationSample {
                session_key: 9140,
                driver_number: 81,
                timestamp: Utc.with_ymd_and_hms(2024, 5, 12, 15, 0, 0).unwrap(),
                x: 0.0,
                y: 0.0,
            }],
        );

        let refreshed = catalog.refresh("9140").await.expect("known key");
        assert_eq!(refreshed.location_count, Some(1));
        assert_eq!(catalog.get("9140").unwrap().location_count, Some(1));
        assert!(catalog.refresh("0000").await.is_none());
    }
}
