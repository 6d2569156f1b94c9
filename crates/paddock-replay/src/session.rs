//! ---
//! pdk_section: "01-core-functionality"
//! pdk_subsection: "module"
//! pdk_type: "source"
//! pdk_scope: "code"
//! pdk_description: "Playback state machine and replay engine."
//! pdk_version: "v0.0.0-prealpha"
//! pdk_owner: "tbd"
//! ---
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use paddock_store::{CarSample, LocationSample};
use tokio::task::JoinHandle;

use crate::playback::{PlaybackSpeed, PlaybackStatus};

/// Mutable per-session playback state: the logical clock, the pre-fetch
/// buffers, and the scheduled ticker handle.
///
/// All mutation happens under the engine's per-session lock; this type
/// itself performs no locking and no I/O.
pub struct ReplaySession {
    session_key: String,
    current_time: DateTime<Utc>,
    start_time: DateTime<Utc>,
    date_start: DateTime<Utc>,
    date_end: DateTime<Utc>,
    speed: PlaybackSpeed,
    status: PlaybackStatus,
    loc_buffer: Vec<LocationSample>,
    car_buffer: Vec<CarSample>,
    buffer_end: Option<DateTime<Utc>>,
    generation: u64,
    refill_in_flight: bool,
    ticker: Option<JoinHandle<()>>,
}

impl ReplaySession {
    pub fn new(
        session_key: impl Into<String>,
        origin: DateTime<Utc>,
        date_start: DateTime<Utc>,
        date_end: DateTime<Utc>,
        speed: PlaybackSpeed,
    ) -> Self {
        Self {
            session_key: session_key.into(),
            current_time: origin,
            start_time: origin,
            date_start,
            date_end,
            speed,
            status: PlaybackStatus::Idle,
            loc_buffer: Vec::new(),
            car_buffer: Vec::new(),
            buffer_end: None,
            generation: 0,
            refill_in_flight: false,
            ticker: None,
        }
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        self.current_time
    }

    pub fn set_current_time(&mut self, time: DateTime<Utc>) {
        self.current_time = time;
    }

    /// Where this playback originally started (not the session bound).
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn date_start(&self) -> DateTime<Utc> {
        self.date_start
    }

    pub fn date_end(&self) -> DateTime<Utc> {
        self.date_end
    }

    pub fn speed(&self) -> PlaybackSpeed {
        self.speed
    }

    pub fn set_speed(&mut self, speed: PlaybackSpeed) {
        self.speed = speed;
    }

    pub fn status(&self) -> PlaybackStatus {
        self.status
    }

    pub fn set_status(&mut self, status: PlaybackStatus) {
        self.status = status;
    }

    /// Remove and return all buffered samples in `[from, to)`, each channel
    /// ordered ascending by timestamp. Consumed samples are never re-emitted.
    pub fn consume(
        &mut self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> (Vec<LocationSample>, Vec<CarSample>) {
        let loc_cut = self.loc_buffer.partition_point(|s| s.timestamp < to);
        let locations: Vec<LocationSample> = self
            .loc_buffer
            .drain(..loc_cut)
            .filter(|s| s.timestamp >= from)
            .collect();

        let car_cut = self.car_buffer.partition_point(|s| s.timestamp < to);
        let cars: Vec<CarSample> = self
            .car_buffer
            .drain(..car_cut)
            .filter(|s| s.timestamp >= from)
            .collect();

        (locations, cars)
    }

    /// Extend the buffers and advance `buffer_end`. Overlapping refills are
    /// idempotent: duplicates are suppressed by `(timestamp, driver_number)`.
    pub fn append(
        &mut self,
        locations: Vec<LocationSample>,
        cars: Vec<CarSample>,
        new_buffer_end: DateTime<Utc>,
    ) {
        let mut seen: HashSet<(i64, u32)> = self
            .loc_buffer
            .iter()
            .map(|s| (s.timestamp.timestamp_micros(), s.driver_number))
            .collect();
        for sample in locations {
            if seen.insert((sample.timestamp.timestamp_micros(), sample.driver_number)) {
                self.loc_buffer.push(sample);
            }
        }
        self.loc_buffer.sort_by_key(|s| s.timestamp);

        let mut seen: HashSet<(i64, u32)> = self
            .car_buffer
            .iter()
            .map(|s| (s.timestamp.timestamp_micros(), s.driver_number))
            .collect();
        for sample in cars {
            if seen.insert((sample.timestamp.timestamp_micros(), sample.driver_number)) {
                self.car_buffer.push(sample);
            }
        }
        self.car_buffer.sort_by_key(|s| s.timestamp);

        self.buffer_end = Some(match self.buffer_end {
            Some(existing) => existing.max(new_buffer_end),
            None => new_buffer_end,
        });
    }

    /// Drop both buffers and the pre-fetch watermark. Bumps the buffer
    /// generation so refills started before the clear discard themselves.
    pub fn clear(&mut self) {
        self.loc_buffer.clear();
        self.car_buffer.clear();
        self.buffer_end = None;
        self.generation += 1;
    }

    pub fn buffer_end(&self) -> Option<DateTime<Utc>> {
        self.buffer_end
    }

    /// Milliseconds of pre-fetched session time ahead of the clock,
    /// clamped at zero.
    pub fn buffer_remaining_ms(&self) -> i64 {
        self.buffer_end
            .map(|end| (end - self.current_time).num_milliseconds().max(0))
            .unwrap_or(0)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Claim the single refill slot. Returns false when one is already in
    /// flight; the caller must not start another.
    pub fn begin_refill(&mut self) -> bool {
        if self.refill_in_flight {
            return false;
        }
        self.refill_in_flight = true;
        true
    }

    pub fn end_refill(&mut self) {
        self.refill_in_flight = false;
    }

    pub fn set_ticker(&mut self, handle: JoinHandle<()>) {
        self.ticker = Some(handle);
    }

    pub fn take_ticker(&mut self) -> Option<JoinHandle<()>> {
        self.ticker.take()
    }

    pub fn has_ticker(&self) -> bool {
        self.ticker.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap()
    }

    fn location(offset_ms: i64, driver: u32) -> LocationSample {
        LocationSample {
            session_key: 9140,
            driver_number: driver,
            timestamp: base() + chrono::Duration::milliseconds(offset_ms),
            x: offset_ms as f64,
            y: 0.0,
        }
    }

    fn car(offset_ms: i64, driver: u32) -> CarSample {
        CarSample {
            session_key: 9140,
            driver_number: driver,
            timestamp: base() + chrono::Duration::milliseconds(offset_ms),
            speed: 280,
            rpm: 11000,
            gear: 7,
            throttle: 100,
            brake: 0,
        }
    }

    fn session() -> ReplaySession {
        ReplaySession::new(
            "9140",
            base(),
            base(),
            base() + chrono::Duration::hours(2),
            PlaybackSpeed::Normal,
        )
    }

    #[test]
    fn consume_is_half_open_ordered_and_destructive() {
        let mut session = session();
        session.append(
            vec![location(300, 1), location(0, 1), location(100, 1)],
            vec![car(100, 1)],
            base() + chrono::Duration::milliseconds(400),
        );

        let (locations, cars) =
            session.consume(base(), base() + chrono::Duration::milliseconds(300));
        let offsets: Vec<i64> = locations.iter().map(|s| s.x as i64).collect();
        assert_eq!(offsets, vec![0, 100]);
        assert_eq!(cars.len(), 1);

        // Consumed samples are gone; the rest remains.
        let (again, _) = session.consume(base(), base() + chrono::Duration::milliseconds(300));
        assert!(again.is_empty());
        let (tail, _) = session.consume(base(), base() + chrono::Duration::milliseconds(400));
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].x as i64, 300);
    }

    #[test]
    fn append_suppresses_duplicates_across_refills() {
        let mut session = session();
        session.append(
            vec![location(0, 1), location(100, 1)],
            vec![],
            base() + chrono::Duration::milliseconds(200),
        );
        // Overlapping window re-delivers the 100 ms sample.
        session.append(
            vec![location(100, 1), location(200, 1), location(100, 44)],
            vec![],
            base() + chrono::Duration::milliseconds(300),
        );

        let (locations, _) = session.consume(base(), base() + chrono::Duration::seconds(1));
        assert_eq!(locations.len(), 4);
        assert_eq!(
            session.buffer_end(),
            Some(base() + chrono::Duration::milliseconds(300))
        );
    }

    #[test]
    fn clear_drops_state_and_bumps_generation() {
        let mut session = session();
        session.append(
            vec![location(0, 1)],
            vec![car(0, 1)],
            base() + chrono::Duration::seconds(1),
        );
        let generation = session.generation();
        session.clear();
        assert_eq!(session.buffer_end(), None);
        assert_eq!(session.generation(), generation + 1);
        let (locations, cars) = session.consume(base(), base() + chrono::Duration::hours(2));
        assert!(locations.is_empty());
        assert!(cars.is_empty());
    }

    #[test]
    fn buffer_remaining_clamps_at_zero() {
        let mut session = session();
        assert_eq!(session.buffer_remaining_ms(), 0);
        session.append(vec![], vec![], base() + chrono::Duration::seconds(30));
        assert_eq!(session.buffer_remaining_ms(), 30_000);
        session.set_current_time(base() + chrono::Duration::seconds(45));
        assert_eq!(session.buffer_remaining_ms(), 0);
    }

    #[test]
    fn refill_slot_is_exclusive() {
        let mut session = session();
        assert!(session.begin_refill());
        assert!(!session.begin_refill());
        session.end_refill();
        assert!(session.begin_refill());
    }
}
