//! Reading-speed estimation from page-view events.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::storage::{now_ms, reading_session_key, PersistQueue};

const VELOCITY_ALPHA: f64 = 0.3;
pub const INITIAL_VELOCITY: f64 = 5.0;
/// Page changes closer together than this are jumps, not reading.
const MIN_PAGE_INTERVAL: Duration = Duration::from_millis(500);
const MIN_DIRECTION_SAMPLES: u32 = 3;

/// Pages-per-minute upper bounds and the chapter buffer each maps to.
const BUFFER_THRESHOLDS: [(f64, usize); 3] = [(2.0, 1), (5.0, 2), (15.0, 3)];
const MAX_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationDirection {
    Forward,
    Backward,
    Mixed,
}

impl NavigationDirection {
    /// Share of the look-ahead window that goes to chapters after the current one.
    pub fn ahead_share(self) -> f64 {
        match self {
            NavigationDirection::Forward => 0.8,
            NavigationDirection::Backward => 0.2,
            NavigationDirection::Mixed => 0.5,
        }
    }

    /// Split `buffer` chapters into `(ahead, behind)`. The favoured side gets
    /// its rounded share, and at least one chapter when there is any buffer.
    pub fn split(self, buffer: usize) -> (usize, usize) {
        let share = buffer as f64 * self.ahead_share().max(1.0 - self.ahead_share());
        let favoured = (share.round() as usize).max(1).min(buffer);
        let other = buffer - favoured;
        match self {
            NavigationDirection::Backward => (other, favoured),
            NavigationDirection::Forward | NavigationDirection::Mixed => (favoured, other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadingSession {
    pub source_id: String,
    pub manga_id: String,
    pub chapter_id: String,
    pub start_time: Instant,
    pub started_at_ms: u64,
    pub pages_viewed: u32,
    pub completed: bool,
}

/// What a finished session is reduced to before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingSessionRecord {
    pub source_id: String,
    pub manga_id: String,
    pub chapter_id: String,
    pub started_at: u64,
    pub reading_time_ms: u64,
    pub pages_viewed: u32,
    pub forward_count: u32,
    pub backward_count: u32,
    pub avg_velocity: f64,
    pub completed: bool,
}

pub struct ReadingVelocityTracker {
    session: Option<ReadingSession>,
    forward_count: u32,
    backward_count: u32,
    /// Pages per minute. Carried across sessions.
    reading_velocity: f64,
    last_page_index: Option<i64>,
    last_page_change: Option<Instant>,
    persist: Option<PersistQueue>,
}

impl ReadingVelocityTracker {
    pub fn new(persist: Option<PersistQueue>) -> Self {
        Self {
            session: None,
            forward_count: 0,
            backward_count: 0,
            reading_velocity: INITIAL_VELOCITY,
            last_page_index: None,
            last_page_change: None,
            persist,
        }
    }

    pub fn start_session(&mut self, source_id: &str, manga_id: &str, chapter_id: &str) {
        self.start_session_at(source_id, manga_id, chapter_id, Instant::now());
    }

    pub fn start_session_at(
        &mut self,
        source_id: &str,
        manga_id: &str,
        chapter_id: &str,
        now: Instant,
    ) {
        self.session = Some(ReadingSession {
            source_id: source_id.to_string(),
            manga_id: manga_id.to_string(),
            chapter_id: chapter_id.to_string(),
            start_time: now,
            started_at_ms: now_ms(),
            pages_viewed: 0,
            completed: false,
        });
        self.forward_count = 0;
        self.backward_count = 0;
        self.last_page_index = None;
        self.last_page_change = None;
    }

    pub fn record_page_view(&mut self, page_index: i64) {
        self.record_page_view_at(page_index, Instant::now());
    }

    pub fn record_page_view_at(&mut self, page_index: i64, now: Instant) {
        if let Some(session) = self.session.as_mut() {
            session.pages_viewed += 1;
        }

        let (Some(last_index), Some(last_change)) = (self.last_page_index, self.last_page_change)
        else {
            self.last_page_index = Some(page_index);
            self.last_page_change = Some(now);
            return;
        };

        let page_delta = page_index - last_index;
        let time_delta = now.saturating_duration_since(last_change);

        if page_delta > 0 {
            self.forward_count += 1;
        } else if page_delta < 0 {
            self.backward_count += 1;
        }

        if time_delta >= MIN_PAGE_INTERVAL && page_delta != 0 {
            let minutes = time_delta.as_secs_f64() / 60.0;
            let instant_velocity = page_delta.unsigned_abs() as f64 / minutes;
            self.reading_velocity =
                VELOCITY_ALPHA * instant_velocity + (1.0 - VELOCITY_ALPHA) * self.reading_velocity;
        }

        self.last_page_index = Some(page_index);
        self.last_page_change = Some(now);
    }

    pub fn reading_velocity(&self) -> f64 {
        self.reading_velocity
    }

    pub fn session(&self) -> Option<&ReadingSession> {
        self.session.as_ref()
    }

    /// Chapters to keep prefetched for the current reading speed.
    pub fn calculate_adaptive_buffer(&self) -> usize {
        BUFFER_THRESHOLDS
            .iter()
            .find(|(max_velocity, _)| self.reading_velocity <= *max_velocity)
            .map(|(_, buffer)| *buffer)
            .unwrap_or(MAX_BUFFER)
    }

    pub fn get_navigation_direction(&self) -> NavigationDirection {
        let total = self.forward_count + self.backward_count;
        if total < MIN_DIRECTION_SAMPLES {
            return NavigationDirection::Mixed;
        }

        let forward_ratio = f64::from(self.forward_count) / f64::from(total);
        if forward_ratio >= 0.8 {
            NavigationDirection::Forward
        } else if forward_ratio <= 0.2 {
            NavigationDirection::Backward
        } else {
            NavigationDirection::Mixed
        }
    }

    /// Close the current session, queue its record for storage and return it.
    pub fn end_session(&mut self, completed: bool) -> Option<ReadingSessionRecord> {
        self.end_session_at(completed, Instant::now())
    }

    pub fn end_session_at(&mut self, completed: bool, now: Instant) -> Option<ReadingSessionRecord> {
        let mut session = self.session.take()?;
        session.completed = completed;

        let record = ReadingSessionRecord {
            reading_time_ms: now.saturating_duration_since(session.start_time).as_millis() as u64,
            pages_viewed: session.pages_viewed,
            forward_count: self.forward_count,
            backward_count: self.backward_count,
            avg_velocity: self.reading_velocity,
            completed: session.completed,
            started_at: session.started_at_ms,
            source_id: session.source_id,
            manga_id: session.manga_id,
            chapter_id: session.chapter_id,
        };

        if let Some(persist) = &self.persist {
            persist.put_serialized(
                reading_session_key(&record.source_id, &record.chapter_id, record.started_at),
                &record,
            );
        }

        self.forward_count = 0;
        self.backward_count = 0;
        self.last_page_index = None;
        self.last_page_change = None;

        Some(record)
    }
}

impl Default for ReadingVelocityTracker {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::storage::{MemoryStorage, Storage};
    use std::sync::Arc;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{} != {}", a, b);
    }

    fn tracker_with_velocity(velocity: f64) -> ReadingVelocityTracker {
        let mut tracker = ReadingVelocityTracker::default();
        tracker.reading_velocity = velocity;
        tracker
    }

    #[test]
    fn single_forward_flip_updates_ewma() {
        let t0 = Instant::now();
        let mut tracker = ReadingVelocityTracker::default();
        tracker.start_session_at("src", "manga", "ch1", t0);

        tracker.record_page_view_at(0, t0);
        assert_close(tracker.reading_velocity(), INITIAL_VELOCITY);

        tracker.record_page_view_at(1, t0 + Duration::from_millis(3000));
        assert_close(tracker.reading_velocity(), 9.5);
    }

    #[test]
    fn rapid_flips_only_move_markers() {
        let t0 = Instant::now();
        let mut tracker = ReadingVelocityTracker::default();
        tracker.start_session_at("src", "manga", "ch1", t0);

        tracker.record_page_view_at(0, t0);
        tracker.record_page_view_at(10, t0 + Duration::from_millis(100));
        assert_close(tracker.reading_velocity(), INITIAL_VELOCITY);
        assert_eq!(tracker.forward_count, 1);

        // Measured from the jump, not from page 0.
        tracker.record_page_view_at(11, t0 + Duration::from_millis(3100));
        assert_close(tracker.reading_velocity(), 9.5);
    }

    #[test]
    fn same_page_counts_no_direction() {
        let t0 = Instant::now();
        let mut tracker = ReadingVelocityTracker::default();
        tracker.start_session_at("src", "manga", "ch1", t0);
        tracker.record_page_view_at(3, t0);
        tracker.record_page_view_at(3, t0 + Duration::from_secs(5));
        assert_eq!(tracker.forward_count + tracker.backward_count, 0);
        assert_close(tracker.reading_velocity(), INITIAL_VELOCITY);
    }

    #[test]
    fn adaptive_buffer_thresholds() {
        assert_eq!(tracker_with_velocity(1.0).calculate_adaptive_buffer(), 1);
        assert_eq!(tracker_with_velocity(2.0).calculate_adaptive_buffer(), 1);
        assert_eq!(tracker_with_velocity(3.0).calculate_adaptive_buffer(), 2);
        assert_eq!(tracker_with_velocity(5.0).calculate_adaptive_buffer(), 2);
        assert_eq!(tracker_with_velocity(10.0).calculate_adaptive_buffer(), 3);
        assert_eq!(tracker_with_velocity(15.0).calculate_adaptive_buffer(), 3);
        assert_eq!(tracker_with_velocity(100.0).calculate_adaptive_buffer(), 4);

        let mut last = 0;
        for v in 0..200 {
            let buffer = tracker_with_velocity(v as f64 * 0.5).calculate_adaptive_buffer();
            assert!(buffer >= last);
            last = buffer;
        }
    }

    #[test]
    fn direction_needs_three_samples() {
        let t0 = Instant::now();
        let mut tracker = ReadingVelocityTracker::default();
        tracker.start_session_at("src", "manga", "ch1", t0);
        tracker.record_page_view_at(0, t0);
        tracker.record_page_view_at(1, t0 + Duration::from_secs(1));
        tracker.record_page_view_at(2, t0 + Duration::from_secs(2));
        assert_eq!(tracker.get_navigation_direction(), NavigationDirection::Mixed);

        tracker.record_page_view_at(3, t0 + Duration::from_secs(3));
        assert_eq!(tracker.get_navigation_direction(), NavigationDirection::Forward);
    }

    #[test]
    fn direction_classification() {
        let mut tracker = ReadingVelocityTracker::default();
        tracker.forward_count = 1;
        tracker.backward_count = 4;
        assert_eq!(tracker.get_navigation_direction(), NavigationDirection::Backward);
        tracker.forward_count = 3;
        tracker.backward_count = 2;
        assert_eq!(tracker.get_navigation_direction(), NavigationDirection::Mixed);
        tracker.forward_count = 8;
        tracker.backward_count = 2;
        assert_eq!(tracker.get_navigation_direction(), NavigationDirection::Forward);
    }

    #[test]
    fn direction_splits_favour_bias() {
        assert_eq!(NavigationDirection::Forward.split(1), (1, 0));
        assert_eq!(NavigationDirection::Forward.split(2), (2, 0));
        assert_eq!(NavigationDirection::Forward.split(4), (3, 1));
        assert_eq!(NavigationDirection::Forward.split(5), (4, 1));
        assert_eq!(NavigationDirection::Backward.split(5), (1, 4));
        assert_eq!(NavigationDirection::Mixed.split(3), (2, 1));
        assert_eq!(NavigationDirection::Mixed.split(1), (1, 0));
        assert_eq!(NavigationDirection::Mixed.split(0), (0, 0));
    }

    #[test]
    fn new_session_keeps_velocity_but_resets_counters() {
        let t0 = Instant::now();
        let mut tracker = ReadingVelocityTracker::default();
        tracker.start_session_at("src", "manga", "ch1", t0);
        tracker.record_page_view_at(0, t0);
        tracker.record_page_view_at(1, t0 + Duration::from_secs(3));
        tracker.end_session_at(true, t0 + Duration::from_secs(4));

        tracker.start_session_at("src", "manga", "ch2", t0 + Duration::from_secs(5));
        assert_close(tracker.reading_velocity(), 9.5);
        assert_eq!(tracker.forward_count, 0);
        assert_eq!(tracker.last_page_index, None);
    }

    #[tokio::test]
    async fn end_session_flushes_record() {
        let storage = MemoryStorage::new();
        let (queue, _handle) = PersistQueue::spawn(Arc::new(storage.clone()));
        let mut tracker = ReadingVelocityTracker::new(Some(queue.clone()));

        let t0 = Instant::now();
        tracker.start_session_at("src", "manga", "ch1", t0);
        tracker.record_page_view_at(0, t0);
        tracker.record_page_view_at(1, t0 + Duration::from_secs(3));
        tracker.record_page_view_at(0, t0 + Duration::from_secs(6));
        let record = tracker.end_session_at(false, t0 + Duration::from_secs(10)).unwrap();
        queue.flush().await;

        assert_eq!(record.pages_viewed, 3);
        assert_eq!(record.forward_count, 1);
        assert_eq!(record.backward_count, 1);
        assert_eq!(record.reading_time_ms, 10_000);
        assert!(!record.completed);
        assert!(tracker.session().is_none());
        assert!(tracker.end_session(true).is_none());

        let rows = storage.scan_prefix("reading_session:src:ch1:").await.unwrap();
        assert_eq!(rows.len(), 1);
        let stored: ReadingSessionRecord = serde_json::from_value(rows[0].1.clone()).unwrap();
        assert_eq!(stored, record);
    }
}
