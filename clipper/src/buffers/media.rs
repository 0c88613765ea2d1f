//! Rolling window of recently downloaded media segments.

use std::time::Duration;

use hls_tail::MediaSegment;
use parking_lot::Mutex;
use tracing::trace;

/// Segments ordered by sequence id, bounded by their summed duration.
///
/// Eviction always drops the lowest sequence id. A single segment longer than the
/// bound is kept on its own so the buffer never empties itself on insert.
#[derive(Debug)]
pub struct MediaBuffer {
    max_duration: f64,
    state: Mutex<MediaState>,
}

#[derive(Debug, Default)]
struct MediaState {
    segments: Vec<MediaSegment>,
    total_duration: f64,
}

impl MediaBuffer {
    pub fn new(max_duration: Duration) -> Self {
        Self {
            max_duration: max_duration.as_secs_f64(),
            state: Mutex::new(MediaState::default()),
        }
    }

    /// Insert `segment` at its sequence position. Returns `false` for a duplicate id.
    pub fn insert(&self, segment: MediaSegment) -> bool {
        let mut state = self.state.lock();

        let pos = match state
            .segments
            .binary_search_by_key(&segment.sequence_id, |s| s.sequence_id)
        {
            Ok(_) => return false,
            Err(pos) => pos,
        };

        state.total_duration += segment.duration;
        state.segments.insert(pos, segment);

        while state.total_duration > self.max_duration && state.segments.len() > 1 {
            let evicted = state.segments.remove(0);
            state.total_duration -= evicted.duration;
            trace!(msn = evicted.sequence_id, "Evicted media segment");
        }

        true
    }

    pub fn contains(&self, sequence_id: u64) -> bool {
        self.state
            .lock()
            .segments
            .binary_search_by_key(&sequence_id, |s| s.sequence_id)
            .is_ok()
    }

    /// Ascending snapshot of the retained segments. Payloads are shared, not copied.
    pub fn segments(&self) -> Vec<MediaSegment> {
        self.state.lock().segments.clone()
    }

    /// Summed duration of the retained segments, in seconds.
    pub fn total_duration(&self) -> f64 {
        self.state.lock().total_duration
    }

    pub fn max_duration(&self) -> f64 {
        self.max_duration
    }

    pub fn len(&self) -> usize {
        self.state.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().segments.is_empty()
    }
}
