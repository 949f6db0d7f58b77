//! Tolerant float comparisons and the small time types shared by the
//! materializer, the audio scheduler and the timeline splicer.

use serde::{Deserialize, Serialize};

/// Two times closer than this are considered equal.
pub const FLOAT_TOLERANCE: f64 = 0.001;

pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= FLOAT_TOLERANCE
}

pub fn is_greater(a: f64, b: f64) -> bool {
    a > b && !approx_eq(a, b)
}

pub fn is_greater_or_equal(a: f64, b: f64) -> bool {
    a > b || approx_eq(a, b)
}

pub fn is_less(a: f64, b: f64) -> bool {
    a < b && !approx_eq(a, b)
}

pub fn is_less_or_equal(a: f64, b: f64) -> bool {
    a < b || approx_eq(a, b)
}

/// Half-open `[start, end)` interval of track time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn from_duration(start: f64, duration: f64) -> Self {
        Self::new(start, start + duration)
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Ranges that merely touch do not intersect.
    pub fn intersects(&self, other: &TimeRange) -> bool {
        !(is_less_or_equal(self.end, other.start) || is_less_or_equal(other.end, self.start))
    }

    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        if !self.intersects(other) {
            return None;
        }

        Some(TimeRange::new(
            self.start.max(other.start),
            self.end.min(other.end),
        ))
    }
}

/// Converts between seconds and beats at a fixed tempo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatGrid {
    bpm: f64,
}

impl BeatGrid {
    pub fn new(bpm: f64) -> Self {
        Self { bpm }
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn seconds_to_beats(&self, seconds: f64) -> f64 {
        seconds / 60.0 * self.bpm
    }

    pub fn beats_to_seconds(&self, beats: f64) -> f64 {
        beats / self.bpm * 60.0
    }

    /// Rounds `seconds` to the nearest whole number of beats.
    pub fn aligned_beats(&self, seconds: f64) -> i64 {
        self.seconds_to_beats(seconds).round() as i64
    }

    /// Snaps `seconds` onto the nearest beat boundary.
    pub fn align_seconds(&self, seconds: f64) -> f64 {
        self.beats_to_seconds(self.aligned_beats(seconds) as f64)
    }
}
