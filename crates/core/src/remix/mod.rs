//! Folds the walker's unit stream into slices of original-track time laid
//! end to end on an ever-growing remix clock.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::timing::BeatGrid;
use crate::walker::{InfiniteWalker, Unit, UnitIndex};
use crate::{RemixError, Result};

/// A contiguous span of the original track placed on the remix timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    /// Position on the remix timeline, in seconds.
    pub clock: f64,
    /// Start within the original track, in seconds.
    pub start: f64,
    pub duration: f64,
    pub clock_beats: i64,
    pub start_beats: i64,
    pub duration_beats: i64,
}

impl Slice {
    pub fn end_clock(&self) -> f64 {
        self.clock + self.duration
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// One unit played on the remix timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub clock: f64,
    pub unit: UnitIndex,
    pub clock_beats: i64,
}

/// Slices and beat events, in remix order. Only ever appended to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Remix {
    pub slices: Vec<Slice>,
    pub beats: Vec<BeatEvent>,
}

impl Remix {
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty() && self.beats.is_empty()
    }

    /// End of the last slice on the remix timeline.
    pub fn end_clock(&self) -> f64 {
        self.slices.last().map(Slice::end_clock).unwrap_or(0.0)
    }

    pub fn append(&mut self, batch: &Remix) {
        self.slices.extend_from_slice(&batch.slices);
        self.beats.extend_from_slice(&batch.beats);
    }
}

/// A walker unit snapped to whole beats.
#[derive(Debug, Clone, Copy, PartialEq)]
struct AlignedUnit {
    index: UnitIndex,
    start_beats: i64,
    duration_beats: i64,
}

/// Slice still being extended, kept in whole beats.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OpenSlice {
    clock_beats: i64,
    start_beats: i64,
    duration_beats: i64,
}

/// Pulls units from the walker and turns them into [`Remix`] batches.
///
/// The remix clock is kept as a whole number of beats and only converted to
/// seconds on output, so it cannot drift however long the remix runs.
#[derive(Debug)]
pub struct RemixMaterializer {
    walker: InfiniteWalker,
    grid: BeatGrid,
    prev: Option<AlignedUnit>,
    open: Option<OpenSlice>,
    clock_beats: i64,
    history: Remix,
}

impl RemixMaterializer {
    pub fn new(walker: InfiniteWalker, bpm: f64) -> Result<Self> {
        if !(bpm.is_finite() && bpm > 0.0) {
            return Err(RemixError::msg(format!("invalid tempo: {bpm} bpm")));
        }

        Ok(Self {
            walker,
            grid: BeatGrid::new(bpm),
            prev: None,
            open: None,
            clock_beats: 0,
            history: Remix::default(),
        })
    }

    pub fn grid(&self) -> BeatGrid {
        self.grid
    }

    /// Every slice and beat event produced so far.
    pub fn remix(&self) -> &Remix {
        &self.history
    }

    /// Committed remix length in seconds. The unit that opened the current
    /// slice is not committed until that slice is closed.
    pub fn duration(&self) -> f64 {
        let in_flight = self.prev.map_or(0, |unit| unit.duration_beats);
        self.grid.beats_to_seconds((self.clock_beats - in_flight) as f64)
    }

    /// Generates at least `min_seconds` of new remix, always ending right
    /// after a branch so no returned slice is extended later. Returns only the
    /// new slices and beat events.
    pub fn produce_at_least(&mut self, min_seconds: f64) -> Result<Remix> {
        let mut batch = Remix::default();
        let mut produced_beats = self.prev.map_or(0, |unit| unit.duration_beats);
        let mut adjacent = true;

        while !(self.grid.beats_to_seconds(produced_beats as f64) >= min_seconds && !adjacent) {
            adjacent = true;

            let prev_unit = self.prev.map(|unit| self.unit_of(unit));
            let next = self.walker.next(prev_unit.as_ref())?;
            let unit = self.align(next)?;

            match (self.prev, self.open) {
                (Some(prev), Some(mut open)) if unit.index.follows(prev.index) => {
                    open.duration_beats += unit.duration_beats;
                    self.open = Some(open);
                }
                (Some(_), Some(open)) => {
                    adjacent = false;
                    batch.slices.push(self.close(open));
                    self.open = Some(OpenSlice {
                        clock_beats: self.clock_beats,
                        start_beats: unit.start_beats,
                        duration_beats: unit.duration_beats,
                    });
                }
                _ => {
                    self.open = Some(OpenSlice {
                        clock_beats: 0,
                        start_beats: 0,
                        duration_beats: unit.start_beats + unit.duration_beats,
                    });
                    self.clock_beats += unit.start_beats;
                    produced_beats += unit.start_beats;
                }
            }

            batch.beats.push(BeatEvent {
                clock: self.grid.beats_to_seconds(self.clock_beats as f64),
                unit: unit.index,
                clock_beats: self.clock_beats,
            });

            self.clock_beats += unit.duration_beats;
            produced_beats += unit.duration_beats;
            self.prev = Some(unit);
        }

        debug!(
            slices = batch.slices.len(),
            beats = batch.beats.len(),
            duration = self.duration(),
            "produced remix batch"
        );

        self.history.append(&batch);
        Ok(batch)
    }

    /// Snaps a unit onto the beat grid. Every beat must span exactly one beat;
    /// the lead-in may span several.
    fn align(&self, unit: Unit) -> Result<AlignedUnit> {
        let duration_beats = self.grid.aligned_beats(unit.duration);
        if let UnitIndex::Beat(index) = unit.index {
            if duration_beats != 1 {
                return Err(RemixError::BeatAlignment {
                    index,
                    beats: self.grid.seconds_to_beats(unit.duration),
                });
            }
        }

        Ok(AlignedUnit {
            index: unit.index,
            start_beats: self.grid.aligned_beats(unit.start),
            duration_beats,
        })
    }

    fn unit_of(&self, unit: AlignedUnit) -> Unit {
        Unit {
            index: unit.index,
            start: self.grid.beats_to_seconds(unit.start_beats as f64),
            duration: self.grid.beats_to_seconds(unit.duration_beats as f64),
        }
    }

    fn close(&self, open: OpenSlice) -> Slice {
        Slice {
            clock: self.grid.beats_to_seconds(open.clock_beats as f64),
            start: self.grid.beats_to_seconds(open.start_beats as f64),
            duration: self.grid.beats_to_seconds(open.duration_beats as f64),
            clock_beats: open.clock_beats,
            start_beats: open.start_beats,
            duration_beats: open.duration_beats,
        }
    }
}
