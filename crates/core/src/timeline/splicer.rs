use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::remix::Slice;
use crate::timeline::{BeatmapEvent, EventKind, GameplayType, TimelineSink};
use crate::timing::{is_greater, is_greater_or_equal, TimeRange};
use crate::Result;

enum Class {
    Instant,
    Spanning,
    Unsupported,
}

fn classify(event: &BeatmapEvent) -> Class {
    match &event.kind {
        EventKind::Note(note) => match note.gameplay_type {
            GameplayType::Normal | GameplayType::Bomb => Class::Instant,
            GameplayType::BurstSliderHead | GameplayType::BurstSliderElement => Class::Unsupported,
        },
        EventKind::Obstacle(_) => Class::Spanning,
        EventKind::Slider(_)
        | EventKind::BurstSlider(_)
        | EventKind::BasicEvent(_)
        | EventKind::BpmChange { .. } => Class::Instant,
        EventKind::ColorBoost { .. } | EventKind::Waypoint(_) | EventKind::SpawnRotation { .. } => {
            Class::Unsupported
        }
    }
}

/// Cuts the original gameplay timeline into slices and re-times them onto an
/// output timeline.
#[derive(Debug)]
pub struct TimelineSplicer<S> {
    /// Point-in-time events, sorted by time.
    instant: Vec<BeatmapEvent>,
    /// Events with a duration, sorted by time.
    spanning: Vec<BeatmapEvent>,
    unsupported: BTreeMap<String, usize>,
    sink: S,
}

impl<S: TimelineSink> TimelineSplicer<S> {
    /// Partitions `events` and writes the prologue (events before track time
    /// zero) to `sink` unchanged.
    pub fn new(events: impl IntoIterator<Item = BeatmapEvent>, sink: S) -> Result<Self> {
        let mut events: Vec<BeatmapEvent> = events.into_iter().collect();
        events.sort_by(|a, b| a.time.total_cmp(&b.time));

        let mut instant = Vec::new();
        let mut spanning = Vec::new();
        let mut unsupported = BTreeMap::new();
        for event in events {
            match classify(&event) {
                Class::Instant => instant.push(event),
                Class::Spanning => spanning.push(event),
                Class::Unsupported => *unsupported.entry(event.kind_name()).or_insert(0) += 1,
            }
        }

        if unsupported.is_empty() {
            info!("all beatmap event kinds are supported");
        } else {
            info!(kinds = ?unsupported, "ignoring unsupported beatmap events");
        }

        let mut splicer = Self {
            instant,
            spanning,
            unsupported,
            sink,
        };

        let prologue: Vec<BeatmapEvent> = splicer.prologue().to_vec();
        for event in prologue {
            splicer.sink.insert_in_order(event)?;
        }

        Ok(splicer)
    }

    /// Instant events before track time zero.
    pub fn prologue(&self) -> &[BeatmapEvent] {
        let end = self.instant.partition_point(|event| is_greater(0.0, event.time));
        &self.instant[..end]
    }

    /// Dropped event counts, by kind.
    pub fn unsupported_kinds(&self) -> &BTreeMap<String, usize> {
        &self.unsupported
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Copies the events inside `slice` onto the output timeline at the
    /// slice's clock. Returns the number of events inserted.
    pub fn splice(&mut self, slice: &Slice) -> Result<usize> {
        let end = slice.start + slice.duration;
        let offset = slice.clock - slice.start;

        let first = self
            .instant
            .partition_point(|event| is_greater(slice.start, event.time));
        let last = self.instant.partition_point(|event| is_greater(end, event.time));

        let mut inserted = 0;
        for event in &self.instant[first..last.max(first)] {
            // A composite that does not end inside the slice is left for a
            // slice that can hold all of it.
            if let Some(tail) = event.tail_time() {
                if !is_greater(end, tail) {
                    continue;
                }
            }
            self.sink.insert_in_order(event.shifted(offset))?;
            inserted += 1;
        }

        let range = TimeRange::new(slice.start, end);
        for event in &self.spanning {
            if is_greater_or_equal(event.time, end) {
                break;
            }

            let span = TimeRange::from_duration(event.time, event.duration().unwrap_or(0.0));
            let Some(clipped) = range.intersection(&span) else {
                continue;
            };

            let mut copy = event.clone();
            copy.time = clipped.start + offset;
            if let EventKind::Obstacle(obstacle) = &mut copy.kind {
                obstacle.duration = clipped.duration();
            }
            self.sink.insert_in_order(copy)?;
            inserted += 1;
        }

        debug!(clock = slice.clock, start = slice.start, inserted, "spliced slice");
        Ok(inserted)
    }

    pub fn splice_all(&mut self, slices: &[Slice]) -> Result<usize> {
        let mut inserted = 0;
        for slice in slices {
            inserted += self.splice(slice)?;
        }
        Ok(inserted)
    }
}
