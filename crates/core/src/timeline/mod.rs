//! Gameplay events and the output timeline they are spliced into.

mod splicer;

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::{RemixError, Result};

pub use splicer::TimelineSplicer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteColor {
    #[default]
    None,
    Red,
    Blue,
}

/// How a note behaves in play. Only normal notes and bombs can be spliced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameplayType {
    #[default]
    Normal,
    Bomb,
    BurstSliderHead,
    BurstSliderElement,
}

impl GameplayType {
    pub fn as_str(self) -> &'static str {
        match self {
            GameplayType::Normal => "normal",
            GameplayType::Bomb => "bomb",
            GameplayType::BurstSliderHead => "burst_slider_head",
            GameplayType::BurstSliderElement => "burst_slider_element",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoteData {
    pub color: NoteColor,
    pub line_index: i32,
    pub line_layer: i32,
    pub cut_direction: i32,
    pub gameplay_type: GameplayType,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObstacleData {
    pub duration: f64,
    pub line_index: i32,
    pub line_layer: i32,
    pub width: i32,
    pub height: i32,
}

/// Arc or chain connecting a head at the event time to a tail at `tail_time`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SliderData {
    pub tail_time: f64,
    pub color: NoteColor,
    pub head_line_index: i32,
    pub head_line_layer: i32,
    pub tail_line_index: i32,
    pub tail_line_layer: i32,
    /// Chain links, for burst sliders.
    pub slice_count: u32,
    pub squish: f64,
}

/// Lighting event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasicEventData {
    pub event_type: i32,
    pub value: i32,
    pub float_value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaypointData {
    pub line_index: i32,
    pub line_layer: i32,
    pub offset_direction: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Note(NoteData),
    Obstacle(ObstacleData),
    Slider(SliderData),
    BurstSlider(SliderData),
    BasicEvent(BasicEventData),
    BpmChange { bpm: f64 },
    ColorBoost { enabled: bool },
    Waypoint(WaypointData),
    SpawnRotation { rotation: f64 },
}

/// One gameplay event at `time` seconds of track time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatmapEvent {
    pub time: f64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl BeatmapEvent {
    pub fn new(time: f64, kind: EventKind) -> Self {
        Self { time, kind }
    }

    pub fn note(time: f64, note: NoteData) -> Self {
        Self::new(time, EventKind::Note(note))
    }

    pub fn obstacle(time: f64, duration: f64) -> Self {
        Self::new(
            time,
            EventKind::Obstacle(ObstacleData {
                duration,
                width: 1,
                height: 5,
                ..Default::default()
            }),
        )
    }

    /// Event kind as reported in the unsupported-events summary.
    pub fn kind_name(&self) -> String {
        match &self.kind {
            EventKind::Note(note) => format!("note/{}", note.gameplay_type.as_str()),
            EventKind::Obstacle(_) => "obstacle".into(),
            EventKind::Slider(_) => "slider".into(),
            EventKind::BurstSlider(_) => "burst_slider".into(),
            EventKind::BasicEvent(_) => "basic_event".into(),
            EventKind::BpmChange { .. } => "bpm_change".into(),
            EventKind::ColorBoost { .. } => "color_boost".into(),
            EventKind::Waypoint(_) => "waypoint".into(),
            EventKind::SpawnRotation { .. } => "spawn_rotation".into(),
        }
    }

    /// Tail of a head/tail composite.
    pub fn tail_time(&self) -> Option<f64> {
        match &self.kind {
            EventKind::Slider(slider) | EventKind::BurstSlider(slider) => Some(slider.tail_time),
            _ => None,
        }
    }

    pub fn duration(&self) -> Option<f64> {
        match &self.kind {
            EventKind::Obstacle(obstacle) => Some(obstacle.duration),
            _ => None,
        }
    }

    /// Copy moved by `offset` seconds, tail included.
    pub fn shifted(&self, offset: f64) -> Self {
        let mut event = self.clone();
        event.time += offset;
        if let EventKind::Slider(slider) | EventKind::BurstSlider(slider) = &mut event.kind {
            slider.tail_time += offset;
        }
        event
    }
}

/// Reads a beatmap event list from JSON.
pub fn events_from_json_str(json: &str) -> Result<Vec<BeatmapEvent>> {
    Ok(serde_json::from_str(json)?)
}

pub fn events_from_json_file(path: impl AsRef<std::path::Path>) -> Result<Vec<BeatmapEvent>> {
    let contents = std::fs::read_to_string(path)?;
    events_from_json_str(&contents)
}

/// Destination for spliced events.
pub trait TimelineSink {
    fn insert_in_order(&mut self, event: BeatmapEvent) -> Result<()>;
}

impl<T: TimelineSink + ?Sized> TimelineSink for Box<T> {
    fn insert_in_order(&mut self, event: BeatmapEvent) -> Result<()> {
        (**self).insert_in_order(event)
    }
}

/// Time-ordered list of events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timeline {
    events: Vec<BeatmapEvent>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events(mut events: Vec<BeatmapEvent>) -> Self {
        events.sort_by(|a, b| a.time.total_cmp(&b.time));
        Self { events }
    }

    pub fn events(&self) -> &[BeatmapEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<BeatmapEvent> {
        self.events
    }

    /// Inserts after every event at the same time, keeping insertion order
    /// among simultaneous events.
    pub fn insert(&mut self, event: BeatmapEvent) {
        let at = self.events.partition_point(|existing| existing.time <= event.time);
        self.events.insert(at, event);
    }
}

impl TimelineSink for Timeline {
    fn insert_in_order(&mut self, event: BeatmapEvent) -> Result<()> {
        self.insert(event);
        Ok(())
    }
}

/// [`Timeline`] shared between the thread splicing into it and its readers.
#[derive(Debug, Clone, Default)]
pub struct SharedTimeline {
    inner: Arc<Mutex<Timeline>>,
}

impl SharedTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    pub fn snapshot(&self) -> Result<Timeline> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Timeline>> {
        self.inner
            .lock()
            .map_err(|_| RemixError::Poisoned("output timeline"))
    }
}

impl TimelineSink for SharedTimeline {
    fn insert_in_order(&mut self, event: BeatmapEvent) -> Result<()> {
        self.lock()?.insert(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_events() {
        let json = r#"[
            { "time": 1.5, "type": "note", "color": "red", "line_index": 2 },
            { "time": 2.0, "type": "obstacle", "duration": 4.0, "width": 2 },
            { "time": 3.0, "type": "slider", "tail_time": 4.0 },
            { "time": -100.0, "type": "bpm_change", "bpm": 128.0 },
            { "time": 5.0, "type": "note", "gameplay_type": "burst_slider_head" }
        ]"#;

        let events = events_from_json_str(json).unwrap();
        assert_eq!(events.len(), 5);
        assert!(matches!(
            &events[0].kind,
            EventKind::Note(NoteData { color: NoteColor::Red, line_index: 2, .. })
        ));
        assert_eq!(events[1].duration(), Some(4.0));
        assert_eq!(events[2].tail_time(), Some(4.0));
        assert_eq!(events[3].kind, EventKind::BpmChange { bpm: 128.0 });
        assert_eq!(events[4].kind_name(), "note/burst_slider_head");
    }

    #[test]
    fn shifting_moves_slider_tails() {
        let slider = BeatmapEvent::new(
            3.0,
            EventKind::BurstSlider(SliderData {
                tail_time: 3.5,
                slice_count: 4,
                ..Default::default()
            }),
        );

        let shifted = slider.shifted(10.0);
        assert_eq!(shifted.time, 13.0);
        assert_eq!(shifted.tail_time(), Some(13.5));
    }

    #[test]
    fn timeline_keeps_events_sorted_and_stable() {
        let mut timeline = Timeline::from_events(vec![
            BeatmapEvent::obstacle(4.0, 1.0),
            BeatmapEvent::note(1.0, NoteData::default()),
        ]);
        timeline.insert(BeatmapEvent::new(2.0, EventKind::ColorBoost { enabled: true }));
        timeline.insert(BeatmapEvent::new(1.0, EventKind::SpawnRotation { rotation: 15.0 }));

        let times: Vec<f64> = timeline.events().iter().map(|event| event.time).collect();
        assert_eq!(times, vec![1.0, 1.0, 2.0, 4.0]);
        assert_eq!(timeline.events()[1].kind_name(), "spawn_rotation");
    }

    #[test]
    fn shared_timeline_is_visible_through_clones() {
        let shared = SharedTimeline::new();
        let mut writer = shared.clone();
        writer
            .insert_in_order(BeatmapEvent::note(0.5, NoteData::default()))
            .unwrap();

        assert_eq!(shared.len().unwrap(), 1);
        assert_eq!(shared.snapshot().unwrap().events()[0].time, 0.5);
    }
}
