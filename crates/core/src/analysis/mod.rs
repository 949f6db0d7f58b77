use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::timing::{approx_eq, is_greater_or_equal, is_less};
use crate::{RemixError, Result};

/// A coarse analysis unit (section, bar, beat or tatum).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimedUnit {
    pub start: f64,
    pub duration: f64,
    #[serde(default)]
    pub confidence: f64,
}

impl TimedUnit {
    pub fn new(start: f64, duration: f64) -> Self {
        Self {
            start,
            duration,
            confidence: 1.0,
        }
    }

    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// The finest-grained analysis unit, carrying the acoustic features the
/// similarity metric compares.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub start: f64,
    pub duration: f64,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub loudness_start: f64,
    #[serde(default)]
    pub loudness_max: f64,
    #[serde(default)]
    pub loudness_max_time: f64,
    #[serde(default)]
    pub pitches: Vec<f64>,
    #[serde(default)]
    pub timbre: Vec<f64>,
}

impl Segment {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Precomputed rhythmic and timbral analysis of one song.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackAnalysis {
    pub sections: Vec<TimedUnit>,
    pub bars: Vec<TimedUnit>,
    pub beats: Vec<TimedUnit>,
    pub tatums: Vec<TimedUnit>,
    pub segments: Vec<Segment>,
}

impl TrackAnalysis {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Moves every timestamp by `offset` seconds so the analysis lines up with
    /// the host's audio file. Units pushed before the start of the track are
    /// dropped.
    pub fn shift_timestamps(&mut self, offset: f64) {
        if approx_eq(offset, 0.0) {
            return;
        }

        for list in [
            &mut self.sections,
            &mut self.bars,
            &mut self.beats,
            &mut self.tatums,
        ] {
            list.iter_mut().for_each(|unit| unit.start += offset);
            list.retain(|unit| !is_less(unit.start, 0.0));
        }

        self.segments.iter_mut().for_each(|seg| seg.start += offset);
        self.segments.retain(|seg| !is_less(seg.start, 0.0));
    }

    /// Drops units starting at or after the host's reported track duration.
    pub fn trim_to_duration(&mut self, track_duration: f64) {
        for list in [
            &mut self.sections,
            &mut self.bars,
            &mut self.beats,
            &mut self.tatums,
        ] {
            list.retain(|unit| !is_greater_or_equal(unit.start, track_duration));
        }

        self.segments
            .retain(|seg| !is_greater_or_equal(seg.start, track_duration));
    }

    /// Checks the invariants the graph builder relies on.
    pub fn validate(&self) -> Result<()> {
        if self.beats.is_empty() {
            return Err(RemixError::invalid_analysis("analysis contains no beats"));
        }

        for (index, beat) in self.beats.iter().enumerate() {
            if beat.duration < 0.0 || beat.start < 0.0 {
                return Err(RemixError::invalid_analysis(format!(
                    "beat {index} has a negative start or duration"
                )));
            }
        }

        if let Some(index) = self
            .beats
            .windows(2)
            .position(|pair| pair[1].start <= pair[0].start)
        {
            return Err(RemixError::invalid_analysis(format!(
                "beat {} does not start after beat {index}",
                index + 1
            )));
        }

        if let Some(index) = self.segments.iter().position(|seg| seg.duration < 0.0) {
            return Err(RemixError::invalid_analysis(format!(
                "segment {index} has a negative duration"
            )));
        }

        Ok(())
    }

    /// End of the last beat or segment, whichever is later.
    pub fn duration(&self) -> f64 {
        let beats = self.beats.last().map(TimedUnit::end).unwrap_or(0.0);
        let segments = self.segments.last().map(Segment::end).unwrap_or(0.0);
        beats.max(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis() -> TrackAnalysis {
        TrackAnalysis {
            bars: vec![TimedUnit::new(0.5, 4.0)],
            beats: (0..4).map(|i| TimedUnit::new(0.5 + i as f64, 1.0)).collect(),
            segments: vec![Segment {
                start: 0.5,
                duration: 4.0,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn parses_spotify_style_documents() {
        let json = r#"{
            "bars": [{ "start": 0.0, "duration": 2.0, "confidence": 0.9 }],
            "beats": [{ "start": 0.0, "duration": 1.0 }, { "start": 1.0, "duration": 1.0 }],
            "segments": [{
                "start": 0.0, "duration": 2.0, "confidence": 0.5,
                "loudness_start": -20.0, "loudness_max": -5.0,
                "pitches": [1.0, 0.5], "timbre": [40.0, 2.0]
            }]
        }"#;

        let analysis = TrackAnalysis::from_json_str(json).unwrap();
        assert_eq!(analysis.beats.len(), 2);
        assert!(analysis.sections.is_empty());
        assert_eq!(analysis.segments[0].loudness_max, -5.0);
        assert!(analysis.validate().is_ok());
    }

    #[test]
    fn shifting_drops_units_before_zero() {
        let mut analysis = analysis();
        analysis.shift_timestamps(-1.0);

        assert_eq!(analysis.beats.len(), 3);
        assert!((analysis.beats[0].start - 0.5).abs() < 1e-9);
        assert!(analysis.bars.is_empty());
        assert!(analysis.segments.is_empty());
    }

    #[test]
    fn trimming_respects_track_duration() {
        let mut analysis = analysis();
        analysis.trim_to_duration(2.5);

        assert_eq!(analysis.beats.len(), 2);
        assert_eq!(analysis.bars.len(), 1);
    }

    #[test]
    fn rejects_beatless_analysis() {
        let err = TrackAnalysis::default().validate().unwrap_err();
        assert!(format!("{err}").contains("no beats"));
    }

    #[test]
    fn rejects_out_of_order_beats() {
        let mut analysis = analysis();
        analysis.beats.swap(1, 2);
        assert!(matches!(
            analysis.validate(),
            Err(RemixError::InvalidAnalysis(_))
        ));
    }
}
