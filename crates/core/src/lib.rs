//! Core library for the Infinite Remix engine.
//!
//! A song's precomputed analysis is turned into a graph of similar beats,
//! walked forever to produce an endless beat-aligned remix, and that remix is
//! played back on the host's audio clock while the song's gameplay timeline
//! is spliced to match. Each module owns one stage of that pipeline.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod error;
pub mod graph;
pub mod remix;
pub mod session;
pub mod timeline;
pub mod timing;
pub mod walker;

pub use analysis::{Segment, TimedUnit, TrackAnalysis};
pub use audio::{AudioHost, AudioScheduler, OutputProfile, PlaybackRequest, SourceAudio, VoiceId};
pub use config::{GenerationConfig, GraphConfig, RemixConfig, SchedulerConfig, WalkerConfig};
pub use error::{RemixError, Result};
pub use graph::{GraphSummary, LoopPoint, QuantumGraph, SimilarityGraphBuilder};
pub use remix::{BeatEvent, Remix, RemixMaterializer, Slice};
pub use session::{PlaybackState, RemixSession, Transport};
pub use timeline::{BeatmapEvent, SharedTimeline, Timeline, TimelineSink, TimelineSplicer};
pub use timing::BeatGrid;
pub use walker::{InfiniteWalker, RandomSource, SeededRandom, Unit, UnitIndex};
