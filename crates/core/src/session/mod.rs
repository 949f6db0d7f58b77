//! Drives a remix while the song plays: keeps generating ahead of the
//! playhead and feeds every batch to the audio scheduler and the splicer.

mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::audio::{AudioScheduler, SliceQueue};
use crate::config::GenerationConfig;
use crate::remix::{Remix, RemixMaterializer};
use crate::timeline::{TimelineSink, TimelineSplicer};
use crate::Result;

pub use worker::{is_cancelled, sleep_or_cancel, CancelSignal, LoopWorker};

/// Output timeline handed to a session.
pub type BoxedSink = Box<dyn TimelineSink + Send>;

/// The host's song clock.
pub trait Transport: Send + Sync {
    /// Playhead position on the remix timeline, in seconds.
    fn song_time(&self) -> f64;

    fn time_scale(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    #[default]
    Stopped,
    Paused,
    Playing,
}

/// State owned by the generation loop.
struct GenerationLoop {
    materializer: RemixMaterializer,
    splicer: TimelineSplicer<BoxedSink>,
    queue: SliceQueue,
    transport: Arc<dyn Transport>,
    config: GenerationConfig,
}

impl GenerationLoop {
    fn run(&mut self, cancel: &CancelSignal) -> Result<()> {
        loop {
            let time_scale = match self.transport.time_scale() {
                scale if scale > 0.0 => scale,
                _ => 1.0,
            };
            let wake_at = self.materializer.duration() - self.config.lookahead_seconds;
            let sleep = (wake_at - self.transport.song_time()) / time_scale;
            if sleep_or_cancel(cancel, sleep) {
                return Ok(());
            }

            if let Err(err) = self.generate(self.config.batch_seconds) {
                error!(error = %err, "remix generation stopped");
                return Err(err);
            }
        }
    }

    /// Produces at least `seconds` more remix and hands the new slices to the
    /// audio scheduler and the splicer. Only materializer errors are returned;
    /// downstream failures are logged.
    fn generate(&mut self, seconds: f64) -> Result<()> {
        let batch = self.materializer.produce_at_least(seconds)?;

        if let Err(err) = self.queue.push(&batch.slices) {
            warn!(error = %err, "failed to enqueue slices for playback");
        }
        for slice in &batch.slices {
            if let Err(err) = self.splicer.splice(slice) {
                warn!(error = %err, clock = slice.clock, "failed to splice slice");
            }
        }

        debug!(
            slices = batch.slices.len(),
            duration = self.materializer.duration(),
            "published remix batch"
        );
        Ok(())
    }
}

/// A remix playthrough. Loops run while the host is playing and are torn
/// down on pause, stop or drop. A generation failure ends the generation
/// loop; it is returned by the next [`RemixSession::check`],
/// [`RemixSession::start`] or [`RemixSession::stop`].
pub struct RemixSession {
    generation: LoopWorker<GenerationLoop>,
    audio: AudioScheduler,
    state: PlaybackState,
}

impl RemixSession {
    /// Wires the pieces together and generates the first
    /// `config.initial_seconds` of remix before anything plays.
    pub fn new(
        materializer: RemixMaterializer,
        splicer: TimelineSplicer<BoxedSink>,
        audio: AudioScheduler,
        transport: Arc<dyn Transport>,
        config: GenerationConfig,
    ) -> Result<Self> {
        let initial_seconds = config.initial_seconds;
        let mut generation = GenerationLoop {
            materializer,
            splicer,
            queue: audio.queue(),
            transport,
            config,
        };
        generation.generate(initial_seconds)?;
        info!(
            duration = generation.materializer.duration(),
            "generated opening remix"
        );

        Ok(Self {
            generation: LoopWorker::new("remix-generation", generation),
            audio,
            state: PlaybackState::Stopped,
        })
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    /// Follows the host transport: loops run only while playing.
    pub fn set_playback_state(&mut self, state: PlaybackState) -> Result<()> {
        match state {
            PlaybackState::Playing => self.start()?,
            PlaybackState::Paused | PlaybackState::Stopped => self.stop()?,
        }
        self.state = state;
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        self.audio.start()?;
        if let Err(err) = self.generation.start(GenerationLoop::run) {
            self.audio.stop()?;
            return Err(err);
        }
        info!("remix session started");
        Ok(())
    }

    /// Stops both loops. Both are always stopped; the first failure is
    /// returned.
    pub fn stop(&mut self) -> Result<()> {
        if self.generation.is_idle() && !self.audio.is_running() {
            return Ok(());
        }

        let generation = self.generation.stop();
        let audio = self.audio.stop();
        info!("remix session stopped");
        generation.and(audio)
    }

    pub fn is_running(&self) -> bool {
        self.generation.is_running() && self.audio.is_running()
    }

    /// Stops the session if generation ended on its own, returning the
    /// error it ended with. Meant to be polled by the host while playing.
    pub fn check(&mut self) -> Result<()> {
        if !self.generation.is_finished() {
            return Ok(());
        }

        self.state = PlaybackState::Stopped;
        self.stop()
    }

    /// Everything generated so far. Only available while stopped.
    pub fn remix(&self) -> Option<&Remix> {
        self.generation
            .state()
            .map(|state| state.materializer.remix())
    }

    /// Committed remix duration. Only available while stopped.
    pub fn duration(&self) -> Option<f64> {
        self.generation
            .state()
            .map(|state| state.materializer.duration())
    }

    pub fn unsupported_kinds(&self) -> Option<&BTreeMap<String, usize>> {
        self.generation
            .state()
            .map(|state| state.splicer.unsupported_kinds())
    }

    pub fn audio(&self) -> &AudioScheduler {
        &self.audio
    }
}

impl Drop for RemixSession {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "failed to stop remix session cleanly");
        }
    }
}

impl std::fmt::Debug for RemixSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemixSession")
            .field("state", &self.state)
            .field("running", &self.is_running())
            .finish()
    }
}
