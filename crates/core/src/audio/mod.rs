//! Schedules remix slices on the host's audio clock.
//!
//! All times here are DSP times: the host's hardware audio clock, which
//! advances at `time_scale` song seconds per second.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;

use crossbeam_channel::{select, Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::remix::Slice;
use crate::session::{sleep_or_cancel, CancelSignal, LoopWorker};
use crate::timing::is_less_or_equal;
use crate::{RemixError, Result};

/// Handle to a playback voice owned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoiceId(pub usize);

/// Routing and playback properties of an output voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputProfile {
    /// Mixer group the output is routed through. Carries pitch correction
    /// when the song plays at a speed other than 1.
    pub mixer_group: Option<String>,
    pub pitch: f64,
    pub bypass_listener_effects: bool,
    pub bypass_reverb_zones: bool,
    pub doppler_level: f64,
    pub priority: u8,
    pub reverb_zone_mix: f64,
}

impl Default for OutputProfile {
    fn default() -> Self {
        Self {
            mixer_group: None,
            pitch: 1.0,
            bypass_listener_effects: false,
            bypass_reverb_zones: false,
            doppler_level: 1.0,
            priority: 128,
            reverb_zone_mix: 1.0,
        }
    }
}

impl OutputProfile {
    /// Profile for a remix voice: routed like the song's own output and
    /// pitched to the current playback speed.
    pub fn remix_voice(primary: &OutputProfile, time_scale: f64) -> Self {
        Self {
            mixer_group: primary.mixer_group.clone(),
            pitch: time_scale,
            bypass_listener_effects: true,
            bypass_reverb_zones: true,
            doppler_level: 0.0,
            priority: 0,
            reverb_zone_mix: 0.0,
        }
    }
}

/// One scheduled playback of a range of the source audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackRequest {
    pub source_start: f64,
    pub source_duration: f64,
    /// DSP time playback begins.
    pub start_at: f64,
    /// DSP time playback ends.
    pub end_at: f64,
    /// Frames of the source buffer covered by the request.
    pub frames: Range<usize>,
}

/// The host audio backend the scheduler drives.
pub trait AudioHost: Send + Sync {
    /// Current DSP time in seconds.
    fn dsp_time(&self) -> f64;

    /// Current playback speed multiplier.
    fn time_scale(&self) -> f64;

    /// Properties of the output the unmodified song plays through.
    fn primary_output(&self) -> OutputProfile;

    fn create_voice(&self, profile: &OutputProfile) -> Result<VoiceId>;

    fn schedule(&self, voice: VoiceId, request: &PlaybackRequest) -> Result<()>;
}

/// Decoded samples of the whole track, interleaved by channel.
#[derive(Debug, Clone)]
pub struct SourceAudio {
    sample_rate: u32,
    channels: u16,
    samples: Arc<[f32]>,
}

impl SourceAudio {
    pub fn new(sample_rate: u32, channels: u16, samples: impl Into<Arc<[f32]>>) -> Result<Self> {
        let samples = samples.into();
        if sample_rate == 0 || channels == 0 {
            return Err(RemixError::msg(
                "source audio needs a positive sample rate and channel count",
            ));
        }
        if samples.len() % channels as usize != 0 {
            return Err(RemixError::msg(format!(
                "{} samples do not divide into {channels} channels",
                samples.len()
            )));
        }

        Ok(Self {
            sample_rate,
            channels,
            samples,
        })
    }

    /// Silent buffer of the given length, for hosts that keep their own copy
    /// of the decoded track.
    pub fn silent(sample_rate: u32, channels: u16, seconds: f64) -> Result<Self> {
        let frames = (seconds.max(0.0) * sample_rate as f64).ceil() as usize;
        Self::new(sample_rate, channels, vec![0.0; frames * channels as usize])
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    pub fn duration(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Whole frames inside `[start, start + duration)`, clamped to the buffer.
    pub fn frame_range(&self, start: f64, duration: f64) -> Range<usize> {
        let rate = self.sample_rate as f64;
        let frames = self.frames();
        let first = ((start.max(0.0) * rate).ceil() as usize).min(frames);
        let last = (((start + duration).max(0.0) * rate).floor() as usize).min(frames);
        first..last.max(first)
    }
}

/// Producer side of the scheduler's slice queue.
#[derive(Debug, Clone)]
pub struct SliceQueue {
    sender: Sender<Slice>,
}

impl SliceQueue {
    pub fn push(&self, slices: &[Slice]) -> Result<()> {
        for slice in slices {
            self.sender
                .send(*slice)
                .map_err(|_| RemixError::msg("audio slice queue is closed"))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct ScheduledVoice {
    voice: VoiceId,
    end_at: f64,
}

/// State owned by the scheduling loop.
struct SchedulerLoop {
    host: Arc<dyn AudioHost>,
    source: SourceAudio,
    config: SchedulerConfig,
    slices: Receiver<Slice>,
    /// Dequeued slice that was not yet due when the loop last ran.
    pending: Option<Slice>,
    next_dsp_time: f64,
    /// Voices in order of scheduled end time.
    voices: VecDeque<ScheduledVoice>,
    created_voices: usize,
}

impl SchedulerLoop {
    fn run(&mut self, cancel: &CancelSignal) -> Result<()> {
        loop {
            if self.pending.is_none() {
                select! {
                    recv(cancel) -> _ => return Ok(()),
                    recv(self.slices) -> slice => match slice {
                        Ok(slice) => self.pending = Some(slice),
                        Err(_) => return Ok(()),
                    },
                }
            }

            let sleep = self.wake_delay(self.host.dsp_time());
            if sleep > 0.0 && sleep_or_cancel(cancel, sleep) {
                return Ok(());
            }

            self.schedule_due(self.host.dsp_time());
        }
    }

    /// Seconds until the next slice enters the scheduling window. Waking
    /// earlier than the lookahead would find nothing due.
    fn wake_delay(&self, now: f64) -> f64 {
        let early = self
            .config
            .wake_early_seconds
            .min(self.config.lookahead_seconds);
        self.next_dsp_time - now - early
    }

    /// Schedules every queued slice that starts within the lookahead window.
    fn schedule_due(&mut self, now: f64) {
        while is_less_or_equal(self.next_dsp_time, now + self.config.lookahead_seconds) {
            let Some(slice) = self.pending.take().or_else(|| self.slices.try_recv().ok()) else {
                break;
            };
            self.schedule(&slice, now);
        }
    }

    fn schedule(&mut self, slice: &Slice, now: f64) {
        let start_at = self.next_dsp_time;
        let end_at = start_at + slice.duration / self.host.time_scale();
        self.next_dsp_time = end_at;

        let request = PlaybackRequest {
            source_start: slice.start,
            source_duration: slice.duration,
            start_at,
            end_at,
            frames: self.source.frame_range(slice.start, slice.duration),
        };

        let voice = match self.acquire_voice(now) {
            Ok(voice) => voice,
            Err(err) => {
                warn!(error = %err, clock = slice.clock, "failed to create a voice");
                return;
            }
        };

        match self.host.schedule(voice, &request) {
            Ok(()) => {
                debug!(
                    voice = voice.0,
                    start_at,
                    source_start = slice.start,
                    duration = slice.duration,
                    "scheduled slice"
                );
                self.voices.push_back(ScheduledVoice { voice, end_at });
            }
            Err(err) => {
                warn!(error = %err, clock = slice.clock, "failed to schedule slice");
                self.voices.push_front(ScheduledVoice {
                    voice,
                    end_at: now - self.config.voice_release_margin_seconds,
                });
            }
        }
    }

    /// Reuses the voice that finished first, if it is done, otherwise asks
    /// the host for a new one.
    fn acquire_voice(&mut self, now: f64) -> Result<VoiceId> {
        let margin = self.config.voice_release_margin_seconds;
        if let Some(front) = self.voices.front() {
            if is_less_or_equal(front.end_at + margin, now) {
                let voice = front.voice;
                self.voices.pop_front();
                return Ok(voice);
            }
        }

        let profile = OutputProfile::remix_voice(&self.host.primary_output(), self.host.time_scale());
        let voice = self.host.create_voice(&profile)?;
        self.created_voices += 1;
        Ok(voice)
    }
}

/// Plays queued slices back to back, starting at the song's start time on
/// the DSP clock.
pub struct AudioScheduler {
    queue: SliceQueue,
    worker: LoopWorker<SchedulerLoop>,
}

impl AudioScheduler {
    pub fn new(
        host: Arc<dyn AudioHost>,
        source: SourceAudio,
        config: SchedulerConfig,
        song_start_dsp_time: f64,
    ) -> Self {
        let (sender, slices) = crossbeam_channel::unbounded();
        let state = SchedulerLoop {
            host,
            source,
            config,
            slices,
            pending: None,
            next_dsp_time: song_start_dsp_time,
            voices: VecDeque::new(),
            created_voices: 0,
        };

        Self {
            queue: SliceQueue { sender },
            worker: LoopWorker::new("audio-scheduler", state),
        }
    }

    /// Producer handle for feeding slices from another thread.
    pub fn queue(&self) -> SliceQueue {
        self.queue.clone()
    }

    pub fn enqueue(&self, slices: &[Slice]) -> Result<()> {
        self.queue.push(slices)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_running() {
            return Ok(());
        }
        info!("starting audio scheduler");
        self.worker.start(SchedulerLoop::run)
    }

    pub fn stop(&mut self) -> Result<()> {
        if self.worker.is_idle() {
            return Ok(());
        }
        self.worker.stop()?;
        info!("stopped audio scheduler");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// DSP time the next slice will start at. Only known while stopped.
    pub fn next_dsp_time(&self) -> Option<f64> {
        self.worker.state().map(|state| state.next_dsp_time)
    }

    /// Number of voices requested from the host. Only known while stopped.
    pub fn created_voices(&self) -> Option<usize> {
        self.worker.state().map(|state| state.created_voices)
    }
}

impl std::fmt::Debug for AudioScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioScheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct FakeHost {
        pub dsp_time: Mutex<f64>,
        pub time_scale: f64,
        pub fail_schedule: bool,
        pub created: Mutex<Vec<OutputProfile>>,
        pub scheduled: Mutex<Vec<(VoiceId, PlaybackRequest)>>,
    }

    impl FakeHost {
        pub fn at(dsp_time: f64) -> Self {
            Self {
                dsp_time: Mutex::new(dsp_time),
                time_scale: 1.0,
                ..Default::default()
            }
        }

        pub fn set_time(&self, dsp_time: f64) {
            *self.dsp_time.lock().unwrap() = dsp_time;
        }

        pub fn scheduled(&self) -> Vec<(VoiceId, PlaybackRequest)> {
            self.scheduled.lock().unwrap().clone()
        }
    }

    impl AudioHost for FakeHost {
        fn dsp_time(&self) -> f64 {
            *self.dsp_time.lock().unwrap()
        }

        fn time_scale(&self) -> f64 {
            self.time_scale
        }

        fn primary_output(&self) -> OutputProfile {
            OutputProfile {
                mixer_group: Some("music".into()),
                ..Default::default()
            }
        }

        fn create_voice(&self, profile: &OutputProfile) -> Result<VoiceId> {
            let mut created = self.created.lock().unwrap();
            created.push(profile.clone());
            Ok(VoiceId(created.len() - 1))
        }

        fn schedule(&self, voice: VoiceId, request: &PlaybackRequest) -> Result<()> {
            if self.fail_schedule {
                return Err(RemixError::host("device lost"));
            }
            self.scheduled.lock().unwrap().push((voice, request.clone()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::testing::FakeHost;
    use super::*;

    fn slice(clock: f64, start: f64, duration: f64) -> Slice {
        Slice {
            clock,
            start,
            duration,
            clock_beats: clock as i64,
            start_beats: start as i64,
            duration_beats: duration as i64,
        }
    }

    fn scheduler_loop(host: Arc<FakeHost>, start: f64) -> (Sender<Slice>, SchedulerLoop) {
        let (sender, slices) = crossbeam_channel::unbounded();
        let state = SchedulerLoop {
            host,
            source: SourceAudio::silent(10, 1, 60.0).unwrap(),
            config: SchedulerConfig::default(),
            slices,
            pending: None,
            next_dsp_time: start,
            voices: VecDeque::new(),
            created_voices: 0,
        };
        (sender, state)
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for the scheduler");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn frame_ranges_round_inwards() {
        let source = SourceAudio::new(4, 2, vec![0.0; 40]).unwrap();
        assert_eq!(source.frames(), 20);
        assert_eq!(source.frame_range(0.3, 1.0), 2..5);
        assert_eq!(source.frame_range(4.0, 10.0), 16..20);
        assert!(SourceAudio::new(4, 2, vec![0.0; 3]).is_err());
    }

    #[test]
    fn schedules_slices_back_to_back_within_the_lookahead() {
        let host = Arc::new(FakeHost::at(100.0));
        let (sender, mut state) = scheduler_loop(host.clone(), 100.0);
        for clock in 0..4 {
            sender.send(slice(clock as f64 * 0.5, 3.0, 0.5)).unwrap();
        }

        state.schedule_due(100.0);

        let scheduled = host.scheduled();
        let starts: Vec<f64> = scheduled.iter().map(|(_, req)| req.start_at).collect();
        assert_eq!(starts, vec![100.0, 100.5, 101.0]);
        assert_eq!(scheduled[0].1.frames, 30..35);
        assert_eq!(state.next_dsp_time, 101.5);
        assert_eq!(state.slices.len(), 1);
    }

    #[test]
    fn voices_are_reused_once_finished() {
        let host = Arc::new(FakeHost::at(0.0));
        let (_sender, mut state) = scheduler_loop(host.clone(), 0.0);

        state.schedule(&slice(0.0, 0.0, 1.0), 0.0);
        state.schedule(&slice(1.0, 5.0, 1.0), 0.0);
        assert_eq!(state.created_voices, 2);

        host.set_time(2.0);
        state.schedule(&slice(2.0, 9.0, 1.0), 2.0);
        assert_eq!(state.created_voices, 2);
        assert_eq!(host.scheduled()[2].0, VoiceId(0));

        let created = host.created.lock().unwrap();
        assert_eq!(created[0].mixer_group.as_deref(), Some("music"));
        assert!(created[0].bypass_reverb_zones);
        assert_eq!(created[0].priority, 0);
    }

    #[test]
    fn time_scale_compresses_playback() {
        let host = Arc::new(FakeHost {
            time_scale: 2.0,
            ..FakeHost::at(0.0)
        });
        let (_sender, mut state) = scheduler_loop(host.clone(), 10.0);

        state.schedule(&slice(0.0, 0.0, 4.0), 0.0);

        let (_, request) = &host.scheduled()[0];
        assert_eq!((request.start_at, request.end_at), (10.0, 12.0));
        assert_eq!(request.source_duration, 4.0);
        assert_eq!(host.created.lock().unwrap()[0].pitch, 2.0);
    }

    #[test]
    fn failed_schedules_keep_the_clock_moving() {
        let host = Arc::new(FakeHost {
            fail_schedule: true,
            ..FakeHost::at(0.0)
        });
        let (_sender, mut state) = scheduler_loop(host.clone(), 0.0);

        state.schedule(&slice(0.0, 0.0, 1.0), 0.0);
        state.schedule(&slice(1.0, 1.0, 1.0), 0.0);

        assert_eq!(state.next_dsp_time, 2.0);
        assert_eq!(state.created_voices, 1);
    }

    #[test]
    fn wake_up_never_precedes_the_lookahead_window() {
        let host = Arc::new(FakeHost::at(0.0));
        let (_sender, mut state) = scheduler_loop(host.clone(), 10.0);
        state.config = SchedulerConfig {
            wake_early_seconds: 5.0,
            lookahead_seconds: 1.0,
            ..SchedulerConfig::default()
        };
        state.pending = Some(slice(0.0, 0.0, 1.0));

        let sleep = state.wake_delay(0.0);
        assert_eq!(sleep, 9.0);

        state.schedule_due(sleep);
        assert!(state.pending.is_none());
        assert_eq!(host.scheduled()[0].1.start_at, 10.0);
    }

    #[test]
    fn running_scheduler_drains_the_queue() {
        let host = Arc::new(FakeHost::at(50.0));
        let source = SourceAudio::silent(10, 1, 30.0).unwrap();
        let mut scheduler = AudioScheduler::new(host.clone(), source, SchedulerConfig::default(), 50.0);

        scheduler.start().unwrap();
        scheduler
            .enqueue(&[slice(0.0, 0.0, 0.25), slice(0.25, 8.0, 0.25)])
            .unwrap();
        wait_for(|| host.scheduled().len() == 2);
        scheduler.stop().unwrap();

        assert!(!scheduler.is_running());
        assert_eq!(scheduler.next_dsp_time(), Some(50.5));
        assert_eq!(scheduler.created_voices(), Some(2));
    }

    #[test]
    fn stopping_interrupts_a_sleep_and_keeps_the_slice() {
        let host = Arc::new(FakeHost::at(0.0));
        let source = SourceAudio::silent(10, 1, 30.0).unwrap();
        let mut scheduler = AudioScheduler::new(host.clone(), source, SchedulerConfig::default(), 600.0);

        scheduler.enqueue(&[slice(0.0, 0.0, 1.0)]).unwrap();
        scheduler.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let began = Instant::now();
        scheduler.stop().unwrap();
        assert!(began.elapsed() < Duration::from_secs(5));
        assert!(host.scheduled().is_empty());

        host.set_time(599.5);
        scheduler.start().unwrap();
        wait_for(|| host.scheduled().len() == 1);
        scheduler.stop().unwrap();
        assert_eq!(host.scheduled()[0].1.start_at, 600.0);
    }
}
