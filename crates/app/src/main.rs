use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use infinite_remix_core::session::BoxedSink;
use infinite_remix_core::timeline::events_from_json_file;
use infinite_remix_core::{
    AudioHost, AudioScheduler, BeatmapEvent, GraphSummary, InfiniteWalker, OutputProfile,
    PlaybackRequest, PlaybackState, QuantumGraph, Remix, RemixConfig, RemixError,
    RemixMaterializer, RemixSession, Result, SeededRandom, SharedTimeline,
    SimilarityGraphBuilder, SourceAudio, Timeline, TimelineSplicer, TrackAnalysis, Transport,
    VoiceId,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

/// The simulated host only reports frame ranges, so a low-rate silent buffer
/// stands in for the decoded track.
const SIMULATED_SAMPLE_RATE: u32 = 8_000;

const PLAYBACK_POLL: Duration = Duration::from_millis(100);

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Graph { song } => run_graph(&song),
        Commands::Remix {
            song,
            remix,
            output,
        } => run_remix(&song, &remix, &output),
        Commands::Play {
            song,
            remix,
            speed,
        } => run_play(&song, &remix, speed),
    }
}

fn run_graph(song: &SongArgs) -> Result<()> {
    let (_, graph) = song.build_graph()?;
    println!("{}", serde_json::to_string_pretty(&graph.summary())?);
    Ok(())
}

#[derive(Serialize)]
struct RemixReport {
    seed: u64,
    graph: GraphSummary,
    duration: f64,
    remix: Remix,
    timeline: Timeline,
    unsupported: BTreeMap<String, usize>,
}

fn run_remix(song: &SongArgs, args: &RemixArgs, output: &Path) -> Result<()> {
    let (config, graph) = song.build_graph()?;
    let random = args.random(&config);
    let seed = random.seed();
    tracing::info!(seed, seconds = args.seconds, "generating offline remix");

    let summary = graph.summary();
    let walker = InfiniteWalker::new(Arc::new(graph), config.walker.clone(), Box::new(random));
    let mut materializer = RemixMaterializer::new(walker, args.bpm)?;
    let batch = materializer.produce_at_least(args.seconds)?;

    let mut splicer = TimelineSplicer::new(args.beatmap_events()?, Timeline::new())?;
    splicer.splice_all(&batch.slices)?;

    let report = RemixReport {
        seed,
        graph: summary,
        duration: materializer.duration(),
        unsupported: splicer.unsupported_kinds().clone(),
        remix: batch,
        timeline: splicer.into_sink(),
    };
    std::fs::write(output, serde_json::to_vec_pretty(&report)?)?;
    tracing::info!(?output, duration = report.duration, "wrote remix");
    Ok(())
}

fn run_play(song: &SongArgs, args: &RemixArgs, speed: f64) -> Result<()> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(RemixError::msg(format!("invalid playback speed: {speed}")));
    }

    let (config, graph) = song.build_graph()?;
    let track_duration = graph.beats().last().map(|beat| beat.end()).unwrap_or(0.0);
    let random = args.random(&config);
    tracing::info!(
        seed = random.seed(),
        seconds = args.seconds,
        speed,
        "starting simulated playback"
    );

    let walker = InfiniteWalker::new(Arc::new(graph), config.walker.clone(), Box::new(random));
    let materializer = RemixMaterializer::new(walker, args.bpm)?;

    let timeline = SharedTimeline::new();
    let sink: BoxedSink = Box::new(timeline.clone());
    let splicer = TimelineSplicer::new(args.beatmap_events()?, sink)?;

    let host = Arc::new(WallClockHost::new(speed));
    let source = SourceAudio::silent(SIMULATED_SAMPLE_RATE, 1, track_duration)?;
    let audio = AudioScheduler::new(
        host.clone(),
        source,
        config.scheduler.clone(),
        host.dsp_time(),
    );

    let mut session = RemixSession::new(
        materializer,
        splicer,
        audio,
        host.clone(),
        config.generation.clone(),
    )?;
    session.set_playback_state(PlaybackState::Playing)?;
    let finish_at = Instant::now() + Duration::from_secs_f64(args.seconds.max(0.0) / speed);
    while Instant::now() < finish_at {
        std::thread::sleep(PLAYBACK_POLL.min(finish_at.saturating_duration_since(Instant::now())));
        session.check()?;
    }
    session.set_playback_state(PlaybackState::Stopped)?;

    tracing::info!(
        duration = session.duration(),
        voices = host.voices.load(Ordering::Relaxed),
        timeline_events = timeline.len()?,
        "playback finished"
    );
    Ok(())
}

/// Audio host driven by the wall clock. Scheduled voices are only logged.
struct WallClockHost {
    started: Instant,
    time_scale: f64,
    voices: AtomicUsize,
}

impl WallClockHost {
    fn new(time_scale: f64) -> Self {
        Self {
            started: Instant::now(),
            time_scale,
            voices: AtomicUsize::new(0),
        }
    }
}

impl AudioHost for WallClockHost {
    fn dsp_time(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn time_scale(&self) -> f64 {
        self.time_scale
    }

    fn primary_output(&self) -> OutputProfile {
        OutputProfile {
            mixer_group: Some("music".into()),
            pitch: self.time_scale,
            ..Default::default()
        }
    }

    fn create_voice(&self, profile: &OutputProfile) -> Result<VoiceId> {
        let voice = VoiceId(self.voices.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(voice = voice.0, pitch = profile.pitch, "created voice");
        Ok(voice)
    }

    fn schedule(&self, voice: VoiceId, request: &PlaybackRequest) -> Result<()> {
        tracing::info!(
            voice = voice.0,
            start_at = request.start_at,
            source_start = request.source_start,
            duration = request.source_duration,
            "voice scheduled"
        );
        Ok(())
    }
}

impl Transport for WallClockHost {
    fn song_time(&self) -> f64 {
        self.dsp_time() * self.time_scale
    }

    fn time_scale(&self) -> f64 {
        self.time_scale
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Endless beat-aligned remixes of a song", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the similarity graph of a song and print its summary.
    Graph {
        #[command(flatten)]
        song: SongArgs,
    },
    /// Generate a remix offline and write it, with its spliced beatmap, as JSON.
    Remix {
        #[command(flatten)]
        song: SongArgs,
        #[command(flatten)]
        remix: RemixArgs,
        /// Output path for the remix report.
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Play a remix in real time against a simulated audio host.
    Play {
        #[command(flatten)]
        song: SongArgs,
        #[command(flatten)]
        remix: RemixArgs,
        /// Playback speed multiplier.
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
}

#[derive(Args, Debug)]
struct SongArgs {
    /// Path to the song's analysis JSON.
    analysis: PathBuf,
    /// Seconds added to every analysis timestamp to line it up with the audio.
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    offset: f64,
    /// Length of the host's audio file; later analysis entries are dropped.
    #[arg(long)]
    track_duration: Option<f64>,
    /// Optional JSON file overriding the default tuning.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl SongArgs {
    fn load_config(&self) -> Result<RemixConfig> {
        match &self.config {
            Some(path) => RemixConfig::from_json_file(path),
            None => Ok(RemixConfig::default()),
        }
    }

    fn build_graph(&self) -> Result<(RemixConfig, QuantumGraph)> {
        let config = self.load_config()?;

        let mut analysis = TrackAnalysis::from_json_file(&self.analysis)?;
        analysis.shift_timestamps(self.offset);
        if let Some(duration) = self.track_duration {
            analysis.trim_to_duration(duration);
        }

        let graph = SimilarityGraphBuilder::new(config.graph.clone()).build(&analysis)?;
        Ok((config, graph))
    }
}

#[derive(Args, Debug)]
struct RemixArgs {
    /// Tempo of the song in beats per minute.
    #[arg(long)]
    bpm: f64,
    /// Gameplay events to splice alongside the audio.
    #[arg(long)]
    beatmap: Option<PathBuf>,
    /// Minimum length of remix to generate or play, in seconds.
    #[arg(long, default_value_t = 300.0)]
    seconds: f64,
    /// Seed for branch decisions. Overrides the config file.
    #[arg(long)]
    seed: Option<u64>,
}

impl RemixArgs {
    fn random(&self, config: &RemixConfig) -> SeededRandom {
        match self.seed.or(config.walker.seed) {
            Some(seed) => SeededRandom::new(seed),
            None => SeededRandom::from_entropy(),
        }
    }

    fn beatmap_events(&self) -> Result<Vec<BeatmapEvent>> {
        match &self.beatmap {
            Some(path) => events_from_json_file(path),
            None => Ok(Vec::new()),
        }
    }
}
