use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use footfall_core::capture::ManualClock;
use footfall_core::pipeline::SkipReason;
use footfall_core::{
    CaptureWorker, ExtractError, Extraction, Extractor, FeatureVector, FrameInput,
    FrameMeasurements, FrameSource, IdentifyResponse, IdentityGateway, MemoryStore,
    PipelineConfig, Provenance, QualityScorer, ScopeId, SessionOutcome, DEFAULT_STORE_TIMEOUT,
};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.footfall.Footfall1",
    default_service = "org.footfall.Footfall1",
    default_path = "/org/footfall/Footfall1"
)]
trait Footfall {
    async fn identify(&self, vector: &[f64], scope: i64, auxiliary_image: &[u8]) -> zbus::Result<String>;
    async fn list_identities(&self, scope: i64) -> zbus::Result<String>;
    async fn remove_identity(&self, id: i64) -> zbus::Result<bool>;
    async fn annotate_identity(
        &self,
        id: i64,
        display_name: &str,
        classification: &str,
    ) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "footfall", about = "Footfall visitor identity CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a feature vector against a scope
    Identify {
        /// Scope (location) id
        #[arg(short, long)]
        scope: i64,
        /// JSON file holding a 512-element array
        #[arg(short, long)]
        vector: PathBuf,
        /// Image stored alongside a newly created identity
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// List identities in a scope
    List {
        #[arg(short, long)]
        scope: i64,
    },
    /// Remove an identity
    Remove {
        /// Identity ID to remove
        id: i64,
    },
    /// Set or clear an identity's display name and classification
    Annotate {
        id: i64,
        #[arg(short, long, default_value = "")]
        name: String,
        /// regular, occasional or undecided; empty clears
        #[arg(short, long, default_value = "")]
        classification: String,
    },
    /// Show daemon status
    Status,
    /// Score frame measurements offline
    Score {
        /// JSON file with one measurement object or an array of them
        measurements: PathBuf,
        /// Pipeline TOML (defaults if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Replay recorded frames through the full pipeline against an in-memory store
    Replay {
        /// JSON Lines file, one recorded frame per line
        recording: PathBuf,
        #[arg(short, long, default_value_t = 1)]
        scope: i64,
        /// Frame rate the recording was captured at
        #[arg(long, default_value_t = 15.0)]
        fps: f64,
        /// Pipeline TOML (defaults if omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Identify { scope, vector, image } => {
            let vector: Vec<f64> = read_json(&vector)?;
            let image = match image {
                Some(path) => std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                None => Vec::new(),
            };
            let proxy = connect().await?;
            let reply = proxy.identify(&vector, scope, &image).await?;
            let response: IdentifyResponse = serde_json::from_str(&reply)?;
            print_response(&response);
        }
        Commands::List { scope } => {
            let proxy = connect().await?;
            print_json(&proxy.list_identities(scope).await?)?;
        }
        Commands::Remove { id } => {
            let proxy = connect().await?;
            if proxy.remove_identity(id).await? {
                println!("Removed identity {id}");
            } else {
                println!("No identity {id}");
            }
        }
        Commands::Annotate { id, name, classification } => {
            let proxy = connect().await?;
            print_json(&proxy.annotate_identity(id, &name, &classification).await?)?;
        }
        Commands::Status => match connect().await {
            Ok(proxy) => print_json(&proxy.status().await?)?,
            Err(e) => println!("footfalld: not connected ({e})"),
        },
        Commands::Score { measurements, config } => {
            let pipeline = load_pipeline(config.as_deref())?;
            let scorer = QualityScorer::new(pipeline.factors)?;
            let frames: OneOrMany<FrameMeasurements> = read_json(&measurements)?;
            for frame in frames.into_vec() {
                println!("{}", serde_json::to_string(&scorer.score(&frame))?);
            }
        }
        Commands::Replay { recording, scope, fps, config } => {
            replay(&recording, ScopeId(scope), fps, config.as_deref()).await?;
        }
    }

    Ok(())
}

async fn connect() -> Result<FootfallProxy<'static>> {
    let conn = match std::env::var("FOOTFALL_BUS").as_deref() {
        Ok("system") => zbus::Connection::system().await?,
        _ => zbus::Connection::session().await?,
    };
    FootfallProxy::new(&conn)
        .await
        .context("failed to reach footfalld")
}

fn load_pipeline(path: Option<&Path>) -> Result<PipelineConfig> {
    Ok(match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let src = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&src).with_context(|| format!("failed to parse {}", path.display()))
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_response(response: &IdentifyResponse) {
    match response.similarity {
        Some(similarity) => println!(
            "{:?} {} (id {}, visits {}, similarity {similarity:.3})",
            response.decision, response.label, response.identity_id, response.visit_count
        ),
        None => println!(
            "{:?} {} (id {}, visits {})",
            response.decision, response.label, response.identity_id, response.visit_count
        ),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// One line of a replay recording. `vector` is what the extractor returned
/// for this frame, absent when it found no face.
#[derive(Deserialize)]
struct RecordedFrame {
    measurements: FrameMeasurements,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default = "default_extractor_confidence")]
    confidence: f32,
}

fn default_extractor_confidence() -> f32 {
    1.0
}

struct ReplaySource {
    frames: VecDeque<FrameInput<usize>>,
}

impl FrameSource<usize> for ReplaySource {
    fn next_frame(&mut self) -> Option<FrameInput<usize>> {
        self.frames.pop_front()
    }
}

/// Serves the recorded extractor output, keyed by frame index.
struct RecordedExtractor {
    results: Vec<Option<(Vec<f32>, f32)>>,
}

impl Extractor<usize> for RecordedExtractor {
    fn extract(&mut self, region: &usize) -> Result<Extraction, ExtractError> {
        let (values, confidence) = self
            .results
            .get(*region)
            .cloned()
            .flatten()
            .ok_or(ExtractError::NoFace)?;
        let vector = FeatureVector::new(values, Provenance::PerFrame)
            .map_err(|e| ExtractError::Failed(e.to_string()))?;
        Ok(Extraction { vector, confidence })
    }
}

fn load_recording(path: &Path) -> Result<(ReplaySource, RecordedExtractor)> {
    let src = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let mut frames = VecDeque::new();
    let mut results = Vec::new();
    for (line_no, line) in src.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: RecordedFrame = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid frame", path.display(), line_no + 1))?;
        frames.push_back(FrameInput {
            region: results.len(),
            measurements: record.measurements,
        });
        results.push(record.vector.map(|v| (v, record.confidence)));
    }
    Ok((ReplaySource { frames }, RecordedExtractor { results }))
}

async fn replay(path: &Path, scope: ScopeId, fps: f64, config: Option<&Path>) -> Result<()> {
    if !(fps.is_finite() && fps > 0.0) {
        bail!("--fps must be positive");
    }
    let pipeline = load_pipeline(config)?;
    let (source, extractor) = load_recording(path)?;
    let total = source.frames.len();

    let clock = ManualClock::new();
    let gateway = Arc::new(IdentityGateway::new(
        Arc::new(MemoryStore::new()),
        &pipeline.matching,
        DEFAULT_STORE_TIMEOUT,
    ));
    let mut worker = CaptureWorker::<usize, _, _, _, _>::new(&pipeline, scope, source, extractor, gateway, clock.clone())?;

    let (tick, ticks) = replay_ticks(total, pipeline.capture.duration_secs, fps)?;
    for frame in 0..ticks {
        if let Some(outcome) = worker.step().await {
            print_outcome(frame, &outcome);
        }
        clock.advance(tick);
    }

    println!("{}", serde_json::to_string_pretty(&worker.stats())?);
    Ok(())
}

/// Clock step per frame and total tick count. Ticking continues past the last
/// frame so an open window can expire.
fn replay_ticks(frames: usize, window_secs: f64, fps: f64) -> Result<(Duration, usize)> {
    let tick = Duration::try_from_secs_f64(1.0 / fps)
        .ok()
        .filter(|tick| !tick.is_zero())
        .with_context(|| format!("--fps {fps} is out of range"))?;
    let drain = (window_secs * fps).ceil();
    if !(drain >= 0.0 && drain < u32::MAX as f64) {
        bail!("--fps {fps} needs too many ticks to drain a {window_secs}s window");
    }
    let ticks = frames
        .checked_add(drain as usize + 1)
        .context("recording too long to replay")?;
    Ok((tick, ticks))
}

fn print_outcome(frame: usize, outcome: &SessionOutcome) {
    match outcome {
        SessionOutcome::Decided(decision) => {
            print!("frame {frame}: ");
            print_response(&IdentifyResponse::from(decision));
        }
        SessionOutcome::Skipped(SkipReason::EmptySession) => {
            println!("frame {frame}: skipped, no frames retained")
        }
        SessionOutcome::Skipped(reason) => println!("frame {frame}: skipped, {reason:?}"),
        SessionOutcome::Failed(err) => println!("frame {frame}: failed, {err}"),
    }
}
