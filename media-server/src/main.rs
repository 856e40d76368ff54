//! Composition root and operator CLI for the library scanner and playback
//! orchestrator.
//!
//! This binary wires the ports defined in `media-contracts` to concrete
//! implementations — an in-memory [`Repository`](media_contracts::Repository)
//! (no database dialect is in scope for this deliverable), a structured
//! logging [`EventPublisher`](media_contracts::EventPublisher), and a single
//! software [`Provider`](media_contracts::Provider) — and exposes the
//! `ScanControl`/`PlaybackControl` surface described in the design
//! documents as a small `clap`-derived CLI. An HTTP adapter, were one
//! added, would depend on this same composition, not reimplement it.
#![allow(missing_docs)]

mod events;
mod provider;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use media_config::{CoreConfig, ScanConfig};
use media_contracts::{EventPublisher, Repository};
use media_core::{
    decide, AdaptiveThrottle, CleanupService, Decision, EnricherPool, InMemoryRepository,
    MediaInfo, ProviderRegistry, ScanEngine, TranscodeOrchestrator,
};
use media_model::{
    DeviceProfile, Event, EventKind, LibraryId, LibraryKind, MediaLibrary, ScanJobId, SessionId,
    TranscodeRequest,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::events::TracingEventPublisher;
use crate::provider::SoftwareProvider;

const DEFAULT_ENRICHER_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(3600);

#[derive(Parser, Debug)]
#[command(name = "media-server")]
#[command(about = "Library scanner and playback orchestrator control plane")]
struct Cli {
    /// Path to a TOML config file (overrides MEDIA_SERVER_CONFIG_PATH and
    /// the default search path; see `media_config::load`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Library lifecycle: create, list, delete.
    #[command(subcommand)]
    Library(LibraryCommand),
    /// Scan control: start, pause, resume, stop, progress, list, stats.
    #[command(subcommand)]
    Scan(ScanCommand),
    /// Playback decisions and transcode session lifecycle.
    #[command(subcommand)]
    Playback(PlaybackCommand),
}

#[derive(Subcommand, Debug)]
enum LibraryCommand {
    Create {
        #[arg(long)]
        root: PathBuf,
        #[arg(long, value_enum)]
        kind: LibraryKindArg,
    },
    List,
    Delete {
        #[arg(long)]
        id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum ScanCommand {
    Start {
        #[arg(long)]
        library: Uuid,
    },
    Pause {
        #[arg(long)]
        job: Uuid,
    },
    Resume {
        #[arg(long)]
        job: Uuid,
    },
    Stop {
        #[arg(long)]
        job: Uuid,
    },
    Progress {
        #[arg(long)]
        job: Uuid,
    },
    List,
    Stats {
        #[arg(long)]
        library: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum PlaybackCommand {
    /// Evaluate the direct/remux/transcode decision for a media+device pair.
    Decide {
        #[arg(long)]
        container: String,
        #[arg(long)]
        video_codec: Option<String>,
        #[arg(long)]
        audio_codec: String,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        bitrate_kbps: u32,
        #[arg(long)]
        device_name: String,
        #[arg(long, value_delimiter = ',')]
        device_containers: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        device_video_codecs: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        device_audio_codecs: Vec<String>,
        #[arg(long)]
        device_max_width: Option<u32>,
        #[arg(long)]
        device_max_height: Option<u32>,
        #[arg(long)]
        device_max_bitrate_kbps: Option<u32>,
    },
    /// Request (or coalesce onto) a transcode session; blocks until the
    /// session reaches a terminal state or the waiter deadline elapses.
    Transcode {
        #[arg(long)]
        media_id: String,
        #[arg(long)]
        container: String,
        #[arg(long)]
        video_codec: String,
        #[arg(long)]
        audio_codec: String,
        #[arg(long, default_value = "default")]
        quality: String,
        #[arg(long, default_value = "fast")]
        speed_preset: String,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long, default_value_t = false)]
        adaptive_bitrate: bool,
        #[arg(long)]
        video_bitrate_kbps: Option<u32>,
        #[arg(long)]
        audio_bitrate_kbps: Option<u32>,
    },
    Cancel {
        #[arg(long)]
        session: Uuid,
    },
    Get {
        #[arg(long)]
        session: Uuid,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum LibraryKindArg {
    Music,
    Movie,
    Episode,
    Mixed,
}

impl From<LibraryKindArg> for LibraryKind {
    fn from(value: LibraryKindArg) -> Self {
        match value {
            LibraryKindArg::Music => LibraryKind::Music,
            LibraryKindArg::Movie => LibraryKind::Movie,
            LibraryKindArg::Episode => LibraryKind::Episode,
            LibraryKindArg::Mixed => LibraryKind::Mixed,
        }
    }
}

/// Everything the CLI dispatches against, wired once at startup.
struct App {
    repo: Arc<dyn Repository>,
    events: Arc<dyn EventPublisher>,
    scan: ScanEngine,
    transcode: TranscodeOrchestrator,
}

impl App {
    fn new(config: &CoreConfig) -> Self {
        let repo: Arc<dyn Repository> = Arc::new(InMemoryRepository::new());
        let events: Arc<dyn EventPublisher> = Arc::new(TracingEventPublisher);

        let throttle = Arc::new(AdaptiveThrottle::new(
            config.throttle.clone(),
            config.scan.worker_count_max,
            config.scan.batch_size_base,
        ));
        let enricher = Arc::new(EnricherPool::new(Vec::new(), DEFAULT_ENRICHER_CACHE_TTL));
        let scan = ScanEngine::new(repo.clone(), events.clone(), enricher, throttle, config.scan.clone());

        let registry = Arc::new(ProviderRegistry::new());
        registry.register(Arc::new(SoftwareProvider::new("ffmpeg")));

        let transcode = TranscodeOrchestrator::new(
            repo.clone(),
            events.clone(),
            registry.clone(),
            config.transcode.dir_root.clone(),
            config.transcode.waiter_deadline,
        );

        let cleanup = Arc::new(CleanupService::new(
            repo.clone(),
            registry,
            config.cleanup.clone(),
            config.transcode.dir_root.clone(),
        ));
        // Detached background sweeps; the process lifetime is the bound on
        // how long they run, matching the teacher's cache cleaner pattern.
        let (_normal, _deep) = cleanup.spawn();

        Self {
            repo,
            events,
            scan,
            transcode,
        }
    }

    async fn run(&self, command: Command) -> anyhow::Result<()> {
        match command {
            Command::Library(cmd) => self.run_library(cmd).await,
            Command::Scan(cmd) => self.run_scan(cmd).await,
            Command::Playback(cmd) => self.run_playback(cmd).await,
        }
    }

    async fn run_library(&self, cmd: LibraryCommand) -> anyhow::Result<()> {
        match cmd {
            LibraryCommand::Create { root, kind } => {
                let library = MediaLibrary::new(root, kind.into())?;
                self.repo.create(library.clone()).await?;
                self.events
                    .publish(Event::new("media-server", EventKind::LibraryCreated {
                        library_id: library.id,
                    }))
                    .await;
                print_json(&library)?;
            }
            LibraryCommand::List => {
                let libraries = self.repo.list().await?;
                print_json(&libraries)?;
            }
            LibraryCommand::Delete { id } => {
                let library_id = LibraryId::from(id);
                self.scan.terminate_for_library(library_id).await?;
                self.repo.delete(library_id).await?;
                self.events
                    .publish(Event::new("media-server", EventKind::LibraryDeleted { library_id }))
                    .await;
                info!(%library_id, "library deleted");
            }
        }
        Ok(())
    }

    async fn run_scan(&self, cmd: ScanCommand) -> anyhow::Result<()> {
        match cmd {
            ScanCommand::Start { library } => {
                let job = self.scan.start(LibraryId::from(library)).await?;
                print_json(&job)?;
            }
            ScanCommand::Pause { job } => self.scan.pause(ScanJobId::from(job)).await?,
            ScanCommand::Resume { job } => self.scan.resume(ScanJobId::from(job)).await?,
            ScanCommand::Stop { job } => self.scan.stop(ScanJobId::from(job)).await?,
            ScanCommand::Progress { job } => {
                let snapshot = self.scan.progress(ScanJobId::from(job)).await?;
                print_json(&ProgressView::from(snapshot))?;
            }
            ScanCommand::List => {
                let jobs = self.scan.list().await?;
                print_json(&jobs)?;
            }
            ScanCommand::Stats { library } => {
                let stats = self.scan.stats(LibraryId::from(library)).await?;
                print_json(&stats)?;
            }
        }
        Ok(())
    }

    async fn run_playback(&self, cmd: PlaybackCommand) -> anyhow::Result<()> {
        match cmd {
            PlaybackCommand::Decide {
                container,
                video_codec,
                audio_codec,
                width,
                height,
                bitrate_kbps,
                device_name,
                device_containers,
                device_video_codecs,
                device_audio_codecs,
                device_max_width,
                device_max_height,
                device_max_bitrate_kbps,
            } => {
                let media = MediaInfo {
                    container,
                    video_codec,
                    audio_codec,
                    width,
                    height,
                    bitrate_kbps,
                };
                let profile = DeviceProfile {
                    name: device_name,
                    user_agent: None,
                    supported_containers: device_containers,
                    supported_video_codecs: device_video_codecs,
                    supported_audio_codecs: device_audio_codecs,
                    max_resolution: device_max_width.zip(device_max_height),
                    max_bitrate_kbps: device_max_bitrate_kbps,
                    preferred_container: None,
                    preferred_video_codec: None,
                    preferred_audio_codec: None,
                };
                let decision: Decision = decide(&media, &profile);
                print_json(&decision)?;
            }
            PlaybackCommand::Transcode {
                media_id,
                container,
                video_codec,
                audio_codec,
                quality,
                speed_preset,
                width,
                height,
                adaptive_bitrate,
                video_bitrate_kbps,
                audio_bitrate_kbps,
            } => {
                let request = TranscodeRequest {
                    media_id,
                    container,
                    video_codec,
                    audio_codec,
                    quality,
                    speed_preset,
                    resolution: width.zip(height),
                    adaptive_bitrate,
                    video_bitrate_kbps,
                    audio_bitrate_kbps,
                };
                let session = self.transcode.request_transcode(request, &[]).await?;
                print_json(&session)?;
            }
            PlaybackCommand::Cancel { session } => {
                self.transcode.cancel(SessionId::from(session));
            }
            PlaybackCommand::Get { session } => {
                let session = self
                    .transcode
                    .get(SessionId::from(session))
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("session {session} not found"))?;
                print_json(&session)?;
            }
        }
        Ok(())
    }
}

/// Progress plus derived throughput/ETA, the CLI-facing shape of
/// `ScanEngine::progress`'s return value.
#[derive(Debug, serde::Serialize)]
struct ProgressView {
    job_id: String,
    status: String,
    files_found: u64,
    files_processed: u64,
    files_skipped: u64,
    progress_pct: f64,
    files_per_second: f64,
    eta_seconds: Option<f64>,
}

impl From<media_core::ProgressSnapshot> for ProgressView {
    fn from(snapshot: media_core::ProgressSnapshot) -> Self {
        Self {
            job_id: snapshot.job.id.to_string(),
            status: format!("{:?}", snapshot.job.status),
            files_found: snapshot.job.files_found,
            files_processed: snapshot.job.files_processed,
            files_skipped: snapshot.job.files_skipped,
            progress_pct: snapshot.job.progress_pct(),
            files_per_second: snapshot.files_per_second,
            eta_seconds: snapshot.eta_seconds,
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(config: &CoreConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("media_server=info,media_core=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, source) = match &cli.config {
        Some(path) => (
            media_config::load_from_file(path)?,
            media_config::ConfigSource::File(path.clone()),
        ),
        None => media_config::load()?,
    };

    init_tracing(&config);
    info!(?source, "configuration loaded");
    if let Err(err) = std::fs::create_dir_all(&config.transcode.dir_root) {
        warn!(error = %err, dir = %config.transcode.dir_root.display(), "failed to create transcode root");
    }

    let app = App::new(&config);
    app.run(cli.command).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use media_model::{LibraryKind, MediaLibrary};

    #[tokio::test]
    async fn scan_start_then_list_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CoreConfig::default();
        config.transcode.dir_root = dir.path().join("transcode");
        config.scan = ScanConfig {
            parallel_enabled: true,
            worker_count_max: 2,
            batch_size_base: 8,
        };

        let app = App::new(&config);
        let library = MediaLibrary::new(dir.path().to_path_buf(), LibraryKind::Movie).unwrap();
        app.repo.create(library.clone()).await.unwrap();

        let job = app.scan.start(library.id).await.unwrap();
        let jobs = app.scan.list().await.unwrap();
        assert!(jobs.iter().any(|j| j.id == job.id));
    }

    #[test]
    fn playback_decide_picks_transcode_for_unsupported_codec() {
        let media = MediaInfo {
            container: "mp4".to_string(),
            video_codec: Some("hevc".to_string()),
            audio_codec: "aac".to_string(),
            width: Some(1920),
            height: Some(1080),
            bitrate_kbps: 5_000,
        };
        let profile = DeviceProfile {
            name: "chromecast".to_string(),
            user_agent: None,
            supported_containers: vec!["mp4".to_string()],
            supported_video_codecs: vec!["h264".to_string()],
            supported_audio_codecs: vec!["aac".to_string()],
            max_resolution: Some((1920, 1080)),
            max_bitrate_kbps: Some(8_000),
            preferred_container: Some("mp4".to_string()),
            preferred_video_codec: Some("h264".to_string()),
            preferred_audio_codec: Some("aac".to_string()),
        };
        let decision = decide(&media, &profile);
        assert_eq!(decision.method, media_core::PlaybackMethod::Transcode);
        assert!(decision.transcode_request.is_some());
    }

    #[tokio::test]
    async fn duplicate_transcode_request_coalesces_onto_one_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CoreConfig::default();
        config.transcode.dir_root = dir.path().join("transcode");
        let app = App::new(&config);

        let request = TranscodeRequest {
            media_id: "movie-1".to_string(),
            container: "mp4".to_string(),
            video_codec: "h264".to_string(),
            audio_codec: "aac".to_string(),
            quality: "default".to_string(),
            speed_preset: "fast".to_string(),
            resolution: None,
            adaptive_bitrate: false,
            video_bitrate_kbps: None,
            audio_bitrate_kbps: None,
        };

        let first = app.transcode.request_transcode(request.clone(), &[]).await.unwrap();
        let second = app.transcode.request_transcode(request, &[]).await.unwrap();
        assert_eq!(first.id, second.id);

        app.transcode.cancel(first.id);
    }

    #[tokio::test]
    async fn library_delete_terminates_its_active_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CoreConfig::default();
        config.transcode.dir_root = dir.path().join("transcode");
        let app = App::new(&config);

        let library = MediaLibrary::new(dir.path().to_path_buf(), LibraryKind::Movie).unwrap();
        app.repo.create(library.clone()).await.unwrap();
        app.scan.start(library.id).await.unwrap();

        app.run_library(LibraryCommand::Delete {
            id: *library.id.as_uuid(),
        })
        .await
        .unwrap();

        assert!(app.repo.get(library.id).await.unwrap().is_none());
    }
}
