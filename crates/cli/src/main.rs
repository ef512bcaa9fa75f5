use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use clip_pipeline::{
    download_artifact, AspectRatio, BackendConfig, BackendFactory, BackendType, ControllerError,
    ControllerState, FileSource, HttpBackend, JobController, JobId, PollSettings,
    ProcessingBackend, StatusSnapshot, SubmissionRequest,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "clipsmith-cli")]
#[command(about = "Clipsmith CLI - Submit videos for clip generation and follow the job")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a video and wait for the generated clip
    Submit(SubmitArgs),

    /// Check the status of a job once
    Status {
        /// Job ID returned by the service
        id: String,

        /// Backend config file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Job service base URL
        #[arg(long)]
        api_url: Option<String>,
    },

    /// Write a default backend config file
    InitConfig {
        /// Output file path
        path: PathBuf,
    },
}

#[derive(Args)]
struct SubmitArgs {
    /// Public video URL
    #[arg(long, conflicts_with = "file", required_unless_present = "file")]
    url: Option<String>,

    /// Local video file to upload
    #[arg(long)]
    file: Option<PathBuf>,

    /// What the clip should contain
    #[arg(short, long, default_value = "")]
    query: String,

    /// Output aspect ratio (1:1, 16:9, 9:16)
    #[arg(short, long, default_value = "16:9")]
    aspect_ratio: AspectRatio,

    /// Burn captions into the clip
    #[arg(long)]
    captions: bool,

    /// Simulate processing locally instead of calling the service
    #[arg(long)]
    demo: bool,

    /// Backend config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Job service base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Delay between status checks
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Give up after this many status checks
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Download the finished clip to this path
    #[arg(short, long)]
    download: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt().with_max_level(level).init();

    match cli.command {
        Commands::Submit(args) => submit_command(args).await,
        Commands::Status {
            id,
            config,
            api_url,
        } => status_command(id, config, api_url).await,
        Commands::InitConfig { path } => init_config_command(path),
    }
}

/// Config file, then `CLIPSMITH_*` variables, then flags
fn resolve_config(path: Option<&Path>, api_url: Option<String>) -> Result<BackendConfig> {
    let config = match path {
        Some(path) => BackendConfig::load(path)?,
        None => BackendConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(url) = api_url {
        config = config.with_api_url(url);
    }
    Ok(config)
}

fn progress_bar() -> Result<ProgressBar> {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:40}] {pos:>3}% {msg}")?
            .progress_chars("=> "),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    Ok(bar)
}

fn render(bar: &ProgressBar, snapshot: &StatusSnapshot) {
    bar.set_position(snapshot.progress_percent.round() as u64);
    let message = match &snapshot.detailed_status {
        Some(detail) => format!("{}: {}", snapshot.stage, detail),
        None => snapshot.stage.clone(),
    };
    bar.set_message(message);
}

async fn submit_command(args: SubmitArgs) -> Result<()> {
    let mut config = resolve_config(args.config.as_deref(), args.api_url)?;
    if args.demo {
        config.backend_type = BackendType::Demo;
    }
    if let Some(ms) = args.poll_interval_ms {
        config = config.with_poll_interval_ms(ms);
    }
    if let Some(max) = args.max_attempts {
        config = config.with_max_poll_attempts(max);
    }

    let req = match (args.url, args.file) {
        (Some(url), _) => SubmissionRequest::from_url(url),
        (None, Some(path)) => {
            let file = FileSource::from_path(&path).await?;
            info!("Loaded {} ({:.1} MB)", file.file_name, file.size_mb());
            SubmissionRequest::from_file(file)
        }
        (None, None) => bail!("either --url or --file is required"),
    }
    .with_instruction(args.query)
    .with_aspect_ratio(args.aspect_ratio)
    .with_captions(args.captions);

    let bar = progress_bar()?;
    let backend: Arc<dyn ProcessingBackend> = match config.backend_type {
        BackendType::Http => {
            let upload_bar = bar.clone();
            let backend = HttpBackend::new(&config)?.with_upload_observer(Arc::new(
                move |sent: u64, total: u64| {
                    upload_bar.set_message(format!("Uploading {}%", sent * 100 / total.max(1)));
                },
            ));
            Arc::new(backend)
        }
        BackendType::Demo => Arc::from(BackendFactory::create(&config)?),
    };
    info!("Using {} backend", backend.name());

    let controller = JobController::new(backend, PollSettings::from(&config));
    let mut updates = controller.subscribe();
    let renderer = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let snapshot = updates.borrow_and_update().clone();
                render(&bar, &snapshot);
                if snapshot.is_terminal {
                    break;
                }
            }
        })
    };

    let run = async {
        controller.submit(req).await?;
        Ok::<_, ControllerError>(controller.wait_for_terminal().await)
    };

    // Ctrl-C covers the upload as well as polling
    let outcome = tokio::select! {
        outcome = run => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling job");
            controller.reset();
            renderer.abort();
            bar.abandon_with_message("Cancelled");
            bail!("Cancelled");
        }
    };
    let done = match outcome {
        Ok(done) => done,
        Err(e) => {
            renderer.abort();
            bar.abandon();
            return Err(e.into());
        }
    };
    renderer.abort();
    render(&bar, &done);

    match done.state {
        ControllerState::Completed => bar.finish_with_message(done.stage.clone()),
        _ => bar.abandon_with_message(done.stage.clone()),
    }

    for (step, complete) in done.steps() {
        println!("  [{}] {}", if complete { "x" } else { " " }, step.label());
    }

    if done.state == ControllerState::Failed {
        bail!(
            "Processing failed: {}",
            done.error_message.as_deref().unwrap_or("unknown error")
        );
    }

    let uri = done
        .result_uri
        .context("job completed without a result")?;
    println!("Result: {}", uri);

    if let Some(dest) = args.download {
        let client = reqwest::Client::new();
        let bytes = download_artifact(&client, &uri, &dest).await?;
        println!("Saved {} ({} bytes)", dest.display(), bytes);
    }

    Ok(())
}

async fn status_command(id: String, config: Option<PathBuf>, api_url: Option<String>) -> Result<()> {
    let config = resolve_config(config.as_deref(), api_url)?;
    if config.backend_type != BackendType::Http {
        bail!("status checks need an HTTP backend config");
    }

    let backend = HttpBackend::new(&config)?;
    info!("Checking job {} at {}", id, backend.api_url());
    let job = backend.poll_job(&JobId::new(id)).await?;

    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

fn init_config_command(path: PathBuf) -> Result<()> {
    let config = BackendConfig::default().with_api_url("http://localhost:8000/api");
    config.save(&path)?;
    info!("Wrote backend config to {:?}", path);
    Ok(())
}
