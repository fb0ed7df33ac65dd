//! Binary entry points: HTTP server (default), one-shot local grading,
//! and the queue-job runner.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};

use gradia_core::config::{self, AppConfig};
use gradia_core::device::{DevicePolicy, InferenceBackend};
use gradia_core::logging::{self, LoggingOptions};
use gradia_core::model::ModelPair;
use gradia_core::pipeline::{process_video, ProcessRequest};
use gradia_core::server::{serve, AppState};
use gradia_core::types::OutputResolution;
use gradia_core::worker::{run_job, JobPayload, JobResult};

#[derive(Parser)]
#[command(
    name = "gradia",
    about = "Reference-driven AI video color grading",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade a local video file without going through the server.
    Process(ProcessArgs),
    /// Run a single queue-style job described by a JSON payload file.
    Job(JobArgs),
}

#[derive(Args)]
struct ProcessArgs {
    #[arg(help = "Input video path")]
    input: PathBuf,
    #[arg(short, long, help = "Output video path")]
    output: PathBuf,
    #[arg(short = 'r', long, help = "Style reference image (defaults to the clip itself)")]
    reference: Option<PathBuf>,
    #[arg(short = 'q', long, help = "Quality mode: fast|balanced|high")]
    quality: Option<String>,
    #[arg(long, help = "Output resolution: auto or WxH")]
    resolution: Option<String>,
    #[arg(long, action = ArgAction::SetTrue, help = "Disable stabilization")]
    no_stabilization: bool,
}

#[derive(Args)]
struct JobArgs {
    #[arg(help = "Path to a JSON job payload")]
    payload: PathBuf,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = config::data_dir(cli.data_dir.as_deref());

    gradia_core::runtime::setup_runtime_libs();
    let _log_guard = logging::init(
        &LoggingOptions {
            verbose: cli.verbose,
            cli_log_filter: cli.log_filter.clone(),
            rust_log_env: std::env::var("RUST_LOG").ok(),
        },
        Some(&resolved_data_dir),
    );
    gradia_core::runtime::log_runtime_lib_status();
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        "starting gradia"
    );

    let config = match config::initialize_data_dir(&resolved_data_dir) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "failed to initialize data directory, using defaults");
            AppConfig::default()
        }
    };

    match cli.command {
        Some(Commands::Process(args)) => run_process(args, &config, &resolved_data_dir).await,
        Some(Commands::Job(args)) => run_queue_job(args, &config, &resolved_data_dir).await,
        None => run_server(cli.port, cli.host, config, resolved_data_dir).await,
    }
}

/// Loads the model pair under the configured backend policy.
fn load_engine(config: &AppConfig, data_dir: &Path) -> Result<(ModelPair, DevicePolicy)> {
    let models_dir = config::resolve_relative_to(data_dir, &config.paths.models_dir);
    let trt_cache = config::resolve_relative_to(data_dir, &config.paths.trt_cache_dir);

    let backend = InferenceBackend::from_str_lossy(&config.pipeline.backend);
    let policy = DevicePolicy::detect(backend, Some(trt_cache));
    info!(device = %policy.describe(), "inference device selected");

    let models = ModelPair::load(&models_dir, &policy, config.pipeline.lut_size)?;
    Ok((models, policy))
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
    data_dir: PathBuf,
) -> Result<()> {
    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let (models, policy) = load_engine(&config, &data_dir)?;
    let state = AppState::new(
        models,
        policy,
        config::resolve_relative_to(&data_dir, &config.paths.upload_dir),
        config::resolve_relative_to(&data_dir, &config.paths.output_dir),
        config.pipeline.default_quality,
    );

    serve(state, &host, port).await
}

async fn run_process(args: ProcessArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let quality = match args.quality.as_deref() {
        Some(raw) => raw.parse()?,
        None => config.pipeline.default_quality,
    };
    let output_resolution = match args.resolution.as_deref() {
        Some(raw) => raw.parse()?,
        None => OutputResolution::Auto,
    };

    let request = ProcessRequest {
        video_path: args.input,
        reference_image: args.reference,
        quality,
        stabilization: !args.no_stabilization,
        output_resolution,
        output_path: args.output,
    };

    let (models, policy) = load_engine(config, data_dir)?;
    let outcome =
        tokio::task::spawn_blocking(move || process_video(&models, &policy, &request))
            .await
            .context("pipeline task panicked")??;

    info!(
        output = %outcome.output_path.display(),
        frames = outcome.frames,
        seconds = outcome.duration.as_secs_f64(),
        device = %outcome.compute_target,
        "done"
    );
    Ok(())
}

async fn run_queue_job(args: JobArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(&args.payload)
        .with_context(|| format!("failed to read job payload: {}", args.payload.display()))?;
    let payload: JobPayload =
        serde_json::from_str(&raw).context("failed to parse job payload JSON")?;

    let (models, policy) = load_engine(config, data_dir)?;
    let upload_dir = config::resolve_relative_to(data_dir, &config.paths.upload_dir);
    let output_dir = config::resolve_relative_to(data_dir, &config.paths.output_dir);
    let default_quality = config.pipeline.default_quality;

    // The job runner uses blocking IO for downloads, so it must stay off
    // the async worker threads.
    let result = tokio::task::spawn_blocking(move || {
        run_job(
            &models,
            &policy,
            &payload,
            &upload_dir,
            &output_dir,
            default_quality,
        )
    })
    .await
    .context("job task panicked")?;

    println!("{}", serde_json::to_string_pretty(&result)?);

    match result {
        JobResult::Completed { .. } => Ok(()),
        JobResult::Failed { error, .. } => bail!("job failed: {error}"),
    }
}
