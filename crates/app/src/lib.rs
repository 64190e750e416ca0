use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use srtile_core::backends::{
    BackendKind, BackendOptions, BackendRegistry, TileObserver, TiledRun,
};
use srtile_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use srtile_core::device::Device;
use srtile_core::error::SrError;
use srtile_core::facade::{read_image, write_image};
use srtile_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use srtile_core::types::{EnhancementRequest, Tile};
use srtile_core::zoo::ModelZoo;

#[derive(Parser)]
#[command(
    name = "srtile",
    about = "Tiled neural image upscaling",
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    enhance: EnhanceArgs,

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

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the model catalog, or fetch one entry's weights.
    Models(ModelsArgs),
}

#[derive(Args)]
struct ModelsArgs {
    #[arg(long, value_name = "NAME", help = "Download the weights of a catalog entry")]
    download: Option<String>,
}

#[derive(Args, Debug, Default)]
struct EnhanceArgs {
    #[arg(help = "Input image")]
    input: Option<PathBuf>,
    #[arg(help = "Output image; the format follows the extension")]
    output: Option<PathBuf>,
    #[arg(long, help = "Checkpoint (native) or ONNX graph (frozen)")]
    model: Option<PathBuf>,
    #[arg(long, help = "Overall upscaling factor [config default: 2.0]")]
    scale: Option<f64>,
    #[arg(long, value_parser = parse_device, help = "cpu or cuda [default: auto]")]
    device: Option<Device>,
    #[arg(long, help = "Run the whole image in one forward pass")]
    no_patches: bool,
    #[arg(long, help = "Maximum tile side in pixels [config default: 300]")]
    patch_size: Option<usize>,
    #[arg(long, value_enum, default_value_t = BackendArg::Native)]
    backend: BackendArg,
    #[arg(long, help = "Vendor algorithm (frozen) or catalog model (gan)")]
    model_name: Option<String>,
    #[arg(long, help = "Native scale of the vendor model")]
    native_scale: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
enum BackendArg {
    /// Built-in network, or bicubic without a model
    #[default]
    Native,
    /// Vendor ONNX graph
    #[value(alias = "vendor")]
    Frozen,
    /// Real-ESRGAN catalog model
    #[value(alias = "realesrgan", alias = "real-esrgan")]
    Gan,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Native => Self::Native,
            BackendArg::Frozen => Self::Frozen,
            BackendArg::Gan => Self::Gan,
        }
    }
}

fn parse_device(value: &str) -> Result<Device, SrError> {
    value.parse()
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    srtile_core::runtime::setup_runtime_libs();

    // Logging needs the retention setting, but a broken config must still be
    // reported through the subscriber.
    let loaded = initialize_data_dir(&resolved_data_dir)
        .and_then(|()| AppConfig::load_from_path(&config_path(&resolved_data_dir)));
    let retention_files = loaded
        .as_ref()
        .map(|cfg| cfg.logging.retention_files)
        .unwrap_or(logging::DEFAULT_LOG_RETENTION_FILES);

    init_logging(
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
        retention_files,
    );
    srtile_core::runtime::log_runtime_lib_status();
    info!(
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "Runtime startup metadata"
    );

    let config = loaded?;
    let models_dir = config.models_dir(&resolved_data_dir);

    match cli.command {
        Some(Commands::Models(args)) => run_models(&models_dir, args.download.as_deref()),
        None => run_enhance(cli.enhance, &config, models_dir),
    }
}

fn run_models(models_dir: &Path, download: Option<&str>) -> Result<()> {
    let mut zoo = ModelZoo::with_builtin_models(models_dir.to_path_buf());
    if let Err(error) = zoo.discover() {
        warn!(error = %format!("{error:#}"), "Model discovery failed");
    }

    if let Some(name) = download {
        let path = zoo.download(name)?;
        println!("{}", path.display());
        return Ok(());
    }

    println!("{}", zoo.to_json()?);
    Ok(())
}

fn run_enhance(args: EnhanceArgs, config: &AppConfig, models_dir: PathBuf) -> Result<()> {
    let input = args
        .input
        .clone()
        .context("missing INPUT image (see --help)")?;
    let output = args
        .output
        .clone()
        .context("missing OUTPUT image (see --help)")?;

    let request = build_request(&args, config);
    request.validate()?;

    let kind = BackendKind::from(args.backend);
    let options = BackendOptions {
        device: args.device,
        model_path: args.model.clone(),
        model_name: args.model_name.clone(),
        native_scale: args.native_scale,
        scale: Some(request.scale),
    };

    let registry = BackendRegistry::probe(config, models_dir);
    let backend = registry
        .create(kind, &options)
        .with_context(|| format!("failed to initialize {kind} backend"))?;

    let image = read_image(&input)?;
    info!(
        input = %input.display(),
        width = image.width(),
        height = image.height(),
        backend = %kind,
        scale = request.scale,
        "Enhancing image"
    );

    let started = Instant::now();
    let progress = ProgressBar::new(started);
    let enhanced = backend.enhance_with_progress(&image, &request, &progress)?;
    write_image(&enhanced, &output)?;

    info!(
        output = %output.display(),
        width = enhanced.width(),
        height = enhanced.height(),
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Wrote enhanced image"
    );
    Ok(())
}

/// Flags win over `[enhance]` in `config.toml`.
fn build_request(args: &EnhanceArgs, config: &AppConfig) -> EnhancementRequest {
    let mut request = config.enhance.request();
    if let Some(scale) = args.scale {
        request.scale = scale;
    }
    if let Some(patch_size) = args.patch_size {
        request.patch_size = patch_size;
    }
    if args.no_patches {
        request.use_patches = false;
    }
    request
}

const PROGRESS_BAR_WIDTH: usize = 30;

/// Tile progress on stderr, redrawn in place.
struct ProgressBar {
    started: Instant,
}

impl ProgressBar {
    fn new(started: Instant) -> Self {
        Self { started }
    }
}

impl ProgressBar {
    fn draw(&self, done: usize, total: usize) {
        eprint!(
            "\r{}",
            progress_line(done, total, self.started.elapsed().as_secs_f64())
        );
    }
}

impl TileObserver for ProgressBar {
    fn on_start(&self, run: &TiledRun) {
        if run.tiles > 1 {
            eprintln!(
                "{} tiles of {}px on {}x{}, x{}",
                run.tiles, run.tile_size, run.width, run.height, run.scale
            );
        }
    }

    // Drawn before the forward pass, so `index - 1` tiles are done.
    fn on_tile(&self, index: usize, total: usize, _region: &Tile) {
        self.draw(index.saturating_sub(1), total);
    }

    fn on_tile_failed(&self, _index: usize, _error: &SrError) {
        eprintln!();
    }

    fn on_complete(&self, total: usize) {
        self.draw(total, total);
        eprintln!();
    }
}

fn progress_line(done: usize, total: usize, elapsed: f64) -> String {
    let fraction = if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));

    let eta = if done > 0 && done < total {
        let per_tile = elapsed / done as f64;
        format!(" | ETA: {}", format_duration(per_tile * (total - done) as f64))
    } else {
        String::new()
    };

    format!(
        "[{bar}] {:5.1}% | Tile {done}/{total} | Elapsed: {}{eta}    ",
        fraction * 100.0,
        format_duration(elapsed)
    )
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>, retention_files: usize) {
    let init_options = LoggingInitOptions {
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        retention_files,
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_filter = parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(logging::redacting_make_writer(appender))
                        .with_filter(file_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}
