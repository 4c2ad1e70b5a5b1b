use std::{path::PathBuf, process, sync::Arc, time::Duration};

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{filter::LevelFilter, fmt};

use croplens_app::analysis::{AnalysisKind, DiagnosisTag};
use croplens_app::config;
use croplens_app::error::AppError;
use croplens_app::images::FsImageRepository;
use croplens_app::record::MemoryRecordStore;
use croplens_app::services::{
    AnalysisGuard, OpenAiVisionModel, RegistrationPipeline, StagedImage, VisionClient,
};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "croplens",
    version,
    author,
    about = "Croplens crop image analysis"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stage an image, run the registration analysis, and print the
    /// record's status report.
    Register(RegisterArgs),
    /// Run a one-shot analysis of an image file and print the decoded
    /// fields, without touching any record.
    Analyze(AnalyzeArgs),
}

#[derive(Debug, clap::Args)]
struct RegisterArgs {
    /// Image file to analyze.
    image: PathBuf,
    /// Owner id to attribute the record to.
    #[arg(long, default_value_t = 1)]
    owner: u64,
    /// Mark the record registered after a successful analysis.
    #[arg(long)]
    finalize: bool,
}

#[derive(Debug, clap::Args)]
struct AnalyzeArgs {
    /// Image file to analyze.
    image: PathBuf,
    /// Which analysis to run.
    #[arg(long, value_enum, default_value_t = AnalyzeKind::Registration)]
    kind: AnalyzeKind,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum AnalyzeKind {
    Registration,
    CurrentStatus,
    DiseaseCheck,
    QualityMarket,
}

impl From<AnalyzeKind> for AnalysisKind {
    fn from(kind: AnalyzeKind) -> Self {
        match kind {
            AnalyzeKind::Registration => AnalysisKind::Registration,
            AnalyzeKind::CurrentStatus => AnalysisKind::Diagnosis(DiagnosisTag::CurrentStatus),
            AnalyzeKind::DiseaseCheck => AnalysisKind::Diagnosis(DiagnosisTag::DiseaseCheck),
            AnalyzeKind::QualityMarket => AnalysisKind::Diagnosis(DiagnosisTag::QualityMarket),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(determine_log_level(cli.verbose));

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn determine_log_level(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Register(args) => run_register(args).await,
        Commands::Analyze(args) => run_analyze(args).await,
    }
}

async fn run_register(args: RegisterArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let bytes = read_image(&args.image)?;
    let image_path = args
        .image
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| AppError::Config(format!("cannot derive a name from {:?}", args.image)))?;

    let model = OpenAiVisionModel::from_env(
        cfg.vision.base_url.clone(),
        Duration::from_secs(cfg.vision.timeout_secs),
    )?;
    let vision = Arc::new(VisionClient::new(model, cfg.vision.to_vision_config()));
    let records = Arc::new(MemoryRecordStore::default());
    let images = Arc::new(FsImageRepository::new(cfg.storage.image_dir.clone()));
    let guard = Arc::new(AnalysisGuard::new(Duration::from_secs(
        cfg.dispatch.guard_wait_secs,
    )));
    let pipeline = RegistrationPipeline::new(
        records,
        images,
        vision,
        guard,
        cfg.dispatch.worker_slots,
    );

    let record = pipeline
        .analyze_staged(args.owner, StagedImage { image_path, bytes })
        .await?;
    let record = if args.finalize {
        pipeline.finalize(record.id, args.owner).await?
    } else {
        record
    };

    let report = pipeline.status_report(record.id, args.owner).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_analyze(args: AnalyzeArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let bytes = read_image(&args.image)?;

    let model = OpenAiVisionModel::from_env(
        cfg.vision.base_url.clone(),
        Duration::from_secs(cfg.vision.timeout_secs),
    )?;
    let vision = VisionClient::new(model, cfg.vision.to_vision_config());

    let outcome = vision.analyze(&bytes, args.kind.into()).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn read_image(path: &PathBuf) -> Result<Vec<u8>, AppError> {
    std::fs::read(path).map_err(|source| AppError::Io {
        path: path.clone(),
        source,
    })
}
