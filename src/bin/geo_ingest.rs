use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::thread;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use geo_ingest::archive::TarGzCodec;
use geo_ingest::config::{ConfigLoader, ResolvedConfig};
use geo_ingest::domain::{DatasetId, Stage};
use geo_ingest::error::IngestError;
use geo_ingest::layout::Layout;
use geo_ingest::output::{JsonOutput, OutputMode, TracingSink};
use geo_ingest::pipeline::{Pipeline, PipelineOptions, ProgressSink, RunReport, StageAction};
use geo_ingest::remote::HttpFetcher;

#[derive(Parser)]
#[command(name = "geo-ingest")]
#[command(about = "Download, unpack and tabulate GEO series supplementary archives")]
#[command(version)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    workspace: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the pipeline for one or more datasets")]
    Run(RunArgs),
    #[command(about = "Show which stages are complete")]
    Status(StatusArgs),
    #[command(about = "Forget a stage and everything after it")]
    Reset(ResetArgs),
}

#[derive(Args)]
struct RunArgs {
    datasets: Vec<String>,

    #[arg(long, value_enum, default_value_t = Stage::Cleanup)]
    until: Stage,

    #[arg(long, default_value_t = 1)]
    jobs: usize,
}

#[derive(Args)]
struct StatusArgs {
    dataset: String,
}

#[derive(Args)]
struct ResetArgs {
    dataset: String,

    #[arg(long, value_enum)]
    from: Stage,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<IngestError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &IngestError) -> u8 {
    match error.root_cause() {
        IngestError::InvalidDatasetId(_)
        | IngestError::InvalidStage(_)
        | IngestError::MissingConfig(_)
        | IngestError::ConfigRead(_)
        | IngestError::ConfigParse(_) => 2,
        IngestError::Transfer(_) | IngestError::TransferStatus { .. } => 3,
        IngestError::Dependency { .. } | IngestError::StageLocked { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;
    if let Some(workspace) = cli.workspace {
        config.workspace = workspace;
    }

    let sink: Arc<dyn ProgressSink> = match output_mode {
        OutputMode::Json => Arc::new(JsonOutput),
        OutputMode::Human => Arc::new(TracingSink),
    };
    let fetcher = HttpFetcher::new(config.http_timeout, config.max_retries)?;
    let pipeline = Pipeline::new(
        Layout::new(config.workspace.clone()),
        fetcher,
        TarGzCodec,
        PipelineOptions::from(&config),
        sink,
    );

    match cli.command {
        Commands::Run(args) => run_datasets(args, &config, &pipeline, output_mode),
        Commands::Status(args) => {
            let id: DatasetId = args.dataset.parse()?;
            let status = pipeline.status(&id);
            match output_mode {
                OutputMode::Json => JsonOutput::print_status(&status).into_diagnostic()?,
                OutputMode::Human => {
                    println!("{}", status.dataset);
                    for stage in &status.stages {
                        let mark = if stage.complete { "done" } else { "pending" };
                        println!("  {:<9} {mark:<8} {}", stage.stage, stage.marker);
                    }
                }
            }
            Ok(())
        }
        Commands::Reset(args) => {
            let id: DatasetId = args.dataset.parse()?;
            let cleared = pipeline.reset(&id, args.from)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_json(&cleared).into_diagnostic()?,
                OutputMode::Human => {
                    if cleared.is_empty() {
                        println!("{id}: nothing to reset");
                    }
                    for stage in cleared {
                        println!("{id}: reset {stage}");
                    }
                }
            }
            Ok(())
        }
    }
}

fn run_datasets(
    args: RunArgs,
    config: &ResolvedConfig,
    pipeline: &Pipeline<HttpFetcher, TarGzCodec>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let ids = if args.datasets.is_empty() {
        config.datasets.clone()
    } else {
        args.datasets
            .iter()
            .map(|value| value.parse())
            .collect::<Result<Vec<DatasetId>, IngestError>>()?
    };
    if ids.is_empty() {
        return Err(miette::Report::msg(
            "no datasets given (pass ids or list them under \"datasets\" in the config)",
        ));
    }

    // Distinct ids touch disjoint paths, so workers need no coordination.
    let queue = Mutex::new(ids.into_iter());
    let results = Mutex::new(Vec::new());
    let workers = args.jobs.max(1);
    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let next = queue.lock().ok().and_then(|mut ids| ids.next());
                    let Some(id) = next else {
                        break;
                    };
                    let outcome = pipeline.execute_until(&id, args.until);
                    if let Ok(mut results) = results.lock() {
                        results.push((id, outcome));
                    }
                }
            });
        }
    });
    let mut results = results
        .into_inner()
        .map_err(|_| miette::Report::msg("worker panicked"))?;
    results.sort_by(|a, b| a.0.cmp(&b.0));

    let mut reports = Vec::new();
    let mut first_error = None;
    for (id, outcome) in results {
        match outcome {
            Ok(report) => reports.push(report),
            Err(err) => {
                tracing::error!(dataset = %id, "{err}");
                first_error.get_or_insert(err);
            }
        }
    }

    match output_mode {
        OutputMode::Json => JsonOutput::print_runs(&reports).into_diagnostic()?,
        OutputMode::Human => print_summary(&reports),
    }

    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn print_summary(reports: &[RunReport]) {
    for report in reports {
        println!("{}", report.dataset);
        for stage in &report.stages {
            let action = match stage.action {
                StageAction::Executed => "ran",
                StageAction::Skipped => "skipped",
            };
            println!(
                "  {:<9} {action:<8} {:>7} ms  {} warnings",
                stage.stage,
                stage.elapsed_ms,
                stage.warnings.len()
            );
        }
    }
}
