use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;

use conveyor::config::{PipelineConfig, RunMode, validate::validate_config};
use conveyor::diagnostics;
use conveyor::manifest::summary::ManifestSummary;
use conveyor::orchestrator::init::{InitOptions, init_run};
use conveyor::orchestrator::watch::WatchOptions;
use conveyor::orchestrator::{Orchestrator, pid};
use conveyor::util::parse_duration_arg;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Resumable batch-LLM pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a run directory: snapshot config, generate units, write manifest
    Init {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        run_dir: PathBuf,
        /// Cap the unit enumeration (0 creates an empty, complete run)
        #[arg(long)]
        max_units: Option<u64>,
        /// Override the config's api.mode
        #[arg(long)]
        mode: Option<String>,
    },
    /// Advance the batch state machine by one step
    Tick {
        #[arg(short, long)]
        run_dir: PathBuf,
    },
    /// Tick repeatedly until the run is terminal
    Watch {
        #[arg(short, long)]
        run_dir: PathBuf,
        /// Seconds between ticks (defaults to the run's poll_interval)
        #[arg(long)]
        interval: Option<u64>,
        /// Pause once estimated cost exceeds this many USD
        #[arg(long)]
        max_cost: Option<f64>,
        /// Pause after this much wall-clock time (e.g. "30m", "2h")
        #[arg(long)]
        timeout: Option<String>,
    },
    /// Drive the run end-to-end with synchronous per-unit calls
    Realtime {
        #[arg(short, long)]
        run_dir: PathBuf,
    },
    /// Print the run's current status
    Status {
        #[arg(short, long)]
        run_dir: PathBuf,
    },
    /// Reset failed units so the next tick redoes them
    RetryFailures {
        #[arg(short, long)]
        run_dir: PathBuf,
        /// Only reset failures of this step
        #[arg(long)]
        step: Option<String>,
    },
    /// Re-run validation against journalled results, no provider calls
    Revalidate {
        #[arg(short, long)]
        run_dir: PathBuf,
        #[arg(long)]
        step: Option<String>,
    },
    /// Pre-flight a config file without creating a run
    ValidateConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Cancel in-flight batches and mark the run killed
    Cancel {
        #[arg(short, long)]
        run_dir: PathBuf,
    },
}

const EXIT_OK: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_VALIDATION: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // clap handles --help/--version as "errors" with exit 0
            if e.use_stderr() {
                eprintln!("{e}");
                return ExitCode::from(EXIT_USAGE);
            }
            print!("{e}");
            return ExitCode::from(EXIT_OK);
        }
    };

    let filter = if cli.verbose { "conveyor=debug" } else { "conveyor=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run_command(cli.command).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {e:#}", style("error:").red().bold());
            ExitCode::from(EXIT_USAGE)
        }
    }
}

async fn run_command(command: Commands) -> anyhow::Result<u8> {
    match command {
        Commands::Init { config, run_dir, max_units, mode } => {
            let mode = match mode.as_deref() {
                None => None,
                Some("batch") => Some(RunMode::Batch),
                Some("realtime") => Some(RunMode::Realtime),
                Some(other) => anyhow::bail!("invalid mode '{other}' (batch|realtime)"),
            };
            let orchestrator = init_run(&run_dir, &config, &InitOptions { max_units, mode })?;
            let manifest = orchestrator.load_manifest()?;
            println!(
                "Initialized run at {} ({} units in {} chunks)",
                run_dir.display(),
                manifest.total_units(),
                manifest.chunks.len()
            );
            Ok(EXIT_OK)
        }
        Commands::Tick { run_dir } => {
            let mut orchestrator = Orchestrator::open(&run_dir)?;
            orchestrator.acquire_writer()?;
            let outcome = orchestrator.tick().await?;
            let manifest = orchestrator.load_manifest()?;
            println!(
                "tick: {} ({}%)",
                manifest.status.as_str(),
                manifest.progress()
            );
            if outcome.terminal {
                let _ = diagnostics::write_report(&run_dir, &manifest);
            }
            Ok(EXIT_OK)
        }
        Commands::Watch { run_dir, interval, max_cost, timeout } => {
            let timeout = match timeout {
                None => None,
                Some(text) => Some(
                    parse_duration_arg(&text)
                        .ok_or_else(|| anyhow::anyhow!("invalid timeout '{text}'"))?,
                ),
            };
            let mut orchestrator = Orchestrator::open(&run_dir)?;
            orchestrator
                .watch(&WatchOptions { interval, max_cost, timeout })
                .await?;
            let manifest = orchestrator.load_manifest()?;
            println!("watch finished: {} ({}%)", manifest.status.as_str(), manifest.progress());
            let _ = diagnostics::write_report(&run_dir, &manifest);
            Ok(EXIT_OK)
        }
        Commands::Realtime { run_dir } => {
            let mut orchestrator = Orchestrator::open(&run_dir)?;
            orchestrator.run_realtime().await?;
            let manifest = orchestrator.load_manifest()?;
            println!(
                "realtime finished: {} ({}%)",
                manifest.status.as_str(),
                manifest.progress()
            );
            let _ = diagnostics::write_report(&run_dir, &manifest);
            Ok(EXIT_OK)
        }
        Commands::Status { run_dir } => {
            let mut manifest = conveyor::manifest::load_manifest(&run_dir)?;
            diagnostics::check_manifest_consistency(&run_dir, &mut manifest)?;
            print_status(&run_dir, &ManifestSummary::from_manifest(&manifest));
            let drift =
                diagnostics::verify_disk_vs_manifest(&run_dir, &manifest.pipeline, &manifest)?;
            if !drift.is_empty() {
                println!("  {}", style("disk/manifest drift:").yellow().bold());
                for line in &drift {
                    println!("    {line}");
                }
            }
            Ok(EXIT_OK)
        }
        Commands::RetryFailures { run_dir, step } => {
            let mut orchestrator = Orchestrator::open(&run_dir)?;
            orchestrator.acquire_writer()?;
            let stats = orchestrator.retry_failures(step.as_deref(), None)?;
            println!(
                "reset {} unit(s) across {} chunk(s)",
                stats.units_reset, stats.chunks_reset
            );
            Ok(EXIT_OK)
        }
        Commands::Revalidate { run_dir, step } => {
            let mut orchestrator = Orchestrator::open(&run_dir)?;
            orchestrator.acquire_writer()?;
            let stats = orchestrator.revalidate(step.as_deref())?;
            println!(
                "revalidated {} unit(s): {} passed, {} failed",
                stats.revalidated, stats.passed, stats.failed
            );
            Ok(EXIT_OK)
        }
        Commands::ValidateConfig { config } => {
            let parsed = match PipelineConfig::load(&config) {
                Ok(parsed) => parsed,
                Err(e) => {
                    eprintln!("{} {e:#}", style("invalid:").red().bold());
                    return Ok(EXIT_VALIDATION);
                }
            };
            let errors = validate_config(&parsed);
            if errors.is_empty() {
                println!("{} {}", style("valid:").green().bold(), config.display());
                Ok(EXIT_OK)
            } else {
                eprintln!("{} {}", style("invalid:").red().bold(), config.display());
                for error in &errors {
                    eprintln!("  - {error}");
                }
                Ok(EXIT_VALIDATION)
            }
        }
        Commands::Cancel { run_dir } => {
            let mut orchestrator = Orchestrator::open(&run_dir)?;
            orchestrator.acquire_writer()?;
            orchestrator.cancel().await?;
            println!("run killed");
            Ok(EXIT_OK)
        }
    }
}

fn print_status(run_dir: &std::path::Path, summary: &ManifestSummary) {
    println!("{}", style(format!("Run {}", run_dir.display())).bold());
    println!("  status:   {}", summary.status);
    println!("  progress: {}%", summary.progress);
    println!(
        "  units:    {} total, {} valid, {} failed",
        summary.total_units, summary.valid_units, summary.failed_units
    );
    println!(
        "  pipeline: {} [{}]",
        summary.pipeline_name,
        summary.pipeline.join(" -> ")
    );
    if !summary.current_step.is_empty() {
        println!("  step:     {}", summary.current_step);
    }
    println!(
        "  provider: {} / {} ({})",
        summary.provider, summary.model, summary.mode
    );
    println!("  tokens:   {}", summary.total_tokens);
    println!("  cost:     ${:.4}", summary.cost);
    match pid::writer_state(run_dir) {
        pid::WriterState::Alive(pid) => println!("  writer:   pid {pid} (alive)"),
        pid::WriterState::Detached(pid) => println!("  writer:   pid {pid} (detached)"),
        pid::WriterState::Unknown => {}
    }
    if let Some(error) = &summary.error_message {
        println!("  error:    {error}");
    }
}
