use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use calculix_runner::models::CandidateRecord;
use calculix_runner::solver::resolve_executable;
use calculix_runner::{
    BatchOptimizer, CalculixRunner, CancellationToken, CommandMesher, FeaError, FeaResult,
    LoadOverrides, RunConfig, RunController,
};

#[derive(Parser, Debug)]
#[command(name = "calculix-runner")]
#[command(version)]
#[command(about = "Mesh-convergence and batch runs of CalculiX plate/channel models")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON run configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one candidate to mesh convergence
    Run {
        /// Candidate record (JSON object)
        candidate: PathBuf,

        /// Load overrides (JSON object)
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
    /// Run every candidate of a JSON array and archive each result
    Batch {
        /// Candidate records (JSON array)
        candidates: PathBuf,

        /// Load overrides (JSON object)
        #[arg(long)]
        overrides: Option<PathBuf>,
    },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> FeaResult<T> {
    let content = fs::read_to_string(path)
        .map_err(|e| FeaError::InputGeometry(format!("failed to read {:?}: {}", path, e)))?;
    Ok(serde_json::from_str(&content)?)
}

fn load_overrides(path: Option<&Path>) -> FeaResult<LoadOverrides> {
    match path {
        Some(path) => read_json(path),
        None => Ok(LoadOverrides::default()),
    }
}

fn build_optimizer(
    config: RunConfig,
    overrides: LoadOverrides,
) -> BatchOptimizer<CommandMesher, CalculixRunner> {
    match resolve_executable(&config.solver_path) {
        Some(path) => tracing::info!("Using CalculiX command: {}", path.display()),
        None => {
            tracing::warn!("CalculiX not found at '{}'", config.solver_path);
            tracing::warn!("Set CALCULIX_PATH to the ccx executable; solves will fail until then");
        }
    }
    let mesher = CommandMesher::new(config.mesher_command.clone());
    let solver = CalculixRunner::new(config.solver_path.clone());
    BatchOptimizer::new(RunController::new(mesher, solver, config), overrides)
}

async fn run_cli(cli: Cli) -> FeaResult<()> {
    let config = RunConfig::load(cli.config.as_deref())?;
    tracing::info!(
        "Work dir {}, archive {}",
        config.work_dir.display(),
        config.archive_dir.display()
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl-C received; stopping after the current iteration");
                cancel.cancel();
            }
        });
    }

    let mut sink = |line: &str| eprintln!("{}", line);

    match cli.command {
        Commands::Run {
            candidate,
            overrides,
        } => {
            let record: CandidateRecord = read_json(&candidate)?;
            let optimizer = build_optimizer(config, load_overrides(overrides.as_deref())?);
            let report = optimizer.run(vec![record], &cancel, &mut sink).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Batch {
            candidates,
            overrides,
        } => {
            let records: Vec<CandidateRecord> = read_json(&candidates)?;
            tracing::info!("Loaded {} candidates from {:?}", records.len(), candidates);
            let optimizer = build_optimizer(config, load_overrides(overrides.as_deref())?);
            let report = optimizer.run(records, &cancel, &mut sink).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calculix_runner=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    if let Err(e) = run_cli(cli).await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}
