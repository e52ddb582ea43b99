use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sae_common::{ActivationProducer, CachedActivations, RunnerConfig, SyntheticActivations};
use sae_train::{
    run, CancellationToken, CheckpointManager, JsonlSink, MetricsSink, ReconstructionEvaluator,
    TracingSink, TrainError, TrainHooks,
};

/// Exit status after a Ctrl-C / SIGTERM that was saved cleanly.
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "sae", about = "Resumable sparse-autoencoder training")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train an SAE group, optionally resuming the newest checkpoint of a run.
    Train(TrainArgs),
    /// List the checkpoint bundles of a run.
    Checkpoints(CheckpointsArgs),
    /// Write a default runner config.
    InitConfig(InitConfigArgs),
}

// ── Args ────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Continue the newest complete checkpoint of the run.
    #[arg(long)]
    resume: bool,
    /// Run id; generated when neither this nor the config sets one.
    #[arg(long)]
    run_id: Option<String>,
    /// Also append metrics as JSON lines to this file.
    #[arg(long)]
    metrics_jsonl: Option<PathBuf>,
    #[arg(long)]
    no_progress: bool,
}

#[derive(Parser, Debug)]
struct CheckpointsArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[arg(long)]
    run_id: Option<String>,
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => cmd_train(args),
        Command::Checkpoints(args) => cmd_checkpoints(args),
        Command::InitConfig(args) => cmd_init_config(args),
    }
}

// ── Command implementations ─────────────────────────────────────────────────

fn load_or_create_config(path: &Path) -> Result<RunnerConfig> {
    if path.exists() {
        return RunnerConfig::load(path);
    }
    let default = RunnerConfig::default();
    default.save(path)?;
    eprintln!("Created default config at {}", path.display());
    Ok(default)
}

fn producer_for(cfg: &RunnerConfig) -> Result<Box<dyn ActivationProducer>> {
    let producer: Box<dyn ActivationProducer> = match &cfg.cached_activations_path {
        Some(dir) => Box::new(
            CachedActivations::open(dir)
                .with_context(|| format!("open cached activations {}", dir.display()))?,
        ),
        None => {
            tracing::warn!("no cached_activations_path configured, using the synthetic source");
            Box::new(SyntheticActivations::new(
                cfg.seed,
                cfg.layers().len(),
                cfg.d_in,
            ))
        }
    };
    Ok(producer)
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let mut cfg = load_or_create_config(&args.config)?;
    if args.resume {
        cfg.resume = true;
    }
    if let Some(run_id) = args.run_id {
        cfg.run_id = Some(run_id);
    }
    let run_id = cfg.resolve_run_id().to_string();
    eprintln!("Run id: {run_id}");

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .context("install termination handler")?;

    let mut sinks: Vec<Box<dyn MetricsSink>> = vec![Box::new(TracingSink)];
    if let Some(path) = &args.metrics_jsonl {
        let sink = JsonlSink::create(path)
            .with_context(|| format!("open metrics file {}", path.display()))?;
        sinks.push(Box::new(sink));
    }
    let hooks = TrainHooks {
        evaluator: Box::new(ReconstructionEvaluator::default()),
        sink: Box::new(sinks),
        cancel,
        show_progress: !args.no_progress,
    };

    let producer = producer_for(&cfg)?;
    match run(cfg, producer, hooks) {
        Ok(out) => {
            eprintln!(
                "Finished {} steps ({} tokens)",
                out.n_training_steps, out.n_training_tokens
            );
            for files in &out.checkpoint_paths {
                eprintln!("  {}", files.base_path().display());
            }
            Ok(())
        }
        Err(TrainError::Interrupted { step }) => {
            eprintln!("Interrupted at step {step}; resume with --resume --run-id {run_id}");
            std::process::exit(EXIT_INTERRUPTED);
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_checkpoints(args: CheckpointsArgs) -> Result<()> {
    let mut cfg = RunnerConfig::load(&args.config)?;
    if let Some(run_id) = args.run_id {
        cfg.run_id = Some(run_id);
    }
    let manager = CheckpointManager::new(&cfg)?;
    let entries = manager.checkpoints()?;
    if entries.is_empty() {
        println!("no checkpoints in {}", manager.run_dir().display());
        return Ok(());
    }
    for entry in entries {
        let state = if entry.complete { "complete" } else { "incomplete" };
        println!("{:<16} {:<10} {} files", entry.label.to_string(), state, entry.paths.len());
    }
    Ok(())
}

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() {
        anyhow::bail!("{} already exists", args.output.display());
    }
    RunnerConfig::default().save(&args.output)?;
    println!("Wrote default config to {}", args.output.display());
    Ok(())
}
