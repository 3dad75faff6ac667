use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use training::{ConfigOverride, Trainer, TrainingConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train an ALR transformer language model", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to a TOML or JSON training config")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a config value by dot-separated path, e.g. optimizer.learning_rate=3e-4"
    )]
    overrides: Vec<ConfigOverride>,

    #[arg(long, help = "Resume from the latest checkpoint if one exists")]
    resume: bool,

    #[arg(long, value_name = "DIR", conflicts_with = "resume", help = "Resume from a specific checkpoint directory")]
    resume_from: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        tracing::error!("training failed: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = TrainingConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?
        .with_overrides(&args.overrides)?;
    config.validate()?;

    let mut trainer = Trainer::new(config)?;

    if let Some(directory) = &args.resume_from {
        trainer.resume_from_path(directory)?;
    } else if args.resume && trainer.resume_from_latest()?.is_none() {
        tracing::info!("no checkpoint found; starting from scratch");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl-C handler")?;

    trainer.train_with_shutdown(|| shutdown.load(Ordering::Relaxed))?;
    tracing::info!("finished at step {}", trainer.optimizer_step());
    Ok(())
}
