use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use tracing::info;
use training::{Trainer, TrainingConfig, TrainingError};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Handwriting line-recognizer training CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to training config file")]
    config: PathBuf,

    #[arg(long, help = "Resume from the latest checkpoint; missing checkpoint is an error")]
    resume: bool,

    #[arg(
        long,
        conflicts_with = "resume",
        help = "Resume from the latest checkpoint if one exists, otherwise start fresh"
    )]
    soft_resume: bool,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let config = TrainingConfig::load(&args.config)?;
    config.ensure_matches_filename(&args.config)?;

    let mut trainer = Trainer::new(config)?;

    if args.resume {
        let descriptor = trainer.resume_from_latest()?;
        info!(
            step = descriptor.manifest.progress.global_step,
            "resumed from checkpoint {}",
            descriptor.directory.display()
        );
    } else if args.soft_resume {
        if let Some(descriptor) = trainer.soft_resume()? {
            info!(
                step = descriptor.manifest.progress.global_step,
                "resumed from checkpoint {}",
                descriptor.directory.display()
            );
        }
    } else {
        trainer.ensure_fresh_run()?;
    }

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|err| TrainingError::runtime(format!("failed to install signal handler: {err}")))?;

    trainer.train_with_shutdown(|| shutdown_flag.load(Ordering::Relaxed))?;

    Ok(())
}
