//! ssl_sifar CLI
//!
//! `train` runs a semi-supervised training (or evaluation) run;
//! `split-lists` prepares the labeled and unlabeled lists of a dataset.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use ssl_sifar::backend::{backend_name, TrainingBackend};
use ssl_sifar::config::{RunConfig, SplitStrategy};
use ssl_sifar::dataset::{split_list_file, SplitConfig};
use ssl_sifar::utils::logging::{LogConfig, RunLogger};

/// Semi-supervised video classification with Burn
#[derive(Parser, Debug)]
#[command(name = "ssl_sifar")]
#[command(version)]
#[command(about = "Semi-supervised video classification with Burn", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train (or evaluate) a model
    Train(Box<RunConfig>),

    /// Split a labeled list into labeled and unlabeled lists
    SplitLists {
        /// Full training list
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory (defaults to the directory of the input list)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Fraction of videos moved to the unlabeled list
        #[arg(long, default_value_t = 0.95)]
        percentage: f64,

        #[arg(long, value_enum, default_value_t = SplitStrategy::Classwise)]
        strategy: SplitStrategy,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Field separator of the list
        #[arg(long, default_value = " ")]
        separator: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train(config) => {
            print_banner();
            println!("  Backend: {}", backend_name());
            let summary = ssl_sifar::training::run::<TrainingBackend>(*config).context("Run failed")?;
            if summary.epochs_trained > 0 {
                println!(
                    "{} {} epoch(s), max accuracy {:.2}%",
                    "Done:".green().bold(),
                    summary.epochs_trained,
                    summary.max_accuracy
                );
            }
        }

        Commands::SplitLists {
            input,
            output_dir,
            percentage,
            strategy,
            seed,
            separator,
        } => {
            let _logger = RunLogger::install(&LogConfig::default())?;
            let config = SplitConfig::new(percentage, strategy, seed)?;
            let output_dir = output_dir
                .or_else(|| input.parent().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("."));
            let split = split_list_file(&input, &output_dir, &separator, &config)
                .with_context(|| format!("Failed to split {:?}", input))?;

            println!("{}", "Lists written:".green().bold());
            println!("  Labeled:   {} videos", split.labeled.len());
            println!("  Unlabeled: {} videos", split.unlabeled.len());
            println!("  Directory: {}", output_dir.display());
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════╗
 ║   ssl_sifar: semi-supervised video classification    ║
 ║   Burn + Rust                                        ║
 ╚══════════════════════════════════════════════════════╝
  "#
        .green()
    );
}
