//! The `simulado` command-line interface.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "simulado", version, about = "ENEM practice-exam engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate an exam, simulate a student taking it, and score it
    Run {
        /// Question bank .toml file or directory (defaults to bank_path from config)
        #[arg(long)]
        bank: Option<PathBuf>,

        /// ENEM areas, comma-separated (e.g. "linguagens,natureza")
        #[arg(long, conflicts_with = "disciplines")]
        areas: Option<String>,

        /// Disciplines, comma-separated (e.g. "matematica,fisica")
        #[arg(long)]
        disciplines: Option<String>,

        /// Restrict to one topic; requires exactly one discipline
        #[arg(long, requires = "disciplines")]
        topic: Option<String>,

        /// Number of questions (defaults to default_total_questions from config)
        #[arg(long)]
        total: Option<u32>,

        /// Share of questions the simulated student answers correctly
        #[arg(long, default_value = "0.6")]
        accuracy: f64,

        /// Share of questions the simulated student leaves blank
        #[arg(long, default_value = "0.0")]
        skip_rate: f64,

        /// RNG seed for a reproducible student
        #[arg(long)]
        seed: Option<u64>,

        /// Write the exam report JSON here
        #[arg(long)]
        output: Option<PathBuf>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Re-score a saved exam report
    Score {
        /// Report JSON written by `simulado run --output`
        #[arg(long)]
        report: PathBuf,

        /// Output format: text, json
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show active questions per discipline and their topics
    Stats {
        /// Question bank .toml file or directory (defaults to bank_path from config)
        #[arg(long)]
        bank: Option<PathBuf>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate question bank TOML files
    Validate {
        /// Path to bank file or directory
        #[arg(long)]
        bank: PathBuf,
    },

    /// Create starter config and example question bank
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("simulado=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            bank,
            areas,
            disciplines,
            topic,
            total,
            accuracy,
            skip_rate,
            seed,
            output,
            config,
        } => {
            let args = commands::run::RunArgs {
                bank,
                areas,
                disciplines,
                topic,
                total,
                accuracy,
                skip_rate,
                seed,
                output,
                config,
            };
            commands::run::execute(args).await
        }
        Commands::Score { report, format } => commands::score::execute(report, format),
        Commands::Stats { bank, config } => commands::stats::execute(bank, config).await,
        Commands::Validate { bank } => commands::validate::execute(bank),
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
