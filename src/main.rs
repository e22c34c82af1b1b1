use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use evorates::manager::Manager;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct CLI {
    /// Directory holding patient datasets, config.toml, and caches.
    #[arg(long)]
    data_dir: PathBuf,

    /// Directory figures are written to (default: <data-dir>/figures).
    #[arg(long)]
    fig_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Estimate per-site substitution rates and plot them genome-wide.
    Rates {
        /// Patients to consider (default: all discovered patients).
        #[arg(long, num_args = 1..)]
        patients: Vec<String>,

        /// Recalculate even if a cached result exists.
        #[arg(long)]
        redo: bool,
    },

    /// Aggregate synonymous/nonsynonymous divergence, diversity, and
    /// site-frequency spectra, and plot them.
    Divdiv {
        /// Recalculate even if a cached result exists.
        #[arg(long)]
        redo: bool,
    },

    /// Draw a phylogenetic tree from a JSON file.
    Tree {
        /// Tree in nested JSON format.
        #[arg(long)]
        json: PathBuf,
    },
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = CLI::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.data_dir, args.fig_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Rates { patients, redo } => mgr.run_rates(&patients, redo)?,
        Command::Divdiv { redo } => mgr.run_divdiv(redo)?,
        Command::Tree { json } => mgr.run_tree(&json)?,
    }

    Ok(())
}
