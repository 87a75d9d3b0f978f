#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Parser, Subcommand};
use covidcast::config::RunConfig;
use covidcast::evaluate::{evaluate_models, rank_results, results_dataframe};
use covidcast::store::EpisodeStore;
use polars::prelude::{CsvWriter, DataFrame, SerWriter};
use std::error::Error;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(
    name = "covidcast",
    version,
    about = "Derive COVID-19 hospitalization episodes and rank mortality models",
    long_about = "Segments Synthea-style encounter exports into hospitalization episodes \
                 and compares logistic models of in-hospital COVID-19 death under \
                 k-fold cross-validation."
)]
struct Cli {
    /// Optional TOML run configuration
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the enriched hospitalization episode table
    #[command(about = "Extract hospitalization episodes (outputs: episodes.csv)")]
    Episodes {
        /// Directory holding patients.csv and encounters.csv
        data_dir: PathBuf,

        /// Where to write the episode table
        #[arg(long, default_value = "episodes.csv")]
        out: PathBuf,
    },

    /// Cross-validate the configured models on the episode table
    #[command(about = "Evaluate mortality models (outputs: model_results.csv)")]
    Evaluate {
        /// Directory holding patients.csv and encounters.csv
        data_dir: PathBuf,

        /// Column to predict; overrides the config file
        #[arg(long)]
        target: Option<String>,

        /// Seed for the row shuffle; overrides the config file
        #[arg(long)]
        seed: Option<u64>,

        /// Where to write the ranked results
        #[arg(long, default_value = "model_results.csv")]
        out: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Episodes { data_dir, out } => episodes_command(&data_dir, &out, config),
        Commands::Evaluate {
            data_dir,
            target,
            seed,
            out,
        } => evaluate_command(&data_dir, &out, target, seed, config),
    });

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<RunConfig, Box<dyn Error>> {
    match path {
        Some(path) => {
            log::info!("Reading configuration from '{}'", path.display());
            Ok(RunConfig::load(path)?)
        }
        None => Ok(RunConfig::default()),
    }
}

fn episode_dataframe(data_dir: &Path, config: &RunConfig) -> Result<DataFrame, Box<dyn Error>> {
    let mut store = EpisodeStore::open(data_dir, config.segmentation.clone())?;
    let table = store.covid_hospitalizations()?;
    Ok(table.to_dataframe()?)
}

fn write_csv(df: &mut DataFrame, path: &Path) -> Result<(), Box<dyn Error>> {
    let mut file = File::create(path)?;
    CsvWriter::new(&mut file).finish(df)?;
    Ok(())
}

fn episodes_command(data_dir: &Path, out: &Path, config: RunConfig) -> Result<(), Box<dyn Error>> {
    let mut df = episode_dataframe(data_dir, &config)?;
    write_csv(&mut df, out)?;
    println!("Wrote {} episodes to '{}'", df.height(), out.display());
    Ok(())
}

fn evaluate_command(
    data_dir: &Path,
    out: &Path,
    target: Option<String>,
    seed: Option<u64>,
    mut config: RunConfig,
) -> Result<(), Box<dyn Error>> {
    if let Some(target) = target {
        config.target = target;
    }
    if seed.is_some() {
        config.evaluation.seed = seed;
    }
    config.evaluation.show_progress = true;

    let df = episode_dataframe(data_dir, &config)?;
    let mut results = evaluate_models(&df, &config.models, &config.target, &config.evaluation)?;
    rank_results(&mut results);

    let mut table = results_dataframe(&results)?;
    println!("{table}");
    write_csv(&mut table, out)?;
    println!("Wrote {} results to '{}'", results.len(), out.display());
    Ok(())
}
