use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use chrono::NaiveDate;
use clap::{ArgGroup, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

mod attribution;
mod causal;
mod cohort;
mod config;
mod db;
mod error;
mod export;
mod features;
mod finance;
mod forest;
mod ingest;
mod models;
mod pipeline;
mod report;
mod shap;
mod significance;
mod synthetic;

#[cfg(test)]
mod fixtures;

use crate::config::PipelineConfig;
use crate::features::{ObservationWindow, ReferenceData};
use crate::models::Outcome;
use crate::synthetic::SyntheticOptions;

#[derive(Parser)]
#[command(name = "kpi-churn-impact")]
#[command(
    about = "Measures how teacher KPIs and bonus policy relate to student churn",
    long_about = None
)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a reproducible synthetic dataset
    Seed {
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 30)]
        teachers: usize,
    },
    /// Import teacher events from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the full analysis and write the output tables
    #[command(group(
        ArgGroup::new("source")
            .args(["events", "from_db"])
            .required(true)
            .multiple(false)
    ))]
    Run {
        #[arg(long)]
        since: NaiveDate,
        #[arg(long)]
        until: NaiveDate,
        /// Events CSV
        #[arg(long)]
        events: Option<PathBuf>,
        /// Read events and reference tables from Postgres
        #[arg(long)]
        from_db: bool,
        #[arg(long)]
        compensation: Option<PathBuf>,
        #[arg(long)]
        prices: Option<PathBuf>,
        #[arg(long)]
        salaries: Option<PathBuf>,
        /// TOML file overriding the default configuration
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = "out")]
        out: PathBuf,
        /// Also write a markdown summary to this path
        #[arg(long)]
        summary: Option<PathBuf>,
        /// Overrides the configured random seed
        #[arg(long)]
        seed: Option<u64>,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;
    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Reference tables given on the command line replace the stored ones.
fn overlay_reference(
    mut reference: ReferenceData,
    compensation: Option<&Path>,
    prices: Option<&Path>,
    salaries: Option<&Path>,
) -> anyhow::Result<ReferenceData> {
    if let Some(path) = compensation {
        reference.compensation = ingest::load_compensation(path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .records;
    }
    if let Some(path) = prices {
        reference.prices = ingest::load_prices(path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .records;
    }
    if let Some(path) = salaries {
        reference.salaries = ingest::load_salaries(path)
            .with_context(|| format!("failed to read {}", path.display()))?
            .records;
    }
    Ok(reference)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { seed, teachers } => {
            let pool = connect().await?;
            let options = SyntheticOptions {
                seed,
                teachers,
                ..SyntheticOptions::default()
            };
            let inserted = db::seed(&pool, &options).await?;
            println!("Seed data inserted ({inserted} new events).");
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            let (inserted, rejected) = db::import_csv(&pool, &csv).await?;
            println!(
                "Inserted {inserted} events from {} ({rejected} rows rejected).",
                csv.display()
            );
        }
        Commands::Run {
            since,
            until,
            events,
            from_db,
            compensation,
            prices,
            salaries,
            config,
            out,
            summary,
            seed,
        } => {
            if since > until {
                bail!("--since {since} is after --until {until}");
            }
            let mut config = match &config {
                Some(path) => PipelineConfig::load(path)
                    .with_context(|| format!("failed to load config {}", path.display()))?,
                None => PipelineConfig::default(),
            };
            if let Some(seed) = seed {
                config.seed = seed;
            }
            config.validate()?;
            let window = ObservationWindow { since, until };

            let (raw_events, stored) = if from_db {
                let pool = connect().await?;
                let raw_events = db::fetch_events(&pool, &window).await?;
                (raw_events, db::fetch_reference(&pool).await?)
            } else {
                let path = events.context("--events is required without --from-db")?;
                let loaded = ingest::load_events(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                (loaded.records, ReferenceData::default())
            };
            let reference = overlay_reference(
                stored,
                compensation.as_deref(),
                prices.as_deref(),
                salaries.as_deref(),
            )?;

            let output = pipeline::run(&raw_events, &reference, window, &config)?;
            let written = export::write_outputs(&out, &output, &config, summary.as_deref())
                .with_context(|| format!("failed to write outputs to {}", out.display()))?;
            info!(files = written.len(), "run complete");

            println!(
                "Analyzed {} teacher-months; wrote {} files to {}.",
                output.table.len(),
                written.len(),
                out.display()
            );
            for report in &output.causal {
                match &report.result {
                    Outcome::Computed(estimate) => {
                        println!("- {}: {}", report.name, report::conclusion(estimate))
                    }
                    Outcome::NotComputable(reason) => {
                        println!("- {}: failed ({reason})", report.name)
                    }
                }
            }
        }
    }

    Ok(())
}
