//! Command line entry point for the forecast warehouse pipeline.

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use forecast_warehouse::config::DEFAULT_CONFIG_FILE;
use forecast_warehouse::{Config, Endpoint, Pipeline, RunReport, TimeWindow};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "forecast_warehouse",
    about = "Weather forecast ingestion into a local analytical warehouse"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, env = "FORECAST_WAREHOUSE_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, validate, load and transform in one go
    Run {
        /// First day of the forecast window (default: today, UTC); metrics cover the whole window
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Fetch every configured location into the raw store
    Fetch {
        /// First day of the window (default: today, UTC)
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last day of the window (default: `start` plus `fetch_window_days - 1`)
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Request the archive API instead of the forecast API
        #[arg(long)]
        historical: bool,
    },
    /// Validate raw fetches not yet in the batch ledger
    Validate,
    /// Load validated batches not yet in the warehouse
    Load,
    /// Rebuild derived tables up to a date
    Transform {
        /// Last date to aggregate (default: today, UTC)
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Show row counts and ledger state
    Status,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let filters = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    pretty_env_logger::formatted_builder()
        .parse_filters(&filters)
        .init();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;
    let pipeline = Pipeline::new(config).await?;
    let today = Utc::now().date_naive();

    let report = match cli.command {
        Commands::Run { as_of } => pipeline.run(as_of.unwrap_or(today)).await,
        Commands::Fetch {
            start,
            end,
            historical,
        } => {
            let start = start.unwrap_or(today);
            let default_window =
                TimeWindow::starting_at(start, pipeline.config().fetch_window_days);
            let window = match end {
                Some(end) => TimeWindow::new(start, end)
                    .ok_or_else(|| format!("--end {end} lies before --start {start}"))?,
                None => default_window,
            };
            let endpoint = if historical {
                Endpoint::Archive
            } else {
                Endpoint::Forecast
            };
            pipeline.fetch(window, endpoint).await
        }
        Commands::Validate => pipeline.validate().await,
        Commands::Load => pipeline.load().await,
        Commands::Transform { as_of } => pipeline.transform(as_of.unwrap_or(today)).await,
        Commands::Status => {
            println!("{}", pipeline.status().await?);
            return Ok(ExitCode::SUCCESS);
        }
    };

    Ok(finish(&report))
}

fn finish(report: &RunReport) -> ExitCode {
    print!("{report}");
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
