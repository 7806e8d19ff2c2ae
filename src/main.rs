mod api_client;
mod auth;
mod commands;
mod config;
mod error;
mod layout;
mod mapper;
mod normalize;
mod report;
mod runner;
mod store;

use api_client::ApiClient;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use config::Config;
use error::Error;
use layout::ReportKind;
use log::error;
use std::path::PathBuf;

#[derive(Parser)]
#[command(about = "Loads DoubleClick Bid Manager reports into PostgreSQL")]
struct Args {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduled query of a report type and load its result
    Run {
        #[arg(value_enum)]
        report: ReportKind,

        /// Keep rows in memory instead of writing to the database
        #[arg(long)]
        dry_run: bool,
    },

    /// List the queries of the account
    List,

    /// Save the latest report of a query to the reports directory
    Download { query_id: i64 },

    /// Run a query for a date range
    RunQuery {
        query_id: i64,

        /// One of the DBM date ranges, e.g. PREVIOUS_DAY or CUSTOM_DATES
        date_range: String,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        start: Option<NaiveDate>,

        #[arg(long, help = "Date should be in the form YYYY-MM-DD", value_parser = validate_date)]
        end: Option<NaiveDate>,
    },

    /// Create a query from a JSON definition
    CreateQuery { file: PathBuf },

    /// Delete queries
    RemoveQuery {
        #[arg(required = true)]
        query_ids: Vec<i64>,
    },

    /// Load a downloaded report into the database
    SaveReport {
        query_id: i64,

        #[arg(long, value_enum)]
        report: ReportKind,

        #[arg(long)]
        dry_run: bool,
    },
}

fn validate_date(s: &str) -> Result<NaiveDate, String> {
    let error_message = "Invalid date, expected YYYY-MM-DD";

    let parts = s
        .split("-")
        .map(|part| part.parse::<u16>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| error_message)?;

    match parts.as_slice() {
        &[year, month, day] if month <= 12 && day <= 31 => {
            Ok(
                NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
                    .ok_or(error_message)?,
            )
        }
        _ => Err(error_message.to_string()),
    }
}

async fn dispatch(config: &Config, command: &Command) -> Result<(), Error> {
    match command {
        Command::Run { report, dry_run } => commands::run_report(config, *report, *dry_run).await,
        Command::List => commands::list(&ApiClient::from_config(config)?).await,
        Command::Download { query_id } => {
            commands::download(&ApiClient::from_config(config)?, config, *query_id).await
        }
        Command::RunQuery {
            query_id,
            date_range,
            start,
            end,
        } => {
            let api = ApiClient::from_config(config)?;
            commands::run_query(&api, config, *query_id, date_range, *start, *end).await
        }
        Command::CreateQuery { file } => {
            commands::create_query(&ApiClient::from_config(config)?, file).await
        }
        Command::RemoveQuery { query_ids } => {
            commands::remove_queries(&ApiClient::from_config(config)?, query_ids).await
        }
        Command::SaveReport {
            query_id,
            report,
            dry_run,
        } => commands::save_report(config, *query_id, *report, *dry_run).await,
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    env_logger::init();

    if let Err(err) = dispatch(&args.config, &args.command).await {
        error!("{}", err);
        std::process::exit(1);
    }

    Ok(())
}
