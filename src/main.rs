use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

mod correlate;
mod db;
mod export;
mod geo;
mod models;
mod report;

#[derive(Parser)]
#[command(name = "canvas-activity-export")]
#[command(about = "Export one user's Canvas activity trail with submission forensics", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export activity and submission sheets plus a summary report
    Export {
        /// Canvas login (pseudonym unique_id) to filter
        #[arg(long)]
        username: String,
        /// Start of the window, UTC, inclusive
        #[arg(long, value_parser = parse_timestamp)]
        start: DateTime<Utc>,
        /// End of the window, UTC, exclusive
        #[arg(long, value_parser = parse_timestamp)]
        end: DateTime<Utc>,
        /// Output directory (defaults to the username)
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Half-width of the submission matching window, in minutes
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(i64).range(1..))]
        window_minutes: i64,
    },
    /// Resolve a single IP address through the provider chain
    Lookup { ip: String },
}

/// Accepts `YYYY-MM-DD HH:MM:SS`, ISO `YYYY-MM-DDTHH:MM:SS`, or a bare date.
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap().and_utc());
    }
    Err(format!(
        "invalid timestamp '{value}'; use 'YYYY-MM-DD HH:MM:SS' or 'YYYY-MM-DDTHH:MM:SS'"
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Export {
            username,
            start,
            end,
            output_dir,
            window_minutes,
        } => {
            anyhow::ensure!(end > start, "end must be after start");

            let database_url = std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set to the Canvas Postgres instance")?;
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&database_url)
                .await
                .context("failed to connect to Postgres")?;

            let activity = db::fetch_activity(&pool, &username, start, end).await?;
            let submissions = db::fetch_submissions(&pool, &username, start, end).await?;
            println!(
                "Fetched {} activity rows and {} submissions for {username}.",
                activity.len(),
                submissions.len()
            );

            let window = chrono::Duration::minutes(window_minutes);
            let matches = correlate::correlate(&submissions, &activity, window);

            let mut ips: BTreeSet<String> = activity
                .iter()
                .filter_map(|record| record.remote_ip.clone())
                .collect();
            ips.extend(
                matches
                    .iter()
                    .filter_map(|m| m.matched_activity.as_ref())
                    .filter_map(|record| record.remote_ip.clone()),
            );
            println!("Looking up locations for {} unique IPs...", ips.len());

            let mut resolver = geo::GeoResolver::new()?;
            let mut geo = BTreeMap::new();
            for (index, ip) in ips.iter().enumerate() {
                geo.insert(ip.clone(), resolver.resolve(ip).await);
                if (index + 1) % 10 == 0 {
                    println!("  {}/{} IPs processed...", index + 1, ips.len());
                }
            }

            let out_dir = output_dir.unwrap_or_else(|| PathBuf::from(&username));
            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("failed to create {}", out_dir.display()))?;
            let stem = out_dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| username.clone());

            let activity_path = out_dir.join(format!("{stem}-activity.csv"));
            export::write_activity_csv(&activity_path, &activity, &geo)?;
            println!("Wrote {} rows to {}.", activity.len(), activity_path.display());

            let submissions_path = out_dir.join(format!("{stem}-submissions.csv"));
            export::write_submissions_csv(&submissions_path, &submissions, &matches, &geo)?;
            println!(
                "Wrote {} rows to {}.",
                submissions.len(),
                submissions_path.display()
            );

            let summary = report::build_summary(&username, start, end, &submissions, &matches, &geo);
            let summary_path = out_dir.join(format!("{stem}-summary.md"));
            std::fs::write(&summary_path, summary)?;
            println!("Wrote summary to {}.", summary_path.display());
        }
        Commands::Lookup { ip } => {
            let mut resolver = geo::GeoResolver::new()?;
            let results = resolver
                .resolve_all(&BTreeSet::from([ip.clone()]))
                .await;
            let result = &results[&ip];
            println!("{ip}: resolved by {}", result.resolved_by);
            println!("  country: {}", result.country);
            println!("  region: {}", result.region);
            println!("  city: {}", result.city);
            println!("  organization: {}", result.organization);
        }
    }

    Ok(())
}
