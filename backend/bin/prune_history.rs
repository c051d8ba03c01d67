use anyhow::Result;
use chrono::{Duration, Utc};
use clap::{Arg, Command};
use matchmaker::db::{get_db_pool, DatabaseConfig, MatchStore, PgMatchStore};
use matchmaker::utils::init_logging;
use std::env;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let matches = Command::new("prune-history")
        .about("Delete archived proposals and ended matches older than a cutoff")
        .arg(
            Arg::new("days")
                .long("days")
                .help("Keep history newer than this many days")
                .value_parser(clap::value_parser!(i64).range(1..))
                .default_value("90"),
        )
        .arg(
            Arg::new("confirm")
                .long("confirm")
                .help("Actually delete rows (default is a dry run)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let days = matches.get_one::<i64>("days").copied().unwrap_or(90);
    let confirm = matches.get_flag("confirm");

    // Use DATABASE_PUBLIC_URL if available (for prod access), otherwise DATABASE_URL
    let mut db_config = DatabaseConfig::from_env()?;
    if let Ok(public_url) = env::var("DATABASE_PUBLIC_URL") {
        info!("Using DATABASE_PUBLIC_URL for database access");
        db_config.database_url = public_url;
    }
    db_config.max_connections = 2;
    let pool = get_db_pool(&db_config).await?;
    let store = PgMatchStore::new(pool);

    let cutoff = Utc::now() - Duration::days(days);
    let report = store.prune_history(cutoff, !confirm).await?;

    if confirm {
        info!(
            "🧹 Deleted {} proposals and {} matches resolved before {}",
            report.proposals, report.matches, cutoff
        );
    } else {
        warn!(
            "Dry run: {} proposals and {} matches resolved before {} would be deleted. Re-run with --confirm.",
            report.proposals, report.matches, cutoff
        );
    }
    Ok(())
}
