use matchmaker::db::{run_migrations, DatabaseConfig};
use matchmaker::{get_db_pool, utils};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    utils::init_logging();

    let db_config = DatabaseConfig::from_env()?;
    let pool = get_db_pool(&db_config).await?;

    println!("Running matchmaker migrations...");
    run_migrations(&pool).await?;
    println!("Migrations completed successfully!");

    Ok(())
}
