use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use holdall::{db, logging, migrate};

/// Apply pending schema migrations to a holdall database.
#[derive(Parser)]
#[command(name = "migrate")]
struct Cli {
    /// Path to the SQLite database file (created if missing).
    db_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let pool = db::open_sqlite_pool(&cli.db_path).await?;
    migrate::apply_migrations(&pool).await?;
    pool.close().await;

    println!("migrations applied: {}", cli.db_path.display());
    Ok(())
}
