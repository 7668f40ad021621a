use anyhow::Result;
use holdall::{db, migrate};

#[tokio::test]
async fn migrations_apply_once_on_a_fresh_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nested").join("holdall.sqlite3");
    let pool = db::open_sqlite_pool(&path).await?;

    migrate::apply_migrations(&pool).await?;
    // Re-running is a no-op thanks to the ledger.
    migrate::apply_migrations(&pool).await?;

    let versions: Vec<String> =
        sqlx::query_scalar("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(&pool)
            .await?;
    assert_eq!(versions.len(), 2);
    assert!(versions[0].starts_with("202607141030"));

    let fks: i64 = sqlx::query_scalar("PRAGMA foreign_keys;")
        .fetch_one(&pool)
        .await?;
    assert_eq!(fks, 1);

    pool.close().await;
    Ok(())
}
