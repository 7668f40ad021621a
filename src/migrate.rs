use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashSet;
use tracing::{error, info};

use crate::time::now_ms;

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    // Truncate on a char boundary; a byte slice could split a multibyte char.
    match trimmed.char_indices().nth(160) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202607141030_initial.sql",
        include_str!("../migrations/202607141030_initial.sql"),
    ),
    (
        "202607141031_locations_items.sql",
        include_str!("../migrations/202607141031_locations_items.sql"),
    ),
];

/// Apply any pending migrations, one file per transaction.
pub async fn apply_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version    TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashSet<String> = HashSet::new();
    for r in rows {
        if let Ok(v) = r.try_get::<String, _>("version") {
            applied.insert(v);
        }
    }

    for (filename, raw_sql) in MIGRATIONS {
        if applied.contains(*filename) {
            info!(target = "holdall", event = "migration_skip_file", file = %filename);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in raw_sql.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            info!(target = "holdall", event = "migration_stmt", file = %filename, sql = %preview(s));
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target = "holdall", event = "migration_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(e.into());
            }
        }

        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(*filename)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        info!(target = "holdall", event = "migration_file_applied", file = %filename);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_flattens_whitespace() {
        assert_eq!(preview("SELECT\n\t1"), "SELECT  1");
    }

    #[test]
    fn preview_truncates_multibyte_sql_on_char_boundaries() {
        let sql = format!("-- {}", "é".repeat(200));
        let shown = preview(&sql);
        assert!(shown.ends_with('…'));
        assert_eq!(shown.chars().count(), 161);
    }

    #[test]
    fn preview_leaves_short_statements_alone() {
        assert_eq!(preview("DROP TABLE nothing"), "DROP TABLE nothing");
    }
}
