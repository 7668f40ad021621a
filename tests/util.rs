use anyhow::Result;
use holdall::model::Role;
use holdall::{household, migrate, Ctx};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

pub async fn memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await?;
    migrate::apply_migrations(&pool).await?;
    Ok(pool)
}

/// Fresh pool plus a household owned by `owner`.
pub async fn household_fixture(owner: &str) -> Result<(SqlitePool, String, Ctx)> {
    let pool = memory_pool().await?;
    let created = household::create_household(&pool, "Willow Lane", owner).await?;
    let ctx = Ctx::resolve(&pool, owner, &created.id).await?;
    Ok((pool, created.id, ctx))
}

/// Insert a membership row directly; the identity context owns this table,
/// tests seed it the same way.
#[allow(dead_code)]
pub async fn add_member(
    pool: &SqlitePool,
    household_id: &str,
    user_id: &str,
    role: Role,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO member (household_id, user_id, role, created_at, updated_at) \
         VALUES (?, ?, ?, 0, 0)",
    )
    .bind(household_id)
    .bind(user_id)
    .bind(role.as_str())
    .execute(pool)
    .await?;
    Ok(())
}
