//! Location tree store and its invariant checks.
//!
//! The tree is an arena of rows keyed by id with explicit `parent_id` edges;
//! cycle checks are id-set walks, never pointer chasing. Every check-then-act
//! mutation runs inside one `run_in_tx` scope so concurrent writers cannot
//! invalidate a check after it passed. All lookups are household-scoped and a
//! miss is always `NOT_FOUND`, whether the row is absent or owned by another
//! household.

use futures::FutureExt;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;

use crate::db::run_in_tx;
use crate::id::new_uuid_v7;
use crate::model::{Item, Location};
use crate::security::{Ctx, Operation};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Separator used in materialized display paths.
pub const PATH_SEPARATOR: &str = " > ";

#[derive(Debug, Clone, Default)]
pub struct NewLocation {
    pub name: String,
    pub code: Option<String>,
    pub kind: Option<String>,
    pub description: Option<String>,
    pub image_ref: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LocationDetails {
    pub kind: Option<String>,
    pub description: Option<String>,
    pub image_ref: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewItem {
    pub name: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub image_ref: Option<String>,
    pub location_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct ItemUpdate {
    pub name: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub image_ref: Option<String>,
}

fn require_name(name: &str) -> AppResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid("Name must not be empty").with_context("field", "name"));
    }
    Ok(trimmed.to_string())
}

pub(crate) async fn load_location(
    conn: &mut SqliteConnection,
    household_id: &str,
    id: &str,
) -> AppResult<Option<Location>> {
    let row = sqlx::query("SELECT * FROM location WHERE id = ? AND household_id = ?")
        .bind(id)
        .bind(household_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from)?;
    row.as_ref().map(Location::from_row).transpose()
}

pub(crate) async fn load_item(
    conn: &mut SqliteConnection,
    household_id: &str,
    id: &str,
) -> AppResult<Option<Item>> {
    let row = sqlx::query("SELECT * FROM item WHERE id = ? AND household_id = ?")
        .bind(id)
        .bind(household_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(AppError::from)?;
    row.as_ref().map(Item::from_row).transpose()
}

/// Names from a root down to `id`, recomputed from parent edges.
///
/// A revisited id means the stored tree is corrupt; surfaced loudly rather
/// than looping.
pub(crate) async fn ancestor_names(
    conn: &mut SqliteConnection,
    household_id: &str,
    id: &str,
) -> AppResult<Vec<String>> {
    let mut names = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut cursor = Some(id.to_string());

    while let Some(current) = cursor {
        if !seen.insert(current.clone()) {
            return Err(AppError::invalid("Location tree contains a cycle")
                .with_context("location_id", id.to_string()));
        }
        let loc = load_location(conn, household_id, &current)
            .await?
            .ok_or_else(|| AppError::not_found("Location not found"))?;
        names.push(loc.name);
        cursor = loc.parent_id;
    }

    names.reverse();
    Ok(names)
}

/// True if re-attaching `moving_id` under `candidate_parent_id` would create a
/// cycle: the candidate is the node itself or one of its descendants, detected
/// by walking the candidate's ancestor chain.
pub(crate) async fn would_create_cycle(
    conn: &mut SqliteConnection,
    household_id: &str,
    moving_id: &str,
    candidate_parent_id: &str,
) -> AppResult<bool> {
    if moving_id == candidate_parent_id {
        return Ok(true);
    }
    let mut seen = std::collections::HashSet::new();
    let mut cursor = Some(candidate_parent_id.to_string());
    while let Some(current) = cursor {
        if current == moving_id {
            return Ok(true);
        }
        if !seen.insert(current.clone()) {
            // Corrupt ancestry is treated as a cycle; the move must not land.
            return Ok(true);
        }
        let loc = load_location(conn, household_id, &current)
            .await?
            .ok_or_else(|| AppError::not_found("Parent location not found"))?;
        cursor = loc.parent_id;
    }
    Ok(false)
}

/// Descendant closure of `root_id`, root included.
pub(crate) async fn descendant_ids(
    conn: &mut SqliteConnection,
    household_id: &str,
    root_id: &str,
) -> AppResult<Vec<String>> {
    let mut closure = vec![root_id.to_string()];
    let mut queue = vec![root_id.to_string()];
    while let Some(current) = queue.pop() {
        let children: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM location WHERE household_id = ? AND parent_id = ?",
        )
        .bind(household_id)
        .bind(&current)
        .fetch_all(&mut *conn)
        .await
        .map_err(AppError::from)?;
        for child in children {
            closure.push(child.clone());
            queue.push(child);
        }
    }
    Ok(closure)
}

/// Rewrite the cached `path` of `root_id` and every descendant from the
/// current parent edges. Returns the number of rows rewritten.
pub(crate) async fn rebuild_subtree_paths(
    conn: &mut SqliteConnection,
    household_id: &str,
    root_id: &str,
) -> AppResult<usize> {
    let root = load_location(conn, household_id, root_id)
        .await?
        .ok_or_else(|| AppError::not_found("Location not found"))?;

    let root_path = match &root.parent_id {
        Some(parent_id) => {
            let parent = load_location(conn, household_id, parent_id)
                .await?
                .ok_or_else(|| AppError::not_found("Parent location not found"))?;
            format!("{}{}{}", parent.path, PATH_SEPARATOR, root.name)
        }
        None => root.name.clone(),
    };

    let mut rewritten = 0usize;
    let mut queue = vec![(root.id.clone(), root_path)];
    while let Some((id, path)) = queue.pop() {
        sqlx::query("UPDATE location SET path = ? WHERE id = ? AND household_id = ?")
            .bind(&path)
            .bind(&id)
            .bind(household_id)
            .execute(&mut *conn)
            .await
            .map_err(AppError::from)?;
        rewritten += 1;

        let children = sqlx::query("SELECT id, name FROM location WHERE household_id = ? AND parent_id = ?")
            .bind(household_id)
            .bind(&id)
            .fetch_all(&mut *conn)
            .await
            .map_err(AppError::from)?;
        for child in children {
            let child_id: String = child.try_get("id").map_err(AppError::from)?;
            let child_name: String = child.try_get("name").map_err(AppError::from)?;
            queue.push((child_id, format!("{path}{PATH_SEPARATOR}{child_name}")));
        }
    }
    Ok(rewritten)
}

pub async fn location_create(pool: &SqlitePool, ctx: &Ctx, input: NewLocation) -> AppResult<Location> {
    ctx.require(Operation::Write)?;
    let name = require_name(&input.name)?;

    let household_id = ctx.household_id.clone();
    let location = run_in_tx::<_, AppError, _>(pool, move |tx| {
        async move {
            let parent_path = match &input.parent_id {
                Some(parent_id) => {
                    let parent = load_location(&mut *tx, &household_id, parent_id)
                        .await?
                        .ok_or_else(|| AppError::not_found("Parent location not found"))?;
                    Some(parent.path)
                }
                None => None,
            };

            let path = match parent_path {
                Some(parent_path) => format!("{parent_path}{PATH_SEPARATOR}{name}"),
                None => name.clone(),
            };

            let now = now_ms();
            let location = Location {
                id: new_uuid_v7(),
                household_id: household_id.clone(),
                name,
                code: input.code,
                kind: input.kind,
                description: input.description,
                image_ref: input.image_ref,
                parent_id: input.parent_id,
                path,
                created_at: now,
                updated_at: now,
            };

            sqlx::query(
                "INSERT INTO location \
                 (id, household_id, name, code, kind, description, image_ref, parent_id, path, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&location.id)
            .bind(&location.household_id)
            .bind(&location.name)
            .bind(&location.code)
            .bind(&location.kind)
            .bind(&location.description)
            .bind(&location.image_ref)
            .bind(&location.parent_id)
            .bind(&location.path)
            .bind(location.created_at)
            .bind(location.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(AppError::from)?;

            Ok(location)
        }
        .boxed()
    })
    .await?;

    info!(target = "holdall", event = "location_created", id = %location.id);
    Ok(location)
}

pub async fn location_get(pool: &SqlitePool, ctx: &Ctx, id: &str) -> AppResult<Location> {
    ctx.require(Operation::Read)?;
    let mut conn = pool.acquire().await.map_err(AppError::from)?;
    load_location(&mut conn, &ctx.household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Location not found"))
}

/// Children of `parent_id`, or the household's roots when `None`.
pub async fn location_list(
    pool: &SqlitePool,
    ctx: &Ctx,
    parent_id: Option<&str>,
) -> AppResult<Vec<Location>> {
    ctx.require(Operation::Read)?;
    let rows = match parent_id {
        Some(parent) => {
            sqlx::query(
                "SELECT * FROM location WHERE household_id = ? AND parent_id = ? ORDER BY name, id",
            )
            .bind(&ctx.household_id)
            .bind(parent)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query(
                "SELECT * FROM location WHERE household_id = ? AND parent_id IS NULL ORDER BY name, id",
            )
            .bind(&ctx.household_id)
            .fetch_all(pool)
            .await
        }
    }
    .map_err(AppError::from)?;
    rows.iter().map(Location::from_row).collect()
}

/// Names from a root down to the location, recomputed from the parent edges
/// rather than read from the cache.
pub async fn location_path(pool: &SqlitePool, ctx: &Ctx, id: &str) -> AppResult<Vec<String>> {
    ctx.require(Operation::Read)?;
    let mut conn = pool.acquire().await.map_err(AppError::from)?;
    ancestor_names(&mut conn, &ctx.household_id, id).await
}

/// Rename a location and rewrite the cached paths of its subtree.
pub async fn location_rename(
    pool: &SqlitePool,
    ctx: &Ctx,
    id: &str,
    name: &str,
) -> AppResult<Location> {
    ctx.require(Operation::Write)?;
    let name = require_name(name)?;

    let household_id = ctx.household_id.clone();
    let id_owned = id.to_string();
    run_in_tx::<_, AppError, _>(pool, move |tx| {
        async move {
            let existing = load_location(&mut *tx, &household_id, &id_owned)
                .await?
                .ok_or_else(|| AppError::not_found("Location not found"))?;

            sqlx::query("UPDATE location SET name = ?, updated_at = ? WHERE id = ?")
                .bind(&name)
                .bind(now_ms())
                .bind(&existing.id)
                .execute(&mut **tx)
                .await
                .map_err(AppError::from)?;

            rebuild_subtree_paths(&mut *tx, &household_id, &existing.id).await?;

            load_location(&mut *tx, &household_id, &existing.id)
                .await?
                .ok_or_else(|| AppError::not_found("Location not found"))
        }
        .boxed()
    })
    .await
}

/// Codes are labels, not keys; duplicates are allowed anywhere.
pub async fn location_recode(
    pool: &SqlitePool,
    ctx: &Ctx,
    id: &str,
    code: Option<&str>,
) -> AppResult<Location> {
    ctx.require(Operation::Write)?;
    let res = sqlx::query(
        "UPDATE location SET code = ?, updated_at = ? WHERE id = ? AND household_id = ?",
    )
    .bind(code)
    .bind(now_ms())
    .bind(id)
    .bind(&ctx.household_id)
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Location not found"));
    }
    location_get(pool, ctx, id).await
}

pub async fn location_update_details(
    pool: &SqlitePool,
    ctx: &Ctx,
    id: &str,
    details: LocationDetails,
) -> AppResult<Location> {
    ctx.require(Operation::Write)?;
    let res = sqlx::query(
        "UPDATE location SET kind = ?, description = ?, image_ref = ?, updated_at = ? \
         WHERE id = ? AND household_id = ?",
    )
    .bind(&details.kind)
    .bind(&details.description)
    .bind(&details.image_ref)
    .bind(now_ms())
    .bind(id)
    .bind(&ctx.household_id)
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Location not found"));
    }
    location_get(pool, ctx, id).await
}

/// Delete an empty location. Anything still inside it is a conflict: there is
/// no cascade, callers must relocate or delete dependents first.
pub async fn location_delete(pool: &SqlitePool, ctx: &Ctx, id: &str) -> AppResult<()> {
    ctx.require(Operation::Write)?;

    let household_id = ctx.household_id.clone();
    let id_owned = id.to_string();
    run_in_tx::<_, AppError, _>(pool, move |tx| {
        async move {
            let existing = load_location(&mut *tx, &household_id, &id_owned)
                .await?
                .ok_or_else(|| AppError::not_found("Location not found"))?;

            let child_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM location WHERE household_id = ? AND parent_id = ?",
            )
            .bind(&household_id)
            .bind(&existing.id)
            .fetch_one(&mut **tx)
            .await
            .map_err(AppError::from)?;

            let item_count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM item WHERE household_id = ? AND location_id = ?",
            )
            .bind(&household_id)
            .bind(&existing.id)
            .fetch_one(&mut **tx)
            .await
            .map_err(AppError::from)?;

            if child_count > 0 || item_count > 0 {
                return Err(AppError::conflict("Location has dependents")
                    .with_context("child_locations", child_count.to_string())
                    .with_context("items", item_count.to_string()));
            }

            sqlx::query("DELETE FROM location WHERE id = ?")
                .bind(&existing.id)
                .execute(&mut **tx)
                .await
                .map_err(AppError::from)?;
            Ok(())
        }
        .boxed()
    })
    .await?;

    info!(target = "holdall", event = "location_deleted", id = %id);
    Ok(())
}

pub async fn item_create(pool: &SqlitePool, ctx: &Ctx, input: NewItem) -> AppResult<Item> {
    ctx.require(Operation::Write)?;
    let name = require_name(&input.name)?;
    let keywords = serde_json::to_string(&input.keywords).map_err(AppError::from)?;

    let household_id = ctx.household_id.clone();
    run_in_tx::<_, AppError, _>(pool, move |tx| {
        async move {
            load_location(&mut *tx, &household_id, &input.location_id)
                .await?
                .ok_or_else(|| AppError::not_found("Location not found"))?;

            let now = now_ms();
            let item = Item {
                id: new_uuid_v7(),
                household_id: household_id.clone(),
                name,
                description: input.description,
                keywords: input.keywords,
                image_ref: input.image_ref,
                location_id: input.location_id,
                created_at: now,
                updated_at: now,
            };

            sqlx::query(
                "INSERT INTO item \
                 (id, household_id, name, description, keywords, image_ref, location_id, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&item.id)
            .bind(&item.household_id)
            .bind(&item.name)
            .bind(&item.description)
            .bind(&keywords)
            .bind(&item.image_ref)
            .bind(&item.location_id)
            .bind(item.created_at)
            .bind(item.updated_at)
            .execute(&mut **tx)
            .await
            .map_err(AppError::from)?;

            Ok(item)
        }
        .boxed()
    })
    .await
}

pub async fn item_get(pool: &SqlitePool, ctx: &Ctx, id: &str) -> AppResult<Item> {
    ctx.require(Operation::Read)?;
    let mut conn = pool.acquire().await.map_err(AppError::from)?;
    load_item(&mut conn, &ctx.household_id, id)
        .await?
        .ok_or_else(|| AppError::not_found("Item not found"))
}

/// Items in one location, or all of the household's items when `None`.
pub async fn item_list(
    pool: &SqlitePool,
    ctx: &Ctx,
    location_id: Option<&str>,
) -> AppResult<Vec<Item>> {
    ctx.require(Operation::Read)?;
    let rows = match location_id {
        Some(location) => {
            sqlx::query(
                "SELECT * FROM item WHERE household_id = ? AND location_id = ? ORDER BY name, id",
            )
            .bind(&ctx.household_id)
            .bind(location)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query("SELECT * FROM item WHERE household_id = ? ORDER BY name, id")
                .bind(&ctx.household_id)
                .fetch_all(pool)
                .await
        }
    }
    .map_err(AppError::from)?;
    rows.iter().map(Item::from_row).collect()
}

pub async fn item_update(
    pool: &SqlitePool,
    ctx: &Ctx,
    id: &str,
    update: ItemUpdate,
) -> AppResult<Item> {
    ctx.require(Operation::Write)?;
    let name = require_name(&update.name)?;
    let keywords = serde_json::to_string(&update.keywords).map_err(AppError::from)?;

    let res = sqlx::query(
        "UPDATE item SET name = ?, description = ?, keywords = ?, image_ref = ?, updated_at = ? \
         WHERE id = ? AND household_id = ?",
    )
    .bind(&name)
    .bind(&update.description)
    .bind(&keywords)
    .bind(&update.image_ref)
    .bind(now_ms())
    .bind(id)
    .bind(&ctx.household_id)
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Item not found"));
    }
    item_get(pool, ctx, id).await
}

/// Move an item to another location in the same household.
pub async fn item_move(
    pool: &SqlitePool,
    ctx: &Ctx,
    id: &str,
    new_location_id: &str,
) -> AppResult<Item> {
    ctx.require(Operation::Write)?;

    let household_id = ctx.household_id.clone();
    let id_owned = id.to_string();
    let target = new_location_id.to_string();
    run_in_tx::<_, AppError, _>(pool, move |tx| {
        async move {
            load_location(&mut *tx, &household_id, &target)
                .await?
                .ok_or_else(|| AppError::not_found("Location not found"))?;

            let res = sqlx::query(
                "UPDATE item SET location_id = ?, updated_at = ? WHERE id = ? AND household_id = ?",
            )
            .bind(&target)
            .bind(now_ms())
            .bind(&id_owned)
            .bind(&household_id)
            .execute(&mut **tx)
            .await
            .map_err(AppError::from)?;
            if res.rows_affected() == 0 {
                return Err(AppError::not_found("Item not found"));
            }

            load_item(&mut *tx, &household_id, &id_owned)
                .await?
                .ok_or_else(|| AppError::not_found("Item not found"))
        }
        .boxed()
    })
    .await
}

pub async fn item_delete(pool: &SqlitePool, ctx: &Ctx, id: &str) -> AppResult<()> {
    ctx.require(Operation::Write)?;
    let res = sqlx::query("DELETE FROM item WHERE id = ? AND household_id = ?")
        .bind(id)
        .bind(&ctx.household_id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    if res.rows_affected() == 0 {
        return Err(AppError::not_found("Item not found"));
    }
    Ok(())
}
