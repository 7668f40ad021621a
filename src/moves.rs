//! Subtree relocation: read-only impact previews, short-lived preview tokens,
//! and the transactional executor.
//!
//! Preview and commit are two separate round-trips; no transaction is held
//! open across the human confirmation step. The preview is advisory only. The
//! executor re-runs every structural check inside its own transaction because
//! the tree may have changed between the two calls.

use std::collections::HashMap;
use std::sync::Mutex;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;
use ts_rs::TS;

use crate::db::run_in_tx;
use crate::id::new_uuid_v7;
use crate::security::{Ctx, Operation};
use crate::time::now_ms;
use crate::tree::{
    ancestor_names, descendant_ids, load_location, rebuild_subtree_paths, would_create_cycle,
    PATH_SEPARATOR,
};
use crate::{AppError, AppResult};

/// Previews older than this cannot be committed.
pub const PREVIEW_TTL_MS: i64 = 5 * 60 * 1000;
/// Cap on sampled before/after paths, to keep preview payloads small.
pub const SAMPLE_LIMIT: usize = 20;

const IN_CHUNK: usize = 400;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PathChange {
    pub item_id: String,
    pub item_name: String,
    pub before_path: String,
    pub after_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "bindings/")]
pub struct MovePreview {
    /// Single-use token accepted by `move_commit`.
    pub token: String,
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub new_parent_id: Option<String>,
    #[ts(type = "number")]
    pub affected_locations: i64,
    #[ts(type = "number")]
    pub affected_items: i64,
    pub sample: Vec<PathChange>,
    #[ts(type = "number")]
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export, export_to = "bindings/")]
pub struct MoveReceipt {
    pub location_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub new_parent_id: Option<String>,
    #[ts(type = "number")]
    pub affected_locations: i64,
    #[ts(type = "number")]
    pub affected_items: i64,
}

#[derive(Debug, Clone)]
struct PreviewEntry {
    household_id: String,
    location_id: String,
    new_parent_id: Option<String>,
    expires_at: i64,
}

/// Keyed, short-lived store for issued previews. Not tied to any connection;
/// a token is consumed by the first commit attempt, and a newer preview for
/// the same location supersedes the old one.
pub struct PreviewStore {
    ttl_ms: i64,
    entries: Mutex<HashMap<String, PreviewEntry>>,
}

impl Default for PreviewStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PreviewStore {
    pub fn new() -> Self {
        Self::with_ttl(PREVIEW_TTL_MS)
    }

    pub fn with_ttl(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn issue(&self, household_id: &str, location_id: &str, new_parent_id: Option<&str>) -> (String, i64) {
        let token = new_uuid_v7();
        let expires_at = now_ms() + self.ttl_ms;
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| {
            entry.expires_at > now_ms()
                && !(entry.household_id == household_id && entry.location_id == location_id)
        });
        entries.insert(
            token.clone(),
            PreviewEntry {
                household_id: household_id.to_string(),
                location_id: location_id.to_string(),
                new_parent_id: new_parent_id.map(str::to_string),
                expires_at,
            },
        );
        (token, expires_at)
    }

    fn consume(&self, household_id: &str, token: &str) -> Option<(String, Option<String>)> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.remove(token)?;
        if entry.household_id != household_id || entry.expires_at <= now_ms() {
            return None;
        }
        Some((entry.location_id, entry.new_parent_id))
    }
}

async fn count_items_in(
    conn: &mut SqliteConnection,
    household_id: &str,
    location_ids: &[String],
) -> AppResult<i64> {
    let mut total = 0i64;
    for chunk in location_ids.chunks(IN_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT COUNT(*) FROM item WHERE household_id = ? AND location_id IN ({placeholders})"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql).bind(household_id);
        for id in chunk {
            query = query.bind(id);
        }
        total += query.fetch_one(&mut *conn).await.map_err(AppError::from)?;
    }
    Ok(total)
}

async fn sample_items_in(
    conn: &mut SqliteConnection,
    household_id: &str,
    location_ids: &[String],
    limit: usize,
) -> AppResult<Vec<(String, String, String)>> {
    let mut sampled = Vec::new();
    for chunk in location_ids.chunks(IN_CHUNK) {
        if sampled.len() >= limit {
            break;
        }
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT i.id, i.name, l.path FROM item i \
             JOIN location l ON l.id = i.location_id \
             WHERE i.household_id = ? AND i.location_id IN ({placeholders}) \
             ORDER BY i.name, i.id LIMIT ?"
        );
        let mut query = sqlx::query(&sql).bind(household_id);
        for id in chunk {
            query = query.bind(id);
        }
        query = query.bind((limit - sampled.len()) as i64);
        let rows = query.fetch_all(&mut *conn).await.map_err(AppError::from)?;
        for row in rows {
            sampled.push((
                row.try_get("id").map_err(AppError::from)?,
                row.try_get("name").map_err(AppError::from)?,
                row.try_get("path").map_err(AppError::from)?,
            ));
        }
    }
    sampled.truncate(limit);
    Ok(sampled)
}

/// Validate the move, then build the hypothetical path prefix for the subtree
/// without touching any stored row.
pub async fn move_preview(
    pool: &SqlitePool,
    ctx: &Ctx,
    store: &PreviewStore,
    location_id: &str,
    new_parent_id: Option<&str>,
) -> AppResult<MovePreview> {
    ctx.require(Operation::Write)?;
    let mut conn = pool.acquire().await.map_err(AppError::from)?;

    let moving = load_location(&mut conn, &ctx.household_id, location_id)
        .await?
        .ok_or_else(|| AppError::not_found("Location not found"))?;

    if moving.parent_id.as_deref() == new_parent_id {
        return Err(AppError::invalid("Location is already under that parent")
            .with_context("location_id", location_id.to_string()));
    }

    let new_root_path = match new_parent_id {
        Some(parent_id) => {
            if would_create_cycle(&mut conn, &ctx.household_id, location_id, parent_id).await? {
                return Err(AppError::invalid("Move would create a cycle")
                    .with_context("location_id", location_id.to_string())
                    .with_context("new_parent_id", parent_id.to_string()));
            }
            let parent_names = ancestor_names(&mut conn, &ctx.household_id, parent_id).await?;
            format!(
                "{}{}{}",
                parent_names.join(PATH_SEPARATOR),
                PATH_SEPARATOR,
                moving.name
            )
        }
        None => moving.name.clone(),
    };

    let closure = descendant_ids(&mut conn, &ctx.household_id, location_id).await?;
    let affected_items = count_items_in(&mut conn, &ctx.household_id, &closure).await?;

    // before = cached path; after = swap the prefix up to the moving node for
    // the hypothetical one, keeping the suffix below it unchanged.
    let old_root_path = moving.path.clone();
    let sampled = sample_items_in(&mut conn, &ctx.household_id, &closure, SAMPLE_LIMIT).await?;
    let sample = sampled
        .into_iter()
        .map(|(item_id, item_name, location_path)| {
            let suffix = location_path
                .strip_prefix(&old_root_path)
                .unwrap_or_default();
            PathChange {
                before_path: format!("{location_path}{PATH_SEPARATOR}{item_name}"),
                after_path: format!("{new_root_path}{suffix}{PATH_SEPARATOR}{item_name}"),
                item_id,
                item_name,
            }
        })
        .collect();

    let (token, expires_at) = store.issue(&ctx.household_id, location_id, new_parent_id);
    info!(
        target = "holdall",
        event = "move_preview",
        location_id = %location_id,
        affected_locations = closure.len(),
        affected_items = affected_items
    );

    Ok(MovePreview {
        token,
        location_id: location_id.to_string(),
        new_parent_id: new_parent_id.map(str::to_string),
        affected_locations: closure.len() as i64,
        affected_items,
        sample,
        expires_at,
    })
}

/// Commit a previously previewed move.
///
/// The token is consumed whether or not the commit succeeds; a failed commit
/// means the tree moved underneath the preview, so the preview is stale
/// either way. All checks re-run inside the transaction: the preview result
/// is never trusted as a gate.
pub async fn move_commit(
    pool: &SqlitePool,
    ctx: &Ctx,
    store: &PreviewStore,
    token: &str,
) -> AppResult<MoveReceipt> {
    ctx.require(Operation::Write)?;

    let (location_id, new_parent_id) = store
        .consume(&ctx.household_id, token)
        .ok_or_else(|| AppError::conflict("Move preview expired or already used"))?;

    let household_id = ctx.household_id.clone();
    let receipt = run_in_tx::<_, AppError, _>(pool, move |tx| {
        async move {
            let moving = load_location(&mut *tx, &household_id, &location_id)
                .await?
                .ok_or_else(|| AppError::not_found("Location not found"))?;

            if moving.parent_id.as_deref() == new_parent_id.as_deref() {
                return Err(AppError::conflict(
                    "Location was already moved; request a new preview",
                ));
            }

            if let Some(parent_id) = new_parent_id.as_deref() {
                let parent = load_location(&mut *tx, &household_id, parent_id).await?;
                if parent.is_none() {
                    return Err(AppError::conflict(
                        "Target parent no longer exists; request a new preview",
                    ));
                }
                if would_create_cycle(&mut *tx, &household_id, &location_id, parent_id).await? {
                    return Err(AppError::conflict(
                        "Move would now create a cycle; request a new preview",
                    ));
                }
            }

            sqlx::query(
                "UPDATE location SET parent_id = ?, updated_at = ? WHERE id = ? AND household_id = ?",
            )
            .bind(&new_parent_id)
            .bind(now_ms())
            .bind(&location_id)
            .bind(&household_id)
            .execute(&mut **tx)
            .await
            .map_err(AppError::from)?;

            let affected_locations =
                rebuild_subtree_paths(&mut *tx, &household_id, &location_id).await? as i64;
            let closure = descendant_ids(&mut *tx, &household_id, &location_id).await?;
            let affected_items = count_items_in(&mut *tx, &household_id, &closure).await?;

            Ok(MoveReceipt {
                location_id,
                new_parent_id,
                affected_locations,
                affected_items,
            })
        }
        .boxed()
    })
    .await?;

    info!(
        target = "holdall",
        event = "move_commit",
        location_id = %receipt.location_id,
        affected_locations = receipt.affected_locations,
        affected_items = receipt.affected_items
    );
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_tokens_are_single_use() {
        let store = PreviewStore::new();
        let (token, _) = store.issue("hh", "loc", None);
        assert!(store.consume("hh", &token).is_some());
        assert!(store.consume("hh", &token).is_none());
    }

    #[test]
    fn preview_tokens_are_household_bound() {
        let store = PreviewStore::new();
        let (token, _) = store.issue("hh-a", "loc", None);
        assert!(store.consume("hh-b", &token).is_none());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let store = PreviewStore::with_ttl(-1);
        let (token, _) = store.issue("hh", "loc", None);
        assert!(store.consume("hh", &token).is_none());
    }

    #[test]
    fn newer_preview_supersedes_older_for_same_location() {
        let store = PreviewStore::new();
        let (first, _) = store.issue("hh", "loc", None);
        let (second, _) = store.issue("hh", "loc", Some("parent"));
        assert!(store.consume("hh", &first).is_none());
        assert!(store.consume("hh", &second).is_some());
    }
}
