//! Keyword and meaning-based item search, merged into one ranked result set.
//!
//! The two scoring collaborators are independent: in hybrid mode they run
//! concurrently under a bounded wait, and one failing collaborator degrades
//! the response to the surviving signal instead of failing the request.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use ts_rs::TS;

use crate::model::Item;
use crate::security::{Ctx, Operation};
use crate::{AppError, AppResult};

/// Bounded wait per collaborator before degrading.
pub const SCORER_TIMEOUT: Duration = Duration::from_secs(5);

const IN_CHUNK: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export, export_to = "bindings/")]
pub enum SearchMode {
    Lexical,
    Semantic,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub item_id: String,
    pub score: f64,
}

/// Term/keyword matching collaborator.
pub trait LexicalScorer: Send + Sync {
    fn score<'a>(
        &'a self,
        query: &'a str,
        household_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<ScoredId>>>;
}

/// Meaning-based collaborator. May fail independently of the lexical one.
pub trait SemanticScorer: Send + Sync {
    fn score<'a>(
        &'a self,
        query: &'a str,
        household_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<ScoredId>>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SearchHit {
    pub item: Item,
    pub lexical_score: f64,
    pub semantic_score: f64,
    /// Combined relevance: `lexical_score + semantic_score`. Monotonic in
    /// both signals and equal to the present one when the other is absent.
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    /// Full merged candidate count, independent of the pagination window.
    #[ts(type = "number")]
    pub total: i64,
    /// Collaborators that failed in hybrid mode ("lexical", "semantic").
    /// Non-empty means diminished-but-present results.
    pub degraded: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    item_id: String,
    lexical: f64,
    semantic: f64,
    combined: f64,
}

/// Union the two candidate lists by item id. Ordering is total: combined
/// score descending, then item id ascending, so pagination is stable across
/// repeated calls.
fn merge_candidates(lexical: Vec<ScoredId>, semantic: Vec<ScoredId>) -> Vec<Candidate> {
    let mut by_id: HashMap<String, (f64, f64)> = HashMap::new();
    for entry in lexical {
        by_id.entry(entry.item_id).or_insert((0.0, 0.0)).0 = entry.score;
    }
    for entry in semantic {
        by_id.entry(entry.item_id).or_insert((0.0, 0.0)).1 = entry.score;
    }

    let mut merged: Vec<Candidate> = by_id
        .into_iter()
        .map(|(item_id, (lexical, semantic))| Candidate {
            item_id,
            lexical,
            semantic,
            combined: lexical + semantic,
        })
        .collect();
    merged.sort_by(|a, b| {
        b.combined
            .total_cmp(&a.combined)
            .then_with(|| a.item_id.cmp(&b.item_id))
    });
    merged
}

async fn load_items_by_id(
    pool: &SqlitePool,
    household_id: &str,
    ids: &[String],
) -> AppResult<HashMap<String, Item>> {
    let mut items = HashMap::new();
    for chunk in ids.chunks(IN_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql =
            format!("SELECT * FROM item WHERE household_id = ? AND id IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(household_id);
        for id in chunk {
            query = query.bind(id);
        }
        let rows = query.fetch_all(pool).await.map_err(AppError::from)?;
        for row in &rows {
            let item = Item::from_row(row)?;
            items.insert(item.id.clone(), item);
        }
    }
    Ok(items)
}

async fn run_scorer<'a>(
    fut: BoxFuture<'a, anyhow::Result<Vec<ScoredId>>>,
    name: &str,
) -> Result<Vec<ScoredId>, AppError> {
    match tokio::time::timeout(SCORER_TIMEOUT, fut).await {
        Ok(Ok(scored)) => Ok(scored),
        Ok(Err(err)) => {
            warn!(target = "holdall", event = "scorer_failed", scorer = %name, error = %err);
            Err(AppError::from(err).with_context("scorer", name.to_string()))
        }
        Err(_) => {
            warn!(target = "holdall", event = "scorer_timeout", scorer = %name);
            Err(AppError::new("SCORER/TIMEOUT", "Scorer timed out")
                .with_context("scorer", name.to_string()))
        }
    }
}

/// Search the household's items.
///
/// `total` counts the full merged candidate set; `limit`/`offset` slice it.
/// Candidate ids the item table no longer contains (or that belong to another
/// household) are dropped before counting, so a misbehaving scorer can never
/// leak a row out of scope.
pub async fn search(
    pool: &SqlitePool,
    ctx: &Ctx,
    lexical: &dyn LexicalScorer,
    semantic: &dyn SemanticScorer,
    query: &str,
    mode: SearchMode,
    limit: i64,
    offset: i64,
) -> AppResult<SearchResponse> {
    ctx.require(Operation::Read)?;
    if limit < 0 || offset < 0 {
        return Err(AppError::invalid("limit and offset must be non-negative"));
    }

    let mut degraded = Vec::new();
    let (lex_scores, sem_scores) = match mode {
        SearchMode::Lexical => {
            let scores = run_scorer(lexical.score(query, &ctx.household_id), "lexical")
                .await
                .map_err(|err| {
                    AppError::new(AppError::SERVICE_UNAVAILABLE, "Search is unavailable")
                        .with_cause(err)
                })?;
            (scores, Vec::new())
        }
        SearchMode::Semantic => {
            let scores = run_scorer(semantic.score(query, &ctx.household_id), "semantic")
                .await
                .map_err(|err| {
                    AppError::new(AppError::SERVICE_UNAVAILABLE, "Search is unavailable")
                        .with_cause(err)
                })?;
            (Vec::new(), scores)
        }
        SearchMode::Hybrid => {
            let (lex, sem) = tokio::join!(
                run_scorer(lexical.score(query, &ctx.household_id), "lexical"),
                run_scorer(semantic.score(query, &ctx.household_id), "semantic"),
            );
            match (lex, sem) {
                (Ok(lex), Ok(sem)) => (lex, sem),
                (Ok(lex), Err(_)) => {
                    degraded.push("semantic".to_string());
                    (lex, Vec::new())
                }
                (Err(_), Ok(sem)) => {
                    degraded.push("lexical".to_string());
                    (Vec::new(), sem)
                }
                (Err(lex_err), Err(_)) => {
                    return Err(AppError::new(
                        AppError::SERVICE_UNAVAILABLE,
                        "Both search collaborators failed",
                    )
                    .with_cause(lex_err));
                }
            }
        }
    };

    let merged = merge_candidates(lex_scores, sem_scores);
    let ids: Vec<String> = merged.iter().map(|c| c.item_id.clone()).collect();
    let items = load_items_by_id(pool, &ctx.household_id, &ids).await?;

    let scoped: Vec<&Candidate> = merged
        .iter()
        .filter(|c| items.contains_key(&c.item_id))
        .collect();
    let total = scoped.len() as i64;

    let results = scoped
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .map(|c| SearchHit {
            item: items[&c.item_id].clone(),
            lexical_score: c.lexical,
            semantic_score: c.semantic,
            score: c.combined,
        })
        .collect();

    Ok(SearchResponse {
        results,
        total,
        degraded,
    })
}

/// Lexical collaborator backed by the item table itself: case-insensitive
/// token matching over name, keywords and description.
pub struct KeywordScorer {
    pool: SqlitePool,
}

impl KeywordScorer {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl LexicalScorer for KeywordScorer {
    fn score<'a>(
        &'a self,
        query: &'a str,
        household_id: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Vec<ScoredId>>> {
        async move {
            let tokens: Vec<String> = query
                .to_lowercase()
                .split_whitespace()
                .map(str::to_string)
                .collect();
            if tokens.is_empty() {
                return Ok(Vec::new());
            }

            let rows = sqlx::query(
                "SELECT id, name, description, keywords FROM item WHERE household_id = ?",
            )
            .bind(household_id)
            .fetch_all(&self.pool)
            .await?;

            let mut scored = Vec::new();
            for row in rows {
                let id: String = row.try_get("id")?;
                let name: String = row.try_get("name")?;
                let description: Option<String> = row.try_get("description")?;
                let keywords: String = row.try_get("keywords")?;
                let keywords: Vec<String> = serde_json::from_str(&keywords).unwrap_or_default();

                let name = name.to_lowercase();
                let description = description.unwrap_or_default().to_lowercase();
                let keywords: Vec<String> =
                    keywords.iter().map(|k| k.to_lowercase()).collect();

                let mut hit = 0.0f64;
                for token in &tokens {
                    if name.contains(token.as_str()) {
                        hit += 1.0;
                    } else if keywords.iter().any(|k| k.contains(token.as_str())) {
                        hit += 0.75;
                    } else if description.contains(token.as_str()) {
                        hit += 0.5;
                    }
                }
                if hit > 0.0 {
                    scored.push(ScoredId {
                        item_id: id,
                        score: hit / tokens.len() as f64,
                    });
                }
            }
            Ok(scored)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(id: &str, score: f64) -> ScoredId {
        ScoredId {
            item_id: id.to_string(),
            score,
        }
    }

    #[test]
    fn merge_unions_by_item_id() {
        let merged = merge_candidates(
            vec![scored("a", 0.4), scored("b", 0.9)],
            vec![scored("b", 0.3), scored("c", 0.5)],
        );
        let ids: Vec<&str> = merged.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        let b = merged.iter().find(|c| c.item_id == "b").unwrap();
        assert!((b.combined - 1.2).abs() < 1e-9);
    }

    #[test]
    fn single_signal_candidates_keep_their_score() {
        let merged = merge_candidates(vec![scored("a", 0.4)], vec![scored("c", 0.5)]);
        for c in &merged {
            if c.item_id == "a" {
                assert_eq!(c.combined, 0.4);
                assert_eq!(c.semantic, 0.0);
            } else {
                assert_eq!(c.combined, 0.5);
                assert_eq!(c.lexical, 0.0);
            }
        }
    }

    #[test]
    fn combined_score_is_monotonic() {
        let both = merge_candidates(vec![scored("a", 0.4)], vec![scored("a", 0.2)]);
        assert!(both[0].combined >= 0.4);
        assert!(both[0].combined >= 0.2);
    }

    #[test]
    fn ties_break_on_item_id_for_stable_pagination() {
        let merged = merge_candidates(
            vec![scored("z", 0.5), scored("a", 0.5), scored("m", 0.5)],
            Vec::new(),
        );
        let ids: Vec<&str> = merged.iter().map(|c| c.item_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "m", "z"]);
    }
}
