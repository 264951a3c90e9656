//! Context-scoped passage retrieval.
//!
//! Candidates come from the FTS index restricted to the caller's active
//! document set; a pluggable [`PassageScorer`] assigns relevance. The engine
//! owns the scoping contract — no passage from outside the active set is ever
//! returned, and the scope is enforced again after scoring so a scorer cannot
//! widen it — plus deduplication of overlapping passages and deterministic
//! top-k truncation (score desc, then document id, then locator), so repeated
//! queries against an unchanged corpus reproduce exactly.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::config::RetrievalConfig;
use crate::error::CoreError;
use crate::models::{Locator, RetrievalPassage};

/// A passage candidate as handed to the scorer.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub document_id: String,
    pub document_version: i64,
    pub locator: Locator,
    pub text: String,
}

/// Pluggable relevance backend. Returns one raw score per candidate, in
/// order; raw scores are min-max normalized to [0, 1] by the engine. May be
/// network-bound; the engine applies the configured timeout.
#[async_trait]
pub trait PassageScorer: Send + Sync {
    async fn score(&self, query: &str, candidates: &[Candidate]) -> Result<Vec<f64>>;
}

#[derive(Clone)]
pub struct RetrievalEngine {
    pool: SqlitePool,
    scorer: Arc<dyn PassageScorer>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(pool: SqlitePool, scorer: Arc<dyn PassageScorer>, config: RetrievalConfig) -> Self {
        Self {
            pool,
            scorer,
            config,
        }
    }

    /// Returns the top-`k` passages for `query`, strictly scoped to
    /// `active_ids`. An empty active set (or an unmatchable query) yields an
    /// empty result, which is not an error.
    pub async fn retrieve(
        &self,
        query: &str,
        active_ids: &BTreeSet<String>,
        k: usize,
    ) -> Result<Vec<RetrievalPassage>, CoreError> {
        if active_ids.is_empty() || query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.fetch_candidates(query, active_ids).await?;
        if candidates.is_empty() {
            debug!(query, "no candidates in scope");
            return Ok(Vec::new());
        }

        let scores = self.score_with_retry(query, &candidates).await?;
        Ok(rank_candidates(candidates, &scores, active_ids, k))
    }

    /// FTS candidates restricted to the active set, best `candidate_k` by
    /// keyword rank.
    async fn fetch_candidates(
        &self,
        query: &str,
        active_ids: &BTreeSet<String>,
    ) -> Result<Vec<Candidate>, CoreError> {
        let Some(fts_query) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let placeholders = vec!["?"; active_ids.len()].join(", ");
        let sql = format!(
            r#"
            SELECT p.document_id, p.document_version, p.page, p.page_index, p.text
            FROM passages_fts f
            JOIN passages p ON p.id = f.passage_id
            WHERE f.text MATCH ? AND f.document_id IN ({})
            ORDER BY rank
            LIMIT ?
            "#,
            placeholders
        );

        let mut q = sqlx::query(&sql).bind(&fts_query);
        for id in active_ids {
            q = q.bind(id);
        }
        q = q.bind(self.config.candidate_k as i64);

        let rows = q.fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| Candidate {
                document_id: row.get("document_id"),
                document_version: row.get("document_version"),
                locator: Locator::new(row.get("page"), row.get("page_index")),
                text: row.get("text"),
            })
            .collect())
    }

    /// One scorer call under the configured budget, retried once with backoff
    /// on timeout before the turn is failed.
    async fn score_with_retry(
        &self,
        query: &str,
        candidates: &[Candidate],
    ) -> Result<Vec<f64>, CoreError> {
        let budget = Duration::from_secs(self.config.scorer_timeout_secs);
        for attempt in 0..2u32 {
            match tokio::time::timeout(budget, self.scorer.score(query, candidates)).await {
                Ok(Ok(scores)) => {
                    if scores.len() != candidates.len() {
                        return Err(CoreError::Internal(anyhow::anyhow!(
                            "scorer returned {} scores for {} candidates",
                            scores.len(),
                            candidates.len()
                        )));
                    }
                    return Ok(scores);
                }
                Ok(Err(e)) => return Err(CoreError::Internal(e)),
                Err(_) if attempt == 0 => {
                    warn!("scorer timed out, retrying once");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(_) => return Err(CoreError::Timeout("passage scorer".to_string())),
            }
        }
        unreachable!("score_with_retry loop returns within two attempts")
    }
}

/// Pure ranking core: normalize, re-check scope, deduplicate per
/// (document, locator), deterministic order, truncate to `k`.
fn rank_candidates(
    candidates: Vec<Candidate>,
    raw_scores: &[f64],
    active_ids: &BTreeSet<String>,
    k: usize,
) -> Vec<RetrievalPassage> {
    let normalized = normalize_scores(raw_scores);

    let mut best: HashMap<(String, Locator), RetrievalPassage> = HashMap::new();
    for (cand, score) in candidates.into_iter().zip(normalized) {
        if !active_ids.contains(&cand.document_id) {
            continue;
        }
        let key = (cand.document_id.clone(), cand.locator);
        let entry = best.entry(key).or_insert_with(|| RetrievalPassage {
            document_id: cand.document_id.clone(),
            document_version: cand.document_version,
            locator: cand.locator,
            text: cand.text.clone(),
            relevance_score: score,
        });
        if score > entry.relevance_score {
            entry.relevance_score = score;
            entry.text = cand.text;
        }
    }

    let mut results: Vec<RetrievalPassage> = best.into_values().collect();
    results.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.locator.cmp(&b.locator))
    });
    results.truncate(k);
    results
}

/// Min-max normalization to [0, 1]; a single-point or flat distribution maps
/// to 1.0.
fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    if scores.is_empty() {
        return Vec::new();
    }
    let s_min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    scores
        .iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Builds an FTS5 OR-query from the alphanumeric tokens of the user query so
/// raw punctuation cannot break MATCH syntax. `None` when nothing is
/// searchable.
fn fts_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}

// ============ Built-in scorer ============

/// Deterministic lexical scorer: fraction of distinct query terms present in
/// the passage. Stands in for an external model backend.
pub struct TermOverlapScorer;

#[async_trait]
impl PassageScorer for TermOverlapScorer {
    async fn score(&self, query: &str, candidates: &[Candidate]) -> Result<Vec<f64>> {
        let terms: BTreeSet<String> = tokenize(query);
        let scores = candidates
            .iter()
            .map(|c| {
                if terms.is_empty() {
                    return 0.0;
                }
                let passage_terms = tokenize(&c.text);
                let hits = terms.intersection(&passage_terms).count();
                hits as f64 / terms.len() as f64
            })
            .collect();
        Ok(scores)
    }
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
