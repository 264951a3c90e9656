//! Chat sessions, turns, and citation composition.
//!
//! A turn moves through `received -> retrieving -> composing -> delivered`
//! (or `failed` from any state). The active context is snapshotted at
//! `received`, so a turn's citations are internally consistent even if the
//! user changes the selection mid-generation. Messages are appended in
//! delivery order inside a single transaction — readers never observe a
//! partially written message or a partial citation list.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::context::{ensure_session, ContextManager};
use crate::error::{CoreError, Result};
use crate::models::{Citation, Locator, Message, RetrievalPassage, Role};
use crate::retrieval::RetrievalEngine;

/// Text shown when retrieval finds nothing in the active sources.
const NO_GROUNDING_TEXT: &str =
    "I could not find anything in the selected sources that addresses this question.";

/// System-authored text persisted in place of an assistant answer when a turn
/// fails.
const TURN_FAILED_TEXT: &str =
    "Something went wrong while answering; no sources were consulted for this reply. Please try again.";

/// Maximum characters quoted into a citation snippet.
const SNIPPET_CHARS: usize = 240;

/// What a composer produced: the answer text and the indices (into the
/// offered passage slice) of the passages it actually referenced. Offered but
/// unused passages must not appear in `used` — they produce no citation.
#[derive(Debug, Clone)]
pub struct ComposedAnswer {
    pub text: String,
    pub used: Vec<usize>,
}

/// Pluggable answer backend. May be network-bound; the engine applies the
/// turn budget and retries a timeout once.
#[async_trait]
pub trait AnswerComposer: Send + Sync {
    async fn compose(&self, query: &str, passages: &[RetrievalPassage])
        -> AnyResult<ComposedAnswer>;
}

/// Per-turn state, for logging and tests; not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    Retrieving,
    Composing,
    Delivered,
    Failed,
}

#[derive(Clone)]
pub struct ChatEngine {
    pool: SqlitePool,
    context: ContextManager,
    retrieval: RetrievalEngine,
    composer: Arc<dyn AnswerComposer>,
    config: ChatConfig,
    top_k: usize,
}

impl ChatEngine {
    pub fn new(
        pool: SqlitePool,
        context: ContextManager,
        retrieval: RetrievalEngine,
        composer: Arc<dyn AnswerComposer>,
        config: ChatConfig,
        top_k: usize,
    ) -> Self {
        Self {
            pool,
            context,
            retrieval,
            composer,
            config,
            top_k,
        }
    }

    /// Runs one chat turn end to end and returns the delivered assistant
    /// message. On failure a system-authored error message is persisted in
    /// its place and the original error is returned (so a timeout still
    /// surfaces as 504 upstream).
    pub async fn run_turn(&self, session_id: &str, text: &str) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CoreError::Invalid("message text must not be empty".to_string()));
        }

        // received: snapshot the scope before anything else
        let snapshot = self.context.active_set(session_id).await?;
        debug!(session_id, sources = snapshot.len(), state = ?TurnState::Received, "turn state");
        self.append_message(session_id, Role::User, text, &[]).await?;

        match self.answer(session_id, text, &snapshot).await {
            Ok(message) => Ok(message),
            Err(e) => {
                warn!(session_id, error = %e, state = ?TurnState::Failed, "turn failed");
                // Best effort: the failure notice must never mask the error
                if let Err(persist_err) = self
                    .append_message(session_id, Role::Assistant, TURN_FAILED_TEXT, &[])
                    .await
                {
                    warn!(session_id, error = %persist_err, "failed to persist failure notice");
                }
                Err(e)
            }
        }
    }

    async fn answer(
        &self,
        session_id: &str,
        text: &str,
        snapshot: &BTreeSet<String>,
    ) -> Result<Message> {
        debug!(session_id, state = ?TurnState::Retrieving, "turn state");
        let passages = self.retrieval.retrieve(text, snapshot, self.top_k).await?;

        if passages.is_empty() {
            // No grounding is a delivered answer with zero citations
            let message = self
                .append_message(session_id, Role::Assistant, NO_GROUNDING_TEXT, &[])
                .await?;
            info!(session_id, state = ?TurnState::Delivered, citations = 0, "turn delivered");
            return Ok(message);
        }

        debug!(session_id, state = ?TurnState::Composing, passages = passages.len(), "turn state");
        let offered = &passages[..passages.len().min(self.config.max_context_passages)];
        let composed = self.compose_with_retry(text, offered).await?;
        let citations = build_citations(offered, &composed.used, snapshot);

        let message = self
            .append_message(session_id, Role::Assistant, &composed.text, &citations)
            .await?;
        info!(
            session_id,
            state = ?TurnState::Delivered,
            citations = citations.len(),
            "turn delivered"
        );
        Ok(message)
    }

    /// Composer call under the turn budget, retried once with backoff on
    /// timeout. A cancelled or failed composition discards partial output —
    /// nothing is persisted from this path.
    async fn compose_with_retry(
        &self,
        query: &str,
        passages: &[RetrievalPassage],
    ) -> Result<ComposedAnswer> {
        let budget = Duration::from_secs(self.config.turn_timeout_secs);
        for attempt in 0..2u32 {
            match tokio::time::timeout(budget, self.composer.compose(query, passages)).await {
                Ok(Ok(answer)) => return Ok(answer),
                Ok(Err(e)) => return Err(CoreError::Internal(e)),
                Err(_) if attempt == 0 => {
                    warn!("composer timed out, retrying once");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(_) => return Err(CoreError::Timeout("answer composer".to_string())),
            }
        }
        unreachable!("compose_with_retry loop returns within two attempts")
    }

    /// Appends a message (and its citations) atomically. `seq` is assigned at
    /// commit, so message order is the order turns actually delivered.
    async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        text: &str,
        citations: &[Citation],
    ) -> Result<Message> {
        let id = Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        ensure_session(&mut tx, session_id).await?;
        sqlx::query(
            r#"
            INSERT INTO messages (id, session_id, seq, role, text, created_at)
            SELECT ?, ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?
            FROM messages WHERE session_id = ?
            "#,
        )
        .bind(&id)
        .bind(session_id)
        .bind(role.as_str())
        .bind(text)
        .bind(now)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        for c in citations {
            sqlx::query(
                r#"
                INSERT INTO citations
                    (message_id, rank, document_id, document_version, locator, quoted_snippet)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(c.rank)
            .bind(&c.document_id)
            .bind(c.document_version)
            .bind(c.locator.encode())
            .bind(&c.quoted_snippet)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_message(&id).await
    }

    async fn get_message(&self, id: &str) -> Result<Message> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("message {}", id)))?;
        self.message_from_row(&row).await
    }

    /// All persisted messages for a session in delivery order.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query("SELECT * FROM messages WHERE session_id = ? ORDER BY seq ASC")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.message_from_row(row).await?);
        }
        Ok(out)
    }

    async fn message_from_row(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
        let id: String = row.get("id");
        let role_raw: String = row.get("role");

        let citation_rows = sqlx::query(
            r#"
            SELECT rank, document_id, document_version, locator, quoted_snippet
            FROM citations WHERE message_id = ? ORDER BY rank ASC
            "#,
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;

        let citations = citation_rows
            .iter()
            .map(|r| {
                let locator_raw: String = r.get("locator");
                Citation {
                    rank: r.get("rank"),
                    document_id: r.get("document_id"),
                    document_version: r.get("document_version"),
                    locator: Locator::decode(&locator_raw).unwrap_or(Locator::new(1, 0)),
                    quoted_snippet: r.get("quoted_snippet"),
                }
            })
            .collect();

        Ok(Message {
            id,
            session_id: row.get("session_id"),
            seq: row.get("seq"),
            role: Role::parse(&role_raw).unwrap_or(Role::Assistant),
            text: row.get("text"),
            created_at: row.get("created_at"),
            citations,
        })
    }
}

/// Maps the passages a composer actually used into a rank-stable citation
/// sequence: first use wins, ranks increase strictly from 1, and anything
/// outside the turn's snapshot is dropped rather than cited.
fn build_citations(
    offered: &[RetrievalPassage],
    used: &[usize],
    snapshot: &BTreeSet<String>,
) -> Vec<Citation> {
    let mut seen: BTreeSet<usize> = BTreeSet::new();
    let mut citations = Vec::new();

    for &idx in used {
        let Some(passage) = offered.get(idx) else {
            continue;
        };
        if !snapshot.contains(&passage.document_id) || !seen.insert(idx) {
            continue;
        }
        citations.push(Citation {
            rank: citations.len() as i64 + 1,
            document_id: passage.document_id.clone(),
            document_version: passage.document_version,
            locator: passage.locator,
            quoted_snippet: snippet(&passage.text, SNIPPET_CHARS),
        });
    }

    citations
}

fn snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{}…", cut.trim_end())
}

// ============ Built-in composer ============

/// Extractive composer: answers by quoting the supporting passages with
/// inline [n] markers. Stands in for an external generation backend; every
/// quoted passage is marked used, passages with zero relevance are not
/// quoted.
pub struct ExtractiveComposer;

#[async_trait]
impl AnswerComposer for ExtractiveComposer {
    async fn compose(
        &self,
        query: &str,
        passages: &[RetrievalPassage],
    ) -> AnyResult<ComposedAnswer> {
        let mut text = format!("Here is what the selected sources say about \"{}\":\n", query);
        let mut used = Vec::new();

        for (i, p) in passages.iter().enumerate() {
            if p.relevance_score <= 0.0 {
                continue;
            }
            let marker = used.len() + 1;
            text.push_str(&format!(
                "\n[{}] \"{}\" ({} {})",
                marker,
                snippet(&p.text, SNIPPET_CHARS),
                p.document_id,
                p.locator
            ));
            used.push(i);
        }

        if used.is_empty() {
            text = NO_GROUNDING_TEXT.to_string();
        }

        Ok(ComposedAnswer { text, used })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(doc: &str, page: i64, index: i64, score: f64) -> RetrievalPassage {
        RetrievalPassage {
            document_id: doc.to_string(),
            document_version: 1,
            locator: Locator::new(page, index),
            text: format!("passage {}/{}#{}", doc, page, index),
            relevance_score: score,
        }
    }

    fn snapshot(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn citation_ranks_increase_strictly_from_one() {
        let offered = vec![
            passage("doc-a", 1, 0, 0.9),
            passage("doc-b", 2, 0, 0.7),
            passage("doc-a", 3, 1, 0.5),
        ];
        let cites = build_citations(&offered, &[2, 0, 1], &snapshot(&["doc-a", "doc-b"]));
        let ranks: Vec<i64> = cites.iter().map(|c| c.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        // First use order preserved
        assert_eq!(cites[0].locator, Locator::new(3, 1));
    }

    #[test]
    fn unused_passages_produce_no_citation() {
        let offered = vec![passage("doc-a", 1, 0, 0.9), passage("doc-a", 1, 1, 0.8)];
        let cites = build_citations(&offered, &[1], &snapshot(&["doc-a"]));
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].locator, Locator::new(1, 1));
    }

    #[test]
    fn repeated_use_cites_once() {
        let offered = vec![passage("doc-a", 1, 0, 0.9)];
        let cites = build_citations(&offered, &[0, 0, 0], &snapshot(&["doc-a"]));
        assert_eq!(cites.len(), 1);
    }

    #[test]
    fn citations_never_leave_the_snapshot() {
        let offered = vec![passage("doc-a", 1, 0, 0.9), passage("doc-z", 1, 0, 0.8)];
        let cites = build_citations(&offered, &[0, 1], &snapshot(&["doc-a"]));
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].document_id, "doc-a");
    }

    #[test]
    fn out_of_range_use_indices_are_ignored() {
        let offered = vec![passage("doc-a", 1, 0, 0.9)];
        let cites = build_citations(&offered, &[7, 0], &snapshot(&["doc-a"]));
        assert_eq!(cites.len(), 1);
        assert_eq!(cites[0].rank, 1);
    }

    #[test]
    fn snippet_truncates_on_char_boundary() {
        let s = snippet("héllo wörld, this is a long passage", 10);
        assert!(s.chars().count() <= 10);
        assert!(s.ends_with('…'));
        assert_eq!(snippet("short", 10), "short");
    }

    #[tokio::test]
    async fn extractive_composer_skips_zero_relevance() {
        let composer = ExtractiveComposer;
        let passages = vec![passage("doc-a", 1, 0, 0.9), passage("doc-a", 1, 1, 0.0)];
        let answer = composer.compose("what is this", &passages).await.unwrap();
        assert_eq!(answer.used, vec![0]);
        assert!(answer.text.contains("[1]"));
        assert!(!answer.text.contains("[2]"));
    }

    #[tokio::test]
    async fn extractive_composer_with_nothing_usable_reports_no_grounding() {
        let composer = ExtractiveComposer;
        let passages = vec![passage("doc-a", 1, 0, 0.0)];
        let answer = composer.compose("query", &passages).await.unwrap();
        assert!(answer.used.is_empty());
        assert_eq!(answer.text, NO_GROUNDING_TEXT);
    }
}
