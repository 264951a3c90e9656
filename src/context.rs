//! Per-session active source sets.
//!
//! The active set is the scoping unit for retrieval: a chat turn retrieves
//! only from the documents active in its session. Mutations and snapshot
//! reads each run in their own transaction, so a turn's snapshot never tears
//! against a concurrent `set_active`. Selection changes take effect for the
//! next turn; a turn in flight keeps the snapshot it captured at start.

use std::collections::BTreeSet;

use sqlx::Row;
use tracing::info;

use crate::error::{CoreError, Result};
use crate::models::DocumentStatus;
use crate::store::DocumentStore;

#[derive(Clone)]
pub struct ContextManager {
    store: DocumentStore,
}

impl ContextManager {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    /// Replaces the session's active set. Every id must reference a
    /// `published` document; otherwise nothing changes and the offending id
    /// is reported via `NotEligible`.
    pub async fn set_active(&self, session_id: &str, document_ids: &[String]) -> Result<BTreeSet<String>> {
        let unique: BTreeSet<String> = document_ids.iter().cloned().collect();
        for id in &unique {
            self.check_eligible(id).await?;
        }

        let pool = self.store.pool();
        let mut tx = pool.begin().await?;
        ensure_session(&mut tx, session_id).await?;
        sqlx::query("DELETE FROM session_sources WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        for id in &unique {
            sqlx::query("INSERT INTO session_sources (session_id, document_id) VALUES (?, ?)")
                .bind(session_id)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(session_id, sources = unique.len(), "active set replaced");
        Ok(unique)
    }

    /// Adds the document if absent, removes it if present. Adding checks
    /// eligibility; removing never fails on status.
    pub async fn toggle(&self, session_id: &str, document_id: &str) -> Result<BTreeSet<String>> {
        let current = self.active_set(session_id).await?;
        if current.contains(document_id) {
            let pool = self.store.pool();
            sqlx::query("DELETE FROM session_sources WHERE session_id = ? AND document_id = ?")
                .bind(session_id)
                .bind(document_id)
                .execute(pool)
                .await?;
        } else {
            self.check_eligible(document_id).await?;
            let pool = self.store.pool();
            let mut tx = pool.begin().await?;
            ensure_session(&mut tx, session_id).await?;
            sqlx::query(
                "INSERT OR IGNORE INTO session_sources (session_id, document_id) VALUES (?, ?)",
            )
            .bind(session_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
        }
        self.active_set(session_id).await
    }

    /// Snapshot of the active set. Unknown sessions have an empty set.
    pub async fn active_set(&self, session_id: &str) -> Result<BTreeSet<String>> {
        let rows = sqlx::query("SELECT document_id FROM session_sources WHERE session_id = ?")
            .bind(session_id)
            .fetch_all(self.store.pool())
            .await?;
        Ok(rows.iter().map(|r| r.get("document_id")).collect())
    }

    async fn check_eligible(&self, document_id: &str) -> Result<()> {
        let doc = self.store.get(document_id).await?;
        if doc.status != DocumentStatus::Published {
            return Err(CoreError::NotEligible(document_id.to_string()));
        }
        Ok(())
    }
}

/// Sessions are created implicitly on first touch.
pub async fn ensure_session(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    session_id: &str,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO sessions (id, created_at) VALUES (?, ?)")
        .bind(session_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut **tx)
        .await?;
    Ok(())
}
