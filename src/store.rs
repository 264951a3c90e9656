//! Durable document records and their version chains.
//!
//! The store is the only writer of a document's mutable fields. Status moves
//! exclusively through [`DocumentStore::set_status`], a single-statement
//! compare-and-swap, so concurrent pipeline stages cannot race a document into
//! an inconsistent state. Nothing is ever deleted; superseded versions live in
//! `document_versions` and `rejected` is a terminal status.

use sqlx::{Row, SqlitePool};

use crate::error::{CoreError, Result};
use crate::models::{
    Classification, Document, DocumentStatus, Finding, ScanOutcome, ScanResult,
};

/// Fields supplied at upload time; everything else starts unset.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub blob_ref: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub uploaded_by: Option<String>,
}

/// Metadata snapshot written as a new version by [`DocumentStore::append_version`].
#[derive(Debug, Clone)]
pub struct VersionPatch {
    pub title: Option<String>,
    pub owner: String,
    pub classification: Classification,
    pub review_date: i64,
    pub tags: Vec<String>,
}

/// Optional filters for [`DocumentStore::list`].
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub status: Option<DocumentStatus>,
    pub classification: Option<Classification>,
}

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates a new lineage at version 1 in `draft`.
    pub async fn create(&self, new: NewDocument) -> Result<Document> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO documents
                (id, lineage_id, version, title, blob_ref, content_type, size_bytes,
                 uploaded_by, status, tags_json, created_at, updated_at)
            VALUES (?, ?, 1, ?, ?, ?, ?, ?, 'draft', '[]', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&id)
        .bind(&new.title)
        .bind(&new.blob_ref)
        .bind(&new.content_type)
        .bind(new.size_bytes)
        .bind(&new.uploaded_by)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO document_versions (lineage_id, version, title, tags_json, created_at)
            VALUES (?, 1, ?, '[]', ?)
            "#,
        )
        .bind(&id)
        .bind(&new.title)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => doc_from_row(&row),
            None => Err(CoreError::NotFound(format!("document {}", id))),
        }
    }

    pub async fn list(&self, filter: DocumentFilter) -> Result<Vec<Document>> {
        let mut sql = String::from("SELECT * FROM documents WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.classification.is_some() {
            sql.push_str(" AND classification = ?");
        }
        sql.push_str(" ORDER BY updated_at DESC, id ASC");

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(class) = filter.classification {
            query = query.bind(class.as_str());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(doc_from_row).collect()
    }

    /// Atomic compare-and-swap on status. Succeeds only if the current status
    /// equals `from`; otherwise nothing is applied and the caller observes
    /// `Conflict` (or `NotFound` for an unknown id).
    pub async fn set_status(
        &self,
        id: &str,
        from: DocumentStatus,
        to: DocumentStatus,
    ) -> Result<Document> {
        let now = chrono::Utc::now().timestamp();
        let result =
            sqlx::query("UPDATE documents SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(now)
                .bind(id)
                .bind(from.as_str())
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a missing document
            let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM documents WHERE id = ?")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
            if exists {
                return Err(CoreError::Conflict);
            }
            return Err(CoreError::NotFound(format!("document {}", id)));
        }

        self.get(id).await
    }

    /// Appends a new immutable version carrying the patched metadata and
    /// advances the head record. History is never rewritten. The head update
    /// is a compare-and-swap on the version we read, so of two concurrent
    /// edits exactly one wins and the other observes `Conflict`.
    pub async fn append_version(&self, lineage_id: &str, patch: VersionPatch) -> Result<Document> {
        let head = self.get(lineage_id).await?;
        let next_version = head.version + 1;
        let now = chrono::Utc::now().timestamp();
        let title = patch.title.unwrap_or(head.title);
        let tags_json = serde_json::to_string(&patch.tags).unwrap_or_else(|_| "[]".to_string());

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET version = ?, title = ?, owner = ?, classification = ?,
                review_date = ?, tags_json = ?, updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(next_version)
        .bind(&title)
        .bind(&patch.owner)
        .bind(patch.classification.as_str())
        .bind(patch.review_date)
        .bind(&tags_json)
        .bind(now)
        .bind(&head.id)
        .bind(head.version)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(CoreError::Conflict);
        }

        sqlx::query(
            r#"
            INSERT INTO document_versions
                (lineage_id, version, title, owner, classification, review_date, tags_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&head.lineage_id)
        .bind(next_version)
        .bind(&title)
        .bind(&patch.owner)
        .bind(patch.classification.as_str())
        .bind(patch.review_date)
        .bind(&tags_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get(&head.id).await
    }

    /// Publishes in one transaction: the `pending_metadata -> published` CAS
    /// and the metadata version append commit together, so a reader never
    /// observes a published document without classification and review date.
    /// Exactly one of two concurrent publishers wins; the other sees
    /// `Conflict`.
    pub async fn publish(&self, id: &str, patch: VersionPatch) -> Result<Document> {
        let head = self.get(id).await?;
        let next_version = head.version + 1;
        let now = chrono::Utc::now().timestamp();
        let title = patch.title.unwrap_or(head.title);
        let tags_json = serde_json::to_string(&patch.tags).unwrap_or_else(|_| "[]".to_string());

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE documents
            SET status = 'published', version = ?, title = ?, owner = ?,
                classification = ?, review_date = ?, tags_json = ?, updated_at = ?
            WHERE id = ? AND status = 'pending_metadata'
            "#,
        )
        .bind(next_version)
        .bind(&title)
        .bind(&patch.owner)
        .bind(patch.classification.as_str())
        .bind(patch.review_date)
        .bind(&tags_json)
        .bind(now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(CoreError::Conflict);
        }

        sqlx::query(
            r#"
            INSERT INTO document_versions
                (lineage_id, version, title, owner, classification, review_date, tags_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&head.lineage_id)
        .bind(next_version)
        .bind(&title)
        .bind(&patch.owner)
        .bind(patch.classification.as_str())
        .bind(patch.review_date)
        .bind(&tags_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get(id).await
    }

    /// Most recent scan for a document, with findings in report order.
    pub async fn latest_scan(&self, document_id: &str) -> Result<Option<ScanResult>> {
        let row = sqlx::query(
            r#"
            SELECT scan_id, document_id, started_at, completed_at, progress, outcome
            FROM scan_results
            WHERE document_id = ?
            ORDER BY started_at DESC, scan_id DESC
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let scan_id: String = row.get("scan_id");
        let outcome_raw: String = row.get("outcome");
        let progress: i64 = row.get("progress");

        let finding_rows = sqlx::query(
            "SELECT kind, location, snippet FROM scan_findings WHERE scan_id = ? ORDER BY ord ASC",
        )
        .bind(&scan_id)
        .fetch_all(&self.pool)
        .await?;

        let findings = finding_rows
            .iter()
            .map(|r| Finding {
                kind: r.get("kind"),
                location: r.get("location"),
                snippet: r.get("snippet"),
            })
            .collect();

        Ok(Some(ScanResult {
            scan_id,
            document_id: row.get("document_id"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
            progress: progress.clamp(0, 100) as u8,
            outcome: ScanOutcome::parse(&outcome_raw).unwrap_or(ScanOutcome::Running),
            findings,
        }))
    }
}

fn doc_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Document> {
    let status_raw: String = row.get("status");
    let status = DocumentStatus::parse(&status_raw)
        .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("bad status in db: {}", status_raw)))?;

    let classification: Option<String> = row.get("classification");
    let tags_json: String = row.get("tags_json");
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_default();

    Ok(Document {
        id: row.get("id"),
        lineage_id: row.get("lineage_id"),
        version: row.get("version"),
        title: row.get("title"),
        blob_ref: row.get("blob_ref"),
        content_type: row.get("content_type"),
        size_bytes: row.get("size_bytes"),
        uploaded_by: row.get("uploaded_by"),
        owner: row.get("owner"),
        classification: classification.as_deref().and_then(Classification::parse),
        status,
        review_date: row.get("review_date"),
        tags,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
