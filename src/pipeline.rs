//! Upload compliance pipeline.
//!
//! Drives a document from raw upload to published:
//!
//! ```text
//! draft ──▶ scanning ──▶ scanned ──▶ pending_metadata ──▶ published
//!              │                            │
//!              └──▶ rejected (scan failure) └──▶ rejected (reviewer)
//! ```
//!
//! Every edge is applied through the store's CAS, so concurrent attempts on
//! the same document resolve deterministically. A cancelled scan returns the
//! document to `draft` (the scan itself ends `aborted` and never touches
//! status).

use std::sync::Arc;

use tracing::{info, warn};

use crate::blob::BlobStore;
use crate::config::Config;
use crate::error::{CoreError, Result};
use crate::extract;
use crate::models::{Classification, Document, DocumentStatus, ScanOutcome};
use crate::passage;
use crate::scan::ScanEngine;
use crate::store::{DocumentStore, NewDocument, VersionPatch};

/// A raw upload before any record exists.
#[derive(Debug)]
pub struct UploadRequest {
    pub title: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Optional identity of the uploading user, recorded on the draft.
    pub uploader: Option<String>,
}

/// Reviewer-supplied metadata accompanying a publish attempt.
#[derive(Debug, Clone)]
pub struct MetadataSubmission {
    pub owner: String,
    pub classification: Classification,
    pub review_date: i64,
    pub tags: Vec<String>,
    /// Required when the latest scan is `flagged`.
    pub acknowledge_findings: bool,
}

#[derive(Clone)]
pub struct UploadPipeline {
    store: DocumentStore,
    blobs: Arc<dyn BlobStore>,
    scans: ScanEngine,
    config: Arc<Config>,
}

impl UploadPipeline {
    pub fn new(
        store: DocumentStore,
        blobs: Arc<dyn BlobStore>,
        scans: ScanEngine,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            blobs,
            scans,
            config,
        }
    }

    /// Accepts an upload: stores the blob, creates the draft record, and
    /// launches the asynchronous scan. Returns the draft snapshot; the scan
    /// and the `scanning -> scanned -> pending_metadata` advance happen in
    /// the background.
    pub async fn upload(&self, req: UploadRequest) -> Result<Document> {
        if req.title.trim().is_empty() {
            return Err(CoreError::Invalid("title must not be empty".to_string()));
        }
        if req.bytes.is_empty() {
            return Err(CoreError::Invalid("upload is empty".to_string()));
        }
        if !extract::is_supported(&req.content_type) {
            return Err(CoreError::Invalid(format!(
                "unsupported content type: {}",
                req.content_type
            )));
        }

        let pages = extract::extract_pages(&req.bytes, &req.content_type)
            .map_err(|e| CoreError::Invalid(e.to_string()))?;

        let blob_ref = self.blobs.store_blob(&req.bytes).await?;
        let draft = self
            .store
            .create(NewDocument {
                title: req.title.trim().to_string(),
                blob_ref,
                content_type: req.content_type,
                size_bytes: req.bytes.len() as i64,
                uploaded_by: req.uploader,
            })
            .await?;

        info!(document_id = %draft.id, size = draft.size_bytes, "upload accepted");

        self.store
            .set_status(&draft.id, DocumentStatus::Draft, DocumentStatus::Scanning)
            .await?;
        self.launch_scan(&draft.id, pages).await?;

        Ok(draft)
    }

    /// Starts a scan for a document already in `scanning` and spawns the
    /// watcher that advances (or rejects) the document on the terminal
    /// outcome.
    async fn launch_scan(&self, document_id: &str, pages: Vec<String>) -> Result<()> {
        let handle = self.scans.start_scan(document_id, pages).await?;
        let store = self.store.clone();
        let doc_id = document_id.to_string();

        tokio::spawn(async move {
            let Ok(term) = handle.terminal.await else {
                warn!(document_id = %doc_id, "scan task dropped without terminal outcome");
                return;
            };

            let step = match term.outcome {
                ScanOutcome::Clean | ScanOutcome::Flagged => {
                    // scanned -> pending_metadata is automatic
                    match store
                        .set_status(&doc_id, DocumentStatus::Scanning, DocumentStatus::Scanned)
                        .await
                    {
                        Ok(_) => {
                            store
                                .set_status(
                                    &doc_id,
                                    DocumentStatus::Scanned,
                                    DocumentStatus::PendingMetadata,
                                )
                                .await
                        }
                        Err(e) => Err(e),
                    }
                }
                ScanOutcome::Aborted if term.cancelled => {
                    // Cancellation never flips status here; cancel_scan owns
                    // the scanning -> draft edge.
                    return;
                }
                ScanOutcome::Aborted => {
                    store
                        .set_status(&doc_id, DocumentStatus::Scanning, DocumentStatus::Rejected)
                        .await
                }
                ScanOutcome::Running => unreachable!("terminal outcome cannot be running"),
            };

            match step {
                Ok(doc) => info!(document_id = %doc_id, status = %doc.status, "scan outcome applied"),
                Err(e) => warn!(document_id = %doc_id, error = %e, "scan outcome not applied"),
            }
        });

        Ok(())
    }

    /// Submits reviewer metadata and publishes.
    ///
    /// Rules, in order:
    /// - `pending_metadata` documents publish (one winner under concurrency);
    /// - already-`published` documents: identical values are an idempotent
    ///   no-op at the same version, changed values append a metadata-edit
    ///   version without a status change;
    /// - anything else is `InvalidTransition`.
    pub async fn submit_metadata(&self, id: &str, meta: MetadataSubmission) -> Result<Document> {
        let doc = self.store.get(id).await?;
        validate_metadata(&meta)?;

        match doc.status {
            DocumentStatus::Published => {
                if metadata_matches(&doc, &meta) {
                    info!(document_id = %doc.id, version = doc.version, "identical metadata resubmitted; no-op");
                    return Ok(doc);
                }
                let updated = self
                    .store
                    .append_version(&doc.lineage_id, patch_from(&meta))
                    .await?;
                info!(document_id = %updated.id, version = updated.version, "metadata edited");
                Ok(updated)
            }
            DocumentStatus::PendingMetadata => {
                let scan = self
                    .store
                    .latest_scan(&doc.id)
                    .await?
                    .ok_or_else(|| CoreError::Invalid("no scan on record".to_string()))?;
                match scan.outcome {
                    ScanOutcome::Clean => {}
                    ScanOutcome::Flagged if meta.acknowledge_findings => {
                        warn!(document_id = %doc.id, findings = scan.findings.len(),
                            "publishing with acknowledged findings");
                    }
                    ScanOutcome::Flagged => {
                        return Err(CoreError::Invalid(
                            "scan flagged findings; publish requires acknowledge_findings".to_string(),
                        ));
                    }
                    ScanOutcome::Running | ScanOutcome::Aborted => {
                        return Err(CoreError::Invalid(
                            "latest scan did not complete".to_string(),
                        ));
                    }
                }

                let published = self.store.publish(&doc.id, patch_from(&meta)).await?;
                info!(document_id = %published.id, version = published.version, "published");

                if let Err(e) = self.index_passages(&published).await {
                    // Retrieval indexing is repaired on the next publish of
                    // this lineage; the publish itself stands.
                    warn!(document_id = %published.id, error = %e, "passage indexing failed");
                }

                Ok(published)
            }
            other => Err(CoreError::InvalidTransition {
                from: other,
                to: DocumentStatus::Published,
            }),
        }
    }

    /// Reviewer rejection of a document awaiting metadata. Terminal.
    pub async fn reject(&self, id: &str) -> Result<Document> {
        let doc = self.store.get(id).await?;
        if doc.status != DocumentStatus::PendingMetadata {
            return Err(CoreError::InvalidTransition {
                from: doc.status,
                to: DocumentStatus::Rejected,
            });
        }
        self.store
            .set_status(id, DocumentStatus::PendingMetadata, DocumentStatus::Rejected)
            .await
    }

    /// Cancels an in-flight scan and returns the document to `draft` so a new
    /// scan can be started. Safe at any progress; the scan record ends
    /// `aborted`.
    pub async fn cancel_scan(&self, id: &str) -> Result<Document> {
        let doc = self.store.get(id).await?;
        if doc.status != DocumentStatus::Scanning {
            return Err(CoreError::InvalidTransition {
                from: doc.status,
                to: DocumentStatus::Draft,
            });
        }
        self.scans.cancel(id);
        self.store
            .set_status(id, DocumentStatus::Scanning, DocumentStatus::Draft)
            .await
    }

    /// Re-runs the scan for a document previously returned to `draft`.
    pub async fn rescan(&self, id: &str) -> Result<Document> {
        let doc = self.store.get(id).await?;
        if doc.status != DocumentStatus::Draft {
            return Err(CoreError::InvalidTransition {
                from: doc.status,
                to: DocumentStatus::Scanning,
            });
        }
        let bytes = self.blobs.read_blob(&doc.blob_ref).await?;
        let pages = extract::extract_pages(&bytes, &doc.content_type)
            .map_err(|e| CoreError::Invalid(e.to_string()))?;
        let doc = self
            .store
            .set_status(id, DocumentStatus::Draft, DocumentStatus::Scanning)
            .await?;
        self.launch_scan(id, pages).await?;
        Ok(doc)
    }

    /// Replaces the document's retrievable passages with ones extracted from
    /// the just-published version.
    async fn index_passages(&self, doc: &Document) -> Result<()> {
        let bytes = self.blobs.read_blob(&doc.blob_ref).await?;
        let pages = extract::extract_pages(&bytes, &doc.content_type)
            .map_err(|e| CoreError::Internal(e.into()))?;
        let passages = passage::split_pages(&pages, self.config.passages.max_chars);

        let pool = self.store.pool();
        let mut tx = pool.begin().await?;
        sqlx::query("DELETE FROM passages_fts WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM passages WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;

        for p in &passages {
            sqlx::query(
                r#"
                INSERT INTO passages (id, document_id, document_version, page, page_index, text, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&p.id)
            .bind(&doc.id)
            .bind(doc.version)
            .bind(p.locator.page)
            .bind(p.locator.index)
            .bind(&p.text)
            .bind(&p.hash)
            .execute(&mut *tx)
            .await?;

            sqlx::query("INSERT INTO passages_fts (passage_id, document_id, text) VALUES (?, ?, ?)")
                .bind(&p.id)
                .bind(&doc.id)
                .bind(&p.text)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(document_id = %doc.id, passages = passages.len(), "passages indexed");
        Ok(())
    }
}

fn validate_metadata(meta: &MetadataSubmission) -> Result<()> {
    if meta.owner.trim().is_empty() {
        return Err(CoreError::Invalid("owner must not be empty".to_string()));
    }
    if meta.review_date <= chrono::Utc::now().timestamp() {
        return Err(CoreError::Invalid(
            "review_date must be in the future".to_string(),
        ));
    }
    Ok(())
}

fn patch_from(meta: &MetadataSubmission) -> VersionPatch {
    VersionPatch {
        title: None,
        owner: meta.owner.trim().to_string(),
        classification: meta.classification,
        review_date: meta.review_date,
        tags: meta.tags.clone(),
    }
}

/// True when a resubmission carries exactly the values already on record.
fn metadata_matches(doc: &Document, meta: &MetadataSubmission) -> bool {
    doc.owner.as_deref() == Some(meta.owner.trim())
        && doc.classification == Some(meta.classification)
        && doc.review_date == Some(meta.review_date)
        && doc.tags == meta.tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> MetadataSubmission {
        MetadataSubmission {
            owner: "reviewer@internal".to_string(),
            classification: Classification::Internal,
            review_date: chrono::Utc::now().timestamp() + 86_400,
            tags: vec!["quarterly".to_string()],
            acknowledge_findings: false,
        }
    }

    #[test]
    fn metadata_validation_rejects_past_review_date() {
        let mut meta = sample_meta();
        meta.review_date = chrono::Utc::now().timestamp() - 10;
        assert!(matches!(
            validate_metadata(&meta),
            Err(CoreError::Invalid(_))
        ));
    }

    #[test]
    fn metadata_validation_rejects_blank_owner() {
        let mut meta = sample_meta();
        meta.owner = "   ".to_string();
        assert!(matches!(
            validate_metadata(&meta),
            Err(CoreError::Invalid(_))
        ));
    }
}
