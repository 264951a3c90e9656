//! Core data models used throughout Sourcebook.
//!
//! These types represent the documents, scans, sessions, and citations that
//! flow through the upload pipeline and the chat engine. Enum variants are
//! stored in SQLite as lowercase text.

use serde::{Deserialize, Serialize};

/// Security classification captured during metadata review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Public,
    Internal,
    Confidential,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Public => "public",
            Classification::Internal => "internal",
            Classification::Confidential => "confidential",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Classification::Public),
            "internal" => Some(Classification::Internal),
            "confidential" => Some(Classification::Confidential),
            _ => None,
        }
    }
}

/// Lifecycle status of a document. Transitions are owned by the upload
/// pipeline and applied through the store's CAS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    Scanning,
    Scanned,
    PendingMetadata,
    Published,
    Rejected,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Draft => "draft",
            DocumentStatus::Scanning => "scanning",
            DocumentStatus::Scanned => "scanned",
            DocumentStatus::PendingMetadata => "pending_metadata",
            DocumentStatus::Published => "published",
            DocumentStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(DocumentStatus::Draft),
            "scanning" => Some(DocumentStatus::Scanning),
            "scanned" => Some(DocumentStatus::Scanned),
            "pending_metadata" => Some(DocumentStatus::PendingMetadata),
            "published" => Some(DocumentStatus::Published),
            "rejected" => Some(DocumentStatus::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document record. `version` is monotonic within a lineage; superseded
/// versions are retained append-only in `document_versions`.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub lineage_id: String,
    pub version: i64,
    pub title: String,
    pub blob_ref: String,
    pub content_type: String,
    pub size_bytes: i64,
    /// Who uploaded the file; distinct from the reviewer-assigned `owner`.
    pub uploaded_by: Option<String>,
    pub owner: Option<String>,
    pub classification: Option<Classification>,
    pub status: DocumentStatus,
    pub review_date: Option<i64>,
    pub tags: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Terminal or in-flight outcome of a content scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanOutcome {
    Running,
    Clean,
    Flagged,
    Aborted,
}

impl ScanOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanOutcome::Running => "running",
            ScanOutcome::Clean => "clean",
            ScanOutcome::Flagged => "flagged",
            ScanOutcome::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(ScanOutcome::Running),
            "clean" => Some(ScanOutcome::Clean),
            "flagged" => Some(ScanOutcome::Flagged),
            "aborted" => Some(ScanOutcome::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanOutcome::Running)
    }
}

/// A single sensitive-content hit reported by a scanner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Detector kind, e.g. `"email"` or `"number-run"`.
    pub kind: String,
    /// Where in the document the hit occurred, e.g. `"p3#1"`.
    pub location: String,
    pub snippet: String,
}

/// Snapshot of one scan invocation. Write-once after completion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub scan_id: String,
    pub document_id: String,
    pub started_at: i64,
    pub completed_at: Option<i64>,
    pub progress: u8,
    pub outcome: ScanOutcome,
    pub findings: Vec<Finding>,
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// Where a passage lives inside a document: 1-based page, 0-based passage
/// index within the page. Orders lexicographically as (page, index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub page: i64,
    pub index: i64,
}

impl Locator {
    pub fn new(page: i64, index: i64) -> Self {
        Self { page, index }
    }

    /// Canonical string form, e.g. `"p3#1"`.
    pub fn encode(&self) -> String {
        format!("p{}#{}", self.page, self.index)
    }

    pub fn decode(s: &str) -> Option<Self> {
        let rest = s.strip_prefix('p')?;
        let (page, index) = rest.split_once('#')?;
        Some(Self {
            page: page.parse().ok()?,
            index: index.parse().ok()?,
        })
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Reference from an assistant message back to a supporting passage.
/// `rank` positions increase strictly from 1 in order of first use.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub rank: i64,
    pub document_id: String,
    pub document_version: i64,
    pub locator: Locator,
    pub quoted_snippet: String,
}

/// A persisted chat message. Immutable; corrections append new messages.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub seq: i64,
    pub role: Role,
    pub text: String,
    pub created_at: i64,
    pub citations: Vec<Citation>,
}

/// A candidate passage produced fresh per query. Not persisted with identity;
/// the `passages` table is only a candidate source for the scorer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalPassage {
    pub document_id: String,
    pub document_version: i64,
    pub locator: Locator,
    pub text: String,
    pub relevance_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            DocumentStatus::Draft,
            DocumentStatus::Scanning,
            DocumentStatus::Scanned,
            DocumentStatus::PendingMetadata,
            DocumentStatus::Published,
            DocumentStatus::Rejected,
        ] {
            assert_eq!(DocumentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(DocumentStatus::parse("archived"), None);
    }

    #[test]
    fn locator_encode_decode() {
        let loc = Locator::new(3, 1);
        assert_eq!(loc.encode(), "p3#1");
        assert_eq!(Locator::decode("p3#1"), Some(loc));
        assert_eq!(Locator::decode("3#1"), None);
        assert_eq!(Locator::decode("p3"), None);
    }

    #[test]
    fn locator_orders_by_page_then_index() {
        let a = Locator::new(1, 5);
        let b = Locator::new(2, 0);
        let c = Locator::new(2, 1);
        assert!(a < b && b < c);
    }
}
