//! Curated golden answers.
//!
//! A golden answer is a reviewed question/answer pair kept alongside the
//! document corpus: the canonical response to a recurring question, with a
//! trust label recording how far it has been vetted. Answers reference their
//! source documents but live outside the upload pipeline — creating one does
//! not touch document state.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::error::{CoreError, Result};

/// How far an answer has been vetted. `deprecated` answers stay on record but
/// should no longer be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLabel {
    Assumption,
    Verified,
    Policy,
    Deprecated,
}

impl TrustLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLabel::Assumption => "assumption",
            TrustLabel::Verified => "verified",
            TrustLabel::Policy => "policy",
            TrustLabel::Deprecated => "deprecated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "assumption" => Some(TrustLabel::Assumption),
            "verified" => Some(TrustLabel::Verified),
            "policy" => Some(TrustLabel::Policy),
            "deprecated" => Some(TrustLabel::Deprecated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoldenAnswer {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub trust_label: TrustLabel,
    pub tags: Vec<String>,
    pub source_document_ids: Vec<String>,
    pub verified_by: Option<String>,
    pub verified_at: Option<i64>,
    pub usage_count: i64,
    pub helpful_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields supplied at creation; answers start as `assumption` until vetted.
#[derive(Debug, Clone)]
pub struct NewGoldenAnswer {
    pub question: String,
    pub answer: String,
    pub tags: Vec<String>,
    pub source_document_ids: Vec<String>,
}

/// Optional filters for [`GoldenAnswerStore::list`].
#[derive(Debug, Clone, Default)]
pub struct AnswerFilter {
    pub trust_label: Option<TrustLabel>,
    pub tag: Option<String>,
    pub limit: Option<i64>,
}

const DEFAULT_LIMIT: i64 = 20;
const MAX_LIMIT: i64 = 100;

#[derive(Clone)]
pub struct GoldenAnswerStore {
    pool: SqlitePool,
}

impl GoldenAnswerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, new: NewGoldenAnswer) -> Result<GoldenAnswer> {
        if new.question.trim().is_empty() {
            return Err(CoreError::Invalid("question must not be empty".to_string()));
        }
        if new.answer.trim().is_empty() {
            return Err(CoreError::Invalid("answer must not be empty".to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = chrono::Utc::now().timestamp();
        let tags_json = serde_json::to_string(&new.tags).unwrap_or_else(|_| "[]".to_string());
        let sources_json =
            serde_json::to_string(&new.source_document_ids).unwrap_or_else(|_| "[]".to_string());

        sqlx::query(
            r#"
            INSERT INTO golden_answers
                (id, question, answer, trust_label, tags_json, source_document_ids_json,
                 usage_count, helpful_count, created_at, updated_at)
            VALUES (?, ?, ?, 'assumption', ?, ?, 0, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(new.question.trim())
        .bind(new.answer.trim())
        .bind(&tags_json)
        .bind(&sources_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        info!(answer_id = %id, "golden answer created");
        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<GoldenAnswer> {
        let row = sqlx::query("SELECT * FROM golden_answers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => answer_from_row(&row),
            None => Err(CoreError::NotFound(format!("golden answer {}", id))),
        }
    }

    /// Most-used answers first, so the ones actually serving traffic surface.
    pub async fn list(&self, filter: AnswerFilter) -> Result<Vec<GoldenAnswer>> {
        let mut sql = String::from("SELECT * FROM golden_answers WHERE 1=1");
        if filter.trust_label.is_some() {
            sql.push_str(" AND trust_label = ?");
        }
        sql.push_str(" ORDER BY usage_count DESC, created_at DESC, id ASC LIMIT ?");

        let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let mut query = sqlx::query(&sql);
        if let Some(label) = filter.trust_label {
            query = query.bind(label.as_str());
        }
        query = query.bind(limit);

        let rows = query.fetch_all(&self.pool).await?;
        let mut answers: Vec<GoldenAnswer> =
            rows.iter().map(answer_from_row).collect::<Result<_>>()?;

        // Tags are stored as JSON, so the tag filter applies after decoding
        if let Some(tag) = &filter.tag {
            answers.retain(|a| a.tags.iter().any(|t| t == tag));
        }
        Ok(answers)
    }

    /// Records reader feedback. Also counts as a usage.
    pub async fn mark_helpful(&self, id: &str) -> Result<GoldenAnswer> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE golden_answers
            SET helpful_count = helpful_count + 1,
                usage_count = usage_count + 1,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("golden answer {}", id)));
        }
        self.get(id).await
    }

    /// Promotes (or demotes) an answer's trust label and records who vetted
    /// it. `assumption` is the unvetted state and cannot be re-assigned here.
    pub async fn set_trust(
        &self,
        id: &str,
        label: TrustLabel,
        verified_by: &str,
    ) -> Result<GoldenAnswer> {
        if label == TrustLabel::Assumption {
            return Err(CoreError::Invalid(
                "trust label must be verified, policy, or deprecated".to_string(),
            ));
        }
        if verified_by.trim().is_empty() {
            return Err(CoreError::Invalid("verifiedBy must not be empty".to_string()));
        }

        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE golden_answers
            SET trust_label = ?, verified_by = ?, verified_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(label.as_str())
        .bind(verified_by.trim())
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("golden answer {}", id)));
        }
        info!(answer_id = %id, label = label.as_str(), "golden answer trust updated");
        self.get(id).await
    }
}

fn answer_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<GoldenAnswer> {
    let label_raw: String = row.get("trust_label");
    let trust_label = TrustLabel::parse(&label_raw).ok_or_else(|| {
        CoreError::Internal(anyhow::anyhow!("bad trust label in db: {}", label_raw))
    })?;

    let tags_json: String = row.get("tags_json");
    let sources_json: String = row.get("source_document_ids_json");

    Ok(GoldenAnswer {
        id: row.get("id"),
        question: row.get("question"),
        answer: row.get("answer"),
        trust_label,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        source_document_ids: serde_json::from_str(&sources_json).unwrap_or_default(),
        verified_by: row.get("verified_by"),
        verified_at: row.get("verified_at"),
        usage_count: row.get("usage_count"),
        helpful_count: row.get("helpful_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_label_roundtrip() {
        for label in [
            TrustLabel::Assumption,
            TrustLabel::Verified,
            TrustLabel::Policy,
            TrustLabel::Deprecated,
        ] {
            assert_eq!(TrustLabel::parse(label.as_str()), Some(label));
        }
        assert_eq!(TrustLabel::parse("golden"), None);
    }
}
