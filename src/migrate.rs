use anyhow::Result;
use sqlx::SqlitePool;

/// Creates all tables. Idempotent; safe to run at every startup.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Current head of each document lineage
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            lineage_id TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            title TEXT NOT NULL,
            blob_ref TEXT NOT NULL,
            content_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            uploaded_by TEXT,
            owner TEXT,
            classification TEXT,
            status TEXT NOT NULL DEFAULT 'draft',
            review_date INTEGER,
            tags_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(lineage_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only version chain; never updated or deleted
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_versions (
            lineage_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            title TEXT NOT NULL,
            owner TEXT,
            classification TEXT,
            review_date INTEGER,
            tags_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            PRIMARY KEY (lineage_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Full scan history, 1:N per document
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_results (
            scan_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            progress INTEGER NOT NULL DEFAULT 0,
            outcome TEXT NOT NULL DEFAULT 'running',
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_findings (
            scan_id TEXT NOT NULL,
            ord INTEGER NOT NULL,
            kind TEXT NOT NULL,
            location TEXT NOT NULL,
            snippet TEXT NOT NULL,
            PRIMARY KEY (scan_id, ord),
            FOREIGN KEY (scan_id) REFERENCES scan_results(scan_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Active source set per session (the retrieval scope)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_sources (
            session_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            PRIMARY KEY (session_id, document_id),
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // seq is assigned at delivery time and defines message order
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            text TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(session_id, seq),
            FOREIGN KEY (session_id) REFERENCES sessions(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS citations (
            message_id TEXT NOT NULL,
            rank INTEGER NOT NULL,
            document_id TEXT NOT NULL,
            document_version INTEGER NOT NULL,
            locator TEXT NOT NULL,
            quoted_snippet TEXT NOT NULL,
            PRIMARY KEY (message_id, rank),
            FOREIGN KEY (message_id) REFERENCES messages(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Candidate passages indexed at publish time
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS passages (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            document_version INTEGER NOT NULL,
            page INTEGER NOT NULL,
            page_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            UNIQUE(document_id, page, page_index),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Curated question/answer pairs; independent of document lifecycle
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS golden_answers (
            id TEXT PRIMARY KEY,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            trust_label TEXT NOT NULL DEFAULT 'assumption',
            tags_json TEXT NOT NULL DEFAULT '[]',
            source_document_ids_json TEXT NOT NULL DEFAULT '[]',
            verified_by TEXT,
            verified_at INTEGER,
            usage_count INTEGER NOT NULL DEFAULT 0,
            helpful_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='passages_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE passages_fts USING fts5(
                passage_id UNINDEXED,
                document_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_lineage ON documents(lineage_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scan_results_document ON scan_results(document_id, started_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_passages_document ON passages(document_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_golden_answers_trust ON golden_answers(trust_label)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
