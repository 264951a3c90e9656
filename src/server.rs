//! JSON HTTP API over the pipeline, context, and chat engines.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Multipart upload; returns the draft record |
//! | `GET`  | `/documents` | List documents, filterable by status/classification |
//! | `GET`  | `/documents/{id}` | Fetch one document |
//! | `GET`  | `/documents/{id}/scan` | Latest scan progress and findings |
//! | `POST` | `/documents/{id}/scan/cancel` | Cancel the in-flight scan |
//! | `POST` | `/documents/{id}/rescan` | Re-run the scan from `draft` |
//! | `POST` | `/documents/{id}/metadata` | Submit reviewer metadata / publish |
//! | `POST` | `/documents/{id}/reject` | Reviewer rejection |
//! | `PUT/POST` | `/sessions/{id}/context` | Replace the session's active sources |
//! | `POST` | `/sessions/{id}/context/toggle` | Toggle one source |
//! | `GET`  | `/sessions/{id}/context` | Current active set |
//! | `POST` | `/sessions/{id}/messages` | Run a chat turn |
//! | `GET`  | `/sessions/{id}/messages` | Full transcript with citations |
//! | `POST` | `/answers` | Create a golden answer |
//! | `GET`  | `/answers` | List golden answers (trust label / tag filters) |
//! | `GET`  | `/answers/{id}` | Fetch one golden answer |
//! | `POST` | `/answers/{id}/helpful` | Record reader feedback |
//! | `POST` | `/answers/{id}/trust` | Promote or deprecate an answer |
//! | `GET`  | `/stats` | Corpus counters |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "state changed concurrently" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_eligible` (403), `not_found` (404),
//! `conflict` / `already_scanning` (409), `invalid_transition` (422),
//! `internal` (500), `timeout` (504).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::answers::{AnswerFilter, GoldenAnswer, GoldenAnswerStore, NewGoldenAnswer, TrustLabel};
use crate::blob::FsBlobStore;
use crate::chat::{ChatEngine, ExtractiveComposer};
use crate::config::Config;
use crate::context::ContextManager;
use crate::db;
use crate::error::CoreError;
use crate::migrate;
use crate::models::{Classification, Document, DocumentStatus, Message, ScanResult};
use crate::pipeline::{MetadataSubmission, UploadPipeline, UploadRequest};
use crate::retrieval::{RetrievalEngine, TermOverlapScorer};
use crate::scan::{PatternScanner, ScanEngine};
use crate::store::{DocumentFilter, DocumentStore};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: DocumentStore,
    pub pipeline: UploadPipeline,
    pub context: ContextManager,
    pub chat: ChatEngine,
    pub answers: GoldenAnswerStore,
    pub config: Arc<Config>,
}

impl AppState {
    /// Wires the default engine stack over an already-migrated pool.
    pub fn build(pool: sqlx::SqlitePool, config: Arc<Config>) -> Self {
        let store = DocumentStore::new(pool.clone());
        let blobs = Arc::new(FsBlobStore::new(config.storage.root.clone()));
        let scans = ScanEngine::new(
            pool.clone(),
            Arc::new(PatternScanner::new(&config.scan)),
            config.scan.clone(),
        );
        let pipeline = UploadPipeline::new(store.clone(), blobs, scans, config.clone());
        let context = ContextManager::new(store.clone());
        let retrieval = RetrievalEngine::new(
            pool.clone(),
            Arc::new(TermOverlapScorer),
            config.retrieval.clone(),
        );
        let chat = ChatEngine::new(
            pool.clone(),
            context.clone(),
            retrieval,
            Arc::new(ExtractiveComposer),
            config.chat.clone(),
            config.retrieval.top_k,
        );
        let answers = GoldenAnswerStore::new(pool);
        Self {
            store,
            pipeline,
            context,
            chat,
            answers,
            config,
        }
    }
}

/// Connects, migrates, and serves on `[server].bind` until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let config = Arc::new(config.clone());

    let pool = db::connect(&config).await?;
    migrate::run_migrations(&pool).await?;

    let state = AppState::build(pool, config);
    let app = router(state);

    info!(bind = %bind_addr, "listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/documents", post(handle_upload).get(handle_list_documents))
        .route("/documents/{id}", get(handle_get_document))
        .route("/documents/{id}/scan", get(handle_scan_status))
        .route("/documents/{id}/scan/cancel", post(handle_cancel_scan))
        .route("/documents/{id}/rescan", post(handle_rescan))
        .route("/documents/{id}/metadata", post(handle_metadata))
        .route("/documents/{id}/reject", post(handle_reject))
        .route(
            "/sessions/{id}/context",
            post(handle_set_context)
                .put(handle_set_context)
                .get(handle_get_context),
        )
        .route("/sessions/{id}/context/toggle", post(handle_toggle_context))
        .route(
            "/sessions/{id}/messages",
            post(handle_chat_turn).get(handle_list_messages),
        )
        .route(
            "/answers",
            post(handle_create_answer).get(handle_list_answers),
        )
        .route("/answers/{id}", get(handle_get_answer))
        .route("/answers/{id}/helpful", post(handle_mark_helpful))
        .route("/answers/{id}/trust", post(handle_set_trust))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error type that converts into an Axum HTTP response.
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(e: CoreError) -> Self {
        let (status, code) = match &e {
            CoreError::Conflict => (StatusCode::CONFLICT, "conflict"),
            CoreError::AlreadyScanning(_) => (StatusCode::CONFLICT, "already_scanning"),
            CoreError::InvalidTransition { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "invalid_transition")
            }
            CoreError::NotEligible(_) => (StatusCode::FORBIDDEN, "not_eligible"),
            CoreError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::Invalid(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            CoreError::Db(_) | CoreError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        AppError {
            status,
            code,
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

// ============ Documents ============

/// Wire form of a document record; storage internals stay private.
#[derive(Serialize)]
struct DocumentResponse {
    #[serde(rename = "documentId")]
    document_id: String,
    version: i64,
    title: String,
    #[serde(rename = "contentType")]
    content_type: String,
    #[serde(rename = "sizeBytes")]
    size_bytes: i64,
    status: DocumentStatus,
    #[serde(rename = "uploadedBy", skip_serializing_if = "Option::is_none")]
    uploaded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    classification: Option<Classification>,
    #[serde(rename = "reviewDate", skip_serializing_if = "Option::is_none")]
    review_date: Option<i64>,
    tags: Vec<String>,
    #[serde(rename = "createdAt")]
    created_at: i64,
    #[serde(rename = "updatedAt")]
    updated_at: i64,
}

impl From<Document> for DocumentResponse {
    fn from(d: Document) -> Self {
        Self {
            document_id: d.id,
            version: d.version,
            title: d.title,
            content_type: d.content_type,
            size_bytes: d.size_bytes,
            status: d.status,
            uploaded_by: d.uploaded_by,
            owner: d.owner,
            classification: d.classification,
            review_date: d.review_date,
            tags: d.tags,
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DocumentResponse>), AppError> {
    let mut title: Option<String> = None;
    let mut uploader: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut bytes: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("malformed multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("title") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| bad_request(e.to_string()))?;
                title = Some(value);
            }
            Some("uploader") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| bad_request(e.to_string()))?;
                uploader = Some(value);
            }
            Some("file") => {
                content_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().map(str::to_string);
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(e.to_string()))?;
                if title.is_none() {
                    title = file_name;
                }
                bytes = Some(data.to_vec());
            }
            _ => {}
        }
    }

    let req = UploadRequest {
        title: title.ok_or_else(|| bad_request("missing title"))?,
        content_type: content_type.ok_or_else(|| bad_request("file part must carry a content type"))?,
        bytes: bytes.ok_or_else(|| bad_request("missing file part"))?,
        uploader,
    };

    let doc = state.pipeline.upload(req).await?;
    Ok((StatusCode::CREATED, Json(doc.into())))
}

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    classification: Option<String>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<DocumentResponse>>, AppError> {
    let status = match q.status.as_deref() {
        Some(s) => Some(
            DocumentStatus::parse(s).ok_or_else(|| bad_request(format!("unknown status: {}", s)))?,
        ),
        None => None,
    };
    let classification = match q.classification.as_deref() {
        Some(s) => Some(
            Classification::parse(s)
                .ok_or_else(|| bad_request(format!("unknown classification: {}", s)))?,
        ),
        None => None,
    };

    let docs = state
        .store
        .list(DocumentFilter {
            status,
            classification,
        })
        .await?;
    Ok(Json(docs.into_iter().map(Into::into).collect()))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let doc = state.store.get(&id).await?;
    Ok(Json(doc.into()))
}

// ============ Scans ============

async fn handle_scan_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScanResult>, AppError> {
    // 404 for unknown documents before looking at scans
    state.store.get(&id).await?;
    let scan = state
        .store
        .latest_scan(&id)
        .await?
        .ok_or_else(|| CoreError::NotFound(format!("no scan for document {}", id)))?;
    Ok(Json(scan))
}

async fn handle_cancel_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let doc = state.pipeline.cancel_scan(&id).await?;
    Ok(Json(doc.into()))
}

async fn handle_rescan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let doc = state.pipeline.rescan(&id).await?;
    Ok(Json(doc.into()))
}

// ============ Metadata review ============

#[derive(Deserialize)]
struct MetadataRequest {
    owner: String,
    classification: String,
    #[serde(rename = "reviewDate")]
    review_date: i64,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(rename = "acknowledgeFindings", default)]
    acknowledge_findings: bool,
}

async fn handle_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MetadataRequest>,
) -> Result<Json<DocumentResponse>, AppError> {
    let classification = Classification::parse(&req.classification)
        .ok_or_else(|| bad_request(format!("unknown classification: {}", req.classification)))?;
    let doc = state
        .pipeline
        .submit_metadata(
            &id,
            MetadataSubmission {
                owner: req.owner,
                classification,
                review_date: req.review_date,
                tags: req.tags,
                acknowledge_findings: req.acknowledge_findings,
            },
        )
        .await?;
    Ok(Json(doc.into()))
}

async fn handle_reject(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentResponse>, AppError> {
    let doc = state.pipeline.reject(&id).await?;
    Ok(Json(doc.into()))
}

// ============ Session context ============

#[derive(Deserialize)]
struct SetContextRequest {
    #[serde(rename = "documentIds")]
    document_ids: Vec<String>,
}

#[derive(Deserialize)]
struct ToggleContextRequest {
    #[serde(rename = "documentId")]
    document_id: String,
}

#[derive(Serialize)]
struct ContextResponse {
    #[serde(rename = "documentIds")]
    document_ids: Vec<String>,
}

async fn handle_set_context(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<SetContextRequest>,
) -> Result<Json<ContextResponse>, AppError> {
    let active = state
        .context
        .set_active(&session_id, &req.document_ids)
        .await?;
    Ok(Json(ContextResponse {
        document_ids: active.into_iter().collect(),
    }))
}

async fn handle_toggle_context(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ToggleContextRequest>,
) -> Result<Json<ContextResponse>, AppError> {
    let active = state.context.toggle(&session_id, &req.document_id).await?;
    Ok(Json(ContextResponse {
        document_ids: active.into_iter().collect(),
    }))
}

async fn handle_get_context(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ContextResponse>, AppError> {
    let active = state.context.active_set(&session_id).await?;
    Ok(Json(ContextResponse {
        document_ids: active.into_iter().collect(),
    }))
}

// ============ Chat ============

#[derive(Deserialize)]
struct ChatRequest {
    text: String,
}

async fn handle_chat_turn(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<Message>, AppError> {
    let message = state.chat.run_turn(&session_id, &req.text).await?;
    Ok(Json(message))
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<Message>>, AppError> {
    let messages = state.chat.messages(&session_id).await?;
    Ok(Json(messages))
}

// ============ Golden answers ============

#[derive(Deserialize)]
struct CreateAnswerRequest {
    question: String,
    answer: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(rename = "sourceDocumentIds", default)]
    source_document_ids: Vec<String>,
}

#[derive(Deserialize)]
struct ListAnswersQuery {
    #[serde(rename = "trustLabel")]
    trust_label: Option<String>,
    tag: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct SetTrustRequest {
    #[serde(rename = "trustLabel")]
    trust_label: String,
    #[serde(rename = "verifiedBy")]
    verified_by: String,
}

async fn handle_create_answer(
    State(state): State<AppState>,
    Json(req): Json<CreateAnswerRequest>,
) -> Result<(StatusCode, Json<GoldenAnswer>), AppError> {
    let answer = state
        .answers
        .create(NewGoldenAnswer {
            question: req.question,
            answer: req.answer,
            tags: req.tags,
            source_document_ids: req.source_document_ids,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(answer)))
}

async fn handle_list_answers(
    State(state): State<AppState>,
    Query(q): Query<ListAnswersQuery>,
) -> Result<Json<Vec<GoldenAnswer>>, AppError> {
    let trust_label = match q.trust_label.as_deref() {
        Some(s) => Some(
            TrustLabel::parse(s).ok_or_else(|| bad_request(format!("unknown trust label: {}", s)))?,
        ),
        None => None,
    };
    let answers = state
        .answers
        .list(AnswerFilter {
            trust_label,
            tag: q.tag,
            limit: q.limit,
        })
        .await?;
    Ok(Json(answers))
}

async fn handle_get_answer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GoldenAnswer>, AppError> {
    let answer = state.answers.get(&id).await?;
    Ok(Json(answer))
}

async fn handle_mark_helpful(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<GoldenAnswer>, AppError> {
    let answer = state.answers.mark_helpful(&id).await?;
    Ok(Json(answer))
}

async fn handle_set_trust(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetTrustRequest>,
) -> Result<Json<GoldenAnswer>, AppError> {
    let label = TrustLabel::parse(&req.trust_label)
        .ok_or_else(|| bad_request(format!("unknown trust label: {}", req.trust_label)))?;
    let answer = state.answers.set_trust(&id, label, &req.verified_by).await?;
    Ok(Json(answer))
}

// ============ GET /stats ============

#[derive(Serialize)]
struct StatsResponse {
    documents: i64,
    published: i64,
    passages: i64,
    sessions: i64,
    messages: i64,
    #[serde(rename = "goldenAnswers")]
    golden_answers: i64,
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let pool = state.store.pool();
    let row = sqlx::query(
        r#"
        SELECT
            (SELECT COUNT(*) FROM documents) AS documents,
            (SELECT COUNT(*) FROM documents WHERE status = 'published') AS published,
            (SELECT COUNT(*) FROM passages) AS passages,
            (SELECT COUNT(*) FROM sessions) AS sessions,
            (SELECT COUNT(*) FROM messages) AS messages,
            (SELECT COUNT(*) FROM golden_answers) AS golden_answers
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(CoreError::from)?;

    Ok(Json(StatsResponse {
        documents: row.get("documents"),
        published: row.get("published"),
        passages: row.get("passages"),
        sessions: row.get("sessions"),
        messages: row.get("messages"),
        golden_answers: row.get("golden_answers"),
    }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
