//! Session context and chat turn tests: scoping, citations, transcripts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use sourcebook::chat::{AnswerComposer, ChatEngine, ComposedAnswer, ExtractiveComposer};
use sourcebook::config::Config;
use sourcebook::db;
use sourcebook::error::CoreError;
use sourcebook::migrate;
use sourcebook::models::{Classification, DocumentStatus, RetrievalPassage, Role};
use sourcebook::pipeline::{MetadataSubmission, UploadRequest};
use sourcebook::retrieval::{RetrievalEngine, TermOverlapScorer};
use sourcebook::server::AppState;

struct TestEnv {
    _tmp: TempDir,
    state: AppState,
}

async fn setup() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let config_text = format!(
        r#"
[db]
path = "{root}/data/sbk.sqlite"

[storage]
root = "{root}/blobs"

[server]
bind = "127.0.0.1:0"

[scan]
step_millis = 1

[passages]
max_chars = 400
"#,
        root = tmp.path().display(),
    );
    let cfg: Config = toml::from_str(&config_text).unwrap();
    let cfg = Arc::new(cfg);

    let pool = db::connect(&cfg).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let state = AppState::build(pool, cfg);
    TestEnv { _tmp: tmp, state }
}

/// Uploads a plain-text document and drives it all the way to `published`.
async fn publish_text(env: &TestEnv, title: &str, body: &str) -> String {
    let doc = env
        .state
        .pipeline
        .upload(UploadRequest {
            title: title.to_string(),
            content_type: "text/plain".to_string(),
            bytes: body.as_bytes().to_vec(),
            uploader: Some("librarian@corp".to_string()),
        })
        .await
        .unwrap();

    for _ in 0..250 {
        let current = env.state.store.get(&doc.id).await.unwrap();
        if current.status == DocumentStatus::PendingMetadata {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    env.state
        .pipeline
        .submit_metadata(
            &doc.id,
            MetadataSubmission {
                owner: "librarian@corp".to_string(),
                classification: Classification::Public,
                review_date: chrono::Utc::now().timestamp() + 86_400,
                tags: vec![],
                acknowledge_findings: true,
            },
        )
        .await
        .unwrap();

    doc.id
}

#[tokio::test]
async fn grounded_turn_cites_only_active_sources() {
    let env = setup().await;
    let kube = publish_text(
        &env,
        "kubernetes guide",
        "Kubernetes deployments roll out new pods gradually.\n\n\
         A deployment rollback restores the previous replica set.",
    )
    .await;
    let pastry = publish_text(
        &env,
        "pastry handbook",
        "Laminated dough needs cold butter folded in thirds.\n\n\
         Croissants proof for two hours before baking.",
    )
    .await;

    env.state
        .context
        .set_active("s1", &[kube.clone()])
        .await
        .unwrap();

    let reply = env
        .state
        .chat
        .run_turn("s1", "how do kubernetes deployments roll out")
        .await
        .unwrap();

    assert_eq!(reply.role, Role::Assistant);
    assert!(!reply.citations.is_empty());
    for c in &reply.citations {
        assert_eq!(c.document_id, kube);
        assert_ne!(c.document_id, pastry);
        // Publish bumps the version; citations pin the published one
        assert_eq!(c.document_version, 2);
        assert!(c.locator.page >= 1);
        assert!(!c.quoted_snippet.is_empty());
    }
    let ranks: Vec<i64> = reply.citations.iter().map(|c| c.rank).collect();
    assert_eq!(ranks, (1..=ranks.len() as i64).collect::<Vec<_>>());
}

#[tokio::test]
async fn transcript_preserves_turn_order() {
    let env = setup().await;
    let doc = publish_text(&env, "notes", "The office wifi password rotates monthly.").await;
    env.state.context.set_active("s1", &[doc]).await.unwrap();

    env.state
        .chat
        .run_turn("s1", "when does the wifi password rotate")
        .await
        .unwrap();
    env.state
        .chat
        .run_turn("s1", "what about the guest network")
        .await
        .unwrap();

    let transcript = env.state.chat.messages("s1").await.unwrap();
    assert_eq!(transcript.len(), 4);
    let seqs: Vec<i64> = transcript.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert_eq!(transcript[0].role, Role::User);
    assert_eq!(transcript[1].role, Role::Assistant);
    assert!(transcript[0].citations.is_empty());
}

#[tokio::test]
async fn empty_active_set_delivers_without_citations() {
    let env = setup().await;
    publish_text(&env, "unselected", "This document is published but not selected.").await;

    let reply = env
        .state
        .chat
        .run_turn("s-empty", "tell me about anything")
        .await
        .unwrap();
    assert_eq!(reply.role, Role::Assistant);
    assert!(reply.citations.is_empty());
}

#[tokio::test]
async fn off_topic_question_yields_no_citations() {
    let env = setup().await;
    let pastry = publish_text(
        &env,
        "pastry handbook",
        "Laminated dough needs cold butter folded in thirds.",
    )
    .await;
    env.state.context.set_active("s1", &[pastry]).await.unwrap();

    let reply = env
        .state
        .chat
        .run_turn("s1", "quantum chromodynamics lattice simulations")
        .await
        .unwrap();
    assert!(reply.citations.is_empty());
}

#[tokio::test]
async fn unpublished_documents_are_not_eligible() {
    let env = setup().await;
    let draft = env
        .state
        .pipeline
        .upload(UploadRequest {
            title: "still scanning".to_string(),
            content_type: "text/plain".to_string(),
            bytes: b"freshly uploaded".to_vec(),
            uploader: None,
        })
        .await
        .unwrap();

    let err = env
        .state
        .context
        .set_active("s1", &[draft.id.clone()])
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotEligible(_)));

    // The failed replace changed nothing
    let active = env.state.context.active_set("s1").await.unwrap();
    assert!(active.is_empty());
}

#[tokio::test]
async fn toggle_adds_then_removes() {
    let env = setup().await;
    let doc = publish_text(&env, "togglable", "Some published content.").await;

    let after_add = env.state.context.toggle("s1", &doc).await.unwrap();
    assert!(after_add.contains(&doc));

    let after_remove = env.state.context.toggle("s1", &doc).await.unwrap();
    assert!(after_remove.is_empty());
}

#[tokio::test]
async fn sessions_are_isolated() {
    let env = setup().await;
    let kube = publish_text(&env, "kube", "Kubernetes pods restart on failure.").await;
    let pastry = publish_text(&env, "pastry", "Croissants need laminated dough.").await;

    env.state.context.set_active("s-a", &[kube.clone()]).await.unwrap();
    env.state
        .context
        .set_active("s-b", &[pastry.clone()])
        .await
        .unwrap();

    let a = env
        .state
        .chat
        .run_turn("s-a", "kubernetes pods restart")
        .await
        .unwrap();
    let b = env
        .state
        .chat
        .run_turn("s-b", "laminated dough croissants")
        .await
        .unwrap();

    assert!(a.citations.iter().all(|c| c.document_id == kube));
    assert!(b.citations.iter().all(|c| c.document_id == pastry));
    assert_eq!(env.state.chat.messages("s-a").await.unwrap().len(), 2);
    assert_eq!(env.state.chat.messages("s-b").await.unwrap().len(), 2);
}

#[tokio::test]
async fn selection_change_applies_to_the_next_turn() {
    let env = setup().await;
    let kube = publish_text(&env, "kube", "Kubernetes deployments roll out pods.").await;
    let pastry = publish_text(&env, "pastry", "Croissants need laminated dough.").await;

    env.state.context.set_active("s1", &[kube.clone()]).await.unwrap();
    let first = env
        .state
        .chat
        .run_turn("s1", "kubernetes deployments")
        .await
        .unwrap();
    assert!(first.citations.iter().all(|c| c.document_id == kube));

    env.state
        .context
        .set_active("s1", &[pastry.clone()])
        .await
        .unwrap();
    let second = env
        .state
        .chat
        .run_turn("s1", "laminated croissant dough")
        .await
        .unwrap();
    assert!(!second.citations.is_empty());
    assert!(second.citations.iter().all(|c| c.document_id == pastry));
}

/// Composer that pauses mid-turn: signals `entered` when composition starts
/// and waits for `release` before delegating, so a test can change state
/// while a turn is in flight.
struct GatedComposer {
    inner: ExtractiveComposer,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl AnswerComposer for GatedComposer {
    async fn compose(
        &self,
        query: &str,
        passages: &[RetrievalPassage],
    ) -> anyhow::Result<ComposedAnswer> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.compose(query, passages).await
    }
}

#[tokio::test]
async fn mid_turn_selection_change_keeps_the_start_snapshot() {
    let env = setup().await;
    let kube = publish_text(
        &env,
        "kubernetes guide",
        "Kubernetes deployments roll out new pods gradually.",
    )
    .await;
    let pastry = publish_text(
        &env,
        "pastry handbook",
        "Croissants need laminated dough and cold butter.",
    )
    .await;

    env.state.context.set_active("s1", &[kube.clone()]).await.unwrap();

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let retrieval = RetrievalEngine::new(
        env.state.store.pool().clone(),
        Arc::new(TermOverlapScorer),
        env.state.config.retrieval.clone(),
    );
    let engine = ChatEngine::new(
        env.state.store.pool().clone(),
        env.state.context.clone(),
        retrieval,
        Arc::new(GatedComposer {
            inner: ExtractiveComposer,
            entered: entered.clone(),
            release: release.clone(),
        }),
        env.state.config.chat.clone(),
        env.state.config.retrieval.top_k,
    );

    let turn = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run_turn("s1", "kubernetes deployments roll out").await }
    });

    // The turn is paused inside composition; swap the active set under it
    entered.notified().await;
    env.state
        .context
        .set_active("s1", &[pastry.clone()])
        .await
        .unwrap();
    release.notify_one();

    let reply = turn.await.unwrap().unwrap();
    assert!(!reply.citations.is_empty());
    for c in &reply.citations {
        assert_eq!(c.document_id, kube, "citation left the start-of-turn snapshot");
        assert_eq!(c.document_version, 2);
    }

    // The swap takes effect on the next turn
    let next = env
        .state
        .chat
        .run_turn("s1", "laminated croissant dough")
        .await
        .unwrap();
    assert!(!next.citations.is_empty());
    assert!(next.citations.iter().all(|c| c.document_id == pastry));
}

#[tokio::test]
async fn blank_message_is_rejected() {
    let env = setup().await;
    let err = env.state.chat.run_turn("s1", "   ").await.unwrap_err();
    assert!(matches!(err, CoreError::Invalid(_)));
    assert!(env.state.chat.messages("s1").await.unwrap().is_empty());
}
