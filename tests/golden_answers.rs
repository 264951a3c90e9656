//! Golden answer tests: creation, trust promotion, feedback, filtered listing.

use std::sync::Arc;

use tempfile::TempDir;

use sourcebook::answers::{AnswerFilter, NewGoldenAnswer, TrustLabel};
use sourcebook::config::Config;
use sourcebook::db;
use sourcebook::error::CoreError;
use sourcebook::migrate;
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

fn qa(question: &str, tags: &[&str]) -> NewGoldenAnswer {
    NewGoldenAnswer {
        question: question.to_string(),
        answer: format!("canonical answer to: {}", question),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        source_document_ids: vec![],
    }
}

#[tokio::test]
async fn new_answers_start_as_assumptions() {
    let env = setup().await;
    let created = env
        .state
        .answers
        .create(qa("how do I reset my badge", &["facilities"]))
        .await
        .unwrap();

    assert_eq!(created.trust_label, TrustLabel::Assumption);
    assert_eq!(created.usage_count, 0);
    assert_eq!(created.helpful_count, 0);
    assert!(created.verified_by.is_none());
    assert!(created.verified_at.is_none());
    assert_eq!(created.tags, vec!["facilities"]);

    let fetched = env.state.answers.get(&created.id).await.unwrap();
    assert_eq!(fetched.question, "how do I reset my badge");
}

#[tokio::test]
async fn blank_question_or_answer_is_rejected() {
    let env = setup().await;

    let mut blank_question = qa("valid", &[]);
    blank_question.question = "   ".to_string();
    let err = env.state.answers.create(blank_question).await.unwrap_err();
    assert!(matches!(err, CoreError::Invalid(_)));

    let mut blank_answer = qa("valid", &[]);
    blank_answer.answer = String::new();
    let err = env.state.answers.create(blank_answer).await.unwrap_err();
    assert!(matches!(err, CoreError::Invalid(_)));
}

#[tokio::test]
async fn unknown_answer_is_not_found() {
    let env = setup().await;
    let err = env.state.answers.get("no-such-id").await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));

    let err = env.state.answers.mark_helpful("no-such-id").await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
}

#[tokio::test]
async fn helpful_feedback_increments_both_counters() {
    let env = setup().await;
    let created = env.state.answers.create(qa("vpn setup", &[])).await.unwrap();

    env.state.answers.mark_helpful(&created.id).await.unwrap();
    let after = env.state.answers.mark_helpful(&created.id).await.unwrap();

    assert_eq!(after.helpful_count, 2);
    assert_eq!(after.usage_count, 2);
}

#[tokio::test]
async fn trust_promotion_records_the_verifier() {
    let env = setup().await;
    let created = env.state.answers.create(qa("expense policy", &[])).await.unwrap();

    let verified = env
        .state
        .answers
        .set_trust(&created.id, TrustLabel::Verified, "auditor@corp")
        .await
        .unwrap();
    assert_eq!(verified.trust_label, TrustLabel::Verified);
    assert_eq!(verified.verified_by.as_deref(), Some("auditor@corp"));
    assert!(verified.verified_at.is_some());

    // Demoting back to the unvetted state is not a promotion path
    let err = env
        .state
        .answers
        .set_trust(&created.id, TrustLabel::Assumption, "auditor@corp")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Invalid(_)));

    let err = env
        .state
        .answers
        .set_trust(&created.id, TrustLabel::Deprecated, "  ")
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Invalid(_)));
}

#[tokio::test]
async fn listing_filters_by_trust_label_and_tag() {
    let env = setup().await;
    let a = env.state.answers.create(qa("question a", &["hr"])).await.unwrap();
    let b = env.state.answers.create(qa("question b", &["it"])).await.unwrap();
    env.state.answers.create(qa("question c", &["hr", "it"])).await.unwrap();

    env.state
        .answers
        .set_trust(&a.id, TrustLabel::Policy, "auditor@corp")
        .await
        .unwrap();

    let policy = env
        .state
        .answers
        .list(AnswerFilter {
            trust_label: Some(TrustLabel::Policy),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(policy.len(), 1);
    assert_eq!(policy[0].id, a.id);

    let it_tagged = env
        .state
        .answers
        .list(AnswerFilter {
            tag: Some("it".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(it_tagged.len(), 2);
    assert!(it_tagged.iter().all(|ans| ans.tags.iter().any(|t| t == "it")));

    // Usage-heavy answers surface first
    env.state.answers.mark_helpful(&b.id).await.unwrap();
    let all = env.state.answers.list(AnswerFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].id, b.id);
}

#[tokio::test]
async fn list_limit_is_clamped() {
    let env = setup().await;
    for i in 0..3 {
        env.state.answers.create(qa(&format!("question {}", i), &[])).await.unwrap();
    }

    let one = env
        .state
        .answers
        .list(AnswerFilter {
            limit: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(one.len(), 1);

    // A nonsensical limit falls back to the minimum rather than erroring
    let clamped = env
        .state
        .answers
        .list(AnswerFilter {
            limit: Some(-5),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(clamped.len(), 1);
}
