//! Asynchronous content scanning (DLP) for uploaded documents.
//!
//! Each upload gets its own scan task. The scan emits a monotonically
//! increasing progress stream (0–100), persists progress as it advances, and
//! terminates exactly once with `clean` or `flagged(findings)`. Cancellation
//! is idempotent and ends the scan `aborted`; an aborted scan never flips the
//! owning document's status — the pipeline reacts to the terminal outcome it
//! receives on the handle.
//!
//! The actual inspection logic is pluggable through [`ContentScanner`]; the
//! built-in [`PatternScanner`] is a small lexical detector standing in for a
//! real DLP library.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ScanConfig;
use crate::error::CoreError;
use crate::models::{Finding, ScanOutcome};

/// What a scanner concluded; no findings means clean.
#[derive(Debug, Clone, Default)]
pub struct ScanVerdict {
    pub findings: Vec<Finding>,
}

/// Raised through `anyhow` when a sink rejects further progress after cancel.
#[derive(Debug)]
pub struct ScanCancelled;

impl std::fmt::Display for ScanCancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("scan cancelled")
    }
}

impl std::error::Error for ScanCancelled {}

/// Progress reporting and cancellation checkpoint handed to scanners.
/// `advance` keeps the published value monotonic and fails once the scan has
/// been cancelled, so well-behaved scanners stop at the next checkpoint.
pub struct ProgressSink {
    tx: watch::Sender<u8>,
    last: AtomicU8,
    cancelled: Arc<AtomicBool>,
}

impl ProgressSink {
    fn new(tx: watch::Sender<u8>, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            tx,
            last: AtomicU8::new(0),
            cancelled,
        }
    }

    pub fn advance(&self, pct: u8) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(ScanCancelled.into());
        }
        let pct = pct.min(100);
        let prev = self.last.fetch_max(pct, Ordering::SeqCst);
        if pct > prev {
            let _ = self.tx.send(pct);
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Pluggable content inspector. Runs on the tokio runtime and may be
/// I/O-bound; it must call [`ProgressSink::advance`] between units of work.
#[async_trait]
pub trait ContentScanner: Send + Sync {
    async fn inspect(&self, pages: &[String], progress: &ProgressSink) -> Result<ScanVerdict>;
}

/// Terminal report delivered to the pipeline through the handle.
#[derive(Debug, Clone)]
pub struct ScanTermination {
    pub scan_id: String,
    pub outcome: ScanOutcome,
    /// Distinguishes a caller cancel from an infrastructure failure; both end
    /// `aborted` but only the failure rejects the document.
    pub cancelled: bool,
}

/// Handle to one in-flight scan.
#[derive(Debug)]
pub struct ScanHandle {
    pub scan_id: String,
    pub document_id: String,
    pub progress: watch::Receiver<u8>,
    /// Resolves exactly once with the terminal outcome.
    pub terminal: oneshot::Receiver<ScanTermination>,
}

struct ActiveScan {
    scan_id: String,
    cancelled: Arc<AtomicBool>,
}

/// Runs and tracks scans; at most one active scan per document lineage.
#[derive(Clone)]
pub struct ScanEngine {
    pool: SqlitePool,
    scanner: Arc<dyn ContentScanner>,
    config: ScanConfig,
    active: Arc<Mutex<HashMap<String, ActiveScan>>>,
}

impl ScanEngine {
    pub fn new(pool: SqlitePool, scanner: Arc<dyn ContentScanner>, config: ScanConfig) -> Self {
        Self {
            pool,
            scanner,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts an asynchronous scan over the document's extracted pages.
    /// Fails with `AlreadyScanning` if the lineage has a scan in flight.
    pub async fn start_scan(
        &self,
        document_id: &str,
        pages: Vec<String>,
    ) -> Result<ScanHandle, CoreError> {
        let scan_id = Uuid::new_v4().to_string();
        let cancelled = Arc::new(AtomicBool::new(false));

        {
            let mut active = self.active.lock().expect("scan registry poisoned");
            if active.contains_key(document_id) {
                return Err(CoreError::AlreadyScanning(document_id.to_string()));
            }
            active.insert(
                document_id.to_string(),
                ActiveScan {
                    scan_id: scan_id.clone(),
                    cancelled: cancelled.clone(),
                },
            );
        }

        let started_at = chrono::Utc::now().timestamp();
        let inserted = sqlx::query(
            r#"
            INSERT INTO scan_results (scan_id, document_id, started_at, progress, outcome)
            VALUES (?, ?, ?, 0, 'running')
            "#,
        )
        .bind(&scan_id)
        .bind(document_id)
        .bind(started_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = inserted {
            // Release the registry slot so the document is not stuck scanning
            self.active
                .lock()
                .expect("scan registry poisoned")
                .remove(document_id);
            return Err(e.into());
        }

        let (progress_tx, progress_rx) = watch::channel(0u8);
        let (terminal_tx, terminal_rx) = oneshot::channel();

        // Persist progress as it advances; terminal rows are never touched.
        let mut persist_rx = progress_rx.clone();
        let persist_pool = self.pool.clone();
        let persist_scan_id = scan_id.clone();
        tokio::spawn(async move {
            while persist_rx.changed().await.is_ok() {
                let pct = *persist_rx.borrow_and_update() as i64;
                let _ = sqlx::query(
                    "UPDATE scan_results SET progress = ? WHERE scan_id = ? AND outcome = 'running'",
                )
                .bind(pct)
                .bind(&persist_scan_id)
                .execute(&persist_pool)
                .await;
            }
        });

        let engine = self.clone();
        let doc_id = document_id.to_string();
        let task_scan_id = scan_id.clone();
        tokio::spawn(async move {
            engine
                .run_scan_task(doc_id, task_scan_id, pages, progress_tx, cancelled, terminal_tx)
                .await;
        });

        info!(document_id, scan_id, "scan started");
        Ok(ScanHandle {
            scan_id,
            document_id: document_id.to_string(),
            progress: progress_rx,
            terminal: terminal_rx,
        })
    }

    /// Requests cancellation. Idempotent: cancelling a finished or unknown
    /// scan is a no-op, not an error.
    pub fn cancel(&self, document_id: &str) {
        let active = self.active.lock().expect("scan registry poisoned");
        if let Some(scan) = active.get(document_id) {
            scan.cancelled.store(true, Ordering::SeqCst);
            info!(document_id, scan_id = %scan.scan_id, "scan cancel requested");
        }
    }

    pub fn is_scanning(&self, document_id: &str) -> bool {
        self.active
            .lock()
            .expect("scan registry poisoned")
            .contains_key(document_id)
    }

    async fn run_scan_task(
        &self,
        document_id: String,
        scan_id: String,
        pages: Vec<String>,
        progress_tx: watch::Sender<u8>,
        cancelled: Arc<AtomicBool>,
        terminal_tx: oneshot::Sender<ScanTermination>,
    ) {
        let sink = ProgressSink::new(progress_tx, cancelled.clone());
        let budget = Duration::from_secs(self.config.timeout_secs);

        let mut attempt = 0u32;
        let verdict = loop {
            match tokio::time::timeout(budget, self.scanner.inspect(&pages, &sink)).await {
                Ok(Ok(verdict)) => break Some(verdict),
                Ok(Err(e)) if e.is::<ScanCancelled>() => break None,
                outcome => {
                    // Scanner error or timeout: transient, retried with backoff
                    if cancelled.load(Ordering::SeqCst) {
                        break None;
                    }
                    if attempt >= self.config.max_retries {
                        match outcome {
                            Ok(Err(e)) => warn!(scan_id, error = %e, "scan failed"),
                            _ => warn!(scan_id, "scan timed out"),
                        }
                        break None;
                    }
                    attempt += 1;
                    warn!(scan_id, attempt, "scan attempt failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                }
            }
        };

        let was_cancelled = cancelled.load(Ordering::SeqCst);
        let outcome = match &verdict {
            Some(v) if v.findings.is_empty() => ScanOutcome::Clean,
            Some(_) => ScanOutcome::Flagged,
            None => ScanOutcome::Aborted,
        };

        if let Err(e) = self
            .finalize(&scan_id, outcome, verdict.as_ref().map(|v| v.findings.as_slice()))
            .await
        {
            warn!(scan_id, error = %e, "failed to persist scan outcome");
        }

        self.active
            .lock()
            .expect("scan registry poisoned")
            .remove(&document_id);

        info!(document_id, scan_id, outcome = outcome.as_str(), "scan finished");
        let _ = terminal_tx.send(ScanTermination {
            scan_id,
            outcome,
            cancelled: was_cancelled,
        });
    }

    /// Writes the terminal row exactly once; the `outcome = 'running'` guard
    /// makes a second finalize (or a late progress write) a no-op.
    async fn finalize(
        &self,
        scan_id: &str,
        outcome: ScanOutcome,
        findings: Option<&[Finding]>,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let updated = if outcome == ScanOutcome::Aborted {
            // Keep the progress reached at abort time
            sqlx::query(
                "UPDATE scan_results SET outcome = 'aborted', completed_at = ? WHERE scan_id = ? AND outcome = 'running'",
            )
            .bind(now)
            .bind(scan_id)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                "UPDATE scan_results SET outcome = ?, completed_at = ?, progress = 100 WHERE scan_id = ? AND outcome = 'running'",
            )
            .bind(outcome.as_str())
            .bind(now)
            .bind(scan_id)
            .execute(&mut *tx)
            .await?
        };

        if updated.rows_affected() > 0 {
            if let Some(findings) = findings {
                for (ord, f) in findings.iter().enumerate() {
                    sqlx::query(
                        "INSERT INTO scan_findings (scan_id, ord, kind, location, snippet) VALUES (?, ?, ?, ?, ?)",
                    )
                    .bind(scan_id)
                    .bind(ord as i64)
                    .bind(&f.kind)
                    .bind(&f.location)
                    .bind(&f.snippet)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

// ============ Built-in scanner ============

/// Lexical detector for obviously sensitive tokens: email-shaped words and
/// long digit runs (account/card-number shaped). A production deployment
/// plugs a real DLP engine in via [`ContentScanner`].
pub struct PatternScanner {
    step: Duration,
}

impl PatternScanner {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            step: Duration::from_millis(config.step_millis),
        }
    }
}

#[async_trait]
impl ContentScanner for PatternScanner {
    async fn inspect(&self, pages: &[String], progress: &ProgressSink) -> Result<ScanVerdict> {
        let total = pages.len().max(1) as u64;
        let mut findings = Vec::new();

        for (idx, page) in pages.iter().enumerate() {
            progress.advance((idx as u64 * 100 / total) as u8)?;
            tokio::time::sleep(self.step).await;
            findings.extend(detect_page(page, idx as i64 + 1));
            debug!(page = idx + 1, hits = findings.len(), "page inspected");
        }

        progress.advance(100)?;
        Ok(ScanVerdict { findings })
    }
}

/// Scans one page's text. Pure so it is testable without the async plumbing.
fn detect_page(text: &str, page_no: i64) -> Vec<Finding> {
    let location = format!("p{}", page_no);
    let mut findings = Vec::new();

    for token in text.split_whitespace() {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '@' && c != '.');
        if looks_like_email(token) {
            findings.push(Finding {
                kind: "email".to_string(),
                location: location.clone(),
                snippet: mask(token),
            });
        } else if looks_like_number_run(token) {
            findings.push(Finding {
                kind: "number-run".to_string(),
                location: location.clone(),
                snippet: mask(token),
            });
        }
    }

    findings
}

fn looks_like_email(token: &str) -> bool {
    let Some(at) = token.find('@') else {
        return false;
    };
    let (local, domain) = token.split_at(at);
    let domain = &domain[1..];
    !local.is_empty() && domain.contains('.') && !domain.ends_with('.')
}

/// Nine or more digits ignoring separators, the shape of account and card
/// numbers.
fn looks_like_number_run(token: &str) -> bool {
    let digits = token.chars().filter(|c| c.is_ascii_digit()).count();
    digits >= 9 && token.chars().all(|c| c.is_ascii_digit() || c == '-' || c == ' ')
}

/// Keeps just enough of the token to be recognizable in a findings report.
fn mask(token: &str) -> String {
    if token.len() <= 4 {
        return "****".to_string();
    }
    let head: String = token.chars().take(2).collect();
    let tail: String = token
        .chars()
        .rev()
        .take(2)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{}…{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_email_tokens() {
        let findings = detect_page("contact alice@example.com for details", 2);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, "email");
        assert_eq!(findings[0].location, "p2");
        assert!(!findings[0].snippet.contains("alice@example.com"));
    }

    #[test]
    fn detects_long_digit_runs() {
        let findings = detect_page("card 4111-1111-1111-1111 on file", 1);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].kind, "number-run");
    }

    #[test]
    fn short_numbers_and_plain_words_are_clean() {
        assert!(detect_page("room 404 opened in 2024", 1).is_empty());
        assert!(detect_page("ordinary prose with no secrets", 1).is_empty());
    }

    #[test]
    fn email_heuristic_edges() {
        assert!(looks_like_email("a@b.co"));
        assert!(!looks_like_email("@example.com"));
        assert!(!looks_like_email("user@nodot"));
        assert!(!looks_like_email("user@trailing."));
    }

    #[tokio::test]
    async fn sink_progress_is_monotonic() {
        let (tx, rx) = watch::channel(0u8);
        let sink = ProgressSink::new(tx, Arc::new(AtomicBool::new(false)));
        sink.advance(40).unwrap();
        sink.advance(20).unwrap(); // lower value must not regress
        assert_eq!(*rx.borrow(), 40);
        sink.advance(200).unwrap(); // clamped
        assert_eq!(*rx.borrow(), 100);
    }

    #[tokio::test]
    async fn sink_rejects_advance_after_cancel() {
        let (tx, _rx) = watch::channel(0u8);
        let cancelled = Arc::new(AtomicBool::new(false));
        let sink = ProgressSink::new(tx, cancelled.clone());
        sink.advance(10).unwrap();
        cancelled.store(true, Ordering::SeqCst);
        let err = sink.advance(20).unwrap_err();
        assert!(err.is::<ScanCancelled>());
    }
}
