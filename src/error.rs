//! Error taxonomy shared by the store, pipeline, context, and chat layers.
//!
//! State-machine violations (`Conflict`, `InvalidTransition`) and eligibility
//! errors are contracts the caller must respect and are never silently
//! recovered. Only `Timeout` is retried internally (once, with backoff) by the
//! component that owns the external call.

use thiserror::Error;

use crate::models::DocumentStatus;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A concurrent CAS lost the race. The caller should re-fetch and retry.
    #[error("conflict: document status changed concurrently")]
    Conflict,

    /// An illegal status transition was attempted. Not retried.
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },

    /// A non-published document was offered as a chat source.
    #[error("document {0} is not published and cannot be activated")]
    NotEligible(String),

    /// A second scan was started while one is already running on the lineage.
    #[error("document {0} is already being scanned")]
    AlreadyScanning(String),

    /// An external backend (scorer, composer, scanner) exceeded its budget.
    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Request-shaped input that fails validation before touching state.
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
