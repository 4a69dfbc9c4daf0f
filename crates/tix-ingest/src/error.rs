//! Error taxonomy for the ingestion pipeline
//!
//! Every failure is either transient (worth retrying after a backoff) or
//! permanent (retrying cannot help). [`IngestError::is_transient`] is the
//! single place that decides which is which; the retry controller and the
//! batch coordinator both defer to it.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

/// SQLSTATE codes worth retrying: serialization failure, deadlock,
/// lock not available, query canceled, too many connections.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03", "57014", "53300"];

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<IngestError>,
    },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Upstream returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Malformed upstream response: {0}")]
    Malformed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Common(#[from] tix_common::Error),
}

impl IngestError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the failed operation may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout(_) => true,
            Self::Status { status, .. } => is_transient_status(*status),
            Self::Http(err) => {
                if err.is_timeout() || err.is_connect() {
                    return true;
                }
                match err.status() {
                    Some(status) => is_transient_status(status.as_u16()),
                    // Body read interrupted mid-stream
                    None => err.is_body() || err.is_request(),
                }
            },
            Self::Database(err) => is_transient_sqlx(err),
            Self::Permanent(_)
            | Self::RetryExhausted { .. }
            | Self::Malformed(_)
            | Self::Config(_)
            | Self::Cancelled
            | Self::Common(_) => false,
        }
    }

    /// The innermost error, unwrapping any retry exhaustion.
    pub fn root(&self) -> &IngestError {
        match self {
            Self::RetryExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => db
            .code()
            .is_some_and(|code| TRANSIENT_SQLSTATES.contains(&&*code)),
        _ => false,
    }
}
