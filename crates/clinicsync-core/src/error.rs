//! Error types for clinicsync

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Input could not be read as a delimited table
    #[error("Parse error: {0}")]
    Parse(String),

    /// Input was readable but a required column could not be established
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout, 429 or 5xx from the ledger after retries ran out
    #[error("Transient ledger error (status {status:?}): {message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// Non-retryable fault reported by the ledger
    #[error("Ledger error {code} (status {status}): {message}")]
    Remote {
        status: u16,
        code: String,
        message: String,
    },

    /// Version token was stale when updating a document
    #[error("Version conflict on {resource} {id}: {message}")]
    Conflict {
        resource: String,
        id: String,
        message: String,
    },

    /// A find-or-create cycle did not converge
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),

    /// Token missing, rejected or not refreshable
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Errors that make the rest of a batch pointless
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Parse(_) | Self::Schema(_))
    }

    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
