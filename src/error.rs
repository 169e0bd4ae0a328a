use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BulkError {
    #[error("invalid period: {0} (expected e.g. 2014q1)")]
    InvalidPeriod(String),

    #[error("period {period} is not in the catalog")]
    #[diagnostic(help("add the period to the `counts` table of the config file"))]
    UnknownPeriod { period: String },

    #[error("file index {index} is outside 1..={total} for period {period}")]
    IndexOutOfRange {
        period: String,
        index: u32,
        total: u32,
    },

    #[error("group size must be at least 1")]
    InvalidGroupSize,

    #[error("not a catalog URL: {0}")]
    #[diagnostic(help("regenerate the list with `openfda-bulk status --write-missing`"))]
    InvalidWorkListUrl(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("server returned status {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("downloaded file is empty: {0}")]
    EmptyDownload(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("invalid keywords: {0}")]
    InvalidKeywords(String),
}

/// Process exit status for bad input or configuration.
pub const EXIT_INVALID_INPUT: u8 = 2;
/// Process exit status when the remote could not be reached.
pub const EXIT_TRANSPORT: u8 = 3;
/// Process exit status when at least one period was left incomplete.
pub const EXIT_PERIODS_FAILED: u8 = 4;

impl BulkError {
    pub fn exit_code(&self) -> u8 {
        match self {
            BulkError::InvalidPeriod(_)
            | BulkError::UnknownPeriod { .. }
            | BulkError::IndexOutOfRange { .. }
            | BulkError::InvalidGroupSize
            | BulkError::InvalidWorkListUrl(_)
            | BulkError::ConfigRead(_)
            | BulkError::ConfigParse(_)
            | BulkError::InvalidKeywords(_) => EXIT_INVALID_INPUT,
            BulkError::Transport(_) | BulkError::HttpStatus { .. } => EXIT_TRANSPORT,
            _ => 1,
        }
    }

    /// Timeouts, resets, throttling and server-side failures.
    pub fn is_transient(&self) -> bool {
        match self {
            BulkError::Transport(_) => true,
            BulkError::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_by_error_kind() {
        assert_eq!(
            BulkError::UnknownPeriod {
                period: "2030q1".to_string()
            }
            .exit_code(),
            EXIT_INVALID_INPUT
        );
        assert_eq!(
            BulkError::ConfigParse("bad".to_string()).exit_code(),
            EXIT_INVALID_INPUT
        );
        assert_eq!(
            BulkError::HttpStatus {
                status: 404,
                url: "u".to_string()
            }
            .exit_code(),
            EXIT_TRANSPORT
        );
        assert_eq!(BulkError::Filesystem("full".to_string()).exit_code(), 1);
    }

    #[test]
    fn classifies_transient_errors() {
        assert!(BulkError::Transport("reset".to_string()).is_transient());
        assert!(
            BulkError::HttpStatus {
                status: 503,
                url: "u".to_string()
            }
            .is_transient()
        );
        assert!(
            !BulkError::HttpStatus {
                status: 404,
                url: "u".to_string()
            }
            .is_transient()
        );
        assert!(!BulkError::Filesystem("denied".to_string()).is_transient());
    }
}
