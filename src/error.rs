use thiserror::Error;

/// Failure classification for a sync pass. Retry behavior hangs off this
/// classification, so a misclassified error either spams a bank portal or
/// silently gives up; when in doubt, classify as non-retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Bad credentials or expired session. Surfaced to the operator,
    /// never auto-retried.
    #[error("authentication rejected by the portal")]
    Authentication,

    /// The page no longer matches any known selector strategy. Requires a
    /// code or alias-table update, never auto-retried.
    #[error("page structure changed at {location} (visible controls: {visible_controls:?})")]
    StructureChanged {
        location: String,
        visible_controls: Vec<String>,
    },

    /// Network hiccup or similar. Retried a bounded number of times
    /// within one session.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A bounded wait expired.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("session cancelled by operator")]
    Cancelled,

    /// A sync pass for the same bank is already running.
    #[error("sync already in progress for this bank")]
    Busy,

    /// Credential or mapping not stored yet. Non-fatal, retried on the
    /// next scheduler tick.
    #[error("missing prerequisites: {0}")]
    MissingPrerequisites(String),

    /// No row in the export matched enough known column aliases.
    #[error("no header row matched the known column aliases for {bank}")]
    SchemaMismatch { bank: String },

    #[error("ledger request failed: {0}")]
    Ledger(String),
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_) | SyncError::Timeout(_))
    }
}

/// A single export row that failed normalization. Row-scoped: the rest of
/// the batch proceeds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("row {row_index}: {kind}")]
pub struct MalformedRow {
    /// Index of the row in the raw export, counted from the header row.
    pub row_index: usize,
    pub kind: MalformedKind,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedKind {
    #[error("unparseable amount {0:?}")]
    Amount(String),
    #[error("unrecognized date {0:?}")]
    Date(String),
    #[error("missing cell for {0}")]
    MissingCell(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(SyncError::Transient("connection reset".to_string()).is_retryable());
        assert!(SyncError::Timeout("login form".to_string()).is_retryable());
        assert!(!SyncError::Authentication.is_retryable());
        assert!(!SyncError::Busy.is_retryable());
        assert!(!SyncError::StructureChanged {
            location: "https://example.com/login".to_string(),
            visible_controls: vec![],
        }
        .is_retryable());
    }
}
