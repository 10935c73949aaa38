use crate::request::RequestStatus;

/// Error taxonomy for the reconciliation workflow.
///
/// Batch operations (`ingest`, `resolve_all_pending`) capture per-item errors
/// in that item's result slot; only envelope-level `Validation` fails a whole
/// call.
#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("request {request_id} is not pending (status: {status:?})")]
    InvalidState {
        request_id: String,
        status: RequestStatus,
    },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("change request store unavailable: {0}")]
    StoreUnavailable(#[from] sled::Error),
    #[error("storage codec failure: {0}")]
    Codec(String),
}

impl WorkflowError {
    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }

    /// Transient failures are safe to retry with backoff; nothing is
    /// partially written when they occur.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}
