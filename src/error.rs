//! Error taxonomy shared by the stores and pipeline stages.
//!
//! Duplicates and exhausted quotas are not errors; they are modelled as
//! outcomes (`AppendResult::Duplicate`, `GenerationOutcome::QuotaExceeded`).

use std::time::Duration;

/// Failures raised by store implementations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("snapshot io: {0}")]
    Snapshot(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Rejections at the ingestion boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IngestError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("urgency_score {0} outside [0, 1]")]
    UrgencyOutOfRange(f32),

    #[error("timestamp is {0} seconds in the future")]
    FromTheFuture(i64),

    #[error("store rejected event: {0}")]
    Store(String),
}

impl From<StoreError> for IngestError {
    fn from(e: StoreError) -> Self {
        IngestError::Store(e.to_string())
    }
}

/// Errors surfaced by `Correlator::process`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CorrelateError {
    #[error("event {0} not found in store")]
    EventNotFound(String),

    #[error("malformed event {event_id}: {reason}")]
    Malformed { event_id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CorrelateError {
    /// Only transient store failures are worth another attempt; missing or
    /// malformed events will not heal on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CorrelateError::Store(StoreError::Unavailable(_))
                | CorrelateError::Store(StoreError::Corrupt(_))
        )
    }
}

/// Failures talking to the external reasoning service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReasoningError {
    #[error("reasoning call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("provider returned HTTP {0}")]
    Http(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("reasoning provider disabled")]
    Disabled,
}
