//! Unified error handling for the row-grouper library.
//!
//! Errors fall into four families:
//! - input errors (unknown dataset/plan/group, malformed action) are rejected
//!   before any state change
//! - dependency errors (classifier failure or timeout) are recovered per chunk
//!   by the pipeline and never escape it
//! - capacity errors are raised when a state cannot be persisted under the
//!   store ceiling even after full optimization
//! - infrastructure errors wrap storage and codec failures

use thiserror::Error;

/// Unified error type for grouping operations.
#[derive(Debug, Error)]
pub enum GroupingError {
    #[error("Unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("No grouping generated for dataset '{0}'")]
    NotGenerated(String),

    #[error("No final results saved for dataset '{0}'")]
    NoFinalResults(String),

    #[error("Unknown plan '{0}'")]
    UnknownPlan(String),

    #[error("Malformed action: {0}")]
    MalformedAction(String),

    #[error("Unknown main group '{0}'")]
    UnknownGroup(String),

    #[error("Unknown sub-group '{sub_group_id}' in main group '{group_id}'")]
    UnknownSubGroup {
        group_id: String,
        sub_group_id: String,
    },

    #[error("Unknown item '{0}'")]
    UnknownItem(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("A sub-group named '{name}' already exists in main group '{group_id}'")]
    DuplicateName { group_id: String, name: String },

    #[error("Sub-group '{0}' is the ungrouped bucket and cannot be deleted")]
    ProtectedSubGroup(String),

    #[error("Classifier failed for chunk {chunk_index}: {message}")]
    Extractor { chunk_index: usize, message: String },

    #[error("Classifier timed out for chunk {chunk_index} after {timeout_ms}ms")]
    ExtractorTimeout { chunk_index: usize, timeout_ms: u64 },

    #[error("Grouping state is {size} bytes after optimization, store limit is {limit} bytes")]
    CapacityExceeded { size: usize, limit: usize },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl GroupingError {
    /// True for errors caused by the caller's request rather than the engine.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            GroupingError::UnknownDataset(_)
                | GroupingError::NotGenerated(_)
                | GroupingError::NoFinalResults(_)
                | GroupingError::UnknownPlan(_)
                | GroupingError::MalformedAction(_)
                | GroupingError::UnknownGroup(_)
                | GroupingError::UnknownSubGroup { .. }
                | GroupingError::UnknownItem(_)
                | GroupingError::InvalidName(_)
                | GroupingError::DuplicateName { .. }
                | GroupingError::ProtectedSubGroup(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for GroupingError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        GroupingError::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for GroupingError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        GroupingError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for GroupingError {
    fn from(err: serde_json::Error) -> Self {
        GroupingError::Codec(err.to_string())
    }
}

impl From<csv::Error> for GroupingError {
    fn from(err: csv::Error) -> Self {
        GroupingError::Dataset(err.to_string())
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for GroupingError {
    fn from(err: rusqlite::Error) -> Self {
        GroupingError::Storage(err.to_string())
    }
}

/// Result type alias for grouping operations.
pub type Result<T> = std::result::Result<T, GroupingError>;

/// Extension trait for converting lookups into input errors.
pub trait OptionExt<T> {
    /// Convert Option to Result with an unknown main group error.
    fn ok_or_unknown_group(self, group_id: &str) -> Result<T>;

    /// Convert Option to Result with an unknown sub-group error.
    fn ok_or_unknown_sub_group(self, group_id: &str, sub_group_id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unknown_group(self, group_id: &str) -> Result<T> {
        self.ok_or_else(|| GroupingError::UnknownGroup(group_id.to_string()))
    }

    fn ok_or_unknown_sub_group(self, group_id: &str, sub_group_id: &str) -> Result<T> {
        self.ok_or_else(|| GroupingError::UnknownSubGroup {
            group_id: group_id.to_string(),
            sub_group_id: sub_group_id.to_string(),
        })
    }
}
