//! Error types for vellum-core.
//!
//! Every caller-visible failure of the store maps onto one variant of
//! [`StoreError`], and every variant maps onto exactly one [`ErrorClass`]:
//!
//! - **User**: returned to the caller and never logged as a failure by the
//!   core. The caller decides what to do (retry with a fresh revision, pick
//!   a new command id, trim the payload).
//! - **Transient**: shed load. Returned immediately with no delay inflicted
//!   by the core; safe to retry.
//! - **Environmental**: disk/corruption trouble. The commit path quiesces
//!   after surfacing one of these; readers and projections keep serving
//!   whatever is durably committed.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Stable classification for store errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Caller mistake or contract violation; never retried by the core.
    User,
    /// Load shedding; retry is the caller's call.
    Transient,
    /// Disk, corruption, or quiesced-store failures.
    Environmental,
}

/// Main error type for vellum-core.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stream's current revision did not match the expectation supplied
    /// with the append.
    #[error("revision conflict on stream {stream}: expected {expected}, actual {actual}")]
    RevisionConflict {
        stream: String,
        /// Expectation rendered as the caller supplied it ("none", "any", or a number).
        expected: String,
        actual: u64,
    },

    /// A command id was re-used within a stream with a different payload set.
    #[error("command id {command_id} already committed to stream {stream} with a different payload set")]
    CommandIdReuse { stream: String, command_id: String },

    /// The presented tenant does not own the addressed record or row.
    #[error("tenant mismatch: presented tenant does not own the requested data")]
    TenantMismatch,

    /// The addressed stream does not exist.
    #[error("stream not found: {stream}")]
    StreamNotFound { stream: String },

    /// The admission controller is at its in-flight limit.
    #[error("store overloaded: in-flight write limit {limit} reached, retry later")]
    Overloaded { limit: usize },

    /// An event payload exceeded the configured cap.
    #[error("payload of {actual} bytes exceeds cap of {max} bytes")]
    PayloadTooLarge { actual: usize, max: usize },

    /// A stream id, tenant id, or command id exceeded its bound.
    #[error("{field} of {actual} bytes exceeds cap of {max} bytes")]
    IdentifierTooLong {
        field: &'static str,
        actual: usize,
        max: usize,
    },

    /// On-disk corruption detected in a segment.
    #[error("corrupted segment {segment:?} at offset {offset}: {reason}")]
    Corrupted {
        segment: PathBuf,
        offset: u64,
        reason: String,
    },

    /// A projection checkpoint was asked to move backwards or stand still.
    #[error("checkpoint regression on projection {projection}: proposed {proposed}, current {current}")]
    CheckpointRegression {
        projection: String,
        proposed: u64,
        current: u64,
    },

    /// The backing volume refused the write.
    #[error("storage full: {0}")]
    StorageFull(String),

    /// The commit path quiesced after an environmental failure; the store
    /// must be reopened (recovery runs on open).
    #[error("store unhealthy, reopen required: {reason}")]
    StoreUnhealthy { reason: String },

    /// A projection was registered twice with a different table schema.
    #[error("projection {projection} already registered with a different schema")]
    SchemaMismatch { projection: String },

    /// The addressed projection was never registered.
    #[error("projection not registered: {projection}")]
    ProjectionNotFound { projection: String },

    /// A projection row did not fit the registered schema.
    #[error("row rejected by schema of projection {projection}: {reason}")]
    RowSchemaViolation { projection: String, reason: String },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Malformed append request (empty event list, oversized batch).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Projection state database errors.
    #[error("projection state error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Serialization errors (index snapshot, projection rows).
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Stable error-class mapping for retry and surfacing decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RevisionConflict { .. }
            | Self::CommandIdReuse { .. }
            | Self::TenantMismatch
            | Self::StreamNotFound { .. }
            | Self::PayloadTooLarge { .. }
            | Self::IdentifierTooLong { .. }
            | Self::CheckpointRegression { .. }
            | Self::SchemaMismatch { .. }
            | Self::ProjectionNotFound { .. }
            | Self::RowSchemaViolation { .. }
            | Self::InvalidConfig(_)
            | Self::InvalidRequest(_) => ErrorClass::User,
            Self::Overloaded { .. } => ErrorClass::Transient,
            Self::Corrupted { .. }
            | Self::StorageFull(_)
            | Self::StoreUnhealthy { .. }
            | Self::Io(_)
            | Self::Sql(_)
            | Self::Json(_) => ErrorClass::Environmental,
        }
    }

    /// Whether the commit path must quiesce after surfacing this error.
    #[must_use]
    pub fn is_quiescing(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. } | Self::StorageFull(_) | Self::Io(_)
        )
    }
}

/// Map ENOSPC onto [`StoreError::StorageFull`]; everything else stays I/O.
pub(crate) fn classify_io(err: std::io::Error) -> StoreError {
    if err.raw_os_error() == Some(28) {
        StoreError::StorageFull(err.to_string())
    } else {
        StoreError::Io(err)
    }
}
