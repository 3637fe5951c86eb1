//! Error taxonomy for the scheduling pipeline.

use thiserror::Error;

/// All errors surfaced by SendLater components.
#[derive(Debug, Error)]
pub enum SendLaterError {
    /// Request rejected at the boundary before any state was touched.
    #[error("validation: {0}")]
    Validation(String),

    /// Edit/cancel attempted on a record no longer in `scheduled`.
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// Page lookup, creation, or readiness failed or timed out.
    #[error("acquisition: {0}")]
    Acquisition(String),

    /// The delivery agent could not complete text entry/submission.
    #[error("delivery: {0}")]
    Delivery(String),

    /// The persisted blob could not be read or written.
    #[error("storage: {0}")]
    Storage(String),

    /// Configuration file problems.
    #[error("config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SendLaterError>;
