//! Review operation errors.

use thiserror::Error;

use crate::types::ReviewStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReviewError {
    #[error("review '{review_id}' not found")]
    NotFound { review_id: String },

    /// No group with that name is attached to the review.
    #[error("review group '{group}' not found")]
    GroupNotFound { group: String },

    /// Votes are final: the group already approved or rejected.
    #[error("review group '{group}' already decided")]
    AlreadyDecided { group: String },

    /// The review left `PENDING`; further votes are meaningless.
    #[error("review '{review_id}' is already {status}")]
    Finalized {
        review_id: String,
        status: ReviewStatus,
    },

    #[error("invalid transition for review '{review_id}': {from} -> {to}")]
    InvalidTransition {
        review_id: String,
        from: ReviewStatus,
        to: ReviewStatus,
    },

    /// The persistence collaborator failed.
    #[error("review store: {0}")]
    Store(String),
}

pub type ReviewResult<T> = Result<T, ReviewError>;
