//! Admission check run before a session's packets are let through.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::ReviewResult;
use crate::service::ReviewService;
use crate::store::ReviewStore;
use crate::types::ReviewStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// The session's policy attaches no review.
    NoReviewRequired,
    Admitted,
    /// Still waiting on at least one group.
    AwaitingReview,
    /// Rejected, revoked, or already executed.
    Denied(ReviewStatus),
}

impl GateDecision {
    pub fn allows_traffic(&self) -> bool {
        matches!(self, GateDecision::NoReviewRequired | GateDecision::Admitted)
    }
}

pub struct SessionGate<S> {
    reviews: Arc<ReviewService<S>>,
}

impl<S: ReviewStore> SessionGate<S> {
    pub fn new(reviews: Arc<ReviewService<S>>) -> Self {
        Self { reviews }
    }

    /// Decide whether `session_id` may pass traffic at `now`.
    ///
    /// An approved review whose access window has closed is revoked (and
    /// persisted) before deciding.
    pub async fn admit(&self, session_id: &str, now: DateTime<Utc>) -> ReviewResult<GateDecision> {
        let Some(review) = self.reviews.expire_for_session(session_id, now).await? else {
            return Ok(GateDecision::NoReviewRequired);
        };

        let decision = if self.reviews.engine().is_admitted(&review, now) {
            GateDecision::Admitted
        } else if review.status() == ReviewStatus::Pending {
            GateDecision::AwaitingReview
        } else {
            GateDecision::Denied(review.status())
        };
        debug!(session = session_id, review = %review.id, ?decision, "gate decision");
        Ok(decision)
    }
}
