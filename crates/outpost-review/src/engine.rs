//! Quorum approval state machine.
//!
//! Aggregation rule: a review is `APPROVED` when every group approved and
//! `REJECTED` as soon as any group rejected. A review with no groups is
//! never approved.
//!
//! The engine holds no locks. Callers serialize votes per review; two
//! concurrent votes on the same review loaded from the same snapshot would
//! overwrite each other.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{ReviewError, ReviewResult};
use crate::types::{Decision, GroupStatus, Review, ReviewGroup, ReviewOwner, ReviewStatus};

#[derive(Debug, Default, Clone, Copy)]
pub struct ReviewEngine;

impl ReviewEngine {
    pub fn new() -> Self {
        Self
    }

    /// Cast `group`'s vote and recompute the aggregate status.
    ///
    /// Returns the updated group. When the vote completes the approval and
    /// the review carries an access window, `revoke_at` is set to
    /// `now + window`.
    pub fn vote(
        &self,
        review: &mut Review,
        group: &str,
        decision: Decision,
        reviewer: &ReviewOwner,
        now: DateTime<Utc>,
    ) -> ReviewResult<ReviewGroup> {
        if !review.groups.iter().any(|g| g.group == group) {
            return Err(ReviewError::GroupNotFound {
                group: group.to_string(),
            });
        }
        let review_id = review.id.clone();
        let status = review.status;
        let Some(slot) = review
            .groups
            .iter_mut()
            .find(|g| g.group == group && g.status == GroupStatus::Pending)
        else {
            return Err(ReviewError::AlreadyDecided {
                group: group.to_string(),
            });
        };
        if status != ReviewStatus::Pending {
            return Err(ReviewError::Finalized { review_id, status });
        }

        slot.status = decision.group_status();
        slot.reviewed_by = Some(reviewer.clone());
        slot.review_date = Some(now);
        let decided = slot.clone();
        debug!(review = %review.id, group, status = ?decided.status, "vote recorded");

        let aggregate = self.recompute(review);
        if aggregate == ReviewStatus::Approved && review.revoke_at.is_none() {
            if let Some(window) = review.access_window() {
                review.revoke_at = now.checked_add_signed(window);
            }
        }
        Ok(decided)
    }

    /// Derive the aggregate status from the groups.
    ///
    /// Only a `PENDING` review moves; anything past it is returned as is.
    pub fn recompute(&self, review: &mut Review) -> ReviewStatus {
        if review.status != ReviewStatus::Pending {
            return review.status;
        }
        let next = aggregate(&review.groups);
        if next != review.status {
            info!(review = %review.id, session = %review.session_id, from = %review.status, to = %next, "review status changed");
            review.status = next;
        }
        review.status
    }

    /// Whether traffic for the review's session may flow at `now`.
    pub fn is_admitted(&self, review: &Review, now: DateTime<Utc>) -> bool {
        review.status == ReviewStatus::Approved && review.revoke_at.map_or(true, |at| now < at)
    }

    /// Revoke an approved review whose window has closed. Returns whether
    /// the status changed; calling it again is a no-op.
    pub fn expire(&self, review: &mut Review, now: DateTime<Utc>) -> bool {
        match review.revoke_at {
            Some(at) if review.status == ReviewStatus::Approved && now >= at => {
                info!(review = %review.id, revoke_at = %at, "access window closed");
                review.status = ReviewStatus::Revoked;
                true
            }
            _ => false,
        }
    }

    /// Revoke an approved review immediately.
    pub fn revoke(&self, review: &mut Review, now: DateTime<Utc>) -> ReviewResult<()> {
        self.transition(review, ReviewStatus::Revoked)?;
        if review.revoke_at.map_or(true, |at| at > now) {
            review.revoke_at = Some(now);
        }
        Ok(())
    }

    /// Execution bookkeeping for an approved review:
    /// `APPROVED -> PROCESSING -> EXECUTING -> EXECUTED`.
    ///
    /// An approval whose access window closed before `now` is revoked first,
    /// so it can no longer start executing.
    pub fn advance(
        &self,
        review: &mut Review,
        to: ReviewStatus,
        now: DateTime<Utc>,
    ) -> ReviewResult<()> {
        self.expire(review, now);
        match to {
            ReviewStatus::Processing | ReviewStatus::Executing | ReviewStatus::Executed => {
                self.transition(review, to)
            }
            _ => Err(ReviewError::InvalidTransition {
                review_id: review.id.clone(),
                from: review.status,
                to,
            }),
        }
    }

    fn transition(&self, review: &mut Review, to: ReviewStatus) -> ReviewResult<()> {
        if !review.status.can_transition_to(to) {
            return Err(ReviewError::InvalidTransition {
                review_id: review.id.clone(),
                from: review.status,
                to,
            });
        }
        info!(review = %review.id, from = %review.status, to = %to, "review status changed");
        review.status = to;
        Ok(())
    }
}

fn aggregate(groups: &[ReviewGroup]) -> ReviewStatus {
    if groups.iter().any(|g| g.status == GroupStatus::Rejected) {
        ReviewStatus::Rejected
    } else if !groups.is_empty() && groups.iter().all(|g| g.status == GroupStatus::Approved) {
        ReviewStatus::Approved
    } else {
        ReviewStatus::Pending
    }
}
