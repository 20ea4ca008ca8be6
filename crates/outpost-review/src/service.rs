//! Vote handling on top of a [`ReviewStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::info;

use crate::engine::ReviewEngine;
use crate::error::ReviewResult;
use crate::store::ReviewStore;
use crate::types::{Decision, Review, ReviewOwner, ReviewStatus};

/// One async lock per review id, created on first use and dropped with its
/// last holder.
#[derive(Default)]
struct ReviewLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl ReviewLocks {
    async fn acquire(&self, review_id: &str) -> ReviewLock {
        let slot = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            map.entry(review_id.to_string()).or_default().clone()
        };
        ReviewLock {
            guard: Some(slot.lock_owned().await),
            review_id: review_id.to_string(),
            locks: self.inner.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct ReviewLock {
    guard: Option<OwnedMutexGuard<()>>,
    review_id: String,
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl Drop for ReviewLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map's own handle left: nobody holds or waits on it.
        if map
            .get(&self.review_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            map.remove(&self.review_id);
        }
    }
}

/// Load, mutate through the engine, persist.
///
/// Every mutation of a review runs under that review's lock, so two writers
/// never race on the same snapshot. Different reviews proceed in parallel.
pub struct ReviewService<S> {
    store: Arc<S>,
    engine: ReviewEngine,
    locks: ReviewLocks,
}

impl<S: ReviewStore> ReviewService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            engine: ReviewEngine::new(),
            locks: ReviewLocks::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn engine(&self) -> &ReviewEngine {
        &self.engine
    }

    /// Record `reviewer`'s vote for `group` and persist the result.
    pub async fn vote(
        &self,
        review_id: &str,
        group: &str,
        decision: Decision,
        reviewer: &ReviewOwner,
        now: DateTime<Utc>,
    ) -> ReviewResult<Review> {
        let _lock = self.locks.acquire(review_id).await;
        let mut review = self.store.load(review_id).await?;
        let before = review.status();
        let decided = self.engine.vote(&mut review, group, decision, reviewer, now)?;

        self.store.save_vote(&review, &decided).await?;
        if review.status() != before || review.revoke_at().is_some() {
            self.store.save_status(&review).await?;
        }
        info!(
            review = %review.id,
            group,
            reviewer = %reviewer.email,
            status = %review.status(),
            "review vote"
        );
        Ok(review)
    }

    /// Revoke an approved review now.
    pub async fn revoke(&self, review_id: &str, now: DateTime<Utc>) -> ReviewResult<Review> {
        let _lock = self.locks.acquire(review_id).await;
        let mut review = self.store.load(review_id).await?;
        self.engine.revoke(&mut review, now)?;
        self.store.save_status(&review).await?;
        Ok(review)
    }

    /// Move an approved review along its execution steps.
    ///
    /// A lapsed approval is revoked and persisted even though the move
    /// itself is refused.
    pub async fn advance(
        &self,
        review_id: &str,
        to: ReviewStatus,
        now: DateTime<Utc>,
    ) -> ReviewResult<Review> {
        let _lock = self.locks.acquire(review_id).await;
        let mut review = self.store.load(review_id).await?;
        let before = review.status();
        let moved = self.engine.advance(&mut review, to, now);
        if moved.is_ok() || review.status() != before {
            self.store.save_status(&review).await?;
        }
        moved?;
        Ok(review)
    }

    /// The current review gating `session_id`, with a closed access window
    /// already turned into a persisted revocation.
    pub async fn expire_for_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> ReviewResult<Option<Review>> {
        let Some(found) = self.store.find_by_session(session_id).await? else {
            return Ok(None);
        };
        let _lock = self.locks.acquire(&found.id).await;
        // Re-read under the lock; `found` may predate another writer.
        let mut review = self.store.load(&found.id).await?;
        if self.engine.expire(&mut review, now) {
            self.store.save_status(&review).await?;
        }
        Ok(Some(review))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::error::ReviewError;
    use crate::store::InMemoryReviewStore;
    use crate::types::{GroupStatus, ReviewConnection, ReviewGroup, ReviewType};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn service() -> ReviewService<InMemoryReviewStore> {
        let store = Arc::new(InMemoryReviewStore::new());
        store
            .insert(
                Review::new(
                    "rev-1",
                    "org-1",
                    "sess-1",
                    ReviewType::Jit,
                    ReviewOwner::default(),
                    ReviewConnection {
                        id: "c-1".into(),
                        name: "pg-prod".into(),
                    },
                    vec![ReviewGroup::new("g-1", "sre"), ReviewGroup::new("g-2", "dba")],
                    t0(),
                )
                .with_access_duration(900),
            )
            .await;
        ReviewService::new(store)
    }

    fn bob() -> ReviewOwner {
        ReviewOwner {
            id: "u-bob".into(),
            email: "bob@example.com".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn votes_are_persisted() {
        let svc = service().await;
        svc.vote("rev-1", "sre", Decision::Approve, &bob(), t0()).await.unwrap();
        let stored = svc.store().load("rev-1").await.unwrap();
        assert_eq!(stored.group("sre").unwrap().status(), GroupStatus::Approved);
        assert_eq!(stored.status(), ReviewStatus::Pending);

        svc.vote("rev-1", "dba", Decision::Approve, &bob(), t0()).await.unwrap();
        let stored = svc.store().load("rev-1").await.unwrap();
        assert_eq!(stored.status(), ReviewStatus::Approved);
        assert_eq!(stored.revoke_at(), Some(t0() + Duration::minutes(15)));
    }

    #[tokio::test]
    async fn errors_surface_to_the_voter() {
        let svc = service().await;
        assert!(matches!(
            svc.vote("missing", "sre", Decision::Approve, &bob(), t0()).await,
            Err(ReviewError::NotFound { .. })
        ));
        assert!(matches!(
            svc.vote("rev-1", "ops", Decision::Approve, &bob(), t0()).await,
            Err(ReviewError::GroupNotFound { .. })
        ));

        svc.vote("rev-1", "sre", Decision::Reject, &bob(), t0()).await.unwrap();
        assert!(matches!(
            svc.vote("rev-1", "sre", Decision::Approve, &bob(), t0()).await,
            Err(ReviewError::AlreadyDecided { .. })
        ));
        assert!(matches!(
            svc.vote("rev-1", "dba", Decision::Approve, &bob(), t0()).await,
            Err(ReviewError::Finalized { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_votes_both_land() {
        let svc = Arc::new(service().await);
        let a = {
            let svc = svc.clone();
            tokio::spawn(async move {
                svc.vote("rev-1", "sre", Decision::Approve, &bob(), t0()).await
            })
        };
        let b = {
            let svc = svc.clone();
            tokio::spawn(async move {
                svc.vote("rev-1", "dba", Decision::Approve, &bob(), t0()).await
            })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let stored = svc.store().load("rev-1").await.unwrap();
        assert_eq!(stored.status(), ReviewStatus::Approved);
    }

    #[tokio::test]
    async fn revoke_and_advance_persist() {
        let svc = service().await;
        svc.vote("rev-1", "sre", Decision::Approve, &bob(), t0()).await.unwrap();
        svc.vote("rev-1", "dba", Decision::Approve, &bob(), t0()).await.unwrap();

        svc.advance("rev-1", ReviewStatus::Executing, t0()).await.unwrap();
        assert_eq!(
            svc.store().load("rev-1").await.unwrap().status(),
            ReviewStatus::Executing
        );
        assert!(svc.revoke("rev-1", t0()).await.is_err());
    }

    #[tokio::test]
    async fn lapsed_approval_is_revoked_instead_of_advanced() {
        let svc = service().await;
        svc.vote("rev-1", "sre", Decision::Approve, &bob(), t0()).await.unwrap();
        svc.vote("rev-1", "dba", Decision::Approve, &bob(), t0()).await.unwrap();

        let late = t0() + Duration::minutes(16);
        assert!(matches!(
            svc.advance("rev-1", ReviewStatus::Processing, late).await,
            Err(ReviewError::InvalidTransition {
                from: ReviewStatus::Revoked,
                ..
            })
        ));
        assert_eq!(
            svc.store().load("rev-1").await.unwrap().status(),
            ReviewStatus::Revoked
        );
    }

    #[tokio::test]
    async fn expire_for_session_persists_revocation() {
        let svc = service().await;
        assert!(svc.expire_for_session("sess-9", t0()).await.unwrap().is_none());

        svc.vote("rev-1", "sre", Decision::Approve, &bob(), t0()).await.unwrap();
        svc.vote("rev-1", "dba", Decision::Approve, &bob(), t0()).await.unwrap();
        let current = svc.expire_for_session("sess-1", t0()).await.unwrap().unwrap();
        assert_eq!(current.status(), ReviewStatus::Approved);

        let late = t0() + Duration::minutes(15);
        let current = svc.expire_for_session("sess-1", late).await.unwrap().unwrap();
        assert_eq!(current.status(), ReviewStatus::Revoked);
        assert_eq!(
            svc.store().load("rev-1").await.unwrap().status(),
            ReviewStatus::Revoked
        );
    }

    #[tokio::test(start_paused = true)]
    async fn locks_are_scoped_to_one_review() {
        let svc = service().await;
        svc.store()
            .insert(Review::new(
                "rev-2",
                "org-1",
                "sess-2",
                ReviewType::OneTime,
                ReviewOwner::default(),
                ReviewConnection::default(),
                vec![ReviewGroup::new("g-3", "sre")],
                t0(),
            ))
            .await;

        let held = svc.locks.acquire("rev-1").await;
        svc.vote("rev-2", "sre", Decision::Approve, &bob(), t0()).await.unwrap();
        assert!(tokio::time::timeout(
            std::time::Duration::from_millis(50),
            svc.vote("rev-1", "sre", Decision::Approve, &bob(), t0()),
        )
        .await
        .is_err());

        drop(held);
        svc.vote("rev-1", "sre", Decision::Approve, &bob(), t0()).await.unwrap();
        assert_eq!(svc.locks.len(), 0);
    }

    /// Accepts reads, fails every vote write.
    struct BrokenVoteStore(InMemoryReviewStore);

    impl ReviewStore for BrokenVoteStore {
        async fn load(&self, review_id: &str) -> ReviewResult<Review> {
            self.0.load(review_id).await
        }

        async fn find_by_session(&self, session_id: &str) -> ReviewResult<Option<Review>> {
            self.0.find_by_session(session_id).await
        }

        async fn save_vote(&self, _review: &Review, _group: &ReviewGroup) -> ReviewResult<()> {
            Err(ReviewError::Store("connection reset".into()))
        }

        async fn save_status(&self, review: &Review) -> ReviewResult<()> {
            self.0.save_status(review).await
        }
    }

    #[tokio::test]
    async fn store_failures_reach_the_caller() {
        let inner = InMemoryReviewStore::new();
        inner
            .insert(Review::new(
                "rev-1",
                "org-1",
                "sess-1",
                ReviewType::OneTime,
                ReviewOwner::default(),
                ReviewConnection::default(),
                vec![ReviewGroup::new("g-1", "sre")],
                t0(),
            ))
            .await;
        let svc = ReviewService::new(Arc::new(BrokenVoteStore(inner)));

        let err = svc
            .vote("rev-1", "sre", Decision::Approve, &bob(), t0())
            .await
            .unwrap_err();
        assert_eq!(err, ReviewError::Store("connection reset".into()));
        assert_eq!(err.to_string(), "review store: connection reset");

        // Nothing was half-written.
        let stored = svc.store().load("rev-1").await.unwrap();
        assert_eq!(stored.status(), ReviewStatus::Pending);
        assert_eq!(stored.group("sre").unwrap().status(), GroupStatus::Pending);
    }
}
