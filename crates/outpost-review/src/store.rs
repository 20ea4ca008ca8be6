//! Persistence capability for reviews.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::{ReviewError, ReviewResult};
use crate::types::{Review, ReviewGroup};

/// Where reviews live. The engine never talks to storage; services do,
/// through this trait.
#[allow(async_fn_in_trait)]
pub trait ReviewStore: Send + Sync {
    async fn load(&self, review_id: &str) -> ReviewResult<Review>;

    /// The review gating `session_id`, or `None` when the session needs none.
    async fn find_by_session(&self, session_id: &str) -> ReviewResult<Option<Review>>;

    /// Persist one group's vote.
    async fn save_vote(&self, review: &Review, group: &ReviewGroup) -> ReviewResult<()>;

    /// Persist the aggregate status and revocation time.
    async fn save_status(&self, review: &Review) -> ReviewResult<()>;
}

/// Review store backed by a map, for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryReviewStore {
    reviews: RwLock<HashMap<String, Review>>,
}

impl InMemoryReviewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, review: Review) {
        self.reviews.write().await.insert(review.id.clone(), review);
    }

    pub async fn len(&self) -> usize {
        self.reviews.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.reviews.read().await.is_empty()
    }
}

impl ReviewStore for InMemoryReviewStore {
    async fn load(&self, review_id: &str) -> ReviewResult<Review> {
        self.reviews
            .read()
            .await
            .get(review_id)
            .cloned()
            .ok_or_else(|| ReviewError::NotFound {
                review_id: review_id.to_string(),
            })
    }

    async fn find_by_session(&self, session_id: &str) -> ReviewResult<Option<Review>> {
        Ok(self
            .reviews
            .read()
            .await
            .values()
            .find(|r| r.session_id == session_id)
            .cloned())
    }

    async fn save_vote(&self, review: &Review, group: &ReviewGroup) -> ReviewResult<()> {
        let mut reviews = self.reviews.write().await;
        let stored = reviews
            .get_mut(&review.id)
            .ok_or_else(|| ReviewError::NotFound {
                review_id: review.id.clone(),
            })?;
        let slot = stored
            .groups
            .iter_mut()
            .find(|g| g.id == group.id)
            .ok_or_else(|| ReviewError::GroupNotFound {
                group: group.group.clone(),
            })?;
        *slot = group.clone();
        Ok(())
    }

    async fn save_status(&self, review: &Review) -> ReviewResult<()> {
        let mut reviews = self.reviews.write().await;
        let stored = reviews
            .get_mut(&review.id)
            .ok_or_else(|| ReviewError::NotFound {
                review_id: review.id.clone(),
            })?;
        stored.status = review.status;
        stored.revoke_at = review.revoke_at;
        Ok(())
    }
}
