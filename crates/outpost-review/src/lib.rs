//! outpost-review: approval workflow gating outpost sessions.
//!
//! A session under policy control carries a [`Review`] with one or more
//! reviewer groups. [`ReviewEngine`] owns the aggregate status (all groups
//! approve, any group rejects), the access window and revocation.
//! [`ReviewService`] serializes writes per review, and [`SessionGate`] asks
//! it whether a session's traffic may flow.

pub mod engine;
pub mod error;
pub mod gate;
pub mod service;
pub mod store;
pub mod types;

pub use engine::ReviewEngine;
pub use error::{ReviewError, ReviewResult};
pub use gate::{GateDecision, SessionGate};
pub use service::ReviewService;
pub use store::{InMemoryReviewStore, ReviewStore};
pub use types::{
    Decision, GroupStatus, Review, ReviewConnection, ReviewGroup, ReviewOwner, ReviewStatus,
    ReviewType,
};
