//! Review data model.
//!
//! A [`Review`] gates one session. It carries an ordered list of
//! [`ReviewGroup`]s; each group casts exactly one vote. The aggregate
//! `status` is owned by [`crate::ReviewEngine`]: it can be read anywhere but
//! only the engine writes it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate status of a review.
///
/// Transitions:
/// - Pending → Approved (every group approved)
/// - Pending → Rejected (any group rejected)
/// - Approved → Revoked (access window closed, or explicit revocation)
/// - Approved → Processing → Executing → Executed (one-time execution)
/// - Approved → Executing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Revoked,
    Processing,
    Executing,
    Executed,
}

impl ReviewStatus {
    /// Terminal statuses never change again.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Revoked | Self::Executed)
    }

    #[must_use]
    pub fn can_transition_to(&self, to: ReviewStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Revoked)
                | (Self::Approved, Self::Processing)
                | (Self::Approved, Self::Executing)
                | (Self::Processing, Self::Executing)
                | (Self::Executing, Self::Executed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Revoked => "REVOKED",
            Self::Processing => "PROCESSING",
            Self::Executing => "EXECUTING",
            Self::Executed => "EXECUTED",
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single reviewer group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GroupStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub(crate) fn group_status(self) -> GroupStatus {
        match self {
            Decision::Approve => GroupStatus::Approved,
            Decision::Reject => GroupStatus::Rejected,
        }
    }
}

/// `onetime` reviews gate a single execution; `jit` reviews grant a time-boxed
/// access window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewType {
    #[serde(rename = "onetime")]
    OneTime,
    Jit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOwner {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub slack_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewConnection {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
}

/// One voter group of a review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewGroup {
    pub id: String,
    /// Name of the user group whose members may vote.
    pub group: String,
    pub(crate) status: GroupStatus,
    #[serde(default)]
    pub(crate) reviewed_by: Option<ReviewOwner>,
    #[serde(default)]
    pub(crate) review_date: Option<DateTime<Utc>>,
}

impl ReviewGroup {
    pub fn new(id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
            status: GroupStatus::Pending,
            reviewed_by: None,
            review_date: None,
        }
    }

    pub fn status(&self) -> GroupStatus {
        self.status
    }

    pub fn reviewed_by(&self) -> Option<&ReviewOwner> {
        self.reviewed_by.as_ref()
    }

    pub fn review_date(&self) -> Option<DateTime<Utc>> {
        self.review_date
    }
}

/// Approval record for one gated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    #[serde(rename = "org")]
    pub org_id: String,
    #[serde(rename = "session")]
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub review_type: ReviewType,
    #[serde(default)]
    pub input: String,
    #[serde(rename = "input_envvars", default)]
    pub input_env_vars: BTreeMap<String, String>,
    #[serde(rename = "input_clientargs", default)]
    pub input_client_args: Vec<String>,
    /// Length of the access window granted on approval, in seconds. Zero
    /// means the approval does not expire on its own.
    #[serde(rename = "access_duration", default)]
    pub access_duration_secs: u64,
    pub(crate) status: ReviewStatus,
    #[serde(default)]
    pub(crate) revoke_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: String,
    #[serde(rename = "review_owner")]
    pub owner: ReviewOwner,
    #[serde(rename = "review_connection")]
    pub connection: ReviewConnection,
    #[serde(rename = "review_groups_data")]
    pub(crate) groups: Vec<ReviewGroup>,
}

impl Review {
    /// A new pending review. Group order is kept.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        org_id: impl Into<String>,
        session_id: impl Into<String>,
        review_type: ReviewType,
        owner: ReviewOwner,
        connection: ReviewConnection,
        groups: Vec<ReviewGroup>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            org_id: org_id.into(),
            session_id: session_id.into(),
            created_at: now,
            review_type,
            input: String::new(),
            input_env_vars: BTreeMap::new(),
            input_client_args: Vec::new(),
            access_duration_secs: 0,
            status: ReviewStatus::Pending,
            revoke_at: None,
            created_by: owner.id.clone(),
            owner,
            connection,
            groups,
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    pub fn with_access_duration(mut self, secs: u64) -> Self {
        self.access_duration_secs = secs;
        self
    }

    pub fn status(&self) -> ReviewStatus {
        self.status
    }

    pub fn revoke_at(&self) -> Option<DateTime<Utc>> {
        self.revoke_at
    }

    pub fn groups(&self) -> &[ReviewGroup] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&ReviewGroup> {
        self.groups.iter().find(|g| g.group == name)
    }

    /// Access window granted on approval, if any.
    pub fn access_window(&self) -> Option<Duration> {
        if self.access_duration_secs == 0 {
            return None;
        }
        i64::try_from(self.access_duration_secs)
            .ok()
            .and_then(Duration::try_seconds)
    }
}
