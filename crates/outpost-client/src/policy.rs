//! Supervisor phases and the transition rules of each bootstrap mode.
//!
//! Everything here is pure: given where the supervisor is and how the last
//! attempt ended, these functions name the next phase. Timing lives in the
//! `Backoff` phase, so the rules can be tested without sleeping.

use std::time::Duration;

use outpost_core::{TunnelError, TunnelResult};

/// Where the supervisor is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Sidecar only: polling the discovery endpoint. `poll` counts requests
    /// since the last successful lookup.
    Discovering { attempt: u32, poll: u32 },
    /// About to dial. `attempt` is zero-based.
    Dialing { attempt: u32 },
    /// Connected; the session loop owns the transport.
    Streaming { attempt: u32 },
    /// Waiting out a fixed delay before `then`.
    Backoff { delay: Duration, then: Box<Phase> },
    /// Registration window used up without the agent being registered.
    Exhausted { attempts: u32 },
    Exited(ExitReason),
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Exhausted { .. } | Phase::Exited(_))
    }

    pub fn backoff(delay: Duration, then: Phase) -> Self {
        Phase::Backoff {
            delay,
            then: Box::new(then),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Clean,
    Fatal(String),
}

/// How a dial or a streaming session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The peer closed the stream deliberately. Not an error.
    CleanEnd,
    /// The gateway refused the token.
    Unauthenticated(String),
    /// Dial, handshake, stream or configuration failure.
    Failed(String),
}

impl Outcome {
    pub fn classify(result: &TunnelResult<()>) -> Self {
        match result {
            Ok(()) => Outcome::CleanEnd,
            Err(e) => Self::from_error(e),
        }
    }

    pub fn from_error(error: &TunnelError) -> Self {
        if error.is_unauthenticated() {
            Outcome::Unauthenticated(error.to_string())
        } else {
            Outcome::Failed(error.to_string())
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self, Outcome::CleanEnd)
    }
}

/// Fixed delays and budgets of the retry loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Pause between device-registration attempts.
    pub registration_delay: Duration,
    /// Last attempt index that may still be unauthenticated (~3 minutes).
    pub registration_budget: u32,
    /// Pause between discovery polls.
    pub discovery_delay: Duration,
    /// Bound on a single discovery request.
    pub discovery_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            registration_delay: Duration::from_secs(7),
            registration_budget: 30,
            discovery_delay: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(5),
        }
    }
}

/// Direct mode never retries.
pub fn direct(outcome: &Outcome) -> Phase {
    match outcome {
        Outcome::CleanEnd => Phase::Exited(ExitReason::Clean),
        Outcome::Unauthenticated(reason) | Outcome::Failed(reason) => {
            Phase::Exited(ExitReason::Fatal(reason.clone()))
        }
    }
}

/// Device registration after attempt `attempt` ended with `outcome`.
///
/// An agent whose identity is already registered stops at the first
/// termination. Otherwise unauthenticated attempts are retried until the
/// budget is spent and everything else is retried indefinitely.
pub fn registration(
    attempt: u32,
    outcome: &Outcome,
    registered: bool,
    policy: &RetryPolicy,
) -> Phase {
    if registered {
        return direct(outcome);
    }
    if matches!(outcome, Outcome::Unauthenticated(_)) && attempt >= policy.registration_budget {
        return Phase::Exhausted {
            attempts: attempt + 1,
        };
    }
    Phase::backoff(
        policy.registration_delay,
        Phase::Dialing {
            attempt: attempt + 1,
        },
    )
}

/// Sidecar after a discovery poll that did not yield a target.
pub fn sidecar_pending(attempt: u32, poll: u32, policy: &RetryPolicy) -> Phase {
    Phase::backoff(
        policy.discovery_delay,
        Phase::Discovering {
            attempt,
            poll: poll + 1,
        },
    )
}

/// Sidecar once discovery produced a target.
pub fn sidecar_discovered(attempt: u32) -> Phase {
    Phase::Dialing { attempt }
}

/// Sidecar after a dial failed. The address may have changed, so discovery
/// starts over once the discovery delay has passed.
pub fn sidecar_dial_failed(attempt: u32, policy: &RetryPolicy) -> Phase {
    Phase::backoff(
        policy.discovery_delay,
        Phase::Discovering {
            attempt: attempt + 1,
            poll: 0,
        },
    )
}

/// Sidecar after a session ended. It runs unattended, so it always goes back
/// to discovery: right away after a clean end, after the discovery delay
/// otherwise.
pub fn sidecar_session_ended(attempt: u32, outcome: &Outcome, policy: &RetryPolicy) -> Phase {
    let next = Phase::Discovering {
        attempt: attempt + 1,
        poll: 0,
    };
    if outcome.is_clean() {
        next
    } else {
        Phase::backoff(policy.discovery_delay, next)
    }
}
