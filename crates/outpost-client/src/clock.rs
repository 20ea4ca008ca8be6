//! Timed delays for the supervisor's retry loops.

use std::time::Duration;

/// Source of the fixed delays between connection attempts.
///
/// Production code sleeps on the tokio timer; tests record the requested
/// delays instead of waiting them out.
#[allow(async_fn_in_trait)]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}
