//! Error reporting for failures worth more than a log line.

use outpost_core::TunnelError;

/// Sink for exceptional transport failures (an error-tracking service in
/// production deployments).
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, context: &str, error: &TunnelError);
}

/// Default reporter: emits an `error!` event on the `outpost::report` target
/// so a subscriber can route it separately from ordinary logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture(&self, context: &str, error: &TunnelError) {
        tracing::error!(target: "outpost::report", context = %context, error = %error, "captured error");
    }
}
