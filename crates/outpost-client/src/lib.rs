//! outpost-client: agent side of the outpost tunnel.
//!
//! [`Transport`] wraps one duplex stream to the gateway: serialized sends,
//! ordered receives, a background keepalive and a two-part close.
//! [`Supervisor`] keeps that stream up under one of three bootstrap modes
//! (direct, device registration, sidecar discovery).

pub mod clock;
pub mod discovery;
pub mod keepalive;
pub mod link;
pub mod observe;
pub mod policy;
pub mod supervisor;
pub mod transport;
pub mod ws;

pub use clock::{Sleeper, TokioSleeper};
pub use discovery::{Discovery, HttpDiscovery};
pub use keepalive::{DEFAULT_KEEPALIVE_INTERVAL, MIN_KEEPALIVE_INTERVAL};
pub use observe::{ErrorReporter, TracingReporter};
pub use policy::{Outcome, Phase, RetryPolicy};
pub use supervisor::{
    ConsolePrompt, Dialer, Mode, Prompt, SessionLoop, Supervisor, SupervisorExit, WsDialer,
};
pub use transport::{StreamContext, StreamEnd, Transport};
