//! Connection supervisor: establishes the transport and keeps it up
//! according to the agent's bootstrap mode.
//!
//! The supervisor walks the phases of [`crate::policy`]. Dialing, the
//! session loop, delays and the operator prompt are injected so each mode's
//! timing and exit conditions can be driven step by step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use outpost_core::{ConnectionIdentity, TunnelResult};

use crate::clock::Sleeper;
use crate::discovery::{classify_poll, Discovery, PollResult};
use crate::observe::ErrorReporter;
use crate::policy::{self, ExitReason, Outcome, Phase, RetryPolicy};
use crate::transport::Transport;

/// Opens a connection for one attempt.
#[allow(async_fn_in_trait)]
pub trait Dialer: Send + Sync {
    type Conn: Send;

    async fn dial(&self, identity: &ConnectionIdentity) -> TunnelResult<Self::Conn>;
}

/// Session multiplexing loop run on top of an established connection.
///
/// `Ok(())` means the peer ended the stream cleanly.
#[allow(async_fn_in_trait)]
pub trait SessionLoop<C>: Send + Sync {
    async fn run(&self, conn: C) -> TunnelResult<()>;
}

/// Operator-facing output.
pub trait Prompt: Send + Sync {
    /// Show the device-registration URL.
    fn registration_url(&self, url: &str);
}

/// Prints the registration banner on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompt;

impl Prompt for ConsolePrompt {
    fn registration_url(&self, url: &str) {
        let rule = "-".repeat(74);
        println!("\n{rule}");
        println!("VISIT THE URL BELOW TO REGISTER THE AGENT");
        println!("{url}");
        println!("{rule}\n");
    }
}

/// Dials the gateway over WebSocket.
#[derive(Clone)]
pub struct WsDialer {
    reporter: Arc<dyn ErrorReporter>,
}

impl WsDialer {
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { reporter }
    }
}

impl Dialer for WsDialer {
    type Conn = Arc<Transport>;

    async fn dial(&self, identity: &ConnectionIdentity) -> TunnelResult<Self::Conn> {
        Transport::connect(identity, self.reporter.clone())
            .await
            .map(Arc::new)
    }
}

/// How the agent finds and authenticates to its gateway.
pub enum Mode {
    /// Known address and token; one attempt.
    Direct { identity: ConnectionIdentity },
    /// Unregistered token; poll until an operator registers the agent.
    Registration {
        identity: ConnectionIdentity,
        register_url: String,
        /// Set once the gateway has acknowledged this identity.
        registered: Arc<AtomicBool>,
    },
    /// Address discovered through the API with a DSN. `template` carries
    /// the token and options; the address is filled in per lookup.
    Sidecar {
        discovery: Box<dyn Discovery>,
        template: ConnectionIdentity,
    },
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Direct { .. } => "direct",
            Mode::Registration { .. } => "register",
            Mode::Sidecar { .. } => "sidecar",
        }
    }

    fn initial_phase(&self) -> Phase {
        match self {
            Mode::Sidecar { .. } => Phase::Discovering {
                attempt: 0,
                poll: 0,
            },
            _ => Phase::Dialing { attempt: 0 },
        }
    }
}

/// How `Supervisor::run` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Clean,
    Fatal(String),
    Exhausted { attempts: u32 },
}

impl SupervisorExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorExit::Clean => 0,
            SupervisorExit::Fatal(_) | SupervisorExit::Exhausted { .. } => 1,
        }
    }
}

pub struct Supervisor<D: Dialer, L, S, P> {
    mode: Mode,
    dialer: D,
    session: L,
    sleeper: S,
    prompt: P,
    policy: RetryPolicy,
    phase: Phase,
    conn: Option<D::Conn>,
    target: Option<ConnectionIdentity>,
    prompted: bool,
}

impl<D, L, S, P> Supervisor<D, L, S, P>
where
    D: Dialer,
    L: SessionLoop<D::Conn>,
    S: Sleeper,
    P: Prompt,
{
    pub fn new(mode: Mode, dialer: D, session: L, sleeper: S, prompt: P) -> Self {
        let phase = mode.initial_phase();
        Self {
            mode,
            dialer,
            session,
            sleeper,
            prompt,
            policy: RetryPolicy::default(),
            phase,
            conn: None,
            target: None,
            prompted: false,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Advance by one phase. Terminal phases stay where they are.
    pub async fn step(&mut self) -> &Phase {
        let next = match self.phase.clone() {
            Phase::Discovering { attempt, poll } => self.discover(attempt, poll).await,
            Phase::Dialing { attempt } => self.dial(attempt).await,
            Phase::Streaming { attempt } => self.stream(attempt).await,
            Phase::Backoff { delay, then } => {
                self.sleeper.sleep(delay).await;
                *then
            }
            terminal => terminal,
        };
        self.phase = next;
        &self.phase
    }

    /// Drive the phases until the mode gives up or exits.
    pub async fn run(&mut self) -> SupervisorExit {
        loop {
            match self.step().await {
                Phase::Exited(ExitReason::Clean) => return SupervisorExit::Clean,
                Phase::Exited(ExitReason::Fatal(reason)) => {
                    return SupervisorExit::Fatal(reason.clone())
                }
                Phase::Exhausted { attempts } => {
                    warn!(attempts = *attempts, "timeout on registering the agent");
                    return SupervisorExit::Exhausted {
                        attempts: *attempts,
                    };
                }
                _ => {}
            }
        }
    }

    async fn discover(&mut self, attempt: u32, poll: u32) -> Phase {
        let Mode::Sidecar {
            discovery,
            template,
        } = &self.mode
        else {
            return Phase::Dialing { attempt };
        };
        if poll == 0 {
            info!("waiting for connection request");
        }

        let result = match discovery.poll().await {
            Ok(response) => classify_poll(&response),
            Err(e) => {
                warn!(poll = poll + 1, error = %e, "failed connecting to api");
                return policy::sidecar_pending(attempt, poll, &self.policy);
            }
        };
        match result {
            PollResult::Ready(discovered) => {
                info!(
                    url = %discovered.url,
                    tls = !discovered.plaintext,
                    "discovered gateway"
                );
                let mut identity = template.clone().with_insecure(discovered.plaintext);
                identity.server_address = discovered.address;
                self.target = Some(identity);
                policy::sidecar_discovered(attempt)
            }
            PollResult::NotReady => policy::sidecar_pending(attempt, poll, &self.policy),
            PollResult::Unauthorized => {
                warn!("dsn is disabled or invalid, contact the administrator");
                policy::sidecar_pending(attempt, poll, &self.policy)
            }
            PollResult::Unexpected { status, body } => {
                warn!(status, body = %body, "unexpected discovery response");
                policy::sidecar_pending(attempt, poll, &self.policy)
            }
            PollResult::Invalid(reason) => {
                warn!(reason = %reason, "failed decoding discovery response");
                policy::sidecar_pending(attempt, poll, &self.policy)
            }
        }
    }

    async fn dial(&mut self, attempt: u32) -> Phase {
        let identity = match &self.mode {
            Mode::Direct { identity } | Mode::Registration { identity, .. } => identity.clone(),
            Mode::Sidecar { .. } => match self.target.clone() {
                Some(identity) => identity,
                None => return Phase::Discovering { attempt, poll: 0 },
            },
        };
        info!(
            mode = self.mode.name(),
            gateway = identity.resolved_address(),
            tls = !identity.is_plaintext(),
            attempt = attempt + 1,
            "connecting"
        );

        match self.dialer.dial(&identity).await {
            Ok(conn) => {
                self.conn = Some(conn);
                Phase::Streaming { attempt }
            }
            Err(e) => {
                warn!(
                    gateway = identity.resolved_address(),
                    attempt = attempt + 1,
                    error = %e,
                    "failed to connect"
                );
                let outcome = Outcome::from_error(&e);
                match self.mode {
                    Mode::Sidecar { .. } => policy::sidecar_dial_failed(attempt, &self.policy),
                    _ => self.after_attempt(attempt, outcome),
                }
            }
        }
    }

    async fn stream(&mut self, attempt: u32) -> Phase {
        let Some(conn) = self.conn.take() else {
            return Phase::Dialing { attempt };
        };
        let result = self.session.run(conn).await;
        let outcome = Outcome::classify(&result);

        let gateway = self.gateway();
        match &outcome {
            Outcome::CleanEnd => info!(gateway = %gateway, attempt = attempt + 1, "disconnected"),
            Outcome::Unauthenticated(reason) | Outcome::Failed(reason) => warn!(
                gateway = %gateway,
                attempt = attempt + 1,
                error = %reason,
                "disconnected"
            ),
        }

        match self.mode {
            Mode::Sidecar { .. } => {
                policy::sidecar_session_ended(attempt, &outcome, &self.policy)
            }
            _ => self.after_attempt(attempt, outcome),
        }
    }

    /// Next phase for the direct and registration modes.
    fn after_attempt(&mut self, attempt: u32, outcome: Outcome) -> Phase {
        match &self.mode {
            Mode::Direct { .. } => policy::direct(&outcome),
            Mode::Registration {
                register_url,
                registered,
                ..
            } => {
                let registered = registered.load(Ordering::SeqCst);
                if !registered && matches!(outcome, Outcome::Unauthenticated(_)) && !self.prompted {
                    self.prompt.registration_url(register_url);
                    self.prompted = true;
                }
                policy::registration(attempt, &outcome, registered, &self.policy)
            }
            Mode::Sidecar { .. } => {
                policy::sidecar_session_ended(attempt, &outcome, &self.policy)
            }
        }
    }

    fn gateway(&self) -> String {
        match &self.mode {
            Mode::Direct { identity } | Mode::Registration { identity, .. } => {
                identity.resolved_address().to_string()
            }
            Mode::Sidecar { .. } => self
                .target
                .as_ref()
                .map(|t| t.resolved_address().to_string())
                .unwrap_or_default(),
        }
    }
}
