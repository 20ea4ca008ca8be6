//! outpost-agent: outbound tunnel agent.
//!
//! Dials the gateway from inside a private network and keeps the stream up
//! in one of three bootstrap modes: direct, device registration or sidecar
//! discovery.

mod agent;
mod config;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use agent::AgentLoop;
use config::{expand_tilde, AgentConfig, AgentMode, ConfigFile, Inputs, ModeChoice};
use outpost_client::{
    ConsolePrompt, ErrorReporter, HttpDiscovery, Mode, RetryPolicy, Supervisor, SupervisorExit,
    TokioSleeper, TracingReporter, WsDialer,
};
use outpost_core::{ConnectionIdentity, Origin};

/// Outbound tunnel agent
#[derive(Parser, Debug)]
#[command(name = "outpost-agent", version, about = "Outbound tunnel agent")]
struct Cli {
    /// Gateway address (host:port)
    #[arg(long, env = "HOOP_GRPC_URL")]
    server_address: Option<String>,

    /// Agent token
    #[arg(long, env = "HOOP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// API base URL used to build the registration link
    #[arg(long, env = "HOOP_API_URL", default_value = "http://127.0.0.1:8009")]
    api_url: String,

    /// Bootstrap mode
    #[arg(long, value_enum, default_value_t = ModeChoice::Auto)]
    mode: ModeChoice,

    /// Saved identity file
    #[arg(long, default_value = "~/.outpost/agent.toml")]
    config: String,

    /// Seconds between keepalive packets
    #[arg(long, default_value_t = 10)]
    keepalive_secs: u64,

    /// Bound on dial + handshake, in seconds
    #[arg(long, default_value_t = 15)]
    connect_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "agent failed to start");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let inputs = Inputs {
        server_address: cli.server_address,
        token: cli.token,
        api_url: cli.api_url,
        mode: cli.mode,
        config_path: expand_tilde(&cli.config),
        keepalive_secs: cli.keepalive_secs,
        connect_timeout_secs: cli.connect_timeout_secs,
    };
    let file = ConfigFile::load(&inputs.config_path)?;
    let config = Arc::new(AgentConfig::resolve(&inputs, &file, |key| {
        std::env::var(key).ok()
    })?);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        platform = %format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        mode = %config.mode,
        gateway = %config.server_address,
        "starting agent"
    );

    let policy = RetryPolicy::default();
    let registered = Arc::new(AtomicBool::new(false));
    let mode = build_mode(&config, registered.clone(), policy.discovery_timeout)?;
    let reporter: Arc<dyn ErrorReporter> = Arc::new(TracingReporter);
    let mut supervisor = Supervisor::new(
        mode,
        WsDialer::new(reporter),
        AgentLoop::new(config.clone(), registered),
        TokioSleeper,
        ConsolePrompt,
    )
    .with_policy(policy);

    tokio::select! {
        exit = supervisor.run() => {
            match &exit {
                SupervisorExit::Clean => info!("disconnected"),
                SupervisorExit::Fatal(reason) => error!(reason = %reason, "disconnected"),
                SupervisorExit::Exhausted { attempts } => {
                    warn!(attempts, "agent was not registered in time")
                }
            }
            Ok(exit.exit_code())
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            Ok(0)
        }
    }
}

fn build_mode(
    config: &AgentConfig,
    registered: Arc<AtomicBool>,
    discovery_timeout: Duration,
) -> Result<Mode> {
    let user_agent = format!("outpost-agent/{}", env!("CARGO_PKG_VERSION"));
    let identity = ConnectionIdentity::new(&config.server_address, &config.token, Origin::Agent)
        .with_user_agent(&user_agent)
        .with_connect_timeout(config.connect_timeout);

    Ok(match &config.mode {
        AgentMode::Direct => Mode::Direct { identity },
        AgentMode::Register { register_url } => Mode::Registration {
            identity,
            register_url: register_url.clone(),
            registered,
        },
        AgentMode::Sidecar {
            discovery_url,
            connection_name,
        } => {
            let discovery = HttpDiscovery::new(
                discovery_url,
                &config.token,
                connection_name,
                discovery_timeout,
            )?;
            info!(connection = %connection_name, api_url = %discovery_url, "sidecar discovery");
            Mode::Sidecar {
                discovery: Box::new(discovery),
                template: identity
                    .with_user_agent(format!("outpost-agent/sdk-{}", env!("CARGO_PKG_VERSION")))
                    .with_option("connection-name", connection_name),
            }
        }
    })
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
