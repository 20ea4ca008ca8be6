//! Bootstrap identity and handshake metadata attached to every dial.
//!
//! A [`ConnectionIdentity`] is built before each connection attempt. Its
//! context metadata is an ordered list of `(key, value)` pairs: static host
//! facts first, then caller-supplied options such as `origin` and
//! `connection-name`.

use std::fmt;
use std::time::Duration;

use sha2::{Digest, Sha256};

/// Well-known local gateway address. Dialing it selects the plaintext path.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8010";

/// Default bound on how long a dial + stream handshake may take.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Who initiated the connection, as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Agent,
    Client,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Agent => "agent",
            Origin::Client => "client",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static facts about the host the agent runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMetadata {
    pub version: String,
    pub compiler: String,
    pub platform: String,
    pub hostname: String,
    pub machine_id: String,
    pub kernel_version: String,
}

impl HostMetadata {
    /// Collect metadata from the running system.
    pub fn detect() -> Self {
        let hostname = sysinfo::System::host_name().unwrap_or_default();
        let machine_id = read_machine_id().unwrap_or_else(|| derive_machine_id(&hostname));
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            compiler: "rustc".to_string(),
            platform: format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
            hostname,
            machine_id,
            kernel_version: sysinfo::System::kernel_version().unwrap_or_default(),
        }
    }

    fn pairs(&self) -> [(&'static str, &str); 6] {
        [
            ("version", &self.version),
            ("compiler", &self.compiler),
            ("platform", &self.platform),
            ("hostname", &self.hostname),
            ("machine_id", &self.machine_id),
            ("kernel_version", &self.kernel_version),
        ]
    }
}

fn read_machine_id() -> Option<String> {
    ["/etc/machine-id", "/var/lib/dbus/machine-id"]
        .iter()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
}

/// Stable stand-in for hosts without a machine-id file.
fn derive_machine_id(hostname: &str) -> String {
    let digest = Sha256::digest(hostname.as_bytes());
    hex::encode(&digest[..16])
}

/// Everything needed to dial the gateway once.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    /// `host:port` of the gateway. Empty means [`DEFAULT_ADDRESS`].
    pub server_address: String,
    /// Bearer token presented to the gateway.
    pub token: String,
    pub origin: Origin,
    pub user_agent: String,
    /// Force the plaintext path even for a non-default address.
    pub insecure: bool,
    pub connect_timeout: Duration,
    options: Vec<(String, String)>,
}

impl ConnectionIdentity {
    pub fn new(server_address: impl Into<String>, token: impl Into<String>, origin: Origin) -> Self {
        Self {
            server_address: server_address.into(),
            token: token.into(),
            origin,
            user_agent: format!("outpost/{}", env!("CARGO_PKG_VERSION")),
            insecure: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            options: vec![("origin".to_string(), origin.as_str().to_string())],
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Append a caller-supplied `(key, value)` pair to the handshake metadata.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Caller-supplied options, in insertion order.
    pub fn options(&self) -> &[(String, String)] {
        &self.options
    }

    /// The address actually dialed.
    pub fn resolved_address(&self) -> &str {
        if self.server_address.is_empty() {
            DEFAULT_ADDRESS
        } else {
            &self.server_address
        }
    }

    /// Plaintext is used for the well-known local address or when forced.
    pub fn is_plaintext(&self) -> bool {
        self.insecure || self.resolved_address() == DEFAULT_ADDRESS
    }

    /// Ordered handshake metadata for this dial.
    ///
    /// On the plaintext path the bearer token travels here as an explicit
    /// `authorization` entry, placed first. On the TLS path it is attached
    /// separately as a per-request credential and never appears in this list.
    pub fn context_metadata(&self, host: &HostMetadata) -> Vec<(String, String)> {
        let mut metadata = Vec::with_capacity(8 + self.options.len());
        if self.is_plaintext() {
            metadata.push(("authorization".to_string(), self.bearer()));
        }
        for (k, v) in host.pairs() {
            metadata.push((k.to_string(), v.to_string()));
        }
        metadata.extend(self.options.iter().cloned());
        metadata
    }

    /// `Bearer <token>` credential value.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}
