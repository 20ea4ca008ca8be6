//! Agent configuration.
//!
//! Flags, environment and the saved identity file at
//! `~/.outpost/agent.toml` are resolved once into an immutable
//! [`AgentConfig`] at startup.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use outpost_client::discovery::{discovery_url, resolve_connection_name, DSN_ENV};

/// Prefix of tokens generated for device registration.
pub const REGISTRATION_TOKEN_PREFIX: &str = "x-agt-";

/// Saved identity file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: SavedAgent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedAgent {
    #[serde(default)]
    pub server_address: String,
    #[serde(default)]
    pub token: String,
}

impl ConfigFile {
    /// Load the saved identity, or an empty one when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: ConfigFile = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Write the file, readable by the owner only.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .with_context(|| format!("failed to open config at {}", path.display()))?;

        // `mode` only applies on creation; tighten a pre-existing file before
        // the token is written.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(content.as_bytes())
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(())
    }
}

/// Requested bootstrap mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ModeChoice {
    /// Sidecar when a DSN is set, direct when a token is known, registration otherwise.
    Auto,
    Direct,
    Register,
    Sidecar,
}

/// Resolved bootstrap mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMode {
    Direct,
    Register {
        /// URL the operator visits to register this agent.
        register_url: String,
    },
    Sidecar {
        discovery_url: String,
        connection_name: String,
    },
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentMode::Direct => f.write_str("direct"),
            AgentMode::Register { .. } => f.write_str("register"),
            AgentMode::Sidecar { .. } => f.write_str("sidecar"),
        }
    }
}

/// Raw inputs from the command line and environment.
#[derive(Debug, Clone)]
pub struct Inputs {
    pub server_address: Option<String>,
    pub token: Option<String>,
    pub api_url: String,
    pub mode: ModeChoice,
    pub config_path: PathBuf,
    pub keepalive_secs: u64,
    pub connect_timeout_secs: u64,
}

/// Immutable agent configuration, shared by reference.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub mode: AgentMode,
    /// Gateway address; empty selects the local default.
    pub server_address: String,
    /// Bearer token: agent token, registration token or DSN.
    pub token: String,
    pub config_path: PathBuf,
    pub keepalive: Duration,
    pub connect_timeout: Duration,
}

impl AgentConfig {
    /// Resolve the configuration. `lookup` reads environment variables.
    pub fn resolve(
        inputs: &Inputs,
        file: &ConfigFile,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let dsn = lookup(DSN_ENV).filter(|v| !v.is_empty());
        let token = inputs
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .or_else(|| Some(file.agent.token.clone()).filter(|t| !t.is_empty()));
        let server_address = inputs
            .server_address
            .clone()
            .filter(|a| !a.is_empty())
            .unwrap_or_else(|| file.agent.server_address.clone());

        let choice = match inputs.mode {
            ModeChoice::Auto if dsn.is_some() => ModeChoice::Sidecar,
            ModeChoice::Auto if token.is_some() => ModeChoice::Direct,
            ModeChoice::Auto => ModeChoice::Register,
            explicit => explicit,
        };

        let (mode, server_address, token) = match choice {
            ModeChoice::Sidecar => {
                let Some(dsn) = dsn else {
                    bail!("sidecar mode requires {DSN_ENV}");
                };
                let discovery_url = discovery_url(&dsn)?;
                let connection_name = resolve_connection_name(&lookup)?;
                let mode = AgentMode::Sidecar {
                    discovery_url,
                    connection_name,
                };
                // The address is discovered at runtime.
                (mode, String::new(), dsn)
            }
            ModeChoice::Direct => {
                let Some(token) = token else {
                    bail!("direct mode requires a token (--token or HOOP_TOKEN)");
                };
                (AgentMode::Direct, server_address, token)
            }
            ModeChoice::Register | ModeChoice::Auto => {
                let token = generate_token();
                let register_url = format!(
                    "{}/agents/new/{token}",
                    inputs.api_url.trim_end_matches('/')
                );
                (AgentMode::Register { register_url }, server_address, token)
            }
        };

        Ok(Self {
            mode,
            server_address,
            token,
            config_path: inputs.config_path.clone(),
            keepalive: Duration::from_secs(inputs.keepalive_secs.max(1)),
            connect_timeout: Duration::from_secs(inputs.connect_timeout_secs.max(1)),
        })
    }

    /// Persist this agent's identity once the gateway has accepted it.
    pub fn save_identity(&self) -> Result<()> {
        let file = ConfigFile {
            agent: SavedAgent {
                server_address: self.server_address.clone(),
                token: self.token.clone(),
            },
        };
        file.save(&self.config_path)
    }
}

/// Fresh device-registration token: `x-agt-` followed by 32 hex digits.
pub fn generate_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    format!("{REGISTRATION_TOKEN_PREFIX}{}", hex::encode(bytes))
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn inputs(mode: ModeChoice) -> Inputs {
        Inputs {
            server_address: None,
            token: None,
            api_url: "https://app.example.com/".into(),
            mode,
            config_path: PathBuf::from("/nonexistent/agent.toml"),
            keepalive_secs: 10,
            connect_timeout_secs: 15,
        }
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn auto_without_token_registers() {
        let cfg = AgentConfig::resolve(&inputs(ModeChoice::Auto), &ConfigFile::default(), env(&[]))
            .unwrap();
        assert!(cfg.token.starts_with(REGISTRATION_TOKEN_PREFIX));
        assert_eq!(cfg.token.len(), REGISTRATION_TOKEN_PREFIX.len() + 32);
        match &cfg.mode {
            AgentMode::Register { register_url } => assert_eq!(
                register_url,
                &format!("https://app.example.com/agents/new/{}", cfg.token)
            ),
            other => panic!("expected register mode, got {other:?}"),
        }
        assert_eq!(cfg.keepalive, Duration::from_secs(10));
    }

    #[test]
    fn auto_with_saved_token_is_direct() {
        let file = ConfigFile {
            agent: SavedAgent {
                server_address: "gw.example.com:443".into(),
                token: "x-agt-saved".into(),
            },
        };
        let cfg = AgentConfig::resolve(&inputs(ModeChoice::Auto), &file, env(&[])).unwrap();
        assert_eq!(cfg.mode, AgentMode::Direct);
        assert_eq!(cfg.token, "x-agt-saved");
        assert_eq!(cfg.server_address, "gw.example.com:443");
    }

    #[test]
    fn cli_overrides_saved_identity() {
        let file = ConfigFile {
            agent: SavedAgent {
                server_address: "old:443".into(),
                token: "old".into(),
            },
        };
        let mut i = inputs(ModeChoice::Auto);
        i.server_address = Some("new:443".into());
        i.token = Some("new-token".into());
        let cfg = AgentConfig::resolve(&i, &file, env(&[])).unwrap();
        assert_eq!(cfg.server_address, "new:443");
        assert_eq!(cfg.token, "new-token");
    }

    #[test]
    fn dsn_selects_sidecar() {
        let cfg = AgentConfig::resolve(
            &inputs(ModeChoice::Auto),
            &ConfigFile::default(),
            env(&[
                ("HOOP_DSN", "https://key@api.example.com"),
                ("HOOP_CONNECTION", "env.APP"),
                ("APP", "pg-prod"),
            ]),
        )
        .unwrap();
        assert_eq!(
            cfg.mode,
            AgentMode::Sidecar {
                discovery_url: "https://api.example.com/api/connectionapps".into(),
                connection_name: "pg-prod".into(),
            }
        );
        assert_eq!(cfg.token, "https://key@api.example.com");
        assert!(cfg.server_address.is_empty());
    }

    #[test]
    fn sidecar_without_connection_name_fails() {
        let err = AgentConfig::resolve(
            &inputs(ModeChoice::Sidecar),
            &ConfigFile::default(),
            env(&[("HOOP_DSN", "https://api.example.com")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("HOOP_CONNECTION"));
    }

    #[test]
    fn explicit_direct_needs_token() {
        assert!(
            AgentConfig::resolve(&inputs(ModeChoice::Direct), &ConfigFile::default(), env(&[]))
                .is_err()
        );
    }

    #[test]
    fn saved_identity_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.toml");

        let mut i = inputs(ModeChoice::Register);
        i.server_address = Some("gw.example.com:443".into());
        i.config_path = path.clone();
        let cfg = AgentConfig::resolve(&i, &ConfigFile::default(), env(&[])).unwrap();
        cfg.save_identity().unwrap();

        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded.agent.token, cfg.token);
        assert_eq!(loaded.agent.server_address, "gw.example.com:443");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn save_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "# stale\n".repeat(64)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let file = ConfigFile {
            agent: SavedAgent {
                server_address: "gw.example.com:443".into(),
                token: "x-agt-secret".into(),
            },
        };
        file.save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        // Truncated, so no stale bytes follow the new content.
        assert_eq!(ConfigFile::load(&path).unwrap().agent, file.agent);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ConfigFile::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.agent, SavedAgent::default());
    }

    #[test]
    fn tilde_expansion() {
        assert_eq!(expand_tilde("/etc/agent.toml"), PathBuf::from("/etc/agent.toml"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/.outpost/agent.toml"), home.join(".outpost/agent.toml"));
        }
    }
}
