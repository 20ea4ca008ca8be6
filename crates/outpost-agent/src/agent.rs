//! Session loop run by the agent on each established transport.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use outpost_client::{SessionLoop, Transport};
use outpost_core::packet::{PacketType, SPEC_CONNECTION_NAME, SPEC_SESSION_ID};
use outpost_core::{Packet, TunnelError, TunnelResult};

use crate::config::{AgentConfig, AgentMode};

/// Serves one connection: keepalive, session bookkeeping and control
/// packets. Protocol payloads are opaque here.
pub struct AgentLoop {
    config: Arc<AgentConfig>,
    /// Shared with the supervisor; set once the gateway accepts a
    /// registration token.
    registered: Arc<AtomicBool>,
}

impl AgentLoop {
    pub fn new(config: Arc<AgentConfig>, registered: Arc<AtomicBool>) -> Self {
        Self { config, registered }
    }

    async fn serve(&self, transport: &Transport) -> TunnelResult<()> {
        let mut sessions: HashSet<String> = HashSet::new();
        loop {
            let Some(packet) = transport.recv().await? else {
                debug!(open_sessions = sessions.len(), "gateway closed the stream");
                return Ok(());
            };
            match packet.packet_type {
                PacketType::KeepAlive => {}
                PacketType::ConnectOk => self.on_connected(),
                PacketType::Error => {
                    let message = String::from_utf8_lossy(&packet.payload).to_string();
                    if packet.is_unauthenticated_error() {
                        return Err(TunnelError::Unauthenticated(message));
                    }
                    warn!(error = %message, "gateway reported an error");
                }
                PacketType::SessionOpen => {
                    let Some(session_id) = packet.session_id().map(str::to_string) else {
                        warn!("session open without a session id");
                        continue;
                    };
                    let mut reply = Packet::new(PacketType::SessionOpenOk, Vec::new())
                        .with_spec(SPEC_SESSION_ID, &session_id);
                    if let Some(name) = packet.spec_str(SPEC_CONNECTION_NAME) {
                        reply = reply.with_spec(SPEC_CONNECTION_NAME, name);
                    }
                    transport.send(&reply).await?;
                    info!(session = %session_id, "session opened");
                    sessions.insert(session_id);
                }
                PacketType::SessionClose => {
                    if let Some(session_id) = packet.session_id() {
                        if sessions.remove(session_id) {
                            info!(session = %session_id, "session closed");
                        }
                    }
                }
                PacketType::ReviewWait => {
                    info!(session = ?packet.session_id(), "session waiting for review");
                }
                PacketType::Data => match packet.session_id() {
                    Some(id) if sessions.contains(id) => {
                        debug!(session = %id, bytes = packet.payload.len(), "data");
                    }
                    other => {
                        debug!(session = ?other, "data for unknown session dropped");
                    }
                },
                PacketType::SessionOpenOk => {
                    debug!("ignoring unexpected session open ack");
                }
            }
        }
    }

    fn on_connected(&self) {
        info!(gateway = %self.gateway(), "connected");
        if !matches!(self.config.mode, AgentMode::Register { .. }) {
            return;
        }
        if self.registered.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.config.save_identity() {
            Ok(()) => info!(path = %self.config.config_path.display(), "agent registered, identity saved"),
            Err(e) => warn!(error = %format!("{e:#}"), "agent registered but saving the identity failed"),
        }
    }

    fn gateway(&self) -> &str {
        if self.config.server_address.is_empty() {
            outpost_core::DEFAULT_ADDRESS
        } else {
            &self.config.server_address
        }
    }
}

impl SessionLoop<Arc<Transport>> for AgentLoop {
    async fn run(&self, transport: Arc<Transport>) -> TunnelResult<()> {
        transport.start_keepalive(self.config.keepalive);
        let result = self.serve(&transport).await;

        let (send_half, teardown) = transport.close().await;
        if let Err(e) = send_half {
            debug!(error = %e, "closing send direction");
        }
        if let Err(e) = teardown {
            warn!(error = %e, "tearing down connection");
        }
        result
    }
}
