//! outpost-core: Shared protocol library for the outpost tunnel.
//!
//! Provides the packet envelope carried over the agent's duplex stream,
//! the length-prefixed CBOR codec, the error taxonomy shared by the
//! transport and supervisor, and the handshake metadata an agent attaches
//! to every dial.

pub mod codec;
pub mod error;
pub mod metadata;
pub mod packet;

// Re-export commonly used items at crate root.
pub use codec::{frame_encode, packet_decode, FrameDecoder, MAX_FRAME_LEN};
pub use error::{TunnelError, TunnelResult};
pub use metadata::{ConnectionIdentity, HostMetadata, Origin, DEFAULT_ADDRESS};
pub use packet::{Packet, PacketType};
