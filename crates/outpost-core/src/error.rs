use thiserror::Error;

/// Errors produced by the outpost transport and supervisor layers.
///
/// A clean end of stream is not represented here: receivers yield `None`
/// and session loops return `Ok(())` when the peer closes deliberately.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The peer could not be reached (TCP, TLS, DNS or handshake timeout).
    #[error("dial error: {0}")]
    Dial(String),

    /// The peer refused the stream setup for a reason other than credentials.
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// The peer refused the bearer token.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Mid-stream I/O failure. Recovery means dialing again from scratch.
    #[error("stream error: {0}")]
    Stream(String),

    /// The send half was already closed, locally or by the peer.
    #[error("stream closed")]
    StreamClosed,

    #[error("codec error: {0}")]
    Codec(String),

    /// Missing or malformed configuration (environment, DSN, discovery response).
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether this error means the peer rejected our credentials.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, TunnelError::Unauthenticated(_))
    }
}

impl From<ciborium::de::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
