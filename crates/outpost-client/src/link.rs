//! Abstract frame link underneath a [`crate::Transport`].
//!
//! A link is split into a write half and a read half. The WebSocket link in
//! [`crate::ws`] is the production implementation; tests plug in-memory
//! halves in here.

use std::future::Future;
use std::pin::Pin;

use outpost_core::TunnelResult;

pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = TunnelResult<T>> + Send + 'a>>;

/// Write half of a link. Each call to `send` writes one complete frame.
pub trait FrameSink: Send + Sync {
    /// Write one encoded frame.
    fn send(&mut self, frame: Vec<u8>) -> LinkFuture<'_, ()>;

    /// Half-close: tell the peer no more frames will follow.
    fn close_send(&mut self) -> LinkFuture<'_, ()>;

    /// Tear down the underlying connection.
    fn shutdown(&mut self) -> LinkFuture<'_, ()>;
}

/// Read half of a link.
pub trait FrameSource: Send {
    /// Next chunk of frame bytes. `Ok(None)` = the peer closed cleanly.
    fn recv(&mut self) -> LinkFuture<'_, Option<Vec<u8>>>;
}
