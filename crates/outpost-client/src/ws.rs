//! WebSocket link for the agent's duplex stream.
//!
//! Every binary message carries exactly one length-prefixed packet frame.
//! The handshake metadata travels as HTTP headers on the upgrade request.
//!
//! Close codes:
//! - `1000` / `1001`: the peer ended the stream deliberately (clean end)
//! - `4401`: the peer refused the bearer token
//! - anything else: stream error

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::http::{Request, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use outpost_core::metadata::HostMetadata;
use outpost_core::{ConnectionIdentity, TunnelError, TunnelResult};

use crate::link::{FrameSink, FrameSource, LinkFuture};

/// Path of the streaming endpoint on the gateway.
pub const STREAM_PATH: &str = "/api/stream";

/// Close code a gateway uses to reject the agent's credentials mid-stream.
pub const CLOSE_UNAUTHENTICATED: u16 = 4401;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// URL dialed for an identity: `ws://` on the plaintext path, `wss://` otherwise.
pub fn stream_url(identity: &ConnectionIdentity) -> String {
    let scheme = if identity.is_plaintext() { "ws" } else { "wss" };
    format!("{scheme}://{}{STREAM_PATH}", identity.resolved_address())
}

/// Build the upgrade request carrying the handshake metadata and credentials.
pub fn build_request(
    identity: &ConnectionIdentity,
    host: &HostMetadata,
) -> TunnelResult<Request<()>> {
    let url = stream_url(identity);
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TunnelError::Config(format!("invalid gateway address {url}: {e}")))?;

    let headers = request.headers_mut();
    for (key, value) in identity.context_metadata(host) {
        append_header(headers, &key, &value)?;
    }
    // On TLS the token is a per-request credential rather than metadata.
    if !identity.is_plaintext() {
        append_header(headers, "authorization", &identity.bearer())?;
    }
    append_header(headers, "user-agent", &identity.user_agent)?;

    Ok(request)
}

fn append_header(headers: &mut HeaderMap, key: &str, value: &str) -> TunnelResult<()> {
    let name = HeaderName::from_bytes(key.as_bytes())
        .map_err(|e| TunnelError::Config(format!("invalid metadata key {key:?}: {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| TunnelError::Config(format!("invalid metadata value for {key:?}: {e}")))?;
    headers.append(name, value);
    Ok(())
}

/// Dial the gateway and complete the WebSocket handshake.
pub async fn connect(
    identity: &ConnectionIdentity,
    host: &HostMetadata,
) -> TunnelResult<(WsSink, WsSource)> {
    let address = identity.resolved_address().to_string();
    let request = build_request(identity, host)?;

    debug!(gateway = %address, tls = !identity.is_plaintext(), "dialing gateway");

    let (ws, _response) = tokio::time::timeout(identity.connect_timeout, connect_async(request))
        .await
        .map_err(|_| {
            TunnelError::Dial(format!(
                "handshake with {address} timed out after {:?}",
                identity.connect_timeout
            ))
        })?
        .map_err(|e| classify_handshake_error(&address, e))?;

    info!(gateway = %address, "stream established");

    let (sink, stream) = ws.split();
    Ok((WsSink { inner: sink }, WsSource { inner: stream }))
}

fn classify_handshake_error(address: &str, err: WsError) -> TunnelError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                TunnelError::Unauthenticated(format!("gateway {address} refused credentials ({status})"))
            } else {
                TunnelError::Handshake(format!("gateway {address} answered {status}"))
            }
        }
        WsError::Url(e) => TunnelError::Config(format!("invalid gateway url for {address}: {e}")),
        WsError::Protocol(e) => TunnelError::Handshake(format!("{address}: {e}")),
        other => TunnelError::Dial(format!("{address}: {other}")),
    }
}

fn map_write_error(err: WsError) -> TunnelError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TunnelError::StreamClosed,
        other => TunnelError::Stream(format!("websocket write: {other}")),
    }
}

/// Write half of the WebSocket link.
pub struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

impl FrameSink for WsSink {
    fn send(&mut self, frame: Vec<u8>) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            self.inner
                .send(Message::Binary(frame))
                .await
                .map_err(map_write_error)
        })
    }

    fn close_send(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            self.inner
                .send(Message::Close(Some(frame)))
                .await
                .map_err(map_write_error)
        })
    }

    fn shutdown(&mut self) -> LinkFuture<'_, ()> {
        Box::pin(async move {
            match self.inner.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
                Err(e) => Err(TunnelError::Stream(format!("websocket teardown: {e}"))),
            }
        })
    }
}

/// Read half of the WebSocket link.
pub struct WsSource {
    inner: SplitStream<WsStream>,
}

impl FrameSource for WsSource {
    fn recv(&mut self) -> LinkFuture<'_, Option<Vec<u8>>> {
        Box::pin(async move {
            loop {
                match self.inner.next().await {
                    None => return Ok(None),
                    Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                    Some(Ok(Message::Close(frame))) => return close_outcome(frame),
                    // Pings are answered by tungstenite itself; text is not part of the protocol.
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed)) => return Ok(None),
                    Some(Err(e)) => return Err(TunnelError::Stream(format!("websocket read: {e}"))),
                }
            }
        })
    }
}

fn close_outcome(frame: Option<CloseFrame<'_>>) -> TunnelResult<Option<Vec<u8>>> {
    let Some(frame) = frame else {
        return Ok(None);
    };
    let code = u16::from(frame.code);
    match frame.code {
        CloseCode::Normal | CloseCode::Away => Ok(None),
        _ if code == CLOSE_UNAUTHENTICATED => Err(TunnelError::Unauthenticated(frame.reason.to_string())),
        _ => Err(TunnelError::Stream(format!(
            "peer closed the stream with code {code}: {}",
            frame.reason
        ))),
    }
}
