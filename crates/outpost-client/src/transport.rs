//! Concurrency-safe wrapper around one duplex stream.
//!
//! `Transport` owns exactly one link. Sends and close serialize on a single
//! exclusive lock, so a close can never tear the connection down while a
//! frame is half written. Receives are made by one logical consumer and do
//! not touch that lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::debug;

use outpost_core::metadata::HostMetadata;
use outpost_core::{frame_encode, ConnectionIdentity, FrameDecoder, Packet, TunnelError, TunnelResult};

use crate::keepalive::KeepAlive;
use crate::link::{FrameSink, FrameSource};
use crate::observe::ErrorReporter;
use crate::ws;

/// Why a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The peer closed the stream deliberately.
    PeerClosed,
    /// The stream failed (I/O error, decode error, rejected credentials).
    Failed(String),
    /// `close` was called on this side.
    LocalClose,
}

/// Observer for the end of a transport's stream.
///
/// Lets a caller react to peer- or infrastructure-initiated termination
/// without owning the receive loop.
#[derive(Debug, Clone)]
pub struct StreamContext {
    rx: watch::Receiver<Option<StreamEnd>>,
}

impl StreamContext {
    /// How the stream ended, if it has.
    pub fn end(&self) -> Option<StreamEnd> {
        self.rx.borrow().clone()
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait until the stream ends.
    pub async fn done(&mut self) -> StreamEnd {
        match self.rx.wait_for(Option::is_some).await {
            Ok(end) => end.clone().unwrap_or(StreamEnd::LocalClose),
            // The transport was dropped without recording an end.
            Err(_) => StreamEnd::LocalClose,
        }
    }
}

/// Write side state, guarded by the transport's exclusive lock.
pub(crate) struct Writer {
    sink: Box<dyn FrameSink>,
    closed: bool,
}

struct Reader {
    source: Box<dyn FrameSource>,
    decoder: FrameDecoder,
    ready: VecDeque<Packet>,
}

/// One live connection to the gateway.
pub struct Transport {
    gateway: String,
    writer: Arc<Mutex<Writer>>,
    // Single consumer by construction; the lock is never contended.
    reader: Mutex<Reader>,
    reporter: Arc<dyn ErrorReporter>,
    keepalive: std::sync::Mutex<Option<KeepAlive>>,
    end_tx: watch::Sender<Option<StreamEnd>>,
}

impl Transport {
    /// Dial the gateway described by `identity` and complete the stream
    /// handshake. Host metadata is collected from the running system.
    pub async fn connect(
        identity: &ConnectionIdentity,
        reporter: Arc<dyn ErrorReporter>,
    ) -> TunnelResult<Self> {
        let host = HostMetadata::detect();
        let (sink, source) = ws::connect(identity, &host).await?;
        Ok(Self::from_link(
            identity.resolved_address(),
            Box::new(sink),
            Box::new(source),
            reporter,
        ))
    }

    /// Wrap an already established link.
    pub fn from_link(
        gateway: impl Into<String>,
        sink: Box<dyn FrameSink>,
        source: Box<dyn FrameSource>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        let (end_tx, _) = watch::channel(None);
        Self {
            gateway: gateway.into(),
            writer: Arc::new(Mutex::new(Writer { sink, closed: false })),
            reader: Mutex::new(Reader {
                source,
                decoder: FrameDecoder::new(),
                ready: VecDeque::new(),
            }),
            reporter,
            keepalive: std::sync::Mutex::new(None),
            end_tx,
        }
    }

    /// Address of the gateway this transport is connected to.
    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    /// Write one packet. Concurrent callers are serialized; the order in
    /// which they acquire the lock is the order on the wire.
    pub async fn send(&self, packet: &Packet) -> TunnelResult<()> {
        send_packet(&self.writer, self.reporter.as_ref(), &self.gateway, packet).await
    }

    /// Next packet in arrival order. `Ok(None)` = the peer closed cleanly.
    ///
    /// Meant for a single consumer; concurrent receivers are not supported.
    pub async fn recv(&self) -> TunnelResult<Option<Packet>> {
        let mut guard = self.reader.lock().await;
        let reader = &mut *guard;
        loop {
            if let Some(packet) = reader.ready.pop_front() {
                return Ok(Some(packet));
            }
            match reader.source.recv().await {
                Ok(Some(bytes)) => match reader.decoder.feed(&bytes) {
                    Ok(packets) => reader.ready.extend(packets),
                    Err(e) => {
                        self.finish(StreamEnd::Failed(e.to_string()));
                        return Err(e);
                    }
                },
                Ok(None) => {
                    if reader.decoder.pending() > 0 {
                        debug!(
                            gateway = %self.gateway,
                            pending = reader.decoder.pending(),
                            "stream ended with a partial frame"
                        );
                    }
                    self.finish(StreamEnd::PeerClosed);
                    return Ok(None);
                }
                Err(e) => {
                    self.finish(StreamEnd::Failed(e.to_string()));
                    return Err(e);
                }
            }
        }
    }

    /// Half-close the send direction, then tear down the connection.
    ///
    /// Both steps run under the send lock and both results are returned, in
    /// that order, whether or not the other one failed. The keepalive task is
    /// stopped and awaited afterwards. A repeated call reports
    /// [`TunnelError::StreamClosed`] for the send half and skips teardown.
    pub async fn close(&self) -> (TunnelResult<()>, TunnelResult<()>) {
        let results = {
            let mut writer = self.writer.lock().await;
            if writer.closed {
                (Err(TunnelError::StreamClosed), Ok(()))
            } else {
                writer.closed = true;
                let send_half = writer.sink.close_send().await;
                let teardown = writer.sink.shutdown().await;
                (send_half, teardown)
            }
        };
        self.finish(StreamEnd::LocalClose);
        self.stop_keepalive().await;
        results
    }

    /// Start sending keepalive packets every `interval` on a background task.
    /// Intervals below one second are raised to one second.
    ///
    /// The task stops on its own at the first failed send; `close` stops it
    /// explicitly. Calling this while a keepalive task runs is a no-op.
    pub fn start_keepalive(&self, interval: Duration) {
        let Ok(mut slot) = self.keepalive.lock() else {
            return;
        };
        if slot.as_ref().is_some_and(|k| !k.is_finished()) {
            debug!(gateway = %self.gateway, "keepalive already running");
            return;
        }
        *slot = Some(KeepAlive::spawn(
            self.writer.clone(),
            self.reporter.clone(),
            self.gateway.clone(),
            interval,
        ));
    }

    /// Whether a keepalive task is still running.
    pub fn keepalive_active(&self) -> bool {
        self.keepalive
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|k| !k.is_finished()))
            .unwrap_or(false)
    }

    /// Observer for the end of this stream.
    pub fn stream_context(&self) -> StreamContext {
        StreamContext {
            rx: self.end_tx.subscribe(),
        }
    }

    fn finish(&self, end: StreamEnd) {
        self.end_tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(end);
                true
            } else {
                false
            }
        });
    }

    async fn stop_keepalive(&self) {
        let keepalive = self.keepalive.lock().ok().and_then(|mut slot| slot.take());
        if let Some(keepalive) = keepalive {
            keepalive.stop().await;
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.keepalive.lock() {
            if let Some(keepalive) = slot.take() {
                keepalive.abort();
            }
        }
    }
}

/// Encode and write one packet under the send lock.
///
/// Failures other than an already closed stream are handed to the reporter.
pub(crate) async fn send_packet(
    writer: &Mutex<Writer>,
    reporter: &dyn ErrorReporter,
    gateway: &str,
    packet: &Packet,
) -> TunnelResult<()> {
    let frame = frame_encode(packet)?;
    let result = {
        let mut writer = writer.lock().await;
        if writer.closed {
            return Err(TunnelError::StreamClosed);
        }
        writer.sink.send(frame).await
    };
    if let Err(e) = &result {
        if !matches!(e, TunnelError::StreamClosed) {
            let context = format!("send {:?} to {gateway}", packet.packet_type);
            reporter.capture(&context, e);
        }
    }
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use outpost_core::packet::PacketType;
    use tokio::sync::mpsc;

    use crate::link::LinkFuture;

    /// Shared view of everything a fake sink observed.
    #[derive(Clone, Default)]
    pub(crate) struct Wire {
        pub bytes: Arc<std::sync::Mutex<Vec<u8>>>,
        pub frames: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
        pub fail_sends: Arc<AtomicBool>,
        pub fail_close_send: Arc<AtomicBool>,
        pub close_send_calls: Arc<AtomicUsize>,
        pub shutdown_calls: Arc<AtomicUsize>,
    }

    impl Wire {
        pub fn packets(&self) -> Vec<Packet> {
            let bytes = self.bytes.lock().unwrap().clone();
            FrameDecoder::new().feed(&bytes).unwrap().into_iter().collect()
        }

        pub fn count(&self, packet_type: PacketType) -> usize {
            self.packets()
                .iter()
                .filter(|p| p.packet_type == packet_type)
                .count()
        }
    }

    pub(crate) struct FakeSink {
        pub wire: Wire,
    }

    impl FrameSink for FakeSink {
        fn send(&mut self, frame: Vec<u8>) -> LinkFuture<'_, ()> {
            let wire = self.wire.clone();
            Box::pin(async move {
                if wire.fail_sends.load(Ordering::SeqCst) {
                    return Err(TunnelError::Stream("broken pipe".into()));
                }
                wire.frames.lock().unwrap().push(frame.clone());
                // Write in two halves with a yield in between, like a partial write.
                let mid = frame.len() / 2;
                wire.bytes.lock().unwrap().extend_from_slice(&frame[..mid]);
                tokio::task::yield_now().await;
                wire.bytes.lock().unwrap().extend_from_slice(&frame[mid..]);
                Ok(())
            })
        }

        fn close_send(&mut self) -> LinkFuture<'_, ()> {
            let wire = self.wire.clone();
            Box::pin(async move {
                wire.close_send_calls.fetch_add(1, Ordering::SeqCst);
                if wire.fail_close_send.load(Ordering::SeqCst) {
                    Err(TunnelError::Stream("already half-closed".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn shutdown(&mut self) -> LinkFuture<'_, ()> {
            let wire = self.wire.clone();
            Box::pin(async move {
                wire.shutdown_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    pub(crate) struct FakeSource {
        pub rx: mpsc::UnboundedReceiver<TunnelResult<Vec<u8>>>,
    }

    impl FrameSource for FakeSource {
        fn recv(&mut self) -> LinkFuture<'_, Option<Vec<u8>>> {
            Box::pin(async move {
                match self.rx.recv().await {
                    Some(Ok(bytes)) => Ok(Some(bytes)),
                    Some(Err(e)) => Err(e),
                    None => Ok(None),
                }
            })
        }
    }

    #[derive(Default)]
    pub(crate) struct CountingReporter {
        pub captured: AtomicUsize,
    }

    impl ErrorReporter for CountingReporter {
        fn capture(&self, _context: &str, _error: &TunnelError) {
            self.captured.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn fake_transport(
        reporter: Arc<dyn ErrorReporter>,
    ) -> (Transport, Wire, mpsc::UnboundedSender<TunnelResult<Vec<u8>>>) {
        let wire = Wire::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Transport::from_link(
            "gw.test:443",
            Box::new(FakeSink { wire: wire.clone() }),
            Box::new(FakeSource { rx }),
            reporter,
        );
        (transport, wire, tx)
    }

    fn data(i: u32) -> Packet {
        Packet::new(PacketType::Data, i.to_be_bytes().to_vec())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_never_interleave() {
        let (transport, wire, _tx) = fake_transport(Arc::new(CountingReporter::default()));
        let transport = Arc::new(transport);

        let mut handles = Vec::new();
        for i in 0..64u32 {
            let t = transport.clone();
            handles.push(tokio::spawn(async move { t.send(&data(i)).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        // Every frame decodes, and the wire order matches lock-acquisition order.
        let on_wire = wire.packets();
        let acquired: Vec<Packet> = wire
            .frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| FrameDecoder::new().feed(f).unwrap().pop_front().unwrap())
            .collect();
        assert_eq!(on_wire.len(), 64);
        assert_eq!(on_wire, acquired);
    }

    #[tokio::test]
    async fn close_reports_both_results() {
        let (transport, wire, _tx) = fake_transport(Arc::new(CountingReporter::default()));
        wire.fail_close_send.store(true, Ordering::SeqCst);

        let (send_half, teardown) = transport.close().await;
        assert!(send_half.is_err());
        assert!(teardown.is_ok());
        assert_eq!(wire.close_send_calls.load(Ordering::SeqCst), 1);
        assert_eq!(wire.shutdown_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.stream_context().end(), Some(StreamEnd::LocalClose));
    }

    #[tokio::test]
    async fn send_and_close_after_close() {
        let (transport, wire, _tx) = fake_transport(Arc::new(CountingReporter::default()));
        let (a, b) = transport.close().await;
        assert!(a.is_ok() && b.is_ok());

        assert!(matches!(
            transport.send(&Packet::keepalive()).await,
            Err(TunnelError::StreamClosed)
        ));
        let (again, teardown) = transport.close().await;
        assert!(matches!(again, Err(TunnelError::StreamClosed)));
        assert!(teardown.is_ok());
        assert_eq!(wire.shutdown_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_failure_is_reported() {
        let reporter = Arc::new(CountingReporter::default());
        let (transport, wire, _tx) = fake_transport(reporter.clone());
        wire.fail_sends.store(true, Ordering::SeqCst);

        assert!(transport.send(&data(1)).await.is_err());
        assert_eq!(reporter.captured.load(Ordering::SeqCst), 1);

        // An already closed stream is not worth reporting.
        transport.close().await.0.unwrap();
        assert!(transport.send(&data(2)).await.is_err());
        assert_eq!(reporter.captured.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recv_preserves_arrival_order() {
        let (transport, _wire, tx) = fake_transport(Arc::new(CountingReporter::default()));

        let mut batch = frame_encode(&data(1)).unwrap();
        batch.extend(frame_encode(&data(2)).unwrap());
        let third = frame_encode(&data(3)).unwrap();
        tx.send(Ok(batch)).unwrap();
        tx.send(Ok(third[..2].to_vec())).unwrap();
        tx.send(Ok(third[2..].to_vec())).unwrap();
        drop(tx);

        for i in 1..=3 {
            assert_eq!(transport.recv().await.unwrap(), Some(data(i)));
        }
        let mut ctx = transport.stream_context();
        assert!(!ctx.is_done());
        assert_eq!(transport.recv().await.unwrap(), None);
        assert_eq!(ctx.done().await, StreamEnd::PeerClosed);
    }

    #[tokio::test]
    async fn recv_error_marks_stream_failed() {
        let (transport, _wire, tx) = fake_transport(Arc::new(CountingReporter::default()));
        tx.send(Err(TunnelError::Unauthenticated("revoked".into()))).unwrap();

        let err = transport.recv().await.unwrap_err();
        assert!(err.is_unauthenticated());
        assert!(matches!(transport.stream_context().end(), Some(StreamEnd::Failed(_))));
    }

    #[tokio::test]
    async fn stream_context_wakes_waiter_on_close() {
        let (transport, _wire, _tx) = fake_transport(Arc::new(CountingReporter::default()));
        let mut ctx = transport.stream_context();
        let waiter = tokio::spawn(async move { ctx.done().await });
        tokio::task::yield_now().await;

        let _ = transport.close().await;
        assert_eq!(waiter.await.unwrap(), StreamEnd::LocalClose);
    }
}
