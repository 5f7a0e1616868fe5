//! A single WebSocket connection
//!
//! Two tasks per channel:
//!
//! - the *reader* pulls frames under a read deadline and hands text frames
//!   to the owner; any failure is reported to the writer on the
//!   force-close queue;
//! - the *writer* owns the sink and is the only task that writes. It
//!   serves, in priority order, force-close, graceful close, control
//!   frames, the ping ticker and the outbound queue. Whatever ends its loop,
//!   it runs cleanup once and then reports the close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{timeout, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use crate::domain::TransportError;

const STATE_CONNECTED: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Queue depth for pongs and other control frames.
const CONTROL_QUEUE_CAPACITY: usize = 8;

// ── Configuration ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Deadline for every write, and for `write` to find queue space.
    pub write_wait: Duration,
    /// Read deadline, refreshed by every inbound frame.
    pub read_wait: Duration,
    /// Send pings at this interval (client side only).
    pub ping_period: Option<Duration>,
    pub out_queue_capacity: usize,
}

// ── ConnectionInfo ─────────────────────────────────────────────

/// Snapshot of a connection, for introspection and callbacks.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Station id (last path segment on the server side).
    pub id: String,
    /// Distinguishes successive connections that reuse the same id.
    pub serial: u64,
    pub remote_addr: Option<SocketAddr>,
    pub subprotocol: Option<String>,
    pub tls: bool,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Callbacks from the channel tasks to the endpoint that owns it.
pub trait ChannelEvents: Send + Sync + 'static {
    fn on_text(&self, info: &ConnectionInfo, text: String);

    /// Called once, after cleanup. `error` is `None` for a graceful close.
    fn on_closed(&self, info: ConnectionInfo, error: Option<TransportError>);
}

// ── WsChannel ──────────────────────────────────────────────────

struct Shared {
    info: ConnectionInfo,
    last_activity: Mutex<DateTime<Utc>>,
    state: AtomicU8,
    write_wait: Duration,
    out_tx: mpsc::Sender<String>,
    close_tx: mpsc::Sender<Option<CloseFrame<'static>>>,
    force_tx: mpsc::Sender<TransportError>,
    control_tx: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Utc::now();
        }
    }

    fn snapshot(&self) -> ConnectionInfo {
        let mut info = self.info.clone();
        if let Ok(last) = self.last_activity.lock() {
            info.last_activity = *last;
        }
        info
    }
}

/// Handle to a running channel. Cheap to clone.
#[derive(Clone)]
pub struct WsChannel {
    shared: Arc<Shared>,
}

impl WsChannel {
    pub fn id(&self) -> &str {
        &self.shared.info.id
    }

    pub fn serial(&self) -> u64 {
        self.shared.info.serial
    }

    pub fn info(&self) -> ConnectionInfo {
        self.shared.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == STATE_CONNECTED
    }

    /// Queue a text frame. Waits up to `write_wait` for queue space.
    pub async fn write(&self, text: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        match timeout(self.shared.write_wait, self.shared.out_tx.send(text)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }

    /// Request a graceful close. Returns `false` if the channel was already
    /// closing.
    pub fn close(&self, frame: Option<CloseFrame<'static>>) -> bool {
        let swapped = self.shared.state.compare_exchange(
            STATE_CONNECTED,
            STATE_CLOSING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if swapped.is_err() {
            return false;
        }
        // Capacity 1 and only the CONNECTED -> CLOSING winner sends.
        let _ = self.shared.close_tx.try_send(frame);
        true
    }

    /// Abort the connection as if the link had failed.
    pub fn force_close(&self, error: TransportError) {
        let _ = self.shared.force_tx.try_send(error);
    }

    /// Resolve once cleanup has finished.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl std::fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsChannel")
            .field("id", &self.shared.info.id)
            .field("serial", &self.shared.info.serial)
            .field("state", &self.shared.state.load(Ordering::SeqCst))
            .finish()
    }
}

/// Close frame helper.
pub fn close_frame(code: CloseCode, reason: impl Into<String>) -> CloseFrame<'static> {
    CloseFrame {
        code,
        reason: reason.into().into(),
    }
}

// ── ChannelRunner ──────────────────────────────────────────────

/// The not-yet-started tasks of a channel.
pub struct ChannelRunner<S> {
    ws: WebSocketStream<S>,
    shared: Arc<Shared>,
    config: ChannelConfig,
    events: Arc<dyn ChannelEvents>,
    out_rx: mpsc::Receiver<String>,
    close_rx: mpsc::Receiver<Option<CloseFrame<'static>>>,
    force_rx: mpsc::Receiver<TransportError>,
    control_rx: mpsc::Receiver<Message>,
}

/// Wrap an upgraded stream. Nothing runs until [`ChannelRunner::start`].
pub fn open<S>(
    ws: WebSocketStream<S>,
    info: ConnectionInfo,
    config: ChannelConfig,
    events: Arc<dyn ChannelEvents>,
) -> (WsChannel, ChannelRunner<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(config.out_queue_capacity.max(1));
    let (close_tx, close_rx) = mpsc::channel(1);
    let (force_tx, force_rx) = mpsc::channel(1);
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
    let (closed, _) = watch::channel(false);

    let shared = Arc::new(Shared {
        last_activity: Mutex::new(info.connected_at),
        info,
        state: AtomicU8::new(STATE_CONNECTED),
        write_wait: config.write_wait,
        out_tx,
        close_tx,
        force_tx,
        control_tx,
        closed,
    });

    let channel = WsChannel {
        shared: shared.clone(),
    };
    let runner = ChannelRunner {
        ws,
        shared,
        config,
        events,
        out_rx,
        close_rx,
        force_rx,
        control_rx,
    };
    (channel, runner)
}

impl<S> ChannelRunner<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn the reader and writer tasks.
    pub fn start(self) {
        let ChannelRunner {
            ws,
            shared,
            config,
            events,
            out_rx,
            close_rx,
            force_rx,
            control_rx,
        } = self;
        let (sink, stream) = ws.split();

        let reader = tokio::spawn(read_pump(
            stream,
            shared.clone(),
            events.clone(),
            config.read_wait,
        ));

        let writer = Writer {
            sink,
            shared,
            events,
            config,
            out_rx,
            close_rx,
            force_rx,
            control_rx,
            reader: reader.abort_handle(),
        };
        tokio::spawn(writer.run());
    }
}

// ── Reader ─────────────────────────────────────────────────────

async fn read_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
    events: Arc<dyn ChannelEvents>,
    read_wait: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = shared.info.id.clone();
    let error = loop {
        let message = match timeout(read_wait, stream.next()).await {
            Err(_) => break TransportError::ReadTimeout(read_wait),
            Ok(None) => break TransportError::ConnectionReset,
            Ok(Some(Err(e))) => break TransportError::from(e),
            Ok(Some(Ok(message))) => message,
        };
        shared.touch();

        match message {
            Message::Text(text) => {
                trace!(charge_point_id = %id, "<- {}", text);
                events.on_text(&shared.info, text);
            }
            Message::Ping(payload) => {
                trace!(charge_point_id = %id, "ping received");
                if shared.control_tx.try_send(Message::Pong(payload)).is_err() {
                    debug!(charge_point_id = %id, "Control queue full, pong dropped");
                }
            }
            Message::Pong(_) => trace!(charge_point_id = %id, "pong received"),
            Message::Binary(data) => {
                debug!(charge_point_id = %id, len = data.len(), "Ignoring binary frame");
            }
            Message::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.into_owned()))
                    .unwrap_or((u16::from(CloseCode::Status), String::new()));
                break TransportError::ClosedByPeer { code, reason };
            }
            Message::Frame(_) => {}
        }
    };

    if shared.state.load(Ordering::SeqCst) == STATE_CONNECTED {
        debug!(charge_point_id = %id, error = %error, "Read loop ended");
    }
    let _ = shared.force_tx.try_send(error);
}

// ── Writer ─────────────────────────────────────────────────────

struct Writer<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
    shared: Arc<Shared>,
    events: Arc<dyn ChannelEvents>,
    config: ChannelConfig,
    out_rx: mpsc::Receiver<String>,
    close_rx: mpsc::Receiver<Option<CloseFrame<'static>>>,
    force_rx: mpsc::Receiver<TransportError>,
    control_rx: mpsc::Receiver<Message>,
    reader: AbortHandle,
}

impl<S> Writer<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let mut ping = self.config.ping_period.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let error = loop {
            tokio::select! {
                biased;

                Some(error) = self.force_rx.recv() => break Some(error),

                Some(frame) = self.close_rx.recv() => {
                    debug!(charge_point_id = %self.shared.info.id, "Sending close frame");
                    let _ = self.send(Message::Close(frame)).await;
                    break None;
                }

                Some(control) = self.control_rx.recv() => {
                    if let Err(e) = self.send(control).await {
                        break Some(e);
                    }
                }

                _ = tick(&mut ping) => {
                    if let Err(e) = self.send(Message::Ping(Vec::new())).await {
                        break Some(e);
                    }
                }

                text = self.out_rx.recv() => match text {
                    Some(text) => {
                        if let Err(e) = self.send(Message::Text(text)).await {
                            break Some(e);
                        }
                    }
                    None => break None,
                },
            }
        };

        self.cleanup(error).await;
    }

    async fn send(&mut self, message: Message) -> Result<(), TransportError> {
        match timeout(self.config.write_wait, self.sink.send(message)).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::WriteTimeout),
        }
    }

    async fn cleanup(mut self, error: Option<TransportError>) {
        let previous = self.shared.state.swap(STATE_CLOSED, Ordering::SeqCst);
        if previous == STATE_CLOSED {
            return;
        }

        self.out_rx.close();
        self.close_rx.close();
        self.control_rx.close();

        let _ = timeout(self.config.write_wait, self.sink.close()).await;
        self.reader.abort();

        let info = self.shared.snapshot();
        match &error {
            None => info!(charge_point_id = %info.id, "Connection closed"),
            Some(e) => warn!(charge_point_id = %info.id, error = %e, "Connection lost"),
        }

        self.shared.closed.send_replace(true);
        self.events.on_closed(info, error);
    }
}

async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role;

    struct Recorder {
        texts: mpsc::UnboundedSender<String>,
        closed: mpsc::UnboundedSender<Option<TransportError>>,
    }

    impl ChannelEvents for Recorder {
        fn on_text(&self, _info: &ConnectionInfo, text: String) {
            let _ = self.texts.send(text);
        }

        fn on_closed(&self, _info: ConnectionInfo, error: Option<TransportError>) {
            let _ = self.closed.send(error);
        }
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            id: "CS001".into(),
            serial: 1,
            remote_addr: None,
            subprotocol: Some("ocpp1.6".into()),
            tls: false,
            connected_at: Utc::now(),
            last_activity: Utc::now(),
        }
    }

    fn config(read_wait: Duration) -> ChannelConfig {
        ChannelConfig {
            write_wait: Duration::from_millis(500),
            read_wait,
            ping_period: None,
            out_queue_capacity: 1,
        }
    }

    type Peer = WebSocketStream<tokio::io::DuplexStream>;

    async fn pair(
        read_wait: Duration,
    ) -> (
        WsChannel,
        Peer,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedReceiver<Option<TransportError>>,
    ) {
        let (a, b) = duplex(64 * 1024);
        let local = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let peer = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        let (texts_tx, texts) = mpsc::unbounded_channel();
        let (closed_tx, closed) = mpsc::unbounded_channel();
        let (channel, runner) = open(
            local,
            info(),
            config(read_wait),
            Arc::new(Recorder {
                texts: texts_tx,
                closed: closed_tx,
            }),
        );
        runner.start();
        (channel, peer, texts, closed)
    }

    #[tokio::test]
    async fn writes_are_fifo() {
        let (channel, mut peer, _texts, _closed) = pair(Duration::from_secs(5)).await;
        for i in 0..5 {
            channel.write(format!("m{}", i)).await.unwrap();
        }
        for i in 0..5 {
            let msg = timeout(Duration::from_secs(1), peer.next()).await.unwrap().unwrap().unwrap();
            assert_eq!(msg, Message::Text(format!("m{}", i)));
        }
    }

    #[tokio::test]
    async fn inbound_text_reaches_owner() {
        let (channel, mut peer, mut texts, _closed) = pair(Duration::from_secs(5)).await;
        let before = channel.info().last_activity;
        peer.send(Message::Text("[2,\"1\",\"Heartbeat\",{}]".into())).await.unwrap();
        let text = timeout(Duration::from_secs(1), texts.recv()).await.unwrap().unwrap();
        assert_eq!(text, "[2,\"1\",\"Heartbeat\",{}]");
        assert!(channel.info().last_activity >= before);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let (_channel, mut peer, _texts, _closed) = pair(Duration::from_secs(5)).await;
        peer.send(Message::Ping(b"hb".to_vec())).await.unwrap();
        let msg = timeout(Duration::from_secs(1), peer.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(msg, Message::Pong(b"hb".to_vec()));
    }

    #[tokio::test]
    async fn graceful_close_reports_no_error_and_blocks_writes() {
        let (channel, mut peer, _texts, mut closed) = pair(Duration::from_secs(5)).await;
        assert!(channel.close(Some(close_frame(CloseCode::Normal, "bye"))));
        assert!(!channel.close(None));
        assert_eq!(
            channel.write("late".into()).await,
            Err(TransportError::NotConnected)
        );

        let msg = timeout(Duration::from_secs(1), peer.next()).await.unwrap().unwrap().unwrap();
        assert!(matches!(msg, Message::Close(Some(ref f)) if f.reason == "bye"));

        let error = timeout(Duration::from_secs(1), closed.recv()).await.unwrap().unwrap();
        assert_eq!(error, None);
        timeout(Duration::from_secs(1), channel.closed()).await.unwrap();
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn read_deadline_forces_close() {
        let (channel, _peer, _texts, mut closed) = pair(Duration::from_millis(50)).await;
        let error = timeout(Duration::from_secs(1), closed.recv()).await.unwrap().unwrap();
        assert_eq!(error, Some(TransportError::ReadTimeout(Duration::from_millis(50))));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn peer_close_is_reported_as_error() {
        let (_channel, mut peer, _texts, mut closed) = pair(Duration::from_secs(5)).await;
        peer.close(Some(close_frame(CloseCode::Away, "restart"))).await.unwrap();
        let error = timeout(Duration::from_secs(1), closed.recv()).await.unwrap().unwrap();
        assert_eq!(
            error,
            Some(TransportError::ClosedByPeer {
                code: 1001,
                reason: "restart".into()
            })
        );
    }
}
