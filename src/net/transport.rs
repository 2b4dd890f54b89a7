//! Line-oriented TCP client for the OpenVPN management interface.
//!
//! One connection runs three tasks:
//!
//! ```text
//!  socket ──read──▶ LineFramer ──queue──▶ dispatch ──▶ MessageRouter
//!                                              └──────▶ line subscribers
//!  send() ──queue──▶ writer ──write──▶ socket
//! ```
//!
//! Lines are dispatched strictly in receive order by a single task and
//! outbound lines are written strictly in submission order by a single task.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, trace, warn};
use zeroize::Zeroizing;

use crate::error::{OvpnError, OvpnResult};
use super::router::MessageRouter;

const LINE_TERMINATOR: &[u8] = b"\r\n";
const READ_BUFFER_SIZE: usize = 1024;
/// Longest unterminated input accepted before the peer is treated as broken
pub const MAX_PENDING_LINE: usize = 64 * 1024;

/// Out-of-band notifications from a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket closed. Raised once per connection.
    Disconnected,
    /// Unrecoverable error; the transport disconnects afterwards.
    Error {
        message: String,
        unsent: usize,
        unprocessed: usize,
    },
}

/// Splits a byte stream into CRLF-terminated lines.
///
/// An unterminated tail that exactly equals one of the magic phrases is
/// emitted as a line straight away, for prompts such as OpenVPN's
/// `ENTER PASSWORD:` that never get a line terminator.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no terminator
    scanned: usize,
    magic_phrases: Vec<String>,
    longest_phrase: usize,
}

impl LineFramer {
    pub fn new(magic_phrases: Vec<String>) -> Self {
        let longest_phrase = magic_phrases.iter().map(String::len).max().unwrap_or(0);
        Self {
            buffer: Vec::new(),
            scanned: 0,
            magic_phrases,
            longest_phrase,
        }
    }

    /// Feed raw bytes, returning every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        // A CR at the end of the previous read may pair with an LF now
        let mut search = self.scanned.saturating_sub(LINE_TERMINATOR.len() - 1);
        let mut start = 0;
        let mut lines = Vec::new();
        while let Some(offset) = find_terminator(&self.buffer[search..]) {
            let pos = search + offset;
            lines.push(String::from_utf8_lossy(&self.buffer[start..pos]).into_owned());
            start = pos + LINE_TERMINATOR.len();
            search = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if !self.buffer.is_empty() && self.buffer.len() <= self.longest_phrase {
            if let Ok(tail) = std::str::from_utf8(&self.buffer) {
                if self.magic_phrases.iter().any(|p| p == tail) {
                    lines.push(tail.to_string());
                    self.buffer.clear();
                    self.scanned = 0;
                }
            }
        }

        lines
    }

    /// Bytes received but not yet part of a complete line
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(LINE_TERMINATOR.len()).position(|w| w == LINE_TERMINATOR)
}

/// Normalise an outbound line to exactly one trailing CRLF
pub fn frame_outbound(line: &str) -> String {
    let trimmed = line.trim_matches(|c| c == '\r' || c == '\n');
    let mut framed = String::with_capacity(trimmed.len() + LINE_TERMINATOR.len());
    framed.push_str(trimmed);
    framed.push_str("\r\n");
    framed
}

/// Cloneable handle used to send lines and close the connection.
///
/// Handlers registered on the router hold one of these rather than the
/// transport itself.
#[derive(Clone)]
pub struct TransportHandle {
    send_tx: mpsc::UnboundedSender<Zeroizing<String>>,
    shutdown: Arc<watch::Sender<bool>>,
    closed_locally: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    unsent: Arc<AtomicUsize>,
}

impl TransportHandle {
    /// Queue a line for sending
    pub fn send(&self, line: impl Into<String>) {
        self.send_sensitive(Zeroizing::new(line.into()));
    }

    /// Queue a line holding a secret; every copy is wiped once written
    pub fn send_sensitive(&self, line: Zeroizing<String>) {
        self.unsent.fetch_add(1, Ordering::SeqCst);
        if self.send_tx.send(line).is_err() {
            self.unsent.fetch_sub(1, Ordering::SeqCst);
            debug!("Dropping outbound line, writer has stopped");
        }
    }

    /// Close the socket. Lines still queued for dispatch are dropped.
    /// Safe to call repeatedly.
    pub fn disconnect(&self) {
        self.closed_locally.store(true, Ordering::SeqCst);
        self.stop_loops();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stop_loops(&self) {
        self.shutdown.send_replace(true);
    }

    fn is_closed_locally(&self) -> bool {
        self.closed_locally.load(Ordering::SeqCst)
    }
}

/// Persistent line client to a local management port
pub struct LineTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
    router: Arc<MessageRouter>,
    magic_phrases: Mutex<Vec<String>>,
    handle: TransportHandle,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<Zeroizing<String>>>>,
    shutdown_rx: watch::Receiver<bool>,
    line_tx: broadcast::Sender<String>,
    event_tx: broadcast::Sender<TransportEvent>,
    disconnect_raised: Arc<AtomicBool>,
    unprocessed: Arc<AtomicUsize>,
}

impl LineTransport {
    /// Create a transport; nothing is opened until [`connect`](Self::connect).
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (line_tx, _) = broadcast::channel(256);
        let (event_tx, _) = broadcast::channel(16);

        Self {
            host: host.into(),
            port,
            connect_timeout,
            router: Arc::new(MessageRouter::new()),
            magic_phrases: Mutex::new(Vec::new()),
            handle: TransportHandle {
                send_tx,
                shutdown: Arc::new(shutdown_tx),
                closed_locally: Arc::new(AtomicBool::new(false)),
                connected: Arc::new(AtomicBool::new(false)),
                unsent: Arc::new(AtomicUsize::new(0)),
            },
            send_rx: Mutex::new(Some(send_rx)),
            shutdown_rx,
            line_tx,
            event_tx,
            disconnect_raised: Arc::new(AtomicBool::new(false)),
            unprocessed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn handle(&self) -> TransportHandle {
        self.handle.clone()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Register a prompt that counts as a full line without a terminator.
    /// Only phrases added before `connect` are honoured.
    pub fn add_magic_phrase(&self, phrase: impl Into<String>) {
        if let Ok(mut phrases) = self.magic_phrases.lock() {
            phrases.push(phrase.into());
        }
    }

    /// Every dispatched line, after the router has seen it
    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.line_tx.subscribe()
    }

    /// Disconnect and error notifications
    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }

    pub fn send(&self, line: impl Into<String>) {
        self.handle.send(line);
    }

    pub fn disconnect(&self) {
        self.handle.disconnect();
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    /// Open the socket and start the background loops
    pub async fn connect(&self) -> OvpnResult<()> {
        let addr = format!("{}:{}", self.host, self.port);
        debug!("Connecting to management interface at {}", addr);

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let err = OvpnError::Transport(format!("Failed to connect to {}: {}", addr, e));
                self.raise_error(err.to_string());
                return Err(err);
            }
            Err(_) => {
                let err = OvpnError::Timeout(format!("Connecting to {} took longer than {:?}", addr, self.connect_timeout));
                self.raise_error(err.to_string());
                return Err(err);
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on management socket: {}", e);
        }

        self.start(stream)
    }

    /// Run the loops over an already-open stream
    pub fn start<S>(&self, stream: S) -> OvpnResult<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let send_rx = self
            .send_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| OvpnError::InvalidState("Transport already started".to_string()))?;

        let phrases = self.magic_phrases.lock().map(|p| p.clone()).unwrap_or_default();
        let (reader, writer) = tokio::io::split(stream);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        self.handle.connected.store(true, Ordering::SeqCst);

        tokio::spawn(Self::write_loop(writer, send_rx, self.handle.clone(), self.shutdown_rx.clone(), self.event_tx.clone(), self.unprocessed.clone()));
        tokio::spawn(Self::read_loop(
            reader,
            LineFramer::new(phrases),
            queue_tx,
            self.handle.clone(),
            self.shutdown_rx.clone(),
            self.event_tx.clone(),
            self.unprocessed.clone(),
        ));
        tokio::spawn(Self::dispatch_loop(
            queue_rx,
            self.router.clone(),
            self.line_tx.clone(),
            self.handle.clone(),
            self.event_tx.clone(),
            self.disconnect_raised.clone(),
            self.unprocessed.clone(),
        ));

        Ok(())
    }

    fn raise_error(&self, message: String) {
        let _ = self.event_tx.send(TransportEvent::Error {
            message,
            unsent: self.handle.unsent.load(Ordering::SeqCst),
            unprocessed: self.unprocessed.load(Ordering::SeqCst),
        });
    }

    async fn write_loop<W>(
        mut writer: W,
        mut send_rx: mpsc::UnboundedReceiver<Zeroizing<String>>,
        handle: TransportHandle,
        mut shutdown: watch::Receiver<bool>,
        event_tx: broadcast::Sender<TransportEvent>,
        unprocessed: Arc<AtomicUsize>,
    ) where
        W: AsyncWrite + Unpin,
    {
        loop {
            let line = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                line = send_rx.recv() => match line {
                    Some(line) => line,
                    None => break,
                },
            };
            handle.unsent.fetch_sub(1, Ordering::SeqCst);

            let framed = Zeroizing::new(frame_outbound(&line));
            let result = async {
                writer.write_all(framed.as_bytes()).await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = result {
                error!("Management socket write failed: {}", e);
                let _ = event_tx.send(TransportEvent::Error {
                    message: format!("Write failed: {}", e),
                    unsent: handle.unsent.load(Ordering::SeqCst),
                    unprocessed: unprocessed.load(Ordering::SeqCst),
                });
                handle.stop_loops();
                break;
            }
        }

        let _ = writer.shutdown().await;
        trace!("Management writer stopped");
    }

    async fn read_loop<R>(
        mut reader: R,
        mut framer: LineFramer,
        queue_tx: mpsc::UnboundedSender<String>,
        handle: TransportHandle,
        mut shutdown: watch::Receiver<bool>,
        event_tx: broadcast::Sender<TransportEvent>,
        unprocessed: Arc<AtomicUsize>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    debug!("Management socket closed by peer");
                    break;
                }
                Ok(n) => {
                    for line in framer.push(&buf[..n]) {
                        unprocessed.fetch_add(1, Ordering::SeqCst);
                        if queue_tx.send(line).is_err() {
                            unprocessed.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    if framer.pending().len() > MAX_PENDING_LINE {
                        let message = format!(
                            "No line terminator in {} bytes, disconnecting",
                            framer.pending().len()
                        );
                        error!("{}", message);
                        let _ = event_tx.send(TransportEvent::Error {
                            message,
                            unsent: handle.unsent.load(Ordering::SeqCst),
                            unprocessed: unprocessed.load(Ordering::SeqCst),
                        });
                        break;
                    }
                }
                Err(e) => {
                    let message = format!(
                        "Terminal error, disconnecting... Unprocessed messages: send:{}, receive:{}",
                        handle.unsent.load(Ordering::SeqCst),
                        unprocessed.load(Ordering::SeqCst)
                    );
                    error!("{}: {}", message, e);
                    let _ = event_tx.send(TransportEvent::Error {
                        message: format!("{}: {}", message, e),
                        unsent: handle.unsent.load(Ordering::SeqCst),
                        unprocessed: unprocessed.load(Ordering::SeqCst),
                    });
                    break;
                }
            }
        }

        // Stops the writer as well; the dispatcher drains what was queued and
        // finishes once queue_tx drops.
        handle.stop_loops();
        trace!("Management reader stopped");
    }

    async fn dispatch_loop(
        mut queue_rx: mpsc::UnboundedReceiver<String>,
        router: Arc<MessageRouter>,
        line_tx: broadcast::Sender<String>,
        handle: TransportHandle,
        event_tx: broadcast::Sender<TransportEvent>,
        disconnect_raised: Arc<AtomicBool>,
        unprocessed: Arc<AtomicUsize>,
    ) {
        while let Some(line) = queue_rx.recv().await {
            unprocessed.fetch_sub(1, Ordering::SeqCst);

            if handle.is_closed_locally() {
                trace!("Skipping line received during shutdown: {}", line);
                continue;
            }
            if line.is_empty() {
                continue;
            }

            trace!("Processing {}", line);
            router.process(&line);
            let _ = line_tx.send(line);
        }

        handle.connected.store(false, Ordering::SeqCst);
        if !disconnect_raised.swap(true, Ordering::SeqCst) {
            debug!("Management transport disconnected");
            let _ = event_tx.send(TransportEvent::Disconnected);
        }
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        self.handle.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::router::{Comparison, MatchMode};
    use std::sync::Mutex as StdMutex;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[test]
    fn test_framer_splits_crlf() {
        let mut framer = LineFramer::default();
        assert_eq!(framer.push(b">STATE:1,CONNECTING\r\n>BYTE"), vec![">STATE:1,CONNECTING"]);
        assert_eq!(framer.pending(), b">BYTE");
        assert_eq!(framer.push(b"COUNT:1,2\r\n\r\n"), vec![">BYTECOUNT:1,2", ""]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_framer_terminator_split_across_reads() {
        let mut framer = LineFramer::default();
        assert!(framer.push(b"SUCCESS: hold release succeeded\r").is_empty());
        assert_eq!(framer.push(b"\n"), vec!["SUCCESS: hold release succeeded"]);
    }

    #[test]
    fn test_framer_magic_phrase() {
        let mut framer = LineFramer::new(vec!["ENTER PASSWORD:".to_string()]);
        assert!(framer.push(b"ENTER PASS").is_empty());
        assert_eq!(framer.push(b"WORD:"), vec!["ENTER PASSWORD:"]);
        assert!(framer.pending().is_empty());

        // Only an exact match of the whole tail counts
        assert!(framer.push(b"xENTER PASSWORD:").is_empty());
        assert_eq!(framer.pending(), b"xENTER PASSWORD:");
    }

    #[test]
    fn test_framer_utf8_split_across_reads() {
        let mut framer = LineFramer::default();
        let bytes = "caf\u{e9}\r\n".as_bytes();
        assert!(framer.push(&bytes[..4]).is_empty());
        assert_eq!(framer.push(&bytes[4..]), vec!["caf\u{e9}"]);
    }

    #[test]
    fn test_framer_resumes_scan_across_many_reads() {
        let mut framer = LineFramer::default();
        for chunk in [&b">LOG:1700000000,I,"[..], b"Initialization ", b"Sequence Completed\r"] {
            assert!(framer.push(chunk).is_empty());
        }
        assert_eq!(
            framer.push(b"\n>BYTECOUNT:1,2\r\n>HO"),
            vec![">LOG:1700000000,I,Initialization Sequence Completed", ">BYTECOUNT:1,2"]
        );
        assert_eq!(framer.pending(), b">HO");
        assert_eq!(framer.push(b"LD:0\r\n"), vec![">HOLD:0"]);
    }

    #[test]
    fn test_frame_outbound() {
        assert_eq!(frame_outbound("hold release"), "hold release\r\n");
        assert_eq!(frame_outbound("state on\r\n"), "state on\r\n");
        assert_eq!(frame_outbound("\nlog on\n\n"), "log on\r\n");
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = LineTransport::new("127.0.0.1", port, Duration::from_secs(2));
        let mut events = transport.subscribe_events();

        assert!(transport.connect().await.is_err());
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Error { .. }));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_round_trip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            write.write_all(b"first\r\nsecond\r\nENTER PASSWORD:").await.unwrap();

            let mut lines = BufReader::new(read).lines();
            let mut received = Vec::new();
            while received.len() < 2 {
                received.push(lines.next_line().await.unwrap().unwrap());
            }
            received
        });

        let transport = LineTransport::new("127.0.0.1", port, Duration::from_secs(2));
        transport.add_magic_phrase("ENTER PASSWORD:");

        let routed = Arc::new(StdMutex::new(Vec::new()));
        let routed_clone = routed.clone();
        let handle = transport.handle();
        transport.router().add_handler("ENTER PASSWORD:", MatchMode::EndsWith, Comparison::Ordinal, move |line| {
            routed_clone.lock().unwrap().push(line.to_string());
            handle.send("secret");
        });

        let mut lines = transport.subscribe_lines();
        let mut events = transport.subscribe_events();
        transport.connect().await.unwrap();
        transport.send("hello\r\n");

        assert_eq!(lines.recv().await.unwrap(), "first");
        assert_eq!(lines.recv().await.unwrap(), "second");
        assert_eq!(lines.recv().await.unwrap(), "ENTER PASSWORD:");

        let received = server.await.unwrap();
        assert_eq!(received.len(), 2);
        assert!(received.contains(&"hello".to_string()));
        assert!(received.contains(&"secret".to_string()));
        assert_eq!(routed.lock().unwrap().as_slice(), ["ENTER PASSWORD:"]);

        // Server task dropped its socket; exactly one disconnect follows.
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Disconnected);
        assert!(!transport.is_connected());
        transport.disconnect();
        assert!(tokio::time::timeout(Duration::from_millis(100), events.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_local_disconnect_closes_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let transport = LineTransport::new("localhost", port, Duration::from_secs(2));
        let mut events = transport.subscribe_events();
        transport.connect().await.unwrap();
        assert!(transport.is_connected());

        transport.disconnect();
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Disconnected);
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unterminated_flood_disconnects() {
        let (client, mut server) = tokio::io::duplex(4 * MAX_PENDING_LINE);
        let transport = LineTransport::new("127.0.0.1", 0, Duration::from_secs(1));
        let mut events = transport.subscribe_events();
        transport.start(client).unwrap();

        server.write_all(&vec![b'x'; MAX_PENDING_LINE + 1]).await.unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert!(matches!(first, TransportEvent::Error { .. }));
        let second = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(second, TransportEvent::Disconnected);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_sensitive_line_is_framed_like_any_other() {
        let (client, server) = tokio::io::duplex(1024);
        let transport = LineTransport::new("127.0.0.1", 0, Duration::from_secs(1));
        transport.start(client).unwrap();

        transport.handle().send_sensitive(Zeroizing::new("password Auth \"s3cret\"\r\n".to_string()));
        transport.send("state on");

        let mut lines = BufReader::new(server).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("password Auth \"s3cret\""));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("state on"));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (client, _server) = tokio::io::duplex(64);
        let (client2, _server2) = tokio::io::duplex(64);
        let transport = LineTransport::new("127.0.0.1", 0, Duration::from_secs(1));

        transport.start(client).unwrap();
        assert!(matches!(transport.start(client2), Err(OvpnError::InvalidState(_))));
    }
}
