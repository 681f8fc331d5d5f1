#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use rkv_client::{
    BackoffConfig, BoxedStream, ClientConfig, ClientEvent, ConnectFuture, Connector,
};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    ReadBuf,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// Upper bound for any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut).await.expect("timed out")
}

/// Routes client logs to the test harness; `RUST_LOG=rkv_client=trace` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config with fast reconnects and no INFO ready check.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        ready_check: false,
        lazy_connect: true,
        backoff: BackoffConfig {
            base_delay: Duration::from_millis(10),
            factor: 1.0,
            max_delay: Duration::from_millis(50),
        },
        ..ClientConfig::default()
    }
}

/// Next lifecycle event, skipping nothing.
pub async fn next_event(events: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    within(events.recv()).await.expect("event channel")
}

/// Waits for the first event matching `pred`.
pub async fn wait_event<P>(events: &mut broadcast::Receiver<ClientEvent>, pred: P) -> ClientEvent
where
    P: Fn(&ClientEvent) -> bool,
{
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Server side of one accepted connection.
pub struct ServerConn<S> {
    stream: BufReader<S>,
}

pub type TcpConn = ServerConn<TcpStream>;
pub type DuplexConn = ServerConn<DuplexStream>;

impl<S: AsyncRead + AsyncWrite + Unpin> ServerConn<S> {
    pub fn new(stream: S) -> Self {
        ServerConn {
            stream: BufReader::new(stream),
        }
    }

    /// Reads one array-of-bulk-strings command.
    pub async fn read_command(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let mut line = Vec::new();
        self.read_line(&mut line)
            .await?
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "eof"))?;
        if line.first() != Some(&b'*') {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "expected array"));
        }
        let count = parse_usize(&line[1..])?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            self.read_line(&mut line)
                .await?
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "eof"))?;
            if line.first() != Some(&b'$') {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "expected bulk"));
            }
            let len = parse_usize(&line[1..])?;
            let mut data = vec![0u8; len];
            self.stream.read_exact(&mut data).await?;
            let mut crlf = [0u8; 2];
            self.stream.read_exact(&mut crlf).await?;
            if crlf != [b'\r', b'\n'] {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "missing crlf"));
            }
            args.push(data);
        }
        Ok(args)
    }

    /// Next command as lossy strings; panics on timeout or EOF.
    pub async fn expect_command(&mut self) -> Vec<String> {
        let args = within(self.read_command()).await.expect("read command");
        args.iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect()
    }

    /// True when no command arrives within `quiet`.
    pub async fn is_quiet(&mut self, quiet: Duration) -> bool {
        tokio::time::timeout(quiet, self.stream.fill_buf())
            .await
            .is_err()
    }

    /// Waits until the client closes its side.
    pub async fn expect_eof(&mut self) {
        let mut buf = Vec::new();
        let read = within(self.stream.read_to_end(&mut buf)).await.expect("read");
        assert_eq!(read, 0, "unexpected trailing bytes: {buf:?}");
    }

    pub async fn write_raw(&mut self, data: &[u8]) {
        let _ = self.stream.get_mut().write_all(data).await;
        let _ = self.stream.get_mut().flush().await;
    }

    pub async fn write_simple(&mut self, msg: &str) {
        self.write_raw(format!("+{msg}\r\n").as_bytes()).await;
    }

    pub async fn write_error(&mut self, msg: &str) {
        self.write_raw(format!("-{msg}\r\n").as_bytes()).await;
    }

    pub async fn write_integer(&mut self, value: i64) {
        self.write_raw(format!(":{value}\r\n").as_bytes()).await;
    }

    pub async fn write_bulk(&mut self, data: &[u8]) {
        self.write_raw(&resp_bulk(data)).await;
    }

    pub async fn write_nil(&mut self) {
        self.write_raw(b"$-1\r\n").await;
    }

    /// `[kind, topic, count]`, as sent for subscribe and unsubscribe.
    pub async fn write_ack(&mut self, kind: &str, topic: &str, count: i64) {
        let mut frame = b"*3\r\n".to_vec();
        frame.extend(resp_bulk(kind.as_bytes()));
        frame.extend(resp_bulk(topic.as_bytes()));
        frame.extend(format!(":{count}\r\n").into_bytes());
        self.write_raw(&frame).await;
    }

    /// `[message, channel, payload]`.
    pub async fn write_message(&mut self, channel: &str, payload: &str) {
        let mut frame = b"*3\r\n".to_vec();
        frame.extend(resp_bulk(b"message"));
        frame.extend(resp_bulk(channel.as_bytes()));
        frame.extend(resp_bulk(payload.as_bytes()));
        self.write_raw(&frame).await;
    }

    async fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<Option<()>> {
        buf.clear();
        let bytes = self.stream.read_until(b'\n', buf).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "invalid line"));
        }
        buf.truncate(buf.len() - 2);
        Ok(Some(()))
    }
}

pub fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn parse_usize(data: &[u8]) -> io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "digit"))
}

/// A TCP listener handing every accepted connection to the test.
pub struct MockServer {
    port: u16,
    accepted: mpsc::UnboundedReceiver<TcpConn>,
}

impl MockServer {
    pub async fn bind() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let (tx, accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if tx.send(ServerConn::new(stream)).is_err() {
                    break;
                }
            }
        });
        MockServer { port, accepted }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig {
            port: self.port,
            ..fast_config()
        }
    }

    pub async fn accept(&mut self) -> TcpConn {
        within(self.accepted.recv()).await.expect("listener")
    }
}

/// Hands out in-memory streams and records every write the client makes.
pub struct DuplexConnector {
    streams: mpsc::UnboundedSender<DuplexConn>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    capacity: usize,
}

pub struct DuplexAccept {
    accepted: mpsc::UnboundedReceiver<DuplexConn>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl DuplexAccept {
    pub async fn accept(&mut self) -> DuplexConn {
        within(self.accepted.recv()).await.expect("connector")
    }

    /// Buffers passed to each accepted write call, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().expect("writes").clone()
    }
}

pub fn duplex_connector() -> (Arc<DuplexConnector>, DuplexAccept) {
    duplex_connector_with_capacity(1024 * 1024)
}

/// Like `duplex_connector`, but each direction buffers at most `capacity` bytes.
pub fn duplex_connector_with_capacity(capacity: usize) -> (Arc<DuplexConnector>, DuplexAccept) {
    init_tracing();
    let (streams, accepted) = mpsc::unbounded_channel();
    let writes = Arc::new(Mutex::new(Vec::new()));
    (
        Arc::new(DuplexConnector {
            streams,
            writes: writes.clone(),
            capacity,
        }),
        DuplexAccept { accepted, writes },
    )
}

impl Connector for DuplexConnector {
    fn connect(&self) -> ConnectFuture {
        let (client, server) = tokio::io::duplex(self.capacity);
        let sent = self.streams.send(ServerConn::new(server));
        let writes = self.writes.clone();
        Box::pin(async move {
            sent.map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "harness gone"))?;
            Ok(Box::new(RecordingStream {
                inner: client,
                writes,
            }) as BoxedStream)
        })
    }

    fn address(&self) -> String {
        "duplex".to_string()
    }
}

struct RecordingStream {
    inner: DuplexStream,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl AsyncRead for RecordingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RecordingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(written)) = &poll {
            if let Ok(mut writes) = self.writes.lock() {
                writes.push(buf[..*written].to_vec());
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Refuses every connection attempt.
#[derive(Default)]
pub struct RefusingConnector {
    attempts: AtomicUsize,
}

impl RefusingConnector {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl RefusingConnector {
    pub fn new() -> Arc<Self> {
        init_tracing();
        Arc::new(RefusingConnector::default())
    }
}

impl Connector for RefusingConnector {
    fn connect(&self) -> ConnectFuture {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")) })
    }

    fn address(&self) -> String {
        "refused".to_string()
    }
}

/// Connection attempts that never complete.
pub struct StalledConnector;

impl Connector for StalledConnector {
    fn connect(&self) -> ConnectFuture {
        Box::pin(std::future::pending())
    }

    fn address(&self) -> String {
        "stalled".to_string()
    }
}
