//! # Transport Connectors
//!
//! Purpose: Produce a fresh byte-stream duplex for every connection attempt,
//! whether TCP, Unix domain socket, TLS, or something injected by a test.
//!
//! ## Design Principles
//! 1. **Factory, Not Stream**: The connection manager asks a `Connector` for
//!    a new stream on each attempt and never reuses an old one.
//! 2. **Type Erasure**: Every stream is boxed behind `AsyncStream` so the
//!    manager has a single code path.
//! 3. **Options at Connect Time**: Keep-alive and no-delay are applied to
//!    each new socket.
//! 4. **No Silent Downgrade**: A config that requires TLS never yields a
//!    plain TCP connector.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// A duplex byte stream usable as a connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed connection stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Future returned by `Connector::connect`.
pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send>>;

/// Creates connection streams.
pub trait Connector: Send + Sync + 'static {
    /// Starts one connection attempt.
    fn connect(&self) -> ConnectFuture;

    /// Target description for logs.
    fn address(&self) -> String;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    keep_alive: bool,
    keep_alive_initial_delay: Duration,
    no_delay: bool,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        TcpConnector {
            host: host.into(),
            port,
            keep_alive: true,
            keep_alive_initial_delay: Duration::ZERO,
            no_delay: true,
        }
    }

    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Idle time before TCP starts sending keep-alives; zero keeps the OS default.
    pub fn keep_alive_initial_delay(mut self, delay: Duration) -> Self {
        self.keep_alive_initial_delay = delay;
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    fn open(&self) -> impl Future<Output = io::Result<tokio::net::TcpStream>> + Send + 'static {
        let target = format!("{}:{}", self.host, self.port);
        let keep_alive = self.keep_alive;
        let initial_delay = self.keep_alive_initial_delay;
        let no_delay = self.no_delay;
        async move {
            let mut last_err = None;
            for addr in lookup_host(&target).await? {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_keepalive(keep_alive)?;
                match socket.connect(addr).await {
                    Ok(stream) => {
                        stream.set_nodelay(no_delay)?;
                        if keep_alive && !initial_delay.is_zero() {
                            SockRef::from(&stream)
                                .set_tcp_keepalive(&TcpKeepalive::new().with_time(initial_delay))?;
                        }
                        return Ok(stream);
                    }
                    Err(err) => last_err = Some(err),
                }
            }
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no address found for {target}"))
            }))
        }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> ConnectFuture {
        let open = self.open();
        Box::pin(async move { Ok(Box::new(open.await?) as BoxedStream) })
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Unix domain socket connector.
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct UnixConnector {
    path: std::path::PathBuf,
}

#[cfg(unix)]
impl UnixConnector {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        UnixConnector { path: path.into() }
    }
}

#[cfg(unix)]
impl Connector for UnixConnector {
    fn connect(&self) -> ConnectFuture {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn address(&self) -> String {
        self.path.display().to_string()
    }
}

/// TLS over TCP.
#[cfg(feature = "tls")]
#[derive(Clone)]
pub struct TlsConnector {
    tcp: TcpConnector,
    tls: tokio_rustls::TlsConnector,
    server_name: tokio_rustls::rustls::pki_types::ServerName<'static>,
}

#[cfg(feature = "tls")]
impl TlsConnector {
    pub fn new(tcp: TcpConnector, options: &crate::config::TlsOptions) -> ClientResult<Self> {
        let name = options
            .server_name
            .clone()
            .unwrap_or_else(|| tcp.host.clone());
        let server_name = tokio_rustls::rustls::pki_types::ServerName::try_from(name.clone())
            .map_err(|err| ClientError::InvalidAddress(format!("{name}: {err}")))?;
        Ok(TlsConnector {
            tcp,
            tls: tokio_rustls::TlsConnector::from(options.client_config.clone()),
            server_name,
        })
    }
}

#[cfg(feature = "tls")]
impl Connector for TlsConnector {
    fn connect(&self) -> ConnectFuture {
        let open = self.tcp.open();
        let tls = self.tls.clone();
        let server_name = self.server_name.clone();
        Box::pin(async move {
            let stream = tls.connect(server_name, open.await?).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }

    fn address(&self) -> String {
        format!("tls://{}", self.tcp.address())
    }
}

#[cfg(feature = "tls")]
const MISSING_TLS: &str = "TLS is required but no TLS options were supplied";
#[cfg(not(feature = "tls"))]
const MISSING_TLS: &str = "TLS is required but the tls feature is disabled";

/// Builds the connector described by `config`.
///
/// Fails with `InvalidAddress` when `require_tls` is set and no TLS
/// connector can be built.
pub fn connector_from_config(config: &ClientConfig) -> ClientResult<Arc<dyn Connector>> {
    if let Some(path) = &config.path {
        #[cfg(unix)]
        {
            return Ok(Arc::new(UnixConnector::new(path.clone())));
        }
        #[cfg(not(unix))]
        {
            return Err(ClientError::InvalidAddress(format!(
                "{}: unix sockets are not supported on this platform",
                path.display()
            )));
        }
    }

    let tcp = TcpConnector::new(config.host.clone(), config.port)
        .keep_alive(config.keep_alive)
        .keep_alive_initial_delay(config.keep_alive_initial_delay)
        .no_delay(config.no_delay);

    #[cfg(feature = "tls")]
    if let Some(options) = &config.tls {
        return Ok(Arc::new(TlsConnector::new(tcp, options)?));
    }

    if config.require_tls {
        return Err(ClientError::InvalidAddress(format!(
            "{}: {MISSING_TLS}",
            config.address()
        )));
    }
    Ok(Arc::new(tcp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_connector_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.expect("read");
            buf
        });

        let connector = TcpConnector::new("127.0.0.1", port);
        assert_eq!(connector.address(), format!("127.0.0.1:{port}"));
        let mut stream = connector.connect().await.expect("connect");
        stream.write_all(b"PING").await.expect("write");
        assert_eq!(&server.await.expect("join"), b"PING");
    }

    #[tokio::test]
    async fn tcp_connector_reports_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        assert!(TcpConnector::new("127.0.0.1", port).connect().await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn keep_alive_initial_delay_is_applied_to_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let stream = TcpConnector::new("127.0.0.1", port)
            .keep_alive_initial_delay(Duration::from_secs(42))
            .open()
            .await
            .expect("connect");
        let socket = SockRef::from(&stream);
        assert!(socket.keepalive().expect("keepalive"));
        assert_eq!(socket.keepalive_time().expect("idle"), Duration::from_secs(42));
        assert!(stream.nodelay().expect("nodelay"));
    }

    #[test]
    fn config_selects_connector() {
        let config = ClientConfig::default();
        let connector = connector_from_config(&config).expect("tcp");
        assert_eq!(connector.address(), "127.0.0.1:6379");

        #[cfg(unix)]
        {
            let config = ClientConfig {
                path: Some("/tmp/rkv.sock".into()),
                ..ClientConfig::default()
            };
            let connector = connector_from_config(&config).expect("unix");
            assert_eq!(connector.address(), "/tmp/rkv.sock");
        }
    }

    #[test]
    fn required_tls_never_falls_back_to_tcp() {
        let config = ClientConfig::from_url("rediss://cache.example.com:6380").expect("url");
        match connector_from_config(&config) {
            Err(ClientError::InvalidAddress(message)) => {
                assert!(message.starts_with("cache.example.com:6380: TLS is required"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(connector) => panic!("plain connector built: {}", connector.address()),
        }
    }

    #[cfg(feature = "tls")]
    #[test]
    fn tls_options_select_the_tls_connector() {
        use tokio_rustls::rustls;

        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        let config = ClientConfig {
            tls: Some(crate::config::TlsOptions {
                client_config: Arc::new(client_config),
                server_name: None,
            }),
            ..ClientConfig::from_url("rediss://cache.example.com:6380").expect("url")
        };
        let connector = connector_from_config(&config).expect("tls");
        assert_eq!(connector.address(), "tls://cache.example.com:6380");
    }
}
