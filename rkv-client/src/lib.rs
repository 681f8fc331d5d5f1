//! # RKV Client
//!
//! Purpose: A resilient single-connection client for RESP servers. Commands
//! are queued while the connection is down, correlated with replies in strict
//! FIFO order, and the connection is rebuilt with backoff when it drops.
//!
//! ## Design Principles
//! 1. **One Task per Connection**: The connection manager owns the socket,
//!    the queues and the state machine; `Client` handles only send messages.
//! 2. **Explicit Failure Modes**: Every way a command can fail has its own
//!    `ClientError` variant, attributed to the command it hit.
//! 3. **Restore, Then Release**: After a reconnect the database, monitor
//!    mode and subscriptions are restored before queued commands are written.
//! 4. **Pluggable Edges**: Transports come from a `Connector`, reconnect
//!    delays from a `RetryStrategy`.
//!
//! ## Example
//!
//! ```no_run
//! use rkv_client::{ClientConfig, ClientFactory};
//! use rkv_proto::Command;
//!
//! # async fn demo() -> Result<(), rkv_client::ClientError> {
//! let factory = ClientFactory::new();
//! let client = factory.create(ClientConfig::from_url("redis://127.0.0.1:6379/0")?)?;
//! client.send(Command::new("SET").arg("greeting").arg("hello")).await?;
//! let value = client.send(Command::new("GET").arg("greeting")).await?;
//! assert_eq!(value.as_str(), Some("hello"));
//! # Ok(())
//! # }
//! ```

mod batch;
mod client;
mod config;
mod connection;
mod error;
mod event;
mod monitor;
mod queue;
mod ready;
mod retry;
mod router;
mod subscription;
mod transport;

pub use batch::MAX_WRITE_BYTES;
pub use client::{Client, ClientFactory, Pipeline, ReplyFuture};
#[cfg(feature = "tls")]
pub use config::TlsOptions;
pub use config::{
    BackoffConfig, ClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_EVENT_CAPACITY, DEFAULT_PORT,
    DEFAULT_WRITE_HIGH_WATER_MARK,
};
pub use connection::{ConnectionState, ConnectionStatus};
pub use error::{BrokenReason, ClientError, ClientResult, CommandInfo};
pub use event::{ClientEvent, PubSubMessage, ReconnectInfo};
pub use monitor::MonitorLine;
pub use ready::ServerInfo;
pub use retry::{ExponentialBackoff, RetryContext, RetryDecision, RetryPolicy, RetryStrategy};
pub use subscription::{SubscribeKind, SubscriptionKey, SubscriptionSet};
#[cfg(feature = "tls")]
pub use transport::TlsConnector;
#[cfg(unix)]
pub use transport::UnixConnector;
pub use transport::{connector_from_config, AsyncStream, BoxedStream, ConnectFuture, Connector, TcpConnector};
