//! Configured backend filters and the transports used to reach them

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};
use tokio_util::compat::TokioAsyncReadCompatExt;

/// Where a backend filter listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddr {
    /// A TCP endpoint, `host:port`
    Tcp(String),
    /// A UNIX domain socket path
    Unix(PathBuf),
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendAddr::Tcp(endpoint) => write!(f, "inet:{endpoint}"),
            BackendAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// The four deadlines guarding one backend session
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Establishing the transport connection
    pub connect: Duration,
    /// A single command write
    pub write: Duration,
    /// Awaiting the reply to a regular command
    pub read: Duration,
    /// Awaiting the reply to end-of-message; filters scan the mail here
    pub end_of_message: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            write: Duration::from_secs(10),
            read: Duration::from_secs(10),
            end_of_message: Duration::from_secs(300),
        }
    }
}

/// One configured backend filter
#[derive(Debug, Clone)]
pub struct Backend {
    /// Name used in diagnostics and logs
    pub name: String,
    /// Where to reach the filter
    pub addr: BackendAddr,
    /// Command starting the filter process, used in privilege mode when the
    /// first connection attempt fails
    pub launch_command: Option<String>,
    /// Per-session deadlines
    pub timeouts: Timeouts,
}

impl Backend {
    /// A backend listening on a TCP endpoint
    #[must_use]
    pub fn tcp(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            addr: BackendAddr::Tcp(endpoint.to_string()),
            launch_command: None,
            timeouts: Timeouts::default(),
        }
    }

    /// A backend listening on a UNIX socket
    #[must_use]
    pub fn unix(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            addr: BackendAddr::Unix(path.into()),
            launch_command: None,
            timeouts: Timeouts::default(),
        }
    }

    /// Set the command used to start this filter in privilege mode
    #[must_use]
    pub fn with_launch_command(mut self, command: &str) -> Self {
        self.launch_command = Some(command.to_string());
        self
    }

    /// Override the default deadlines
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

/// The byte stream a session speaks milter over
pub trait SessionIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SessionIo for T {}

/// A boxed, type-erased session transport
pub type BoxedIo = Box<dyn SessionIo>;

/// Opens transports toward backends.
///
/// The production implementation is [`NetConnector`]; tests substitute one
/// handing out in-memory pipes.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh transport to `backend`
    ///
    /// # Errors
    /// If the backend cannot be reached.
    async fn open(&self, backend: &Backend) -> io::Result<BoxedIo>;
}

/// Connects via TCP or UNIX sockets
#[derive(Debug, Default)]
pub struct NetConnector;

#[async_trait]
impl Connector for NetConnector {
    async fn open(&self, backend: &Backend) -> io::Result<BoxedIo> {
        match &backend.addr {
            BackendAddr::Tcp(endpoint) => {
                let stream = tokio::net::TcpStream::connect(endpoint).await?;
                Ok(Box::new(stream.compat()))
            }
            BackendAddr::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream.compat()))
            }
        }
    }
}

/// Hands out pre-registered transports by backend name.
///
/// Meant for tests and examples that wire sessions to in-memory pipes
/// instead of sockets. Every registered transport is used exactly once.
#[derive(Default)]
pub struct QueueConnector {
    queued: Mutex<HashMap<String, Vec<BoxedIo>>>,
}

impl QueueConnector {
    /// An empty connector; register transports before negotiating
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `io` as the next transport for the backend called `name`
    pub fn register(&self, name: &str, io: BoxedIo) {
        self.queued
            .lock()
            .expect("connector lock")
            .entry(name.to_string())
            .or_default()
            .push(io);
    }
}

#[async_trait]
impl Connector for QueueConnector {
    async fn open(&self, backend: &Backend) -> io::Result<BoxedIo> {
        let mut queued = self.queued.lock().expect("connector lock");
        match queued.get_mut(&backend.name).and_then(|ios| {
            if ios.is_empty() {
                None
            } else {
                Some(ios.remove(0))
            }
        }) {
            Some(io) => Ok(io),
            None => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no transport registered for backend '{}'", backend.name),
            )),
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn addr_display() {
        assert_eq!(
            BackendAddr::Tcp("filter.example:7357".into()).to_string(),
            "inet:filter.example:7357"
        );
        assert_eq!(
            BackendAddr::Unix("/run/filter.sock".into()).to_string(),
            "unix:/run/filter.sock"
        );
    }

    #[tokio::test]
    async fn queue_connector_hands_out_once() {
        let connector = QueueConnector::new();
        let backend = Backend::tcp("scripted", "unused:0");

        let (one, _keep) = tokio::io::duplex(64);
        connector.register("scripted", Box::new(one.compat()));

        connector.open(&backend).await.expect("first transport");
        assert!(
            connector.open(&backend).await.is_err(),
            "queue must be exhausted"
        );
    }
}
