//! SIP transport layer - reliable stream (TCP, optionally TLS) and datagram (UDP)
//!
//! Both kinds expose the same operations through [`Transport`]. A transport
//! is shared by the two session workers: the receive worker owns `connect`
//! and `recv`, the send worker is the only caller of `send`.

use super::datagram::DatagramTransport;
use super::stream::StreamTransport;
use crate::config::{SessionConfig, TransportKind};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::lookup_host;

/// Sentinel codes for outcomes that have no platform error code
pub const ERR_INVALID_SOCKET: i32 = -10001;
pub const ERR_TIMEOUT: i32 = -10002;
pub const ERR_MISSING_REMOTE_ADDRESS: i32 = -10003;
pub const ERR_INVALID_REMOTE_ADDRESS: i32 = -10004;
pub const ERR_TLS_INIT: i32 = -10005;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket is not open")]
    InvalidSocket,

    #[error("Timed out")]
    Timeout,

    #[error("No remote address configured")]
    MissingRemoteAddress,

    #[error("Invalid remote address: {0}")]
    InvalidRemoteAddress(String),

    #[error("TLS context initialisation failed: {0}")]
    TlsInit(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Coarse classification used to decide between retry and reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The peer went away; reconnect
    Disconnected,
    /// Nothing available yet; try again
    WouldBlock,
    Other,
}

impl ErrorClass {
    pub fn of_kind(kind: io::ErrorKind) -> Self {
        use io::ErrorKind::*;
        match kind {
            ConnectionReset | ConnectionAborted | ConnectionRefused | NotConnected | BrokenPipe
            | UnexpectedEof => ErrorClass::Disconnected,
            WouldBlock | TimedOut | Interrupted => ErrorClass::WouldBlock,
            _ => ErrorClass::Other,
        }
    }

    /// Classify a code as returned by [`TransportError::code`]
    pub fn of_code(code: i32) -> Self {
        match code {
            ERR_INVALID_SOCKET => ErrorClass::Disconnected,
            ERR_TIMEOUT => ErrorClass::WouldBlock,
            c if c < 0 && c > ERR_INVALID_SOCKET => {
                Self::of_kind(io::Error::from_raw_os_error(-c).kind())
            }
            _ => ErrorClass::Other,
        }
    }
}

impl TransportError {
    /// Negative code: a sentinel, or the negated OS error code
    pub fn code(&self) -> i32 {
        match self {
            TransportError::InvalidSocket => ERR_INVALID_SOCKET,
            TransportError::Timeout => ERR_TIMEOUT,
            TransportError::MissingRemoteAddress => ERR_MISSING_REMOTE_ADDRESS,
            TransportError::InvalidRemoteAddress(_) => ERR_INVALID_REMOTE_ADDRESS,
            TransportError::TlsInit(_) => ERR_TLS_INIT,
            TransportError::Io(e) => e.raw_os_error().map(|c| -c).unwrap_or(-1),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::InvalidSocket => ErrorClass::Disconnected,
            TransportError::Timeout => ErrorClass::WouldBlock,
            TransportError::Io(e) => ErrorClass::of_kind(e.kind()),
            _ => ErrorClass::Other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }

    pub fn is_disconnected(&self) -> bool {
        self.class() == ErrorClass::Disconnected
    }
}

/// One successful receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    pub len: usize,
    /// Sender address (datagram) or connected peer (stream)
    pub source: Option<SocketAddr>,
}

/// Transport seam shared by both session workers
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Local address of the open socket
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Open the socket (and for streams, connect). Closes any previous
    /// connection first, so calling it again reconnects.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Send one encoded message. `destination` only matters for datagrams;
    /// without it the configured peer is used.
    async fn send(&self, data: &[u8], destination: Option<SocketAddr>) -> Result<usize, TransportError>;

    /// Receive into `buf`, waiting at most `timeout` whole seconds (forever
    /// when `None`). The wait is split into short slices so `close` is
    /// observed promptly.
    async fn recv(&self, buf: &mut [u8], timeout: Option<u64>) -> Result<Received, TransportError>;

    /// Release the socket (and TLS context). Safe to call repeatedly.
    async fn close(&self);
}

/// Remote peer as configured: host name or literal address plus port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub host: String,
    pub port: u16,
}

impl RemoteEndpoint {
    pub fn new(host: &str, port: u16) -> Result<Self, TransportError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(TransportError::MissingRemoteAddress);
        }
        if port == 0 {
            return Err(TransportError::InvalidRemoteAddress(format!("{}:0", host)));
        }
        if host.contains(char::is_whitespace) || host.contains('/') {
            return Err(TransportError::InvalidRemoteAddress(host.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve to a socket address, preferring the first result
    pub async fn resolve(&self) -> Result<SocketAddr, TransportError> {
        let authority = format!("{}:{}", self.host, self.port);
        if let Ok(addr) = authority.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let mut addrs = lookup_host(authority.clone())
            .await
            .map_err(|_| TransportError::InvalidRemoteAddress(authority.clone()))?;
        addrs
            .next()
            .ok_or(TransportError::InvalidRemoteAddress(authority))
    }
}

/// Build the transport selected by the configuration
pub fn open(config: &SessionConfig) -> Result<Arc<dyn Transport>, TransportError> {
    let remote = RemoteEndpoint::new(&config.server_host, config.server_port)?;
    let slice = config.timing.receive_slice;
    let transport: Arc<dyn Transport> = match config.transport {
        TransportKind::Udp => Arc::new(DatagramTransport::new(remote, config.local_port, slice)),
        TransportKind::Tcp => Arc::new(StreamTransport::new(remote, config.local_port, slice)),
        TransportKind::Tls => Arc::new(StreamTransport::with_tls(
            remote,
            config.local_port,
            slice,
            &config.tls,
        )?),
    };
    Ok(transport)
}
