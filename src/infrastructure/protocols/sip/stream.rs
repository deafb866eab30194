//! Reliable stream transport (TCP, optionally wrapped in TLS)

use super::transport::{Received, RemoteEndpoint, Transport, TransportError};
use crate::config::{TlsSettings, TransportKind};
use crate::infrastructure::tls::TlsClientContext;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// TCP/TLS client connection to the gateway
pub struct StreamTransport {
    remote: RemoteEndpoint,
    local_port: u16,
    slice: Duration,
    tls: Option<TlsClientContext>,
    reader: Mutex<Option<ReadHalf>>,
    writer: Mutex<Option<WriteHalf>>,
    local: parking_lot::Mutex<Option<SocketAddr>>,
    peer: parking_lot::Mutex<Option<SocketAddr>>,
    closing: AtomicBool,
}

impl StreamTransport {
    pub fn new(remote: RemoteEndpoint, local_port: u16, slice: Duration) -> Self {
        Self {
            remote,
            local_port,
            slice: slice.max(Duration::from_millis(10)),
            tls: None,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            local: parking_lot::Mutex::new(None),
            peer: parking_lot::Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    /// Stream transport whose connections are wrapped in TLS
    pub fn with_tls(
        remote: RemoteEndpoint,
        local_port: u16,
        slice: Duration,
        settings: &TlsSettings,
    ) -> Result<Self, TransportError> {
        let tls = TlsClientContext::new(settings, &remote.host)?;
        let mut transport = Self::new(remote, local_port, slice);
        transport.tls = Some(tls);
        Ok(transport)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    async fn drop_connection(&self) {
        self.reader.lock().await.take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.local.lock().take();
        self.peer.lock().take();
    }

    async fn open_socket(&self, peer: SocketAddr) -> Result<TcpStream, TransportError> {
        let socket = if peer.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if self.local_port != 0 {
            socket.set_reuseaddr(true)?;
            let bind: SocketAddr = if peer.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], self.local_port))
            } else {
                SocketAddr::from(([0u16; 8], self.local_port))
            };
            socket.bind(bind)?;
        }

        let stream = timeout(CONNECT_TIMEOUT, socket.connect(peer))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait::async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        if self.tls.is_some() {
            TransportKind::Tls
        } else {
            TransportKind::Tcp
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.drop_connection().await;
        self.closing.store(false, Ordering::Release);

        let peer = self.remote.resolve().await?;
        debug!("Connecting {} to {}", self.kind(), peer);
        let stream = self.open_socket(peer).await?;
        let local = stream.local_addr().ok();

        let (reader, writer): (ReadHalf, WriteHalf) = match &self.tls {
            Some(tls) => {
                let tls_stream = timeout(
                    CONNECT_TIMEOUT,
                    tls.connector.connect(tls.server_name.clone(), stream),
                )
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::TlsInit(e.to_string()))?;
                let (r, w) = tokio::io::split(tls_stream);
                (Box::new(r), Box::new(w))
            }
            None => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };

        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        *self.local.lock() = local;
        *self.peer.lock() = Some(peer);

        info!("{} connection established to {}", self.kind(), peer);
        Ok(())
    }

    async fn send(&self, data: &[u8], _destination: Option<SocketAddr>) -> Result<usize, TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::InvalidSocket)?;

        let written = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        timeout(SEND_TIMEOUT, written)
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(data.len())
    }

    async fn recv(&self, buf: &mut [u8], wait: Option<u64>) -> Result<Received, TransportError> {
        let deadline = wait.map(|secs| Instant::now() + Duration::from_secs(secs));
        let mut guard = self.reader.lock().await;

        loop {
            if self.closing.load(Ordering::Acquire) {
                return Err(TransportError::InvalidSocket);
            }
            let reader = guard.as_mut().ok_or(TransportError::InvalidSocket)?;

            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(TransportError::Timeout);
                    }
                    left.min(self.slice)
                }
                None => self.slice,
            };

            match timeout(slice, reader.read(buf)).await {
                Ok(Ok(0)) => {
                    warn!("Connection closed by peer");
                    return Err(TransportError::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
                Ok(Ok(len)) => {
                    return Ok(Received {
                        len,
                        source: *self.peer.lock(),
                    })
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => continue,
            }
        }
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.drop_connection().await;
        debug!("Stream transport closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, RemoteEndpoint) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, RemoteEndpoint::new("127.0.0.1", port).unwrap())
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (listener, remote) = listener().await;
        let transport = StreamTransport::new(remote, 0, Duration::from_millis(50));

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
            socket
        });

        transport.connect().await.unwrap();
        assert!(transport.local_addr().is_some());
        assert_eq!(transport.send(b"OPTIONS", None).await.unwrap(), 7);

        let mut buf = [0u8; 64];
        let received = transport.recv(&mut buf, Some(2)).await.unwrap();
        assert_eq!(&buf[..received.len], b"OPTIONS");
        assert_eq!(received.source, transport.peer_addr());

        let _socket = server.await.unwrap();
        transport.close().await;
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (listener, remote) = listener().await;
        let transport = StreamTransport::new(remote, 0, Duration::from_millis(50));
        let _server = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        transport.connect().await.unwrap();
        let mut buf = [0u8; 16];
        let err = transport.recv(&mut buf, Some(0)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_peer_close_is_disconnect() {
        let (listener, remote) = listener().await;
        let transport = StreamTransport::new(remote, 0, Duration::from_millis(50));
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        transport.connect().await.unwrap();
        server.await.unwrap();
        let mut buf = [0u8; 16];
        let err = transport.recv(&mut buf, Some(2)).await.unwrap_err();
        assert!(err.is_disconnected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_invalidates() {
        let (listener, remote) = listener().await;
        let transport = StreamTransport::new(remote, 0, Duration::from_millis(50));
        let _server = tokio::spawn(async move { listener.accept().await.map(|(s, _)| s) });

        transport.connect().await.unwrap();
        transport.close().await;
        transport.close().await;

        let mut buf = [0u8; 16];
        assert!(matches!(
            transport.recv(&mut buf, Some(1)).await,
            Err(TransportError::InvalidSocket)
        ));
        assert!(matches!(
            transport.send(b"x", None).await,
            Err(TransportError::InvalidSocket)
        ));
    }

    #[tokio::test]
    async fn test_send_before_connect() {
        let transport = StreamTransport::new(
            RemoteEndpoint::new("127.0.0.1", 5060).unwrap(),
            0,
            Duration::from_millis(50),
        );
        assert!(matches!(
            transport.send(b"x", None).await,
            Err(TransportError::InvalidSocket)
        ));
    }
}
