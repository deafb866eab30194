//! Datagram transport (UDP)
//!
//! Every datagram is one complete message; nothing is re-assembled.

use super::transport::{Received, RemoteEndpoint, Transport, TransportError};
use crate::config::TransportKind;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

/// UDP socket bound locally, with the gateway as default destination
pub struct DatagramTransport {
    remote: RemoteEndpoint,
    local_port: u16,
    slice: Duration,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local: Mutex<Option<SocketAddr>>,
    peer: Mutex<Option<SocketAddr>>,
    closing: AtomicBool,
}

impl DatagramTransport {
    pub fn new(remote: RemoteEndpoint, local_port: u16, slice: Duration) -> Self {
        Self {
            remote,
            local_port,
            slice: slice.max(Duration::from_millis(10)),
            socket: Mutex::new(None),
            local: Mutex::new(None),
            peer: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::InvalidSocket);
        }
        self.socket.lock().clone().ok_or(TransportError::InvalidSocket)
    }
}

#[async_trait::async_trait]
impl Transport for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local.lock()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.socket.lock().take();
        self.closing.store(false, Ordering::Release);

        let peer = self.remote.resolve().await?;
        let bind: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], self.local_port))
        } else {
            SocketAddr::from(([0u16; 8], self.local_port))
        };
        let socket = UdpSocket::bind(bind).await?;
        let port = socket.local_addr()?.port();
        let ip = outbound_ip(bind, peer).await.unwrap_or_else(|| bind.ip());
        let local = SocketAddr::new(ip, port);
        info!("UDP socket bound on {} for {}", local, peer);

        *self.socket.lock() = Some(Arc::new(socket));
        *self.local.lock() = Some(local);
        *self.peer.lock() = Some(peer);
        Ok(())
    }

    async fn send(&self, data: &[u8], destination: Option<SocketAddr>) -> Result<usize, TransportError> {
        let socket = self.socket()?;
        let target = destination
            .or_else(|| self.peer_addr())
            .ok_or(TransportError::MissingRemoteAddress)?;
        let sent = socket.send_to(data, target).await?;
        debug!("Sent {} bytes to {}", sent, target);
        Ok(sent)
    }

    async fn recv(&self, buf: &mut [u8], wait: Option<u64>) -> Result<Received, TransportError> {
        let deadline = wait.map(|secs| Instant::now() + Duration::from_secs(secs));
        let socket = self.socket()?;

        loop {
            if self.closing.load(Ordering::Acquire) {
                return Err(TransportError::InvalidSocket);
            }
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

            match timeout(slice, socket.recv_from(buf)).await {
                Ok(Ok((len, source))) => {
                    return Ok(Received {
                        len,
                        source: Some(source),
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
        self.socket.lock().take();
        self.local.lock().take();
        debug!("Datagram transport closed");
    }
}

/// Interface address the OS would use to reach `peer`
async fn outbound_ip(bind: SocketAddr, peer: SocketAddr) -> Option<IpAddr> {
    let probe = UdpSocket::bind(SocketAddr::new(bind.ip(), 0)).await.ok()?;
    probe.connect(peer).await.ok()?;
    probe.local_addr().ok().map(|a| a.ip())
}
