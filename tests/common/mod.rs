//! Shared fixtures: an in-memory transport scripted by a fake gateway

#![allow(dead_code)]

use dispatch_sip::infrastructure::protocols::sip::transport::{Received, Transport, TransportError};
use dispatch_sip::infrastructure::protocols::sip::{MessageType, SipMessage};
use dispatch_sip::{SessionEvent, TransportKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Transport whose peer is a [`Gateway`] in the same test
pub struct ScriptedTransport {
    kind: TransportKind,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
}

/// The test's end of a [`ScriptedTransport`]
pub struct Gateway {
    to_session: mpsc::UnboundedSender<Vec<u8>>,
    from_session: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn scripted(kind: TransportKind) -> (Arc<ScriptedTransport>, Gateway) {
    let (to_session, inbound) = mpsc::unbounded_channel();
    let (outbound, from_session) = mpsc::unbounded_channel();
    let transport = Arc::new(ScriptedTransport {
        kind,
        inbound: Mutex::new(inbound),
        outbound,
        connects: AtomicUsize::new(0),
        closes: AtomicUsize::new(0),
    });
    (
        transport,
        Gateway {
            to_session,
            from_session,
        },
    )
}

impl ScriptedTransport {
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        "192.168.1.20:40312".parse().ok()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, data: &[u8], _destination: Option<SocketAddr>) -> Result<usize, TransportError> {
        self.outbound
            .send(data.to_vec())
            .map_err(|_| TransportError::InvalidSocket)?;
        Ok(data.len())
    }

    async fn recv(&self, buf: &mut [u8], timeout: Option<u64>) -> Result<Received, TransportError> {
        let mut inbound = self.inbound.lock().await;
        let data = match timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), inbound.recv())
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => inbound.recv().await,
        };
        let data = data.ok_or(TransportError::InvalidSocket)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(Received {
            len: data.len(),
            source: "10.12.49.86:6001".parse().ok(),
        })
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Gateway {
    /// Next message the session wrote
    pub async fn next_message(&mut self) -> SipMessage {
        let data = tokio::time::timeout(WAIT, self.from_session.recv())
            .await
            .expect("session sent nothing")
            .expect("transport dropped");
        SipMessage::decode(&data).expect("session sent a malformed message")
    }

    /// Next message of `kind`, skipping anything else
    pub async fn next_of(&mut self, kind: MessageType) -> SipMessage {
        loop {
            let msg = self.next_message().await;
            if msg.kind() == kind {
                return msg;
            }
        }
    }

    /// Whatever the session has written and not been read yet
    pub fn drain(&mut self) -> Vec<SipMessage> {
        let mut out = Vec::new();
        while let Ok(data) = self.from_session.try_recv() {
            out.push(SipMessage::decode(&data).expect("malformed message"));
        }
        out
    }

    pub fn send(&self, msg: &SipMessage) {
        self.to_session
            .send(msg.encode().to_vec())
            .expect("session receiver gone");
    }

    /// Raw bytes, possibly a partial message
    pub fn send_raw(&self, data: &[u8]) {
        self.to_session
            .send(data.to_vec())
            .expect("session receiver gone");
    }
}

/// Wait for the first event matching `pred`
pub async fn wait_event<F>(events: &mut mpsc::UnboundedReceiver<SessionEvent>, pred: F) -> SessionEvent
where
    F: Fn(&SessionEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not delivered in time")
}

/// Everything delivered so far
pub fn collected(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}
