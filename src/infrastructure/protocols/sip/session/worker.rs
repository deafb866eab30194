//! Receive and send workers

use super::{Inner, Outbound};
use crate::domain::call::DisconnectCause;
use crate::domain::session::{SessionEvent, SessionState, Worker};
use crate::infrastructure::protocols::sip::framing::StreamDecoder;
use crate::infrastructure::protocols::sip::message::SipMessage;
use crate::infrastructure::protocols::sip::transport::{Received, TransportError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Receive buffer size; one datagram or one stream read
const RECV_BUFFER: usize = 64 * 1024;

/// Traffic timeout derived from the gaps between server keep-alives
#[derive(Debug, Clone)]
pub struct TrafficWindow {
    timeout: Duration,
    floor: Duration,
    last_keep_alive: Option<Instant>,
}

impl TrafficWindow {
    pub fn new(initial: Duration, floor: Duration) -> Self {
        Self {
            timeout: initial,
            floor,
            last_keep_alive: None,
        }
    }

    /// Record a keep-alive seen at `now`. After the second one the timeout
    /// becomes three gaps, never below the floor.
    pub fn observe_keep_alive(&mut self, now: Instant) -> Duration {
        if let Some(previous) = self.last_keep_alive {
            let gap = now.saturating_duration_since(previous);
            self.timeout = (gap * 3).max(self.floor);
        }
        self.last_keep_alive = Some(now);
        self.timeout
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Timeout in whole seconds, rounded up, at least 1
    pub fn timeout_secs(&self) -> u64 {
        let secs = self.timeout.as_secs() + u64::from(self.timeout.subsec_nanos() > 0);
        secs.max(1)
    }
}

/// Receive worker: connect (streams), read, decode and dispatch until STOPPED
pub(super) async fn receive_loop(inner: Arc<Inner>) {
    let stream = inner.transport.kind().is_stream();
    let mut decoder = StreamDecoder::new();
    let mut buf = vec![0u8; RECV_BUFFER];

    'session: while !inner.state.is_stopped() {
        if !open_link(&inner, &mut decoder).await {
            break;
        }

        loop {
            let pruned = inner
                .registrations
                .lock()
                .prune(inner.config.timing.attempt_expiry);
            if pruned > 0 {
                debug!("Pruned {} unanswered register attempts", pruned);
            }

            let timeout = inner.traffic.lock().timeout_secs();
            let received = tokio::select! {
                r = inner.transport.recv(&mut buf, Some(timeout)) => Some(r),
                _ = inner.state.stopped() => None,
            };
            let Some(received) = received else {
                break 'session;
            };

            match received {
                Ok(Received { len, source }) => {
                    trace!("Received {} bytes from {:?}", len, source);
                    let messages = if stream {
                        decoder.decode(&buf[..len])
                    } else {
                        match SipMessage::decode(&buf[..len]) {
                            Ok(msg) => vec![msg],
                            Err(e) => {
                                warn!("Dropping malformed datagram from {:?}: {}", source, e);
                                Vec::new()
                            }
                        }
                    };
                    for msg in messages {
                        inner.dispatch(msg, source);
                    }
                }
                Err(TransportError::Timeout) => {
                    warn!("No traffic for {}s", timeout);
                    if stream {
                        link_lost(&inner, true);
                        continue 'session;
                    }
                    inner.register_local();
                }
                Err(e) if inner.state.is_stopped() => {
                    debug!("Receive ended by shutdown: {}", e);
                    break 'session;
                }
                Err(e) if stream => {
                    warn!("Connection lost: {} (code {})", e, e.code());
                    link_lost(&inner, false);
                    continue 'session;
                }
                Err(TransportError::InvalidSocket) => {
                    warn!("Datagram socket closed, rebinding");
                    continue 'session;
                }
                Err(e) => {
                    warn!("Datagram receive failed: {} (code {})", e, e.code());
                    if !pause(&inner).await {
                        break 'session;
                    }
                }
            }
        }
    }

    debug!("Receive worker exiting");
    inner.emit(SessionEvent::WorkerExited(Worker::Receive));
}

/// Send worker: drain the queue until it is closed
pub(super) async fn send_loop(inner: Arc<Inner>) {
    loop {
        match inner.queue.next().await {
            Some(Outbound {
                message,
                destination,
            }) => {
                let data = message.encode();
                match inner.transport.send(&data, destination).await {
                    Ok(written) => debug!(
                        "Sent {} ({} bytes) seq {:?}",
                        describe(&message),
                        written,
                        message.seq()
                    ),
                    Err(e) => warn!("Failed to send {}: {} (code {})", describe(&message), e, e.code()),
                }
            }
            None => {
                if inner.queue.is_closed() || inner.state.is_stopped() {
                    break;
                }
            }
        }
    }

    debug!("Send worker exiting");
    inner.emit(SessionEvent::WorkerExited(Worker::Send));
}

/// Bring the transport up. Streams retry with a fixed pause until connected
/// or STOPPED; datagram sockets are bound and register straight away.
/// Returns false once STOPPED.
async fn open_link(inner: &Arc<Inner>, decoder: &mut StreamDecoder) -> bool {
    let stream = inner.transport.kind().is_stream();
    loop {
        if inner.state.is_stopped() {
            return false;
        }
        if stream {
            inner.set_state(SessionState::Connecting);
        }

        let connected = tokio::select! {
            r = inner.transport.connect() => Some(r),
            _ = inner.state.stopped() => None,
        };
        match connected {
            None => return false,
            Some(Ok(())) => {
                let local = inner.transport.local_addr();
                inner.endpoint.write().local = local;
                decoder.clear();
                if stream {
                    info!("Connected to {} from {:?}", inner.config.server_authority(), local);
                    inner.set_state(SessionState::Connected);
                } else {
                    info!("Bound datagram socket {:?}", local);
                }
                inner.register_local();
                return true;
            }
            Some(Err(e)) => {
                warn!(
                    "Connect to {} failed: {} (code {})",
                    inner.config.server_authority(),
                    e,
                    e.code()
                );
                if !pause(inner).await {
                    return false;
                }
            }
        }
    }
}

/// The stream link dropped or went silent
fn link_lost(inner: &Inner, silent: bool) {
    let was_registered = inner.state.get() == SessionState::Registered;
    if !inner.set_state(SessionState::Disconnected) {
        return;
    }
    if let Some(handle) = inner.refresh.lock().take() {
        handle.abort();
    }
    if silent || was_registered {
        inner.emit(SessionEvent::ServerUnregistered);
    }

    // Transactions still in setup were bound to the old connection
    for call_id in inner.calls.ids() {
        let in_setup = inner.calls.get(&call_id).map(|c| c.in_setup()).unwrap_or(false);
        if in_setup && inner.calls.remove(&call_id).is_some() {
            inner.emit(SessionEvent::CallEnded {
                call_id,
                cause: DisconnectCause::TransportLost,
            });
        }
    }
}

/// Fixed reconnect pause, cut short by STOPPED. False once STOPPED.
async fn pause(inner: &Inner) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(inner.config.timing.reconnect_pause) => !inner.state.is_stopped(),
        _ = inner.state.stopped() => false,
    }
}

fn describe(message: &SipMessage) -> String {
    match message.status() {
        Some(code) => format!("{} response to {}", code, message.kind()),
        None => message.kind().to_string(),
    }
}
