//! Client session: registration state machine plus the send/receive workers
//!
//! A [`SipSession`] owns one transport, one outbound queue and the call and
//! registration tables. The receive worker reads, decodes and dispatches;
//! the send worker is the only writer to the transport. Everything else,
//! including replies produced on the receive worker, goes through the queue.

mod dispatch;
pub mod queue;
mod registration;
mod worker;

pub use queue::{Outbound, SendQueue};
pub use worker::TrafficWindow;

use super::auth::{DigestChallenge, DigestClient};
use super::builder::{self, Endpoint, Sequence};
use super::calls::{self, CallSignaling};
use super::handler::{HandlerContext, MessageHandler};
use super::transport::{self, Transport};
use crate::config::SessionConfig;
use crate::domain::call::{CallData, CallTable};
use crate::domain::session::{
    AppRequest, EventSink, RegistrationTable, SessionEvent, SessionState, StateCell, Worker,
};
use crate::domain::shared::error::SessionError;
use crate::domain::shared::result::Result;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Dialog identifiers reused by every REGISTER of the session
#[derive(Debug)]
pub(crate) struct RegistrarState {
    pub call_id: String,
    pub tag: String,
    /// Last challenge from the registrar, answered on every later REGISTER
    pub challenge: Option<DigestChallenge>,
}

/// State shared by the session handle, the workers and the timers
pub(crate) struct Inner {
    pub config: SessionConfig,
    pub state: StateCell,
    pub transport: Arc<dyn Transport>,
    pub queue: SendQueue,
    pub calls: Arc<CallTable>,
    pub registrations: Mutex<RegistrationTable>,
    pub registrar: Mutex<RegistrarState>,
    pub digest: Arc<DigestClient>,
    pub sequence: Arc<Sequence>,
    pub endpoint: RwLock<Endpoint>,
    pub handler: Arc<dyn MessageHandler>,
    pub sink: Arc<dyn EventSink>,
    pub standby: AtomicBool,
    pub traffic: Mutex<TrafficWindow>,
    /// Pending register refresh
    pub refresh: Mutex<Option<JoinHandle<()>>>,
    /// Pending service-unavailable retries
    pub backoffs: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let mut endpoint = Endpoint::from_config(&config);
        endpoint.transport = transport.kind();
        let registrar = RegistrarState {
            call_id: builder::new_call_id(&config.server_host),
            tag: builder::new_tag(),
            challenge: None,
        };
        let traffic = TrafficWindow::new(
            config.timing.default_traffic_timeout,
            config.timing.min_traffic_timeout,
        );
        Self {
            state: StateCell::new(),
            transport,
            queue: SendQueue::new(),
            calls: Arc::new(CallTable::new()),
            registrations: Mutex::new(RegistrationTable::new()),
            registrar: Mutex::new(registrar),
            digest: Arc::new(DigestClient::new(&config.secret)),
            sequence: Arc::new(Sequence::new()),
            endpoint: RwLock::new(endpoint),
            handler,
            sink,
            standby: AtomicBool::new(config.standby),
            traffic: Mutex::new(traffic),
            refresh: Mutex::new(None),
            backoffs: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        self.sink.on_event(event);
    }

    /// Store `next` and report the change. False if nothing changed.
    pub fn set_state(&self, next: SessionState) -> bool {
        match self.state.set(next) {
            Some(previous) => {
                info!("Session state {} -> {}", previous, next);
                self.emit(SessionEvent::StateChanged {
                    from: previous,
                    to: next,
                });
                true
            }
            None => false,
        }
    }

    pub fn enqueue(&self, item: Outbound) {
        if !self.queue.push(item) {
            debug!("Send queue closed, dropping outbound message");
        }
    }

    pub fn handler_context(&self) -> HandlerContext {
        HandlerContext::new(
            self.endpoint.read().clone(),
            self.config.media.clone(),
            self.calls.clone(),
            self.digest.clone(),
            self.sequence.clone(),
        )
    }

    pub fn is_standby(&self) -> bool {
        self.standby.load(Ordering::Relaxed)
    }

    /// Force STOPPED, cancel timers and release the send worker
    pub fn halt(&self) {
        self.set_state(SessionState::Stopped);
        if let Some(handle) = self.refresh.lock().take() {
            handle.abort();
        }
        for handle in self.backoffs.lock().drain(..) {
            handle.abort();
        }
        self.queue.close();
    }
}

/// Registration and call session against one gateway.
///
/// Construct, call [`start`](Self::start) from within a tokio runtime,
/// submit [`AppRequest`]s, and finish with [`shutdown`](Self::shutdown).
/// `shutdown` is the complete path; dropping the session only unregisters
/// on a best-effort basis.
pub struct SipSession {
    inner: Arc<Inner>,
    workers: Mutex<Vec<(Worker, JoinHandle<()>)>>,
}

impl SipSession {
    /// Session over the transport selected by `config`, with the default
    /// call signalling
    pub fn new(config: SessionConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let transport =
            transport::open(&config).map_err(|e| SessionError::InvalidTransport(e.to_string()))?;
        Ok(Self::with_transport(
            config,
            transport,
            Arc::new(CallSignaling::new()),
            sink,
        ))
    }

    /// Session over a caller-provided transport and handler
    pub fn with_transport(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner::new(config, transport, handler, sink)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// INVALID -> STARTED, then spawn both workers
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::Config(format!("no tokio runtime: {}", e)))?;
        if !self
            .inner
            .state
            .transition(&[SessionState::Invalid], SessionState::Started)
        {
            return Err(SessionError::InvalidStateTransition(format!(
                "cannot start from {}",
                self.inner.state.get()
            )));
        }
        info!(
            "Starting session for {} at {} over {}",
            self.inner.config.identity,
            self.inner.config.server_authority(),
            self.inner.transport.kind()
        );
        self.inner.emit(SessionEvent::StateChanged {
            from: SessionState::Invalid,
            to: SessionState::Started,
        });

        let receive = runtime.spawn(worker::receive_loop(self.inner.clone()));
        let send = runtime.spawn(worker::send_loop(self.inner.clone()));
        let mut workers = self.workers.lock();
        workers.push((Worker::Receive, receive));
        workers.push((Worker::Send, send));
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn identity(&self) -> &str {
        &self.inner.config.identity
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    /// Listen-only mode: call traffic is no longer handed to the handler
    pub fn set_standby(&self, standby: bool) {
        if self.inner.standby.swap(standby, Ordering::Relaxed) != standby {
            info!("Standby {}", if standby { "on" } else { "off" });
        }
    }

    pub fn is_standby(&self) -> bool {
        self.inner.is_standby()
    }

    /// Ids of the calls in progress
    pub fn active_calls(&self) -> Vec<String> {
        self.inner.calls.ids()
    }

    pub fn call(&self, call_id: &str) -> Option<CallData> {
        self.inner.calls.get(call_id)
    }

    /// Current traffic timeout in whole seconds
    pub fn traffic_timeout(&self) -> u64 {
        self.inner.traffic.lock().timeout_secs()
    }

    /// Translate `request` into protocol messages and enqueue them.
    ///
    /// Returns the call id the request created or acted on, if any.
    pub fn request(&self, request: AppRequest) -> Result<Option<String>> {
        match self.inner.state.get() {
            SessionState::Invalid | SessionState::Stopped => return Err(SessionError::NotRunning),
            _ => {}
        }

        if let AppRequest::Unregister { identity } = &request {
            let identity = identity
                .clone()
                .unwrap_or_else(|| self.inner.config.identity.clone());
            self.inner.send_registration(&identity, true);
            return Ok(None);
        }

        let translation = calls::translate(&request, &self.inner.handler_context())?;
        for message in translation.messages {
            self.inner.enqueue(Outbound::new(message));
        }
        Ok(translation.call_id)
    }

    /// Place a call to `target`, returning its call id
    pub fn place_call(&self, target: &str, video: bool) -> Result<String> {
        self.request(AppRequest::PlaceCall {
            target: target.to_string(),
            video,
            user_to_user: None,
        })?
        .ok_or_else(|| SessionError::UnknownCall(target.to_string()))
    }

    /// Unregister if registered, stop, and join both workers.
    ///
    /// Bounded by the unregister wait plus one worker-join bound per worker.
    pub async fn shutdown(&self) {
        let timing = self.inner.config.timing.clone();
        if self.inner.state.get() == SessionState::Registered {
            self.inner
                .send_registration(&self.inner.config.identity, true);
            if !self
                .inner
                .state
                .wait_until_not(SessionState::Registered, timing.unregister_wait)
                .await
            {
                warn!("Unregister not confirmed within {:?}", timing.unregister_wait);
            }
        }

        self.inner.halt();
        let workers = std::mem::take(&mut *self.workers.lock());
        for (worker, mut handle) in workers {
            match tokio::time::timeout(timing.worker_join, &mut handle).await {
                Ok(_) => debug!("{:?} worker joined", worker),
                Err(_) => {
                    warn!("{:?} worker did not exit in time, aborting", worker);
                    handle.abort();
                }
            }
        }

        let dropped = self.inner.calls.drain();
        if !dropped.is_empty() {
            debug!("Discarding {} calls at shutdown", dropped.len());
        }
        self.inner.transport.close().await;
        info!("Session for {} stopped", self.inner.config.identity);
    }
}

/// Best-effort counterpart of [`SipSession::shutdown`]. A registered
/// session still unregisters: the workers are handed to a background task
/// that waits for the confirmation (bounded by the unregister wait) before
/// stopping them. Without a runtime nothing can be sent.
impl Drop for SipSession {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty()
            && matches!(
                self.inner.state.get(),
                SessionState::Invalid | SessionState::Stopped
            )
        {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.inner.halt();
            for (_, handle) in workers {
                handle.abort();
            }
            return;
        };

        let inner = self.inner.clone();
        let registered = inner.state.get() == SessionState::Registered && !workers.is_empty();
        if registered {
            warn!("Session dropped while registered, unregistering in the background");
            inner.send_registration(&inner.config.identity, true);
        }
        runtime.spawn(async move {
            if registered {
                let wait = inner.config.timing.unregister_wait;
                if !inner.state.wait_until_not(SessionState::Registered, wait).await {
                    warn!("Unregister not confirmed within {:?}", wait);
                }
            }
            inner.halt();
            for (_, handle) in workers {
                handle.abort();
            }
            inner.transport.close().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::infrastructure::protocols::sip::handler::HandlerOutcome;
    use crate::infrastructure::protocols::sip::message::{MessageType, SipMessage};
    use crate::infrastructure::protocols::sip::transport::{Received, TransportError};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Transport that records writes and never receives anything
    pub(crate) struct SilentTransport {
        kind: TransportKind,
        pub sent: Mutex<Vec<(Vec<u8>, Option<SocketAddr>)>>,
        closed: Notify,
    }

    impl SilentTransport {
        pub fn new(kind: TransportKind) -> Self {
            Self {
                kind,
                sent: Mutex::new(Vec::new()),
                closed: Notify::new(),
            }
        }

        pub fn sent_messages(&self) -> Vec<SipMessage> {
            self.sent
                .lock()
                .iter()
                .map(|(data, _)| SipMessage::decode(data).unwrap())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl Transport for SilentTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            "192.168.1.20:40312".parse().ok()
        }

        async fn connect(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn send(
            &self,
            data: &[u8],
            destination: Option<SocketAddr>,
        ) -> std::result::Result<usize, TransportError> {
            self.sent.lock().push((data.to_vec(), destination));
            Ok(data.len())
        }

        async fn recv(
            &self,
            _buf: &mut [u8],
            _timeout: Option<u64>,
        ) -> std::result::Result<Received, TransportError> {
            self.closed.notified().await;
            Err(TransportError::InvalidSocket)
        }

        async fn close(&self) {
            self.closed.notify_waiters();
        }
    }

    pub(crate) struct NoopHandler;

    impl MessageHandler for NoopHandler {
        fn handle(&self, _message: &SipMessage, _ctx: &HandlerContext) -> HandlerOutcome {
            HandlerOutcome::none()
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::new("1007", "pass", "10.12.49.86", 6001)
    }

    #[tokio::test]
    async fn test_request_before_start_is_rejected() {
        let session = SipSession::with_transport(
            config(),
            Arc::new(SilentTransport::new(TransportKind::Tcp)),
            Arc::new(NoopHandler),
            Arc::new(|_event: SessionEvent| {}),
        );
        assert_eq!(session.state(), SessionState::Invalid);
        let err = session
            .request(AppRequest::SendText {
                target: "2001".to_string(),
                body: "hello".to_string(),
            })
            .unwrap_err();
        assert_eq!(err, SessionError::NotRunning);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let transport = Arc::new(SilentTransport::new(TransportKind::Tcp));
        let session = SipSession::with_transport(
            config(),
            transport.clone(),
            Arc::new(NoopHandler),
            Arc::new(|_event: SessionEvent| {}),
        );
        session.start().unwrap();
        assert!(matches!(
            session.start(),
            Err(SessionError::InvalidStateTransition(_))
        ));
        session.shutdown().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_start_connects_and_registers() {
        let transport = Arc::new(SilentTransport::new(TransportKind::Tcp));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<SessionEvent>();
        let session = SipSession::with_transport(
            config(),
            transport.clone(),
            Arc::new(NoopHandler),
            Arc::new(tx),
        );
        session.start().unwrap();

        let mut states = session.subscribe();
        tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == SessionState::Connected),
        )
        .await
        .expect("connected")
        .unwrap();

        // Give the send worker a moment to write the REGISTER
        for _ in 0..50 {
            if !transport.sent.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = transport.sent_messages();
        assert_eq!(sent[0].kind(), MessageType::Register);
        assert!(sent[0].field(&crate::infrastructure::protocols::sip::header::Field::Via)
            .unwrap()
            .contains("192.168.1.20:40312"));

        session.shutdown().await;
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        assert!(seen
            .iter()
            .any(|e| matches!(e, SessionEvent::WorkerExited(Worker::Send))));
        assert!(seen.iter().any(|e| matches!(
            e,
            SessionEvent::StateChanged {
                to: SessionState::Stopped,
                ..
            }
        )));
    }
}
