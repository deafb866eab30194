//! Events crossing the session boundary
//!
//! Inbound: [`SessionEvent`] values handed to an [`EventSink`] from the
//! receive worker. Outbound: [`AppRequest`] values the application submits,
//! translated by the session into protocol messages.

use crate::domain::call::{DisconnectCause, MediaDescriptor};
use crate::domain::session::state::SessionState;
use crate::infrastructure::protocols::sip::message::SipMessage;
use tokio::sync::mpsc;

/// The two long-lived workers of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Worker {
    Receive,
    Send,
}

/// Higher-level outcome delivered to the application
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// The local identity is registered with the gateway
    Registered,
    /// An unregister for `identity` was confirmed
    Unregistered { identity: String },
    /// No traffic within the timeout window; the gateway is assumed to
    /// have dropped us
    ServerUnregistered,
    RegistrationFailed { cause: DisconnectCause },
    IncomingCall {
        call_id: String,
        from: String,
        video: bool,
        user_to_user: Option<String>,
    },
    CallRinging { call_id: String },
    CallConnected {
        call_id: String,
        media: MediaDescriptor,
    },
    /// Media parameters changed mid-call (re-INVITE)
    CallUpdated {
        call_id: String,
        media: MediaDescriptor,
    },
    CallEnded {
        call_id: String,
        cause: DisconnectCause,
    },
    TextMessage {
        from: String,
        content_type: Option<String>,
        body: String,
    },
    /// A decoded message passed through by a custom handler
    Message(Box<SipMessage>),
    WorkerExited(Worker),
}

/// Application-level requests translated into signalling by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppRequest {
    /// Call `target` (a user part or a full URI)
    PlaceCall {
        target: String,
        video: bool,
        user_to_user: Option<String>,
    },
    Answer { call_id: String },
    Reject { call_id: String },
    /// Hang up an established call or cancel one still in setup
    Hangup { call_id: String },
    SendText { target: String, body: String },
    /// Unregister `identity` (the local identity when `None`)
    Unregister { identity: Option<String> },
}

/// Receiver of [`SessionEvent`]s.
///
/// Invoked synchronously from the receive worker, so implementations must
/// not block.
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: SessionEvent);
}

impl<F> EventSink for F
where
    F: Fn(SessionEvent) + Send + Sync,
{
    fn on_event(&self, event: SessionEvent) {
        self(event)
    }
}

impl EventSink for mpsc::UnboundedSender<SessionEvent> {
    fn on_event(&self, event: SessionEvent) {
        // A dropped receiver only means nobody listens anymore
        let _ = self.send(event);
    }
}
