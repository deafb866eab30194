//! Pluggable handling of inbound messages
//!
//! The session answers housekeeping traffic itself (ACK, pings, keep-alives,
//! REGISTER responses) and hands everything else to a [`MessageHandler`].

use super::auth::DigestClient;
use super::builder::{Endpoint, Sequence};
use super::message::SipMessage;
use crate::config::MediaConfig;
use crate::domain::call::CallTable;
use crate::domain::session::SessionEvent;
use std::sync::Arc;

/// What a handler produced for one inbound message
#[derive(Debug, Default)]
pub struct HandlerOutcome {
    /// Messages to enqueue, in order
    pub replies: Vec<SipMessage>,
    /// Event for the application
    pub event: Option<SessionEvent>,
}

impl HandlerOutcome {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn reply(message: SipMessage) -> Self {
        Self {
            replies: vec![message],
            event: None,
        }
    }

    pub fn with_reply(mut self, message: SipMessage) -> Self {
        self.replies.push(message);
        self
    }

    pub fn with_event(mut self, event: SessionEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty() && self.event.is_none()
    }
}

/// Session resources a handler may use
#[derive(Clone)]
pub struct HandlerContext {
    pub endpoint: Endpoint,
    pub media: MediaConfig,
    pub calls: Arc<CallTable>,
    pub digest: Arc<DigestClient>,
    pub sequence: Arc<Sequence>,
}

impl HandlerContext {
    pub fn new(
        endpoint: Endpoint,
        media: MediaConfig,
        calls: Arc<CallTable>,
        digest: Arc<DigestClient>,
        sequence: Arc<Sequence>,
    ) -> Self {
        Self {
            endpoint,
            media,
            calls,
            digest,
            sequence,
        }
    }

    /// Address advertised in SDP bodies
    pub fn media_address(&self) -> String {
        self.endpoint
            .local
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string())
    }
}

/// Trait for handling inbound messages the session does not answer itself.
///
/// Called on the receive worker; implementations must not block.
#[cfg_attr(test, mockall::automock)]
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &SipMessage, ctx: &HandlerContext) -> HandlerOutcome;
}
