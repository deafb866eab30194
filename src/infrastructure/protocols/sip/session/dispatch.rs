//! Routing of decoded inbound messages

use super::{Inner, Outbound};
use crate::infrastructure::protocols::sip::builder;
use crate::infrastructure::protocols::sip::header::{self, Field};
use crate::infrastructure::protocols::sip::message::{MessageType, SipMessage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

impl Inner {
    /// Handle one inbound message. `source` is the datagram sender; stream
    /// replies always go back over the connection.
    pub(super) fn dispatch(self: &Arc<Self>, msg: SipMessage, source: Option<SocketAddr>) {
        let destination = if self.transport.kind().is_stream() {
            None
        } else {
            source
        };

        match msg.kind() {
            MessageType::Ack if msg.is_request() => {
                debug!("ACK for {}", msg.field(&Field::CallId).unwrap_or_default());
            }
            MessageType::KeepAlive if msg.is_request() => {
                let timeout = self
                    .traffic
                    .lock()
                    .observe_keep_alive(Instant::now());
                debug!("Keep-alive, traffic timeout now {:?}", timeout);
                self.answer_ping(&msg, destination);
            }
            MessageType::Options | MessageType::Notify if msg.is_request() => {
                self.answer_ping(&msg, destination);
            }
            MessageType::Register if msg.is_response() => self.on_register_response(&msg),
            _ => self.delegate(msg, destination),
        }
    }

    /// 200 OK to a ping. A ping addressed to someone else means the gateway
    /// still holds a stale binding for that identity, so drop it.
    fn answer_ping(&self, msg: &SipMessage, destination: Option<SocketAddr>) {
        self.enqueue(Outbound::to(builder::response_to(msg, 200), destination));

        let addressed = msg.field(&Field::To).and_then(header::user);
        if let Some(identity) = addressed {
            if identity != self.config.identity {
                info!("Ping for stale identity {}, unregistering it", identity);
                self.send_registration(identity, true);
            }
        }
    }

    fn delegate(&self, msg: SipMessage, destination: Option<SocketAddr>) {
        if self.is_standby() {
            debug!("Standby, ignoring {}", msg.kind());
            return;
        }
        let outcome = self.handler.handle(&msg, &self.handler_context());
        for reply in outcome.replies {
            self.enqueue(Outbound::to(reply, destination));
        }
        if let Some(event) = outcome.event {
            self.emit(event);
        }
    }
}
