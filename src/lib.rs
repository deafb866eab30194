//! dispatch-sip - SIP client session manager for radio-dispatch terminals
//!
//! Registers a terminal with a telephony gateway over UDP, TCP or TLS,
//! keeps the registration alive, and sets up and tears down calls. The
//! application drives it with [`AppRequest`]s and receives
//! [`SessionEvent`]s through an [`EventSink`].

pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use config::{MediaConfig, SessionConfig, Timing, TlsSettings, TransportKind};
pub use domain::call::{CallData, CallDirection, CallPhase, DisconnectCause, MediaDescriptor};
pub use domain::session::{AppRequest, EventSink, SessionEvent, SessionState, Worker};
pub use domain::shared::error::SessionError;
pub use domain::shared::result::Result;
pub use infrastructure::protocols::sip::{MessageHandler, SipMessage, SipSession, Transport};
