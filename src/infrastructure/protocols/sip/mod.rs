//! SIP client stack
//!
//! Architecture:
//! ```text
//! ┌─────────────────────────┐
//! │   Session               │
//! │  (state, registration,  │
//! │   send/receive workers) │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Call signalling       │
//! │  (pluggable handler)    │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Message model         │
//! │  (encode/decode, auth)  │
//! └───────────┬─────────────┘
//!             │
//! ┌───────────▼─────────────┐
//! │   Transport Layer       │
//! │  (UDP, TCP, TLS)        │
//! └─────────────────────────┘
//! ```

pub mod auth;
pub mod builder;
pub mod calls;
pub mod datagram;
pub mod framing;
pub mod handler;
pub mod header;
pub mod message;
pub mod sdp;
pub mod session;
pub mod stream;
pub mod transport;

pub use auth::{ChallengeStyle, DigestChallenge, DigestClient, DigestCredentials};
pub use builder::{Endpoint, RequestBuilder, ResponseBuilder, Sequence};
pub use calls::{translate, CallSignaling, Translation};
pub use datagram::DatagramTransport;
pub use framing::StreamDecoder;
pub use handler::{HandlerContext, HandlerOutcome, MessageHandler};
pub use header::Field;
pub use message::{DecodeError, MessageType, SipMessage};
pub use sdp::SdpSession;
pub use session::{Outbound, SendQueue, SipSession, TrafficWindow};
pub use stream::StreamTransport;
pub use transport::{ErrorClass, Received, RemoteEndpoint, Transport, TransportError};
