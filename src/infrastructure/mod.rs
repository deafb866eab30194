//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - The SIP client stack (message model, transports, session workers)
//! - TLS client configuration

pub mod protocols;
pub mod tls;
