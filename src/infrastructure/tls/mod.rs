/// TLS client configuration for the stream transport
pub mod config;

pub use config::TlsClientContext;
