//! Shared kernel - types used across the session and call contexts

pub mod error;
pub mod result;

pub use error::SessionError;
pub use result::Result;
