//! Domain layer
//!
//! Plain data owned by a session: its state, the calls in progress, and the
//! events handed to the application.

pub mod call;
pub mod session;
pub mod shared;
