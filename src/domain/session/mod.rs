//! Session context - registration state, outstanding register attempts,
//! and the events exchanged with the application

pub mod event;
pub mod registration;
pub mod state;

pub use event::{AppRequest, EventSink, SessionEvent, Worker};
pub use registration::{RegistrationAttempt, RegistrationTable};
pub use state::{SessionState, StateCell};
