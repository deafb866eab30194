//! Call context - per-call signalling state

pub mod entity;
pub mod repository;
pub mod value_object;

pub use entity::CallData;
pub use repository::CallTable;
pub use value_object::{CallDirection, CallPhase, DisconnectCause, MediaDescriptor};
