//! Signalling protocol implementations

pub mod sip;
