//! Call value objects

use serde::{Deserialize, Serialize};

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// We received the INVITE
    Incoming,
    /// We sent the INVITE
    Outgoing,
}

/// Where a call is in its signalling lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallPhase {
    /// INVITE sent or received, no final response yet
    Setup,
    /// Provisional response seen, remote party alerted
    Alerting,
    /// 2xx exchanged, media negotiated
    Established,
    /// BYE or CANCEL sent, waiting for the answer
    Terminating,
}

impl CallPhase {
    pub fn is_setup(&self) -> bool {
        matches!(self, CallPhase::Setup | CallPhase::Alerting)
    }
}

/// Why a call or registration went away, as reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectCause {
    /// Normal clearing (BYE)
    Normal,
    Busy,
    NotFound,
    /// Remote party temporarily unavailable or not answering
    Unavailable,
    /// Declined or forbidden
    Rejected,
    Canceled,
    AuthenticationFailed,
    ServiceUnavailable,
    Timeout,
    /// The signalling connection dropped
    TransportLost,
    /// Any other final failure status
    Other(u16),
}

impl DisconnectCause {
    /// Map a final SIP status code to a cause
    pub fn from_status(code: u16) -> Self {
        match code {
            200..=299 => DisconnectCause::Normal,
            401 | 407 => DisconnectCause::AuthenticationFailed,
            403 | 603 => DisconnectCause::Rejected,
            404 | 604 => DisconnectCause::NotFound,
            408 => DisconnectCause::Timeout,
            480 => DisconnectCause::Unavailable,
            486 | 600 => DisconnectCause::Busy,
            487 => DisconnectCause::Canceled,
            503 => DisconnectCause::ServiceUnavailable,
            other => DisconnectCause::Other(other),
        }
    }
}

/// Media transport parameters negotiated for one side of a call.
/// Video fields stay empty for audio-only calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// Connection address (`c=` line)
    pub address: Option<String>,
    pub audio_port: Option<u16>,
    /// SDES inline key for the audio stream
    pub audio_key: Option<String>,
    pub video_port: Option<u16>,
    pub video_key: Option<String>,
}

impl MediaDescriptor {
    pub fn has_video(&self) -> bool {
        self.video_port.map(|p| p != 0).unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.audio_port.is_none() && self.video_port.is_none()
    }
}
