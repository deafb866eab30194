//! Call entities

use super::value_object::{CallDirection, CallPhase, MediaDescriptor};
use std::time::Instant;

/// Book-keeping for one call in progress.
///
/// Created when a call is placed or an INVITE arrives, updated as responses
/// and re-INVITEs come in, dropped when the call terminates.
#[derive(Debug, Clone)]
pub struct CallData {
    /// Network call id (Call-ID header)
    pub call_id: String,
    /// Our tag on From (outgoing) or To (incoming)
    pub local_tag: String,
    /// Remote correlation id (the peer's tag), known after the first response
    pub remote_tag: Option<String>,
    pub direction: CallDirection,
    pub phase: CallPhase,
    pub canceled: bool,
    /// Remote party identity (user part)
    pub remote_party: String,
    /// Request target used for the INVITE
    pub target_uri: String,
    /// Remote Contact, used as target for in-dialog requests
    pub remote_contact: Option<String>,
    /// Sequence id of the last outbound INVITE (or the inbound one we answer)
    pub setup_seq: u32,
    /// Cached header values used to correlate follow-up messages
    pub via: String,
    pub from: String,
    pub to: String,
    /// Our SDP offer or answer
    pub local_sdp: Option<String>,
    pub local_media: MediaDescriptor,
    pub remote_media: MediaDescriptor,
    pub video: bool,
    /// Last authorization value attached to the INVITE
    pub authorization: Option<String>,
    pub auth_attempts: u32,
    pub user_to_user: Option<String>,
    pub created_at: Instant,
}

impl CallData {
    pub fn outgoing(call_id: String, local_tag: String, remote_party: String, target_uri: String) -> Self {
        Self::new(call_id, local_tag, CallDirection::Outgoing, remote_party, target_uri)
    }

    pub fn incoming(call_id: String, local_tag: String, remote_party: String, target_uri: String) -> Self {
        Self::new(call_id, local_tag, CallDirection::Incoming, remote_party, target_uri)
    }

    fn new(
        call_id: String,
        local_tag: String,
        direction: CallDirection,
        remote_party: String,
        target_uri: String,
    ) -> Self {
        Self {
            call_id,
            local_tag,
            remote_tag: None,
            direction,
            phase: CallPhase::Setup,
            canceled: false,
            remote_party,
            target_uri,
            remote_contact: None,
            setup_seq: 0,
            via: String::new(),
            from: String::new(),
            to: String::new(),
            local_sdp: None,
            local_media: MediaDescriptor::default(),
            remote_media: MediaDescriptor::default(),
            video: false,
            authorization: None,
            auth_attempts: 0,
            user_to_user: None,
            created_at: Instant::now(),
        }
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == CallDirection::Incoming
    }

    pub fn in_setup(&self) -> bool {
        self.phase.is_setup()
    }

    /// Target for in-dialog requests: remote Contact if known, else the original target
    pub fn dialog_target(&self) -> &str {
        self.remote_contact.as_deref().unwrap_or(&self.target_uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_outgoing_call() {
        let call = CallData::outgoing(
            "abc@10.0.0.1".to_string(),
            "tag1".to_string(),
            "2001".to_string(),
            "sip:2001@10.12.49.86".to_string(),
        );
        assert!(!call.is_incoming());
        assert!(call.in_setup());
        assert!(!call.canceled);
        assert_eq!(call.dialog_target(), "sip:2001@10.12.49.86");
    }

    #[test]
    fn test_dialog_target_prefers_contact() {
        let mut call = CallData::incoming(
            "abc".to_string(),
            "tag".to_string(),
            "2001".to_string(),
            "sip:1007@gw".to_string(),
        );
        call.remote_contact = Some("sip:2001@10.0.0.9:5060".to_string());
        assert!(call.is_incoming());
        assert_eq!(call.dialog_target(), "sip:2001@10.0.0.9:5060");
    }
}
