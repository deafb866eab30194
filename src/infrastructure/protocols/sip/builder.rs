//! SIP message builder utilities
//!
//! Requests are built from the local [`Endpoint`]; responses mirror the
//! correlation fields of the request they answer.

use super::header::{self, Field};
use super::message::{default_reason, MessageType, SipMessage};
use crate::config::{SessionConfig, TransportKind};
use crate::domain::call::CallData;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// RFC 3261 magic cookie for branch ids
pub const BRANCH_PREFIX: &str = "z9hG4bK";
pub const MAX_FORWARDS: &str = "70";
pub const ALLOWED_METHODS: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, NOTIFY, MESSAGE, INFO, UPDATE";

/// Fresh Via branch
pub fn new_branch() -> String {
    let value: u64 = rand::thread_rng().gen();
    format!("{}{:016x}", BRANCH_PREFIX, value)
}

/// Fresh From/To tag
pub fn new_tag() -> String {
    let value: u32 = rand::thread_rng().gen();
    format!("{:08x}", value)
}

/// Fresh Call-ID scoped to `host`
pub fn new_call_id(host: &str) -> String {
    format!("{}@{}", Uuid::new_v4().simple(), host)
}

/// CSeq numbers shared by every request the session originates
#[derive(Debug)]
pub struct Sequence(AtomicU32);

impl Sequence {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Next sequence id; never 0
    pub fn next(&self) -> u32 {
        loop {
            let seq = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

/// Local identity and addressing used in every outbound request
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub identity: String,
    pub display_name: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    pub transport: TransportKind,
    /// Local socket address; unspecified until the transport is open
    pub local: Option<SocketAddr>,
    pub user_agent: String,
}

impl Endpoint {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            display_name: config.display_name.clone(),
            server_host: config.server_host.clone(),
            server_port: config.server_port,
            transport: config.transport,
            local: None,
            user_agent: config.user_agent.clone(),
        }
    }

    pub fn scheme(&self) -> &'static str {
        self.transport.scheme()
    }

    /// `sip:<host>:<port>` of the gateway
    pub fn server_uri(&self) -> String {
        format!("{}:{}:{}", self.scheme(), self.server_host, self.server_port)
    }

    /// Address of record for `identity` at the gateway
    pub fn aor_of(&self, identity: &str) -> String {
        format!("{}:{}@{}", self.scheme(), identity, self.server_host)
    }

    pub fn aor(&self) -> String {
        self.aor_of(&self.identity)
    }

    /// Request target for `target`: a full URI is kept, a bare identity is
    /// qualified with the gateway host
    pub fn uri_for(&self, target: &str) -> String {
        let target = target.trim();
        if target.starts_with("sip:") || target.starts_with("sips:") {
            target.to_string()
        } else if target.contains('@') {
            format!("{}:{}", self.scheme(), target)
        } else {
            self.aor_of(target)
        }
    }

    // Unknown until the transport is open; the gateway corrects it from
    // received/rport
    fn local_authority(&self) -> String {
        match self.local {
            Some(addr) => addr.to_string(),
            None => "0.0.0.0".to_string(),
        }
    }

    pub fn via(&self, branch: &str) -> String {
        header::with_rport(&format!(
            "SIP/2.0/{} {};branch={}",
            self.transport.as_str(),
            self.local_authority(),
            branch
        ))
    }

    pub fn contact(&self) -> String {
        let transport = match self.transport {
            TransportKind::Udp => "",
            TransportKind::Tcp => ";transport=tcp",
            TransportKind::Tls => ";transport=tls",
        };
        format!(
            "<{}:{}@{}{}>",
            self.scheme(),
            self.identity,
            self.local_authority(),
            transport
        )
    }

    /// Name-addr for `identity`, with our display name when it is us
    pub fn name_addr(&self, identity: &str) -> String {
        let uri = self.aor_of(identity);
        match &self.display_name {
            Some(name) if identity == self.identity => format!("\"{}\" <{}>", name, uri),
            _ => format!("<{}>", uri),
        }
    }
}

/// Step-by-step request construction
pub struct RequestBuilder {
    msg: SipMessage,
}

impl RequestBuilder {
    pub fn new(kind: MessageType, target: impl Into<String>, seq: u32) -> Self {
        let mut msg = SipMessage::request(kind, target);
        msg.set_cseq(seq, kind);
        msg.set_field(Field::MaxForwards, MAX_FORWARDS);
        Self { msg }
    }

    pub fn field(mut self, field: Field, value: impl Into<String>) -> Self {
        self.msg.set_field(field, value);
        self
    }

    pub fn optional_field(self, field: Field, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.field(field, value),
            None => self,
        }
    }

    pub fn body(mut self, content_type: &str, body: impl Into<bytes::Bytes>) -> Self {
        self.msg.set_field(Field::ContentType, content_type);
        self.msg.set_body(body);
        self
    }

    pub fn build(self) -> SipMessage {
        self.msg
    }
}

/// REGISTER for `identity`; `expires` of 0 unregisters
pub fn register(endpoint: &Endpoint, identity: &str, seq: u32, call_id: &str, tag: &str, expires: u32) -> SipMessage {
    let aor = endpoint.name_addr(identity);
    let target = format!("{}:{}", endpoint.scheme(), endpoint.server_host);
    let contact = if expires == 0 && identity != endpoint.identity {
        "*".to_string()
    } else {
        endpoint.contact()
    };
    RequestBuilder::new(MessageType::Register, target, seq)
        .field(Field::Via, endpoint.via(&new_branch()))
        .field(Field::From, format!("{};tag={}", aor, tag))
        .field(Field::To, aor)
        .field(Field::CallId, call_id)
        .field(Field::Contact, contact)
        .field(Field::Expires, expires.to_string())
        .field(Field::Allow, ALLOWED_METHODS)
        .field(Field::UserAgent, endpoint.user_agent.clone())
        .build()
}

/// Initial INVITE for an outgoing call. Fills in the cached dialog fields.
pub fn invite(endpoint: &Endpoint, call: &mut CallData, seq: u32) -> SipMessage {
    call.setup_seq = seq;
    call.via = endpoint.via(&new_branch());
    call.from = format!("{};tag={}", endpoint.name_addr(&endpoint.identity), call.local_tag);
    call.to = format!("<{}>", call.target_uri);

    let mut builder = RequestBuilder::new(MessageType::Invite, call.target_uri.clone(), seq)
        .field(Field::Via, call.via.clone())
        .field(Field::From, call.from.clone())
        .field(Field::To, call.to.clone())
        .field(Field::CallId, call.call_id.clone())
        .field(Field::Contact, endpoint.contact())
        .field(Field::Allow, ALLOWED_METHODS)
        .field(Field::UserAgent, endpoint.user_agent.clone())
        .optional_field(Field::UserToUser, call.user_to_user.clone());
    if let Some(sdp) = &call.local_sdp {
        builder = builder.body("application/sdp", sdp.clone().into_bytes());
    }
    builder.build()
}

/// ACK for a final INVITE response. A 2xx ACK is its own transaction with
/// a new branch; a non-2xx ACK reuses the INVITE's Via.
pub fn ack(endpoint: &Endpoint, call: &CallData, response: &SipMessage) -> SipMessage {
    let success = response.status().map(|c| (200..300).contains(&c)).unwrap_or(false);
    let (target, via) = if success {
        (call.dialog_target().to_string(), endpoint.via(&new_branch()))
    } else {
        (call.target_uri.clone(), call.via.clone())
    };
    let to = response.field(&Field::To).unwrap_or(&call.to).to_string();
    RequestBuilder::new(MessageType::Ack, target, call.setup_seq)
        .field(Field::Via, via)
        .field(Field::From, call.from.clone())
        .field(Field::To, to)
        .field(Field::CallId, call.call_id.clone())
        .build()
}

/// CANCEL for an outgoing INVITE still in setup
pub fn cancel(call: &CallData) -> SipMessage {
    RequestBuilder::new(MessageType::Cancel, call.target_uri.clone(), call.setup_seq)
        .field(Field::Via, call.via.clone())
        .field(Field::From, call.from.clone())
        .field(Field::To, call.to.clone())
        .field(Field::CallId, call.call_id.clone())
        .build()
}

/// Request within an established dialog (BYE, re-INVITE, INFO, ...)
pub fn in_dialog(endpoint: &Endpoint, kind: MessageType, call: &CallData, seq: u32) -> SipMessage {
    let (from, to) = dialog_parties(call);
    RequestBuilder::new(kind, call.dialog_target().to_string(), seq)
        .field(Field::Via, endpoint.via(&new_branch()))
        .field(Field::From, from)
        .field(Field::To, to)
        .field(Field::CallId, call.call_id.clone())
        .field(Field::UserAgent, endpoint.user_agent.clone())
        .build()
}

/// (From, To) as seen from our side of the dialog
pub fn dialog_parties(call: &CallData) -> (String, String) {
    let with_tag = |value: &str, tag: Option<&str>| match (header::tag(value), tag) {
        (None, Some(tag)) => format!("{};tag={}", value, tag),
        _ => value.to_string(),
    };
    if call.is_incoming() {
        (
            with_tag(&call.to, Some(&call.local_tag)),
            call.from.clone(),
        )
    } else {
        (
            call.from.clone(),
            with_tag(&call.to, call.remote_tag.as_deref()),
        )
    }
}

/// Out-of-dialog MESSAGE carrying text
pub fn text_message(endpoint: &Endpoint, target: &str, seq: u32, body: &str) -> SipMessage {
    let target = endpoint.uri_for(target);
    RequestBuilder::new(MessageType::Message, target.clone(), seq)
        .field(Field::Via, endpoint.via(&new_branch()))
        .field(
            Field::From,
            format!("{};tag={}", endpoint.name_addr(&endpoint.identity), new_tag()),
        )
        .field(Field::To, format!("<{}>", target))
        .field(Field::CallId, new_call_id(&endpoint.server_host))
        .field(Field::UserAgent, endpoint.user_agent.clone())
        .body("text/plain;charset=UTF-8", body.as_bytes().to_vec())
        .build()
}

/// Build a simple response to `request`, mirroring its correlation fields
pub struct ResponseBuilder {
    code: u16,
    reason: Option<String>,
    to_tag: Option<String>,
    fields: Vec<(Field, String)>,
    body: Option<(String, Vec<u8>)>,
}

impl ResponseBuilder {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            reason: None,
            to_tag: None,
            fields: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200)
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Tag added to To when the request carried none
    pub fn to_tag(mut self, tag: impl Into<String>) -> Self {
        self.to_tag = Some(tag.into());
        self
    }

    pub fn field(mut self, field: Field, value: impl Into<String>) -> Self {
        self.fields.push((field, value.into()));
        self
    }

    pub fn body(mut self, content_type: &str, body: Vec<u8>) -> Self {
        self.body = Some((content_type.to_string(), body));
        self
    }

    pub fn build_for_request(self, request: &SipMessage) -> SipMessage {
        let reason = self
            .reason
            .unwrap_or_else(|| default_reason(self.code).to_string());
        let mut response = SipMessage::response(self.code, reason);

        for field in [Field::Via, Field::From, Field::CallId, Field::CSeq] {
            if let Some(value) = request.field(&field) {
                response.set_field(field, value);
            }
        }
        if let Some(to) = request.field(&Field::To) {
            let to = match (&self.to_tag, header::tag(to)) {
                (Some(tag), None) => format!("{};tag={}", to, tag),
                _ => to.to_string(),
            };
            response.set_field(Field::To, to);
        }

        for (field, value) in self.fields {
            response.set_field(field, value);
        }
        if let Some((content_type, body)) = self.body {
            response.set_field(Field::ContentType, content_type);
            response.set_body(body);
        }
        response
    }
}

/// Response with the default reason phrase and no extra fields
pub fn response_to(request: &SipMessage, code: u16) -> SipMessage {
    ResponseBuilder::new(code).build_for_request(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> Endpoint {
        let mut config = SessionConfig::new("1007", "pass", "10.12.49.86", 6001);
        config.display_name = Some("Dispatcher".to_string());
        let mut endpoint = Endpoint::from_config(&config);
        endpoint.local = Some("192.168.1.20:40312".parse().unwrap());
        endpoint
    }

    #[test]
    fn test_register_request() {
        let ep = endpoint();
        let msg = register(&ep, "1007", 1, "cid@10.12.49.86", "t1", 3600);
        assert_eq!(msg.kind(), MessageType::Register);
        assert_eq!(msg.seq(), Some(1));
        assert_eq!(msg.target(), Some("sip:10.12.49.86"));
        assert_eq!(msg.number(&Field::Expires), Some(3600));
        assert_eq!(header::user(msg.field(&Field::To).unwrap()), Some("1007"));
        assert_eq!(header::tag(msg.field(&Field::From).unwrap()), Some("t1"));
        assert_eq!(
            msg.field(&Field::Contact),
            Some("<sip:1007@192.168.1.20:40312;transport=tcp>")
        );
        let via = msg.field(&Field::Via).unwrap();
        assert!(via.starts_with("SIP/2.0/TCP 192.168.1.20:40312;branch=z9hG4bK"));
        assert!(via.ends_with(";rport"));
    }

    #[test]
    fn test_unregister_other_identity_uses_wildcard() {
        let ep = endpoint();
        let msg = register(&ep, "2001", 9, "cid", "t", 0);
        assert_eq!(msg.field(&Field::Contact), Some("*"));
        assert_eq!(msg.number(&Field::Expires), Some(0));
        assert_eq!(header::user(msg.field(&Field::To).unwrap()), Some("2001"));
    }

    #[test]
    fn test_uri_for() {
        let ep = endpoint();
        assert_eq!(ep.uri_for("2001"), "sip:2001@10.12.49.86");
        assert_eq!(ep.uri_for("2001@gw"), "sip:2001@gw");
        assert_eq!(ep.uri_for("sip:2001@gw:5070"), "sip:2001@gw:5070");
    }

    #[test]
    fn test_response_mirrors_correlation_fields() {
        let mut request = SipMessage::request(MessageType::Options, "sip:1007@192.168.1.20");
        request.set_cseq(17, MessageType::Options);
        request.set_field(Field::Via, "SIP/2.0/TCP 10.12.49.86:6001;branch=z9hG4bKabc");
        request.set_field(Field::From, "<sip:gw@10.12.49.86>;tag=gw1");
        request.set_field(Field::To, "<sip:1007@10.12.49.86>");
        request.set_field(Field::CallId, "ping-1");
        request.set_field(Field::Subject, "not mirrored");

        let response = ResponseBuilder::ok().to_tag("me").build_for_request(&request);
        assert_eq!(response.status(), Some(200));
        assert_eq!(response.reason(), Some("OK"));
        assert_eq!(response.seq(), Some(17));
        assert_eq!(response.kind(), MessageType::Options);
        assert_eq!(response.field(&Field::Via), request.field(&Field::Via));
        assert_eq!(response.field(&Field::CallId), Some("ping-1"));
        assert_eq!(response.field(&Field::To), Some("<sip:1007@10.12.49.86>;tag=me"));
        assert!(!response.has_field(&Field::Subject));

        let busy = response_to(&request, 486);
        assert_eq!(busy.reason(), Some("Busy Here"));
    }

    #[test]
    fn test_invite_and_dialog_requests() {
        let ep = endpoint();
        let mut call = CallData::outgoing(
            new_call_id("10.12.49.86"),
            new_tag(),
            "2001".to_string(),
            ep.uri_for("2001"),
        );
        call.local_sdp = Some("v=0\r\n".to_string());
        call.user_to_user = Some("04a1".to_string());

        let invite = invite(&ep, &mut call, 5);
        assert_eq!(call.setup_seq, 5);
        assert_eq!(invite.field(&Field::UserToUser), Some("04a1"));
        assert_eq!(invite.field(&Field::ContentType), Some("application/sdp"));
        assert_eq!(invite.body(), b"v=0\r\n");

        call.remote_tag = Some("far".to_string());
        call.remote_contact = Some("sip:2001@10.0.0.9".to_string());
        let bye = in_dialog(&ep, MessageType::Bye, &call, 6);
        assert_eq!(bye.target(), Some("sip:2001@10.0.0.9"));
        assert_eq!(header::tag(bye.field(&Field::To).unwrap()), Some("far"));
        assert_eq!(bye.field(&Field::From), Some(call.from.as_str()));

        let cancel = cancel(&call);
        assert_eq!(cancel.seq(), Some(5));
        assert_eq!(cancel.kind(), MessageType::Cancel);
        assert_eq!(cancel.field(&Field::Via), Some(call.via.as_str()));
    }

    #[test]
    fn test_incoming_dialog_parties_swap() {
        let mut call = CallData::incoming(
            "cid".to_string(),
            "mine".to_string(),
            "2001".to_string(),
            "sip:1007@gw".to_string(),
        );
        call.from = "<sip:2001@gw>;tag=theirs".to_string();
        call.to = "<sip:1007@gw>".to_string();
        let (from, to) = dialog_parties(&call);
        assert_eq!(from, "<sip:1007@gw>;tag=mine");
        assert_eq!(to, "<sip:2001@gw>;tag=theirs");
    }

    #[test]
    fn test_sequence_skips_zero() {
        let seq = Sequence(AtomicU32::new(u32::MAX - 1));
        assert_eq!(seq.next(), u32::MAX);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    #[test]
    fn test_branch_and_tag_shapes() {
        assert!(new_branch().starts_with(BRANCH_PREFIX));
        assert_ne!(new_branch(), new_branch());
        assert_eq!(new_tag().len(), 8);
        assert!(new_call_id("gw").ends_with("@gw"));
    }
}
