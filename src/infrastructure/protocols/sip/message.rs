//! Signalling message model and its text encoding
//!
//! ```text
//! <start-line>CRLF
//! <Field-Name>: <value>CRLF
//! ...
//! CRLF
//! [<body bytes>]
//! ```

use super::header::Field;
use bytes::{BufMut, Bytes, BytesMut};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

pub const SIP_VERSION: &str = "SIP/2.0";
pub const EOL: &[u8] = b"\r\n";
/// Ends the header block
pub const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Empty message")]
    Empty,

    #[error("Header block is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed start line: {0}")]
    StartLine(String),

    #[error("Invalid status code: {0}")]
    StatusCode(String),

    #[error("Invalid Content-Length: {0}")]
    ContentLength(String),

    #[error("Header block exceeds {0} bytes")]
    Oversized(usize),
}

/// Message type, inferred from the method named in CSeq
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Register,
    Invite,
    Ack,
    Bye,
    Cancel,
    /// OPTIONS, used by gateways as a ping
    Options,
    Notify,
    /// NOTIFY carrying `Event: keep-alive`
    KeepAlive,
    Message,
    Info,
    Update,
    Prack,
    Subscribe,
    Refer,
    Unknown,
}

static METHOD_BY_NAME: Lazy<HashMap<&'static str, MessageType>> = Lazy::new(|| {
    [
        MessageType::Register,
        MessageType::Invite,
        MessageType::Ack,
        MessageType::Bye,
        MessageType::Cancel,
        MessageType::Options,
        MessageType::Notify,
        MessageType::Message,
        MessageType::Info,
        MessageType::Update,
        MessageType::Prack,
        MessageType::Subscribe,
        MessageType::Refer,
    ]
    .into_iter()
    .map(|t| (t.method_name(), t))
    .collect()
});

impl MessageType {
    /// Method token used on the wire
    pub fn method_name(&self) -> &'static str {
        match self {
            MessageType::Register => "REGISTER",
            MessageType::Invite => "INVITE",
            MessageType::Ack => "ACK",
            MessageType::Bye => "BYE",
            MessageType::Cancel => "CANCEL",
            MessageType::Options => "OPTIONS",
            MessageType::Notify | MessageType::KeepAlive => "NOTIFY",
            MessageType::Message => "MESSAGE",
            MessageType::Info => "INFO",
            MessageType::Update => "UPDATE",
            MessageType::Prack => "PRACK",
            MessageType::Subscribe => "SUBSCRIBE",
            MessageType::Refer => "REFER",
            MessageType::Unknown => "",
        }
    }

    pub fn from_method(name: &str) -> MessageType {
        METHOD_BY_NAME
            .get(name.trim().to_ascii_uppercase().as_str())
            .copied()
            .unwrap_or(MessageType::Unknown)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::KeepAlive => f.write_str("NOTIFY(keep-alive)"),
            MessageType::Unknown => f.write_str("UNKNOWN"),
            other => f.write_str(other.method_name()),
        }
    }
}

/// Request line or status line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, target: String },
    Response { code: u16, reason: String },
}

impl StartLine {
    fn parse(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim();
        if line.starts_with("SIP/") {
            let mut parts = line.splitn(3, ' ');
            let _version = parts.next();
            let code = parts
                .next()
                .ok_or_else(|| DecodeError::StartLine(line.to_string()))?;
            let code = code
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|c| (100..700).contains(c))
                .ok_or_else(|| DecodeError::StatusCode(code.to_string()))?;
            let reason = parts.next().unwrap_or("").trim().to_string();
            return Ok(StartLine::Response { code, reason });
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [method, target, version] if version.starts_with("SIP/") => Ok(StartLine::Request {
                method: method.to_string(),
                target: target.to_string(),
            }),
            _ => Err(DecodeError::StartLine(line.to_string())),
        }
    }
}

impl fmt::Display for StartLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartLine::Request { method, target } => write!(f, "{} {} {}", method, target, SIP_VERSION),
            StartLine::Response { code, reason } => write!(f, "{} {} {}", SIP_VERSION, code, reason),
        }
    }
}

/// Structured sub-fields of an authentication header (`realm`, `nonce`, ...)
pub type SubFields = HashMap<String, String>;

/// A signalling message
#[derive(Debug, Clone, PartialEq)]
pub struct SipMessage {
    kind: MessageType,
    seq: Option<u32>,
    start: StartLine,
    fields: HashMap<Field, String>,
    sub_fields: HashMap<Field, SubFields>,
    body: Bytes,
}

impl SipMessage {
    fn with_start(start: StartLine) -> Self {
        let mut msg = Self {
            kind: MessageType::Unknown,
            seq: None,
            start,
            fields: HashMap::new(),
            sub_fields: HashMap::new(),
            body: Bytes::new(),
        };
        msg.fields.insert(Field::ContentLength, "0".to_string());
        msg
    }

    /// New request of type `kind` addressed to `target`
    pub fn request(kind: MessageType, target: impl Into<String>) -> Self {
        let mut msg = Self::with_start(StartLine::Request {
            method: kind.method_name().to_string(),
            target: target.into(),
        });
        msg.kind = kind;
        msg
    }

    /// New response; the type follows once CSeq is set
    pub fn response(code: u16, reason: impl Into<String>) -> Self {
        Self::with_start(StartLine::Response {
            code,
            reason: reason.into(),
        })
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// Sequence id from CSeq
    pub fn seq(&self) -> Option<u32> {
        self.seq
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start, StartLine::Response { .. })
    }

    /// Response code; `None` for requests
    pub fn status(&self) -> Option<u16> {
        match self.start {
            StartLine::Response { code, .. } => Some(code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.start {
            StartLine::Response { reason, .. } => Some(reason),
            StartLine::Request { .. } => None,
        }
    }

    /// Request target; `None` for responses
    pub fn target(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Response { .. } => None,
        }
    }

    /// Method token of the start line (requests only)
    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn start(&self) -> &StartLine {
        &self.start
    }

    pub fn start_line(&self) -> String {
        self.start.to_string()
    }

    pub fn field(&self, field: &Field) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&str> {
        self.field(&Field::from_name(name))
    }

    /// Numeric value of a field; `None` when absent or not numeric
    pub fn number(&self, field: &Field) -> Option<u32> {
        self.field(field)?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }

    pub fn has_field(&self, field: &Field) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> &HashMap<Field, String> {
        &self.fields
    }

    pub fn set_field(&mut self, field: Field, value: impl Into<String>) {
        let derive = matches!(field, Field::CSeq | Field::Event) || field.carries_auth();
        self.fields.insert(field, value.into());
        if derive {
            self.derive();
        }
    }

    pub fn remove_field(&mut self, field: &Field) -> Option<String> {
        let removed = self.fields.remove(field);
        if removed.is_some() {
            self.derive();
        }
        removed
    }

    /// Write CSeq as `<seq> <METHOD>`
    pub fn set_cseq(&mut self, seq: u32, kind: MessageType) {
        self.set_field(Field::CSeq, format!("{} {}", seq, kind.method_name()));
    }

    pub fn sub_fields(&self, field: &Field) -> Option<&SubFields> {
        self.sub_fields.get(field)
    }

    pub fn sub_field(&self, field: &Field, name: &str) -> Option<&str> {
        self.sub_fields
            .get(field)?
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Attach authentication sub-fields, rendering the header value from them.
    pub fn set_sub_fields(&mut self, field: Field, scheme: &str, pairs: &[(&str, String)]) {
        let value = render_sub_fields(&field, scheme, pairs);
        self.set_field(field, value);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Replace the body and keep Content-Length in step
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
        self.fields
            .insert(Field::ContentLength, self.body.len().to_string());
    }

    /// Start line, fields, blank line, raw body
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(512 + self.body.len());
        out.put_slice(self.start_line().as_bytes());
        out.put_slice(EOL);

        let mut fields: Vec<(&Field, &String)> = self
            .fields
            .iter()
            .filter(|(f, _)| **f != Field::ContentLength)
            .collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));

        for (field, value) in fields {
            out.put_slice(field.name().as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(EOL);
        }
        out.put_slice(format!("Content-Length: {}", self.body.len()).as_bytes());
        out.put_slice(EOL);
        out.put_slice(EOL);
        out.put_slice(&self.body);
        out.freeze()
    }

    /// Decode one complete message (a datagram, or a fully re-assembled
    /// stream message). The body is everything after the header block,
    /// cut to Content-Length when one is declared.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let data = skip_leading_eol(data);
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }

        let (head, rest) = match find(data, HEADER_TERMINATOR) {
            Some(idx) => (&data[..idx], &data[idx + HEADER_TERMINATOR.len()..]),
            None => (data, &data[data.len()..]),
        };

        let (mut msg, declared) = Self::decode_head(head)?;
        let body = match declared {
            Some(len) if len <= rest.len() => &rest[..len],
            Some(len) => {
                warn!(
                    "Body shorter than declared Content-Length ({} < {})",
                    rest.len(),
                    len
                );
                rest
            }
            None => rest,
        };
        msg.body = Bytes::copy_from_slice(body);
        Ok(msg)
    }

    /// Decode a header block (without its terminating blank line).
    ///
    /// Also reports the declared body length so a stream reader knows how
    /// many more bytes belong to this message.
    pub fn decode_head(head: &[u8]) -> Result<(Self, Option<usize>), DecodeError> {
        let text = std::str::from_utf8(head).map_err(|_| DecodeError::InvalidUtf8)?;
        let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));

        let start_line = lines
            .by_ref()
            .find(|l| !l.trim().is_empty())
            .ok_or(DecodeError::Empty)?;
        let mut msg = Self::with_start(StartLine::parse(start_line)?);
        msg.fields.clear();

        let mut last: Option<Field> = None;
        for line in lines {
            if line.is_empty() {
                break;
            }

            if line.starts_with(' ') || line.starts_with('\t') {
                let continuation = line.trim();
                if continuation.is_empty() {
                    continue;
                }
                match last.as_ref().and_then(|f| msg.fields.get_mut(f)) {
                    Some(value) => {
                        if !value.is_empty() {
                            value.push(' ');
                        }
                        value.push_str(continuation);
                    }
                    None => debug!("Dropping continuation without a field: {:?}", line),
                }
                continue;
            }

            match line.split_once(':') {
                Some((name, value)) => {
                    let field = Field::from_name(name);
                    let value = value.trim();
                    match msg.fields.get_mut(&field) {
                        // One challenge per field is enough, later ones
                        // would corrupt the sub-field split
                        Some(_) if field.carries_auth() => {
                            debug!("Ignoring repeated {} field", field);
                        }
                        Some(existing) => {
                            existing.push_str(", ");
                            existing.push_str(value);
                        }
                        None => {
                            msg.fields.insert(field.clone(), value.to_string());
                        }
                    }
                    last = Some(field);
                }
                None => {
                    warn!("Ignoring malformed field line: {:?}", line);
                    last = None;
                }
            }
        }

        msg.derive();

        let declared = match msg.fields.get(&Field::ContentLength) {
            Some(value) => Some(
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| DecodeError::ContentLength(value.clone()))?,
            ),
            None => None,
        };

        Ok((msg, declared))
    }

    /// Recompute type, sequence id and sub-fields from the field map
    fn derive(&mut self) {
        let (seq, cseq_method) = match self.fields.get(&Field::CSeq) {
            Some(value) => parse_cseq(value),
            None => (None, None),
        };
        self.seq = seq;

        let mut kind = match (cseq_method, &self.start) {
            (Some(method), _) => MessageType::from_method(&method),
            (None, StartLine::Request { method, .. }) => MessageType::from_method(method),
            (None, StartLine::Response { .. }) => MessageType::Unknown,
        };
        if kind == MessageType::Notify && self.is_keep_alive_event() {
            kind = MessageType::KeepAlive;
        }
        self.kind = kind;

        self.sub_fields = self
            .fields
            .iter()
            .filter(|(field, _)| field.carries_auth())
            .map(|(field, value)| (field.clone(), parse_sub_fields(value).1))
            .collect();
    }

    fn is_keep_alive_event(&self) -> bool {
        self.fields
            .get(&Field::Event)
            .and_then(|e| e.split(';').next())
            .map(|e| e.trim().eq_ignore_ascii_case("keep-alive"))
            .unwrap_or(false)
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.encode()))
    }
}

/// `<id> <METHOD>` -> (id, method)
fn parse_cseq(value: &str) -> (Option<u32>, Option<String>) {
    let mut parts = value.split_whitespace();
    let seq = parts.next().and_then(|s| s.parse().ok());
    let method = parts.next().map(str::to_string);
    (seq, method)
}

/// Split `Digest realm="x", nonce="y", qop=auth` into its scheme and
/// sub-fields. Commas inside quotes do not split; one layer of surrounding
/// quotes is stripped from each value; names are lower-cased.
pub fn parse_sub_fields(value: &str) -> (String, SubFields) {
    let value = value.trim();
    let (scheme, params) = match value.split_once(char::is_whitespace) {
        Some((first, rest)) if !first.contains('=') => (first.to_string(), rest),
        _ => (String::new(), value),
    };

    let mut fields = SubFields::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut parts = Vec::new();
    for c in params.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_quotes => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        let part = part.trim();
        if let Some((name, val)) = part.split_once('=') {
            let val = val.trim();
            let val = val
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(val);
            fields.insert(name.trim().to_ascii_lowercase(), val.to_string());
        }
    }
    (scheme, fields)
}

/// Render sub-fields back into a header value
fn render_sub_fields(field: &Field, scheme: &str, pairs: &[(&str, String)]) -> String {
    let rendered: Vec<String> = pairs
        .iter()
        .map(|(name, value)| {
            let bare = matches!(*name, "algorithm" | "nc" | "stale")
                || (*name == "qop" && field.is_credentials());
            if bare {
                format!("{}={}", name, value)
            } else {
                format!("{}=\"{}\"", name, value)
            }
        })
        .collect();
    if scheme.is_empty() {
        rendered.join(", ")
    } else {
        format!("{} {}", scheme, rendered.join(", "))
    }
}

fn skip_leading_eol(mut data: &[u8]) -> &[u8] {
    while let Some((first, rest)) = data.split_first() {
        if *first == b'\r' || *first == b'\n' {
            data = rest;
        } else {
            break;
        }
    }
    data
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reason phrase for the status codes this client sends
pub fn default_reason(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        491 => "Request Pending",
        500 => "Server Internal Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        603 => "Decline",
        _ => "",
    }
}
