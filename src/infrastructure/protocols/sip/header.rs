//! Header field identifiers and header-value helpers
//!
//! Field names are resolved through an immutable table built on first use.
//! Compact forms (`i`, `f`, `t`, ...) resolve to the same identifiers.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;

/// Known header fields. Anything else is kept verbatim in [`Field::Other`].
///
/// The declaration order is the order fields are written on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Field {
    Via,
    MaxForwards,
    Route,
    RecordRoute,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    Expires,
    Authorization,
    ProxyAuthorization,
    WwwAuthenticate,
    ProxyAuthenticate,
    Allow,
    Supported,
    Event,
    SubscriptionState,
    RetryAfter,
    Subject,
    UserAgent,
    Server,
    Date,
    UserToUser,
    ContentType,
    ContentLength,
    Other(String),
}

/// (canonical name, compact form)
const KNOWN_FIELDS: &[(Field, &str, Option<&str>)] = &[
    (Field::Via, "Via", Some("v")),
    (Field::MaxForwards, "Max-Forwards", None),
    (Field::Route, "Route", None),
    (Field::RecordRoute, "Record-Route", None),
    (Field::From, "From", Some("f")),
    (Field::To, "To", Some("t")),
    (Field::CallId, "Call-ID", Some("i")),
    (Field::CSeq, "CSeq", None),
    (Field::Contact, "Contact", Some("m")),
    (Field::Expires, "Expires", None),
    (Field::Authorization, "Authorization", None),
    (Field::ProxyAuthorization, "Proxy-Authorization", None),
    (Field::WwwAuthenticate, "WWW-Authenticate", None),
    (Field::ProxyAuthenticate, "Proxy-Authenticate", None),
    (Field::Allow, "Allow", None),
    (Field::Supported, "Supported", Some("k")),
    (Field::Event, "Event", Some("o")),
    (Field::SubscriptionState, "Subscription-State", None),
    (Field::RetryAfter, "Retry-After", None),
    (Field::Subject, "Subject", Some("s")),
    (Field::UserAgent, "User-Agent", None),
    (Field::Server, "Server", None),
    (Field::Date, "Date", None),
    (Field::UserToUser, "User-to-User", None),
    (Field::ContentType, "Content-Type", Some("c")),
    (Field::ContentLength, "Content-Length", Some("l")),
];

static FIELD_BY_NAME: Lazy<HashMap<String, Field>> = Lazy::new(|| {
    let mut table = HashMap::new();
    for (field, name, compact) in KNOWN_FIELDS {
        table.insert(name.to_ascii_lowercase(), field.clone());
        if let Some(compact) = compact {
            table.insert(compact.to_string(), field.clone());
        }
    }
    table
});

static NAME_BY_FIELD: Lazy<HashMap<Field, &'static str>> = Lazy::new(|| {
    KNOWN_FIELDS
        .iter()
        .map(|(field, name, _)| (field.clone(), *name))
        .collect()
});

impl Field {
    /// Resolve a header name (case-insensitive, compact forms included)
    pub fn from_name(name: &str) -> Field {
        let name = name.trim();
        FIELD_BY_NAME
            .get(&name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| Field::Other(name.to_string()))
    }

    /// Canonical wire name
    pub fn name(&self) -> &str {
        match self {
            Field::Other(name) => name,
            known => NAME_BY_FIELD.get(known).copied().unwrap_or(""),
        }
    }

    /// Fields whose value carries comma-separated authentication sub-fields
    pub fn carries_auth(&self) -> bool {
        matches!(
            self,
            Field::Authorization
                | Field::ProxyAuthorization
                | Field::WwwAuthenticate
                | Field::ProxyAuthenticate
        )
    }

    /// Fields answering a challenge (as opposed to carrying one)
    pub fn is_credentials(&self) -> bool {
        matches!(self, Field::Authorization | Field::ProxyAuthorization)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Value of `;name=value` parameter in a header value, e.g. `tag` in a From
pub fn param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    // Parameters live after the closing '>' of a name-addr
    let params = match value.rfind('>') {
        Some(idx) => &value[idx + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|p| {
        let p = p.trim();
        let (key, val) = p.split_once('=').unwrap_or((p, ""));
        if key.trim().eq_ignore_ascii_case(name) {
            Some(val.trim())
        } else {
            None
        }
    })
}

/// Tag parameter of a From/To value
pub fn tag(value: &str) -> Option<&str> {
    param(value, "tag").filter(|t| !t.is_empty())
}

/// The URI inside a name-addr (`"Bob" <sip:2001@gw>;tag=x` -> `sip:2001@gw`)
pub fn uri(value: &str) -> &str {
    match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value).trim(),
    }
}

/// User part of the URI in a header value, i.e. the party the header names.
///
/// `"Dispatcher" <sip:1007@10.12.49.86>;tag=1` -> `1007`
pub fn user(value: &str) -> Option<&str> {
    let uri = uri(value);
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(uri);
    let user = match rest.split_once('@') {
        Some((user, _)) => user,
        None => return None,
    };
    let user = user.split(';').next().unwrap_or(user);
    let user = user.split(':').next().unwrap_or(user);
    if user.is_empty() {
        None
    } else {
        Some(user)
    }
}

/// Display name of a name-addr, without quotes
pub fn display_name(value: &str) -> Option<&str> {
    let idx = value.find('<')?;
    let name = value[..idx].trim().trim_matches('"').trim();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Branch parameter of a Via value
pub fn via_branch(via: &str) -> Option<&str> {
    param(via, "branch")
}

/// Append `;rport` to a Via value so the gateway reports our public port
pub fn with_rport(via: &str) -> String {
    if via.split(';').any(|p| p.trim().starts_with("rport")) {
        via.to_string()
    } else {
        format!("{};rport", via)
    }
}

/// `rport=<port>` value reported by the gateway
pub fn via_rport(via: &str) -> Option<u16> {
    param(via, "rport").and_then(|p| p.parse().ok())
}

/// `received=<addr>` value reported by the gateway
pub fn via_received(via: &str) -> Option<&str> {
    param(via, "received").filter(|r| !r.is_empty())
}
