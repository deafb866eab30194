//! SIP Digest Authentication, client side (RFC 2617, RFC 3261 §22)
//!
//! ```text
//! HA1      = H(username:realm:secret)
//! HA2      = H(method:uri)
//! response = H(HA1:nonce:nc:cnonce:qop:HA2)   with qop
//!          = H(HA1:nonce:HA2)                 without
//! ```

use super::header::Field;
use super::message::SipMessage;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Which header carried the challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStyle {
    /// `WWW-Authenticate` (registrar), answered in `Authorization`
    Register,
    /// `Proxy-Authenticate` (call setup), answered in `Proxy-Authorization`
    Call,
}

impl ChallengeStyle {
    pub fn challenge_field(&self) -> Field {
        match self {
            ChallengeStyle::Register => Field::WwwAuthenticate,
            ChallengeStyle::Call => Field::ProxyAuthenticate,
        }
    }

    pub fn credentials_field(&self) -> Field {
        match self {
            ChallengeStyle::Register => Field::Authorization,
            ChallengeStyle::Call => Field::ProxyAuthorization,
        }
    }
}

/// Hash function named by the challenge's `algorithm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn from_name(name: Option<&str>) -> Self {
        match name.map(|n| n.trim().to_ascii_uppercase()) {
            None => DigestAlgorithm::Md5,
            Some(n) if n == "MD5" => DigestAlgorithm::Md5,
            Some(n) if n == "SHA-256" => DigestAlgorithm::Sha256,
            Some(other) => {
                warn!("Unsupported digest algorithm {}, falling back to MD5", other);
                DigestAlgorithm::Md5
            }
        }
    }

    fn hash(&self, input: &str) -> String {
        match self {
            DigestAlgorithm::Md5 => format!("{:x}", md5::compute(input)),
            DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
        }
    }
}

/// A parsed authentication challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub style: ChallengeStyle,
    pub realm: String,
    pub nonce: String,
    /// Verbatim from the challenge
    pub algorithm: Option<String>,
    /// Verbatim from the challenge
    pub qop: Option<String>,
    pub opaque: Option<String>,
    /// Server says the previous nonce merely expired
    pub stale: bool,
}

impl DigestChallenge {
    /// Extract the challenge from a 401/407 response
    pub fn from_message(msg: &SipMessage) -> Option<Self> {
        [ChallengeStyle::Register, ChallengeStyle::Call]
            .into_iter()
            .find_map(|style| {
                let fields = msg.sub_fields(&style.challenge_field())?;
                let realm = fields.get("realm")?.clone();
                let nonce = fields.get("nonce")?.clone();
                Some(Self {
                    style,
                    realm,
                    nonce,
                    algorithm: fields.get("algorithm").cloned(),
                    qop: fields.get("qop").cloned(),
                    opaque: fields.get("opaque").cloned(),
                    stale: fields
                        .get("stale")
                        .map(|s| s.eq_ignore_ascii_case("true"))
                        .unwrap_or(false),
                })
            })
    }

    /// Request target covered by the digest: `<scheme>:<realm>` for
    /// registrar challenges, the original target for call challenges.
    pub fn digest_uri(&self, scheme: &str, request_target: &str) -> String {
        match self.style {
            ChallengeStyle::Register => format!("{}:{}", scheme, self.realm),
            ChallengeStyle::Call => request_target.to_string(),
        }
    }

    /// qop value used in the computation. A list offered by the server
    /// collapses to `auth`.
    fn effective_qop(&self) -> Option<String> {
        let qop = self.qop.as_deref()?.trim();
        if qop.is_empty() {
            return None;
        }
        if qop.contains(',') {
            let offered: Vec<&str> = qop.split(',').map(str::trim).collect();
            if offered.contains(&"auth") {
                return Some("auth".to_string());
            }
            return offered.first().map(|q| q.to_string());
        }
        Some(qop.to_string())
    }
}

/// Computed credentials, ready to attach to a resend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCredentials {
    pub style: ChallengeStyle,
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub cnonce: Option<String>,
    pub nc: Option<String>,
    /// The challenge's qop, except that an offered list collapses to `auth`
    pub qop: Option<String>,
    pub algorithm: Option<String>,
    pub opaque: Option<String>,
}

impl DigestCredentials {
    /// Sub-fields in wire order
    pub fn pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("username", self.username.clone()),
            ("realm", self.realm.clone()),
            ("nonce", self.nonce.clone()),
            ("uri", self.uri.clone()),
            ("response", self.response.clone()),
        ];
        if let Some(algorithm) = &self.algorithm {
            pairs.push(("algorithm", algorithm.clone()));
        }
        if let Some(cnonce) = &self.cnonce {
            pairs.push(("cnonce", cnonce.clone()));
        }
        if let Some(opaque) = &self.opaque {
            pairs.push(("opaque", opaque.clone()));
        }
        if let Some(qop) = &self.qop {
            pairs.push(("qop", qop.clone()));
        }
        if let Some(nc) = &self.nc {
            pairs.push(("nc", nc.clone()));
        }
        pairs
    }

    /// Attach to `msg` in the field matching the challenge style.
    /// Returns the rendered header value.
    pub fn apply(&self, msg: &mut SipMessage) -> String {
        let field = self.style.credentials_field();
        msg.set_sub_fields(field.clone(), "Digest", &self.pairs());
        msg.field(&field).unwrap_or_default().to_string()
    }
}

/// Digest calculator holding the shared secret and the nonce counter
#[derive(Debug)]
pub struct DigestClient {
    secret: String,
    nonce_count: AtomicU32,
}

impl DigestClient {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            nonce_count: AtomicU32::new(0),
        }
    }

    /// Next nonce count: increments, wraps to 1, never 0
    pub fn next_nonce_count(&self) -> u32 {
        let previous = self
            .nonce_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(if n == u32::MAX { 1 } else { n + 1 })
            })
            .unwrap_or(0);
        if previous == u32::MAX {
            1
        } else {
            previous + 1
        }
    }

    /// Fresh random client nonce
    pub fn generate_cnonce() -> String {
        let mut rng = rand::thread_rng();
        let bytes: [u8; 8] = rng.gen();
        hex::encode(bytes)
    }

    /// Answer `challenge` for a request with `method` sent to `request_target`
    pub fn answer(
        &self,
        challenge: &DigestChallenge,
        username: &str,
        method: &str,
        scheme: &str,
        request_target: &str,
    ) -> DigestCredentials {
        let cnonce = Self::generate_cnonce();
        let nc = self.next_nonce_count();
        self.answer_with(challenge, username, method, scheme, request_target, &cnonce, nc)
    }

    /// Deterministic variant of [`answer`](Self::answer)
    #[allow(clippy::too_many_arguments)]
    pub fn answer_with(
        &self,
        challenge: &DigestChallenge,
        username: &str,
        method: &str,
        scheme: &str,
        request_target: &str,
        cnonce: &str,
        nonce_count: u32,
    ) -> DigestCredentials {
        let uri = challenge.digest_uri(scheme, request_target);
        let qop = challenge.effective_qop();
        let algorithm = DigestAlgorithm::from_name(challenge.algorithm.as_deref());
        let nc = format!("{:08x}", nonce_count);

        let response = compute_response(
            algorithm,
            username,
            &challenge.realm,
            &self.secret,
            &challenge.nonce,
            qop.as_deref().map(|q| (nc.as_str(), cnonce, q)),
            method,
            &uri,
        );
        debug!(
            "Computed digest for {} realm={} nc={}",
            username, challenge.realm, nc
        );

        DigestCredentials {
            style: challenge.style,
            username: username.to_string(),
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            uri,
            response,
            cnonce: qop.as_ref().map(|_| cnonce.to_string()),
            nc: qop.as_ref().map(|_| nc),
            qop,
            algorithm: challenge.algorithm.clone(),
            opaque: challenge.opaque.clone(),
        }
    }
}

/// `H( H(user:realm:secret) : nonce : [nc:cnonce:qop:] H(method:uri) )`
#[allow(clippy::too_many_arguments)]
pub fn compute_response(
    algorithm: DigestAlgorithm,
    username: &str,
    realm: &str,
    secret: &str,
    nonce: &str,
    qop: Option<(&str, &str, &str)>,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = algorithm.hash(&format!("{}:{}:{}", username, realm, secret));
    let ha2 = algorithm.hash(&format!("{}:{}", method, uri));
    match qop {
        Some((nc, cnonce, qop)) => {
            algorithm.hash(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
        }
        None => algorithm.hash(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::MessageType;

    fn register_challenge() -> DigestChallenge {
        DigestChallenge {
            style: ChallengeStyle::Register,
            realm: "10.12.49.86".to_string(),
            nonce: "abc".to_string(),
            algorithm: Some("MD5".to_string()),
            qop: Some("auth".to_string()),
            opaque: None,
            stale: false,
        }
    }

    #[test]
    fn test_rfc2617_example() {
        // RFC 2617 §3.5
        let response = compute_response(
            DigestAlgorithm::Md5,
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            Some(("00000001", "0a4f113b", "auth")),
            "GET",
            "/dir/index.html",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn test_response_is_deterministic() {
        let client = DigestClient::new("pass");
        let challenge = register_challenge();
        let a = client.answer_with(&challenge, "1007", "REGISTER", "sip", "sip:10.12.49.86", "c1", 1);
        let b = client.answer_with(&challenge, "1007", "REGISTER", "sip", "sip:10.12.49.86", "c1", 1);
        assert_eq!(a.response, b.response);
        assert_eq!(a.response.len(), 32);
        assert!(a.response.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a.uri, "sip:10.12.49.86");
        assert_eq!(a.nc.as_deref(), Some("00000001"));
    }

    #[test]
    fn test_response_changes_with_inputs() {
        let base = DigestClient::new("pass")
            .answer_with(&register_challenge(), "1007", "REGISTER", "sip", "", "c1", 1)
            .response;

        let other_secret = DigestClient::new("secret")
            .answer_with(&register_challenge(), "1007", "REGISTER", "sip", "", "c1", 1)
            .response;
        assert_ne!(base, other_secret);

        let mut challenge = register_challenge();
        challenge.nonce = "abd".to_string();
        let other_nonce = DigestClient::new("pass")
            .answer_with(&challenge, "1007", "REGISTER", "sip", "", "c1", 1)
            .response;
        assert_ne!(base, other_nonce);

        let mut challenge = register_challenge();
        challenge.realm = "gw.example".to_string();
        let other_realm = DigestClient::new("pass")
            .answer_with(&challenge, "1007", "REGISTER", "sip", "", "c1", 1)
            .response;
        assert_ne!(base, other_realm);

        let other_method = DigestClient::new("pass")
            .answer_with(&register_challenge(), "1007", "INVITE", "sip", "", "c1", 1)
            .response;
        assert_ne!(base, other_method);
    }

    #[test]
    fn test_call_style_uses_request_target() {
        let mut challenge = register_challenge();
        challenge.style = ChallengeStyle::Call;
        let creds = DigestClient::new("pass").answer_with(
            &challenge,
            "1007",
            "INVITE",
            "sip",
            "sip:2001@10.12.49.86",
            "c1",
            1,
        );
        assert_eq!(creds.uri, "sip:2001@10.12.49.86");

        let mut msg = SipMessage::request(MessageType::Invite, "sip:2001@10.12.49.86");
        creds.apply(&mut msg);
        assert_eq!(
            msg.sub_field(&Field::ProxyAuthorization, "uri"),
            Some("sip:2001@10.12.49.86")
        );
        assert!(msg.field(&Field::Authorization).is_none());
    }

    #[test]
    fn test_without_qop() {
        let mut challenge = register_challenge();
        challenge.qop = None;
        let creds = DigestClient::new("pass")
            .answer_with(&challenge, "1007", "REGISTER", "sip", "", "c1", 1);
        assert!(creds.cnonce.is_none());
        assert!(creds.nc.is_none());
        let expected = compute_response(
            DigestAlgorithm::Md5,
            "1007",
            "10.12.49.86",
            "pass",
            "abc",
            None,
            "REGISTER",
            "sip:10.12.49.86",
        );
        assert_eq!(creds.response, expected);
    }

    #[test]
    fn test_sha256_algorithm() {
        let mut challenge = register_challenge();
        challenge.algorithm = Some("SHA-256".to_string());
        let creds = DigestClient::new("pass")
            .answer_with(&challenge, "1007", "REGISTER", "sip", "", "c1", 1);
        assert_eq!(creds.response.len(), 64);
        assert_eq!(creds.algorithm.as_deref(), Some("SHA-256"));
    }

    #[test]
    fn test_qop_list_prefers_auth() {
        let mut challenge = register_challenge();
        challenge.qop = Some("auth-int, auth".to_string());
        let creds = DigestClient::new("pass")
            .answer_with(&challenge, "1007", "REGISTER", "sip", "", "c1", 1);
        assert_eq!(creds.qop.as_deref(), Some("auth"));
    }

    #[test]
    fn test_nonce_count_wraps_to_one() {
        let client = DigestClient::new("pass");
        assert_eq!(client.next_nonce_count(), 1);
        assert_eq!(client.next_nonce_count(), 2);

        client.nonce_count.store(u32::MAX - 1, Ordering::SeqCst);
        assert_eq!(client.next_nonce_count(), u32::MAX);
        assert_eq!(client.next_nonce_count(), 1);
    }

    #[test]
    fn test_challenge_from_message() {
        let msg = SipMessage::decode(
            b"SIP/2.0 407 Proxy Authentication Required\r\n\
              CSeq: 2 INVITE\r\n\
              Proxy-Authenticate: Digest realm=\"gw\", nonce=\"n1\", stale=TRUE\r\n\r\n",
        )
        .unwrap();
        let challenge = DigestChallenge::from_message(&msg).unwrap();
        assert_eq!(challenge.style, ChallengeStyle::Call);
        assert_eq!(challenge.realm, "gw");
        assert_eq!(challenge.nonce, "n1");
        assert!(challenge.stale);
        assert!(challenge.qop.is_none());

        let plain = SipMessage::decode(b"SIP/2.0 401 Unauthorized\r\nCSeq: 1 REGISTER\r\n\r\n").unwrap();
        assert!(DigestChallenge::from_message(&plain).is_none());
    }

    #[test]
    fn test_generate_cnonce_is_random_hex() {
        let a = DigestClient::generate_cnonce();
        let b = DigestClient::generate_cnonce();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }
}
