//! Configuration management
//!
//! Everything the session needs is injected at construction through
//! [`SessionConfig`]. Hosts usually fill it in from their own settings
//! store; [`SessionConfig::from_env`] is provided for headless deployments.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::shared::error::SessionError;

/// Which transport the session talks over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Stream transports need a connect phase and message re-assembly
    pub fn is_stream(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportKind::Udp | TransportKind::Tcp => 5060,
            TransportKind::Tls => 5061,
        }
    }

    /// URI scheme used in request targets for this transport
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportKind::Tls => "sips",
            _ => "sip",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Local identity (user part of the address of record), e.g. "1007"
    pub identity: String,
    /// Shared secret used for digest authentication
    pub secret: String,
    /// Optional display name used in From headers
    pub display_name: Option<String>,
    /// Gateway host name or IP address
    pub server_host: String,
    /// Gateway port
    pub server_port: u16,
    pub transport: TransportKind,
    /// Local bind port, 0 for an ephemeral port
    pub local_port: u16,
    /// Requested registration lifetime in seconds
    pub register_expires: u32,
    pub user_agent: String,
    /// Listen-only mode: inbound call traffic is not handed to the handler
    pub standby: bool,
    pub media: MediaConfig,
    pub tls: TlsSettings,
    pub timing: Timing,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            secret: String::new(),
            display_name: None,
            server_host: "127.0.0.1".to_string(),
            server_port: 5060,
            transport: TransportKind::Tcp,
            local_port: 0,
            register_expires: 3600,
            user_agent: concat!("dispatch-sip/", env!("CARGO_PKG_VERSION")).to_string(),
            standby: false,
            media: MediaConfig::default(),
            tls: TlsSettings::default(),
            timing: Timing::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(identity: &str, secret: &str, server_host: &str, server_port: u16) -> Self {
        Self {
            identity: identity.to_string(),
            secret: secret.to_string(),
            server_host: server_host.to_string(),
            server_port,
            ..Default::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        if transport == TransportKind::Tls {
            self.tls.enabled = true;
        }
        self
    }

    pub fn with_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_standby(mut self, standby: bool) -> Self {
        self.standby = standby;
        self
    }

    /// Load configuration from `DISPATCH_SIP_*` environment variables,
    /// layered over the defaults. Nested keys use `__`, durations are in
    /// milliseconds, e.g. `DISPATCH_SIP_TIMING__RECONNECT_PAUSE=500`.
    ///
    /// Values are kept as strings until deserialized, so numeric-looking
    /// identities and secrets such as `0042` survive intact.
    pub fn from_env() -> Result<Self, SessionError> {
        Self::from_env_source(None)
    }

    fn from_env_source(source: Option<config::Map<String, String>>) -> Result<Self, SessionError> {
        let settings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("DISPATCH_SIP")
                    .prefix_separator("_")
                    .separator("__")
                    .source(source),
            )
            .build()
            .map_err(|e| SessionError::Config(e.to_string()))?;

        let config: SessionConfig = settings
            .try_deserialize()
            .map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.identity.trim().is_empty() {
            return Err(SessionError::Config("identity must not be empty".to_string()));
        }
        if self.server_host.trim().is_empty() {
            return Err(SessionError::Config("server host must not be empty".to_string()));
        }
        if self.server_port == 0 {
            return Err(SessionError::Config("server port must not be 0".to_string()));
        }
        if self.timing.receive_slice > Duration::from_secs(4) {
            return Err(SessionError::Config(
                "receive slice must not exceed 4 seconds".to_string(),
            ));
        }
        Ok(())
    }

    /// `host:port` of the gateway
    pub fn server_authority(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

/// Local media endpoints advertised in call setup bodies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub audio_port: u16,
    /// Video is only offered when a port is configured
    pub video_port: Option<u16>,
    /// Offer SDES-SRTP keys (`a=crypto`) with every media line
    pub srtp: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            audio_port: 40000,
            video_port: None,
            srtp: false,
        }
    }
}

/// TLS client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    /// PEM bundle of trusted CA certificates
    pub ca_bundle_path: Option<PathBuf>,
    /// SNI / certificate name to verify, defaults to the server host
    pub server_name: Option<String>,
    /// Skip certificate verification (lab gateways with self-signed certs)
    pub accept_invalid_certs: bool,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_bundle_path: None,
            server_name: None,
            accept_invalid_certs: false,
        }
    }
}

/// Timers driving reconnects, timeouts and shutdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Fixed pause between stream connect attempts
    #[serde(with = "millis")]
    pub reconnect_pause: Duration,
    /// Traffic timeout before any keep-alive gap has been observed
    #[serde(with = "millis")]
    pub default_traffic_timeout: Duration,
    /// Lower bound of the computed traffic timeout
    #[serde(with = "millis")]
    pub min_traffic_timeout: Duration,
    /// Backoff after a 503 when the server suggests none
    #[serde(with = "millis")]
    pub unavailable_backoff: Duration,
    /// How long shutdown waits for the unregister to be confirmed
    #[serde(with = "millis")]
    pub unregister_wait: Duration,
    /// Upper bound for joining each worker during shutdown
    #[serde(with = "millis")]
    pub worker_join: Duration,
    /// Outstanding register attempts older than this are pruned
    #[serde(with = "millis")]
    pub attempt_expiry: Duration,
    /// Blocking receives are split into slices of at most this length
    #[serde(with = "millis")]
    pub receive_slice: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            reconnect_pause: Duration::from_secs(2),
            default_traffic_timeout: Duration::from_secs(300),
            min_traffic_timeout: Duration::from_secs(60),
            unavailable_backoff: Duration::from_millis(300),
            unregister_wait: Duration::from_millis(1500),
            worker_join: Duration::from_secs(2),
            attempt_expiry: Duration::from_secs(5),
            receive_slice: Duration::from_secs(1),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
