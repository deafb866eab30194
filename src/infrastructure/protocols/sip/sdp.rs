//! SDP handling for call setup bodies
//!
//! Only what media negotiation needs: connection address, audio/video
//! ports and SDES keys. Media payloads are handled elsewhere.

use crate::config::MediaConfig;
use crate::domain::call::MediaDescriptor;
use base64::Engine;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

pub const CONTENT_TYPE: &str = "application/sdp";
pub const DEFAULT_CRYPTO_SUITE: &str = "AES_CM_128_HMAC_SHA1_80";
/// 16-byte master key plus 14-byte salt
const SRTP_KEY_MATERIAL_LEN: usize = 30;

/// SRTP crypto line (SDES)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpCrypto {
    pub tag: u32,
    pub crypto_suite: String,
    /// base64-encoded key material
    pub key_params: String,
    pub session_params: Option<String>,
}

impl SdpCrypto {
    /// Fresh random key for `suite`
    pub fn generate(tag: u32, suite: &str) -> Self {
        let mut material = [0u8; SRTP_KEY_MATERIAL_LEN];
        rand::thread_rng().fill_bytes(&mut material);
        Self {
            tag,
            crypto_suite: suite.to_string(),
            key_params: base64::engine::general_purpose::STANDARD.encode(material),
            session_params: None,
        }
    }

    /// Parse `<tag> <crypto-suite> inline:<key-params> [<session-params>]`
    pub fn parse(value: &str) -> Option<Self> {
        let parts: Vec<&str> = value.split_whitespace().collect();
        if parts.len() < 3 {
            return None;
        }

        let tag = parts[0].parse().ok()?;
        let key = parts[2].strip_prefix("inline:")?;
        // Lifetime and MKI may follow the key after '|'
        let key_params = key.split('|').next().unwrap_or(key).to_string();

        Some(Self {
            tag,
            crypto_suite: parts[1].to_string(),
            key_params,
            session_params: (parts.len() > 3).then(|| parts[3..].join(" ")),
        })
    }

    /// Decoded key material, if the key is valid base64
    pub fn key_material(&self) -> Option<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.key_params)
            .ok()
    }
}

impl std::fmt::Display for SdpCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} inline:{}", self.tag, self.crypto_suite, self.key_params)?;
        if let Some(params) = &self.session_params {
            write!(f, " {}", params)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpMedia {
    /// "audio", "video"
    pub media_type: String,
    pub port: u16,
    /// "RTP/AVP" or "RTP/SAVP"
    pub protocol: String,
    pub formats: Vec<String>,
    /// (payload type, encoding)
    pub rtpmap: Vec<(String, String)>,
    pub crypto: Vec<SdpCrypto>,
    /// Media-level `c=` address
    pub connection: Option<String>,
}

impl SdpMedia {
    fn new(media_type: &str, port: u16, srtp: bool, formats: &[(&str, &str)]) -> Self {
        Self {
            media_type: media_type.to_string(),
            port,
            protocol: if srtp { "RTP/SAVP" } else { "RTP/AVP" }.to_string(),
            formats: formats.iter().map(|(pt, _)| pt.to_string()).collect(),
            rtpmap: formats
                .iter()
                .map(|(pt, enc)| (pt.to_string(), enc.to_string()))
                .collect(),
            crypto: if srtp {
                vec![SdpCrypto::generate(1, DEFAULT_CRYPTO_SUITE)]
            } else {
                Vec::new()
            },
            connection: None,
        }
    }

    /// A port of 0 declines the stream
    pub fn is_active(&self) -> bool {
        self.port != 0
    }

    pub fn key(&self) -> Option<String> {
        self.crypto.first().map(|c| c.key_params.clone())
    }
}

/// Session description, reduced to the lines the session negotiates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpSession {
    pub session_id: String,
    pub address: Option<String>,
    pub media: Vec<SdpMedia>,
}

impl SdpSession {
    /// Local offer (or answer) advertising the configured ports
    pub fn offer(address: &str, media: &MediaConfig, video: bool) -> Self {
        let session_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
            .to_string();

        let mut streams = vec![SdpMedia::new(
            "audio",
            media.audio_port,
            media.srtp,
            &[("0", "PCMU/8000"), ("8", "PCMA/8000"), ("101", "telephone-event/8000")],
        )];
        if let (true, Some(port)) = (video, media.video_port) {
            streams.push(SdpMedia::new("video", port, media.srtp, &[("96", "H264/90000")]));
        }

        Self {
            session_id,
            address: Some(address.to_string()),
            media: streams,
        }
    }

    pub fn parse(body: &str) -> Option<Self> {
        let mut session_id = String::new();
        let mut address = None;
        let mut media: Vec<SdpMedia> = Vec::new();

        for line in body.lines() {
            let line = line.trim();
            let Some((kind, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();

            match kind {
                "o" => {
                    if let Some(id) = value.split_whitespace().nth(1) {
                        session_id = id.to_string();
                    }
                }
                "c" => {
                    let conn = value.split_whitespace().nth(2).map(str::to_string);
                    match media.last_mut() {
                        Some(current) => current.connection = conn,
                        None => address = conn,
                    }
                }
                "m" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        media.push(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].split('/').next().and_then(|p| p.parse().ok()).unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            rtpmap: Vec::new(),
                            crypto: Vec::new(),
                            connection: None,
                        });
                    }
                }
                "a" => {
                    let Some(current) = media.last_mut() else {
                        continue;
                    };
                    if let Some(rtpmap) = value.strip_prefix("rtpmap:") {
                        if let Some((pt, encoding)) = rtpmap.split_once(' ') {
                            current.rtpmap.push((pt.to_string(), encoding.to_string()));
                        }
                    } else if let Some(crypto) = value.strip_prefix("crypto:") {
                        if let Some(crypto) = SdpCrypto::parse(crypto) {
                            current.crypto.push(crypto);
                        }
                    }
                }
                _ => {}
            }
        }

        if media.is_empty() && address.is_none() {
            return None;
        }
        Some(Self {
            session_id,
            address,
            media,
        })
    }

    pub fn audio(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    pub fn video(&self) -> Option<&SdpMedia> {
        self.media
            .iter()
            .find(|m| m.media_type == "video" && m.is_active())
    }

    /// Negotiated transport parameters
    pub fn descriptor(&self) -> MediaDescriptor {
        let audio = self.audio();
        let video = self.video();
        let address = audio
            .and_then(|m| m.connection.clone())
            .or_else(|| self.address.clone());
        MediaDescriptor {
            address,
            audio_port: audio.map(|m| m.port).filter(|p| *p != 0),
            audio_key: audio.and_then(SdpMedia::key),
            video_port: video.map(|m| m.port),
            video_key: video.and_then(SdpMedia::key),
        }
    }
}

impl std::fmt::Display for SdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let address = self.address.as_deref().unwrap_or("0.0.0.0");
        let family = if address.contains(':') { "IP6" } else { "IP4" };

        write!(f, "v=0\r\n")?;
        write!(f, "o=- {} 1 IN {} {}\r\n", self.session_id, family, address)?;
        write!(f, "s=-\r\n")?;
        write!(f, "c=IN {} {}\r\n", family, address)?;
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            )?;
            for crypto in &media.crypto {
                write!(f, "a=crypto:{}\r\n", crypto)?;
            }
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            write!(f, "a=sendrecv\r\n")?;
        }
        Ok(())
    }
}

/// Media descriptor carried by a message body, if it is SDP
pub fn extract(content_type: Option<&str>, body: &[u8]) -> Option<MediaDescriptor> {
    if body.is_empty() {
        return None;
    }
    if let Some(content_type) = content_type {
        if !content_type.trim().to_ascii_lowercase().starts_with(CONTENT_TYPE) {
            return None;
        }
    }
    let text = std::str::from_utf8(body).ok()?;
    SdpSession::parse(text).map(|s| s.descriptor())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REMOTE_OFFER: &str = "v=0\r\n\
        o=gw 8841 1 IN IP4 10.12.49.86\r\n\
        s=call\r\n\
        c=IN IP4 10.12.49.90\r\n\
        t=0 0\r\n\
        m=audio 30000 RTP/SAVP 0 8\r\n\
        a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz|2^20|1:32\r\n\
        a=rtpmap:0 PCMU/8000\r\n\
        m=video 30002 RTP/SAVP 96\r\n\
        c=IN IP4 10.12.49.91\r\n\
        a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:dmlkZW9rZXl2aWRlb2tleXZpZGVva2V5dmlkZW8x\r\n";

    #[test]
    fn test_extract_descriptor() {
        let media = extract(Some("application/sdp"), REMOTE_OFFER.as_bytes()).unwrap();
        assert_eq!(media.address.as_deref(), Some("10.12.49.90"));
        assert_eq!(media.audio_port, Some(30000));
        assert_eq!(
            media.audio_key.as_deref(),
            Some("WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz")
        );
        assert_eq!(media.video_port, Some(30002));
        assert!(media.video_key.is_some());
        assert!(media.has_video());
    }

    #[test]
    fn test_declined_video_is_ignored() {
        let body = "v=0\r\nc=IN IP4 10.0.0.1\r\nm=audio 4000 RTP/AVP 0\r\nm=video 0 RTP/AVP 96\r\n";
        let media = extract(None, body.as_bytes()).unwrap();
        assert_eq!(media.audio_port, Some(4000));
        assert_eq!(media.video_port, None);
        assert!(!media.has_video());
    }

    #[test]
    fn test_non_sdp_body() {
        assert!(extract(Some("text/plain"), b"hello").is_none());
        assert!(extract(Some("application/sdp"), b"").is_none());
    }

    #[test]
    fn test_offer_round_trip() {
        let config = MediaConfig {
            audio_port: 40000,
            video_port: Some(40002),
            srtp: true,
        };
        let offer = SdpSession::offer("192.168.1.20", &config, true);
        let text = offer.to_string();
        assert!(text.contains("m=audio 40000 RTP/SAVP 0 8 101\r\n"));
        assert!(text.contains("m=video 40002 RTP/SAVP 96\r\n"));
        assert!(text.contains("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:"));

        let parsed = SdpSession::parse(&text).unwrap();
        let media = parsed.descriptor();
        assert_eq!(media.address.as_deref(), Some("192.168.1.20"));
        assert_eq!(media.audio_port, Some(40000));
        assert_eq!(media.video_port, Some(40002));
        let key = parsed.audio().unwrap().crypto[0].key_material().unwrap();
        assert_eq!(key.len(), 30);
    }

    #[test]
    fn test_audio_only_offer_without_video_port() {
        let config = MediaConfig::default();
        let offer = SdpSession::offer("10.0.0.5", &config, true);
        assert_eq!(offer.media.len(), 1);
        assert!(offer.to_string().contains("m=audio 40000 RTP/AVP"));
        assert!(offer.audio().unwrap().crypto.is_empty());
    }

    #[test]
    fn test_crypto_parse() {
        let crypto = SdpCrypto::parse("2 AES_CM_128_HMAC_SHA1_32 inline:a2V5 KDR=1").unwrap();
        assert_eq!(crypto.tag, 2);
        assert_eq!(crypto.crypto_suite, "AES_CM_128_HMAC_SHA1_32");
        assert_eq!(crypto.key_params, "a2V5");
        assert_eq!(crypto.session_params.as_deref(), Some("KDR=1"));
        assert_eq!(crypto.to_string(), "2 AES_CM_128_HMAC_SHA1_32 inline:a2V5 KDR=1");
        assert!(SdpCrypto::parse("1 suite nokey").is_none());
    }
}
