//! Peer identities and the signed tokens that carry them in discovery and handshake packets.

use crate::error::{JuiceNetError, JuiceNetResult};
use crate::protocol::{is_compatible_major, LIBRARY, LIBRARY_VERSION, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// The self-description a node advertises to its peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerIdentity {
    pub library: String,
    pub library_version: String,
    pub protocol_major: u16,
    pub protocol_minor: u16,
    pub peer_id: u64,
    pub port: u16,
    pub system: SystemInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub arch: String,
    pub version: String,
}

impl SystemInfo {
    pub fn current(version_override: Option<&str>) -> SystemInfo {
        let version = match version_override {
            Some(v) => v.to_string(),
            None => Self::detect_os_version(),
        };

        SystemInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version,
        }
    }

    /// The kernel release on Linux. Other platforms report "unknown", set
    ///  [crate::config::JuiceNetConfig::host_version] there.
    fn detect_os_version() -> String {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

impl PeerIdentity {
    pub fn local(peer_id: u64, port: u16, host_version: Option<&str>) -> PeerIdentity {
        PeerIdentity {
            library: LIBRARY.to_string(),
            library_version: LIBRARY_VERSION.to_string(),
            protocol_major: PROTOCOL_VERSION_MAJOR,
            protocol_minor: PROTOCOL_VERSION_MINOR,
            peer_id,
            port,
            system: SystemInfo::current(host_version),
        }
    }

    pub fn check_compatible(&self) -> JuiceNetResult<()> {
        if is_compatible_major(self.protocol_major) {
            Ok(())
        }
        else {
            Err(JuiceNetError::ProtocolVersionMismatch {
                local_major: PROTOCOL_VERSION_MAJOR,
                remote_major: self.protocol_major,
            })
        }
    }
}

/// Turns a payload into an opaque signed token and back. The transport treats tokens as
///  opaque strings, the signing scheme is entirely up to the implementation.
pub trait IdentityTokenProvider: Send + Sync + 'static {
    fn sign(&self, payload: &[u8]) -> String;

    /// returns the signed payload if the token is authentic
    fn verify(&self, token: &str) -> JuiceNetResult<Vec<u8>>;

    fn sign_identity(&self, identity: &PeerIdentity) -> JuiceNetResult<String> {
        let json = serde_json::to_vec(identity)
            .map_err(|e| JuiceNetError::InvalidToken(format!("identity not serializable: {}", e)))?;
        Ok(self.sign(&json))
    }

    fn verify_identity(&self, token: &str) -> JuiceNetResult<PeerIdentity> {
        let json = self.verify(token)?;
        serde_json::from_slice(&json)
            .map_err(|e| JuiceNetError::InvalidToken(format!("token payload is not a peer identity: {}", e)))
    }
}

/// Tokens of the form `base64url(payload) "." base64url(HMAC-SHA256(key, base64url(payload)))`.
///
/// All nodes that need to verify each other's tokens must share the key.
pub struct HmacTokenProvider {
    key: hmac::Key,
}

impl HmacTokenProvider {
    pub fn new(secret: &[u8]) -> HmacTokenProvider {
        HmacTokenProvider {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
        }
    }

    /// A provider with a fresh random key: tokens it signs can only be verified by itself
    pub fn random() -> HmacTokenProvider {
        let secret: [u8; 32] = rand::random();
        Self::new(&secret)
    }
}

impl IdentityTokenProvider for HmacTokenProvider {
    fn sign(&self, payload: &[u8]) -> String {
        let encoded_payload = URL_SAFE_NO_PAD.encode(payload);
        let tag = hmac::sign(&self.key, encoded_payload.as_bytes());
        format!("{}.{}", encoded_payload, URL_SAFE_NO_PAD.encode(tag.as_ref()))
    }

    fn verify(&self, token: &str) -> JuiceNetResult<Vec<u8>> {
        let (encoded_payload, encoded_signature) = token.split_once('.')
            .ok_or_else(|| JuiceNetError::InvalidToken("missing signature separator".to_string()))?;

        let signature = URL_SAFE_NO_PAD.decode(encoded_signature)
            .map_err(|e| JuiceNetError::InvalidToken(format!("signature is not base64: {}", e)))?;

        if hmac::verify(&self.key, encoded_payload.as_bytes(), &signature).is_err() {
            trace!("token signature mismatch");
            return Err(JuiceNetError::InvalidToken("signature mismatch".to_string()));
        }

        URL_SAFE_NO_PAD.decode(encoded_payload)
            .map_err(|e| JuiceNetError::InvalidToken(format!("payload is not base64: {}", e)))
    }
}
