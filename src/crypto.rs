//! Per-session symmetric keys and authenticated encryption of payloads.
//!
//! Every participant generates one AES-256-GCM key for the session and hands
//! it to each peer it links with, so the signaling server relays key material
//! it never sees in plaintext form outside the peer-addressed `encryption-key`
//! message. Keys are exchanged as JSON Web Keys, the format browsers export.

use std::collections::HashMap;
use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

const JWK_KTY: &str = "oct";
const JWK_ALG: &str = "A256GCM";

#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    bytes: [u8; KEY_LEN],
}

impl SessionKey {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self { bytes })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("expected {KEY_LEN} bytes, got {}", bytes.len()))
        })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Serializable form that can travel over signaling.
    pub fn export(&self) -> JsonWebKey {
        JsonWebKey {
            kty: JWK_KTY.to_string(),
            k: URL_SAFE_NO_PAD.encode(self.bytes),
            alg: Some(JWK_ALG.to_string()),
            ext: Some(true),
            key_ops: vec!["encrypt".to_string(), "decrypt".to_string()],
        }
    }

    pub fn import(jwk: &JsonWebKey) -> Result<Self, CryptoError> {
        if jwk.kty != JWK_KTY {
            return Err(CryptoError::InvalidKey(format!("unsupported kty {:?}", jwk.kty)));
        }
        if let Some(alg) = jwk.alg.as_deref() {
            if alg != JWK_ALG {
                return Err(CryptoError::InvalidKey(format!("unsupported alg {alg:?}")));
            }
        }
        // Browsers omit padding, but tolerate it from other exporters.
        let encoded = jwk.k.trim_end_matches('=');
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        Aes256Gcm::new_from_slice(&self.bytes)
            .map_err(|_| CryptoError::InvalidKey("bad key length".to_string()))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// JSON Web Key for a symmetric AES-GCM key (RFC 7517 `oct` key type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    pub kty: String,
    pub k: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_ops: Vec<String>,
}

/// Encrypts `plaintext` under a fresh random nonce and returns `nonce || ciphertext`.
pub fn seal(plaintext: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce)
        .map_err(|_| CryptoError::Encryption)?;

    let ciphertext = key
        .cipher()?
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

pub fn open(sealed: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN {
        return Err(CryptoError::Decryption);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    key.cipher()?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decryption)
}

/// The local session key plus every key imported from a peer.
#[derive(Debug, Default)]
pub struct KeyStore {
    local: Option<SessionKey>,
    remote: HashMap<String, SessionKey>,
}

impl KeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session key, generating it on first use only.
    ///
    /// Peers that already imported the key would be unable to read anything
    /// sealed under a replacement, so later calls hand back the same key.
    pub fn generate_local_key(&mut self) -> Result<&SessionKey, CryptoError> {
        if self.local.is_none() {
            self.local = Some(SessionKey::generate()?);
            info!("generated local session key");
        }
        self.local
            .as_ref()
            .ok_or_else(|| CryptoError::KeyGeneration("key vanished after generation".into()))
    }

    pub fn local_key(&self) -> Option<&SessionKey> {
        self.local.as_ref()
    }

    pub fn export_local(&self) -> Option<JsonWebKey> {
        self.local.as_ref().map(SessionKey::export)
    }

    pub fn import_remote(&mut self, peer_id: &str, jwk: &JsonWebKey) -> Result<(), CryptoError> {
        let key = SessionKey::import(jwk)?;
        if self.remote.insert(peer_id.to_string(), key).is_some() {
            debug!(peer = peer_id, "replaced encryption key");
        }
        Ok(())
    }

    pub fn remote_key(&self, peer_id: &str) -> Option<&SessionKey> {
        self.remote.get(peer_id)
    }

    pub fn has_remote_key(&self, peer_id: &str) -> bool {
        self.remote.contains_key(peer_id)
    }

    pub fn discard_remote(&mut self, peer_id: &str) -> bool {
        self.remote.remove(peer_id).is_some()
    }

    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    /// Seals a payload every linked peer can open with the key we shared.
    pub fn seal_for_peers(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .local
            .as_ref()
            .ok_or_else(|| CryptoError::MissingKey("local session".to_string()))?;
        seal(plaintext, key)
    }

    /// Opens a payload sealed by `peer_id` under the key it shared with us.
    pub fn open_from(&self, peer_id: &str, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key = self
            .remote
            .get(peer_id)
            .ok_or_else(|| CryptoError::MissingKey(peer_id.to_string()))?;
        open(sealed, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip_including_empty() {
        let key = SessionKey::generate().unwrap();
        for payload in [&b""[..], b"x", &[7u8; 4096][..]] {
            let sealed = seal(payload, &key).unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + payload.len() + 16);
            assert_eq!(open(&sealed, &key).unwrap(), payload);
        }
    }

    #[test]
    fn nonce_differs_per_call() {
        let key = SessionKey::generate().unwrap();
        let a = seal(b"same", &key).unwrap();
        let b = seal(b"same", &key).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_or_tampering_fails() {
        let key = SessionKey::generate().unwrap();
        let other = SessionKey::generate().unwrap();
        let mut sealed = seal(b"secret", &key).unwrap();

        assert!(matches!(open(&sealed, &other), Err(CryptoError::Decryption)));

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(open(&sealed, &key), Err(CryptoError::Decryption)));

        assert!(matches!(open(&sealed[..5], &key), Err(CryptoError::Decryption)));
    }

    #[test]
    fn local_key_generation_is_idempotent() {
        let mut store = KeyStore::new();
        let first = store.generate_local_key().unwrap().clone();
        let second = store.generate_local_key().unwrap().clone();
        assert_eq!(first, second);
        assert_eq!(store.export_local(), Some(first.export()));
    }

    #[test]
    fn jwk_export_import() {
        let key = SessionKey::generate().unwrap();
        let jwk = key.export();
        assert_eq!(jwk.kty, "oct");
        assert_eq!(jwk.alg.as_deref(), Some("A256GCM"));
        assert!(!jwk.k.contains('='));
        assert_eq!(SessionKey::import(&jwk).unwrap(), key);

        let browser: JsonWebKey = serde_json::from_value(serde_json::json!({
            "kty": "oct",
            "k": URL_SAFE_NO_PAD.encode([1u8; KEY_LEN]),
            "alg": "A256GCM",
            "ext": true,
            "key_ops": ["encrypt", "decrypt"]
        }))
        .unwrap();
        assert_eq!(SessionKey::import(&browser).unwrap().as_bytes(), &[1u8; KEY_LEN]);
    }

    #[test]
    fn rejects_bad_jwk() {
        let mut jwk = SessionKey::generate().unwrap().export();
        jwk.kty = "RSA".into();
        assert!(matches!(SessionKey::import(&jwk), Err(CryptoError::InvalidKey(_))));

        let mut short = SessionKey::generate().unwrap().export();
        short.k = URL_SAFE_NO_PAD.encode([0u8; 16]);
        assert!(matches!(SessionKey::import(&short), Err(CryptoError::InvalidKey(_))));

        let mut garbage = SessionKey::generate().unwrap().export();
        garbage.k = "***".into();
        assert!(SessionKey::import(&garbage).is_err());
    }

    #[test]
    fn store_seals_for_peers_and_opens_from_peer() {
        let mut alice = KeyStore::new();
        let mut bob = KeyStore::new();
        alice.generate_local_key().unwrap();
        bob.generate_local_key().unwrap();

        bob.import_remote("alice", &alice.export_local().unwrap()).unwrap();
        let sealed = alice.seal_for_peers(b"hello bob").unwrap();
        assert_eq!(bob.open_from("alice", &sealed).unwrap(), b"hello bob");

        assert!(matches!(
            bob.open_from("carol", &sealed),
            Err(CryptoError::MissingKey(_))
        ));
        assert!(bob.discard_remote("alice"));
        assert!(!bob.has_remote_key("alice"));
    }
}
