//! Session encryption.
//!
//! The session-init payload is sealed to the host's secp256k1 key with an
//! ephemeral ECDH exchange expanded through HKDF-SHA256. Every later message
//! is sealed with the per-session AES-256-GCM key, binding the message index
//! as associated data so a replayed or reordered frame fails to open.

use crate::error::{MarketError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use k256::ecdh::EphemeralSecret;
use k256::ecdsa::VerifyingKey;
use k256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const SESSION_INIT_INFO: &[u8] = b"market-client/session-init/v1";
const NONCE_LEN: usize = 12;

/// Per-session symmetric key
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim_start_matches("0x"))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MarketError::Encryption("session key must be 32 bytes".into()))?;
        Ok(Self(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| MarketError::Encryption(e.to_string()))
    }

    /// Seal `plaintext` as message number `index`
    pub fn seal(&self, index: u64, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let aad = index.to_be_bytes();
        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| MarketError::Encryption("seal failed".into()))?;
        Ok(EncryptedPayload {
            ciphertext: hex::encode(ciphertext),
            nonce: hex::encode(nonce),
            index,
        })
    }

    pub fn open(&self, payload: &EncryptedPayload) -> Result<Vec<u8>> {
        let nonce = hex::decode(&payload.nonce)?;
        if nonce.len() != NONCE_LEN {
            return Err(MarketError::Encryption(format!(
                "nonce must be {} bytes, got {}",
                NONCE_LEN,
                nonce.len()
            )));
        }
        let ciphertext = hex::decode(&payload.ciphertext)?;
        let aad = payload.index.to_be_bytes();
        self.cipher()?
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                MarketError::Encryption(format!("message {} failed authentication", payload.index))
            })
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// AEAD-sealed message body, hex encoded for the JSON wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub nonce: String,
    pub index: u64,
}

/// Session-init payload sealed to the host's static key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SealedEnvelope {
    /// Compressed ephemeral public key, hex
    pub eph_pub: String,
    pub ciphertext: String,
    pub nonce: String,
}

fn derive_envelope_key(shared_secret: &[u8]) -> Result<SessionKey> {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(SESSION_INIT_INFO, &mut okm)
        .map_err(|e| MarketError::Encryption(format!("HKDF expand: {}", e)))?;
    Ok(SessionKey(okm))
}

/// Encrypt `plaintext` so only the holder of `host_key`'s secret can read it
pub fn seal_to_host(host_key: &VerifyingKey, plaintext: &[u8]) -> Result<SealedEnvelope> {
    let ephemeral = EphemeralSecret::random(&mut OsRng);
    let host_public = PublicKey::from(host_key);
    let shared = ephemeral.diffie_hellman(&host_public);
    let key = derive_envelope_key(shared.raw_secret_bytes().as_slice())?;

    let sealed = key.seal(0, plaintext)?;
    let eph_pub = ephemeral.public_key().to_sec1_bytes();
    Ok(SealedEnvelope {
        eph_pub: hex::encode(eph_pub),
        ciphertext: sealed.ciphertext,
        nonce: sealed.nonce,
    })
}

/// Host side of [`seal_to_host`]
pub fn open_from_client(host_secret: &SecretKey, envelope: &SealedEnvelope) -> Result<Vec<u8>> {
    let eph_bytes = hex::decode(envelope.eph_pub.trim_start_matches("0x"))?;
    let eph_public = PublicKey::from_sec1_bytes(&eph_bytes)
        .map_err(|e| MarketError::Encryption(format!("invalid ephemeral key: {}", e)))?;
    let shared = k256::ecdh::diffie_hellman(host_secret.to_nonzero_scalar(), eph_public.as_affine());
    let key = derive_envelope_key(shared.raw_secret_bytes().as_slice())?;
    key.open(&EncryptedPayload {
        ciphertext: envelope.ciphertext.clone(),
        nonce: envelope.nonce.clone(),
        index: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_is_authenticated() {
        let key = SessionKey::generate();
        let mut sealed = key.seal(7, b"hello host").unwrap();
        assert_eq!(key.open(&sealed).unwrap(), b"hello host");

        sealed.index = 8;
        assert!(key.open(&sealed).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = SessionKey::generate().seal(1, b"secret").unwrap();
        assert!(SessionKey::generate().open(&sealed).is_err());
    }

    #[test]
    fn test_envelope_opens_only_for_host() {
        let host_secret = SecretKey::random(&mut OsRng);
        let host_key = VerifyingKey::from(&k256::ecdsa::SigningKey::from(host_secret.clone()));

        let envelope = seal_to_host(&host_key, b"{\"sessionKey\":\"00\"}").unwrap();
        let opened = open_from_client(&host_secret, &envelope).unwrap();
        assert_eq!(opened, b"{\"sessionKey\":\"00\"}");

        let other = SecretKey::random(&mut OsRng);
        assert!(open_from_client(&other, &envelope).is_err());
    }

    #[test]
    fn test_session_key_hex() {
        let key = SessionKey::generate();
        assert_eq!(SessionKey::from_hex(&key.to_hex()).unwrap(), key);
        assert!(SessionKey::from_hex("abcd").is_err());
    }
}
