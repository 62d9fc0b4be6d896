//! Host public-key recovery.
//!
//! When a host has not published an encryption key, the client sends it a
//! random 32-byte challenge. The host signs the challenge with its wallet key
//! (EIP-191 personal message) and returns `{signature, recoveryId}`. The client
//! recovers the signing key and only accepts it if it hashes to the host's
//! registered address.

use crate::discovery::HostRecord;
use crate::error::{KeyRecoveryError, MarketError, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use log::{debug, info};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// `keccak256("\x19Ethereum Signed Message:\n32" || challenge)`
pub fn challenge_message_hash(challenge: &H256) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(challenge.as_bytes());
    hasher.finalize().into()
}

/// Ethereum address of a secp256k1 key
pub fn address_from_key(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = Keccak256::digest(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Recover and authenticate a host key from its signed challenge.
///
/// `signature` is `r || s`, optionally followed by a trailing `v` byte which is
/// ignored in favour of `recovery_id`. Accepts ids `0..=3` and the legacy
/// `27`/`28` encoding.
pub fn recover_host_public_key(
    challenge: &H256,
    signature: &[u8],
    recovery_id: u8,
    expected_address: Address,
) -> std::result::Result<VerifyingKey, KeyRecoveryError> {
    if signature.len() != 64 && signature.len() != 65 {
        return Err(KeyRecoveryError::InvalidSignature(format!(
            "expected 64 or 65 bytes, got {}",
            signature.len()
        )));
    }
    let signature = Signature::from_slice(&signature[..64])
        .map_err(|e| KeyRecoveryError::InvalidSignature(e.to_string()))?;

    let normalized = if recovery_id >= 27 { recovery_id - 27 } else { recovery_id };
    let recovery_id = RecoveryId::from_byte(normalized).ok_or_else(|| {
        KeyRecoveryError::InvalidSignature(format!("recovery id {} out of range", recovery_id))
    })?;

    let hash = challenge_message_hash(challenge);
    let key = VerifyingKey::recover_from_prehash(&hash, &signature, recovery_id)
        .map_err(|e| KeyRecoveryError::InvalidSignature(e.to_string()))?;

    let recovered = address_from_key(&key);
    if recovered != expected_address {
        return Err(KeyRecoveryError::AddressMismatch {
            expected: expected_address,
            recovered,
        });
    }
    Ok(key)
}

pub fn parse_public_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key.trim_start_matches("0x"))?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| MarketError::Encryption(format!("invalid host public key: {}", e)))
}

/// Response of a host's challenge endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    /// Hex encoded `r || s [|| v]`
    pub signature: String,
    pub recovery_id: u8,
}

#[async_trait]
pub trait ChallengeClient: Send + Sync {
    async fn request_signature(
        &self,
        api_url: &str,
        challenge: H256,
    ) -> std::result::Result<ChallengeResponse, KeyRecoveryError>;
}

/// Asks `POST {api_url}/v1/auth/challenge`
pub struct HttpChallengeClient {
    client: reqwest::Client,
}

impl HttpChallengeClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MarketError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChallengeClient for HttpChallengeClient {
    async fn request_signature(
        &self,
        api_url: &str,
        challenge: H256,
    ) -> std::result::Result<ChallengeResponse, KeyRecoveryError> {
        let url = format!("{}/v1/auth/challenge", api_url.trim_end_matches('/'));
        let body = serde_json::json!({ "challenge": format!("{:?}", challenge) });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| KeyRecoveryError::ChallengeFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(KeyRecoveryError::ChallengeFailed(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        response
            .json::<ChallengeResponse>()
            .await
            .map_err(|e| KeyRecoveryError::ChallengeFailed(e.to_string()))
    }
}

/// Resolves host encryption keys, preferring published keys and caching
/// recovered ones per host address
pub struct HostKeyResolver {
    client: Arc<dyn ChallengeClient>,
    recovered: Arc<RwLock<HashMap<Address, VerifyingKey>>>,
}

impl HostKeyResolver {
    pub fn new(client: Arc<dyn ChallengeClient>) -> Self {
        Self {
            client,
            recovered: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn resolve(&self, host: &HostRecord) -> Result<VerifyingKey> {
        if let Some(published) = host.public_key() {
            return parse_public_key(published);
        }

        if let Some(key) = self.recovered.read().await.get(&host.address).cloned() {
            return Ok(key);
        }

        if host.api_url.trim().is_empty() {
            return Err(KeyRecoveryError::NoApiUrl(host.address).into());
        }

        let mut challenge = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        let challenge = H256::from(challenge);
        debug!("Requesting key challenge from {:?}", host.address);

        let response = self.client.request_signature(&host.api_url, challenge).await?;
        let signature = hex::decode(response.signature.trim_start_matches("0x"))
            .map_err(|e| KeyRecoveryError::InvalidSignature(e.to_string()))?;
        let key =
            recover_host_public_key(&challenge, &signature, response.recovery_id, host.address)?;

        self.recovered.write().await.insert(host.address, key.clone());
        info!("🔑 Recovered public key for host {:?}", host.address);
        Ok(key)
    }

    pub async fn forget(&self, host: Address) {
        self.recovered.write().await.remove(&host);
    }
}
