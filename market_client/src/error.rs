//! Error taxonomy for the marketplace client.
//!
//! Every variant carries a stable machine-readable code (see [`MarketError::code`])
//! alongside its human-readable message.

use ethers::types::{Address, U256};
use thiserror::Error;

/// Failures while recovering a host's public key from a signed challenge
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyRecoveryError {
    #[error("recovered address {recovered:?} does not match expected host {expected:?}")]
    AddressMismatch { expected: Address, recovered: Address },

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("host {0:?} has no API URL to request a challenge from")]
    NoApiUrl(Address),

    #[error("challenge request failed: {0}")]
    ChallengeFailed(String),
}

impl KeyRecoveryError {
    pub fn code(&self) -> &'static str {
        match self {
            KeyRecoveryError::AddressMismatch { .. } => "KEY_RECOVERY_ADDRESS_MISMATCH",
            KeyRecoveryError::InvalidSignature(_) => "KEY_RECOVERY_INVALID_SIGNATURE",
            KeyRecoveryError::NoApiUrl(_) => "KEY_RECOVERY_NO_API_URL",
            KeyRecoveryError::ChallengeFailed(_) => "KEY_RECOVERY_CHALLENGE_FAILED",
        }
    }
}

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported chain: {0}")]
    UnsupportedChain(u64),

    #[error("Chain mismatch: signer is on chain {actual}, requested chain {expected}")]
    ChainMismatch { expected: u64, actual: u64 },

    #[error("Insufficient deposit: required {required}, available {available}")]
    InsufficientDeposit { required: U256, available: U256 },

    #[error("No hosts available for model {0}")]
    NoHostsForModel(String),

    #[error("Model not approved: {0}")]
    ModelNotApproved(String),

    #[error("Key recovery failed: {0}")]
    KeyRecovery(#[from] KeyRecoveryError),

    #[error("Session {0} is closed")]
    SessionClosed(U256),

    #[error("Session not found: {0}")]
    SessionNotFound(U256),

    #[error("Session {session_id} cannot {operation} while {status}")]
    InvalidSessionState {
        session_id: U256,
        operation: &'static str,
        status: String,
    },

    #[error("Session {0} already has a prompt in flight")]
    PromptInFlight(U256),

    #[error("Checkpoint too small: {pending} pending tokens (minimum {minimum})")]
    CheckpointTooSmall { pending: u64, minimum: u64 },

    #[error("Settlement failed: {0}")]
    Settlement(String),

    #[error("Contract call failed: {0}")]
    Contract(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Replayed message index {index} (last seen {last_seen})")]
    ReplayedMessage { index: u64, last_seen: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Host error {code}: {message}")]
    Host { code: String, message: String },

    #[error("Session {session_id}: no answer from host within {waited_ms} ms")]
    ResponseTimeout { session_id: U256, waited_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl MarketError {
    /// Stable code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            MarketError::Configuration(_) => "CONFIGURATION_ERROR",
            MarketError::UnsupportedChain(_) => "UNSUPPORTED_CHAIN",
            MarketError::ChainMismatch { .. } => "CHAIN_MISMATCH",
            MarketError::InsufficientDeposit { .. } => "INSUFFICIENT_DEPOSIT",
            MarketError::NoHostsForModel(_) => "NO_HOSTS_FOR_MODEL",
            MarketError::ModelNotApproved(_) => "MODEL_NOT_APPROVED",
            MarketError::KeyRecovery(inner) => inner.code(),
            MarketError::SessionClosed(_) => "SESSION_CLOSED",
            MarketError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            MarketError::InvalidSessionState { .. } => "INVALID_SESSION_STATE",
            MarketError::PromptInFlight(_) => "PROMPT_IN_FLIGHT",
            MarketError::CheckpointTooSmall { .. } => "CHECKPOINT_TOO_SMALL",
            MarketError::Settlement(_) => "SETTLEMENT_ERROR",
            MarketError::Contract(_) => "CONTRACT_ERROR",
            MarketError::Transport(_) => "TRANSPORT_ERROR",
            MarketError::ReconnectExhausted(_) => "RECONNECT_EXHAUSTED",
            MarketError::Encryption(_) => "ENCRYPTION_ERROR",
            MarketError::ReplayedMessage { .. } => "REPLAYED_MESSAGE",
            MarketError::Protocol(_) => "PROTOCOL_ERROR",
            MarketError::Host { .. } => "HOST_ERROR",
            MarketError::ResponseTimeout { .. } => "RESPONSE_TIMEOUT",
            MarketError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Transport failures are the only ones the reconnect policy retries
    pub fn is_transport(&self) -> bool {
        matches!(self, MarketError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, MarketError>;

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::Protocol(format!("JSON error: {}", err))
    }
}

impl From<hex::FromHexError> for MarketError {
    fn from(err: hex::FromHexError) -> Self {
        MarketError::Protocol(format!("Invalid hex format: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for MarketError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MarketError::Transport(err.to_string())
    }
}

impl From<ethers::abi::AbiError> for MarketError {
    fn from(err: ethers::abi::AbiError) -> Self {
        MarketError::Contract(format!("ABI error: {}", err))
    }
}

impl From<ethers::providers::ProviderError> for MarketError {
    fn from(err: ethers::providers::ProviderError) -> Self {
        MarketError::Contract(format!("Provider error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        let err = MarketError::ChainMismatch {
            expected: 84532,
            actual: 1,
        };
        assert_eq!(err.code(), "CHAIN_MISMATCH");
        assert!(err.to_string().contains("84532"));

        let nested: MarketError = KeyRecoveryError::NoApiUrl(Address::zero()).into();
        assert_eq!(nested.code(), "KEY_RECOVERY_NO_API_URL");
    }

    #[test]
    fn test_only_transport_is_retryable() {
        assert!(MarketError::Transport("reset".into()).is_transport());
        assert!(!MarketError::SessionClosed(U256::one()).is_transport());
        assert!(!MarketError::ResponseTimeout {
            session_id: U256::one(),
            waited_ms: 10
        }
        .is_transport());
    }
}
