pub mod encryption;
pub mod key_recovery;

pub use encryption::{open_from_client, seal_to_host, EncryptedPayload, SealedEnvelope, SessionKey};
pub use key_recovery::{
    address_from_key, challenge_message_hash, recover_host_public_key, ChallengeClient,
    ChallengeResponse, HostKeyResolver, HttpChallengeClient,
};
