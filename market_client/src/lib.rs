//! Client for renting metered LLM inference from a marketplace of hosts.
//!
//! Funds are escrowed on chain per session job, prompts and responses travel
//! over an optionally encrypted duplex channel, and streamed usage is turned
//! into checkpoints that settle against the escrow.

pub mod checkpoint;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod escrow;
pub mod session;

pub use checkpoint::{CheckpointScheduler, CommitmentProofProvider, ProofProvider};
pub use config::MarketConfig;
pub use discovery::{HostDiscovery, HostRecord, HostRequirements};
pub use error::{KeyRecoveryError, MarketError, Result};
pub use escrow::{EscrowLedger, MarketplaceContract, PaymentToken, PRICE_PRECISION};
pub use session::{
    PromptOptions, PromptOutcome, Session, SessionProtocol, SessionStatus, StartSessionRequest,
    TokenUsageInfo,
};
