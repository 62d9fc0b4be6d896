//! Session state and the streaming exchange protocol.

pub mod message;
pub mod protocol;
pub mod resolver;
pub mod store;
pub mod transport;

use crate::collaborators::ConversationMessage;
use crate::crypto::SessionKey;
use crate::error::{MarketError, Result};
use crate::escrow::PaymentToken;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use protocol::{PromptOptions, SessionProtocol, StartSessionRequest};
pub use resolver::{PromptOutcome, PromptResolver, Step};
pub use store::{SessionHandle, SessionStore};
pub use transport::{ChannelConnector, Connector, Transport, WebSocketConnector};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Created,
    Active,
    Checkpointing,
    Ending,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle step
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Created, Active) => true,
            (Active, Checkpointing) | (Checkpointing, Active) => true,
            (Active, Ending) | (Checkpointing, Ending) => true,
            (Ending, Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A proof unit accepted on chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub proof_hash: H256,
    pub tokens_claimed: u64,
    pub timestamp: DateTime<Utc>,
    pub verified: bool,
    pub delta_cid: String,
    pub tx_hash: H256,
}

/// Usage of a single prompt exchange
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageInfo {
    pub llm_tokens: u64,
    pub vlm_tokens: u64,
    pub image_gen_tokens: u64,
    pub total_tokens: u64,
}

/// One rental of a host's inference capacity
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: U256,
    pub job_id: U256,
    pub chain_id: u64,
    pub requester: Address,
    pub host_address: Address,
    pub model: String,
    pub status: SessionStatus,
    pub price_per_token: U256,
    pub proof_interval: u64,
    pub duration_secs: u64,
    pub payment_token: PaymentToken,
    pub encryption_enabled: bool,
    pub session_key: Option<SessionKey>,
    /// Next outbound message index
    pub message_index: u64,
    /// Highest inbound index accepted so far
    pub last_inbound_index: Option<u64>,
    pub total_tokens_streamed: u64,
    pub last_checkpoint_tokens: u64,
    pub checkpoints: Vec<Checkpoint>,
    pub conversation: Vec<ConversationMessage>,
    pub created_at: DateTime<Utc>,
    /// Completion transaction once the escrow has been released
    pub settlement_tx: Option<H256>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: U256,
        chain_id: u64,
        requester: Address,
        host_address: Address,
        model: impl Into<String>,
        price_per_token: U256,
        proof_interval: u64,
        duration_secs: u64,
        payment_token: PaymentToken,
        session_key: Option<SessionKey>,
    ) -> Self {
        Self {
            session_id: job_id,
            job_id,
            chain_id,
            requester,
            host_address,
            model: model.into(),
            status: SessionStatus::Created,
            price_per_token,
            proof_interval,
            duration_secs,
            payment_token,
            encryption_enabled: session_key.is_some(),
            session_key,
            message_index: 0,
            last_inbound_index: None,
            total_tokens_streamed: 0,
            last_checkpoint_tokens: 0,
            checkpoints: Vec::new(),
            conversation: Vec::new(),
            created_at: Utc::now(),
            settlement_tx: None,
        }
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MarketError::InvalidSessionState {
                session_id: self.session_id,
                operation: "transition",
                status: format!("{} -> {}", self.status, next),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Index for the next outbound message; never hands out the same value twice
    pub fn next_message_index(&mut self) -> u64 {
        let index = self.message_index;
        self.message_index += 1;
        index
    }

    /// Accept an inbound index only if it is above every index seen before
    pub fn accept_inbound_index(&mut self, index: u64) -> Result<()> {
        if let Some(last_seen) = self.last_inbound_index {
            if index <= last_seen {
                return Err(MarketError::ReplayedMessage { index, last_seen });
            }
        }
        self.last_inbound_index = Some(index);
        Ok(())
    }

    /// Add a prompt's usage to the running total; the total never wraps
    pub fn record_usage(&mut self, usage: &TokenUsageInfo) -> Result<()> {
        self.total_tokens_streamed = self
            .total_tokens_streamed
            .checked_add(usage.total_tokens)
            .ok_or_else(|| {
                MarketError::Protocol(format!(
                    "session {} token total overflows after {} more tokens",
                    self.session_id, usage.total_tokens
                ))
            })?;
        Ok(())
    }

    /// Streamed tokens not yet covered by a checkpoint
    pub fn pending_tokens(&self) -> u64 {
        self.total_tokens_streamed
            .saturating_sub(self.last_checkpoint_tokens)
    }

    pub fn tokens_proven(&self) -> u64 {
        self.checkpoints.iter().map(|c| c.tokens_claimed).sum()
    }

    /// Terminal and nothing left locked on chain
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal() && self.settlement_tx.is_some()
    }
}
