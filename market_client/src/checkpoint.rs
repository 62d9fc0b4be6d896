//! Converts streamed usage into on-chain proof submissions.
//!
//! A checkpoint claims the tokens streamed since the previous one. Claims
//! below the proof system's minimum are held back unless the submission is
//! forced (session end), in which case the claim is padded up to the minimum.
//! Submissions for a session are spaced by the on-chain cool-down and never
//! overlap; different sessions submit independently.

use crate::config::CheckpointConfig;
use crate::error::{MarketError, Result};
use crate::escrow::{CheckpointSubmission, MarketplaceContract};
use crate::session::{Checkpoint, Session, SessionStatus};
use async_trait::async_trait;
use chrono::Utc;
use ethers::types::{H256, U256};
use log::{debug, info, warn};
use sha3::{Digest, Keccak256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Proof artifacts accompanying a checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofMaterial {
    pub proof_hash: H256,
    pub proof_cid: String,
    pub delta_cid: String,
}

#[async_trait]
pub trait ProofProvider: Send + Sync {
    async fn prove(
        &self,
        session_id: U256,
        from_tokens: u64,
        to_tokens: u64,
        ordinal: u64,
    ) -> Result<ProofMaterial>;
}

/// Keccak commitment over the claimed token range
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitmentProofProvider;

impl CommitmentProofProvider {
    fn commit(parts: &[&[u8]]) -> H256 {
        let mut hasher = Keccak256::new();
        for part in parts {
            hasher.update(part);
        }
        H256::from_slice(&hasher.finalize())
    }
}

#[async_trait]
impl ProofProvider for CommitmentProofProvider {
    async fn prove(
        &self,
        session_id: U256,
        from_tokens: u64,
        to_tokens: u64,
        ordinal: u64,
    ) -> Result<ProofMaterial> {
        let mut id = [0u8; 32];
        session_id.to_big_endian(&mut id);
        let proof_hash = Self::commit(&[&id, &to_tokens.to_be_bytes(), &ordinal.to_be_bytes()]);
        let delta = Self::commit(&[&id, &from_tokens.to_be_bytes(), &to_tokens.to_be_bytes()]);
        Ok(ProofMaterial {
            proof_hash,
            proof_cid: format!("{:?}", proof_hash),
            delta_cid: format!("{:?}", delta),
        })
    }
}

/// Tokens to claim for `pending`, or `CheckpointTooSmall`
pub fn plan_claim(pending: u64, forced: bool, minimum: u64) -> Result<u64> {
    if pending >= minimum {
        Ok(pending)
    } else if forced && pending > 0 {
        Ok(minimum)
    } else {
        Err(MarketError::CheckpointTooSmall { pending, minimum })
    }
}

/// Time of the last accepted submission; its lock serialises one session's submissions
type SubmissionSlot = Arc<Mutex<Option<Instant>>>;

pub struct CheckpointScheduler {
    contract: Arc<dyn MarketplaceContract>,
    proofs: Arc<dyn ProofProvider>,
    min_tokens: u64,
    cooldown: Duration,
    slots: Mutex<HashMap<U256, SubmissionSlot>>,
}

impl CheckpointScheduler {
    /// `contract` must be authenticated as the host
    pub fn new(
        contract: Arc<dyn MarketplaceContract>,
        proofs: Arc<dyn ProofProvider>,
        config: &CheckpointConfig,
    ) -> Self {
        Self {
            contract,
            proofs,
            min_tokens: config.min_tokens,
            cooldown: Duration::from_secs(config.cooldown_secs),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_tokens(&self) -> u64 {
        self.min_tokens
    }

    /// Submit a checkpoint if enough tokens are pending, or unconditionally
    /// when `forced`. Returns `None` when nothing was submitted.
    ///
    /// A failed submission leaves `last_checkpoint_tokens` untouched so the
    /// next attempt claims the full pending amount again.
    pub async fn maybe_submit(
        &self,
        session: &Mutex<Session>,
        forced: bool,
    ) -> Result<Option<Checkpoint>> {
        let slot = {
            let id = session.lock().await.session_id;
            self.slots.lock().await.entry(id).or_default().clone()
        };
        let mut last_submitted = slot.lock().await;

        let (session_id, pending, base, ordinal) = {
            let s = session.lock().await;
            if s.status.is_terminal() || s.status == SessionStatus::Created {
                let err = MarketError::InvalidSessionState {
                    session_id: s.session_id,
                    operation: "checkpoint",
                    status: s.status.to_string(),
                };
                let session_id = s.session_id;
                drop(s);
                drop(last_submitted);
                self.forget(session_id).await;
                return Err(err);
            }
            (
                s.session_id,
                s.pending_tokens(),
                s.last_checkpoint_tokens,
                s.checkpoints.len() as u64,
            )
        };

        let claim = match plan_claim(pending, forced, self.min_tokens) {
            Ok(claim) => claim,
            Err(MarketError::CheckpointTooSmall { pending, minimum }) => {
                debug!(
                    "Session {}: {} pending tokens below checkpoint minimum {}",
                    session_id, pending, minimum
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if claim != pending {
            info!(
                "Session {}: padding final checkpoint from {} to {} tokens",
                session_id, pending, claim
            );
        }

        if let Some(last) = *last_submitted {
            let ready_at = last + self.cooldown;
            if Instant::now() < ready_at {
                debug!(
                    "Session {}: waiting {:?} for proof cool-down",
                    session_id,
                    ready_at - Instant::now()
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let cumulative = base + claim;
        let proof = self
            .proofs
            .prove(session_id, base, cumulative, ordinal)
            .await?;
        let submission = CheckpointSubmission {
            session_id,
            tokens_claimed: claim,
            proof_hash: proof.proof_hash,
            proof_cid: proof.proof_cid,
            delta_cid: proof.delta_cid.clone(),
        };

        {
            let mut s = session.lock().await;
            if s.status == SessionStatus::Active {
                s.transition(SessionStatus::Checkpointing)?;
            }
        }
        let result = self.contract.submit_checkpoint(&submission).await;

        let mut s = session.lock().await;
        if s.status == SessionStatus::Checkpointing {
            s.transition(SessionStatus::Active)?;
        }
        let tx_hash = match result {
            Ok(tx_hash) => tx_hash,
            Err(e) => {
                warn!("Checkpoint for session {} failed: {}", session_id, e);
                return Err(e);
            }
        };

        s.last_checkpoint_tokens = cumulative;
        // Padding is billed, so it counts as streamed
        if s.total_tokens_streamed < cumulative {
            s.total_tokens_streamed = cumulative;
        }
        let checkpoint = Checkpoint {
            proof_hash: submission.proof_hash,
            tokens_claimed: claim,
            timestamp: Utc::now(),
            verified: true,
            delta_cid: proof.delta_cid,
            tx_hash,
        };
        s.checkpoints.push(checkpoint.clone());
        *last_submitted = Some(Instant::now());

        info!(
            "📍 Checkpoint {} for session {}: {} tokens (cumulative {})",
            ordinal, session_id, claim, cumulative
        );
        Ok(Some(checkpoint))
    }

    /// Forget cool-down state of a finished session
    pub async fn forget(&self, session_id: U256) {
        self.slots.lock().await.remove(&session_id);
    }

    /// Sessions with cool-down state
    pub async fn tracked_sessions(&self) -> usize {
        self.slots.lock().await.len()
    }
}
