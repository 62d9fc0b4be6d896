//! Escrow ledger: deposits, withdrawals and session-job settlement routed
//! through the on-chain marketplace contract.
//!
//! The client never mutates balances itself. It observes them through
//! [`MarketplaceContract::deposit_balance`] and requests mutations through the
//! contract calls wrapped by [`EscrowLedger`].

pub mod ethers_backend;
pub mod memory;
pub mod pricing;

use crate::config::MarketConfig;
use crate::discovery::HostRecord;
use crate::error::{MarketError, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::sync::Arc;

pub use ethers_backend::EthersMarketplace;
pub use memory::{InMemoryChain, InMemoryMarketplace};
pub use pricing::{actual_cost, split_settlement, token_cost, SettlementSplit, PRICE_PRECISION};

/// Escrow denomination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentToken {
    Native,
    Erc20(Address),
}

impl PaymentToken {
    /// Address used in contract calls; the native token is the zero address
    pub fn address(&self) -> Address {
        match self {
            PaymentToken::Native => Address::zero(),
            PaymentToken::Erc20(address) => *address,
        }
    }

    pub fn from_address(address: Address) -> Self {
        if address.is_zero() {
            PaymentToken::Native
        } else {
            PaymentToken::Erc20(address)
        }
    }
}

/// Per-depositor, per-token escrow balance as observed on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowBalance {
    pub token: PaymentToken,
    pub total: U256,
    pub locked: U256,
}

impl EscrowBalance {
    pub fn available(&self) -> U256 {
        self.total.saturating_sub(self.locked)
    }
}

/// Arguments of a session-job creation call, after defaults are applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionJobParams {
    pub host: Address,
    pub price_per_token: U256,
    pub duration_secs: u64,
    pub proof_interval: u64,
    pub deposit: U256,
    pub payment_token: PaymentToken,
    pub use_deposit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointSubmission {
    pub session_id: U256,
    pub tokens_claimed: u64,
    pub proof_hash: H256,
    pub proof_cid: String,
    pub delta_cid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Active,
    Completed,
    Cancelled,
}

/// On-chain view of a session job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionJobInfo {
    pub job_id: U256,
    pub requester: Address,
    pub host: Address,
    pub payment_token: PaymentToken,
    pub deposit: U256,
    pub price_per_token: U256,
    pub proof_interval: u64,
    pub tokens_proven: u64,
    pub status: JobStatus,
}

/// Marketplace functions consumed by the client
#[async_trait]
pub trait MarketplaceContract: Send + Sync {
    /// Chain the signer is currently connected to
    async fn chain_id(&self) -> Result<u64>;

    /// Identity calls are authenticated as
    fn signer_address(&self) -> Address;

    async fn deposit(&self, token: PaymentToken, amount: U256) -> Result<H256>;

    async fn withdraw(&self, token: PaymentToken, amount: U256) -> Result<H256>;

    async fn deposit_balance(&self, depositor: Address, token: PaymentToken)
        -> Result<EscrowBalance>;

    /// ERC-20 allowance granted by `owner` to the marketplace
    async fn token_allowance(&self, owner: Address, token: Address) -> Result<U256>;

    async fn approve_token(&self, token: Address, amount: U256) -> Result<H256>;

    /// Returns the job id of the new session
    async fn create_session_job(&self, params: &SessionJobParams) -> Result<U256>;

    async fn submit_checkpoint(&self, submission: &CheckpointSubmission) -> Result<H256>;

    async fn complete_session(
        &self,
        session_id: U256,
        final_tokens: u64,
        final_proof: &str,
    ) -> Result<H256>;

    async fn session_job(&self, job_id: U256) -> Result<SessionJobInfo>;

    async fn is_model_approved(&self, model_id: H256) -> Result<bool>;
}

/// Read access to the host registry
#[async_trait]
pub trait HostRegistry: Send + Sync {
    async fn active_hosts(&self) -> Result<Vec<Address>>;

    async fn host_info(&self, host: Address) -> Result<HostRecord>;

    /// Price for `model_id` in `token`, falling back to the host minimum
    async fn model_pricing(&self, host: Address, model_id: H256, token: PaymentToken)
        -> Result<U256>;
}

/// `keccak256(model)`, the on-chain identifier of a model spec such as
/// `"org/repo:model-q4.gguf"`
pub fn model_id(model: &str) -> H256 {
    H256::from_slice(&Keccak256::digest(model.as_bytes()))
}

/// Caller-facing request; unset pricing terms take configured defaults
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub chain_id: u64,
    pub host: Address,
    pub price_per_token: Option<U256>,
    pub duration_secs: Option<u64>,
    pub proof_interval: Option<u64>,
    pub deposit: U256,
    pub payment_token: PaymentToken,
    pub use_deposit: bool,
}

/// Wrapper validating and routing escrow operations to the contract
pub struct EscrowLedger {
    contract: Arc<dyn MarketplaceContract>,
    config: MarketConfig,
}

impl EscrowLedger {
    pub fn new(contract: Arc<dyn MarketplaceContract>, config: MarketConfig) -> Self {
        Self { contract, config }
    }

    pub fn contract(&self) -> Arc<dyn MarketplaceContract> {
        self.contract.clone()
    }

    pub fn signer(&self) -> Address {
        self.contract.signer_address()
    }

    pub fn stable_token(&self) -> PaymentToken {
        PaymentToken::from_address(self.config.chain.contracts.stable_token)
    }

    /// Fail unless the signer is on `expected`. Chains are never switched
    /// on the caller's behalf.
    pub async fn ensure_chain(&self, expected: u64) -> Result<()> {
        let actual = self.contract.chain_id().await?;
        if actual != expected {
            return Err(MarketError::ChainMismatch { expected, actual });
        }
        Ok(())
    }

    pub async fn deposit_native(&self, amount: U256) -> Result<H256> {
        self.deposit(PaymentToken::Native, amount).await
    }

    pub async fn deposit_token(&self, amount: U256) -> Result<H256> {
        let token = self.require_stable_token()?;
        self.ensure_allowance(token, amount).await?;
        self.deposit(PaymentToken::Erc20(token), amount).await
    }

    pub async fn withdraw_native(&self, amount: U256) -> Result<H256> {
        self.withdraw(PaymentToken::Native, amount).await
    }

    pub async fn withdraw_token(&self, amount: U256) -> Result<H256> {
        let token = self.require_stable_token()?;
        self.withdraw(PaymentToken::Erc20(token), amount).await
    }

    async fn deposit(&self, token: PaymentToken, amount: U256) -> Result<H256> {
        self.ensure_chain(self.config.chain.chain_id).await?;
        let tx = self.contract.deposit(token, amount).await?;
        info!("💰 Deposited {} ({:?}) in tx {:?}", amount, token, tx);
        Ok(tx)
    }

    async fn withdraw(&self, token: PaymentToken, amount: U256) -> Result<H256> {
        self.ensure_chain(self.config.chain.chain_id).await?;
        let balance = self.balance(token).await?;
        if balance.available() < amount {
            return Err(MarketError::InsufficientDeposit {
                required: amount,
                available: balance.available(),
            });
        }
        let tx = self.contract.withdraw(token, amount).await?;
        info!("Withdrew {} ({:?}) in tx {:?}", amount, token, tx);
        Ok(tx)
    }

    pub async fn balance(&self, token: PaymentToken) -> Result<EscrowBalance> {
        self.contract
            .deposit_balance(self.contract.signer_address(), token)
            .await
    }

    pub async fn ensure_model_approved(&self, model: &str) -> Result<()> {
        if self.contract.is_model_approved(model_id(model)).await? {
            Ok(())
        } else {
            Err(MarketError::ModelNotApproved(model.to_string()))
        }
    }

    /// Apply defaults to a request and check it can be funded
    pub fn resolve_params(&self, request: &CreateSessionRequest) -> Result<SessionJobParams> {
        let defaults = &self.config.session;
        let params = SessionJobParams {
            host: request.host,
            price_per_token: request
                .price_per_token
                .unwrap_or_else(|| self.config.default_price()),
            duration_secs: request.duration_secs.unwrap_or(defaults.duration_secs),
            proof_interval: request.proof_interval.unwrap_or(defaults.proof_interval),
            deposit: request.deposit,
            payment_token: request.payment_token,
            use_deposit: request.use_deposit,
        };

        if params.host.is_zero() {
            return Err(MarketError::Configuration("host address is zero".into()));
        }

        let required = actual_cost(params.price_per_token, params.proof_interval);
        if params.deposit < required {
            return Err(MarketError::InsufficientDeposit {
                required,
                available: params.deposit,
            });
        }
        Ok(params)
    }

    /// Lock escrow for a new session and return its job id
    pub async fn create_session_job(&self, request: &CreateSessionRequest) -> Result<U256> {
        self.ensure_chain(request.chain_id).await?;
        let params = self.resolve_params(request)?;

        if params.use_deposit {
            let balance = self.balance(params.payment_token).await?;
            if balance.available() < params.deposit {
                return Err(MarketError::InsufficientDeposit {
                    required: params.deposit,
                    available: balance.available(),
                });
            }
        } else if let PaymentToken::Erc20(token) = params.payment_token {
            self.ensure_allowance(token, params.deposit).await?;
        }

        let job_id = self.contract.create_session_job(&params).await?;
        info!(
            "📝 Session job {} created with host {:?} at price {} (interval {})",
            job_id, params.host, params.price_per_token, params.proof_interval
        );
        Ok(job_id)
    }

    pub async fn submit_checkpoint(&self, submission: &CheckpointSubmission) -> Result<H256> {
        let tx = self.contract.submit_checkpoint(submission).await?;
        debug!(
            "Checkpoint for session {} ({} tokens) in tx {:?}",
            submission.session_id, submission.tokens_claimed, tx
        );
        Ok(tx)
    }

    /// Settle a session: 90% to the host, 10% to treasury, rest refunded
    pub async fn complete_session(
        &self,
        session_id: U256,
        final_tokens: u64,
        final_proof: &str,
    ) -> Result<H256> {
        match self
            .contract
            .complete_session(session_id, final_tokens, final_proof)
            .await
        {
            Ok(tx) => {
                info!("✅ Session {} settled in tx {:?}", session_id, tx);
                Ok(tx)
            }
            Err(MarketError::Settlement(reason)) => Err(MarketError::Settlement(reason)),
            Err(e) => {
                warn!("Completion of session {} failed: {}", session_id, e);
                Err(MarketError::Settlement(e.to_string()))
            }
        }
    }

    fn require_stable_token(&self) -> Result<Address> {
        let token = self.config.chain.contracts.stable_token;
        if token.is_zero() {
            return Err(MarketError::Configuration(
                "stable token address not configured".into(),
            ));
        }
        Ok(token)
    }

    async fn ensure_allowance(&self, token: Address, amount: U256) -> Result<()> {
        let owner = self.contract.signer_address();
        let allowance = self.contract.token_allowance(owner, token).await?;
        if allowance < amount {
            debug!("Approving {} of token {:?} (allowance {})", amount, token, allowance);
            self.contract.approve_token(token, amount).await?;
        }
        Ok(())
    }
}
