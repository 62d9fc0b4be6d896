//! In-process marketplace, used for local simulation and tests.
//!
//! Mirrors the contract rules the client depends on: deposit accounting,
//! allowance checks for direct token payment, host-only checkpoint submission
//! with a cool-down, and 90/10 settlement with refund of unclaimed escrow.

use super::pricing::{split_settlement, token_cost};
use super::{
    model_id, CheckpointSubmission, EscrowBalance, HostRegistry, JobStatus, MarketplaceContract,
    PaymentToken, SessionJobInfo, SessionJobParams,
};
use crate::discovery::HostRecord;
use crate::error::{MarketError, Result};
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Minimum tokens the proof system accepts in one checkpoint
pub const CONTRACT_MIN_PROVEN_TOKENS: u64 = 100;

#[derive(Debug, Clone)]
struct SessionJob {
    info: SessionJobInfo,
    from_deposit: bool,
    last_proof_at: Option<Instant>,
    proofs: Vec<CheckpointSubmission>,
}

#[derive(Debug, Clone)]
struct RegisteredHost {
    record: HostRecord,
    model_prices: HashMap<(H256, PaymentToken), U256>,
}

#[derive(Default)]
struct Ledger {
    wallets: HashMap<(Address, PaymentToken), U256>,
    deposits: HashMap<(Address, PaymentToken), U256>,
    allowances: HashMap<(Address, Address), U256>,
    sessions: HashMap<U256, SessionJob>,
    hosts: HashMap<Address, RegisteredHost>,
    approved_models: HashSet<H256>,
    next_job_id: u64,
    tx_counter: u64,
}

impl Ledger {
    fn next_tx(&mut self) -> H256 {
        self.tx_counter += 1;
        H256::from_slice(&Keccak256::digest(self.tx_counter.to_be_bytes()))
    }

    fn wallet(&self, who: Address, token: PaymentToken) -> U256 {
        self.wallets.get(&(who, token)).copied().unwrap_or_default()
    }

    fn debit_wallet(&mut self, who: Address, token: PaymentToken, amount: U256) -> Result<()> {
        let balance = self.wallet(who, token);
        if balance < amount {
            return Err(revert("insufficient wallet balance"));
        }
        self.wallets.insert((who, token), balance - amount);
        Ok(())
    }

    fn credit_wallet(&mut self, who: Address, token: PaymentToken, amount: U256) {
        *self.wallets.entry((who, token)).or_default() += amount;
    }

    fn spend_allowance(&mut self, owner: Address, token: PaymentToken, amount: U256) -> Result<()> {
        if let PaymentToken::Erc20(address) = token {
            let allowance = self
                .allowances
                .get(&(owner, address))
                .copied()
                .unwrap_or_default();
            if allowance < amount {
                return Err(revert("ERC20: insufficient allowance"));
            }
            self.allowances.insert((owner, address), allowance - amount);
        }
        Ok(())
    }

    fn locked(&self, who: Address, token: PaymentToken) -> U256 {
        self.sessions
            .values()
            .filter(|s| {
                s.from_deposit
                    && s.info.requester == who
                    && s.info.payment_token == token
                    && s.info.status == JobStatus::Active
            })
            .fold(U256::zero(), |acc, s| acc + s.info.deposit)
    }
}

fn revert(reason: &str) -> MarketError {
    MarketError::Contract(format!("execution reverted: {}", reason))
}

/// Shared chain state; hand out caller-bound handles with [`InMemoryChain::connect`]
pub struct InMemoryChain {
    chain_id: u64,
    stable_token: Address,
    treasury: Address,
    proof_cooldown: Duration,
    ledger: Mutex<Ledger>,
}

impl InMemoryChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            stable_token: Address::from_low_u64_be(0x05dc),
            treasury: Address::from_low_u64_be(0x7ea5),
            proof_cooldown: Duration::ZERO,
            ledger: Mutex::new(Ledger {
                next_job_id: 1,
                ..Ledger::default()
            }),
        }
    }

    /// Require this much time between two checkpoints of a session
    pub fn with_proof_cooldown(mut self, cooldown: Duration) -> Self {
        self.proof_cooldown = cooldown;
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn stable_token(&self) -> Address {
        self.stable_token
    }

    pub fn treasury(&self) -> Address {
        self.treasury
    }

    /// Contract handle whose calls are authenticated as `caller`
    pub fn connect(self: &Arc<Self>, caller: Address) -> InMemoryMarketplace {
        InMemoryMarketplace {
            chain: self.clone(),
            caller,
            chain_id_override: None,
        }
    }

    pub fn fund_wallet(&self, who: Address, token: PaymentToken, amount: U256) {
        self.ledger().credit_wallet(who, token, amount);
    }

    pub fn wallet_balance(&self, who: Address, token: PaymentToken) -> U256 {
        self.ledger().wallet(who, token)
    }

    pub fn approve_model(&self, model: &str) {
        self.ledger().approved_models.insert(model_id(model));
    }

    /// Register a host; `model_prices` keys are model specs
    pub fn register_host(&self, record: HostRecord, model_prices: &[(&str, PaymentToken, U256)]) {
        let prices = model_prices
            .iter()
            .map(|(model, token, price)| ((model_id(model), *token), *price))
            .collect();
        self.ledger().hosts.insert(
            record.address,
            RegisteredHost {
                record,
                model_prices: prices,
            },
        );
    }

    pub fn set_host_active(&self, host: Address, active: bool) {
        if let Some(entry) = self.ledger().hosts.get_mut(&host) {
            entry.record.active = active;
        }
    }

    /// Checkpoints accepted so far for a session
    pub fn proofs(&self, job_id: U256) -> Vec<CheckpointSubmission> {
        self.ledger()
            .sessions
            .get(&job_id)
            .map(|s| s.proofs.clone())
            .unwrap_or_default()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        // A poisoned lock only means a test thread panicked mid-call
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Caller-bound view of an [`InMemoryChain`]
#[derive(Clone)]
pub struct InMemoryMarketplace {
    chain: Arc<InMemoryChain>,
    caller: Address,
    chain_id_override: Option<u64>,
}

impl InMemoryMarketplace {
    /// Pretend the signer wallet sits on another chain
    pub fn on_chain(mut self, chain_id: u64) -> Self {
        self.chain_id_override = Some(chain_id);
        self
    }

    pub fn chain(&self) -> Arc<InMemoryChain> {
        self.chain.clone()
    }
}

#[async_trait]
impl MarketplaceContract for InMemoryMarketplace {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.chain_id_override.unwrap_or(self.chain.chain_id))
    }

    fn signer_address(&self) -> Address {
        self.caller
    }

    async fn deposit(&self, token: PaymentToken, amount: U256) -> Result<H256> {
        let mut ledger = self.chain.ledger();
        ledger.spend_allowance(self.caller, token, amount)?;
        ledger.debit_wallet(self.caller, token, amount)?;
        *ledger.deposits.entry((self.caller, token)).or_default() += amount;
        Ok(ledger.next_tx())
    }

    async fn withdraw(&self, token: PaymentToken, amount: U256) -> Result<H256> {
        let mut ledger = self.chain.ledger();
        let free = ledger
            .deposits
            .get(&(self.caller, token))
            .copied()
            .unwrap_or_default();
        if free < amount {
            return Err(revert("insufficient deposit"));
        }
        ledger.deposits.insert((self.caller, token), free - amount);
        ledger.credit_wallet(self.caller, token, amount);
        Ok(ledger.next_tx())
    }

    async fn deposit_balance(&self, depositor: Address, token: PaymentToken) -> Result<EscrowBalance> {
        let ledger = self.chain.ledger();
        let free = ledger
            .deposits
            .get(&(depositor, token))
            .copied()
            .unwrap_or_default();
        let locked = ledger.locked(depositor, token);
        Ok(EscrowBalance {
            token,
            total: free + locked,
            locked,
        })
    }

    async fn token_allowance(&self, owner: Address, token: Address) -> Result<U256> {
        let ledger = self.chain.ledger();
        Ok(ledger
            .allowances
            .get(&(owner, token))
            .copied()
            .unwrap_or_default())
    }

    async fn approve_token(&self, token: Address, amount: U256) -> Result<H256> {
        let mut ledger = self.chain.ledger();
        ledger.allowances.insert((self.caller, token), amount);
        Ok(ledger.next_tx())
    }

    async fn create_session_job(&self, params: &SessionJobParams) -> Result<U256> {
        let mut ledger = self.chain.ledger();
        if params.deposit.is_zero() {
            return Err(revert("zero deposit"));
        }

        if params.use_deposit {
            let key = (self.caller, params.payment_token);
            let free = ledger.deposits.get(&key).copied().unwrap_or_default();
            if free < params.deposit {
                return Err(revert("insufficient deposit"));
            }
            ledger.deposits.insert(key, free - params.deposit);
        } else {
            ledger.spend_allowance(self.caller, params.payment_token, params.deposit)?;
            ledger.debit_wallet(self.caller, params.payment_token, params.deposit)?;
        }

        let job_id = U256::from(ledger.next_job_id);
        ledger.next_job_id += 1;
        ledger.sessions.insert(
            job_id,
            SessionJob {
                info: SessionJobInfo {
                    job_id,
                    requester: self.caller,
                    host: params.host,
                    payment_token: params.payment_token,
                    deposit: params.deposit,
                    price_per_token: params.price_per_token,
                    proof_interval: params.proof_interval,
                    tokens_proven: 0,
                    status: JobStatus::Active,
                },
                from_deposit: params.use_deposit,
                last_proof_at: None,
                proofs: Vec::new(),
            },
        );
        Ok(job_id)
    }

    async fn submit_checkpoint(&self, submission: &CheckpointSubmission) -> Result<H256> {
        let cooldown = self.chain.proof_cooldown;
        let mut ledger = self.chain.ledger();
        let session = ledger
            .sessions
            .get_mut(&submission.session_id)
            .ok_or_else(|| revert("unknown session"))?;

        if session.info.host != self.caller {
            return Err(revert("only host"));
        }
        if session.info.status != JobStatus::Active {
            return Err(revert("session not active"));
        }
        if submission.tokens_claimed < CONTRACT_MIN_PROVEN_TOKENS {
            return Err(revert("below minimum proven tokens"));
        }
        let now = Instant::now();
        if let Some(last) = session.last_proof_at {
            if now.duration_since(last) < cooldown {
                return Err(revert("proof submitted too soon"));
            }
        }

        let proven = session.info.tokens_proven + submission.tokens_claimed;
        if token_cost(session.info.price_per_token, proven) > session.info.deposit {
            return Err(revert("claim exceeds deposit"));
        }

        session.info.tokens_proven = proven;
        session.last_proof_at = Some(now);
        session.proofs.push(submission.clone());
        Ok(ledger.next_tx())
    }

    async fn complete_session(
        &self,
        session_id: U256,
        _final_tokens: u64,
        _final_proof: &str,
    ) -> Result<H256> {
        let treasury = self.chain.treasury;
        let mut ledger = self.chain.ledger();
        let session = ledger
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| MarketError::Settlement(format!("unknown session {}", session_id)))?;

        if self.caller != session.info.requester && self.caller != session.info.host {
            return Err(MarketError::Settlement("caller is not a session party".into()));
        }
        if session.info.status != JobStatus::Active {
            return Err(MarketError::Settlement(format!(
                "session {} already {:?}",
                session_id, session.info.status
            )));
        }

        session.info.status = JobStatus::Completed;
        let info = session.info.clone();
        let from_deposit = session.from_deposit;

        let claimed = token_cost(info.price_per_token, info.tokens_proven);
        let split = split_settlement(info.deposit, claimed);
        ledger.credit_wallet(info.host, info.payment_token, split.host);
        ledger.credit_wallet(treasury, info.payment_token, split.treasury);
        if from_deposit {
            *ledger
                .deposits
                .entry((info.requester, info.payment_token))
                .or_default() += split.refund;
        } else {
            ledger.credit_wallet(info.requester, info.payment_token, split.refund);
        }
        Ok(ledger.next_tx())
    }

    async fn session_job(&self, job_id: U256) -> Result<SessionJobInfo> {
        self.chain
            .ledger()
            .sessions
            .get(&job_id)
            .map(|s| s.info.clone())
            .ok_or_else(|| revert("unknown session"))
    }

    async fn is_model_approved(&self, model_id: H256) -> Result<bool> {
        Ok(self.chain.ledger().approved_models.contains(&model_id))
    }
}

#[async_trait]
impl HostRegistry for InMemoryMarketplace {
    async fn active_hosts(&self) -> Result<Vec<Address>> {
        let ledger = self.chain.ledger();
        let mut hosts: Vec<Address> = ledger
            .hosts
            .values()
            .filter(|h| h.record.active)
            .map(|h| h.record.address)
            .collect();
        hosts.sort();
        Ok(hosts)
    }

    async fn host_info(&self, host: Address) -> Result<HostRecord> {
        self.chain
            .ledger()
            .hosts
            .get(&host)
            .map(|h| h.record.clone())
            .ok_or_else(|| MarketError::Contract(format!("host {:?} not registered", host)))
    }

    async fn model_pricing(&self, host: Address, model_id: H256, token: PaymentToken) -> Result<U256> {
        let ledger = self.chain.ledger();
        let entry = ledger
            .hosts
            .get(&host)
            .ok_or_else(|| MarketError::Contract(format!("host {:?} not registered", host)))?;
        if let Some(price) = entry.model_prices.get(&(model_id, token)) {
            return Ok(*price);
        }
        Ok(match token {
            PaymentToken::Native => entry.record.min_price_native,
            PaymentToken::Erc20(_) => entry.record.min_price_stable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(host: Address, deposit: u64) -> SessionJobParams {
        SessionJobParams {
            host,
            price_per_token: U256::from(2000u64),
            duration_secs: 3600,
            proof_interval: 100,
            deposit: U256::from(deposit),
            payment_token: PaymentToken::Native,
            use_deposit: false,
        }
    }

    #[tokio::test]
    async fn test_only_host_may_checkpoint() {
        let chain = Arc::new(InMemoryChain::new(31337));
        let user = Address::repeat_byte(1);
        let host = Address::repeat_byte(2);
        chain.fund_wallet(user, PaymentToken::Native, U256::from(1_000_000u64));
        let job = chain
            .connect(user)
            .create_session_job(&params(host, 1_000_000))
            .await
            .unwrap();

        let submission = CheckpointSubmission {
            session_id: job,
            tokens_claimed: 200,
            proof_hash: H256::zero(),
            proof_cid: String::new(),
            delta_cid: String::new(),
        };
        assert!(chain.connect(user).submit_checkpoint(&submission).await.is_err());
        assert!(chain.connect(host).submit_checkpoint(&submission).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_enforced() {
        let chain = Arc::new(InMemoryChain::new(31337).with_proof_cooldown(Duration::from_secs(10)));
        let user = Address::repeat_byte(1);
        let host = Address::repeat_byte(2);
        chain.fund_wallet(user, PaymentToken::Native, U256::from(1_000_000u64));
        let job = chain
            .connect(user)
            .create_session_job(&params(host, 1_000_000))
            .await
            .unwrap();
        let submission = CheckpointSubmission {
            session_id: job,
            tokens_claimed: 100,
            proof_hash: H256::zero(),
            proof_cid: String::new(),
            delta_cid: String::new(),
        };
        let host_handle = chain.connect(host);
        host_handle.submit_checkpoint(&submission).await.unwrap();
        assert!(host_handle.submit_checkpoint(&submission).await.is_err());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(host_handle.submit_checkpoint(&submission).await.is_ok());
    }

    #[tokio::test]
    async fn test_completion_refunds_unclaimed() {
        let chain = Arc::new(InMemoryChain::new(31337));
        let user = Address::repeat_byte(1);
        let host = Address::repeat_byte(2);
        chain.fund_wallet(user, PaymentToken::Native, U256::from(10_000u64));
        let job = chain
            .connect(user)
            .create_session_job(&params(host, 10_000))
            .await
            .unwrap();
        chain
            .connect(user)
            .complete_session(job, 0, "")
            .await
            .unwrap();
        assert_eq!(chain.wallet_balance(user, PaymentToken::Native), U256::from(10_000u64));
        assert!(chain.connect(user).complete_session(job, 0, "").await.is_err());
    }
}
