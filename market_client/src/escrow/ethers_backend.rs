//! Marketplace contract access over JSON-RPC using ethers-rs.
//!
//! Calls are ABI-encoded against human-readable signatures and sent through a
//! `SignerMiddleware`; state-changing calls wait for the configured number of
//! confirmations before returning.

use super::{
    CheckpointSubmission, EscrowBalance, HostRegistry, JobStatus, MarketplaceContract,
    PaymentToken, SessionJobInfo, SessionJobParams,
};
use crate::config::MarketConfig;
use crate::discovery::{HostMetadata, HostRecord};
use crate::error::{MarketError, Result};
use async_trait::async_trait;
use ethers::abi::{Detokenize, Tokenize};
use ethers::contract::BaseContract;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, TransactionRequest, H256, U256};
use log::{debug, info};
use std::convert::TryFrom;
use std::sync::Arc;

type Client = SignerMiddleware<Provider<Http>, LocalWallet>;

const MARKETPLACE_ABI: &[&str] = &[
    "function depositNative() payable",
    "function depositToken(address token, uint256 amount)",
    "function withdrawNative(uint256 amount)",
    "function withdrawToken(address token, uint256 amount)",
    "function getDepositBalance(address depositor, address token) view returns (uint256, uint256)",
    "function createSessionJob(address host, uint256 pricePerToken, uint256 maxDuration, uint256 proofInterval) payable returns (uint256)",
    "function createSessionJobWithToken(address host, address token, uint256 deposit, uint256 pricePerToken, uint256 maxDuration, uint256 proofInterval) returns (uint256)",
    "function createSessionFromDeposit(address host, address paymentToken, uint256 deposit, uint256 pricePerToken, uint256 maxDuration, uint256 proofInterval) returns (uint256)",
    "function submitProofOfWork(uint256 jobId, uint256 tokensClaimed, bytes32 proofHash, string proofCID, string deltaCID)",
    "function completeSessionJob(uint256 jobId, uint256 finalTokens, string finalProof)",
    "function sessionJobs(uint256 jobId) view returns (uint256, address, address, address, uint256, uint256, uint256, uint256, uint8)",
    "event SessionJobCreated(uint256 indexed jobId, address indexed requester, address indexed host, uint256 deposit)",
];

const REGISTRY_ABI: &[&str] = &[
    "function getAllActiveNodes() view returns (address[])",
    "function getNodeFullInfo(address operator) view returns (address, uint256, bool, string, string, bytes32[], uint256, uint256)",
    "function getModelPricing(address operator, bytes32 modelId, address token) view returns (uint256)",
];

const MODEL_REGISTRY_ABI: &[&str] = &["function isModelApproved(bytes32 modelId) view returns (bool)"];

const ERC20_ABI: &[&str] = &[
    "function allowance(address owner, address spender) view returns (uint256)",
    "function approve(address spender, uint256 amount) returns (bool)",
];

type NodeInfo = (Address, U256, bool, String, String, Vec<H256>, U256, U256);
type JobTuple = (U256, Address, Address, Address, U256, U256, U256, U256, u8);

fn load_abi(signatures: &[&str]) -> Result<BaseContract> {
    let abi = ethers::abi::parse_abi(signatures)
        .map_err(|e| MarketError::Configuration(format!("ABI parse: {}", e)))?;
    Ok(BaseContract::from(abi))
}

/// Live marketplace reached through an RPC endpoint
pub struct EthersMarketplace {
    client: Arc<Client>,
    marketplace: BaseContract,
    registry: BaseContract,
    model_registry: BaseContract,
    erc20: BaseContract,
    marketplace_address: Address,
    registry_address: Address,
    model_registry_address: Address,
    confirmations: usize,
}

impl EthersMarketplace {
    /// Connect using the configured RPC URL and signer key
    pub async fn connect(config: &MarketConfig) -> Result<Self> {
        config.validate()?;
        let provider = Provider::<Http>::try_from(config.chain.rpc_url.as_str())
            .map_err(|e| MarketError::Configuration(format!("invalid RPC URL: {}", e)))?;

        let key = config
            .private_key
            .as_deref()
            .ok_or_else(|| MarketError::Configuration("private key not configured".into()))?;

        let chain_id = provider.get_chainid().await?.as_u64();
        let wallet = key
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| MarketError::Configuration(format!("invalid private key: {}", e)))?
            .with_chain_id(chain_id);

        info!(
            "Connected to chain {} as {:?} via {}",
            chain_id,
            wallet.address(),
            config.chain.rpc_url
        );

        let contracts = &config.chain.contracts;
        Ok(Self {
            client: Arc::new(SignerMiddleware::new(provider, wallet)),
            marketplace: load_abi(MARKETPLACE_ABI)?,
            registry: load_abi(REGISTRY_ABI)?,
            model_registry: load_abi(MODEL_REGISTRY_ABI)?,
            erc20: load_abi(ERC20_ABI)?,
            marketplace_address: contracts.job_marketplace,
            registry_address: contracts.node_registry,
            model_registry_address: contracts.model_registry,
            confirmations: config.chain.confirmations,
        })
    }

    async fn call<T: Tokenize, D: Detokenize>(
        &self,
        abi: &BaseContract,
        to: Address,
        function: &str,
        args: T,
    ) -> Result<D> {
        let data = abi.encode(function, args)?;
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        let output = self
            .client
            .call(&tx, None)
            .await
            .map_err(|e| MarketError::Contract(format!("{} call failed: {}", function, e)))?;
        Ok(abi.decode_output(function, output)?)
    }

    async fn send<T: Tokenize>(
        &self,
        abi: &BaseContract,
        to: Address,
        function: &str,
        args: T,
        value: U256,
    ) -> Result<TransactionReceipt> {
        let data = abi.encode(function, args)?;
        let tx = TransactionRequest::new().to(to).data(data).value(value);
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| MarketError::Contract(format!("{} failed: {}", function, e)))?;
        let tx_hash = pending.tx_hash();
        debug!("{} sent in tx {:?}, awaiting {} confirmations", function, tx_hash, self.confirmations);

        let receipt = pending
            .confirmations(self.confirmations)
            .await?
            .ok_or_else(|| MarketError::Contract(format!("{} tx {:?} dropped", function, tx_hash)))?;
        if receipt.status != Some(U64::from(1)) {
            return Err(MarketError::Contract(format!(
                "{} reverted in tx {:?}",
                function, tx_hash
            )));
        }
        Ok(receipt)
    }

    fn job_id_from_receipt(&self, receipt: &TransactionReceipt) -> Result<U256> {
        let topic = self
            .marketplace
            .abi()
            .event("SessionJobCreated")
            .map_err(|e| MarketError::Contract(format!("ABI error: {}", e)))?
            .signature();
        receipt
            .logs
            .iter()
            .filter(|log| log.address == self.marketplace_address)
            .find(|log| log.topics.first() == Some(&topic) && log.topics.len() > 1)
            .map(|log| U256::from_big_endian(log.topics[1].as_bytes()))
            .ok_or_else(|| {
                MarketError::Contract(format!(
                    "no SessionJobCreated event in tx {:?}",
                    receipt.transaction_hash
                ))
            })
    }
}

#[async_trait]
impl MarketplaceContract for EthersMarketplace {
    async fn chain_id(&self) -> Result<u64> {
        let chain_id = self
            .client
            .get_chainid()
            .await
            .map_err(|e| MarketError::Transport(format!("eth_chainId failed: {}", e)))?;
        Ok(chain_id.as_u64())
    }

    fn signer_address(&self) -> Address {
        self.client.address()
    }

    async fn deposit(&self, token: PaymentToken, amount: U256) -> Result<H256> {
        let receipt = match token {
            PaymentToken::Native => {
                self.send(&self.marketplace, self.marketplace_address, "depositNative", (), amount)
                    .await?
            }
            PaymentToken::Erc20(address) => {
                self.send(
                    &self.marketplace,
                    self.marketplace_address,
                    "depositToken",
                    (address, amount),
                    U256::zero(),
                )
                .await?
            }
        };
        Ok(receipt.transaction_hash)
    }

    async fn withdraw(&self, token: PaymentToken, amount: U256) -> Result<H256> {
        let receipt = match token {
            PaymentToken::Native => {
                self.send(
                    &self.marketplace,
                    self.marketplace_address,
                    "withdrawNative",
                    amount,
                    U256::zero(),
                )
                .await?
            }
            PaymentToken::Erc20(address) => {
                self.send(
                    &self.marketplace,
                    self.marketplace_address,
                    "withdrawToken",
                    (address, amount),
                    U256::zero(),
                )
                .await?
            }
        };
        Ok(receipt.transaction_hash)
    }

    async fn deposit_balance(
        &self,
        depositor: Address,
        token: PaymentToken,
    ) -> Result<EscrowBalance> {
        let (total, locked): (U256, U256) = self
            .call(
                &self.marketplace,
                self.marketplace_address,
                "getDepositBalance",
                (depositor, token.address()),
            )
            .await?;
        Ok(EscrowBalance {
            token,
            total,
            locked,
        })
    }

    async fn token_allowance(&self, owner: Address, token: Address) -> Result<U256> {
        self.call(&self.erc20, token, "allowance", (owner, self.marketplace_address))
            .await
    }

    async fn approve_token(&self, token: Address, amount: U256) -> Result<H256> {
        let receipt = self
            .send(
                &self.erc20,
                token,
                "approve",
                (self.marketplace_address, amount),
                U256::zero(),
            )
            .await?;
        Ok(receipt.transaction_hash)
    }

    async fn create_session_job(&self, params: &SessionJobParams) -> Result<U256> {
        let duration = U256::from(params.duration_secs);
        let interval = U256::from(params.proof_interval);
        let receipt = if params.use_deposit {
            self.send(
                &self.marketplace,
                self.marketplace_address,
                "createSessionFromDeposit",
                (
                    params.host,
                    params.payment_token.address(),
                    params.deposit,
                    params.price_per_token,
                    duration,
                    interval,
                ),
                U256::zero(),
            )
            .await?
        } else {
            match params.payment_token {
                PaymentToken::Native => {
                    self.send(
                        &self.marketplace,
                        self.marketplace_address,
                        "createSessionJob",
                        (params.host, params.price_per_token, duration, interval),
                        params.deposit,
                    )
                    .await?
                }
                PaymentToken::Erc20(token) => {
                    self.send(
                        &self.marketplace,
                        self.marketplace_address,
                        "createSessionJobWithToken",
                        (
                            params.host,
                            token,
                            params.deposit,
                            params.price_per_token,
                            duration,
                            interval,
                        ),
                        U256::zero(),
                    )
                    .await?
                }
            }
        };
        self.job_id_from_receipt(&receipt)
    }

    async fn submit_checkpoint(&self, submission: &CheckpointSubmission) -> Result<H256> {
        let receipt = self
            .send(
                &self.marketplace,
                self.marketplace_address,
                "submitProofOfWork",
                (
                    submission.session_id,
                    U256::from(submission.tokens_claimed),
                    submission.proof_hash,
                    submission.proof_cid.clone(),
                    submission.delta_cid.clone(),
                ),
                U256::zero(),
            )
            .await?;
        Ok(receipt.transaction_hash)
    }

    async fn complete_session(
        &self,
        session_id: U256,
        final_tokens: u64,
        final_proof: &str,
    ) -> Result<H256> {
        let receipt = self
            .send(
                &self.marketplace,
                self.marketplace_address,
                "completeSessionJob",
                (session_id, U256::from(final_tokens), final_proof.to_string()),
                U256::zero(),
            )
            .await
            .map_err(|e| MarketError::Settlement(e.to_string()))?;
        Ok(receipt.transaction_hash)
    }

    async fn session_job(&self, job_id: U256) -> Result<SessionJobInfo> {
        let (id, requester, host, token, deposit, price, tokens_used, interval, status): JobTuple =
            self.call(&self.marketplace, self.marketplace_address, "sessionJobs", job_id)
                .await?;
        if requester.is_zero() {
            return Err(MarketError::SessionNotFound(job_id));
        }
        Ok(SessionJobInfo {
            job_id: id,
            requester,
            host,
            payment_token: PaymentToken::from_address(token),
            deposit,
            price_per_token: price,
            proof_interval: interval.low_u64(),
            tokens_proven: tokens_used.low_u64(),
            status: match status {
                0 => JobStatus::Active,
                1 => JobStatus::Completed,
                _ => JobStatus::Cancelled,
            },
        })
    }

    async fn is_model_approved(&self, model_id: H256) -> Result<bool> {
        self.call(
            &self.model_registry,
            self.model_registry_address,
            "isModelApproved",
            model_id,
        )
        .await
    }
}

#[async_trait]
impl HostRegistry for EthersMarketplace {
    async fn active_hosts(&self) -> Result<Vec<Address>> {
        self.call(&self.registry, self.registry_address, "getAllActiveNodes", ())
            .await
    }

    async fn host_info(&self, host: Address) -> Result<HostRecord> {
        let (operator, stake, active, metadata, api_url, models, min_native, min_stable): NodeInfo =
            self.call(&self.registry, self.registry_address, "getNodeFullInfo", host)
                .await?;
        if operator.is_zero() {
            return Err(MarketError::Contract(format!("host {:?} not registered", host)));
        }
        Ok(HostRecord {
            address: operator,
            api_url,
            stake,
            active,
            supported_models: models,
            metadata: HostMetadata::parse(&metadata),
            min_price_native: min_native,
            min_price_stable: min_stable,
        })
    }

    async fn model_pricing(
        &self,
        host: Address,
        model_id: H256,
        token: PaymentToken,
    ) -> Result<U256> {
        let price: U256 = self
            .call(
                &self.registry,
                self.registry_address,
                "getModelPricing",
                (host, model_id, token.address()),
            )
            .await?;
        if !price.is_zero() {
            return Ok(price);
        }
        let record = self.host_info(host).await?;
        Ok(match token {
            PaymentToken::Native => record.min_price_native,
            PaymentToken::Erc20(_) => record.min_price_stable,
        })
    }
}
