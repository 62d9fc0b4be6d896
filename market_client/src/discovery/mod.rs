//! Host discovery: reads registry records, filters them against a model and
//! caller requirements, and ranks the survivors by price.

pub mod cache;

use crate::escrow::{model_id, HostRegistry, PaymentToken};
use crate::error::{MarketError, Result};
use cache::TtlCache;
use ethers::types::{Address, H256, U256};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HardwareInfo {
    pub gpu: String,
    pub vram_gb: u32,
}

/// Free-form metadata a host publishes alongside its registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostMetadata {
    pub hardware: HardwareInfo,
    pub capabilities: Vec<String>,
    pub location: String,
    pub max_concurrent: u32,
    /// Compressed secp256k1 key, hex encoded
    pub public_key: Option<String>,
}

impl HostMetadata {
    /// Lenient parse; hosts publish anything from `""` to full JSON
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::default();
        }
        serde_json::from_str(raw).unwrap_or_else(|e| {
            debug!("Unparseable host metadata ({}), using defaults", e);
            Self::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    pub address: Address,
    pub api_url: String,
    pub stake: U256,
    pub active: bool,
    pub supported_models: Vec<H256>,
    pub metadata: HostMetadata,
    pub min_price_native: U256,
    pub min_price_stable: U256,
}

impl HostRecord {
    pub fn supports(&self, model: &str) -> bool {
        self.supported_models.contains(&model_id(model))
    }

    /// Published encryption key, if any
    pub fn public_key(&self) -> Option<&str> {
        self.metadata
            .public_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
    }

    /// WebSocket endpoint derived from the HTTP API URL
    pub fn ws_url(&self) -> String {
        let base = self.api_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/v1/ws", ws)
    }
}

/// Caller constraints on eligible hosts
#[derive(Debug, Clone)]
pub struct HostRequirements {
    pub min_stake: Option<U256>,
    pub min_vram_gb: Option<u32>,
    pub max_cost_per_token: Option<U256>,
    pub payment_token: PaymentToken,
}

impl Default for HostRequirements {
    fn default() -> Self {
        Self {
            min_stake: None,
            min_vram_gb: None,
            max_cost_per_token: None,
            payment_token: PaymentToken::Native,
        }
    }
}

/// A host that passed filtering, with its price for the requested model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCandidate {
    pub record: HostRecord,
    pub price_per_token: U256,
}

/// Cheapest first; equal prices prefer the larger stake
pub fn rank_hosts(mut candidates: Vec<HostCandidate>) -> Vec<HostCandidate> {
    candidates.sort_by(|a, b| match a.price_per_token.cmp(&b.price_per_token) {
        Ordering::Equal => b.record.stake.cmp(&a.record.stake),
        other => other,
    });
    candidates
}

pub struct HostDiscovery {
    registry: Arc<dyn HostRegistry>,
    records: TtlCache<Address, HostRecord>,
    prices: TtlCache<(Address, H256, PaymentToken), U256>,
}

impl HostDiscovery {
    pub fn new(registry: Arc<dyn HostRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            records: TtlCache::new(ttl),
            prices: TtlCache::new(ttl),
        }
    }

    /// Host record, refreshed once the cached copy is older than the TTL.
    /// A failed refresh serves the stale copy when there is one.
    pub async fn host(&self, address: Address) -> Result<HostRecord> {
        if let Some(record) = self.records.get_fresh(&address).await {
            return Ok(record);
        }
        match self.registry.host_info(address).await {
            Ok(record) => {
                self.records.insert(address, record.clone()).await;
                Ok(record)
            }
            Err(e) => match self.records.get_any(&address).await {
                Some(stale) => {
                    warn!("Refresh of host {:?} failed ({}), serving stale record", address, e);
                    Ok(stale)
                }
                None => Err(e),
            },
        }
    }

    pub async fn get_model_pricing(
        &self,
        host: Address,
        model: &str,
        token: PaymentToken,
    ) -> Result<U256> {
        let key = (host, model_id(model), token);
        if let Some(price) = self.prices.get_fresh(&key).await {
            return Ok(price);
        }
        match self.registry.model_pricing(host, key.1, token).await {
            Ok(price) => {
                self.prices.insert(key, price).await;
                Ok(price)
            }
            Err(e) => self.prices.get_any(&key).await.ok_or(e),
        }
    }

    /// Eligible hosts for `model`, ranked by [`rank_hosts`]
    pub async fn find_hosts(
        &self,
        model: &str,
        requirements: &HostRequirements,
    ) -> Result<Vec<HostCandidate>> {
        let addresses = self.registry.active_hosts().await?;
        let mut candidates = Vec::new();

        for address in addresses {
            let record = match self.host(address).await {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping host {:?}: {}", address, e);
                    continue;
                }
            };
            if !record.active || !record.supports(model) {
                continue;
            }
            if let Some(min_stake) = requirements.min_stake {
                if record.stake < min_stake {
                    continue;
                }
            }
            if let Some(min_vram) = requirements.min_vram_gb {
                if record.metadata.hardware.vram_gb < min_vram {
                    continue;
                }
            }

            let price = match self
                .get_model_pricing(address, model, requirements.payment_token)
                .await
            {
                Ok(price) => price,
                Err(e) => {
                    warn!("No pricing for host {:?}: {}", address, e);
                    continue;
                }
            };
            if let Some(max) = requirements.max_cost_per_token {
                if price > max {
                    continue;
                }
            }
            candidates.push(HostCandidate {
                record,
                price_per_token: price,
            });
        }

        debug!("{} hosts eligible for {}", candidates.len(), model);
        Ok(rank_hosts(candidates))
    }

    /// Cheapest eligible host; none eligible is a hard failure
    pub async fn select_best_host(
        &self,
        model: &str,
        requirements: &HostRequirements,
    ) -> Result<HostCandidate> {
        let best = self
            .find_hosts(model, requirements)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MarketError::NoHostsForModel(model.to_string()))?;
        info!(
            "🔍 Selected host {:?} for {} at price {}",
            best.record.address, model, best.price_per_token
        );
        Ok(best)
    }

    /// Drop everything cached about a host after a failed interaction
    pub async fn invalidate(&self, host: Address) {
        self.records.invalidate(&host).await;
        self.prices.invalidate_where(|(address, _, _)| *address == host).await;
        debug!("Invalidated cache for host {:?}", host);
    }
}
