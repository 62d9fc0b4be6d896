//! Shared fixture: an in-memory chain, a scripted host behind a channel
//! connector and a protocol driver wired to both.

#![allow(dead_code)]

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use k256::SecretKey;
use market_client::checkpoint::{CheckpointScheduler, CommitmentProofProvider, ProofProvider};
use market_client::collaborators::{ContextProvider, ConversationStore};
use market_client::crypto::{
    open_from_client, ChallengeClient, ChallengeResponse, EncryptedPayload, HostKeyResolver,
    SealedEnvelope, SessionKey,
};
use market_client::discovery::{HostDiscovery, HostMetadata, HostRecord};
use market_client::escrow::{model_id, EscrowLedger, InMemoryChain, PaymentToken};
use market_client::session::message::SessionInitPayload;
use market_client::session::transport::ChannelPeer;
use market_client::session::{ChannelConnector, SessionProtocol, StartSessionRequest};
use market_client::{KeyRecoveryError, MarketConfig};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const CHAIN_ID: u64 = 31337;
pub const MODEL: &str = "org/tiny-llama:tiny-q4.gguf";
pub const PRICE: u64 = 2000;

pub fn user() -> Address {
    Address::repeat_byte(0x11)
}

pub fn host() -> Address {
    Address::repeat_byte(0x22)
}

/// One frame the simulated host sends back
#[derive(Debug, Clone)]
pub enum HostFrame {
    Chunk(&'static str, bool),
    Finish(&'static str),
    End {
        tokens: Option<u64>,
        vlm: Option<u64>,
        image: Option<u64>,
    },
    Response {
        content: &'static str,
        tokens: Option<u64>,
    },
    Error(&'static str),
    Raw(String),
    /// Pause before the next frame
    Delay(Duration),
    /// Drop the connection
    HangUp,
}

pub fn end(tokens: u64) -> HostFrame {
    HostFrame::End {
        tokens: Some(tokens),
        vlm: None,
        image: None,
    }
}

/// Maps (prompt text, prompt ordinal across all connections) to a reply
pub type Script = Arc<dyn Fn(&str, usize) -> Vec<HostFrame> + Send + Sync>;

pub fn script(f: impl Fn(&str, usize) -> Vec<HostFrame> + Send + Sync + 'static) -> Script {
    Arc::new(f)
}

/// Observations of the simulated host
pub struct HostSim {
    pub frames: Arc<Mutex<Vec<Value>>>,
    pub prompts: Arc<Mutex<Vec<String>>>,
    pub connections: Arc<AtomicUsize>,
    /// Every prompt as it arrives
    pub arrivals: mpsc::UnboundedReceiver<String>,
}

impl HostSim {
    pub fn frame_types(&self) -> Vec<String> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .map(|f| f["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub fn spawn_host(
    mut incoming: mpsc::UnboundedReceiver<ChannelPeer>,
    secret: Option<SecretKey>,
    script: Script,
) -> HostSim {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let prompts = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));
    let (arrived, arrivals) = mpsc::unbounded_channel();

    let sim = HostSim {
        frames: frames.clone(),
        prompts: prompts.clone(),
        connections: connections.clone(),
        arrivals,
    };

    tokio::spawn(async move {
        while let Some(peer) = incoming.recv().await {
            connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(
                peer,
                secret.clone(),
                script.clone(),
                frames.clone(),
                prompts.clone(),
                arrived.clone(),
            ));
        }
    });
    sim
}

async fn serve(
    mut peer: ChannelPeer,
    secret: Option<SecretKey>,
    script: Script,
    frames: Arc<Mutex<Vec<Value>>>,
    prompts: Arc<Mutex<Vec<String>>>,
    arrived: mpsc::UnboundedSender<String>,
) {
    let mut key: Option<SessionKey> = None;
    let mut out_index = 0u64;

    while let Some(raw) = peer.recv().await {
        let frame: Value = serde_json::from_str(&raw).unwrap();
        frames.lock().unwrap().push(frame.clone());

        let prompt = match frame["type"].as_str().unwrap_or_default() {
            "encrypted_session_init" => {
                let envelope: SealedEnvelope =
                    serde_json::from_value(frame["payload"].clone()).unwrap();
                let secret = secret.as_ref().expect("host has no secret key");
                let opened = open_from_client(secret, &envelope).unwrap();
                let init: SessionInitPayload = serde_json::from_slice(&opened).unwrap();
                key = Some(SessionKey::from_hex(&init.session_key).unwrap());
                continue;
            }
            "encrypted_message" => {
                let payload: EncryptedPayload =
                    serde_json::from_value(frame["payload"].clone()).unwrap();
                let opened = key.as_ref().unwrap().open(&payload).unwrap();
                String::from_utf8(opened).unwrap()
            }
            "prompt" => frame["prompt"].as_str().unwrap().to_string(),
            _ => continue,
        };

        let ordinal = {
            let mut seen = prompts.lock().unwrap();
            seen.push(prompt.clone());
            seen.len() - 1
        };
        let _ = arrived.send(prompt.clone());

        for reply in script(&prompt, ordinal) {
            let out = match reply {
                HostFrame::HangUp => return,
                HostFrame::Delay(pause) => {
                    tokio::time::sleep(pause).await;
                    continue;
                }
                HostFrame::Chunk(text, is_final) => match &key {
                    Some(key) => {
                        let payload = key.seal(out_index, text.as_bytes()).unwrap();
                        out_index += 1;
                        json!({"type": "encrypted_chunk", "payload": payload, "final": is_final})
                    }
                    None => json!({"type": "stream_chunk", "content": text, "final": is_final}),
                },
                HostFrame::Finish(reason) => json!({"type": "stream_finish", "finish_reason": reason}),
                HostFrame::End { tokens, vlm, image } => json!({
                    "type": "stream_end",
                    "tokens_used": tokens,
                    "vlm_tokens": vlm,
                    "image_gen_tokens": image,
                }),
                HostFrame::Response { content, tokens } => {
                    json!({"type": "response", "content": content, "tokens_used": tokens})
                }
                HostFrame::Error(message) => {
                    json!({"type": "error", "code": "MODEL_BUSY", "message": message})
                }
                HostFrame::Raw(raw) => {
                    if !peer.send(raw) {
                        return;
                    }
                    continue;
                }
            };
            if !peer.send(out.to_string()) {
                return;
            }
        }
    }
}

/// Rejects every challenge; fixtures publish their keys instead
pub struct NoChallenge;

#[async_trait]
impl ChallengeClient for NoChallenge {
    async fn request_signature(
        &self,
        _api_url: &str,
        _challenge: H256,
    ) -> Result<ChallengeResponse, KeyRecoveryError> {
        Err(KeyRecoveryError::ChallengeFailed("challenge endpoint disabled".into()))
    }
}

/// Counts challenge requests and rejects them all
#[derive(Default)]
pub struct CountingChallenge {
    pub calls: AtomicUsize,
}

impl CountingChallenge {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChallengeClient for CountingChallenge {
    async fn request_signature(
        &self,
        _api_url: &str,
        _challenge: H256,
    ) -> Result<ChallengeResponse, KeyRecoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(KeyRecoveryError::ChallengeFailed("host unreachable".into()))
    }
}

pub fn test_config() -> MarketConfig {
    let mut config = MarketConfig::default();
    config.chain.chain_id = CHAIN_ID;
    config.session.price_per_token = PRICE;
    config.session.encryption = false;
    config.transport.reconnect_backoff_ms = 100;
    config.checkpoint.cooldown_secs = 0;
    config
}

pub fn host_record(address: Address, public_key: Option<String>) -> HostRecord {
    HostRecord {
        address,
        api_url: format!("http://host-{:x}", address.to_low_u64_be()),
        stake: U256::from(1_000u64),
        active: true,
        supported_models: vec![model_id(MODEL)],
        metadata: HostMetadata {
            public_key,
            ..HostMetadata::default()
        },
        min_price_native: U256::from(PRICE),
        min_price_stable: U256::from(PRICE),
    }
}

pub fn published_key(secret: &SecretKey) -> String {
    hex::encode(secret.public_key().to_sec1_bytes())
}

pub struct Fixture {
    pub chain: Arc<InMemoryChain>,
    pub ledger: Arc<EscrowLedger>,
    pub connector: ChannelConnector,
    pub protocol: Arc<SessionProtocol>,
    pub host: HostSim,
    pub record: HostRecord,
    pub scheduler: Option<Arc<CheckpointScheduler>>,
}

pub struct FixtureBuilder {
    config: MarketConfig,
    chain: Arc<InMemoryChain>,
    secret: Option<SecretKey>,
    scheduler: bool,
    wallet: u64,
    conversations: Option<Arc<dyn ConversationStore>>,
    context: Option<Arc<dyn ContextProvider>>,
    discovery: Option<Arc<HostDiscovery>>,
    prover: Option<Arc<dyn ProofProvider>>,
    challenge: Option<Arc<dyn ChallengeClient>>,
}

impl FixtureBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            chain: Arc::new(InMemoryChain::new(CHAIN_ID)),
            secret: None,
            scheduler: false,
            wallet: 10_000_000,
            conversations: None,
            context: None,
            discovery: None,
            prover: None,
            challenge: None,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut MarketConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn chain(mut self, chain: Arc<InMemoryChain>) -> Self {
        self.chain = chain;
        self
    }

    /// Host publishes this key and the session is encrypted
    pub fn encrypted(mut self, secret: SecretKey) -> Self {
        self.config.session.encryption = true;
        self.secret = Some(secret);
        self
    }

    pub fn with_scheduler(mut self) -> Self {
        self.scheduler = true;
        self
    }

    pub fn wallet(mut self, amount: u64) -> Self {
        self.wallet = amount;
        self
    }

    pub fn conversations(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    pub fn context(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    pub fn discovery(mut self, discovery: Arc<HostDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Proof provider for the scheduler; implies `with_scheduler`
    pub fn prover(mut self, prover: Arc<dyn ProofProvider>) -> Self {
        self.scheduler = true;
        self.prover = Some(prover);
        self
    }

    pub fn challenge(mut self, client: Arc<dyn ChallengeClient>) -> Self {
        self.challenge = Some(client);
        self
    }

    pub fn build(self, script: Script) -> Fixture {
        let chain = self.chain;
        chain.approve_model(MODEL);
        chain.fund_wallet(user(), PaymentToken::Native, U256::from(self.wallet));

        let record = host_record(host(), self.secret.as_ref().map(published_key));
        chain.register_host(record.clone(), &[]);

        let (connector, incoming) = ChannelConnector::new();
        let sim = spawn_host(incoming, self.secret, script);

        let ledger = Arc::new(EscrowLedger::new(
            Arc::new(chain.connect(user())),
            self.config.clone(),
        ));
        let challenge = self.challenge.unwrap_or_else(|| Arc::new(NoChallenge));
        let keys = Arc::new(HostKeyResolver::new(challenge));
        let mut protocol = SessionProtocol::new(
            ledger.clone(),
            keys,
            Arc::new(connector.clone()),
            self.config.clone(),
        );
        let scheduler = self.scheduler.then(|| {
            let prover = self
                .prover
                .unwrap_or_else(|| Arc::new(CommitmentProofProvider));
            Arc::new(CheckpointScheduler::new(
                Arc::new(chain.connect(host())),
                prover,
                &self.config.checkpoint,
            ))
        });
        if let Some(scheduler) = &scheduler {
            protocol = protocol.with_checkpoint_scheduler(scheduler.clone());
        }
        if let Some(store) = self.conversations {
            protocol = protocol.with_conversation_store(store);
        }
        if let Some(provider) = self.context {
            protocol = protocol.with_context_provider(provider);
        }
        if let Some(discovery) = self.discovery {
            protocol = protocol.with_discovery(discovery);
        }

        Fixture {
            chain,
            ledger,
            connector,
            protocol: Arc::new(protocol),
            host: sim,
            record,
            scheduler,
        }
    }
}

impl Fixture {
    pub fn request(&self, deposit: u64) -> StartSessionRequest {
        let mut request =
            StartSessionRequest::new(self.record.clone(), MODEL, CHAIN_ID, U256::from(deposit));
        request.price_per_token = Some(U256::from(PRICE));
        request
    }

    pub async fn open(&self, deposit: u64) -> U256 {
        self.protocol
            .start_session(self.request(deposit))
            .await
            .expect("session should start")
    }
}
