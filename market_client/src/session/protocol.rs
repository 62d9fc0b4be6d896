//! Per-session protocol driver.
//!
//! Owns every open session through a [`SessionStore`]: opens the escrow job,
//! performs the (optionally encrypted) handshake, drives prompt exchanges
//! through the [`PromptResolver`], reconnects on transport loss and settles
//! the session on end.

use super::message::{decode_frame, encode_prompt, encode_session_end, encode_session_init};
use super::resolver::{PromptOutcome, PromptResolver, Step};
use super::store::{SessionHandle, SessionStore};
use super::transport::{Connector, Transport};
use super::{Checkpoint, Session, SessionStatus, TokenUsageInfo};
use crate::checkpoint::CheckpointScheduler;
use crate::collaborators::{
    build_prompt_with_context, ContextProvider, ConversationMessage, ConversationStore,
};
use crate::config::MarketConfig;
use crate::crypto::{HostKeyResolver, SessionKey};
use crate::discovery::{HostDiscovery, HostRecord};
use crate::error::{MarketError, Result};
use crate::escrow::{CreateSessionRequest, EscrowLedger, PaymentToken};
use ethers::types::{Address, H256, U256};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::time::Instant;

pub type ChunkCallback = Box<dyn FnMut(&str) + Send>;
pub type UsageCallback = Box<dyn FnMut(&TokenUsageInfo) + Send>;

/// Per-prompt callbacks. Supplying `on_chunk` selects streaming mode.
#[derive(Default)]
pub struct PromptOptions {
    pub on_chunk: Option<ChunkCallback>,
    pub on_usage: Option<UsageCallback>,
}

impl PromptOptions {
    pub fn streaming(on_chunk: impl FnMut(&str) + Send + 'static) -> Self {
        Self {
            on_chunk: Some(Box::new(on_chunk)),
            on_usage: None,
        }
    }

    pub fn with_usage(mut self, on_usage: impl FnMut(&TokenUsageInfo) + Send + 'static) -> Self {
        self.on_usage = Some(Box::new(on_usage));
        self
    }
}

#[derive(Debug, Clone)]
pub struct StartSessionRequest {
    pub host: HostRecord,
    pub model: String,
    pub chain_id: u64,
    pub price_per_token: Option<U256>,
    pub duration_secs: Option<u64>,
    pub proof_interval: Option<u64>,
    pub deposit: U256,
    pub payment_token: PaymentToken,
    pub use_deposit: bool,
    /// Overrides the configured default
    pub encryption: Option<bool>,
}

impl StartSessionRequest {
    pub fn new(host: HostRecord, model: impl Into<String>, chain_id: u64, deposit: U256) -> Self {
        Self {
            host,
            model: model.into(),
            chain_id,
            price_per_token: None,
            duration_secs: None,
            proof_interval: None,
            deposit,
            payment_token: PaymentToken::Native,
            use_deposit: false,
            encryption: None,
        }
    }
}

pub struct SessionProtocol {
    ledger: Arc<EscrowLedger>,
    keys: Arc<HostKeyResolver>,
    connector: Arc<dyn Connector>,
    store: SessionStore,
    config: MarketConfig,
    discovery: Option<Arc<HostDiscovery>>,
    scheduler: Option<Arc<CheckpointScheduler>>,
    conversations: Option<Arc<dyn ConversationStore>>,
    context: Option<Arc<dyn ContextProvider>>,
}

impl SessionProtocol {
    pub fn new(
        ledger: Arc<EscrowLedger>,
        keys: Arc<HostKeyResolver>,
        connector: Arc<dyn Connector>,
        config: MarketConfig,
    ) -> Self {
        Self {
            ledger,
            keys,
            connector,
            store: SessionStore::new(),
            config,
            discovery: None,
            scheduler: None,
            conversations: None,
            context: None,
        }
    }

    /// Invalidate cached host data after failed interactions
    pub fn with_discovery(mut self, discovery: Arc<HostDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Submit checkpoints after prompts and a forced one at session end
    pub fn with_checkpoint_scheduler(mut self, scheduler: Arc<CheckpointScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversations = Some(store);
        self
    }

    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context = Some(provider);
        self
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub async fn get_session(&self, session_id: U256) -> Result<Session> {
        Ok(self.store.get(session_id).await?.snapshot().await)
    }

    pub async fn user_sessions(&self, user: Address) -> Vec<Session> {
        self.store.user_sessions(user).await
    }

    pub async fn host_sessions(&self, host: Address) -> Vec<Session> {
        self.store.host_sessions(host).await
    }

    /// Drop settled sessions from memory; returns how many went
    pub async fn prune_finished_sessions(&self) -> usize {
        let pruned = self.store.remove_terminal().await;
        for session_id in &pruned {
            if let Some(scheduler) = &self.scheduler {
                scheduler.forget(*session_id).await;
            }
        }
        if !pruned.is_empty() {
            debug!("Pruned {} finished sessions", pruned.len());
        }
        pruned.len()
    }

    /// Lock escrow with `request.host` and open the streaming channel
    pub async fn start_session(&self, request: StartSessionRequest) -> Result<U256> {
        self.config.chain.validate_chain(request.chain_id)?;
        self.ledger.ensure_chain(request.chain_id).await?;
        self.ledger.ensure_model_approved(&request.model).await?;

        let encrypted = request.encryption.unwrap_or(self.config.session.encryption);
        let host_key = if encrypted {
            match self.keys.resolve(&request.host).await {
                Ok(key) => Some(key),
                Err(e) => {
                    self.invalidate_host(request.host.address).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let escrow_request = CreateSessionRequest {
            chain_id: request.chain_id,
            host: request.host.address,
            price_per_token: request.price_per_token,
            duration_secs: request.duration_secs,
            proof_interval: request.proof_interval,
            deposit: request.deposit,
            payment_token: request.payment_token,
            use_deposit: request.use_deposit,
        };
        let params = self.ledger.resolve_params(&escrow_request)?;
        let job_id = self.ledger.create_session_job(&escrow_request).await?;

        let session = Session::new(
            job_id,
            request.chain_id,
            self.ledger.signer(),
            request.host.address,
            request.model.clone(),
            params.price_per_token,
            params.proof_interval,
            params.duration_secs,
            params.payment_token,
            host_key.as_ref().map(|_| SessionKey::generate()),
        );
        let handle = Arc::new(SessionHandle::new(session, request.host, host_key));
        self.store.insert(handle.clone()).await;

        match self.dial(&handle).await {
            Ok(transport) => {
                *handle.link.lock().await = Some(transport);
                handle.state.lock().await.transition(SessionStatus::Active)?;
                info!(
                    "🚀 Session {} active with host {:?} ({}, encrypted: {})",
                    job_id, handle.host.address, request.model, encrypted
                );
                Ok(job_id)
            }
            Err(e) => {
                error!("Handshake for session {} failed: {}", job_id, e);
                self.fail(&handle, true).await;
                Err(e)
            }
        }
    }

    /// Send a prompt and wait for its resolution
    pub async fn send_prompt(
        &self,
        session_id: U256,
        prompt: &str,
        mut options: PromptOptions,
    ) -> Result<PromptOutcome> {
        let handle = self.store.get(session_id).await?;
        let _slot = handle.begin_prompt(session_id)?;
        ensure_accepting(&handle).await?;

        let full_prompt = self.with_context(prompt).await;
        let streaming = options.on_chunk.is_some();

        let outcome = match self
            .exchange(&handle, &full_prompt, streaming, &mut options)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if matches!(e, MarketError::ReconnectExhausted(_)) {
                    error!("Session {} failed: {}", session_id, e);
                    self.fail(&handle, true).await;
                }
                return Err(e);
            }
        };

        {
            let mut s = handle.state.lock().await;
            if let Some(usage) = &outcome.usage {
                s.record_usage(usage)?;
            }
            s.conversation.push(ConversationMessage::user(prompt));
            s.conversation.push(ConversationMessage::assistant(
                outcome.response.clone(),
                outcome.usage.map(|u| u.total_tokens),
            ));
            debug!(
                "Session {}: {} tokens streamed in total",
                session_id, s.total_tokens_streamed
            );
        }
        if let (Some(on_usage), Some(usage)) = (options.on_usage.as_mut(), outcome.usage.as_ref()) {
            on_usage(usage);
        }

        self.persist_conversation(&handle, false).await;
        if let Some(scheduler) = &self.scheduler {
            if let Err(e) = scheduler.maybe_submit(&handle.state, false).await {
                warn!("Checkpoint after prompt on session {} failed: {}", session_id, e);
            }
        }
        Ok(outcome)
    }

    /// Run the checkpoint scheduler for a session on demand
    pub async fn checkpoint(&self, session_id: U256, forced: bool) -> Result<Option<Checkpoint>> {
        let scheduler = self
            .scheduler
            .as_ref()
            .ok_or_else(|| MarketError::Configuration("no checkpoint scheduler".into()))?;
        let handle = self.store.get(session_id).await?;
        scheduler.maybe_submit(&handle.state, forced).await
    }

    /// Store the conversation, tear down the channel and settle on chain.
    ///
    /// A session that already failed is still settled so its escrow is
    /// released; it stays `Failed`.
    pub async fn end_session(&self, session_id: U256) -> Result<H256> {
        let handle = self.store.get(session_id).await?;
        let _slot = handle.begin_prompt(session_id)?;

        let already_failed = {
            let mut s = handle.state.lock().await;
            match s.status {
                SessionStatus::Active | SessionStatus::Checkpointing => {
                    s.transition(SessionStatus::Ending)?;
                    false
                }
                SessionStatus::Failed => true,
                status => {
                    return Err(MarketError::InvalidSessionState {
                        session_id,
                        operation: "end",
                        status: status.to_string(),
                    })
                }
            }
        };
        info!("Ending session {}", session_id);

        if !already_failed {
            if let Some(scheduler) = &self.scheduler {
                if let Err(e) = scheduler.maybe_submit(&handle.state, true).await {
                    warn!("Final checkpoint for session {} failed: {}", session_id, e);
                }
            }
        }

        self.teardown(&handle).await;
        self.persist_conversation(&handle, true).await;

        let (job_id, proven_tokens, final_proof) = {
            let s = handle.state.lock().await;
            let proof = s
                .checkpoints
                .last()
                .map(|c| format!("{:?}", c.proof_hash))
                .unwrap_or_default();
            (s.job_id, s.tokens_proven(), proof)
        };
        let result = self
            .ledger
            .complete_session(job_id, proven_tokens, &final_proof)
            .await;

        handle.cancellation().cancel();
        if let Some(scheduler) = &self.scheduler {
            scheduler.forget(session_id).await;
        }

        let mut s = handle.state.lock().await;
        match result {
            Ok(tx) => {
                s.settlement_tx = Some(tx);
                if !already_failed {
                    s.transition(SessionStatus::Completed)?;
                }
                info!(
                    "🏁 Session {} completed: {} tokens, {} checkpoints",
                    session_id,
                    s.total_tokens_streamed,
                    s.checkpoints.len()
                );
                Ok(tx)
            }
            Err(e) => {
                if !already_failed {
                    s.transition(SessionStatus::Failed)?;
                }
                error!("Settlement of session {} failed: {}", session_id, e);
                Err(e)
            }
        }
    }

    /// Abort locally: rejects a pending prompt with `SessionClosed`, stops any
    /// reconnect loop and drops the channel. On-chain state is untouched.
    pub async fn close_session(&self, session_id: U256) -> Result<()> {
        let handle = self.store.get(session_id).await?;
        handle.cancellation().cancel();
        self.fail(&handle, false).await;
        if let Some(scheduler) = &self.scheduler {
            scheduler.forget(session_id).await;
        }
        info!("Session {} closed", session_id);
        Ok(())
    }

    async fn dial(&self, handle: &SessionHandle) -> Result<Box<dyn Transport>> {
        let init = {
            let s = handle.state.lock().await;
            encode_session_init(&s, handle.host_key.as_ref())?
        };
        let mut transport = self.connector.connect(&handle.host.ws_url()).await?;
        transport.send(init).await?;
        Ok(transport)
    }

    async fn exchange(
        &self,
        handle: &SessionHandle,
        prompt: &str,
        streaming: bool,
        options: &mut PromptOptions,
    ) -> Result<PromptOutcome> {
        let mut link = handle.link.lock().await;
        let mut budget = self.config.transport.reconnect_attempts;
        loop {
            let mut transport = match link.take() {
                Some(transport) => transport,
                None => self.reconnect(handle, &mut budget).await?,
            };
            match self
                .run_prompt(handle, transport.as_mut(), prompt, streaming, options)
                .await
            {
                Ok(outcome) => {
                    *link = Some(transport);
                    return Ok(outcome);
                }
                Err(e) if e.is_transport() => {
                    warn!("Connection to {:?} lost: {}", handle.host.address, e);
                    let _ = transport.close().await;
                }
                Err(e) => {
                    *link = Some(transport);
                    return Err(e);
                }
            }
        }
    }

    async fn reconnect(&self, handle: &SessionHandle, budget: &mut u32) -> Result<Box<dyn Transport>> {
        let attempts = self.config.transport.reconnect_attempts;
        let backoff = self.config.transport.reconnect_backoff();
        let session_id = handle.state.lock().await.session_id;

        while *budget > 0 {
            *budget -= 1;
            tokio::select! {
                biased;
                _ = handle.cancellation().cancelled() => {
                    return Err(MarketError::SessionClosed(session_id));
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            info!(
                "🔄 Reconnecting session {} (attempt {}/{})",
                session_id,
                attempts - *budget,
                attempts
            );
            match self.dial(handle).await {
                Ok(transport) => return Ok(transport),
                Err(e) => warn!("Reconnect of session {} failed: {}", session_id, e),
            }
        }
        Err(MarketError::ReconnectExhausted(attempts))
    }

    async fn run_prompt(
        &self,
        handle: &SessionHandle,
        transport: &mut dyn Transport,
        prompt: &str,
        streaming: bool,
        options: &mut PromptOptions,
    ) -> Result<PromptOutcome> {
        let cancel = handle.cancellation();
        let (session_id, prompt_index, frame) = {
            let mut s = handle.state.lock().await;
            let prompt_index = s.message_index;
            let frame = encode_prompt(&mut s, prompt, streaming)?;
            (s.session_id, prompt_index, frame)
        };
        if cancel.is_cancelled() {
            return Err(MarketError::SessionClosed(session_id));
        }
        discard_buffered_frames(session_id, transport)?;
        transport.send(frame).await?;

        let safety = self.config.transport.safety_timeout();
        let response_timeout = self.config.transport.response_timeout();
        let give_up_at = Instant::now() + response_timeout;
        let mut resolver = PromptResolver::new(streaming);
        let mut deadline: Option<Instant> = None;

        loop {
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(MarketError::SessionClosed(session_id));
                }
                _ = timer => {
                    if let Some(outcome) = resolver.on_safety_timeout() {
                        warn!(
                            "Session {}: no usage notice {:?} after final chunk, resolving without usage",
                            session_id, safety
                        );
                        return Ok(outcome);
                    }
                }
                _ = tokio::time::sleep_until(give_up_at) => {
                    warn!(
                        "Session {}: host silent for {:?}, giving up on prompt {}",
                        session_id, response_timeout, prompt_index
                    );
                    return Err(MarketError::ResponseTimeout {
                        session_id,
                        waited_ms: response_timeout.as_millis() as u64,
                    });
                }
                frame = transport.recv() => {
                    let raw = frame?.ok_or_else(|| {
                        MarketError::Transport("host closed the connection".into())
                    })?;
                    let event = {
                        let mut s = handle.state.lock().await;
                        decode_frame(&mut s, &raw, streaming, prompt_index)
                    };
                    match resolver.on_event(event) {
                        Step::Continue => {}
                        Step::Fragment { text, is_final } => {
                            if let Some(on_chunk) = options.on_chunk.as_mut() {
                                if !text.is_empty() {
                                    on_chunk(&text);
                                }
                            }
                            if is_final && deadline.is_none() {
                                deadline = Some(Instant::now() + safety);
                            }
                        }
                        Step::Resolved(outcome) => return Ok(outcome),
                        Step::Failed(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn with_context(&self, prompt: &str) -> String {
        let Some(provider) = &self.context else {
            return prompt.to_string();
        };
        match provider.search(prompt).await {
            Ok(snippets) => build_prompt_with_context(prompt, &snippets),
            Err(e) => {
                warn!("Context search failed, sending prompt without context: {}", e);
                prompt.to_string()
            }
        }
    }

    async fn persist_conversation(&self, handle: &SessionHandle, is_final: bool) {
        let Some(store) = &self.conversations else {
            return;
        };
        let (id, messages, metadata) = {
            let s = handle.state.lock().await;
            let metadata = serde_json::json!({
                "sessionId": s.session_id.to_string(),
                "jobId": s.job_id.to_string(),
                "chainId": s.chain_id,
                "host": format!("{:?}", s.host_address),
                "model": s.model,
                "totalTokens": s.total_tokens_streamed,
                "final": is_final,
            });
            (format!("session-{}", s.session_id), s.conversation.clone(), metadata)
        };
        if messages.is_empty() {
            return;
        }
        if let Err(e) = store.store_conversation(&id, &messages, &metadata).await {
            warn!("Storing conversation {} failed: {}", id, e);
        }
    }

    /// Send `session_end` if connected and drop the channel
    async fn teardown(&self, handle: &SessionHandle) {
        let mut link = handle.link.lock().await;
        if let Some(mut transport) = link.take() {
            let goodbye = {
                let s = handle.state.lock().await;
                encode_session_end(&s)
            };
            if let Ok(frame) = goodbye {
                if let Err(e) = transport.send(frame).await {
                    debug!("session_end not delivered: {}", e);
                }
            }
            if let Err(e) = transport.close().await {
                debug!("Closing transport failed: {}", e);
            }
        }
    }

    /// Drop the channel and mark the session failed
    async fn fail(&self, handle: &SessionHandle, invalidate_host: bool) {
        if let Some(mut transport) = handle.link.lock().await.take() {
            let _ = transport.close().await;
        }
        let host = {
            let mut s = handle.state.lock().await;
            if !s.status.is_terminal() {
                s.status = SessionStatus::Failed;
            }
            s.host_address
        };
        if invalidate_host {
            self.invalidate_host(host).await;
        }
    }

    async fn invalidate_host(&self, host: Address) {
        if let Some(discovery) = &self.discovery {
            discovery.invalidate(host).await;
        }
        self.keys.forget(host).await;
    }
}

/// Drop frames already queued on the link, left over from an earlier prompt
/// that timed out or failed
fn discard_buffered_frames(session_id: U256, transport: &mut dyn Transport) -> Result<()> {
    let mut dropped = 0usize;
    while let Some(next) = transport.recv().now_or_never() {
        match next? {
            Some(_) => dropped += 1,
            None => return Err(MarketError::Transport("host closed the connection".into())),
        }
    }
    if dropped > 0 {
        warn!(
            "Session {}: discarded {} leftover frames before sending prompt",
            session_id, dropped
        );
    }
    Ok(())
}

async fn ensure_accepting(handle: &SessionHandle) -> Result<()> {
    let s = handle.state.lock().await;
    if handle.cancellation().is_cancelled() || s.status.is_terminal() {
        return Err(MarketError::SessionClosed(s.session_id));
    }
    match s.status {
        SessionStatus::Active | SessionStatus::Checkpointing => Ok(()),
        status => Err(MarketError::InvalidSessionState {
            session_id: s.session_id,
            operation: "prompt",
            status: status.to_string(),
        }),
    }
}
