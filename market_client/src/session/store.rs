use super::transport::Transport;
use super::Session;
use crate::discovery::HostRecord;
use crate::error::{MarketError, Result};
use ethers::types::{Address, U256};
use k256::ecdsa::VerifyingKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Live state of one session owned by the protocol
pub struct SessionHandle {
    pub state: Mutex<Session>,
    pub(crate) link: Mutex<Option<Box<dyn Transport>>>,
    pub host: HostRecord,
    pub(crate) host_key: Option<VerifyingKey>,
    in_flight: AtomicBool,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(session: Session, host: HostRecord, host_key: Option<VerifyingKey>) -> Self {
        Self {
            state: Mutex::new(session),
            link: Mutex::new(None),
            host,
            host_key,
            in_flight: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn snapshot(&self) -> Session {
        self.state.lock().await.clone()
    }

    /// Claim the single in-flight prompt slot
    pub(crate) fn begin_prompt(self: &Arc<Self>, session_id: U256) -> Result<PromptGuard> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MarketError::PromptInFlight(session_id))?;
        Ok(PromptGuard {
            handle: self.clone(),
        })
    }

    pub fn prompt_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Releases the in-flight slot when dropped
pub(crate) struct PromptGuard {
    handle: Arc<SessionHandle>,
}

impl Drop for PromptGuard {
    fn drop(&mut self) {
        self.handle.in_flight.store(false, Ordering::Release);
    }
}

/// Sessions opened by this client, keyed by session id
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<RwLock<HashMap<U256, Arc<SessionHandle>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, handle: Arc<SessionHandle>) {
        let id = handle.state.lock().await.session_id;
        self.sessions.write().await.insert(id, handle);
    }

    pub async fn get(&self, session_id: U256) -> Result<Arc<SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .cloned()
            .ok_or(MarketError::SessionNotFound(session_id))
    }

    pub async fn remove(&self, session_id: U256) -> Option<Arc<SessionHandle>> {
        self.sessions.write().await.remove(&session_id)
    }

    /// Remove settled sessions, returning their ids. Failed sessions whose
    /// escrow is still locked stay so they can be ended.
    pub async fn remove_terminal(&self) -> Vec<U256> {
        let handles: Vec<(U256, Arc<SessionHandle>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();
        let mut finished = Vec::new();
        for (id, handle) in handles {
            if handle.state.lock().await.is_finished() && !handle.prompt_in_flight() {
                finished.push(id);
            }
        }
        for id in &finished {
            self.remove(*id).await;
        }
        finished
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshots of sessions requested by `user`, oldest first
    pub async fn user_sessions(&self, user: Address) -> Vec<Session> {
        self.filtered(|s| s.requester == user).await
    }

    /// Snapshots of sessions served by `host`, oldest first
    pub async fn host_sessions(&self, host: Address) -> Vec<Session> {
        self.filtered(|s| s.host_address == host).await
    }

    async fn filtered<F>(&self, predicate: F) -> Vec<Session>
    where
        F: Fn(&Session) -> bool,
    {
        let handles: Vec<Arc<SessionHandle>> =
            self.sessions.read().await.values().cloned().collect();
        let mut matching = Vec::new();
        for handle in handles {
            let session = handle.snapshot().await;
            if predicate(&session) {
                matching.push(session);
            }
        }
        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.session_id.cmp(&b.session_id))
        });
        matching
    }
}
