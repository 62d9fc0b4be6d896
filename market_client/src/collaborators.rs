//! External collaborators: conversation storage and retrieval context.
//!
//! Both are optional. Failures are logged by the caller and never fail a
//! session.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Tokens billed for this turn; assistant turns only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
            tokens: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tokens: Option<u64>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            tokens,
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn store_conversation(
        &self,
        id: &str,
        messages: &[ConversationMessage],
        metadata: &serde_json::Value,
    ) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredConversation {
    pub messages: Vec<ConversationMessage>,
    pub metadata: serde_json::Value,
    pub writes: u32,
}

/// Keeps the latest version of each conversation in memory
#[derive(Clone, Default)]
pub struct MemoryConversationStore {
    conversations: Arc<RwLock<HashMap<String, StoredConversation>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<StoredConversation> {
        self.conversations.read().await.get(id).cloned()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn store_conversation(
        &self,
        id: &str,
        messages: &[ConversationMessage],
        metadata: &serde_json::Value,
    ) -> Result<()> {
        let mut conversations = self.conversations.write().await;
        let writes = conversations.get(id).map(|c| c.writes).unwrap_or(0) + 1;
        conversations.insert(
            id.to_string(),
            StoredConversation {
                messages: messages.to_vec(),
                metadata: metadata.clone(),
                writes,
            },
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub text: String,
    pub score: f32,
}

/// Retrieval backend queried before a prompt is sent
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<ContextSnippet>>;
}

/// Scores documents by the share of query words they contain
#[derive(Debug, Clone, Default)]
pub struct KeywordContextProvider {
    documents: Vec<String>,
    max_results: usize,
}

impl KeywordContextProvider {
    pub fn new(documents: Vec<String>, max_results: usize) -> Self {
        Self {
            documents,
            max_results,
        }
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl ContextProvider for KeywordContextProvider {
    async fn search(&self, query: &str) -> Result<Vec<ContextSnippet>> {
        let query_words = words(query);
        if query_words.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<ContextSnippet> = self
            .documents
            .iter()
            .filter_map(|doc| {
                let doc_words = words(doc);
                let matched = query_words.iter().filter(|w| doc_words.contains(w)).count();
                (matched > 0).then(|| ContextSnippet {
                    text: doc.clone(),
                    score: matched as f32 / query_words.len() as f32,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(self.max_results);
        Ok(hits)
    }
}

/// Prepend non-empty snippets, best first; no snippets leaves the prompt as is
pub fn build_prompt_with_context(prompt: &str, snippets: &[ContextSnippet]) -> String {
    let mut ranked: Vec<&ContextSnippet> = snippets
        .iter()
        .filter(|s| !s.text.trim().is_empty())
        .collect();
    if ranked.is_empty() {
        return prompt.to_string();
    }
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut out = String::from("Context:\n");
    for snippet in ranked {
        out.push_str("- ");
        out.push_str(snippet.text.trim());
        out.push('\n');
    }
    out.push_str("\nQuestion: ");
    out.push_str(prompt);
    out
}
