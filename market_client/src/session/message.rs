//! Wire format of the host streaming endpoint.
//!
//! Every frame is a JSON object tagged by `type`. Encrypted sessions carry
//! prompts and content inside [`EncryptedPayload`]s; the usage notice
//! (`stream_end`) is always plaintext.

use super::Session;
use crate::crypto::{seal_to_host, EncryptedPayload, SealedEnvelope};
use crate::error::{MarketError, Result};
use k256::ecdsa::VerifyingKey;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Client to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    SessionInit {
        session_id: String,
        job_id: String,
        chain_id: u64,
        model: String,
        price_per_token: String,
        user_address: String,
    },
    EncryptedSessionInit {
        session_id: String,
        chain_id: u64,
        payload: SealedEnvelope,
    },
    Prompt {
        session_id: String,
        prompt: String,
        message_index: u64,
        stream: bool,
    },
    EncryptedMessage {
        session_id: String,
        payload: EncryptedPayload,
        stream: bool,
    },
    SessionEnd {
        session_id: String,
    },
}

/// Plaintext sealed inside `encrypted_session_init`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInitPayload {
    pub session_key: String,
    pub job_id: String,
    pub chain_id: u64,
    pub model: String,
    pub price_per_token: String,
    pub user_address: String,
}

/// Host to client. `message_index`, when the host echoes it, names the
/// prompt a frame answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    StreamChunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<u64>,
        content: String,
        #[serde(default, rename = "final")]
        is_final: bool,
    },
    EncryptedChunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<u64>,
        payload: EncryptedPayload,
        #[serde(default, rename = "final")]
        is_final: bool,
    },
    StreamFinish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<u64>,
        #[serde(default)]
        finish_reason: Option<String>,
    },
    EncryptedResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<u64>,
        payload: EncryptedPayload,
    },
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<u64>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        finish_reason: Option<String>,
        #[serde(default)]
        tokens_used: Option<u64>,
        #[serde(default)]
        vlm_tokens: Option<u64>,
    },
    StreamEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<u64>,
        #[serde(default)]
        tokens_used: Option<u64>,
        #[serde(default)]
        vlm_tokens: Option<u64>,
        #[serde(default)]
        image_gen_tokens: Option<u64>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_index: Option<u64>,
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    pub fn message_index(&self) -> Option<u64> {
        match self {
            InboundMessage::StreamChunk { message_index, .. }
            | InboundMessage::EncryptedChunk { message_index, .. }
            | InboundMessage::StreamFinish { message_index, .. }
            | InboundMessage::EncryptedResponse { message_index, .. }
            | InboundMessage::Response { message_index, .. }
            | InboundMessage::StreamEnd { message_index, .. }
            | InboundMessage::Error { message_index, .. } => *message_index,
            InboundMessage::Unknown => None,
        }
    }
}

/// Decrypted body of an `encrypted_response`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub vlm_tokens: Option<u64>,
}

/// Raw counts from a usage notice; absent fields fall back at resolution time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageNotice {
    pub tokens_used: Option<u64>,
    pub vlm_tokens: Option<u64>,
    pub image_gen_tokens: Option<u64>,
}

/// An inbound frame after decryption and classification
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment { text: String, is_final: bool },
    FinishReason(Option<String>),
    /// Complete non-streaming reply
    Terminal { content: String, usage: UsageNotice },
    Usage(UsageNotice),
    HostError { code: String, message: String },
    Ignored,
}

fn id_string(session: &Session) -> String {
    session.session_id.to_string()
}

/// First frame of a connection; re-sent after every reconnect
pub fn encode_session_init(session: &Session, host_key: Option<&VerifyingKey>) -> Result<String> {
    let message = match (&session.session_key, host_key) {
        (Some(key), Some(host_key)) => {
            let payload = SessionInitPayload {
                session_key: key.to_hex(),
                job_id: session.job_id.to_string(),
                chain_id: session.chain_id,
                model: session.model.clone(),
                price_per_token: session.price_per_token.to_string(),
                user_address: format!("{:?}", session.requester),
            };
            let sealed = seal_to_host(host_key, &serde_json::to_vec(&payload)?)?;
            OutboundMessage::EncryptedSessionInit {
                session_id: id_string(session),
                chain_id: session.chain_id,
                payload: sealed,
            }
        }
        (Some(_), None) => {
            return Err(MarketError::Encryption(
                "encrypted session requires the host public key".into(),
            ))
        }
        (None, _) => OutboundMessage::SessionInit {
            session_id: id_string(session),
            job_id: session.job_id.to_string(),
            chain_id: session.chain_id,
            model: session.model.clone(),
            price_per_token: session.price_per_token.to_string(),
            user_address: format!("{:?}", session.requester),
        },
    };
    Ok(serde_json::to_string(&message)?)
}

/// Encode a prompt, consuming one outbound message index
pub fn encode_prompt(session: &mut Session, prompt: &str, stream: bool) -> Result<String> {
    let index = session.next_message_index();
    let message = match &session.session_key {
        Some(key) => OutboundMessage::EncryptedMessage {
            session_id: id_string(session),
            payload: key.seal(index, prompt.as_bytes())?,
            stream,
        },
        None => OutboundMessage::Prompt {
            session_id: id_string(session),
            prompt: prompt.to_string(),
            message_index: index,
            stream,
        },
    };
    Ok(serde_json::to_string(&message)?)
}

pub fn encode_session_end(session: &Session) -> Result<String> {
    Ok(serde_json::to_string(&OutboundMessage::SessionEnd {
        session_id: id_string(session),
    })?)
}

fn open_payload(session: &mut Session, payload: &EncryptedPayload) -> Result<Vec<u8>> {
    let key = session.session_key.as_ref().ok_or_else(|| {
        MarketError::Protocol("encrypted frame on a plaintext session".into())
    })?;
    let plaintext = key.open(payload)?;
    // Only authenticated frames may advance the replay window
    session.accept_inbound_index(payload.index)?;
    Ok(plaintext)
}

/// Classify a raw inbound frame received while prompt `prompt_index` is
/// outstanding.
///
/// In streaming mode `response`/`encrypted_response` are finish-reason notices;
/// otherwise they are the terminal reply carrying text and usage. Frames that
/// fail to parse, decrypt, replay an index, or are tagged for another prompt
/// are reported as [`StreamEvent::Ignored`].
pub fn decode_frame(
    session: &mut Session,
    raw: &str,
    streaming: bool,
    prompt_index: u64,
) -> StreamEvent {
    let message: InboundMessage = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(e) => {
            warn!("Dropping malformed frame on session {}: {}", session.session_id, e);
            return StreamEvent::Ignored;
        }
    };
    if let Some(tagged) = message.message_index() {
        if tagged != prompt_index {
            warn!(
                "Dropping stale frame for prompt {} on session {} (awaiting {})",
                tagged, session.session_id, prompt_index
            );
            return StreamEvent::Ignored;
        }
    }

    match classify(session, message, streaming) {
        Ok(event) => event,
        Err(e) => {
            warn!("Dropping frame on session {}: {}", session.session_id, e);
            StreamEvent::Ignored
        }
    }
}

fn classify(session: &mut Session, message: InboundMessage, streaming: bool) -> Result<StreamEvent> {
    Ok(match message {
        InboundMessage::StreamChunk {
            content, is_final, ..
        } => StreamEvent::Fragment {
            text: content,
            is_final,
        },
        InboundMessage::EncryptedChunk {
            payload, is_final, ..
        } => {
            let plaintext = open_payload(session, &payload)?;
            let text = String::from_utf8(plaintext)
                .map_err(|e| MarketError::Protocol(format!("chunk is not UTF-8: {}", e)))?;
            StreamEvent::Fragment { text, is_final }
        }
        InboundMessage::StreamFinish { finish_reason, .. } => StreamEvent::FinishReason(finish_reason),
        InboundMessage::EncryptedResponse { payload, .. } => {
            let body: ResponseBody = serde_json::from_slice(&open_payload(session, &payload)?)?;
            response_event(body, streaming)
        }
        InboundMessage::Response {
            content,
            finish_reason,
            tokens_used,
            vlm_tokens,
            ..
        } => response_event(
            ResponseBody {
                content,
                finish_reason,
                tokens_used,
                vlm_tokens,
            },
            streaming,
        ),
        InboundMessage::StreamEnd {
            tokens_used,
            vlm_tokens,
            image_gen_tokens,
            ..
        } => StreamEvent::Usage(UsageNotice {
            tokens_used,
            vlm_tokens,
            image_gen_tokens,
        }),
        InboundMessage::Error { code, message, .. } => StreamEvent::HostError {
            code: code.unwrap_or_else(|| "HOST_ERROR".to_string()),
            message,
        },
        InboundMessage::Unknown => {
            debug!("Ignoring unknown frame type on session {}", session.session_id);
            StreamEvent::Ignored
        }
    })
}

fn response_event(body: ResponseBody, streaming: bool) -> StreamEvent {
    if streaming {
        StreamEvent::FinishReason(body.finish_reason)
    } else {
        StreamEvent::Terminal {
            content: body.content.unwrap_or_default(),
            usage: UsageNotice {
                tokens_used: body.tokens_used,
                vlm_tokens: body.vlm_tokens,
                image_gen_tokens: None,
            },
        }
    }
}
