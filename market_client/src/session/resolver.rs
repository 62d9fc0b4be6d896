//! Prompt resolution state machine.
//!
//! A prompt resolves exactly once: on the usage notice, on the terminal reply
//! of a non-streaming exchange, or on the safety timeout armed by the final
//! content marker. Finish-reason notices never resolve, because the vision
//! token count may still be on its way.

use super::message::{StreamEvent, UsageNotice};
use super::TokenUsageInfo;
use crate::error::{MarketError, Result};

/// Result of a resolved prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOutcome {
    pub response: String,
    /// `None` when the safety timeout fired before any usage notice
    pub usage: Option<TokenUsageInfo>,
}

/// What the driver must do after feeding an event
#[derive(Debug)]
pub enum Step {
    Continue,
    /// Forward `text` to the chunk callback; arm the safety timer when `is_final`
    Fragment { text: String, is_final: bool },
    Resolved(PromptOutcome),
    Failed(MarketError),
}

#[derive(Debug)]
pub struct PromptResolver {
    streaming: bool,
    buffer: String,
    fragments: u64,
    final_seen: bool,
    finish_reason: Option<String>,
    resolved: bool,
}

impl PromptResolver {
    pub fn new(streaming: bool) -> Self {
        Self {
            streaming,
            buffer: String::new(),
            fragments: 0,
            final_seen: false,
            finish_reason: None,
            resolved: false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// True once the final content marker has been seen
    pub fn awaiting_usage(&self) -> bool {
        self.final_seen && !self.resolved
    }

    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn on_event(&mut self, event: StreamEvent) -> Step {
        if self.resolved {
            return Step::Continue;
        }
        match event {
            StreamEvent::Fragment { text, is_final } => {
                self.fragments = self.fragments.saturating_add(1);
                self.buffer.push_str(&text);
                if is_final {
                    self.final_seen = true;
                }
                if self.streaming {
                    Step::Fragment { text, is_final }
                } else if is_final {
                    Step::Fragment {
                        text: String::new(),
                        is_final,
                    }
                } else {
                    Step::Continue
                }
            }
            StreamEvent::FinishReason(reason) => {
                self.finish_reason = reason;
                Step::Continue
            }
            StreamEvent::Usage(usage) => {
                let response = std::mem::take(&mut self.buffer);
                self.resolve(response, usage)
            }
            StreamEvent::Terminal { content, usage } => {
                let response = if content.is_empty() {
                    std::mem::take(&mut self.buffer)
                } else {
                    content
                };
                self.resolve(response, usage)
            }
            StreamEvent::HostError { code, message } => {
                self.resolved = true;
                Step::Failed(MarketError::Host { code, message })
            }
            StreamEvent::Ignored => Step::Continue,
        }
    }

    /// Resolve with the text so far and no usage; `None` if already resolved
    pub fn on_safety_timeout(&mut self) -> Option<PromptOutcome> {
        if self.resolved {
            return None;
        }
        self.resolved = true;
        Some(PromptOutcome {
            response: std::mem::take(&mut self.buffer),
            usage: None,
        })
    }

    fn resolve(&mut self, response: String, usage: UsageNotice) -> Step {
        self.resolved = true;
        match usage_from(usage, self.fragments) {
            Ok(usage) => Step::Resolved(PromptOutcome {
                response,
                usage: Some(usage),
            }),
            Err(e) => Step::Failed(e),
        }
    }
}

/// `llm = tokens_used ?? fragments`, `vlm = vlm_tokens ?? 0`.
///
/// Counts come from the host; a sum that does not fit in `u64` is a protocol
/// violation.
pub fn usage_from(notice: UsageNotice, fragments: u64) -> Result<TokenUsageInfo> {
    let llm_tokens = notice.tokens_used.unwrap_or(fragments);
    let vlm_tokens = notice.vlm_tokens.unwrap_or(0);
    let total_tokens = llm_tokens.checked_add(vlm_tokens).ok_or_else(|| {
        MarketError::Protocol(format!(
            "token counts overflow: {} llm + {} vlm",
            llm_tokens, vlm_tokens
        ))
    })?;
    Ok(TokenUsageInfo {
        llm_tokens,
        vlm_tokens,
        image_gen_tokens: notice.image_gen_tokens.unwrap_or(0),
        total_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, is_final: bool) -> StreamEvent {
        StreamEvent::Fragment {
            text: text.into(),
            is_final,
        }
    }

    #[test]
    fn test_finish_reason_does_not_resolve() {
        let mut resolver = PromptResolver::new(true);
        resolver.on_event(chunk("Hel", false));
        resolver.on_event(chunk("lo", true));
        assert!(matches!(
            resolver.on_event(StreamEvent::FinishReason(Some("stop".into()))),
            Step::Continue
        ));
        assert!(!resolver.is_resolved());
        assert!(resolver.awaiting_usage());

        let step = resolver.on_event(StreamEvent::Usage(UsageNotice {
            tokens_used: Some(40),
            vlm_tokens: Some(258),
            image_gen_tokens: None,
        }));
        match step {
            Step::Resolved(outcome) => {
                assert_eq!(outcome.response, "Hello");
                let usage = outcome.usage.unwrap();
                assert_eq!(usage.llm_tokens, 40);
                assert_eq!(usage.vlm_tokens, 258);
                assert_eq!(usage.total_tokens, 298);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fragment_count_fallback() {
        let mut resolver = PromptResolver::new(true);
        for part in ["a", "b", "c"] {
            resolver.on_event(chunk(part, false));
        }
        match resolver.on_event(StreamEvent::Usage(UsageNotice::default())) {
            Step::Resolved(outcome) => {
                let usage = outcome.usage.unwrap();
                assert_eq!(usage.llm_tokens, 3);
                assert_eq!(usage.vlm_tokens, 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resolves_exactly_once() {
        let mut resolver = PromptResolver::new(true);
        resolver.on_event(chunk("x", true));
        assert!(matches!(
            resolver.on_event(StreamEvent::Usage(UsageNotice::default())),
            Step::Resolved(_)
        ));
        assert!(matches!(
            resolver.on_event(StreamEvent::Usage(UsageNotice::default())),
            Step::Continue
        ));
        assert!(resolver.on_safety_timeout().is_none());
    }

    #[test]
    fn test_safety_timeout_keeps_text() {
        let mut resolver = PromptResolver::new(true);
        resolver.on_event(chunk("partial ", false));
        resolver.on_event(chunk("answer", true));
        let outcome = resolver.on_safety_timeout().unwrap();
        assert_eq!(outcome.response, "partial answer");
        assert!(outcome.usage.is_none());
        assert!(matches!(
            resolver.on_event(StreamEvent::Usage(UsageNotice::default())),
            Step::Continue
        ));
    }

    #[test]
    fn test_non_streaming_terminal() {
        let mut resolver = PromptResolver::new(false);
        assert!(matches!(
            resolver.on_event(chunk("ignored by callback", false)),
            Step::Continue
        ));
        match resolver.on_event(StreamEvent::Terminal {
            content: "whole reply".into(),
            usage: UsageNotice::default(),
        }) {
            Step::Resolved(outcome) => {
                assert_eq!(outcome.response, "whole reply");
                assert_eq!(outcome.usage.unwrap().llm_tokens, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_overflowing_usage_fails_prompt() {
        let mut resolver = PromptResolver::new(true);
        resolver.on_event(chunk("x", true));
        match resolver.on_event(StreamEvent::Usage(UsageNotice {
            tokens_used: Some(u64::MAX),
            vlm_tokens: Some(1),
            image_gen_tokens: None,
        })) {
            Step::Failed(err) => assert_eq!(err.code(), "PROTOCOL_ERROR"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(resolver.is_resolved());
        assert!(resolver.on_safety_timeout().is_none());
    }

    #[test]
    fn test_host_error_fails_prompt() {
        let mut resolver = PromptResolver::new(true);
        match resolver.on_event(StreamEvent::HostError {
            code: "MODEL_BUSY".into(),
            message: "try later".into(),
        }) {
            Step::Failed(err) => assert_eq!(err.code(), "HOST_ERROR"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(resolver.is_resolved());
    }
}
