//! Stream events and aggregated chat results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event decoded from the response stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Incremental text content.
    TextDelta(String),
    /// Generated image URLs delivered in one frame.
    ImageBatch(Vec<String>),
    /// Terminal event. Emitted at most once, always last.
    Final {
        /// Conversation identifier the request ran under.
        conversation_id: String,
        /// Finish reason reported by the service, when present.
        finish_reason: Option<String>,
        /// Token usage reported by the service, when present.
        usage: Option<Usage>,
    },
}

/// Token usage accounting from the terminal frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens produced in the completion.
    pub completion_tokens: u64,
    /// Total tokens. Derived from the parts when not reported directly.
    pub total_tokens: u64,
}

impl Usage {
    /// Parse usage out of a terminal-frame object.
    ///
    /// The service has shipped several key spellings over time; all known
    /// variants are accepted. Returns `None` when no usage keys are present
    /// at all.
    #[must_use]
    pub fn from_wire(value: &Value) -> Option<Self> {
        fn pick(value: &Value, keys: &[&str]) -> Option<u64> {
            keys.iter().find_map(|k| value.get(*k)?.as_u64())
        }

        let prompt = pick(
            value,
            &[
                "promptTokens",
                "input_tokens",
                "promptTokenCount",
                "prompt_tokens",
            ],
        );
        let completion = pick(
            value,
            &[
                "completionTokens",
                "output_tokens",
                "candidatesTokenCount",
                "completion_tokens",
            ],
        );
        let total = pick(value, &["totalTokenCount", "total_tokens"]);

        if prompt.is_none() && completion.is_none() && total.is_none() {
            return None;
        }

        let prompt_tokens = prompt.unwrap_or(0);
        let completion_tokens = completion.unwrap_or(0);
        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: total.unwrap_or(prompt_tokens + completion_tokens),
        })
    }
}

/// Fully aggregated result of one chat turn.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResult {
    /// Concatenation of every text delta, in order.
    pub text: String,
    /// Every generated image URL, in arrival order.
    pub image_urls: Vec<String>,
    /// Conversation identifier, for follow-up turns.
    pub conversation_id: String,
    /// Finish reason from the terminal event.
    pub finish_reason: Option<String>,
    /// Usage from the terminal event.
    pub usage: Option<Usage>,
}

impl ChatResult {
    /// Fold one stream event into the accumulated result.
    pub fn absorb(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::TextDelta(delta) => self.text.push_str(&delta),
            StreamEvent::ImageBatch(urls) => self.image_urls.extend(urls),
            StreamEvent::Final {
                conversation_id,
                finish_reason,
                usage,
            } => {
                self.conversation_id = conversation_id;
                self.finish_reason = finish_reason;
                self.usage = usage;
            }
        }
    }
}
