use serde::{Deserialize, Serialize};

/// An event emitted while an upstream source streams a reply.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A cumulative message snapshot from a browser-session source.
    ///
    /// Carries the raw `{"message": {...}, "conversation_id": ...}` object;
    /// each snapshot supersedes the previous one with the same message id.
    Snapshot(serde_json::Value),

    /// A chunk of reply text from an API source.
    TextDelta {
        /// Upstream completion id, present on every chunk.
        id: Option<String>,
        delta: String,
    },

    /// Generation is complete.
    Finish {
        reason: Option<FinishReason>,
        usage: Option<Usage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    #[serde(untagged)]
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
