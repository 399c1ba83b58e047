//! Upstream wire types.
//!
//! These are the raw JSON shapes sent to / received from the two sources.
//! They are intentionally separate from the parley-llm public types.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Browser-session request
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct WebCompleteRequest {
    pub action: WebAction,
    /// Always sent, as `null` when absent.
    pub arkose_token: Option<String>,
    pub conversation_mode: ConversationMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<WebInputMessage>>,
    pub parent_message_id: String,
    pub model: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plugin_ids: Vec<String>,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebAction {
    Next,
    Continue,
}

#[derive(Debug, Serialize)]
pub struct ConversationMode {
    pub kind: String,
}

#[derive(Debug, Serialize)]
pub struct WebInputMessage {
    pub id: String,
    pub author: WebAuthor,
    pub content: WebInputContent,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct WebAuthor {
    pub role: String,
}

#[derive(Debug, Serialize)]
pub struct WebInputContent {
    pub content_type: String,
    pub parts: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct WebPatch<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_visible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<&'a str>,
}

#[derive(Debug, Serialize)]
pub struct WebGenTitleRequest<'a> {
    pub message_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
pub struct WebGenTitleResponse {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// API request / stream chunks
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: parley_llm::ContextRole,
    pub content: String,
}

/// One `data:` payload of a `/chat/completions` stream.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}
