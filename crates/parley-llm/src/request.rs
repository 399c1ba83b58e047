use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One ask against an upstream source, already resolved to upstream terms.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Upstream model code (e.g. `"text-davinci-002-render-sha"`).
    pub model: String,
    /// Existing upstream conversation, `None` for a new one.
    pub conversation_id: Option<Uuid>,
    /// Message the new user turn hangs off.
    pub parent_id: Option<Uuid>,
    /// Id assigned to the new user turn.
    pub message_id: Uuid,
    pub text: String,
    /// Ancestor messages replayed to stateless sources, oldest first.
    pub context: Vec<ContextMessage>,
    pub plugin_ids: Vec<String>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            conversation_id: None,
            parent_id: None,
            message_id: Uuid::new_v4(),
            text: text.into(),
            context: Vec::new(),
            plugin_ids: Vec::new(),
        }
    }

    /// `:continue` asks the browser-session source to keep generating the
    /// previous reply instead of posting a new user turn.
    pub fn is_continue(&self) -> bool {
        self.text == ":continue"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: ContextRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextRole {
    System,
    User,
    Assistant,
    Tool,
}
