use async_trait::async_trait;

use crate::error::Error;

/// Conversation bookkeeping on a source that keeps its own copy of every
/// conversation (the browser-session source).
#[async_trait]
pub trait RemoteConversations: Send + Sync {
    /// Raw conversation payload with its id-keyed `mapping`.
    async fn fetch_conversation(&self, conversation_id: &str) -> Result<serde_json::Value, Error>;

    /// Hide a conversation upstream.
    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), Error>;

    async fn set_conversation_title(&self, conversation_id: &str, title: &str)
    -> Result<(), Error>;

    /// Ask the upstream to title a conversation from one of its messages.
    async fn generate_title(&self, conversation_id: &str, message_id: &str)
    -> Result<String, Error>;
}
