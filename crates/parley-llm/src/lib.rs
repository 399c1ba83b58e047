pub mod error;
pub mod remote;
pub mod request;
pub mod response;
pub mod source;
pub mod stream;

pub use error::Error;
pub use remote::RemoteConversations;
pub use request::{CompletionRequest, ContextMessage, ContextRole};
pub use response::{CompletionResult, Response};
pub use source::{ChatSource, ChatSourceBackend};
pub use stream::{FinishReason, StreamEvent, Usage};
