pub mod admission;
pub mod conversations;
pub mod counter;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod protocol;
pub mod quota;
pub mod sanitize;
pub mod stats;
pub mod status;
pub mod store;
pub mod tree;

/// Users are identified by the numeric id of the account layer in front.
pub type UserId = i64;

pub use admission::{AdmissionController, AdmissionPermit};
pub use conversations::ConversationService;
pub use counter::SlidingWindowCounter;
pub use error::{Error, Result};
pub use models::{ModelCatalog, Source};
pub use pipeline::{AskEvent, AskOutcome, AskStream, Broker, FailureKind, SourceSetup, Stores};
pub use protocol::{AskFrame, AskRequest, ClientConnection, CloseCode, FrameType, SessionHandler};
pub use quota::{Allowance, Decision, DenyReason, QuotaGate, QuotaState};
pub use stats::{AskRecord, AskStatus, AskSummary, StatsConfig, UsageStats};
pub use store::{ConversationRecord, HistoryStore, QuotaStore, RecordStore};
pub use tree::{ConversationHistory, MessageContent, MessageMetadata, MessageNode, Role};
