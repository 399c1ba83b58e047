//! The client-facing ask protocol and the per-connection handler.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::UserId;
use crate::error::{Error, Result};
use crate::models::{ModelCatalog, PLUGINS_MODEL, Source};
use crate::pipeline::{AskEvent, AskOutcome, Broker};
use crate::tree::MessageNode;

/// Frame tips, resolved to user-facing text by the client.
pub mod tips {
    pub const QUEUEING: &str = "tips.queueing";
    pub const WAITING: &str = "tips.waiting";
    pub const TIMEOUT: &str = "errors.timeout";
    pub const UPSTREAM_ERROR: &str = "errors.upstreamError";
    pub const HTTP_ERROR: &str = "errors.httpError";
    pub const INTERNAL: &str = "errors.internal";
    pub const ALREADY_BUSY: &str = "errors.alreadyBusy";
    pub const INVALID_REQUEST: &str = "errors.invalidRequest";
}

/// Text that asks the browser session to keep generating the last reply.
pub const CONTINUE_TEXT: &str = ":continue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskRequest {
    pub source: Source,
    pub model: String,
    pub new_conversation: bool,
    #[serde(default)]
    pub new_title: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub parent: Option<Uuid>,
    pub text_content: String,
    /// API only: how many ancestors to replay, `-1` for the whole path.
    #[serde(default)]
    pub api_context_message_count: Option<i64>,
    /// Browser session only, with the plugins model on a new conversation.
    #[serde(default)]
    pub openai_web_plugin_ids: Option<Vec<String>>,
}

impl AskRequest {
    pub fn new_conversation(source: Source, model: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source,
            model: model.into(),
            new_conversation: true,
            new_title: None,
            conversation_id: None,
            parent: None,
            text_content: text.into(),
            api_context_message_count: None,
            openai_web_plugin_ids: None,
        }
    }

    pub fn follow_up(
        source: Source,
        model: impl Into<String>,
        conversation_id: Uuid,
        parent: Uuid,
        text: impl Into<String>,
    ) -> Self {
        Self {
            new_conversation: false,
            conversation_id: Some(conversation_id),
            parent: Some(parent),
            ..Self::new_conversation(source, model, text)
        }
    }

    pub fn is_continue(&self) -> bool {
        self.text_content == CONTINUE_TEXT
    }

    /// Structural checks that need no store access.
    pub fn validate(&self, catalog: &ModelCatalog) -> Result<()> {
        let invalid = |detail: &str| Err(Error::InvalidRequest(detail.to_string()));

        if self.text_content.trim().is_empty() {
            return invalid("text_content is empty");
        }
        if !catalog.contains(&self.model) {
            return Err(Error::InvalidRequest(format!(
                "model {:?} is not offered by {}",
                self.model, self.source
            )));
        }

        if self.new_conversation {
            if self.conversation_id.is_some() || self.parent.is_some() {
                return invalid("a new conversation cannot name a conversation or parent");
            }
            if self.new_title.as_deref().is_some_and(|t| t.trim().is_empty()) {
                return invalid("new_title is blank");
            }
        } else {
            if self.conversation_id.is_none() || self.parent.is_none() {
                return invalid("continuing a conversation needs conversation_id and parent");
            }
            if self.new_title.is_some() {
                return invalid("new_title is only accepted for new conversations");
            }
        }

        if let Some(count) = self.api_context_message_count {
            if self.source != Source::Api {
                return invalid("api_context_message_count only applies to the api source");
            }
            if count < -1 {
                return invalid("api_context_message_count must be -1 or more");
            }
        }

        if self
            .openai_web_plugin_ids
            .as_ref()
            .is_some_and(|ids| !ids.is_empty())
            && (self.source != Source::BrowserSession
                || self.model != PLUGINS_MODEL
                || !self.new_conversation)
        {
            return invalid("plugin ids need the plugins model on a new browser-session conversation");
        }

        if self.is_continue() && (self.source != Source::BrowserSession || self.new_conversation) {
            return invalid(":continue needs an existing browser-session conversation");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Waiting,
    Queueing,
    Message,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskFrame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl AskFrame {
    fn bare(kind: FrameType, tip: Option<&str>) -> Self {
        Self {
            kind,
            tip: tip.map(ToString::to_string),
            conversation_id: None,
            message: None,
            error_detail: None,
        }
    }

    pub fn waiting() -> Self {
        Self::bare(FrameType::Waiting, Some(tips::WAITING))
    }

    pub fn queueing() -> Self {
        Self::bare(FrameType::Queueing, Some(tips::QUEUEING))
    }

    pub fn message(conversation_id: Option<Uuid>, message: MessageNode) -> Self {
        Self {
            conversation_id,
            message: Some(message),
            ..Self::bare(FrameType::Message, None)
        }
    }

    pub fn error(tip: &str, detail: Option<String>) -> Self {
        Self {
            error_detail: detail,
            ..Self::bare(FrameType::Error, Some(tip))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Finished,
    Unauthorized,
    InvalidRequest,
    UserLeftQueue,
    Timeout,
    UpstreamError,
    InternalError,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            CloseCode::Finished => 1000,
            CloseCode::Unauthorized => 4001,
            CloseCode::InvalidRequest => 4002,
            CloseCode::UserLeftQueue => 4003,
            CloseCode::Timeout => 4004,
            CloseCode::UpstreamError => 4005,
            CloseCode::InternalError => 1011,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::Finished => "finished",
            CloseCode::Unauthorized => "unauthorized",
            CloseCode::InvalidRequest => "invalidRequest",
            CloseCode::UserLeftQueue => "userLeftQueue",
            CloseCode::Timeout => "timeout",
            CloseCode::UpstreamError => "upstreamError",
            CloseCode::InternalError => "internalError",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("client connection closed")]
pub struct ConnectionClosed;

/// One duplex client connection, as seen by [`SessionHandler`].
#[async_trait]
pub trait ClientConnection: Send {
    /// The next request, an undecodable message as `Err(detail)`, or `None`
    /// once the client has gone. Must be cancel safe.
    async fn recv(&mut self) -> Option<std::result::Result<AskRequest, String>>;
    async fn send(&mut self, frame: &AskFrame) -> std::result::Result<(), ConnectionClosed>;
    async fn close(&mut self, code: CloseCode);
}

/// Drives one request/response cycle on a connection.
#[derive(Clone)]
pub struct SessionHandler {
    broker: Broker,
}

enum Step {
    Event(Option<AskEvent>),
    Incoming(Option<std::result::Result<AskRequest, String>>),
}

impl SessionHandler {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Serve one ask. Returns `None` if the client left before asking.
    pub async fn run<C>(&self, user: UserId, conn: &mut C) -> Option<AskOutcome>
    where
        C: ClientConnection + ?Sized,
    {
        let request = match conn.recv().await? {
            Ok(request) => request,
            Err(detail) => {
                let outcome = AskOutcome::Invalid(detail.clone());
                if conn
                    .send(&AskFrame::error(tips::INVALID_REQUEST, Some(detail)))
                    .await
                    .is_ok()
                {
                    conn.close(outcome.close_code()).await;
                }
                return Some(outcome);
            }
        };

        let mut stream = self.broker.submit(user, request);
        let mut client_open = true;

        let outcome = loop {
            let step = tokio::select! {
                event = stream.next() => Step::Event(event),
                incoming = conn.recv(), if client_open => Step::Incoming(incoming),
            };

            match step {
                Step::Event(Some(AskEvent::Frame(frame))) => {
                    if client_open && conn.send(&frame).await.is_err() {
                        client_open = false;
                        stream.cancel();
                    }
                }
                Step::Event(Some(AskEvent::Finished(outcome))) => break outcome,
                Step::Event(None) => {
                    tracing::error!(user, "ask task ended without an outcome");
                    break AskOutcome::Failed(crate::pipeline::FailureKind::Internal);
                }
                Step::Incoming(None) => {
                    tracing::info!(user, "client disconnected mid-ask");
                    client_open = false;
                    stream.cancel();
                }
                Step::Incoming(Some(_)) => {
                    let busy = AskFrame::error(tips::ALREADY_BUSY, None);
                    if conn.send(&busy).await.is_err() {
                        client_open = false;
                        stream.cancel();
                    }
                }
            }
        };

        if client_open {
            conn.close(outcome.close_code()).await;
        }
        Some(outcome)
    }
}
