//! The browser-session source: asks go to `POST conversation`, conversation
//! copies live under `conversation/{id}`.

use std::sync::Arc;

use async_trait::async_trait;
use parley_llm::{ChatSourceBackend, CompletionRequest, Error, RemoteConversations, Response};
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::types::{
    ConversationMode, WebAction, WebAuthor, WebCompleteRequest, WebGenTitleRequest,
    WebGenTitleResponse, WebInputContent, WebInputMessage, WebPatch,
};
use crate::{BrowserSessionConfig, check_response, join_url, map_reqwest_error};

pub(crate) struct WebState {
    pub client: reqwest::Client,
    pub config: BrowserSessionConfig,
}

impl WebState {
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, join_url(&self.config.base_url, path))
            .bearer_auth(&self.config.access_token)
            .header("Accept-Language", "en-US,en;q=0.9")
            .header("Referer", "https://chat.openai.com/");
        if let Some(account_id) = &self.config.team_account_id {
            req = req.header("Chatgpt-Account-Id", account_id);
        }
        for (k, v) in &self.config.extra_headers {
            req = req.header(k, v);
        }
        req
    }

    async fn patch(&self, conversation_id: &str, patch: WebPatch<'_>) -> Result<(), Error> {
        let resp = self
            .request(
                reqwest::Method::PATCH,
                &format!("conversation/{conversation_id}"),
            )
            .timeout(self.config.common_timeout)
            .json(&patch)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_response(resp).await?;
        Ok(())
    }
}

pub(crate) struct WebSource {
    pub state: Arc<WebState>,
}

impl ChatSourceBackend for WebSource {
    fn name(&self) -> &str {
        "browser_session"
    }

    fn complete(&self, request: CompletionRequest) -> Response {
        let state = Arc::clone(&self.state);
        let body = to_web_request(&request);

        Response::new(async_stream::try_stream! {
            tracing::debug!(
                model = %body.model,
                conversation_id = ?body.conversation_id,
                "posting browser-session ask"
            );
            let resp = state
                .request(reqwest::Method::POST, "conversation")
                .header("Accept", "text/event-stream")
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let resp = check_response(resp).await?;

            let bytes = resp.bytes_stream().map(|chunk| chunk.map_err(map_reqwest_error));
            let mut events = Box::pin(crate::stream::web_events(bytes));
            while let Some(event) = events.next().await {
                yield event?;
            }
        })
    }
}

pub(crate) fn to_web_request(request: &CompletionRequest) -> WebCompleteRequest {
    let parent_message_id = request.parent_id.unwrap_or_else(Uuid::new_v4).to_string();
    let (action, messages) = if request.is_continue() && request.conversation_id.is_some() {
        (WebAction::Continue, None)
    } else {
        let message = WebInputMessage {
            id: request.message_id.to_string(),
            author: WebAuthor {
                role: "user".into(),
            },
            content: WebInputContent {
                content_type: "text".into(),
                parts: vec![request.text.clone()],
            },
            metadata: serde_json::Map::new(),
        };
        (WebAction::Next, Some(vec![message]))
    };

    WebCompleteRequest {
        action,
        arkose_token: None,
        conversation_mode: ConversationMode {
            kind: "primary_assistant".into(),
        },
        conversation_id: request.conversation_id.map(|id| id.to_string()),
        messages,
        parent_message_id,
        model: request.model.clone(),
        plugin_ids: request.plugin_ids.clone(),
    }
}

pub(crate) struct WebRemote {
    pub state: Arc<WebState>,
}

#[async_trait]
impl RemoteConversations for WebRemote {
    async fn fetch_conversation(&self, conversation_id: &str) -> Result<serde_json::Value, Error> {
        let resp = self
            .state
            .request(
                reqwest::Method::GET,
                &format!("conversation/{conversation_id}"),
            )
            .timeout(self.state.config.common_timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let resp = check_response(resp).await?;
        let bytes = resp.bytes().await.map_err(map_reqwest_error)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), Error> {
        self.state
            .patch(
                conversation_id,
                WebPatch {
                    is_visible: Some(false),
                    title: None,
                },
            )
            .await
    }

    async fn set_conversation_title(&self, conversation_id: &str, title: &str) -> Result<(), Error> {
        self.state
            .patch(
                conversation_id,
                WebPatch {
                    is_visible: None,
                    title: Some(title),
                },
            )
            .await
    }

    async fn generate_title(&self, conversation_id: &str, message_id: &str) -> Result<String, Error> {
        let resp = self
            .state
            .request(
                reqwest::Method::POST,
                &format!("conversation/gen_title/{conversation_id}"),
            )
            .timeout(self.state.config.common_timeout)
            .json(&WebGenTitleRequest { message_id })
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let resp = check_response(resp).await?;
        let bytes = resp.bytes().await.map_err(map_reqwest_error)?;
        generated_title(serde_json::from_slice(&bytes)?)
    }
}

/// An upstream that cannot title the conversation answers 200 with a
/// `message` and no `title`.
fn generated_title(resp: WebGenTitleResponse) -> Result<String, Error> {
    match resp.title.filter(|title| !title.trim().is_empty()) {
        Some(title) => Ok(title),
        None => Err(Error::Other(format!(
            "failed to generate title: {}",
            resp.message.as_deref().unwrap_or("no title returned")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_conversation_posts_next_with_random_parent() {
        let request = CompletionRequest::new("text-davinci-002-render-sha", "Hello");
        let body = serde_json::to_value(to_web_request(&request)).expect("json");

        assert_eq!(body["action"], "next");
        assert!(body["arkose_token"].is_null());
        assert_eq!(body["conversation_mode"]["kind"], "primary_assistant");
        assert!(body.get("conversation_id").is_none());
        assert_eq!(body["messages"][0]["author"]["role"], "user");
        assert_eq!(body["messages"][0]["content"]["parts"][0], "Hello");
        assert_eq!(body["messages"][0]["id"], request.message_id.to_string());
        assert!(Uuid::parse_str(body["parent_message_id"].as_str().unwrap_or("")).is_ok());
        assert!(body.get("plugin_ids").is_none());
    }

    #[test]
    fn continue_keeps_parent_and_omits_messages() {
        let mut request = CompletionRequest::new("gpt-4", ":continue");
        let conversation = Uuid::new_v4();
        let parent = Uuid::new_v4();
        request.conversation_id = Some(conversation);
        request.parent_id = Some(parent);
        request.plugin_ids = vec!["plugin-a".into()];

        let body = serde_json::to_value(to_web_request(&request)).expect("json");
        assert_eq!(body["action"], "continue");
        assert!(body.get("messages").is_none());
        assert_eq!(body["conversation_id"], conversation.to_string());
        assert_eq!(body["parent_message_id"], parent.to_string());
        assert_eq!(body["plugin_ids"][0], "plugin-a");
    }

    #[test]
    fn generated_title_needs_a_non_blank_title() {
        let ok: WebGenTitleResponse =
            serde_json::from_value(serde_json::json!({ "title": "Trip plans" })).expect("json");
        assert_eq!(generated_title(ok).expect("title"), "Trip plans");

        let refused: WebGenTitleResponse = serde_json::from_value(
            serde_json::json!({ "title": "", "message": "conversation too short" }),
        )
        .expect("json");
        let err = generated_title(refused).expect_err("blank title");
        assert!(err.to_string().contains("conversation too short"));
    }
}
