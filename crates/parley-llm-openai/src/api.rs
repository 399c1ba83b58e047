//! The stateless API source: the full context is replayed to
//! `POST chat/completions` on every ask.

use std::sync::Arc;

use parley_llm::{ChatSourceBackend, CompletionRequest, ContextRole, Error, Response};
use tokio_stream::StreamExt;

use crate::types::{ChatCompletionRequest, ChatMessage};
use crate::{ApiConfig, check_response, join_url, map_reqwest_error};

pub(crate) struct ApiState {
    pub client: reqwest::Client,
    pub config: ApiConfig,
}

pub(crate) struct ApiSource {
    pub state: Arc<ApiState>,
}

impl ChatSourceBackend for ApiSource {
    fn name(&self) -> &str {
        "api"
    }

    fn complete(&self, request: CompletionRequest) -> Response {
        let state = Arc::clone(&self.state);
        let body = to_api_request(&request);

        Response::new(async_stream::try_stream! {
            tracing::debug!(
                model = %body.model,
                context = body.messages.len(),
                "posting api completion"
            );
            let resp = state
                .client
                .post(join_url(&state.config.base_url, "chat/completions"))
                .bearer_auth(&state.config.api_key)
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            let resp = check_response(resp).await?;

            let bytes = resp.bytes_stream().map(|chunk| chunk.map_err(map_reqwest_error));
            let mut events = Box::pin(crate::stream::api_events(bytes));
            while let Some(event) = events.next().await {
                yield event?;
            }
        })
    }
}

pub(crate) fn to_api_request(request: &CompletionRequest) -> ChatCompletionRequest {
    let mut messages: Vec<ChatMessage> = request
        .context
        .iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content.clone(),
        })
        .collect();
    messages.push(ChatMessage {
        role: ContextRole::User,
        content: request.text.clone(),
    });

    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: true,
    }
}
