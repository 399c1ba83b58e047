mod api;
mod stream;
mod types;
mod web;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parley_llm::{ChatSource, Error, RemoteConversations};

pub use stream::{api_events, web_events};

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Configuration for the browser-session source (the ChatGPT web backend).
#[derive(Debug, Clone)]
pub struct BrowserSessionConfig {
    pub access_token: String,
    pub base_url: String,
    /// Connect timeout and timeout for non-streaming calls.
    pub common_timeout: Duration,
    /// Read timeout while a reply streams.
    pub ask_timeout: Duration,
    /// Sent as `Chatgpt-Account-Id` for team workspaces.
    pub team_account_id: Option<String>,
    pub extra_headers: HashMap<String, String>,
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            base_url: "https://chat.openai.com/backend-api/".into(),
            common_timeout: Duration::from_secs(20),
            ask_timeout: Duration::from_secs(600),
            team_account_id: None,
            extra_headers: HashMap::new(),
        }
    }
}

/// Configuration for the stateless API source.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_key: String,
    pub base_url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1/".into(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// A browser-session source plus the handle for its upstream conversation
/// copies. Both share one HTTP client.
pub struct BrowserSession {
    pub source: ChatSource,
    pub remote: Arc<dyn RemoteConversations>,
}

/// Create the browser-session source.
pub fn browser_session(config: BrowserSessionConfig) -> Result<BrowserSession, Error> {
    let client = reqwest::Client::builder()
        .connect_timeout(config.common_timeout)
        .read_timeout(config.ask_timeout)
        .build()
        .map_err(|e| Error::Http(Box::new(e)))?;
    let state = Arc::new(web::WebState { client, config });
    Ok(BrowserSession {
        source: ChatSource::new(web::WebSource {
            state: Arc::clone(&state),
        }),
        remote: Arc::new(web::WebRemote { state }),
    })
}

/// Create the API source.
pub fn api(config: ApiConfig) -> Result<ChatSource, Error> {
    let client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.read_timeout)
        .build()
        .map_err(|e| Error::Http(Box::new(e)))?;
    Ok(ChatSource::new(api::ApiSource {
        state: Arc::new(api::ApiState { client, config }),
    }))
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

pub(crate) fn map_reqwest_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else {
        Error::Http(Box::new(e))
    }
}

pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Turn a non-2xx response into [`Error::Api`], keeping the body text.
pub(crate) async fn check_response(resp: reqwest::Response) -> Result<reqwest::Response, Error> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();
    Err(Error::Api {
        code: status.as_str().to_string(),
        message: body_text,
        metadata: Default::default(),
    })
}
