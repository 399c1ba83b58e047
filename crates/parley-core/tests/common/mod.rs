#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use parley_core::protocol::ConnectionClosed;
use parley_core::{
    AskFrame, AskRequest, Broker, ClientConnection, CloseCode, ConversationHistory,
    ConversationRecord, HistoryStore, ModelCatalog, QuotaState, QuotaStore, RecordStore, Source,
    SourceSetup, StatsConfig, Stores, UsageStats,
};
use parley_llm::{
    ChatSource, ChatSourceBackend, CompletionRequest, RemoteConversations, Response, StreamEvent,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const USER: i64 = 1;
pub const OTHER_USER: i64 = 2;

// ---------------------------------------------------------------------------
// Stub upstream
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct StubSource {
    frames: Vec<StreamEvent>,
    /// `(code, message)` of an `Api` error raised after the frames.
    error: Option<(String, String)>,
    delay: Duration,
    hang_after: bool,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl StubSource {
    pub fn new(frames: Vec<StreamEvent>) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }

    pub fn failing(code: &str, message: &str) -> Self {
        Self {
            error: Some((code.to_string(), message.to_string())),
            ..Self::default()
        }
    }

    /// Never finishes after the given frames.
    pub fn hanging(frames: Vec<StreamEvent>) -> Self {
        Self {
            hang_after: true,
            ..Self::new(frames)
        }
    }

    /// Fail with an `Api` error after the frames.
    pub fn with_error(mut self, code: &str, message: &str) -> Self {
        self.error = Some((code.to_string(), message.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        Arc::clone(&self.requests)
    }
}

struct StubBackend(StubSource);

impl ChatSourceBackend for StubBackend {
    fn name(&self) -> &str {
        "stub"
    }

    fn complete(&self, request: CompletionRequest) -> Response {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        self.0.requests.lock().push(request);

        let delay = self.0.delay;
        let mut items: Vec<Result<StreamEvent, parley_llm::Error>> =
            self.0.frames.iter().cloned().map(Ok).collect();
        if let Some((code, message)) = &self.0.error {
            items.push(Err(parley_llm::Error::Api {
                code: code.clone(),
                message: message.clone(),
                metadata: Default::default(),
            }));
        }
        let frames = futures::stream::iter(items).then(move |frame| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            frame
        });
        if self.0.hang_after {
            Response::new(frames.chain(futures::stream::pending()))
        } else {
            Response::new(frames)
        }
    }
}

pub fn web_snapshot(conversation_id: Uuid, message_id: Uuid, text: &str) -> StreamEvent {
    StreamEvent::Snapshot(json!({
        "conversation_id": conversation_id.to_string(),
        "message": {
            "id": message_id.to_string(),
            "author": { "role": "assistant" },
            "content": { "content_type": "text", "parts": [text] },
            "status": "in_progress",
            "metadata": { "model_slug": "text-davinci-002-render-sha" }
        }
    }))
}

pub fn api_delta(text: &str) -> StreamEvent {
    StreamEvent::TextDelta {
        id: Some("chatcmpl-1".into()),
        delta: text.into(),
    }
}

#[derive(Default)]
pub struct StubRemote {
    pub conversations: Mutex<HashMap<String, Value>>,
    pub hidden: Mutex<Vec<String>>,
    pub titles: Mutex<Vec<(String, String)>>,
    /// Title handed out by `generate_title`; `None` makes it fail.
    pub generated_title: Mutex<Option<String>>,
    pub title_requests: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl RemoteConversations for StubRemote {
    async fn fetch_conversation(&self, conversation_id: &str) -> Result<Value, parley_llm::Error> {
        self.conversations
            .lock()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| parley_llm::Error::Api {
                code: "404".into(),
                message: "not found".into(),
                metadata: Default::default(),
            })
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<(), parley_llm::Error> {
        self.hidden.lock().push(conversation_id.to_string());
        Ok(())
    }

    async fn set_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), parley_llm::Error> {
        self.titles
            .lock()
            .push((conversation_id.to_string(), title.to_string()));
        Ok(())
    }

    async fn generate_title(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> Result<String, parley_llm::Error> {
        self.title_requests
            .lock()
            .push((conversation_id.to_string(), message_id.to_string()));
        self.generated_title
            .lock()
            .clone()
            .ok_or_else(|| parley_llm::Error::Other("failed to generate title".into()))
    }
}

// ---------------------------------------------------------------------------
// In-memory stores
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    histories: Mutex<HashMap<Uuid, ConversationHistory>>,
    records: Mutex<HashMap<Uuid, ConversationRecord>>,
    quotas: Mutex<HashMap<(i64, Source), QuotaState>>,
    next_row: AtomicI64,
}

impl MemoryStore {
    pub fn set_quota(&self, user: i64, source: Source, quota: QuotaState) {
        self.quotas.lock().insert((user, source), quota);
    }

    pub fn quota(&self, user: i64, source: Source) -> Option<QuotaState> {
        self.quotas.lock().get(&(user, source)).cloned()
    }

    pub fn history(&self, id: Uuid) -> Option<ConversationHistory> {
        self.histories.lock().get(&id).cloned()
    }

    pub fn record(&self, id: Uuid) -> Option<ConversationRecord> {
        self.records.lock().get(&id).cloned()
    }

    pub fn insert(&self, history: ConversationHistory, user: i64) {
        let mut record =
            ConversationRecord::new(history.source, history.id, history.title.clone(), user);
        record.id = Some(self.next_row.fetch_add(1, Ordering::SeqCst));
        record.current_model = history.current_model.clone();
        self.records.lock().insert(history.id, record);
        self.histories.lock().insert(history.id, history);
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn get_history(&self, id: Uuid) -> parley_core::Result<Option<ConversationHistory>> {
        Ok(self.histories.lock().get(&id).cloned())
    }

    async fn save_history(&self, history: &ConversationHistory) -> parley_core::Result<()> {
        self.histories.lock().insert(history.id, history.clone());
        Ok(())
    }

    async fn delete_history(&self, id: Uuid) -> parley_core::Result<()> {
        self.histories.lock().remove(&id);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_record(&self, conversation_id: Uuid) -> parley_core::Result<Option<ConversationRecord>> {
        Ok(self.records.lock().get(&conversation_id).cloned())
    }

    async fn upsert_record(&self, record: &ConversationRecord) -> parley_core::Result<()> {
        let mut record = record.clone();
        if record.id.is_none() {
            record.id = Some(self.next_row.fetch_add(1, Ordering::SeqCst));
        }
        self.records.lock().insert(record.conversation_id, record);
        Ok(())
    }

    async fn list_records(
        &self,
        user: i64,
        include_invalid: bool,
    ) -> parley_core::Result<Vec<ConversationRecord>> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| r.user_id == user && (include_invalid || r.is_valid))
            .cloned()
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.update_time));
        Ok(records)
    }

    async fn count_valid(&self, user: i64, source: Source) -> parley_core::Result<u64> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|r| r.user_id == user && r.source == source && r.is_valid)
            .count() as u64)
    }

    async fn delete_record(&self, conversation_id: Uuid) -> parley_core::Result<()> {
        self.records.lock().remove(&conversation_id);
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_user_quota(&self, user: i64, source: Source) -> parley_core::Result<Option<QuotaState>> {
        Ok(self.quota(user, source))
    }

    async fn put_user_quota(
        &self,
        user: i64,
        source: Source,
        quota: &QuotaState,
    ) -> parley_core::Result<()> {
        self.set_quota(user, source, quota.clone());
        Ok(())
    }

    async fn decrement_quota(&self, user: i64, source: Source, model: &str) -> parley_core::Result<()> {
        if let Some(quota) = self.quotas.lock().get_mut(&(user, source)) {
            quota.consume(model);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Broker fixture
// ---------------------------------------------------------------------------

pub struct Harness {
    pub broker: Broker,
    pub store: Arc<MemoryStore>,
    pub remote: Arc<StubRemote>,
    pub stats: Arc<UsageStats>,
    pub browser_calls: Arc<AtomicUsize>,
    pub api_calls: Arc<AtomicUsize>,
    pub api_requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

pub fn harness(browser: StubSource, api: StubSource, ask_timeout: Duration) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let remote = Arc::new(StubRemote::default());
    let stats = Arc::new(UsageStats::new(&StatsConfig::default()).expect("stats"));
    let browser_calls = browser.calls();
    let api_calls = api.calls();
    let api_requests = api.requests();

    let stores = Stores {
        histories: store.clone(),
        records: store.clone(),
        quotas: store.clone(),
    };
    let broker = Broker::builder(stores, Arc::clone(&stats))
        .browser_session(
            SourceSetup {
                source: ChatSource::new(StubBackend(browser)),
                catalog: ModelCatalog::browser_session_default(),
                ask_timeout,
            },
            remote.clone(),
            1,
        )
        .api(SourceSetup {
            source: ChatSource::new(StubBackend(api)),
            catalog: ModelCatalog::api_default(),
            ask_timeout,
        })
        .build();

    store.set_quota(USER, Source::BrowserSession, QuotaState::default());
    store.set_quota(USER, Source::Api, QuotaState::default());
    store.set_quota(OTHER_USER, Source::BrowserSession, QuotaState::default());
    store.set_quota(OTHER_USER, Source::Api, QuotaState::default());

    Harness {
        broker,
        store,
        remote,
        stats,
        browser_calls,
        api_calls,
        api_requests,
    }
}

// ---------------------------------------------------------------------------
// Channel-backed client connection
// ---------------------------------------------------------------------------

pub struct ChannelConnection {
    incoming: mpsc::Receiver<Result<AskRequest, String>>,
    outgoing: mpsc::UnboundedSender<AskFrame>,
    closed: Arc<Mutex<Option<CloseCode>>>,
}

pub struct ClientEnd {
    requests: Option<mpsc::Sender<Result<AskRequest, String>>>,
    pub frames: mpsc::UnboundedReceiver<AskFrame>,
    pub closed: Arc<Mutex<Option<CloseCode>>>,
}

pub fn connection() -> (ChannelConnection, ClientEnd) {
    let (req_tx, req_rx) = mpsc::channel(8);
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(Mutex::new(None));
    (
        ChannelConnection {
            incoming: req_rx,
            outgoing: frame_tx,
            closed: Arc::clone(&closed),
        },
        ClientEnd {
            requests: Some(req_tx),
            frames: frame_rx,
            closed,
        },
    )
}

impl ClientEnd {
    pub async fn ask(&self, request: AskRequest) {
        self.send(Ok(request)).await;
    }

    pub async fn send(&self, message: Result<AskRequest, String>) {
        if let Some(requests) = &self.requests {
            requests.send(message).await.expect("connection open");
        }
    }

    /// Hang up the request side, which the server sees as a disconnect.
    pub fn disconnect(&mut self) {
        self.requests = None;
    }

    pub async fn next_frame(&mut self) -> AskFrame {
        tokio::time::timeout(Duration::from_secs(5), self.frames.recv())
            .await
            .expect("frame in time")
            .expect("frame")
    }

    pub fn drain(&mut self) -> Vec<AskFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            frames.push(frame);
        }
        frames
    }

    pub fn close_code(&self) -> Option<CloseCode> {
        *self.closed.lock()
    }
}

#[async_trait]
impl ClientConnection for ChannelConnection {
    async fn recv(&mut self) -> Option<Result<AskRequest, String>> {
        self.incoming.recv().await
    }

    async fn send(&mut self, frame: &AskFrame) -> Result<(), ConnectionClosed> {
        self.outgoing.send(frame.clone()).map_err(|_| ConnectionClosed)
    }

    async fn close(&mut self, code: CloseCode) {
        *self.closed.lock() = Some(code);
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}
