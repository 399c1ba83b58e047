//! The streaming ask pipeline.
//!
//! ```text
//! Validating -> Denied
//!            -> (Queueing) -> Asking -> Completed | Canceled | Failed
//! ```
//!
//! Each ask runs in its own task and reports to an [`AskStream`]. Dropping
//! the stream (or calling [`AskStream::cancel`]) cancels the ask; a partial
//! reply received before that is still persisted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parley_llm::{
    ChatSource, CompletionRequest, ContextMessage, ContextRole, RemoteConversations, StreamEvent,
};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::UserId;
use crate::admission::AdmissionController;
use crate::conversations::ConversationService;
use crate::error::{Error, Result};
use crate::models::{ModelCatalog, Source};
use crate::protocol::{AskFrame, AskRequest, CloseCode, tips};
use crate::quota::{Decision, DenyReason, QuotaGate, QuotaState};
use crate::sanitize::desensitize;
use crate::stats::{AskRecord, AskStatus, UsageStats};
use crate::status::{BrokerStatus, ChatStatus, UserStatuses};
use crate::store::{ConversationRecord, HistoryStore, QuotaStore, RecordStore};
use crate::tree::{
    BrowserMetadata, ConversationHistory, MessageContent, MessageMetadata, MessageNode, Role,
};

/// Upper bound on ancestors replayed to the API source.
pub const MAX_CONTEXT_MESSAGES: usize = 1000;

// ---------------------------------------------------------------------------
// Events and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum AskEvent {
    /// A frame for the client, in order.
    Frame(AskFrame),
    /// The ask is over. Always the last event.
    Finished(AskOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    Upstream,
    Internal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AskOutcome {
    Completed { conversation_id: Uuid },
    /// The client left mid-ask; a partial reply was kept if one arrived.
    Canceled { conversation_id: Option<Uuid> },
    /// The client left while waiting for admission.
    LeftQueue,
    Denied(DenyReason),
    Invalid(String),
    AlreadyBusy,
    Failed(FailureKind),
}

impl AskOutcome {
    pub fn close_code(&self) -> CloseCode {
        match self {
            AskOutcome::Completed { .. } | AskOutcome::Canceled { .. } => CloseCode::Finished,
            AskOutcome::LeftQueue => CloseCode::UserLeftQueue,
            AskOutcome::Denied(_) => CloseCode::Unauthorized,
            AskOutcome::Invalid(_) | AskOutcome::AlreadyBusy => CloseCode::InvalidRequest,
            AskOutcome::Failed(FailureKind::Timeout) => CloseCode::Timeout,
            AskOutcome::Failed(FailureKind::Upstream) => CloseCode::UpstreamError,
            AskOutcome::Failed(FailureKind::Internal) => CloseCode::InternalError,
        }
    }
}

/// Events of one ask. Dropping it cancels the ask.
pub struct AskStream {
    rx: mpsc::Receiver<AskEvent>,
    cancel: CancellationToken,
}

impl AskStream {
    /// The next event, or `None` once the ask task is gone.
    pub async fn next(&mut self) -> Option<AskEvent> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for AskStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// One configured upstream.
pub struct SourceSetup {
    pub source: ChatSource,
    pub catalog: ModelCatalog,
    pub ask_timeout: Duration,
}

struct Lane {
    kind: Source,
    source: ChatSource,
    catalog: ModelCatalog,
    ask_timeout: Duration,
    admission: Option<AdmissionController>,
}

#[derive(Clone)]
pub struct Stores {
    pub histories: Arc<dyn HistoryStore>,
    pub records: Arc<dyn RecordStore>,
    pub quotas: Arc<dyn QuotaStore>,
}

/// Owns the process-wide ask state: sources, the admission gate, user
/// statuses and statistics. Cheap to clone.
#[derive(Clone)]
pub struct Broker {
    browser: Option<Arc<Lane>>,
    api: Option<Arc<Lane>>,
    remote: Option<Arc<dyn RemoteConversations>>,
    stores: Stores,
    quota: Arc<QuotaGate>,
    stats: Arc<UsageStats>,
    statuses: Arc<UserStatuses>,
    default_title: Arc<str>,
}

pub struct BrokerBuilder {
    stores: Stores,
    stats: Arc<UsageStats>,
    browser: Option<(SourceSetup, Arc<dyn RemoteConversations>, usize)>,
    api: Option<SourceSetup>,
    default_quotas: Vec<(Source, QuotaState)>,
    default_title: String,
}

impl BrokerBuilder {
    /// Enable the browser-session source with `max_concurrency` asks in
    /// flight (1 for a single session).
    pub fn browser_session(
        mut self,
        setup: SourceSetup,
        remote: Arc<dyn RemoteConversations>,
        max_concurrency: usize,
    ) -> Self {
        self.browser = Some((setup, remote, max_concurrency));
        self
    }

    pub fn api(mut self, setup: SourceSetup) -> Self {
        self.api = Some(setup);
        self
    }

    pub fn default_quota(mut self, source: Source, quota: QuotaState) -> Self {
        self.default_quotas.push((source, quota));
        self
    }

    pub fn default_title(mut self, title: impl Into<String>) -> Self {
        self.default_title = title.into();
        self
    }

    pub fn build(self) -> Broker {
        let mut quota = QuotaGate::new(
            Arc::clone(&self.stores.quotas),
            Arc::clone(&self.stores.records),
            Arc::clone(&self.stats),
        );
        for (source, state) in self.default_quotas {
            quota.set_default(source, state);
        }

        let (browser, remote) = match self.browser {
            Some((setup, remote, concurrency)) => (
                Some(Arc::new(Lane {
                    kind: Source::BrowserSession,
                    source: setup.source,
                    catalog: setup.catalog,
                    ask_timeout: setup.ask_timeout,
                    admission: Some(AdmissionController::new(concurrency)),
                })),
                Some(remote),
            ),
            None => (None, None),
        };
        let api = self.api.map(|setup| {
            Arc::new(Lane {
                kind: Source::Api,
                source: setup.source,
                catalog: setup.catalog,
                ask_timeout: setup.ask_timeout,
                admission: None,
            })
        });

        Broker {
            browser,
            api,
            remote,
            stores: self.stores,
            quota: Arc::new(quota),
            stats: self.stats,
            statuses: UserStatuses::new(),
            default_title: self.default_title.into(),
        }
    }
}

impl Broker {
    pub fn builder(stores: Stores, stats: Arc<UsageStats>) -> BrokerBuilder {
        BrokerBuilder {
            stores,
            stats,
            browser: None,
            api: None,
            default_quotas: Vec::new(),
            default_title: "New chat".into(),
        }
    }

    pub fn stats(&self) -> &Arc<UsageStats> {
        &self.stats
    }

    pub fn user_status(&self, user: UserId) -> ChatStatus {
        self.statuses.get(user)
    }

    pub fn status(&self) -> BrokerStatus {
        let now = Utc::now();
        let (queueing_users, asking_users) = self.statuses.counts();
        let gate = self.browser.as_ref().and_then(|lane| lane.admission.as_ref());
        BrokerStatus {
            browser_session_busy: gate.is_some_and(AdmissionController::is_busy),
            queue_depth: gate.map_or(0, AdmissionController::queue_depth),
            queueing_users,
            asking_users,
            asks_in_window: self.stats.asks().total_at(now),
            requests_in_window: self.stats.requests().total_at(now),
        }
    }

    /// Conversation management over the same stores and upstream.
    pub fn conversations(&self) -> ConversationService {
        ConversationService::new(
            Arc::clone(&self.stores.histories),
            Arc::clone(&self.stores.records),
            self.remote.clone(),
            self.browser
                .as_ref()
                .map(|lane| lane.catalog.clone())
                .unwrap_or_else(ModelCatalog::browser_session_default),
        )
    }

    fn lane(&self, source: Source) -> Option<&Arc<Lane>> {
        match source {
            Source::BrowserSession => self.browser.as_ref(),
            Source::Api => self.api.as_ref(),
        }
    }

    /// Start an ask for `user` and stream its events.
    pub fn submit(&self, user: UserId, request: AskRequest) -> AskStream {
        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let broker = self.clone();
        let emitter = Emitter {
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            let outcome = broker.run(user, request, &emitter).await;
            emitter.finish(outcome).await;
        });

        AskStream { rx, cancel }
    }

    async fn run(&self, user: UserId, request: AskRequest, emit: &Emitter) -> AskOutcome {
        // Validating: nothing below has side effects until admission.
        let plan = match self.plan(user, &request).await {
            Ok(plan) => plan,
            Err(
                Error::InvalidRequest(detail) | Error::NotFound(detail) | Error::Forbidden(detail),
            ) => {
                emit.frame(AskFrame::error(tips::INVALID_REQUEST, Some(detail.clone())))
                    .await;
                return AskOutcome::Invalid(detail);
            }
            Err(e) => {
                tracing::error!(user, error = %e, "failed to prepare ask");
                emit.frame(AskFrame::error(tips::INTERNAL, None)).await;
                return AskOutcome::Failed(FailureKind::Internal);
            }
        };

        let Some(status) = self.statuses.try_begin(user) else {
            emit.frame(AskFrame::error(tips::ALREADY_BUSY, None)).await;
            return AskOutcome::AlreadyBusy;
        };

        match self
            .quota
            .check(user, plan.lane.kind, &request.model, request.new_conversation)
            .await
        {
            Ok(Decision::Admit) => {}
            Ok(Decision::Deny(reason)) => {
                tracing::debug!(user, ?reason, "ask denied");
                emit.frame(AskFrame::error(reason.tip(), Some(reason.to_string())))
                    .await;
                return AskOutcome::Denied(reason);
            }
            Err(e) => {
                tracing::error!(user, error = %e, "quota check failed");
                emit.frame(AskFrame::error(tips::INTERNAL, None)).await;
                return AskOutcome::Failed(FailureKind::Internal);
            }
        }

        // Queueing
        let queue_started = Instant::now();
        let permit = match &plan.lane.admission {
            Some(gate) => {
                if gate.is_busy() {
                    status.set(ChatStatus::Queueing);
                    emit.frame(AskFrame::queueing()).await;
                }
                match gate.acquire(&emit.cancel).await {
                    Some(permit) => Some(permit),
                    None => {
                        tracing::info!(user, "client left the queue");
                        self.record_stats(
                            user,
                            &plan,
                            AskStatus::LeftQueue,
                            queue_started.elapsed(),
                            None,
                        );
                        return AskOutcome::LeftQueue;
                    }
                }
            }
            None => None,
        };
        let queueing_time = queue_started.elapsed();

        // Asking
        status.set(ChatStatus::Asking);
        emit.frame(AskFrame::waiting()).await;
        let ask_started = Instant::now();
        let mut turn = Turn::new(&plan);
        let end = self.stream_reply(&plan, &mut turn, emit).await;
        if let Some(permit) = permit {
            permit.release();
        }
        let ask_time = ask_started.elapsed();

        let (outcome, stat) = match end {
            AskEnd::Done if turn.replies.is_empty() => {
                emit.frame(AskFrame::error(
                    tips::UPSTREAM_ERROR,
                    Some("upstream returned no reply".into()),
                ))
                .await;
                (AskOutcome::Failed(FailureKind::Upstream), AskStatus::Failed)
            }
            AskEnd::Done => match self.persist(user, &request, plan.clone_parts(), &turn).await {
                Ok(conversation_id) => (
                    AskOutcome::Completed { conversation_id },
                    AskStatus::Completed,
                ),
                Err(e) => {
                    tracing::error!(user, error = %e, "failed to persist reply");
                    let (tip, kind) = match e {
                        Error::Upstream(_) => (tips::UPSTREAM_ERROR, FailureKind::Upstream),
                        _ => (tips::INTERNAL, FailureKind::Internal),
                    };
                    emit.frame(AskFrame::error(tip, None)).await;
                    (AskOutcome::Failed(kind), AskStatus::Failed)
                }
            },
            AskEnd::Canceled => {
                tracing::info!(user, replies = turn.replies.len(), "ask canceled by client");
                let mut conversation_id = turn.conversation_id;
                if !turn.replies.is_empty() {
                    match self.persist(user, &request, plan.clone_parts(), &turn).await {
                        Ok(id) => conversation_id = Some(id),
                        Err(e) => tracing::error!(user, error = %e, "failed to persist partial reply"),
                    }
                }
                (AskOutcome::Canceled { conversation_id }, AskStatus::Canceled)
            }
            AskEnd::TimedOut | AskEnd::Failed(parley_llm::Error::Timeout) => {
                emit.frame(AskFrame::error(tips::TIMEOUT, None)).await;
                (AskOutcome::Failed(FailureKind::Timeout), AskStatus::Timeout)
            }
            AskEnd::Failed(e) => {
                tracing::warn!(user, error = %e, "upstream ask failed");
                let tip = match &e {
                    parley_llm::Error::Api { code, .. } if code.parse::<u16>().is_ok() => {
                        tips::HTTP_ERROR
                    }
                    _ => tips::UPSTREAM_ERROR,
                };
                emit.frame(AskFrame::error(tip, Some(desensitize(&e.to_string()))))
                    .await;
                (AskOutcome::Failed(FailureKind::Upstream), AskStatus::Failed)
            }
        };

        self.record_stats(user, &plan, stat, queueing_time, Some(ask_time));
        tracing::info!(
            user,
            conversation = ?turn.conversation_id,
            model = %request.model,
            outcome = ?outcome,
            queueing_secs = queueing_time.as_secs_f64(),
            ask_secs = ask_time.as_secs_f64(),
            "ask finished"
        );
        outcome
    }

    async fn plan(&self, user: UserId, request: &AskRequest) -> Result<AskPlan> {
        let lane = self.lane(request.source).cloned().ok_or_else(|| {
            Error::InvalidRequest(format!("source {} is not enabled", request.source))
        })?;
        request.validate(&lane.catalog)?;
        let model_code = lane
            .catalog
            .code(&request.model)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown model {}", request.model)))?;

        let mut completion = CompletionRequest::new(model_code, request.text_content.clone());
        let mut history = None;
        let conversation_id = match (request.conversation_id, request.parent) {
            (Some(id), Some(parent)) if !request.new_conversation => {
                let record = self
                    .stores
                    .records
                    .get_record(id)
                    .await?
                    .filter(|r| r.is_valid)
                    .ok_or_else(|| Error::NotFound(format!("conversation {id}")))?;
                if record.user_id != user {
                    return Err(Error::Forbidden(format!("conversation {id}")));
                }
                if record.source != lane.kind {
                    return Err(Error::InvalidRequest(format!(
                        "conversation {id} belongs to {}",
                        record.source
                    )));
                }

                history = self.stores.histories.get_history(id).await?;
                if lane.kind == Source::Api {
                    let local = history
                        .as_ref()
                        .ok_or_else(|| Error::NotFound(format!("history of {id}")))?;
                    if !local.mapping.contains_key(&parent) {
                        return Err(Error::InvalidRequest(format!(
                            "parent {parent} is not part of conversation {id}"
                        )));
                    }
                    completion.context = api_context(
                        local,
                        parent,
                        request.api_context_message_count.unwrap_or(-1),
                    );
                }
                completion.conversation_id = Some(id);
                completion.parent_id = Some(parent);
                Some(id)
            }
            _ => {
                completion.plugin_ids = request.openai_web_plugin_ids.clone().unwrap_or_default();
                // API conversations have no upstream id; browser-session ids
                // arrive with the first frame.
                (lane.kind == Source::Api).then(Uuid::new_v4)
            }
        };

        let user_node = (!request.is_continue()).then(|| {
            let mut node = MessageNode::new(
                completion.message_id,
                Role::User,
                MessageContent::text(request.text_content.clone()),
            );
            node.parent = request.parent;
            node.metadata = Some(match lane.kind {
                Source::BrowserSession => MessageMetadata::BrowserSession(BrowserMetadata::default()),
                Source::Api => MessageMetadata::Api {
                    usage: None,
                    finish_reason: None,
                },
            });
            node
        });

        Ok(AskPlan {
            title: request
                .new_title
                .clone()
                .unwrap_or_else(|| self.default_title.to_string()),
            lane,
            completion,
            conversation_id,
            history,
            user_node,
        })
    }

    async fn stream_reply(&self, plan: &AskPlan, turn: &mut Turn, emit: &Emitter) -> AskEnd {
        let mut events = plan.lane.source.complete(plan.completion.clone()).events();
        let deadline = tokio::time::Instant::now() + plan.lane.ask_timeout;

        loop {
            let next = tokio::select! {
                biased;
                _ = emit.cancel.cancelled() => return AskEnd::Canceled,
                next = tokio::time::timeout_at(deadline, events.next()) => next,
            };
            match next {
                Err(_) => return AskEnd::TimedOut,
                Ok(None) => return AskEnd::Done,
                Ok(Some(Err(e))) => return AskEnd::Failed(e),
                Ok(Some(Ok(event))) => {
                    if let Some(node) = turn.apply(event) {
                        emit.frame(AskFrame::message(turn.conversation_id, node))
                            .await;
                    }
                }
            }
        }
    }

    /// Terminal bookkeeping for a reply: history, record row, quota.
    async fn persist(
        &self,
        user: UserId,
        request: &AskRequest,
        plan: PlanParts,
        turn: &Turn,
    ) -> Result<Uuid> {
        let conversation_id = turn.conversation_id.ok_or_else(|| {
            Error::Upstream(parley_llm::Error::Malformed(
                "reply carried no conversation id".into(),
            ))
        })?;
        let source = plan.source;

        let mut history = match (plan.history, request.new_conversation) {
            (_, true) => {
                let root = plan.user_node.clone().ok_or_else(|| {
                    Error::Integrity("a new conversation needs a user turn".into())
                })?;
                ConversationHistory::new(conversation_id, source, plan.title.clone(), root)
            }
            (Some(history), false) => history,
            (None, false) => self.fetch_upstream(conversation_id).await?,
        };

        if !request.new_conversation
            && let Some(user_node) = plan.user_node
            && !history.mapping.contains_key(&user_node.id)
        {
            let parent = user_node.parent.unwrap_or(history.current_node);
            if let Err(e) = history.append(parent, user_node.clone()) {
                if source != Source::BrowserSession {
                    return Err(e);
                }
                tracing::warn!(conversation = %conversation_id, error = %e, "local copy is stale, refreshing");
                let upstream = self.fetch_upstream(conversation_id).await?;
                history = ConversationHistory::reconcile(upstream, Some(history));
                if !history.mapping.contains_key(&user_node.id) {
                    history.append(parent, user_node)?;
                }
            }
        }

        for reply in &turn.replies {
            history.upsert_node(reply.clone())?;
        }
        history.update_time = Utc::now();
        if let Some(model) = history.latest_model() {
            history.current_model = Some(model.to_string());
        }
        self.stores.histories.save_history(&history).await?;

        let mut record = match self.stores.records.get_record(conversation_id).await? {
            Some(record) => record,
            None => ConversationRecord::new(source, conversation_id, plan.title.clone(), user),
        };
        record.update_time = history.update_time;
        record.current_model = history.current_model.clone();
        self.stores.records.upsert_record(&record).await?;

        self.quota.decrement(user, source, &request.model).await?;

        if request.new_conversation
            && source == Source::BrowserSession
            && let Some(remote) = &self.remote
            && let Err(e) = remote
                .set_conversation_title(&conversation_id.to_string(), &plan.title)
                .await
        {
            tracing::warn!(conversation = %conversation_id, error = %e, "could not set upstream title");
        }

        Ok(conversation_id)
    }

    async fn fetch_upstream(&self, conversation_id: Uuid) -> Result<ConversationHistory> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| Error::NotFound(format!("history of {conversation_id}")))?;
        let raw = remote
            .fetch_conversation(&conversation_id.to_string())
            .await?;
        let catalog = self
            .browser
            .as_ref()
            .map(|lane| lane.catalog.clone())
            .unwrap_or_else(ModelCatalog::browser_session_default);
        ConversationHistory::from_upstream(conversation_id, &raw, &catalog)
    }

    fn record_stats(
        &self,
        user: UserId,
        plan: &AskPlan,
        status: AskStatus,
        queueing_time: Duration,
        ask_time: Option<Duration>,
    ) {
        self.stats.record_ask(AskRecord {
            time: Utc::now(),
            user_id: user,
            source: plan.lane.kind,
            model: plan.lane.catalog.from_code(&plan.completion.model),
            status,
            queueing_time: Some(queueing_time.as_secs_f64()),
            ask_time: ask_time.map(|d| d.as_secs_f64()),
        });
    }
}

fn api_context(history: &ConversationHistory, parent: Uuid, count: i64) -> Vec<ContextMessage> {
    let limit = usize::try_from(count)
        .map(|n| n.min(MAX_CONTEXT_MESSAGES))
        .unwrap_or(MAX_CONTEXT_MESSAGES);
    let path = history.path_to(parent);
    let skip = path.len().saturating_sub(limit);
    path.into_iter()
        .skip(skip)
        .filter_map(|node| {
            let content = node.plain_text()?;
            let role = match node.role {
                Role::System => ContextRole::System,
                Role::User => ContextRole::User,
                Role::Assistant => ContextRole::Assistant,
                Role::Tool => ContextRole::Tool,
            };
            Some(ContextMessage { role, content })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Per-ask state
// ---------------------------------------------------------------------------

struct AskPlan {
    lane: Arc<Lane>,
    completion: CompletionRequest,
    conversation_id: Option<Uuid>,
    history: Option<ConversationHistory>,
    user_node: Option<MessageNode>,
    title: String,
}

/// What persistence needs from a plan.
struct PlanParts {
    source: Source,
    history: Option<ConversationHistory>,
    user_node: Option<MessageNode>,
    title: String,
}

impl AskPlan {
    fn clone_parts(&self) -> PlanParts {
        PlanParts {
            source: self.lane.kind,
            history: self.history.clone(),
            user_node: self.user_node.clone(),
            title: self.title.clone(),
        }
    }
}

enum AskEnd {
    Done,
    Canceled,
    TimedOut,
    Failed(parley_llm::Error),
}

/// Coalesces upstream events into one growing node per reply message.
struct Turn {
    source: Source,
    catalog: ModelCatalog,
    model: String,
    conversation_id: Option<Uuid>,
    /// Parent of the first reply.
    anchor: Option<Uuid>,
    replies: Vec<MessageNode>,
}

impl Turn {
    fn new(plan: &AskPlan) -> Self {
        Self {
            source: plan.lane.kind,
            catalog: plan.lane.catalog.clone(),
            model: plan.lane.catalog.from_code(&plan.completion.model),
            conversation_id: plan.conversation_id,
            anchor: plan
                .user_node
                .as_ref()
                .map(|n| n.id)
                .or(plan.completion.parent_id),
            replies: Vec::new(),
        }
    }

    /// Apply one event; returns the reply node to forward, if it changed.
    fn apply(&mut self, event: StreamEvent) -> Option<MessageNode> {
        match event {
            StreamEvent::Snapshot(value) => self.apply_snapshot(value),
            StreamEvent::TextDelta { delta, .. } => self.apply_delta(delta),
            StreamEvent::Finish { reason, usage } => {
                if self.source == Source::Api
                    && let Some(node) = self.replies.last_mut()
                {
                    node.metadata = Some(MessageMetadata::Api {
                        usage,
                        finish_reason: reason,
                    });
                    return Some(node.clone());
                }
                None
            }
        }
    }

    fn apply_snapshot(&mut self, value: serde_json::Value) -> Option<MessageNode> {
        if self.conversation_id.is_none() {
            self.conversation_id = value
                .get("conversation_id")
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());
        }

        let message = value.get("message")?;
        let mut node = match MessageNode::from_upstream_message(message, &self.catalog) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(error = %e, "skipping undecodable snapshot");
                return None;
            }
        };
        if node.role == Role::User {
            return None;
        }
        if node.role == Role::Assistant && node.model.is_none() {
            node.model = Some(self.model.clone());
        }

        if let Some(existing) = self.replies.iter_mut().find(|n| n.id == node.id) {
            existing.role = node.role;
            existing.author_name = node.author_name;
            existing.content = node.content;
            existing.metadata = node.metadata;
            if node.model.is_some() {
                existing.model = node.model;
            }
            return Some(existing.clone());
        }

        node.parent = self.replies.last().map(|n| n.id).or(self.anchor);
        self.replies.push(node.clone());
        Some(node)
    }

    fn apply_delta(&mut self, delta: String) -> Option<MessageNode> {
        if self.replies.is_empty() {
            let mut node = MessageNode::new(Uuid::new_v4(), Role::Assistant, MessageContent::text(""));
            node.model = Some(self.model.clone());
            node.parent = self.anchor;
            node.metadata = Some(MessageMetadata::Api {
                usage: None,
                finish_reason: None,
            });
            self.replies.push(node);
        }

        let node = self.replies.last_mut()?;
        if let Some(MessageContent::Text { parts }) = &mut node.content {
            match parts.first_mut() {
                Some(text) => text.push_str(&delta),
                None => parts.push(delta),
            }
        }
        Some(node.clone())
    }
}

struct Emitter {
    tx: mpsc::Sender<AskEvent>,
    cancel: CancellationToken,
}

impl Emitter {
    /// Forward a frame; a closed receiver counts as the client leaving.
    async fn frame(&self, frame: AskFrame) {
        if self.tx.send(AskEvent::Frame(frame)).await.is_err() {
            self.cancel.cancel();
        }
    }

    async fn finish(&self, outcome: AskOutcome) {
        let _ = self.tx.send(AskEvent::Finished(outcome)).await;
    }
}
