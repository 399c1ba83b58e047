mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use common::*;
use parley_core::protocol::tips;
use parley_core::quota::RateLimit;
use parley_core::{
    Allowance, AskOutcome, AskRecord, AskRequest, AskStatus, CloseCode, ConversationHistory, DenyReason,
    FailureKind, FrameType, MessageContent, MessageNode, QuotaState, Role, SessionHandler, Source,
};
use uuid::Uuid;

fn text_of(node: &MessageNode) -> String {
    node.plain_text().unwrap_or_default()
}

/// A stored browser conversation: user `Hi` answered by the assistant.
fn seed_browser_conversation(h: &Harness, conversation_id: Uuid) -> Uuid {
    let question = Uuid::new_v4();
    let answer = Uuid::new_v4();
    let mut history = ConversationHistory::new(
        conversation_id,
        Source::BrowserSession,
        "Greetings",
        MessageNode::new(question, Role::User, MessageContent::text("Hi")),
    );
    let mut reply = MessageNode::new(answer, Role::Assistant, MessageContent::text("Hello!"));
    reply.model = Some("gpt-3.5".into());
    history.append(question, reply).unwrap();
    h.store.insert(history, USER);
    answer
}

#[tokio::test]
async fn new_browser_conversation_streams_and_persists() {
    let conversation_id = Uuid::new_v4();
    let reply_id = Uuid::new_v4();
    let h = harness(
        StubSource::new(vec![
            web_snapshot(conversation_id, reply_id, "Hel"),
            web_snapshot(conversation_id, reply_id, "Hello"),
        ]),
        StubSource::default(),
        Duration::from_secs(5),
    );
    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "Hi"))
        .await;

    let outcome = SessionHandler::new(h.broker.clone())
        .run(USER, &mut conn)
        .await;
    assert_eq!(outcome, Some(AskOutcome::Completed { conversation_id }));

    let frames = client.drain();
    let kinds: Vec<_> = frames.iter().map(|f| f.kind).collect();
    assert_eq!(
        kinds,
        vec![FrameType::Waiting, FrameType::Message, FrameType::Message]
    );
    let texts: Vec<_> = frames[1..]
        .iter()
        .map(|f| text_of(f.message.as_ref().unwrap()))
        .collect();
    assert_eq!(texts, vec!["Hel", "Hello"]);
    assert!(frames[1..].iter().all(|f| f.conversation_id == Some(conversation_id)));
    assert_eq!(client.close_code(), Some(CloseCode::Finished));

    let history = h.store.history(conversation_id).expect("history stored");
    assert_eq!(history.mapping.len(), 2);
    assert_eq!(history.current_node, reply_id);
    let path: Vec<_> = history.current_path().iter().map(|n| n.role).collect();
    assert_eq!(path, vec![Role::User, Role::Assistant]);
    assert_eq!(history.current_model.as_deref(), Some("gpt-3.5"));

    let record = h.store.record(conversation_id).expect("record stored");
    assert_eq!(record.user_id, USER);
    assert_eq!(record.title, "New chat");
    assert!(record.is_valid);

    assert_eq!(h.browser_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.stats.asks().total_at(Utc::now()), 1);
    assert_eq!(
        h.remote.titles.lock().as_slice(),
        &[(conversation_id.to_string(), "New chat".to_string())]
    );
    assert!(!h.broker.status().browser_session_busy);
}

#[tokio::test]
async fn disconnect_mid_ask_keeps_the_partial_reply() {
    let conversation_id = Uuid::new_v4();
    let partial_id = Uuid::new_v4();
    // The source stalls after one partial snapshot.
    let h = harness(
        StubSource::hanging(vec![web_snapshot(conversation_id, partial_id, "Par")]),
        StubSource::default(),
        Duration::from_secs(5),
    );
    let answer = seed_browser_conversation(&h, conversation_id);
    h.store.set_quota(
        USER,
        Source::BrowserSession,
        QuotaState {
            total_ask_count: Allowance::new(5),
            ..QuotaState::default()
        },
    );

    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::follow_up(
            Source::BrowserSession,
            "gpt-3.5",
            conversation_id,
            answer,
            "Tell me more",
        ))
        .await;
    let broker = h.broker.clone();
    let task = tokio::spawn(async move { SessionHandler::new(broker).run(USER, &mut conn).await });

    assert_eq!(client.next_frame().await.kind, FrameType::Waiting);
    let partial = client.next_frame().await;
    assert_eq!(partial.kind, FrameType::Message);
    assert_eq!(text_of(partial.message.as_ref().unwrap()), "Par");

    client.disconnect();
    let outcome = task.await.unwrap();
    assert_eq!(
        outcome,
        Some(AskOutcome::Canceled {
            conversation_id: Some(conversation_id)
        })
    );
    assert_eq!(client.close_code(), None);

    let history = h.store.history(conversation_id).unwrap();
    assert_eq!(history.mapping.len(), 4);
    let kept = &history.mapping[&partial_id];
    assert_eq!(text_of(kept), "Par");
    let question = kept.parent.expect("partial reply has a parent");
    assert_eq!(history.mapping[&question].parent, Some(answer));
    assert_eq!(history.current_node, partial_id);

    let quota = h.store.quota(USER, Source::BrowserSession).unwrap();
    assert_eq!(quota.total_ask_count, Allowance::new(4));

    let log = h.stats.log().entries_at(Utc::now());
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, AskStatus::Canceled);
    assert!(log[0].ask_time.is_some());
    assert!(!h.broker.status().browser_session_busy);
}

#[tokio::test]
async fn exhausted_model_count_is_denied_before_upstream() {
    let h = harness(StubSource::default(), StubSource::default(), Duration::from_secs(5));
    let mut quota = QuotaState::default();
    quota
        .per_model_ask_count
        .insert("gpt-4".into(), Allowance::new(0));
    h.store.set_quota(USER, Source::BrowserSession, quota);

    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-4", "Hi"))
        .await;
    let outcome = SessionHandler::new(h.broker.clone())
        .run(USER, &mut conn)
        .await;

    assert_eq!(
        outcome,
        Some(AskOutcome::Denied(DenyReason::NoModelAskCount))
    );
    let frames = client.drain();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].kind, FrameType::Error);
    assert_eq!(frames[0].tip.as_deref(), Some("errors.noModelAskCount"));
    assert_eq!(client.close_code(), Some(CloseCode::Unauthorized));

    assert_eq!(h.browser_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.stats.asks().total_at(Utc::now()), 0);
}

#[tokio::test]
async fn timeout_frees_the_gate_for_the_next_in_line() {
    let h = harness(
        StubSource::hanging(Vec::new()),
        StubSource::default(),
        Duration::from_millis(200),
    );

    let (mut first_conn, mut first) = connection();
    first
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "one"))
        .await;
    let broker = h.broker.clone();
    let first_task =
        tokio::spawn(async move { SessionHandler::new(broker).run(USER, &mut first_conn).await });
    assert_eq!(first.next_frame().await.kind, FrameType::Waiting);
    assert!(h.broker.status().browser_session_busy);

    let (mut second_conn, mut second) = connection();
    second
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "two"))
        .await;
    let broker = h.broker.clone();
    let second_task = tokio::spawn(async move {
        SessionHandler::new(broker)
            .run(OTHER_USER, &mut second_conn)
            .await
    });
    assert_eq!(second.next_frame().await.kind, FrameType::Queueing);

    let timeout = first.next_frame().await;
    assert_eq!(timeout.kind, FrameType::Error);
    assert_eq!(timeout.tip.as_deref(), Some(tips::TIMEOUT));
    assert_eq!(
        first_task.await.unwrap(),
        Some(AskOutcome::Failed(FailureKind::Timeout))
    );
    assert_eq!(first.close_code(), Some(CloseCode::Timeout));

    // The queued ask is admitted as soon as the first one gives up.
    assert_eq!(second.next_frame().await.kind, FrameType::Waiting);
    assert_eq!(
        second_task.await.unwrap(),
        Some(AskOutcome::Failed(FailureKind::Timeout))
    );

    assert!(!h.broker.status().browser_session_busy);
    let log = h.stats.log().entries_at(Utc::now());
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|r| r.status == AskStatus::Timeout));
    assert_eq!(h.browser_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn leaving_the_queue_is_recorded_without_an_upstream_call() {
    let h = harness(
        StubSource::hanging(Vec::new()),
        StubSource::default(),
        Duration::from_secs(5),
    );
    let mut holder = h.broker.submit(
        USER,
        AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "hold"),
    );
    wait_until(|| h.broker.status().browser_session_busy).await;

    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "later"))
        .await;
    let broker = h.broker.clone();
    let task = tokio::spawn(async move { SessionHandler::new(broker).run(OTHER_USER, &mut conn).await });
    assert_eq!(client.next_frame().await.kind, FrameType::Queueing);

    client.disconnect();
    assert_eq!(task.await.unwrap(), Some(AskOutcome::LeftQueue));

    let log = h.stats.log().entries_at(Utc::now());
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status, AskStatus::LeftQueue);
    assert_eq!(log[0].user_id, OTHER_USER);
    assert!(log[0].queueing_time.is_some());
    assert!(log[0].ask_time.is_none());
    assert_eq!(h.browser_calls.load(Ordering::SeqCst), 1);

    holder.cancel();
    while holder.next().await.is_some() {}
    assert!(!h.broker.status().browser_session_busy);
}

#[tokio::test]
async fn one_ask_per_user_at_a_time() {
    let h = harness(
        StubSource::hanging(Vec::new()),
        StubSource::default(),
        Duration::from_secs(5),
    );
    let holder = h.broker.submit(
        USER,
        AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "first"),
    );
    wait_until(|| h.broker.status().asking_users == 1).await;

    let mut second = h.broker.submit(
        USER,
        AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "second"),
    );
    let mut outcome = None;
    while let Some(event) = second.next().await {
        if let parley_core::AskEvent::Finished(o) = event {
            outcome = Some(o);
        }
    }
    assert_eq!(outcome, Some(AskOutcome::AlreadyBusy));
    assert_eq!(h.browser_calls.load(Ordering::SeqCst), 1);
    drop(holder);
}

#[tokio::test]
async fn second_request_on_a_connection_is_refused() {
    let conversation_id = Uuid::new_v4();
    let reply_id = Uuid::new_v4();
    let h = harness(
        StubSource::new(vec![
            web_snapshot(conversation_id, reply_id, "A"),
            web_snapshot(conversation_id, reply_id, "AB"),
        ])
        .with_delay(Duration::from_millis(50)),
        StubSource::default(),
        Duration::from_secs(5),
    );
    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "Hi"))
        .await;
    let broker = h.broker.clone();
    let task = tokio::spawn(async move { SessionHandler::new(broker).run(USER, &mut conn).await });

    assert_eq!(client.next_frame().await.kind, FrameType::Waiting);
    client
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "again"))
        .await;

    assert_eq!(
        task.await.unwrap(),
        Some(AskOutcome::Completed { conversation_id })
    );
    let frames = client.drain();
    assert!(frames.iter().any(|f| f.tip.as_deref() == Some(tips::ALREADY_BUSY)));
    assert_eq!(
        frames.iter().filter(|f| f.kind == FrameType::Message).count(),
        2
    );
    assert_eq!(h.browser_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undecodable_message_closes_as_invalid() {
    let h = harness(StubSource::default(), StubSource::default(), Duration::from_secs(5));
    let (mut conn, mut client) = connection();
    client.send(Err("expected value at line 1".into())).await;

    let outcome = SessionHandler::new(h.broker.clone())
        .run(USER, &mut conn)
        .await;
    assert!(matches!(outcome, Some(AskOutcome::Invalid(_))));
    let frames = client.drain();
    assert_eq!(frames[0].tip.as_deref(), Some(tips::INVALID_REQUEST));
    assert_eq!(client.close_code(), Some(CloseCode::InvalidRequest));
}

#[tokio::test]
async fn upstream_http_error_is_reported_desensitized() {
    let h = harness(
        StubSource::failing("502", "bad gateway at https://upstream.example/backend"),
        StubSource::default(),
        Duration::from_secs(5),
    );
    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "Hi"))
        .await;
    let outcome = SessionHandler::new(h.broker.clone())
        .run(USER, &mut conn)
        .await;

    assert_eq!(outcome, Some(AskOutcome::Failed(FailureKind::Upstream)));
    let error = client
        .drain()
        .into_iter()
        .find(|f| f.kind == FrameType::Error)
        .unwrap();
    assert_eq!(error.tip.as_deref(), Some(tips::HTTP_ERROR));
    let detail = error.error_detail.unwrap();
    assert!(detail.contains("<url>"));
    assert!(!detail.contains("upstream.example"));
    assert_eq!(client.close_code(), Some(CloseCode::UpstreamError));

    let log = h.stats.log().entries_at(Utc::now());
    assert_eq!(log[0].status, AskStatus::Failed);
}

#[tokio::test]
async fn foreign_conversation_is_rejected() {
    let h = harness(StubSource::default(), StubSource::default(), Duration::from_secs(5));
    let conversation_id = Uuid::new_v4();
    let answer = seed_browser_conversation(&h, conversation_id);

    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::follow_up(
            Source::BrowserSession,
            "gpt-3.5",
            conversation_id,
            answer,
            "mine now",
        ))
        .await;
    let outcome = SessionHandler::new(h.broker.clone())
        .run(OTHER_USER, &mut conn)
        .await;

    assert!(matches!(outcome, Some(AskOutcome::Invalid(_))));
    assert_eq!(client.close_code(), Some(CloseCode::InvalidRequest));
    assert_eq!(h.browser_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn api_follow_up_replays_the_ancestor_path() {
    let h = harness(
        StubSource::default(),
        StubSource::new(vec![api_delta("Four"), api_delta(".")]),
        Duration::from_secs(5),
    );
    let mut first = h.broker.submit(
        USER,
        AskRequest::new_conversation(Source::Api, "gpt-3.5", "2+2?"),
    );
    let mut conversation_id = None;
    let mut reply_id = None;
    while let Some(event) = first.next().await {
        match event {
            parley_core::AskEvent::Frame(frame) => {
                if let Some(node) = frame.message {
                    reply_id = Some(node.id);
                }
            }
            parley_core::AskEvent::Finished(AskOutcome::Completed { conversation_id: id }) => {
                conversation_id = Some(id);
            }
            parley_core::AskEvent::Finished(other) => panic!("unexpected outcome {other:?}"),
        }
    }
    let conversation_id = conversation_id.unwrap();
    let history = h.store.history(conversation_id).unwrap();
    assert_eq!(history.source, Source::Api);
    assert_eq!(text_of(&history.mapping[&reply_id.unwrap()]), "Four.");

    let mut follow = h.broker.submit(
        USER,
        AskRequest::follow_up(
            Source::Api,
            "gpt-3.5",
            conversation_id,
            reply_id.unwrap(),
            "and 3+3?",
        ),
    );
    while follow.next().await.is_some() {}

    let requests = h.api_requests.lock();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].context.is_empty());
    let replayed: Vec<_> = requests[1].context.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(replayed, vec!["2+2?", "Four."]);
    assert_eq!(requests[1].model, "gpt-3.5-turbo");
    assert_eq!(h.store.history(conversation_id).unwrap().mapping.len(), 4);
}

#[tokio::test]
async fn conversation_cap_denies_only_new_conversations() {
    let conversation_id = Uuid::new_v4();
    let reply_id = Uuid::new_v4();
    let h = harness(
        StubSource::new(vec![web_snapshot(conversation_id, reply_id, "Sure.")]),
        StubSource::default(),
        Duration::from_secs(5),
    );
    let answer = seed_browser_conversation(&h, conversation_id);
    h.store.set_quota(
        USER,
        Source::BrowserSession,
        QuotaState {
            max_conv_count: Allowance::new(1),
            ..QuotaState::default()
        },
    );

    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "Hi"))
        .await;
    let outcome = SessionHandler::new(h.broker.clone())
        .run(USER, &mut conn)
        .await;
    assert_eq!(outcome, Some(AskOutcome::Denied(DenyReason::MaxConversations)));
    let frames = client.drain();
    assert_eq!(frames[0].tip.as_deref(), Some("errors.maxConversations"));
    assert_eq!(client.close_code(), Some(CloseCode::Unauthorized));
    assert_eq!(h.browser_calls.load(Ordering::SeqCst), 0);

    let (mut conn, client) = connection();
    client
        .ask(AskRequest::follow_up(
            Source::BrowserSession,
            "gpt-3.5",
            conversation_id,
            answer,
            "Go on",
        ))
        .await;
    let outcome = SessionHandler::new(h.broker.clone())
        .run(USER, &mut conn)
        .await;
    assert_eq!(outcome, Some(AskOutcome::Completed { conversation_id }));
    assert_eq!(h.browser_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn full_rate_window_is_denied_before_upstream() {
    let h = harness(
        StubSource::default(),
        StubSource::new(vec![api_delta("Hi")]),
        Duration::from_secs(5),
    );
    h.store.set_quota(
        USER,
        Source::Api,
        QuotaState {
            rate_limits: vec![RateLimit {
                window_seconds: 60,
                max_requests: 2,
            }],
            ..QuotaState::default()
        },
    );
    for _ in 0..2 {
        h.stats.record_ask(AskRecord {
            time: Utc::now(),
            user_id: USER,
            source: Source::Api,
            model: "gpt-3.5".into(),
            status: AskStatus::Completed,
            queueing_time: None,
            ask_time: Some(1.0),
        });
    }

    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::new_conversation(Source::Api, "gpt-3.5", "Hi"))
        .await;
    let outcome = SessionHandler::new(h.broker.clone())
        .run(USER, &mut conn)
        .await;

    assert_eq!(outcome, Some(AskOutcome::Denied(DenyReason::RateLimited)));
    let frames = client.drain();
    assert_eq!(frames[0].tip.as_deref(), Some("errors.rateLimited"));
    assert_eq!(client.close_code(), Some(CloseCode::Unauthorized));
    assert_eq!(h.api_calls.load(Ordering::SeqCst), 0);
    // Asks of the other user do not count against this one.
    let (mut conn, client) = connection();
    client
        .ask(AskRequest::new_conversation(Source::Api, "gpt-3.5", "Hi"))
        .await;
    let outcome = SessionHandler::new(h.broker.clone())
        .run(OTHER_USER, &mut conn)
        .await;
    assert!(matches!(outcome, Some(AskOutcome::Completed { .. })));
}

#[tokio::test]
async fn error_inside_the_stream_fails_the_ask() {
    let conversation_id = Uuid::new_v4();
    let h = harness(
        StubSource::new(vec![web_snapshot(conversation_id, Uuid::new_v4(), "Half")])
            .with_error("stream", "model overloaded"),
        StubSource::default(),
        Duration::from_secs(5),
    );
    let (mut conn, mut client) = connection();
    client
        .ask(AskRequest::new_conversation(Source::BrowserSession, "gpt-3.5", "Hi"))
        .await;
    let outcome = SessionHandler::new(h.broker.clone())
        .run(USER, &mut conn)
        .await;

    assert_eq!(outcome, Some(AskOutcome::Failed(FailureKind::Upstream)));
    let frames = client.drain();
    assert!(frames.iter().any(|f| f.kind == FrameType::Message));
    let error = frames.last().unwrap();
    assert_eq!(error.kind, FrameType::Error);
    assert_eq!(error.tip.as_deref(), Some(tips::UPSTREAM_ERROR));
    assert!(error.error_detail.as_deref().unwrap().contains("model overloaded"));
    assert_eq!(client.close_code(), Some(CloseCode::UpstreamError));
    assert!(h.store.history(conversation_id).is_none());
    assert!(h.broker.conversations().list(USER).await.unwrap().is_empty());
}
