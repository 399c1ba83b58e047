//! Decodes the `data: <json>` line streams of both sources into parley-llm
//! `StreamEvent`s.
//!
//! Both sources end with a `data: [DONE]` sentinel. A line that is not valid
//! JSON is skipped; the stream only fails on it when no usable line was ever
//! seen.

use eventsource_stream::{EventStreamError, Eventsource};
use futures::Stream;
use parley_llm::error::Error;
use parley_llm::stream::{FinishReason, StreamEvent, Usage};
use tokio_stream::StreamExt;

use crate::types::ChatCompletionChunk;

const DONE_SENTINEL: &str = "[DONE]";

/// Decode a browser-session reply stream into message snapshots.
pub fn web_events<S, B>(bytes: S) -> impl Stream<Item = Result<StreamEvent, Error>> + Send
where
    S: Stream<Item = Result<B, Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    async_stream::try_stream! {
        let mut sse = Box::pin(bytes.eventsource());
        let mut mapper = SnapshotMapper::default();

        while let Some(event) = sse.next().await {
            let event = event.map_err(map_stream_error)?;
            match classify(&event.data) {
                Line::Done => break,
                Line::Blank => continue,
                Line::Undecodable => {
                    mapper.skipped += 1;
                    tracing::warn!("skipping undecodable browser-session line");
                }
                Line::Json(value) => {
                    if let Some(stream_event) = mapper.map_line(value)? {
                        yield stream_event;
                    }
                }
            }
        }

        mapper.finish()?;
    }
}

/// Decode an API `/chat/completions` stream into text deltas.
pub fn api_events<S, B>(bytes: S) -> impl Stream<Item = Result<StreamEvent, Error>> + Send
where
    S: Stream<Item = Result<B, Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    async_stream::try_stream! {
        let mut sse = Box::pin(bytes.eventsource());
        let mut mapper = ChunkMapper::default();

        while let Some(event) = sse.next().await {
            let event = event.map_err(map_stream_error)?;
            match classify(&event.data) {
                Line::Done => break,
                Line::Blank => continue,
                Line::Undecodable => {
                    mapper.skipped += 1;
                    tracing::warn!("skipping undecodable api line");
                }
                Line::Json(value) => {
                    for stream_event in mapper.map_line(value)? {
                        yield stream_event;
                    }
                }
            }
        }

        mapper.finish()?;
    }
}

enum Line {
    Done,
    Blank,
    Undecodable,
    Json(serde_json::Value),
}

fn classify(data: &str) -> Line {
    let data = data.trim();
    if data.is_empty() {
        Line::Blank
    } else if data == DONE_SENTINEL {
        Line::Done
    } else {
        match serde_json::from_str(data) {
            Ok(value) => Line::Json(value),
            Err(_) => Line::Undecodable,
        }
    }
}

fn map_stream_error(e: EventStreamError<Error>) -> Error {
    match e {
        EventStreamError::Transport(inner) => inner,
        other => Error::Sse(other.to_string()),
    }
}

fn upstream_error(value: &serde_json::Value) -> Option<Error> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    let message = match error {
        serde_json::Value::String(s) => s.clone(),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(ToString::to_string)
            .unwrap_or_else(|| other.to_string()),
    };
    Some(Error::Api {
        code: "stream".to_string(),
        message,
        metadata: Default::default(),
    })
}

// ---------------------------------------------------------------------------
// Browser-session snapshots
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SnapshotMapper {
    usable: usize,
    skipped: usize,
}

impl SnapshotMapper {
    fn map_line(&mut self, value: serde_json::Value) -> Result<Option<StreamEvent>, Error> {
        let has_content = value
            .get("message")
            .and_then(|m| m.get("content"))
            .is_some_and(|c| !c.is_null());
        if has_content {
            self.usable += 1;
            return Ok(Some(StreamEvent::Snapshot(value)));
        }

        if let Some(error) = upstream_error(&value) {
            return Err(error);
        }

        if self.usable == 0 {
            return Err(Error::Malformed(format!(
                "first line carries no message content: {}",
                preview(&value)
            )));
        }

        tracing::warn!(line = %preview(&value), "field missing in browser-session line");
        Ok(None)
    }

    fn finish(&self) -> Result<(), Error> {
        if self.usable == 0 && self.skipped > 0 {
            return Err(Error::Malformed(format!(
                "{} undecodable lines and no usable one",
                self.skipped
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// API chunks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChunkMapper {
    usable: usize,
    skipped: usize,
}

impl ChunkMapper {
    fn map_line(&mut self, value: serde_json::Value) -> Result<Vec<StreamEvent>, Error> {
        if let Some(error) = upstream_error(&value) {
            return Err(error);
        }

        let chunk: ChatCompletionChunk = match serde_json::from_value(value) {
            Ok(chunk) => chunk,
            Err(e) => {
                self.skipped += 1;
                tracing::warn!(error = %e, "api chunk did not validate");
                return Ok(Vec::new());
            }
        };
        self.usable += 1;

        let usage = chunk.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        let mut events = Vec::new();
        let mut finish_reason = None;
        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(delta) = choice.delta.and_then(|d| d.content)
                && !delta.is_empty()
            {
                events.push(StreamEvent::TextDelta {
                    id: chunk.id.clone(),
                    delta,
                });
            }
            finish_reason = choice.finish_reason.as_deref().map(FinishReason::parse);
        }

        if finish_reason.is_some() || usage.is_some() {
            events.push(StreamEvent::Finish {
                reason: finish_reason,
                usage,
            });
        }
        Ok(events)
    }

    fn finish(&self) -> Result<(), Error> {
        if self.usable == 0 && self.skipped > 0 {
            return Err(Error::Malformed(format!(
                "{} undecodable lines and no usable one",
                self.skipped
            )));
        }
        Ok(())
    }
}

fn preview(value: &serde_json::Value) -> String {
    let text = value.to_string();
    match text.char_indices().nth(200) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text,
    }
}
