use crate::error::Error;
use crate::stream::{FinishReason, StreamEvent, Usage};
use futures::Stream;
use std::pin::Pin;
use tokio_stream::StreamExt;

/// A live streaming reply from an upstream source.
///
/// Consume it event-by-event via [`events()`](Response::events), or collect
/// the final state with [`into_result()`](Response::into_result).
pub struct Response {
    inner: Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>,
}

impl Response {
    pub fn new(stream: impl Stream<Item = Result<StreamEvent, Error>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }

    /// A response that fails immediately, before any upstream call.
    pub fn error(error: Error) -> Self {
        Self::new(futures::stream::once(async move { Err(error) }))
    }

    /// Consume the response as an async stream of events.
    pub fn events(self) -> Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>> {
        self.inner
    }

    /// Drain the stream, keeping the accumulated API text and the last
    /// browser-session snapshot.
    pub async fn into_result(self) -> Result<CompletionResult, Error> {
        let mut text = String::new();
        let mut last_snapshot = None;
        let mut finish_reason = None;
        let mut usage = None;

        let mut stream = self.inner;
        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::TextDelta { delta, .. } => text.push_str(&delta),
                StreamEvent::Snapshot(snapshot) => last_snapshot = Some(snapshot),
                StreamEvent::Finish { reason, usage: u } => {
                    finish_reason = reason;
                    usage = u;
                }
            }
        }

        Ok(CompletionResult {
            text,
            last_snapshot,
            finish_reason: finish_reason.unwrap_or(FinishReason::Stop),
            usage: usage.unwrap_or_default(),
        })
    }
}

/// The collected result of a streamed completion.
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub text: String,
    pub last_snapshot: Option<serde_json::Value>,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}
