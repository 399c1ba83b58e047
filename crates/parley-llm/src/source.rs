use crate::request::CompletionRequest;
use crate::response::Response;

/// A concrete, type-erased upstream chat source.
///
/// Wraps a [`ChatSourceBackend`] so callers never need generics.
pub struct ChatSource {
    inner: Box<dyn ChatSourceBackend>,
}

impl ChatSource {
    /// Wrap any backend implementation into a source.
    pub fn new(backend: impl ChatSourceBackend + 'static) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    /// The source name (e.g. `"browser_session"`, `"api"`).
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Start a streaming completion.
    pub fn complete(&self, request: CompletionRequest) -> Response {
        self.inner.complete(request)
    }
}

/// Trait that source crates implement.
pub trait ChatSourceBackend: Send + Sync {
    fn name(&self) -> &str;
    fn complete(&self, request: CompletionRequest) -> Response;
}
