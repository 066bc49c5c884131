//! The telemetry seam.
//!
//! Tracing and error-reporting backends are collaborators, not engine
//! concerns: the engine talks to one trait and ships a no-op
//! implementation. The daemon may wire a real backend in; tests never
//! have to.

use std::collections::HashMap;

/// An opaque span handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpanId(pub u64);

impl SpanId {
    /// The root span.
    pub const ROOT: SpanId = SpanId(0);
}

/// Receives operation spans and captured errors.
pub trait Observer: Send + Sync {
    /// Opens a span under `parent` and returns its handle.
    fn span(&self, name: &str, parent: SpanId) -> SpanId;

    /// Closes a span.
    fn finish(&self, span: SpanId);

    /// Captures an error with context tags.
    fn capture(&self, error: &str, tags: &HashMap<String, String>);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn span(&self, _name: &str, _parent: SpanId) -> SpanId {
        SpanId::ROOT
    }

    fn finish(&self, _span: SpanId) {}

    fn capture(&self, _error: &str, _tags: &HashMap<String, String>) {}
}
