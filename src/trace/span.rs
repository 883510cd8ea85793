//! Spans: traced operations nested under a transaction.
//!
//! A span is created open, becomes the current span of its logical task, and
//! ends exactly once — either serialized (`ended`) or elided (`dropped`, see
//! [`DroppedSpan`]). There is no transition back out of a terminal state.
//!
//! [`DroppedSpan`]: crate::trace::DroppedSpan

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::ids::{SpanId, TraceId};
use crate::trace::Transaction;

/// One captured stack frame, as shown to users inspecting a span.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Frame {
    /// Function or symbol name.
    pub function: String,
    /// Module or crate path, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Source file, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Line number, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineno: Option<u32>,
}

/// Collaborator callback that captures a raw stack at span start.
pub type FrameCollector = Arc<dyn Fn() -> Vec<Frame> + Send + Sync>;

/// Collaborator callback that post-processes captured frames at span end
/// (symbolication, trimming, source-context lookup).
pub type FrameProcessor = Arc<dyn Fn(Vec<Frame>) -> Vec<Frame> + Send + Sync>;

#[derive(Debug, Default)]
struct SpanData {
    duration: Option<Duration>,
    context: Option<serde_json::Value>,
    frames: Option<Vec<Frame>>,
}

/// A traced operation nested under a [`Transaction`].
///
/// The parent chain is singly linked backward and terminates at the
/// transaction: a span can only ever be parented to whatever was current in
/// the execution context when it began, so no cycles can form.
#[derive(Debug)]
pub struct Span {
    id: SpanId,
    trace_id: TraceId,
    parent_id: SpanId,
    name: String,
    span_type: String,
    leaf: bool,
    timestamp: SystemTime,
    start_time: Instant,
    parent: Option<Arc<Span>>,
    transaction: Weak<Transaction>,
    data: Mutex<SpanData>,
}

impl Span {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SpanId,
        trace_id: TraceId,
        parent_id: SpanId,
        name: &str,
        span_type: &str,
        leaf: bool,
        timestamp: SystemTime,
        parent: Option<Arc<Span>>,
        transaction: Weak<Transaction>,
        context: Option<serde_json::Value>,
        frames: Option<Vec<Frame>>,
    ) -> Self {
        Span {
            id,
            trace_id,
            parent_id,
            name: name.to_string(),
            span_type: span_type.to_string(),
            leaf,
            timestamp,
            start_time: Instant::now(),
            parent,
            transaction,
            data: Mutex::new(SpanData {
                duration: None,
                context,
                frames,
            }),
        }
    }

    /// The span's own id.
    pub fn id(&self) -> SpanId {
        self.id
    }

    /// The trace this span belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// Id of the enclosing span, or of the transaction for top-level spans.
    pub fn parent_id(&self) -> SpanId {
        self.parent_id
    }

    /// The span name, e.g. `"SELECT FROM users"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The span type, e.g. `"db.postgresql.query"`.
    pub fn span_type(&self) -> &str {
        &self.span_type
    }

    /// Whether descendants of this span are elided.
    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Wall-clock start, derived from the transaction's wall-clock start plus
    /// the monotonic offset, so span timestamps are monotonic relative to the
    /// transaction.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The enclosing span, `None` when parented directly on the transaction.
    pub fn parent(&self) -> Option<&Arc<Span>> {
        self.parent.as_ref()
    }

    /// The owning transaction, unless it has already been released.
    pub fn transaction(&self) -> Option<Arc<Transaction>> {
        self.transaction.upgrade()
    }

    /// Monotonic time elapsed since the span began.
    pub(crate) fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Set the final duration. Returns `false` when the span had already
    /// ended; the duration is only ever set once.
    pub(crate) fn finish(&self, duration: Duration) -> bool {
        self.with_data(|data| {
            if data.duration.is_some() {
                false
            } else {
                data.duration = Some(duration);
                true
            }
        })
        .unwrap_or(false)
    }

    /// The final duration, `None` while the span is still open.
    pub fn duration(&self) -> Option<Duration> {
        self.with_data(|data| data.duration).flatten()
    }

    /// Free-form context attached at span start.
    pub fn context(&self) -> Option<serde_json::Value> {
        self.with_data(|data| data.context.clone()).flatten()
    }

    /// Captured stack frames, when the capture policy kept them.
    pub fn frames(&self) -> Option<Vec<Frame>> {
        self.with_data(|data| data.frames.clone()).flatten()
    }

    pub(crate) fn take_frames(&self) -> Option<Vec<Frame>> {
        self.with_data(|data| data.frames.take()).flatten()
    }

    pub(crate) fn set_frames(&self, frames: Vec<Frame>) {
        self.with_data(|data| data.frames = Some(frames));
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut SpanData) -> T) -> Option<T> {
        self.data.lock().ok().map(|mut guard| f(&mut guard))
    }
}
