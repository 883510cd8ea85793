//! Transactions: the root unit of work of a trace.
//!
//! A transaction owns every span recorded under it. Spans that fall outside
//! the recording budget, or start under a leaf ancestor, are represented by
//! [`DroppedSpan`] placeholders so nesting bookkeeping stays correct without
//! recording anything.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;

use crate::ids::{SpanId, TraceId};
use crate::trace::id_generator::IdGenerator;
use crate::trace::span::{Frame, Span};
use crate::traceparent::TraceParent;

/// High-level verdict on a completed unit of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The work completed as intended.
    Success,
    /// The work failed.
    Failure,
    /// No verdict could be determined.
    Unknown,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Failure => f.write_str("failure"),
            Outcome::Unknown => f.write_str("unknown"),
        }
    }
}

/// Placeholder for a span that was started but will never be recorded.
///
/// It participates in parent bookkeeping so that unwinding the current-span
/// chain stays balanced, but carries no recordable data of its own.
#[derive(Debug)]
pub struct DroppedSpan {
    parent: Option<SpanHandle>,
    leaf: bool,
}

impl DroppedSpan {
    pub(crate) fn new(parent: Option<SpanHandle>, leaf: bool) -> Self {
        DroppedSpan { parent, leaf }
    }

    /// The handle that was current when this placeholder was created.
    pub fn parent(&self) -> Option<&SpanHandle> {
        self.parent.as_ref()
    }

    /// Whether descendants of this placeholder are elided as well.
    pub fn is_leaf(&self) -> bool {
        self.leaf
    }
}

/// A started span: either recorded or a dropped placeholder.
///
/// Instrumentation holds and unwinds these uniformly; only the tracer cares
/// which variant it got back.
#[derive(Clone, Debug)]
pub enum SpanHandle {
    /// A recorded span.
    Span(Arc<Span>),
    /// A placeholder for an elided span.
    Dropped(Arc<DroppedSpan>),
}

impl SpanHandle {
    /// Whether spans started under this handle are elided.
    pub fn is_leaf(&self) -> bool {
        match self {
            SpanHandle::Span(span) => span.is_leaf(),
            SpanHandle::Dropped(dropped) => dropped.is_leaf(),
        }
    }

    /// The handle that was current when this one was created.
    pub fn parent(&self) -> Option<SpanHandle> {
        match self {
            SpanHandle::Span(span) => span.parent().cloned().map(SpanHandle::Span),
            SpanHandle::Dropped(dropped) => dropped.parent().cloned(),
        }
    }

    /// The recorded span, when this handle is one.
    pub fn as_span(&self) -> Option<&Arc<Span>> {
        match self {
            SpanHandle::Span(span) => Some(span),
            SpanHandle::Dropped(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct TransactionData {
    name: Option<String>,
    result: Option<String>,
    outcome: Option<Outcome>,
    duration: Option<Duration>,
    spans: Vec<Arc<Span>>,
    span_counter: u32,
    dropped_spans: u32,
    context: serde_json::Map<String, serde_json::Value>,
}

/// The root unit of work of a trace: one request, job or message handling.
///
/// Created by the tracer, carried in the execution context while active, and
/// turned into an export payload when it ends. All mutable state sits behind
/// one internal lock; every accessor degrades to `None`/default if the lock
/// was poisoned by a panicking thread.
#[derive(Debug)]
pub struct Transaction {
    id: SpanId,
    transaction_type: String,
    trace_parent: TraceParent,
    parent_id: Option<SpanId>,
    is_sampled: bool,
    timestamp: SystemTime,
    start_time: Instant,
    id_generator: Arc<dyn IdGenerator>,
    data: Mutex<TransactionData>,
}

impl Transaction {
    pub(crate) fn new(
        id: SpanId,
        transaction_type: &str,
        trace_parent: TraceParent,
        parent_id: Option<SpanId>,
        is_sampled: bool,
        id_generator: Arc<dyn IdGenerator>,
    ) -> Self {
        Transaction {
            id,
            transaction_type: transaction_type.to_string(),
            trace_parent,
            parent_id,
            is_sampled,
            timestamp: SystemTime::now(),
            start_time: Instant::now(),
            id_generator,
            data: Mutex::new(TransactionData::default()),
        }
    }

    /// The transaction's own id; also the `parent-id` of outbound headers
    /// when no span is active.
    pub fn id(&self) -> SpanId {
        self.id
    }

    /// The trace this transaction belongs to.
    pub fn trace_id(&self) -> TraceId {
        self.trace_parent.trace_id()
    }

    /// The transaction type, e.g. `"request"`.
    pub fn transaction_type(&self) -> &str {
        &self.transaction_type
    }

    /// The trace context this transaction continues or started.
    pub fn trace_parent(&self) -> &TraceParent {
        &self.trace_parent
    }

    /// Id of the upstream caller's span, when the trace was continued.
    pub fn parent_id(&self) -> Option<SpanId> {
        self.parent_id
    }

    /// Whether this transaction records spans and gets exported with them.
    /// Unsampled transactions are still exported, span-less.
    pub fn is_sampled(&self) -> bool {
        self.is_sampled
    }

    /// Wall-clock start of the transaction.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Monotonic time elapsed since the transaction began.
    pub(crate) fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Start a span under this transaction.
    ///
    /// Returns a placeholder handle instead of a recorded span when the
    /// parent handle is a leaf, or when the `max_spans` budget (`0` means
    /// unlimited) is exhausted. Budget drops are counted; leaf elisions are
    /// not, since the caller opted out of recording that subtree.
    ///
    /// `collect_frames` runs only when a recorded span is actually
    /// constructed; elided spans never pay for stack capture.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn begin_span(
        self: &Arc<Self>,
        name: &str,
        span_type: &str,
        context: Option<serde_json::Value>,
        leaf: bool,
        max_spans: u32,
        collect_frames: Option<&(dyn Fn() -> Vec<Frame> + Send + Sync)>,
        parent: Option<SpanHandle>,
    ) -> SpanHandle {
        if parent.as_ref().is_some_and(SpanHandle::is_leaf) {
            return SpanHandle::Dropped(Arc::new(DroppedSpan::new(parent, true)));
        }

        let over_budget = self
            .with_data(|data| {
                if max_spans != 0 && data.span_counter >= max_spans {
                    data.span_counter += 1;
                    data.dropped_spans += 1;
                    true
                } else {
                    data.span_counter += 1;
                    false
                }
            })
            .unwrap_or(true);
        if over_budget {
            return SpanHandle::Dropped(Arc::new(DroppedSpan::new(parent, false)));
        }

        let parent_span = parent.as_ref().and_then(SpanHandle::as_span).cloned();
        let parent_id = parent_span.as_ref().map_or(self.id, |span| span.id());
        let span = Span::new(
            self.id_generator.new_span_id(),
            self.trace_id(),
            parent_id,
            name,
            span_type,
            leaf,
            self.timestamp + self.elapsed(),
            parent_span,
            Arc::downgrade(self),
            context,
            collect_frames.map(|collect| collect()),
        );
        SpanHandle::Span(Arc::new(span))
    }

    /// Record a finished span for export with this transaction.
    pub(crate) fn push_completed(&self, span: Arc<Span>) {
        self.with_data(|data| data.spans.push(span));
    }

    /// The transaction name, once set.
    pub fn name(&self) -> Option<String> {
        self.with_data(|data| data.name.clone()).flatten()
    }

    /// Set the transaction name. With `overwrite` false, an already-set name
    /// is kept.
    pub fn set_name(&self, name: &str, overwrite: bool) {
        self.with_data(|data| {
            if overwrite || data.name.is_none() {
                data.name = Some(name.to_string());
            }
        });
    }

    /// The transaction result, once set.
    pub fn result(&self) -> Option<String> {
        self.with_data(|data| data.result.clone()).flatten()
    }

    /// Set the transaction result. With `overwrite` false, an already-set
    /// result is kept.
    pub fn set_result(&self, result: &str, overwrite: bool) {
        self.with_data(|data| {
            if overwrite || data.result.is_none() {
                data.result = Some(result.to_string());
            }
        });
    }

    /// The transaction outcome, once set.
    pub fn outcome(&self) -> Option<Outcome> {
        self.with_data(|data| data.outcome).flatten()
    }

    /// Set the transaction outcome. With `overwrite` false, an already-set
    /// outcome is kept.
    pub fn set_outcome(&self, outcome: Outcome, overwrite: bool) {
        self.with_data(|data| {
            if overwrite || data.outcome.is_none() {
                data.outcome = Some(outcome);
            }
        });
    }

    /// Merge a value into the transaction's context under `key`.
    pub fn set_context(&self, key: &str, value: serde_json::Value) {
        self.with_data(|data| data.context.insert(key.to_string(), value));
    }

    /// Snapshot of the transaction's context.
    pub fn context(&self) -> serde_json::Map<String, serde_json::Value> {
        self.with_data(|data| data.context.clone())
            .unwrap_or_default()
    }

    /// Set the final duration. Returns `false` when the transaction had
    /// already ended; the duration is only ever set once.
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

    /// The final duration, `None` while the transaction is still active.
    pub fn duration(&self) -> Option<Duration> {
        self.with_data(|data| data.duration).flatten()
    }

    /// Finished spans recorded so far.
    pub fn spans(&self) -> Vec<Arc<Span>> {
        self.with_data(|data| data.spans.clone()).unwrap_or_default()
    }

    /// Number of spans that started and were recorded.
    pub fn started_span_count(&self) -> u32 {
        self.with_data(|data| data.span_counter - data.dropped_spans)
            .unwrap_or(0)
    }

    /// Number of spans dropped because the budget was exhausted.
    pub fn dropped_span_count(&self) -> u32 {
        self.with_data(|data| data.dropped_spans).unwrap_or(0)
    }

    fn with_data<T>(&self, f: impl FnOnce(&mut TransactionData) -> T) -> Option<T> {
        self.data.lock().ok().map(|mut guard| f(&mut guard))
    }
}
