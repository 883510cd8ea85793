//! Hand-off of finished transactions and spans to the export pipeline.
//!
//! The tracer serializes each finished entity into a JSON payload and pushes
//! it onto an [`ExportQueue`]. Transport, batching and retry all live behind
//! that trait; [`InMemoryQueue`] is the test double that just accumulates
//! payloads.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use crate::trace::span::Span;
use crate::trace::transaction::Transaction;

/// The kind of entity a payload describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// A finished transaction.
    Transaction,
    /// A finished span.
    Span,
}

/// Sink for finished trace entities.
///
/// `enqueue` must not block: it is called on the instrumented application's
/// thread while a request is being handled.
pub trait ExportQueue: Send + Sync + fmt::Debug {
    /// Accept a payload for eventual export.
    fn enqueue(&self, kind: QueueKind, payload: Value);
}

/// An [`ExportQueue`] that accumulates payloads in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryQueue {
    entries: Arc<Mutex<Vec<(QueueKind, Value)>>>,
}

impl InMemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        InMemoryQueue::default()
    }

    /// All payloads enqueued so far, in order.
    pub fn get_finished(&self) -> Vec<(QueueKind, Value)> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// The transaction payloads enqueued so far, in order.
    pub fn transactions(&self) -> Vec<Value> {
        self.of_kind(QueueKind::Transaction)
    }

    /// The span payloads enqueued so far, in order.
    pub fn spans(&self) -> Vec<Value> {
        self.of_kind(QueueKind::Span)
    }

    /// Discard everything enqueued so far.
    pub fn reset(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    fn of_kind(&self, kind: QueueKind) -> Vec<Value> {
        self.get_finished()
            .into_iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, payload)| payload)
            .collect()
    }
}

impl ExportQueue for InMemoryQueue {
    fn enqueue(&self, kind: QueueKind, payload: Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((kind, payload));
        }
    }
}

fn timestamp_micros(timestamp: SystemTime) -> u128 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_micros()
}

fn duration_millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

pub(crate) fn span_payload(span: &Span) -> Value {
    let mut payload = json!({
        "id": span.id().to_string(),
        "trace_id": span.trace_id().to_string(),
        "parent_id": span.parent_id().to_string(),
        "name": span.name(),
        "type": span.span_type(),
        "timestamp": timestamp_micros(span.timestamp()),
        "duration": span.duration().map(duration_millis),
    });
    if let Some(context) = span.context() {
        payload["context"] = context;
    }
    if let Some(frames) = span.frames() {
        if let Ok(stacktrace) = serde_json::to_value(frames) {
            payload["stacktrace"] = stacktrace;
        }
    }
    payload
}

pub(crate) fn transaction_payload(transaction: &Transaction) -> Value {
    let mut payload = json!({
        "id": transaction.id().to_string(),
        "trace_id": transaction.trace_id().to_string(),
        "name": transaction.name(),
        "type": transaction.transaction_type(),
        "timestamp": timestamp_micros(transaction.timestamp()),
        "duration": transaction.duration().map(duration_millis),
        "result": transaction.result(),
        "outcome": transaction.outcome().map(|outcome| outcome.to_string()),
        "sampled": transaction.is_sampled(),
        "span_count": {
            "started": transaction.started_span_count(),
            "dropped": transaction.dropped_span_count(),
        },
    });
    if let Some(parent_id) = transaction.parent_id() {
        payload["parent_id"] = json!(parent_id.to_string());
    }
    let context = transaction.context();
    if !context.is_empty() {
        payload["context"] = Value::Object(context);
    }
    payload
}
