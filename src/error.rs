use std::sync::PoisonError;
use thiserror::Error;

use crate::traceparent::TraceParentParseError;

/// A specialized `Result` type for tracing operations.
pub type TraceResult<T> = Result<T, TraceError>;

/// Errors returned by the tracing core.
///
/// None of these ever escape into instrumented application control flow on
/// their own; they are surfaced to the immediate caller (usually an adapter
/// or the [`SpanScope`] guard), which logs them and continues.
///
/// [`SpanScope`]: crate::trace::SpanScope
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// `end_span` was called without a span being current for this task.
    ///
    /// This happens when begin/end calls are mismatched, e.g. after an
    /// exception path skipped a begin. Callers log this at low severity and
    /// continue, never crash the request.
    #[error("no span is currently active for this task")]
    NoActiveSpan,

    /// An operation needed a current transaction and none was active.
    #[error("no transaction is currently active for this task")]
    NoActiveTransaction,

    /// An inbound trace context header could not be parsed.
    ///
    /// Treated as "no incoming trace context" by every caller; a fresh root
    /// trace is minted instead.
    #[error(transparent)]
    InvalidTraceParent(#[from] TraceParentParseError),

    /// Other errors not covered above.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<String> for TraceError {
    fn from(err_msg: String) -> Self {
        TraceError::Other(err_msg.into())
    }
}

impl<T> From<PoisonError<T>> for TraceError {
    fn from(err: PoisonError<T>) -> Self {
        TraceError::Other(err.to_string().into())
    }
}
