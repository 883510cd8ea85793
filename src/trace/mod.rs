//! Transaction and span recording.
//!
//! The [`Tracer`] is the entry point: it begins and ends transactions and
//! spans, makes the sampling decision, enforces the per-transaction span
//! budget, and hands finished entities to the [`ExportQueue`]. Which
//! transaction and span are current for a logical task lives in the
//! [`ExecutionContext`](crate::context::ExecutionContext), not in the tracer.

mod config;
mod export;
mod id_generator;
mod span;
mod tracer;
mod transaction;

pub use config::{
    parse_duration, parse_size, Config, ConfigBuilder, ConfigError, ConfigErrors,
    DEFAULT_MAX_SPANS, DEFAULT_SPAN_FRAMES_MIN_DURATION,
};
pub use export::{ExportQueue, InMemoryQueue, QueueKind};
pub use id_generator::{IdGenerator, IncrementIdGenerator, RandomIdGenerator};
pub use span::{Frame, FrameCollector, FrameProcessor, Span};
pub use tracer::{SpanScope, Tracer, TracerBuilder};
pub use transaction::{DroppedSpan, Outcome, SpanHandle, Transaction};
