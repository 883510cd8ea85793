//! The tracer: transaction and span lifecycle, sampling, and export hand-off.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, RwLock};

use rand::{rngs, Rng, SeedableRng};

use crate::context::{execution_context, ExecutionContext};
use crate::error::{TraceError, TraceResult};
use crate::ids::TraceFlags;
use crate::propagation::{inject_trace_parent, Injector};
use crate::trace::config::Config;
use crate::trace::export::{span_payload, transaction_payload, ExportQueue, InMemoryQueue, QueueKind};
use crate::trace::id_generator::{IdGenerator, RandomIdGenerator};
use crate::trace::span::{FrameCollector, FrameProcessor};
use crate::trace::transaction::{Outcome, SpanHandle, Transaction};
use crate::traceparent::TraceParent;

thread_local! {
    static SAMPLING_RNG: RefCell<rngs::SmallRng> = RefCell::new(rngs::SmallRng::from_entropy());
}

struct TracerInner {
    config: RwLock<Arc<Config>>,
    queue: Arc<dyn ExportQueue>,
    id_generator: Arc<dyn IdGenerator>,
    frame_collector: Option<FrameCollector>,
    frame_processor: Option<FrameProcessor>,
    execution_context: &'static dyn ExecutionContext,
}

impl fmt::Debug for TracerInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .field("id_generator", &self.id_generator)
            .field("execution_context", &self.execution_context)
            .finish()
    }
}

/// The entry point for all tracing operations.
///
/// Cheap to clone; all clones share the same configuration snapshot, export
/// queue and id generator. Which transaction and span are "current" is not
/// tracer state at all — that lives in the [`ExecutionContext`], so any clone
/// on any thread or task sees the same logical-task scoping.
#[derive(Clone, Debug)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

/// Builder for [`Tracer`].
pub struct TracerBuilder {
    config: Config,
    queue: Option<Arc<dyn ExportQueue>>,
    id_generator: Option<Arc<dyn IdGenerator>>,
    frame_collector: Option<FrameCollector>,
    frame_processor: Option<FrameProcessor>,
    execution_context: Option<&'static dyn ExecutionContext>,
}

impl fmt::Debug for TracerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracerBuilder")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish()
    }
}

impl Default for TracerBuilder {
    fn default() -> Self {
        TracerBuilder {
            config: Config::default(),
            queue: None,
            id_generator: None,
            frame_collector: None,
            frame_processor: None,
            execution_context: None,
        }
    }
}

impl TracerBuilder {
    /// Use this configuration snapshot instead of [`Config::default`].
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Send finished entities to this queue instead of an [`InMemoryQueue`].
    pub fn with_queue(mut self, queue: Arc<dyn ExportQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Use this id generator instead of [`RandomIdGenerator`]. It governs
    /// trace ids, transaction ids and the ids of recorded spans.
    pub fn with_id_generator<T: IdGenerator + 'static>(mut self, id_generator: T) -> Self {
        self.id_generator = Some(Arc::new(id_generator));
        self
    }

    /// Capture stacks at span start with this callback.
    ///
    /// Without a collector, no frames are captured regardless of
    /// [`Config::capture_span_frames`].
    pub fn with_frame_collector(mut self, collector: FrameCollector) -> Self {
        self.frame_collector = Some(collector);
        self
    }

    /// Post-process captured frames at span end with this callback.
    pub fn with_frame_processor(mut self, processor: FrameProcessor) -> Self {
        self.frame_processor = Some(processor);
        self
    }

    /// Use this execution context instead of the process-wide one selected by
    /// [`init_execution_context`](crate::context::init_execution_context).
    pub fn with_execution_context(mut self, context: &'static dyn ExecutionContext) -> Self {
        self.execution_context = Some(context);
        self
    }

    /// Build the tracer.
    pub fn build(self) -> Tracer {
        Tracer {
            inner: Arc::new(TracerInner {
                config: RwLock::new(Arc::new(self.config)),
                queue: self
                    .queue
                    .unwrap_or_else(|| Arc::new(InMemoryQueue::new())),
                id_generator: self
                    .id_generator
                    .unwrap_or_else(|| Arc::new(RandomIdGenerator::default())),
                frame_collector: self.frame_collector,
                frame_processor: self.frame_processor,
                execution_context: self.execution_context.unwrap_or_else(execution_context),
            }),
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Tracer::builder().build()
    }
}

impl Tracer {
    /// Start building a tracer.
    pub fn builder() -> TracerBuilder {
        TracerBuilder::default()
    }

    /// The live configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.inner
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the configuration snapshot.
    ///
    /// Transactions begun before the update keep the sampling decision and
    /// span budget they started with; the new snapshot applies to decisions
    /// made after this call.
    pub fn update_config(&self, config: Config) {
        let mut guard = self
            .inner
            .config
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(config);
    }

    /// Begin a transaction and make it current for this logical task.
    ///
    /// With an inbound `trace_parent` the trace is continued: its trace id is
    /// reused and its recorded flag is the sampling decision. Without one, a
    /// new root trace is started and sampled according to
    /// [`Config::sample_rate`].
    pub fn begin_transaction(
        &self,
        transaction_type: &str,
        trace_parent: Option<TraceParent>,
    ) -> Arc<Transaction> {
        let id = self.inner.id_generator.new_span_id();

        let transaction = match trace_parent {
            Some(inbound) => {
                let is_sampled = inbound.is_sampled();
                let parent_id = inbound.span_id();
                let trace_parent = inbound.copy_from(Some(id), None);
                Transaction::new(
                    id,
                    transaction_type,
                    trace_parent,
                    Some(parent_id),
                    is_sampled,
                    self.inner.id_generator.clone(),
                )
            }
            None => {
                let is_sampled = self.roll_sample();
                let flags = if is_sampled {
                    TraceFlags::SAMPLED
                } else {
                    TraceFlags::NOT_SAMPLED
                };
                let trace_id = self.inner.id_generator.new_trace_id();
                let trace_parent = TraceParent::new(trace_id, id, flags);
                Transaction::new(
                    id,
                    transaction_type,
                    trace_parent,
                    None,
                    is_sampled,
                    self.inner.id_generator.clone(),
                )
            }
        };

        apm_debug!(
            name: "transaction.begin",
            trace_id = transaction.trace_id().to_string(),
            transaction_id = transaction.id().to_string(),
            sampled = transaction.is_sampled()
        );

        let transaction = Arc::new(transaction);
        self.inner
            .execution_context
            .set_transaction(Some(transaction.clone()));
        transaction
    }

    /// End the current transaction, clear it from the execution context, and
    /// enqueue it for export.
    ///
    /// `name` and `result` fill in only when unset; names and results set
    /// explicitly during the transaction win. Transactions whose final name
    /// matches a [`Config::ignore_patterns`] entry are finalized but not
    /// enqueued.
    pub fn end_transaction(
        &self,
        name: Option<&str>,
        result: Option<&str>,
    ) -> TraceResult<Arc<Transaction>> {
        let transaction = self
            .inner
            .execution_context
            .take_transaction()
            .ok_or(TraceError::NoActiveTransaction)?;

        if let Some(name) = name {
            transaction.set_name(name, false);
        }
        if let Some(result) = result {
            transaction.set_result(result, false);
        }
        transaction.finish(transaction.elapsed());

        let final_name = transaction.name().unwrap_or_default();
        let config = self.config();
        if config
            .ignore_patterns
            .iter()
            .any(|pattern| pattern.is_match(&final_name))
        {
            apm_debug!(
                name: "transaction.ignored",
                transaction_name = final_name
            );
            return Ok(transaction);
        }

        self.inner
            .queue
            .enqueue(QueueKind::Transaction, transaction_payload(&transaction));
        Ok(transaction)
    }

    /// Begin a span under the current transaction and make it the current
    /// span.
    ///
    /// Returns `None` when there is no current transaction or it is
    /// unsampled; instrumentation treats that as "nothing to record" and
    /// proceeds.
    pub fn begin_span(
        &self,
        name: &str,
        span_type: &str,
        context: Option<serde_json::Value>,
        leaf: bool,
    ) -> Option<SpanHandle> {
        let transaction = self.inner.execution_context.transaction()?;
        if !transaction.is_sampled() {
            return None;
        }

        let config = self.config();
        // the collector only runs if the span survives the leaf/budget checks
        let collector = if config.capture_span_frames {
            self.inner.frame_collector.as_deref()
        } else {
            None
        };

        let parent = self.inner.execution_context.span();
        let handle = transaction.begin_span(
            name,
            span_type,
            context,
            leaf,
            config.max_spans,
            collector,
            parent,
        );
        self.inner.execution_context.set_span(Some(handle.clone()));
        Some(handle)
    }

    /// End the current span, restore its parent as current, and enqueue it
    /// for export.
    ///
    /// Captured frames are run through the frame processor first;
    /// `skip_frames` then strips that many leading frames, so the
    /// instrumentation adapter's own machinery does not show up in user
    /// stack traces. Frames of spans shorter than
    /// [`Config::span_frames_min_duration`] are discarded entirely.
    pub fn end_span(&self, skip_frames: usize) -> TraceResult<SpanHandle> {
        let handle = self
            .inner
            .execution_context
            .span()
            .ok_or(TraceError::NoActiveSpan)?;
        self.inner.execution_context.set_span(handle.parent());

        let span = match &handle {
            SpanHandle::Dropped(_) => return Ok(handle),
            SpanHandle::Span(span) => span,
        };

        let duration = span.elapsed();
        if !span.finish(duration) {
            apm_warn!(
                name: "span.already_ended",
                span_id = span.id().to_string()
            );
            return Ok(handle);
        }

        if let Some(frames) = span.take_frames() {
            let config = self.config();
            let keep = match config.span_frames_min_duration {
                None => true,
                Some(threshold) => duration >= threshold,
            };
            if keep {
                let frames = match &self.inner.frame_processor {
                    Some(process) => process(frames),
                    None => frames,
                };
                let frames: Vec<_> = frames.into_iter().skip(skip_frames).collect();
                span.set_frames(frames);
            }
        }

        if let Some(transaction) = span.transaction() {
            transaction.push_completed(span.clone());
        }
        self.inner
            .queue
            .enqueue(QueueKind::Span, span_payload(span));
        Ok(handle)
    }

    /// Begin a span and return a guard that ends it when dropped.
    ///
    /// The guard is a no-op when [`begin_span`](Tracer::begin_span) recorded
    /// nothing, so it is always safe to hold.
    pub fn capture_span(
        &self,
        name: &str,
        span_type: &str,
        context: Option<serde_json::Value>,
        leaf: bool,
    ) -> SpanScope<'_> {
        let handle = self.begin_span(name, span_type, context, leaf);
        SpanScope {
            tracer: self,
            handle,
        }
    }

    /// Run `f` inside a span.
    pub fn with_span<T>(
        &self,
        name: &str,
        span_type: &str,
        context: Option<serde_json::Value>,
        leaf: bool,
        f: impl FnOnce() -> T,
    ) -> T {
        let _scope = self.capture_span(name, span_type, context, leaf);
        f()
    }

    /// Name the current transaction, if any.
    pub fn set_transaction_name(&self, name: &str, overwrite: bool) {
        if let Some(transaction) = self.inner.execution_context.transaction() {
            transaction.set_name(name, overwrite);
        }
    }

    /// Set the result of the current transaction, if any.
    pub fn set_transaction_result(&self, result: &str, overwrite: bool) {
        if let Some(transaction) = self.inner.execution_context.transaction() {
            transaction.set_result(result, overwrite);
        }
    }

    /// Set the outcome of the current transaction, if any.
    pub fn set_transaction_outcome(&self, outcome: Outcome, overwrite: bool) {
        if let Some(transaction) = self.inner.execution_context.transaction() {
            transaction.set_outcome(outcome, overwrite);
        }
    }

    /// Merge context into the current transaction under `key`.
    ///
    /// `value` is only evaluated when the current transaction is sampled, so
    /// adapters can pass an expensive closure unconditionally.
    pub fn set_context(&self, key: &str, value: impl FnOnce() -> serde_json::Value) {
        if let Some(transaction) = self.inner.execution_context.transaction() {
            if transaction.is_sampled() {
                transaction.set_context(key, value());
            }
        }
    }

    /// The trace context an outbound call made right now should carry:
    /// the current trace with the innermost open span (or the transaction)
    /// as parent.
    pub fn current_trace_parent(&self) -> Option<TraceParent> {
        let transaction = self.inner.execution_context.transaction()?;
        let parent_id = self
            .inner
            .execution_context
            .span()
            .as_ref()
            .and_then(SpanHandle::as_span)
            .map_or(transaction.id(), |span| span.id());
        Some(transaction.trace_parent().copy_from(Some(parent_id), None))
    }

    /// Inject the current trace context into an outbound carrier. A no-op
    /// outside a transaction.
    pub fn inject(&self, injector: &mut dyn Injector) {
        if let Some(trace_parent) = self.current_trace_parent() {
            inject_trace_parent(&trace_parent, injector, self.config().use_legacy_header);
        }
    }

    fn roll_sample(&self) -> bool {
        let rate = self.config().sample_rate;
        rate >= 1.0 || SAMPLING_RNG.with(|rng| rng.borrow_mut().gen::<f64>() < rate)
    }
}

/// Guard returned by [`Tracer::capture_span`]; ends the span on drop.
#[derive(Debug)]
pub struct SpanScope<'a> {
    tracer: &'a Tracer,
    handle: Option<SpanHandle>,
}

impl SpanScope<'_> {
    /// The handle begun for this scope, when one was recorded.
    pub fn handle(&self) -> Option<&SpanHandle> {
        self.handle.as_ref()
    }
}

impl Drop for SpanScope<'_> {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        if let Err(error) = self.tracer.end_span(0) {
            apm_warn!(
                name: "span.unbalanced_end",
                error = format!("{error}")
            );
        }
    }
}
