//! Execution-scoped storage of the current transaction and span.
//!
//! Instrumented code at arbitrary call depth needs to reach "the transaction
//! and span of this logical task" without parameter threading. The
//! [`ExecutionContext`] trait provides that lookup; two backing strategies
//! exist and one is selected per process at startup, never mixed:
//!
//! * [`ThreadLocalContext`] — one slot per OS thread, for blocking
//!   multi-threaded applications where each thread owns one logical task at
//!   a time.
//! * [`TaskLocalContext`] (`rt-tokio` feature) — one slot per cooperative
//!   task. Values survive suspension points and concurrent tasks never
//!   observe each other's slot.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::trace::{SpanHandle, Transaction};

/// Per-logical-task storage slot.
#[derive(Clone, Debug, Default)]
pub(crate) struct Slot {
    transaction: Option<Arc<Transaction>>,
    span: Option<SpanHandle>,
}

/// Per-logical-task storage of the current transaction and span.
///
/// All operations are infallible: outside any task scope the getters return
/// `None` and the setters are no-ops, so a mis-wired adapter degrades to
/// "missing trace data" instead of failing the application.
pub trait ExecutionContext: Send + Sync + fmt::Debug {
    /// The transaction currently owned by this logical task, if any.
    fn transaction(&self) -> Option<Arc<Transaction>>;

    /// Replace the current transaction.
    fn set_transaction(&self, transaction: Option<Arc<Transaction>>);

    /// Remove and return the current transaction, also clearing the current
    /// span. This is the deterministic task-boundary clear used by
    /// `end_transaction`.
    fn take_transaction(&self) -> Option<Arc<Transaction>>;

    /// The innermost open span of this logical task, if any.
    fn span(&self) -> Option<SpanHandle>;

    /// Replace the current span. Passing the span's parent (or `None`) is the
    /// unset path used when a span ends.
    fn set_span(&self, span: Option<SpanHandle>);
}

thread_local! {
    static CURRENT_SLOT: RefCell<Slot> = RefCell::new(Slot::default());
}

/// [`ExecutionContext`] backed by OS-thread-local storage.
///
/// No locking is involved: each thread owns exactly one logical task at a
/// time, so its slot is never contended.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadLocalContext;

impl ExecutionContext for ThreadLocalContext {
    fn transaction(&self) -> Option<Arc<Transaction>> {
        CURRENT_SLOT.with(|slot| slot.borrow().transaction.clone())
    }

    fn set_transaction(&self, transaction: Option<Arc<Transaction>>) {
        CURRENT_SLOT.with(|slot| slot.borrow_mut().transaction = transaction);
    }

    fn take_transaction(&self) -> Option<Arc<Transaction>> {
        CURRENT_SLOT.with(|slot| {
            let mut slot = slot.borrow_mut();
            slot.span = None;
            slot.transaction.take()
        })
    }

    fn span(&self) -> Option<SpanHandle> {
        CURRENT_SLOT.with(|slot| slot.borrow().span.clone())
    }

    fn set_span(&self, span: Option<SpanHandle>) {
        CURRENT_SLOT.with(|slot| slot.borrow_mut().span = span);
    }
}

#[cfg(feature = "rt-tokio")]
mod task_local {
    use super::*;
    use std::future::Future;

    tokio::task_local! {
        static TASK_SLOT: RefCell<Slot>;
    }

    /// [`ExecutionContext`] backed by tokio task-local storage.
    ///
    /// Each logical task must run inside [`TaskLocalContext::scope`] (or
    /// [`scope_inherit`]); inside the scope the slot survives any number of
    /// suspension points and is invisible to sibling tasks. Outside a scope,
    /// reads return `None` and writes are dropped.
    ///
    /// [`scope_inherit`]: TaskLocalContext::scope_inherit
    #[derive(Clone, Copy, Debug, Default)]
    pub struct TaskLocalContext;

    impl TaskLocalContext {
        /// Run `fut` with a fresh, empty context slot.
        pub async fn scope<F: Future>(fut: F) -> F::Output {
            TASK_SLOT.scope(RefCell::new(Slot::default()), fut).await
        }

        /// Run `fut` with a copy of the calling task's slot.
        ///
        /// This is the copy-on-fork handoff: the child task starts out seeing
        /// the parent's current transaction and span, but mutations on either
        /// side stay isolated afterwards.
        pub async fn scope_inherit<F: Future>(fut: F) -> F::Output {
            let snapshot = TASK_SLOT
                .try_with(|slot| slot.borrow().clone())
                .unwrap_or_default();
            TASK_SLOT.scope(RefCell::new(snapshot), fut).await
        }
    }

    impl ExecutionContext for TaskLocalContext {
        fn transaction(&self) -> Option<Arc<Transaction>> {
            TASK_SLOT
                .try_with(|slot| slot.borrow().transaction.clone())
                .ok()
                .flatten()
        }

        fn set_transaction(&self, transaction: Option<Arc<Transaction>>) {
            let _ = TASK_SLOT.try_with(|slot| slot.borrow_mut().transaction = transaction);
        }

        fn take_transaction(&self) -> Option<Arc<Transaction>> {
            TASK_SLOT
                .try_with(|slot| {
                    let mut slot = slot.borrow_mut();
                    slot.span = None;
                    slot.transaction.take()
                })
                .ok()
                .flatten()
        }

        fn span(&self) -> Option<SpanHandle> {
            TASK_SLOT
                .try_with(|slot| slot.borrow().span.clone())
                .ok()
                .flatten()
        }

        fn set_span(&self, span: Option<SpanHandle>) {
            let _ = TASK_SLOT.try_with(|slot| slot.borrow_mut().span = span);
        }
    }
}

#[cfg(feature = "rt-tokio")]
pub use task_local::TaskLocalContext;

/// The two supported scheduling models. Selected once per process, fixed
/// thereafter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ContextStrategy {
    /// Multi-threaded blocking model: one slot per OS thread.
    ThreadLocal,
    /// Single-threaded cooperative model: one slot per tokio task.
    #[cfg(feature = "rt-tokio")]
    TaskLocal,
}

static THREAD_LOCAL: ThreadLocalContext = ThreadLocalContext;
#[cfg(feature = "rt-tokio")]
static TASK_LOCAL: TaskLocalContext = TaskLocalContext;

static EXECUTION_CONTEXT: OnceLock<&'static dyn ExecutionContext> = OnceLock::new();

/// Select the process-wide [`ExecutionContext`] strategy.
///
/// Returns `false` when the strategy was already fixed (first caller wins;
/// there is no runtime switching). When never called, the thread-local
/// strategy is used.
pub fn init_execution_context(strategy: ContextStrategy) -> bool {
    let context: &'static dyn ExecutionContext = match strategy {
        ContextStrategy::ThreadLocal => &THREAD_LOCAL,
        #[cfg(feature = "rt-tokio")]
        ContextStrategy::TaskLocal => &TASK_LOCAL,
    };
    EXECUTION_CONTEXT.set(context).is_ok()
}

/// The process-wide strategy, defaulting to thread-local storage.
pub fn execution_context() -> &'static dyn ExecutionContext {
    *EXECUTION_CONTEXT.get_or_init(|| &THREAD_LOCAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SpanId, TraceFlags, TraceId};
    use crate::trace::RandomIdGenerator;
    use crate::traceparent::TraceParent;

    fn transaction() -> Arc<Transaction> {
        let id = SpanId::from(1);
        let tp = TraceParent::new(TraceId::from(1), id, TraceFlags::SAMPLED);
        Arc::new(Transaction::new(
            id,
            "test",
            tp,
            None,
            true,
            Arc::new(RandomIdGenerator::default()),
        ))
    }

    #[test]
    fn thread_local_slot_is_per_thread() {
        let cx = ThreadLocalContext;
        cx.set_transaction(Some(transaction()));
        assert!(cx.transaction().is_some());

        std::thread::spawn(|| {
            assert!(ThreadLocalContext.transaction().is_none());
        })
        .join()
        .unwrap();

        assert!(cx.take_transaction().is_some());
        assert!(cx.transaction().is_none());
    }

    #[test]
    fn take_transaction_clears_span_too() {
        let cx = ThreadLocalContext;
        let tx = transaction();
        cx.set_transaction(Some(tx.clone()));
        let span = tx.begin_span("db", "db.query", None, false, 0, None, None);
        cx.set_span(Some(span));

        assert!(cx.take_transaction().is_some());
        assert!(cx.span().is_none());
    }

    #[cfg(feature = "rt-tokio")]
    #[tokio::test]
    async fn task_local_slots_are_isolated() {
        let first = TaskLocalContext::scope(async {
            TaskLocalContext.set_transaction(Some(transaction()));
            tokio::task::yield_now().await;
            TaskLocalContext.transaction().is_some()
        });
        let second = TaskLocalContext::scope(async {
            tokio::task::yield_now().await;
            TaskLocalContext.transaction().is_none()
        });

        let (first, second) = tokio::join!(first, second);
        assert!(first);
        assert!(second);
    }

    #[cfg(feature = "rt-tokio")]
    #[tokio::test]
    async fn scope_inherit_copies_parent_slot() {
        TaskLocalContext::scope(async {
            TaskLocalContext.set_transaction(Some(transaction()));

            let inherited =
                TaskLocalContext::scope_inherit(
                    async { TaskLocalContext.transaction().is_some() },
                )
                .await;
            assert!(inherited);

            // mutations inside the child scope stay in the child
            TaskLocalContext::scope_inherit(async {
                TaskLocalContext.take_transaction();
            })
            .await;
            assert!(TaskLocalContext.transaction().is_some());
        })
        .await;
    }

    #[cfg(feature = "rt-tokio")]
    #[tokio::test]
    async fn outside_scope_degrades_to_none() {
        let cx = TaskLocalContext;
        cx.set_transaction(Some(transaction()));
        assert!(cx.transaction().is_none());
        assert!(cx.take_transaction().is_none());
    }
}
