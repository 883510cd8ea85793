//! # APM tracing core
//!
//! An in-process distributed tracing core for application performance
//! monitoring. It records each handled request, job or message as a
//! [`Transaction`](trace::Transaction) with nested
//! [`Span`](trace::Span)s, decides which transactions to sample, bounds how
//! many spans a single transaction may record, and hands finished entities
//! to an export queue. Trace identity crosses process boundaries through the
//! W3C `traceparent`/`tracestate` headers.
//!
//! ## Getting started
//!
//! ```
//! use apm_tracing::trace::Tracer;
//!
//! let tracer = Tracer::builder().build();
//!
//! tracer.begin_transaction("request", None);
//! {
//!     let _span = tracer.capture_span("SELECT FROM users", "db.query", None, false);
//!     // ... run the query ...
//! }
//! let transaction = tracer.end_transaction(Some("GET /users"), Some("HTTP 2xx"));
//! # assert!(transaction.is_ok());
//! ```
//!
//! ## Crate Feature Flags
//!
//! * `internal-logs` (default): report internal faults through the
//!   [`tracing`](https://crates.io/crates/tracing) crate.
//! * `rt-tokio` (default): task-local execution context for tokio
//!   applications ([`context::TaskLocalContext`]).
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![cfg_attr(test, deny(warnings))]

#[macro_use]
mod internal_logging;

mod error;
mod ids;
mod traceparent;

pub mod context;
pub mod propagation;
pub mod trace;

pub use error::{TraceError, TraceResult};
pub use ids::{SpanId, TraceFlags, TraceId};
pub use traceparent::{TraceParent, TraceParentParseError, TraceState, BINARY_TRACEPARENT_LEN};

#[cfg(feature = "internal-logs")]
#[doc(hidden)]
pub mod _private {
    pub use tracing::{debug, error, warn};
}
