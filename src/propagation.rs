//! Wire propagation of trace context.
//!
//! Adapters hand carriers (header maps, message metadata) to this module
//! through the [`Injector`] and [`Extractor`] traits; the module reads and
//! writes the `traceparent` and `tracestate` headers. A malformed inbound
//! header is treated as "no trace context" — the tracer then mints a new root
//! trace — and is never surfaced to the instrumented application.

use std::collections::HashMap;
use std::str::FromStr;

use crate::traceparent::{TraceParent, TraceState};

/// The canonical trace context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// The companion vendor-state header.
pub const TRACESTATE_HEADER: &str = "tracestate";
/// Alternate header name kept for backward compatibility with older agents.
///
/// Written only when [`Config::use_legacy_header`] is set; always consulted
/// as a fallback on extraction.
///
/// [`Config::use_legacy_header`]: crate::trace::Config::use_legacy_header
pub const TRACEPARENT_LEGACY_HEADER: &str = "x-apm-traceparent";

/// Injector provides an interface for adding fields to an outbound carrier
/// such as a header map.
pub trait Injector {
    /// Add a key and value to the underlying data.
    fn set(&mut self, key: &str, value: String);
}

/// Extractor provides an interface for reading fields from an inbound carrier
/// such as a header map.
pub trait Extractor {
    /// Get a value for a key from the underlying data.
    fn get(&self, key: &str) -> Option<&str>;

    /// Collect all the keys from the underlying data.
    fn keys(&self) -> Vec<&str>;
}

impl<S: std::hash::BuildHasher> Injector for HashMap<String, String, S> {
    /// Set a key and value in the HashMap.
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_lowercase(), value);
    }
}

impl<S: std::hash::BuildHasher> Extractor for HashMap<String, String, S> {
    /// Get a value for a key from the HashMap.
    fn get(&self, key: &str) -> Option<&str> {
        self.get(&key.to_lowercase()).map(|v| v.as_str())
    }

    /// Collect all the keys from the HashMap.
    fn keys(&self) -> Vec<&str> {
        self.keys().map(|k| k.as_str()).collect::<Vec<_>>()
    }
}

/// Encode `trace_parent` into the carrier under the canonical headers.
///
/// When `use_legacy_header` is set, the same `traceparent` value is
/// duplicated under [`TRACEPARENT_LEGACY_HEADER`] so older collectors on the
/// receiving side still see it.
pub fn inject_trace_parent(
    trace_parent: &TraceParent,
    injector: &mut dyn Injector,
    use_legacy_header: bool,
) {
    let header_value = trace_parent.to_string();
    if use_legacy_header {
        injector.set(TRACEPARENT_LEGACY_HEADER, header_value.clone());
    }
    injector.set(TRACEPARENT_HEADER, header_value);
    injector.set(
        TRACESTATE_HEADER,
        trace_parent.tracestate().header().to_string(),
    );
}

/// Decode a [`TraceParent`] from the carrier, if one is present and valid.
///
/// Reads [`TRACEPARENT_HEADER`], falling back to the legacy name, and
/// attaches the `tracestate` header when it parses; an invalid tracestate
/// degrades to empty without invalidating the traceparent.
pub fn extract_trace_parent(extractor: &dyn Extractor) -> Option<TraceParent> {
    let header_value = extractor
        .get(TRACEPARENT_HEADER)
        .or_else(|| extractor.get(TRACEPARENT_LEGACY_HEADER))?;

    let trace_parent = match TraceParent::from_str(header_value) {
        Ok(tp) => tp,
        Err(error) => {
            apm_debug!(
                name: "propagation.invalid_traceparent",
                error = format!("{error}")
            );
            return None;
        }
    };

    let tracestate = extractor
        .get(TRACESTATE_HEADER)
        .and_then(|raw| TraceState::from_str(raw).ok())
        .unwrap_or_default();

    Some(trace_parent.with_tracestate(tracestate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SpanId, TraceFlags, TraceId};

    const VALID_HEADER: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn trace_parent() -> TraceParent {
        TraceParent::new(
            TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736),
            SpanId::from(0x00f0_67aa_0ba9_02b7),
            TraceFlags::SAMPLED,
        )
    }

    #[test]
    fn inject_canonical_headers() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        let tp = trace_parent().with_tracestate("foo=bar".parse().unwrap());

        inject_trace_parent(&tp, &mut carrier, false);

        assert_eq!(Extractor::get(&carrier, TRACEPARENT_HEADER), Some(VALID_HEADER));
        assert_eq!(Extractor::get(&carrier, TRACESTATE_HEADER), Some("foo=bar"));
        assert_eq!(Extractor::get(&carrier, TRACEPARENT_LEGACY_HEADER), None);
    }

    #[test]
    fn inject_duplicates_legacy_header_when_enabled() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        inject_trace_parent(&trace_parent(), &mut carrier, true);

        assert_eq!(
            Extractor::get(&carrier, TRACEPARENT_HEADER),
            Extractor::get(&carrier, TRACEPARENT_LEGACY_HEADER)
        );
    }

    #[test]
    fn extract_round_trip() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        let tp = trace_parent().with_tracestate("es=s:1,foo=bar".parse().unwrap());
        inject_trace_parent(&tp, &mut carrier, false);

        let extracted = extract_trace_parent(&carrier).unwrap();
        assert_eq!(extracted, tp);
    }

    #[test]
    fn extract_falls_back_to_legacy_header() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        carrier.set(TRACEPARENT_LEGACY_HEADER, VALID_HEADER.to_string());

        let extracted = extract_trace_parent(&carrier).unwrap();
        assert_eq!(extracted.span_id(), SpanId::from(0x00f0_67aa_0ba9_02b7));
        assert!(extracted.is_sampled());
    }

    #[test]
    fn extract_treats_malformed_header_as_absent() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        carrier.set(TRACEPARENT_HEADER, "not-a-traceparent".to_string());
        assert_eq!(extract_trace_parent(&carrier), None);

        assert_eq!(extract_trace_parent(&HashMap::new()), None);
    }

    #[test]
    fn extract_degrades_invalid_tracestate_to_empty() {
        let mut carrier: HashMap<String, String> = HashMap::new();
        carrier.set(TRACEPARENT_HEADER, VALID_HEADER.to_string());
        carrier.set(TRACESTATE_HEADER, "malformed entry".to_string());

        let extracted = extract_trace_parent(&carrier).unwrap();
        assert!(extracted.tracestate().is_empty());
    }
}
