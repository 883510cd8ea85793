//! W3C-style trace context values.
//!
//! A [`TraceParent`] is the immutable value carried in the `traceparent`
//! header: version, trace id, parent span id and trace flags, plus the opaque
//! `tracestate` companion header. It is created either by parsing an inbound
//! header or by minting a new root trace, and "updating" it (rebinding to a
//! new span id for an outgoing call) always produces a new value via
//! [`TraceParent::copy_from`].

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::ids::{SpanId, TraceFlags, TraceId};

const SUPPORTED_VERSION: u8 = 0;
const MAX_VERSION: u8 = 254;

/// Length of the fixed-width binary encoding produced by
/// [`TraceParent::to_binary`].
pub const BINARY_TRACEPARENT_LEN: usize = 29;

const BINARY_FIELD_TRACE_ID: u8 = 0x00;
const BINARY_FIELD_SPAN_ID: u8 = 0x01;
const BINARY_FIELD_FLAGS: u8 = 0x02;

/// Error returned when an inbound trace context value is malformed.
///
/// Callers treat any of these as "no incoming trace context" and fall back to
/// minting a new root trace; a malformed header never surfaces to the
/// instrumented application.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TraceParentParseError {
    /// The header did not split into the four `version-traceid-spanid-flags`
    /// fields.
    #[error("traceparent header must have 4 dash-separated fields, got {0}")]
    FieldCount(usize),

    /// The version field was not 2 hex digits, or was the forbidden value 255.
    #[error("traceparent version field is invalid")]
    Version,

    /// The trace id field was not 32 lowercase hex digits, or was all zeroes.
    #[error("traceparent trace-id field is invalid")]
    TraceId,

    /// The span id field was not 16 lowercase hex digits, or was all zeroes.
    #[error("traceparent parent-id field is invalid")]
    SpanId,

    /// The flags field was not 2 hex digits, or set bits undefined for
    /// version 0.
    #[error("traceparent trace-flags field is invalid")]
    TraceFlags,

    /// A tracestate entry was not a `key=value` pair.
    #[error("tracestate entry {0:?} is not a key=value pair")]
    TraceState(String),

    /// A binary traceparent had the wrong length.
    #[error("binary traceparent must be {BINARY_TRACEPARENT_LEN} bytes, got {0}")]
    BinaryLength(usize),

    /// A binary traceparent had an unexpected field marker byte.
    #[error("binary traceparent has an unexpected field marker")]
    BinaryMarker,
}

/// The opaque `tracestate` companion value.
///
/// Vendor-specific `key=value` entries, stored verbatim and passed through to
/// every downstream call. Entries are only checked for the `key=value` shape
/// on parse; semantics and length budgets are the vendors' business, not
/// enforced here.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TraceState(Option<String>);

impl TraceState {
    /// The empty `TraceState`.
    pub const NONE: TraceState = TraceState(None);

    /// Returns `true` if no tracestate was received or set.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The value formatted for the `tracestate` header, empty when unset.
    pub fn header(&self) -> &str {
        self.0.as_deref().unwrap_or("")
    }

    /// Retrieves the value for a given vendor key, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.as_deref().and_then(|raw| {
            raw.split(',').find_map(|entry| {
                let (k, v) = entry.trim().split_once('=')?;
                (k == key).then_some(v)
            })
        })
    }
}

impl FromStr for TraceState {
    type Err = TraceParentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(TraceState::NONE);
        }
        for entry in s.split_terminator(',') {
            if !entry.trim().contains('=') {
                return Err(TraceParentParseError::TraceState(entry.to_string()));
            }
        }
        Ok(TraceState(Some(s.to_string())))
    }
}

impl fmt::Display for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.header())
    }
}

/// Immutable trace context value linking traces across process boundaries.
///
/// The `span_id` field is the *parent* span id from the receiver's
/// perspective: the sender rebinds it to its own current span or transaction
/// id (via [`copy_from`]) before injecting the header into an outgoing call.
///
/// The trace id and version are preserved across every [`copy_from`], so the
/// trace id is constant for the lifetime of a trace.
///
/// [`copy_from`]: TraceParent::copy_from
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TraceParent {
    version: u8,
    trace_id: TraceId,
    span_id: SpanId,
    trace_flags: TraceFlags,
    tracestate: TraceState,
}

impl TraceParent {
    /// Construct a new version-0 `TraceParent` with no tracestate.
    pub fn new(trace_id: TraceId, span_id: SpanId, trace_flags: TraceFlags) -> Self {
        TraceParent {
            version: SUPPORTED_VERSION,
            trace_id,
            span_id,
            trace_flags,
            tracestate: TraceState::NONE,
        }
    }

    /// Returns this value with the given tracestate attached.
    pub fn with_tracestate(mut self, tracestate: TraceState) -> Self {
        self.tracestate = tracestate;
        self
    }

    /// The trace context version.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// The [`TraceId`] shared by every span of this trace.
    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The parent span or transaction id.
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// The trace flags byte.
    pub fn trace_flags(&self) -> TraceFlags {
        self.trace_flags
    }

    /// Returns `true` if the `sampled` trace flag is set.
    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }

    /// A reference to the opaque [`TraceState`].
    pub fn tracestate(&self) -> &TraceState {
        &self.tracestate
    }

    /// Returns a new value sharing version, trace id and tracestate,
    /// overriding the span id and/or flags when given.
    ///
    /// Used every time a child boundary (an outgoing call, a new span) needs
    /// to present itself as the parent to a downstream system.
    pub fn copy_from(
        &self,
        span_id: Option<SpanId>,
        trace_options: Option<TraceFlags>,
    ) -> TraceParent {
        TraceParent {
            version: self.version,
            trace_id: self.trace_id,
            span_id: span_id.unwrap_or(self.span_id),
            trace_flags: trace_options.unwrap_or(self.trace_flags),
            tracestate: self.tracestate.clone(),
        }
    }

    /// Fixed-width binary encoding for transports with raw byte headers
    /// (e.g. Kafka message headers).
    ///
    /// Layout: `{version}{0x00}{trace-id:16}{0x01}{parent-id:8}{0x02}{flags}`,
    /// 29 bytes total. The tracestate is not part of the binary form.
    pub fn to_binary(&self) -> [u8; BINARY_TRACEPARENT_LEN] {
        let mut buf = [0u8; BINARY_TRACEPARENT_LEN];
        buf[0] = self.version;
        buf[1] = BINARY_FIELD_TRACE_ID;
        buf[2..18].copy_from_slice(&self.trace_id.to_bytes());
        buf[18] = BINARY_FIELD_SPAN_ID;
        buf[19..27].copy_from_slice(&self.span_id.to_bytes());
        buf[27] = BINARY_FIELD_FLAGS;
        buf[28] = self.trace_flags.to_u8();
        buf
    }

    /// Decode the binary form produced by [`to_binary`](TraceParent::to_binary).
    pub fn from_binary(bytes: &[u8]) -> Result<TraceParent, TraceParentParseError> {
        if bytes.len() != BINARY_TRACEPARENT_LEN {
            return Err(TraceParentParseError::BinaryLength(bytes.len()));
        }
        if bytes[1] != BINARY_FIELD_TRACE_ID
            || bytes[18] != BINARY_FIELD_SPAN_ID
            || bytes[27] != BINARY_FIELD_FLAGS
        {
            return Err(TraceParentParseError::BinaryMarker);
        }
        let version = bytes[0];
        if version > MAX_VERSION {
            return Err(TraceParentParseError::Version);
        }

        let mut trace_id = [0u8; 16];
        trace_id.copy_from_slice(&bytes[2..18]);
        let trace_id = TraceId::from_bytes(trace_id);
        if trace_id == TraceId::INVALID {
            return Err(TraceParentParseError::TraceId);
        }

        let mut span_id = [0u8; 8];
        span_id.copy_from_slice(&bytes[19..27]);
        let span_id = SpanId::from_bytes(span_id);
        if span_id == SpanId::INVALID {
            return Err(TraceParentParseError::SpanId);
        }

        Ok(TraceParent {
            version,
            trace_id,
            span_id,
            trace_flags: TraceFlags::new(bytes[28]) & TraceFlags::SAMPLED,
            tracestate: TraceState::NONE,
        })
    }
}

fn is_lower_hex(field: &str, len: usize) -> bool {
    field.len() == len
        && field
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

impl FromStr for TraceParent {
    type Err = TraceParentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts = s.trim().split_terminator('-').collect::<Vec<&str>>();
        if parts.len() < 4 {
            return Err(TraceParentParseError::FieldCount(parts.len()));
        }

        if !is_lower_hex(parts[0], 2) {
            return Err(TraceParentParseError::Version);
        }
        let version = u8::from_str_radix(parts[0], 16).map_err(|_| TraceParentParseError::Version)?;
        // Version 255 is forbidden; version 0 must have exactly 4 fields.
        // Higher versions may append fields we do not understand.
        if version > MAX_VERSION || (version == 0 && parts.len() != 4) {
            return Err(TraceParentParseError::Version);
        }

        if !is_lower_hex(parts[1], 32) {
            return Err(TraceParentParseError::TraceId);
        }
        let trace_id =
            TraceId::from_hex(parts[1]).map_err(|_| TraceParentParseError::TraceId)?;
        if trace_id == TraceId::INVALID {
            return Err(TraceParentParseError::TraceId);
        }

        if !is_lower_hex(parts[2], 16) {
            return Err(TraceParentParseError::SpanId);
        }
        let span_id = SpanId::from_hex(parts[2]).map_err(|_| TraceParentParseError::SpanId)?;
        if span_id == SpanId::INVALID {
            return Err(TraceParentParseError::SpanId);
        }

        if !is_lower_hex(parts[3], 2) {
            return Err(TraceParentParseError::TraceFlags);
        }
        let opts =
            u8::from_str_radix(parts[3], 16).map_err(|_| TraceParentParseError::TraceFlags)?;
        // Only the sampled bit is defined for version 0.
        if version == 0 && opts > 2 {
            return Err(TraceParentParseError::TraceFlags);
        }

        Ok(TraceParent {
            version,
            trace_id,
            span_id,
            trace_flags: TraceFlags::new(opts) & TraceFlags::SAMPLED,
            tracestate: TraceState::NONE,
        })
    }
}

impl fmt::Display for TraceParent {
    /// Canonical `00-<32 hex>-<16 hex>-<2 hex>` header form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}-{:032x}-{:016x}-{:02x}",
            SUPPORTED_VERSION,
            self.trace_id,
            self.span_id,
            self.trace_flags & TraceFlags::SAMPLED
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sampled() -> TraceParent {
        TraceParent::new(
            TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736),
            SpanId::from(0x00f0_67aa_0ba9_02b7),
            TraceFlags::SAMPLED,
        )
    }

    #[rustfmt::skip]
    fn valid_header_data() -> Vec<(&'static str, u8, bool)> {
        // header, version, sampled
        vec![
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-00", 0, false),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", 0, true),
            ("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01", 2, true),
            ("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-09", 2, true),
            ("02-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-08", 2, false),
            ("01-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-09-extra", 1, true),
        ]
    }

    #[rustfmt::skip]
    fn invalid_header_data() -> Vec<(&'static str, &'static str)> {
        vec![
            ("",                                                             "empty"),
            ("00",                                                           "too few fields"),
            ("0000-00000000000000000000000000000000-0000000000000000-01",    "wrong version length"),
            ("ff-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",      "forbidden version 255"),
            ("qw-00000000000000000000000000000000-0000000000000000-01",      "bogus version"),
            ("00-ab00000000000000000000000000000000-cd00000000000000-01",    "wrong trace id length"),
            ("00-ab0000000000000000000000000000-cd00000000000000-01",        "short trace id"),
            ("00-qw000000000000000000000000000000-cd00000000000000-01",      "bogus trace id"),
            ("00-AB000000000000000000000000000000-cd00000000000000-01",      "upper case trace id"),
            ("00-00000000000000000000000000000000-cd00000000000000-01",      "zero trace id"),
            ("00-ab000000000000000000000000000000-cd0000000000000000-01",    "wrong span id length"),
            ("00-ab000000000000000000000000000000-CD00000000000000-01",      "upper case span id"),
            ("00-ab000000000000000000000000000000-0000000000000000-01",      "zero span id"),
            ("00-ab000000000000000000000000000000-cd00000000000000-0100",    "wrong flags length"),
            ("00-ab000000000000000000000000000000-cd00000000000000-qw",      "bogus flags"),
            ("00-ab000000000000000000000000000000-cd00000000000000-A1",      "upper case flags"),
            ("00-ab000000000000000000000000000000-cd00000000000000-09",      "undefined flag bits for version 0"),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7",         "missing flags"),
            ("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01-x",    "extra field for version 0"),
        ]
    }

    #[test]
    fn parse_valid_headers() {
        for (header, version, is_sampled) in valid_header_data() {
            let tp: TraceParent = header.parse().unwrap_or_else(|e| panic!("{header}: {e}"));
            assert_eq!(tp.version(), version, "{header}");
            assert_eq!(tp.is_sampled(), is_sampled, "{header}");
            assert_eq!(
                tp.trace_id(),
                TraceId::from(0x4bf9_2f35_77b3_4da6_a3ce_929d_0e0e_4736)
            );
            assert_eq!(tp.span_id(), SpanId::from(0x00f0_67aa_0ba9_02b7));
        }
    }

    #[test]
    fn parse_rejects_invalid_headers() {
        for (header, reason) in invalid_header_data() {
            assert!(header.parse::<TraceParent>().is_err(), "{reason}");
        }
    }

    #[test]
    fn string_round_trip() {
        for (header, _, _) in valid_header_data() {
            let tp: TraceParent = header.parse().unwrap();
            if tp.version() == 0 {
                assert_eq!(tp.to_string(), header);
            }
            // Re-parsing the canonical form always reproduces ids and flags.
            let reparsed: TraceParent = tp.to_string().parse().unwrap();
            assert_eq!(reparsed.trace_id(), tp.trace_id());
            assert_eq!(reparsed.span_id(), tp.span_id());
            assert_eq!(reparsed.is_sampled(), tp.is_sampled());
        }
    }

    #[test]
    fn binary_round_trip() {
        let tp = sampled().with_tracestate("es=s:1".parse().unwrap());
        let bytes = tp.to_binary();
        assert_eq!(bytes.len(), BINARY_TRACEPARENT_LEN);

        let decoded = TraceParent::from_binary(&bytes).unwrap();
        assert_eq!(decoded.trace_id(), tp.trace_id());
        assert_eq!(decoded.span_id(), tp.span_id());
        assert_eq!(decoded.trace_flags(), tp.trace_flags());
        // tracestate never travels in the binary form
        assert!(decoded.tracestate().is_empty());
    }

    #[test]
    fn binary_rejects_malformed_input() {
        assert_eq!(
            TraceParent::from_binary(&[0u8; 12]),
            Err(TraceParentParseError::BinaryLength(12))
        );

        let mut bytes = sampled().to_binary();
        bytes[18] = 0x07;
        assert_eq!(
            TraceParent::from_binary(&bytes),
            Err(TraceParentParseError::BinaryMarker)
        );

        let zero_trace = TraceParent::from_binary(&{
            let mut b = sampled().to_binary();
            b[2..18].fill(0);
            b
        });
        assert_eq!(zero_trace, Err(TraceParentParseError::TraceId));
    }

    #[test]
    fn copy_from_preserves_trace_identity() {
        let tp = sampled().with_tracestate("foo=bar".parse().unwrap());
        let child = tp.copy_from(Some(SpanId::from(0xdead_beef)), None);

        assert_eq!(child.trace_id(), tp.trace_id());
        assert_eq!(child.version(), tp.version());
        assert_eq!(child.tracestate(), tp.tracestate());
        assert_eq!(child.span_id(), SpanId::from(0xdead_beef));
        assert!(child.is_sampled());

        let unsampled = child.copy_from(None, Some(child.trace_flags().with_sampled(false)));
        assert_eq!(unsampled.span_id(), child.span_id());
        assert!(!unsampled.is_sampled());
    }

    #[test]
    fn tracestate_passthrough() {
        let ts: TraceState = "foo=bar,vendor=a:b".parse().unwrap();
        assert_eq!(ts.header(), "foo=bar,vendor=a:b");
        assert_eq!(ts.get("vendor"), Some("a:b"));
        assert_eq!(ts.get("missing"), None);

        assert!("not-a-pair".parse::<TraceState>().is_err());
        assert!("".parse::<TraceState>().unwrap().is_empty());
    }
}
