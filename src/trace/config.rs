//! Tracer configuration.
//!
//! Configuration is an immutable snapshot: [`ConfigBuilder::build`] runs a
//! single validation pass and returns either a valid [`Config`] or a
//! structured list of field-identified errors. Nothing is validated lazily,
//! so a bad sample rate or ignore pattern is caught when the configuration is
//! applied, never in the middle of a trace.
//!
//! Duration and size tunables accept the unit-suffixed string forms used by
//! external configuration sources (`ms`/`s`/`m` for durations, `b`/`kb`/`mb`/
//! `gb` for sizes); see [`parse_duration`] and [`parse_size`].

use std::time::Duration;

use regex::Regex;
use thiserror::Error;

/// Default limit on spans recorded per transaction.
pub const DEFAULT_MAX_SPANS: u32 = 500;
/// Default minimum span duration for keeping captured stack frames.
pub const DEFAULT_SPAN_FRAMES_MIN_DURATION: Duration = Duration::from_millis(5);

/// A single field-identified configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ConfigError {
    /// Name of the offending configuration field.
    pub field: &'static str,
    /// Human-readable description of what was wrong with the value.
    pub message: String,
}

/// All errors found by a configuration validation pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid tracer configuration: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
pub struct ConfigErrors(Vec<ConfigError>);

impl ConfigErrors {
    /// The individual field errors.
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }
}

/// Immutable tracer configuration snapshot.
///
/// The tracer holds the live snapshot behind a single lock and updates it by
/// whole-object replacement; individual fields never change in place.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Fraction of root transactions that get sampled, `0.0..=1.0`. A rate
    /// of `1.0` always samples; `0.0` never does.
    pub sample_rate: f64,

    /// Maximum number of spans recorded per transaction; further spans are
    /// dropped and counted. `0` means unlimited.
    pub max_spans: u32,

    /// Transactions whose final name matches any of these patterns are
    /// finalized but never enqueued for export.
    pub ignore_patterns: Vec<Regex>,

    /// Spans shorter than this discard their captured stack frames at end.
    /// `None` means no threshold: frames are kept for every span.
    pub span_frames_min_duration: Option<Duration>,

    /// Whether to capture a stack at span start at all.
    pub capture_span_frames: bool,

    /// Duplicate the outbound `traceparent` header under the legacy name.
    pub use_legacy_header: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            sample_rate: 1.0,
            max_spans: DEFAULT_MAX_SPANS,
            ignore_patterns: Vec::new(),
            span_frames_min_duration: Some(DEFAULT_SPAN_FRAMES_MIN_DURATION),
            capture_span_frames: true,
            use_legacy_header: false,
        }
    }
}

impl Config {
    /// Start building a configuration snapshot.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for [`Config`], collecting raw values for a single validation
/// pass in [`build`](ConfigBuilder::build).
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    sample_rate: f64,
    max_spans: u32,
    ignore_patterns: Vec<String>,
    span_frames_min_duration: Option<String>,
    capture_span_frames: bool,
    use_legacy_header: bool,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        ConfigBuilder {
            sample_rate: 1.0,
            max_spans: DEFAULT_MAX_SPANS,
            ignore_patterns: Vec::new(),
            span_frames_min_duration: None,
            capture_span_frames: true,
            use_legacy_header: false,
        }
    }
}

impl ConfigBuilder {
    /// Fraction of root transactions to sample, `0.0..=1.0`.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Span budget per transaction, `0` for unlimited.
    pub fn with_max_spans(mut self, max_spans: u32) -> Self {
        self.max_spans = max_spans;
        self
    }

    /// Add a regex pattern for transaction names that should not be exported.
    pub fn with_ignore_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.ignore_patterns.push(pattern.into());
        self
    }

    /// Minimum span duration for keeping stack frames, as a unit-suffixed
    /// string (`"5ms"`, `"1s"`). A negative value (`"-1ms"`) disables the
    /// threshold so frames are kept for every span.
    pub fn with_span_frames_min_duration(mut self, duration: impl Into<String>) -> Self {
        self.span_frames_min_duration = Some(duration.into());
        self
    }

    /// Whether to capture stack frames at span start.
    pub fn with_capture_span_frames(mut self, capture: bool) -> Self {
        self.capture_span_frames = capture;
        self
    }

    /// Duplicate the outbound `traceparent` header under the legacy name.
    pub fn with_legacy_header(mut self, use_legacy_header: bool) -> Self {
        self.use_legacy_header = use_legacy_header;
        self
    }

    /// Validate all fields and produce the immutable snapshot.
    ///
    /// Every invalid field is reported, not just the first one found.
    pub fn build(self) -> Result<Config, ConfigErrors> {
        let mut errors = Vec::new();

        if !(0.0..=1.0).contains(&self.sample_rate) {
            errors.push(ConfigError {
                field: "sample_rate",
                message: format!("must be between 0.0 and 1.0, got {}", self.sample_rate),
            });
        }

        let mut ignore_patterns = Vec::with_capacity(self.ignore_patterns.len());
        for pattern in &self.ignore_patterns {
            match Regex::new(pattern) {
                Ok(regex) => ignore_patterns.push(regex),
                Err(err) => errors.push(ConfigError {
                    field: "ignore_patterns",
                    message: format!("{pattern:?} is not a valid pattern: {err}"),
                }),
            }
        }

        let span_frames_min_duration = match self.span_frames_min_duration.as_deref() {
            None => Some(DEFAULT_SPAN_FRAMES_MIN_DURATION),
            Some(raw) => {
                if let Some(stripped) = raw.strip_prefix('-') {
                    // negative duration = threshold disabled, keep all frames
                    match parse_duration(stripped) {
                        Ok(_) => None,
                        Err(message) => {
                            errors.push(ConfigError {
                                field: "span_frames_min_duration",
                                message,
                            });
                            None
                        }
                    }
                } else {
                    match parse_duration(raw) {
                        Ok(duration) => Some(duration),
                        Err(message) => {
                            errors.push(ConfigError {
                                field: "span_frames_min_duration",
                                message,
                            });
                            None
                        }
                    }
                }
            }
        };

        if !errors.is_empty() {
            return Err(ConfigErrors(errors));
        }

        Ok(Config {
            sample_rate: self.sample_rate,
            max_spans: self.max_spans,
            ignore_patterns,
            span_frames_min_duration,
            capture_span_frames: self.capture_span_frames,
            use_legacy_header: self.use_legacy_header,
        })
    }
}

/// Parse a duration string with a `ms`, `s` or `m` unit suffix.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let (number, multiplier_ms) = if let Some(number) = value.strip_suffix("ms") {
        (number, 1u64)
    } else if let Some(number) = value.strip_suffix('s') {
        (number, 1_000)
    } else if let Some(number) = value.strip_suffix('m') {
        (number, 60_000)
    } else {
        return Err(format!(
            "{value:?} has no duration unit, expected one of ms, s, m"
        ));
    };

    number
        .trim()
        .parse::<u64>()
        .map(|n| Duration::from_millis(n * multiplier_ms))
        .map_err(|_| format!("{value:?} is not a valid duration"))
}

/// Parse a size string with a `b`, `kb`, `mb` or `gb` unit suffix into bytes.
pub fn parse_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    let lower = value.to_ascii_lowercase();
    let (number, multiplier) = if let Some(number) = lower.strip_suffix("kb") {
        (number.to_string(), 1024u64)
    } else if let Some(number) = lower.strip_suffix("mb") {
        (number.to_string(), 1024 * 1024)
    } else if let Some(number) = lower.strip_suffix("gb") {
        (number.to_string(), 1024 * 1024 * 1024)
    } else if let Some(number) = lower.strip_suffix('b') {
        (number.to_string(), 1)
    } else {
        return Err(format!(
            "{value:?} has no size unit, expected one of b, kb, mb, gb"
        ));
    };

    number
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("{value:?} is not a valid size"))
}
