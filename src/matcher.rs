use std::sync::OnceLock;

use anyhow::{Context, Result};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Where a milestone's duration comes from.
///
/// Some tools print their own "time to ready" measured from an internal
/// clock; others only print a bare milestone line, leaving the host to time
/// the interval from process spawn. The two are not equivalent (self-reported
/// figures skip process-spawn and module-resolution warm-up), so the choice
/// is explicit per-tool configuration, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DurationSource {
    /// Elapsed wall-clock on the harness side.
    HostClock,
    /// Figure captured from the tool's own output.
    SelfReport,
}

impl Default for DurationSource {
    fn default() -> Self {
        DurationSource::HostClock
    }
}

impl std::fmt::Display for DurationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DurationSource::HostClock => write!(f, "host-clock"),
            DurationSource::SelfReport => write!(f, "self-report"),
        }
    }
}

/// Serializable description of one output milestone.
///
/// Capture-group contract: group 1 (if present) is the numeric duration,
/// group 2 (if present) is the unit suffix (`s` or `ms`). An absent or
/// unrecognized unit is treated as milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSpec {
    pub pattern: String,
    /// Tried against each chunk when the primary pattern misses; used for
    /// tools whose log wording changed between versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_pattern: Option<String>,
    #[serde(default)]
    pub source: DurationSource,
}

impl SignalSpec {
    pub fn host_clock(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            alt_pattern: None,
            source: DurationSource::HostClock,
        }
    }

    pub fn self_report(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            alt_pattern: None,
            source: DurationSource::SelfReport,
        }
    }

    pub fn with_alt(mut self, pattern: impl Into<String>) -> Self {
        self.alt_pattern = Some(pattern.into());
        self
    }
}

/// Result of a successful scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchedSignal {
    /// Captured duration normalized to milliseconds, when the pattern
    /// carried a capture group.
    pub self_reported_ms: Option<u64>,
}

/// Compiled form of a [`SignalSpec`], applied chunk-by-chunk to decoded
/// subprocess output.
pub struct SignalMatcher {
    primary: Regex,
    alt: Option<Regex>,
    source: DurationSource,
}

impl SignalMatcher {
    pub fn compile(spec: &SignalSpec) -> Result<Self> {
        let primary = Regex::new(&spec.pattern)
            .with_context(|| format!("invalid signal pattern `{}`", spec.pattern))?;
        let alt = spec
            .alt_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern)
                    .with_context(|| format!("invalid secondary signal pattern `{pattern}`"))
            })
            .transpose()?;
        Ok(Self {
            primary,
            alt,
            source: spec.source,
        })
    }

    pub fn source(&self) -> DurationSource {
        self.source
    }

    /// Scan a decoded chunk of output. Returns the first match from the
    /// primary pattern, falling back to the secondary pattern.
    pub fn scan(&self, text: &str) -> Option<MatchedSignal> {
        let captures = self
            .primary
            .captures(text)
            .or_else(|| self.alt.as_ref().and_then(|alt| alt.captures(text)))?;

        let value = captures
            .get(1)
            .and_then(|group| group.as_str().trim().parse::<f64>().ok());
        let unit = captures.get(2).map(|group| group.as_str());
        Some(MatchedSignal {
            self_reported_ms: value.map(|value| normalize_to_ms(value, unit)),
        })
    }
}

/// Convert a captured figure to canonical milliseconds. An unrecognized or
/// missing unit is treated as milliseconds, the safe default.
pub fn normalize_to_ms(value: f64, unit: Option<&str>) -> u64 {
    let ms = match unit.map(str::trim) {
        Some("s") => value * 1000.0,
        _ => value,
    };
    ms.round().max(0.0) as u64
}

/// Strip ANSI escape sequences and normalize carriage returns so progress
/// spinners and colored output cannot hide a milestone from the patterns.
pub fn sanitize_chunk(raw: &[u8]) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    let ansi = ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("ansi pattern"));

    let decoded = String::from_utf8_lossy(raw);
    let stripped = ansi.replace_all(&decoded, "");
    stripped.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_suffix_scales_to_milliseconds() {
        assert_eq!(normalize_to_ms(2.5, Some("s")), 2500);
    }

    #[test]
    fn millisecond_suffix_passes_through() {
        assert_eq!(normalize_to_ms(450.0, Some("ms")), 450);
    }

    #[test]
    fn missing_unit_defaults_to_milliseconds() {
        assert_eq!(normalize_to_ms(120.0, None), 120);
        assert_eq!(normalize_to_ms(120.0, Some("furlongs")), 120);
    }

    #[test]
    fn scan_extracts_value_and_unit() {
        let spec = SignalSpec::self_report(r"ready in ([\d.]+)\s*(m?s)");
        let matcher = SignalMatcher::compile(&spec).unwrap();

        let matched = matcher.scan("  VITE v4.4.2  ready in 322 ms").unwrap();
        assert_eq!(matched.self_reported_ms, Some(322));

        let matched = matcher.scan("ready in 1.2s").unwrap();
        assert_eq!(matched.self_reported_ms, Some(1200));
    }

    #[test]
    fn scan_without_capture_yields_no_figure() {
        let spec = SignalSpec::host_clock("started server on");
        let matcher = SignalMatcher::compile(&spec).unwrap();
        let matched = matcher.scan("ready - started server on 0.0.0.0:3000").unwrap();
        assert_eq!(matched.self_reported_ms, None);
    }

    #[test]
    fn secondary_pattern_is_tried_after_primary() {
        let spec =
            SignalSpec::host_clock("started server on").with_alt(r"Ready in ([\d.]+)(m?s)");
        let matcher = SignalMatcher::compile(&spec).unwrap();
        let matched = matcher.scan("- Ready in 748ms").unwrap();
        assert_eq!(matched.self_reported_ms, Some(748));
    }

    #[test]
    fn sanitize_removes_ansi_and_carriage_returns() {
        let raw = b"\x1b[32mcompiled\x1b[0m in 12 ms\r\nnext\rline";
        assert_eq!(sanitize_chunk(raw), "compiled in 12 ms\nnext\nline");
    }
}
