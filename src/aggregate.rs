use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Recognized metric keys for one tool in one repetition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Metric {
    ServerStartTime,
    OnLoadTime,
    /// serverStartTime + onLoadTime.
    Startup,
    RootHmr,
    LeafHmr,
    BuildTime,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::ServerStartTime,
        Metric::OnLoadTime,
        Metric::Startup,
        Metric::RootHmr,
        Metric::LeafHmr,
        Metric::BuildTime,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Metric::ServerStartTime => "serverStartTime",
            Metric::OnLoadTime => "onLoadTime",
            Metric::Startup => "startup",
            Metric::RootHmr => "rootHmr",
            Metric::LeafHmr => "leafHmr",
            Metric::BuildTime => "buildTime",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Metrics recorded for one tool during one repetition. Frozen once the
/// repetition's measurement phase ends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResult {
    metrics: BTreeMap<Metric, u64>,
}

impl RunResult {
    pub fn record(&mut self, metric: Metric, duration_ms: u64) {
        self.metrics.insert(metric, duration_ms);
    }

    pub fn get(&self, metric: Metric) -> Option<u64> {
        self.metrics.get(&metric).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, u64)> + '_ {
        self.metrics.iter().map(|(metric, value)| (*metric, *value))
    }
}

/// Outcome of one tool in one repetition: whatever metrics were captured
/// before a failure (if any) plus the failure itself. Failures stay isolated
/// here instead of aborting the whole run.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub repetition: u32,
    pub metrics: RunResult,
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Mean duration per metric per tool, plus the failures that occurred.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub runs: u32,
    pub tools: BTreeMap<String, BTreeMap<Metric, f64>>,
    pub failures: Vec<RunFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub tool: String,
    pub repetition: u32,
    pub error: String,
}

impl AggregateResult {
    /// True when no repetition of any tool produced a single metric.
    pub fn all_failed(&self) -> bool {
        self.tools.values().all(|metrics| metrics.is_empty())
    }
}

#[derive(Default)]
struct MetricAccumulator {
    sum: f64,
    count: u32,
}

/// Folds per-repetition results into per-tool means.
///
/// Divisor policy: each metric's mean divides by the number of repetitions
/// that actually reported it, not the total repetition count. A tool that
/// failed to report a metric in some repetitions therefore shows an honest
/// average of the runs it completed rather than an under-counted one.
pub struct Aggregator {
    runs: u32,
    totals: BTreeMap<String, BTreeMap<Metric, MetricAccumulator>>,
    failures: Vec<RunFailure>,
}

impl Aggregator {
    pub fn new(runs: u32) -> Self {
        Self {
            runs,
            totals: BTreeMap::new(),
            failures: Vec::new(),
        }
    }

    pub fn push(&mut self, outcome: ToolOutcome) {
        let per_tool = self.totals.entry(outcome.tool.clone()).or_default();
        for (metric, value) in outcome.metrics.iter() {
            let accumulator = per_tool.entry(metric).or_default();
            accumulator.sum += value as f64;
            accumulator.count += 1;
        }
        if let Some(error) = outcome.error {
            self.failures.push(RunFailure {
                tool: outcome.tool,
                repetition: outcome.repetition,
                error,
            });
        }
    }

    pub fn finish(self) -> AggregateResult {
        let tools = self
            .totals
            .into_iter()
            .map(|(tool, metrics)| {
                let means = metrics
                    .into_iter()
                    .filter(|(_, accumulator)| accumulator.count > 0)
                    .map(|(metric, accumulator)| {
                        (metric, accumulator.sum / accumulator.count as f64)
                    })
                    .collect();
                (tool, means)
            })
            .collect();

        AggregateResult {
            runs: self.runs,
            tools,
            failures: self.failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(tool: &str, repetition: u32, metrics: &[(Metric, u64)]) -> ToolOutcome {
        let mut result = RunResult::default();
        for (metric, value) in metrics {
            result.record(*metric, *value);
        }
        ToolOutcome {
            tool: tool.into(),
            repetition,
            metrics: result,
            error: None,
        }
    }

    #[test]
    fn mean_divides_by_reporting_repetitions_not_total() {
        // Three repetitions, but buildTime reported only twice: the mean
        // must be (100 + 200) / 2, not / 3.
        let mut aggregator = Aggregator::new(3);
        aggregator.push(outcome("vite", 1, &[(Metric::BuildTime, 100)]));
        aggregator.push(outcome("vite", 2, &[(Metric::BuildTime, 200)]));
        aggregator.push(outcome("vite", 3, &[(Metric::ServerStartTime, 50)]));

        let aggregate = aggregator.finish();
        let vite = &aggregate.tools["vite"];
        assert_eq!(vite[&Metric::BuildTime], 150.0);
        assert_eq!(vite[&Metric::ServerStartTime], 50.0);
    }

    #[test]
    fn mean_over_all_repetitions_matches_arithmetic_mean() {
        let mut aggregator = Aggregator::new(2);
        aggregator.push(outcome("rspack", 1, &[(Metric::RootHmr, 30)]));
        aggregator.push(outcome("rspack", 2, &[(Metric::RootHmr, 50)]));

        let aggregate = aggregator.finish();
        assert_eq!(aggregate.tools["rspack"][&Metric::RootHmr], 40.0);
        assert_eq!(aggregate.runs, 2);
    }

    #[test]
    fn failures_are_recorded_without_discarding_partial_metrics() {
        let mut aggregator = Aggregator::new(1);
        let mut partial = outcome("webpack", 1, &[(Metric::ServerStartTime, 900)]);
        partial.error = Some("navigation timed out".into());
        aggregator.push(partial);

        let aggregate = aggregator.finish();
        assert_eq!(aggregate.tools["webpack"][&Metric::ServerStartTime], 900.0);
        assert_eq!(aggregate.failures.len(), 1);
        assert_eq!(aggregate.failures[0].tool, "webpack");
        assert!(!aggregate.all_failed());
    }

    #[test]
    fn all_failed_when_no_metrics_survive() {
        let mut aggregator = Aggregator::new(1);
        let mut failed = outcome("farm", 1, &[]);
        failed.error = Some("exit code 1".into());
        aggregator.push(failed);

        let aggregate = aggregator.finish();
        assert!(aggregate.all_failed());
    }

    #[test]
    fn metric_keys_serialize_to_camel_case() {
        assert_eq!(
            serde_json::to_string(&Metric::ServerStartTime).unwrap(),
            "\"serverStartTime\""
        );
        assert_eq!(Metric::LeafHmr.key(), "leafHmr");
    }
}
