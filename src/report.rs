use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::aggregate::{AggregateResult, Metric};
use crate::probe::BrowserProbe;

/// Render the aggregated means as an aligned console table.
pub fn render_table(aggregate: &AggregateResult) -> String {
    let mut tool_width = "tool".len();
    for tool in aggregate.tools.keys() {
        tool_width = tool_width.max(tool.len());
    }

    let mut widths: Vec<usize> = Metric::ALL.iter().map(|metric| metric.key().len()).collect();
    for metrics in aggregate.tools.values() {
        for (index, metric) in Metric::ALL.iter().enumerate() {
            if let Some(mean) = metrics.get(metric) {
                widths[index] = widths[index].max(format_mean(*mean).len());
            }
        }
    }

    let mut out = String::new();
    out.push_str(&format!("{:<tool_width$}", "tool"));
    for (index, metric) in Metric::ALL.iter().enumerate() {
        out.push_str(&format!("  {:>width$}", metric.key(), width = widths[index]));
    }
    out.push('\n');

    for (tool, metrics) in &aggregate.tools {
        out.push_str(&format!("{tool:<tool_width$}"));
        for (index, metric) in Metric::ALL.iter().enumerate() {
            let cell = metrics
                .get(metric)
                .map(|mean| format_mean(*mean))
                .unwrap_or_else(|| "-".into());
            out.push_str(&format!("  {cell:>width$}", width = widths[index]));
        }
        out.push('\n');
    }

    if !aggregate.failures.is_empty() {
        out.push('\n');
        for failure in &aggregate.failures {
            out.push_str(&format!(
                "failed: {} (repetition {}): {}\n",
                failure.tool, failure.repetition, failure.error
            ));
        }
    }
    out
}

fn format_mean(mean: f64) -> String {
    format!("{mean:.1}ms")
}

/// Persist the aggregate as a timestamped JSON file in the output directory.
pub fn write_json(aggregate: &AggregateResult, output_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(output_dir).with_context(|| {
        format!("Failed to create output directory {}", output_dir.display())
    })?;
    let timestamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let path = output_dir.join(format!("results-{timestamp}.json"));
    let serialised = serde_json::to_string_pretty(aggregate)?;
    fs::write(&path, serialised)
        .with_context(|| format!("Failed to write results to {}", path.display()))?;
    info!(path = %path.display(), "results written");
    Ok(path)
}

/// Bar-chart page handed to a disposable headless tab. The charting library
/// is an external collaborator loaded from a CDN; the harness only hands it
/// the tool → metric → mean mapping.
pub fn chart_html(aggregate: &AggregateResult) -> Result<String> {
    let data = serde_json::to_string(&aggregate.tools)?;
    Ok(format!(
        r#"<!DOCTYPE html>
<html lang="en">
  <head>
    <meta charset="UTF-8" />
    <title>Benchmark Chart</title>
    <script src="https://cdn.jsdelivr.net/npm/chart.js@3.0.0/dist/chart.min.js"></script>
  </head>
  <body>
    <canvas id="chart" width="800" height="500"></canvas>
    <script>
      const benchmarkData = {data};
      const metrics = ["startup", "buildTime", "rootHmr", "leafHmr"];
      function randomColor() {{
        return "rgba(" + Math.round(Math.random() * 255) + "," +
          Math.round(Math.random() * 255) + "," +
          Math.round(Math.random() * 255) + ",0.8)";
      }}
      new Chart(document.getElementById("chart").getContext("2d"), {{
        type: "bar",
        data: {{
          labels: Object.keys(benchmarkData),
          datasets: metrics.map((metric) => ({{
            label: metric,
            data: Object.values(benchmarkData).map((item) => item[metric]),
            backgroundColor: randomColor(),
          }})),
        }},
        options: {{
          responsive: false,
          plugins: {{ legend: {{ position: "top" }} }},
        }},
      }});
    </script>
  </body>
</html>
"#
    ))
}

/// Rasterize the chart through the shared browser and write `chart.png`.
/// Chart failures are reported to the caller but are never fatal to a run.
pub fn write_chart(
    probe: &BrowserProbe,
    aggregate: &AggregateResult,
    output_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(output_dir).with_context(|| {
        format!("Failed to create output directory {}", output_dir.display())
    })?;
    let html = chart_html(aggregate)?;
    let image = probe.capture_html(&html, Duration::from_millis(500))?;
    let path = output_dir.join("chart.png");
    fs::write(&path, image)
        .with_context(|| format!("Failed to write chart to {}", path.display()))?;
    info!(path = %path.display(), "chart written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Aggregator, Metric, RunResult, ToolOutcome};

    fn sample_aggregate() -> AggregateResult {
        let mut aggregator = Aggregator::new(1);
        let mut metrics = RunResult::default();
        metrics.record(Metric::ServerStartTime, 120);
        metrics.record(Metric::OnLoadTime, 80);
        metrics.record(Metric::Startup, 200);
        aggregator.push(ToolOutcome {
            tool: "Vite 4.4.2".into(),
            repetition: 1,
            metrics,
            error: None,
        });
        aggregator.finish()
    }

    #[test]
    fn table_contains_tools_metrics_and_missing_cells() {
        let table = render_table(&sample_aggregate());
        assert!(table.contains("Vite 4.4.2"));
        assert!(table.contains("serverStartTime"));
        assert!(table.contains("120.0ms"));
        // buildTime was never recorded.
        assert!(table.contains('-'));
    }

    #[test]
    fn json_report_lands_in_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_json(&sample_aggregate(), dir.path()).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["tools"]["Vite 4.4.2"]["startup"], 200.0);
        assert_eq!(parsed["runs"], 1);
    }

    #[test]
    fn chart_html_embeds_the_aggregate() {
        let html = chart_html(&sample_aggregate()).unwrap();
        assert!(html.contains("Vite 4.4.2"));
        assert!(html.contains("chart.js"));
    }
}
