pub mod aggregate;
pub mod cli;
pub mod config;
pub mod error;
pub mod fixture;
pub mod matcher;
pub mod probe;
pub mod report;
pub mod runner;

use std::{path::PathBuf, thread, time::Duration};

use anyhow::{Context, Result};
use tracing::{info, info_span, warn};

use crate::aggregate::{AggregateResult, Aggregator, Metric, RunResult, ToolOutcome};
use crate::config::{HarnessSettings, ToolSpec, default_config_path};
use crate::error::HarnessError;
use crate::fixture::{LEAF_MARKER, MutationInjector, ROOT_MARKER};
use crate::matcher::SignalMatcher;
use crate::probe::{BrowserProbe, Probe};
use crate::runner::{CommandSpec, ToolRunner, clean_cache_dirs};

/// Primary orchestrator: sequences every tool through the measurement
/// pipeline for N repetitions and folds the results.
///
/// Within one tool's measurement the order is mandatory: start, load, root
/// mutation, leaf mutation, restore, stop, build. Reordering would conflate
/// "rebuild cost near the root" with "rebuild cost at a deep leaf".
pub struct Harness {
    settings: HarnessSettings,
    project_root: PathBuf,
    runner_bin: PathBuf,
}

/// Everything a run produced: the aggregate plus where reports landed.
#[derive(Debug)]
pub struct HarnessReport {
    pub aggregate: AggregateResult,
    pub json_path: PathBuf,
    pub chart_path: Option<PathBuf>,
}

impl Harness {
    /// Construct a harness from explicit settings.
    pub fn from_settings(settings: HarnessSettings) -> Result<Self> {
        let project_root = settings.resolve_project_root()?;
        let runner_bin = which::which(&settings.runner).with_context(|| {
            format!("Package runner `{}` not found on PATH", settings.runner)
        })?;
        Ok(Self {
            settings,
            project_root,
            runner_bin,
        })
    }

    /// Load configuration from the default path (or an override) and
    /// bootstrap the harness.
    pub fn bootstrap(config_path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = match config_path_override {
            Some(path) => path,
            None => default_config_path()?,
        };
        let settings = HarnessSettings::load_or_default(&config_path)?;
        Self::from_settings(settings)
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    /// Execute the full benchmark and write reports.
    pub fn run(&self) -> Result<HarnessReport> {
        let mut probe = BrowserProbe::launch()?;
        let aggregate = self.run_with_probe(&mut probe)?;

        println!("{}", report::render_table(&aggregate));

        let output_dir = self.settings.resolve_output_dir()?;
        let json_path = report::write_json(&aggregate, &output_dir)?;
        let chart_path = if self.settings.chart {
            match report::write_chart(&probe, &aggregate, &output_dir) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(error = %err, "chart rendering failed");
                    None
                }
            }
        } else {
            None
        };

        Ok(HarnessReport {
            aggregate,
            json_path,
            chart_path,
        })
    }

    /// Drive all repetitions against an arbitrary probe. Tools run strictly
    /// sequentially: they share the browser and contend for fixed ports.
    fn run_with_probe(&self, probe: &mut dyn Probe) -> Result<AggregateResult> {
        let runs = self.settings.runs.max(1);
        let mut aggregator = Aggregator::new(runs);

        for repetition in 1..=runs {
            info!(repetition, runs, "starting repetition");
            for tool in &self.settings.tools {
                let span = info_span!("measure", tool = %tool.label, repetition);
                let _guard = span.enter();

                let outcome = self.measure_tool(tool, probe, repetition);
                match &outcome.error {
                    // A failing tool stays isolated: record and move on.
                    Some(error) => warn!(tool = %tool.label, error, "tool measurement failed"),
                    None => info!(tool = %tool.label, "tool measurement complete"),
                }
                aggregator.push(outcome);

                thread::sleep(Duration::from_millis(self.settings.tool_settle_ms));
            }
        }

        Ok(aggregator.finish())
    }

    /// Measure one tool once. Never propagates failure: whatever metrics
    /// were captured before the error travel with it into the aggregate.
    fn measure_tool(&self, tool: &ToolSpec, probe: &mut dyn Probe, repetition: u32) -> ToolOutcome {
        let mut metrics = RunResult::default();
        let error = self
            .measure_tool_inner(tool, probe, &mut metrics)
            .err()
            .map(|err| format!("{err:#}"));
        ToolOutcome {
            tool: tool.label.clone(),
            repetition,
            metrics,
            error,
        }
    }

    fn measure_tool_inner(
        &self,
        tool: &ToolSpec,
        probe: &mut dyn Probe,
        metrics: &mut RunResult,
    ) -> Result<()> {
        clean_cache_dirs(&self.project_root, &self.settings.cache_dirs);

        let ready = SignalMatcher::compile(&tool.ready)?;
        let dev_command =
            CommandSpec::package_script(&self.runner_bin, &tool.dev_script, &self.project_root);
        let mut runner = ToolRunner::new(tool);

        // Dev-server phase. Teardown still runs when any step fails.
        let measured = (|| -> Result<()> {
            let server_ms = runner.start(
                &dev_command,
                &ready,
                Duration::from_millis(self.settings.ready_timeout_ms),
            )?;
            metrics.record(Metric::ServerStartTime, server_ms);

            let load_ms = probe.measure_load(
                &tool.url(),
                Duration::from_millis(self.settings.navigation_timeout_ms),
            )?;
            metrics.record(Metric::OnLoadTime, load_ms);
            metrics.record(Metric::Startup, server_ms + load_ms);

            if !tool.skip_hmr {
                let mut injector = MutationInjector::new(
                    &self.project_root,
                    &self.settings.root_fixture,
                    &self.settings.leaf_fixture,
                );
                let hmr = measure_hmr(
                    probe,
                    &mut injector,
                    Duration::from_millis(self.settings.hmr_settle_ms),
                    Duration::from_millis(self.settings.console_timeout_ms),
                    metrics,
                );
                // Restore must run on the failure path too; corruption here
                // would poison every later repetition.
                let restored = injector.restore();
                hmr?;
                restored?;
            }
            Ok(())
        })();

        probe.close_page();
        let stopped = runner.stop();
        measured?;
        stopped?;

        if tool.build_script.is_empty() {
            return Ok(());
        }

        thread::sleep(Duration::from_millis(self.settings.stop_settle_ms));

        let build_matcher = SignalMatcher::compile(&tool.build)?;
        let build_command =
            CommandSpec::package_script(&self.runner_bin, &tool.build_script, &self.project_root);
        let build_ms = runner.build(
            &build_command,
            &build_matcher,
            Duration::from_millis(self.settings.build_timeout_ms),
        )?;
        metrics.record(Metric::BuildTime, build_ms);
        Ok(())
    }
}

/// Root-then-leaf HMR measurement. The leaf write never happens before the
/// root write's settling delay has elapsed, keeping the two rebuild costs
/// isolated from each other.
fn measure_hmr(
    probe: &mut dyn Probe,
    injector: &mut MutationInjector,
    settle: Duration,
    timeout: Duration,
    metrics: &mut RunResult,
) -> Result<(), HarnessError> {
    let root_stamp = injector.trigger_root()?;
    let root_ms = probe.wait_for_signal(ROOT_MARKER, &root_stamp, timeout)?;
    metrics.record(Metric::RootHmr, root_ms);

    let since_root = root_stamp.written_at.elapsed();
    if since_root < settle {
        thread::sleep(settle - since_root);
    }

    let leaf_stamp = injector.trigger_leaf()?;
    let leaf_ms = probe.wait_for_signal(LEAF_MARKER, &leaf_stamp, timeout)?;
    metrics.record(Metric::LeafHmr, leaf_ms);
    Ok(())
}

/// Environment health for one fixture file.
#[derive(Debug, Clone)]
pub struct FixtureHealth {
    pub path: PathBuf,
    pub present: bool,
}

/// High-level diagnostics snapshot; never mutates anything.
#[derive(Debug, Clone)]
pub struct DoctorReport {
    pub project_root: PathBuf,
    pub runner_bin: Option<PathBuf>,
    pub runner_error: Option<String>,
    pub browser: Option<PathBuf>,
    pub browser_error: Option<String>,
    pub fixtures: Vec<FixtureHealth>,
    pub output_dir: PathBuf,
    pub tools: usize,
}

/// Check the environment the benchmark depends on: package runner, headless
/// browser, project fixtures, output location.
pub fn doctor(settings: &HarnessSettings) -> Result<DoctorReport> {
    let project_root = settings.resolve_project_root()?;
    let output_dir = settings.resolve_output_dir()?;

    let (runner_bin, runner_error) = match which::which(&settings.runner) {
        Ok(path) => (Some(path), None),
        Err(err) => (None, Some(err.to_string())),
    };
    let (browser, browser_error) = match headless_chrome::browser::default_executable() {
        Ok(path) => (Some(path), None),
        Err(err) => (None, Some(err)),
    };

    let fixtures = [&settings.root_fixture, &settings.leaf_fixture]
        .into_iter()
        .map(|fixture| {
            let path = project_root.join(fixture);
            let present = path.is_file();
            FixtureHealth { path, present }
        })
        .collect();

    Ok(DoctorReport {
        project_root,
        runner_bin,
        runner_error,
        browser,
        browser_error,
        fixtures,
        output_dir,
        tools: settings.tools.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::MutationStamp;
    use std::fs;
    use std::time::Instant;

    /// Probe double recording when each signal wait began and the stamp it
    /// was handed, returning canned durations.
    struct FakeProbe {
        load_ms: u64,
        signal_ms: Vec<u64>,
        loads: Vec<String>,
        waits: Vec<(String, Instant)>,
        closed: u32,
    }

    impl FakeProbe {
        fn new(load_ms: u64, signal_ms: Vec<u64>) -> Self {
            Self {
                load_ms,
                signal_ms,
                loads: Vec::new(),
                waits: Vec::new(),
                closed: 0,
            }
        }
    }

    impl Probe for FakeProbe {
        fn measure_load(&mut self, url: &str, _timeout: Duration) -> Result<u64, HarnessError> {
            self.loads.push(url.into());
            Ok(self.load_ms)
        }

        fn wait_for_signal(
            &mut self,
            marker: &str,
            stamp: &MutationStamp,
            _timeout: Duration,
        ) -> Result<u64, HarnessError> {
            self.waits.push((marker.into(), stamp.written_at));
            if self.signal_ms.is_empty() {
                return Err(HarnessError::ConsoleTimeout {
                    marker: marker.into(),
                    timeout_ms: 0,
                });
            }
            Ok(self.signal_ms.remove(0))
        }

        fn close_page(&mut self) {
            self.closed += 1;
        }
    }

    fn write_fixtures(project_root: &std::path::Path) {
        fs::create_dir_all(project_root.join("src/comps")).unwrap();
        fs::write(
            project_root.join("src/comps/root.jsx"),
            "export const Root = () => null;\n",
        )
        .unwrap();
        fs::write(
            project_root.join("src/comps/leaf.jsx"),
            "export const Leaf = () => null;\n",
        )
        .unwrap();
    }

    #[cfg(unix)]
    fn write_runner_shim(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-npm");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut permissions = fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(&path, permissions).unwrap();
        path
    }

    fn test_settings(project_root: &std::path::Path, runner: &std::path::Path) -> HarnessSettings {
        let mut settings = HarnessSettings::default();
        settings.project_root = Some(project_root.to_path_buf());
        settings.runner = runner.to_string_lossy().into_owned();
        settings.root_fixture = PathBuf::from("src/comps/root.jsx");
        settings.leaf_fixture = PathBuf::from("src/comps/leaf.jsx");
        settings.runs = 1;
        settings.hmr_settle_ms = 50;
        settings.stop_settle_ms = 0;
        settings.tool_settle_ms = 0;
        settings
    }

    #[test]
    fn leaf_trigger_waits_out_the_root_settling_delay() {
        let dir = tempfile::tempdir().unwrap();
        write_fixtures(dir.path());
        let mut injector = MutationInjector::new(
            dir.path(),
            std::path::Path::new("src/comps/root.jsx"),
            std::path::Path::new("src/comps/leaf.jsx"),
        );
        let mut probe = FakeProbe::new(0, vec![10, 20]);
        let settle = Duration::from_millis(120);
        let mut metrics = RunResult::default();

        measure_hmr(
            &mut probe,
            &mut injector,
            settle,
            Duration::from_secs(1),
            &mut metrics,
        )
        .unwrap();
        injector.restore().unwrap();

        assert_eq!(probe.waits.len(), 2);
        assert_eq!(probe.waits[0].0, ROOT_MARKER);
        assert_eq!(probe.waits[1].0, LEAF_MARKER);
        let root_write = probe.waits[0].1;
        let leaf_write = probe.waits[1].1;
        assert!(
            leaf_write.duration_since(root_write) >= settle,
            "leaf mutation written before the root settling delay elapsed"
        );
    }

    #[cfg(unix)]
    #[test]
    fn single_repetition_records_the_expected_metrics() {
        let dir = tempfile::tempdir().unwrap();
        write_fixtures(dir.path());
        let runner = write_runner_shim(
            dir.path(),
            "sleep 0.05; echo 'Ready in 120ms'; sleep 30",
        );

        let mut settings = test_settings(dir.path(), &runner);
        settings.tools = vec![ToolSpec {
            label: "Fake 1.0".into(),
            port: 4321,
            dev_script: "dev".into(),
            ready: matcher::SignalSpec::self_report(r"Ready in ([\d.]+)(m?s)"),
            build_script: String::new(),
            build: matcher::SignalSpec::host_clock("unused"),
            skip_hmr: false,
        }];

        let root_before = fs::read(dir.path().join("src/comps/root.jsx")).unwrap();
        let harness = Harness::from_settings(settings).unwrap();
        let mut probe = FakeProbe::new(80, vec![30, 45]);
        let aggregate = harness.run_with_probe(&mut probe).unwrap();

        let metrics = &aggregate.tools["Fake 1.0"];
        assert_eq!(metrics[&Metric::ServerStartTime], 120.0);
        assert_eq!(metrics[&Metric::OnLoadTime], 80.0);
        assert_eq!(metrics[&Metric::Startup], 200.0);
        assert_eq!(metrics[&Metric::RootHmr], 30.0);
        assert_eq!(metrics[&Metric::LeafHmr], 45.0);
        assert!(aggregate.failures.is_empty());

        // Fixtures restored, page closed, dev server reaped.
        assert_eq!(
            fs::read(dir.path().join("src/comps/root.jsx")).unwrap(),
            root_before
        );
        assert_eq!(probe.loads, vec!["http://localhost:4321".to_string()]);
        assert!(probe.closed >= 1);
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_is_isolated_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        write_fixtures(dir.path());
        let runner = write_runner_shim(dir.path(), "exit 1");

        let mut settings = test_settings(dir.path(), &runner);
        settings.tools = vec![ToolSpec {
            label: "Broken 0.1".into(),
            port: 4322,
            dev_script: "dev".into(),
            ready: matcher::SignalSpec::host_clock("never printed"),
            build_script: String::new(),
            build: matcher::SignalSpec::host_clock("unused"),
            skip_hmr: false,
        }];

        let harness = Harness::from_settings(settings).unwrap();
        let mut probe = FakeProbe::new(0, vec![]);
        let aggregate = harness.run_with_probe(&mut probe).unwrap();

        assert_eq!(aggregate.failures.len(), 1);
        assert!(aggregate.failures[0].error.contains("exited with code 1"));
        assert!(aggregate.all_failed());
        // The probe never saw a page: failure happened at server start.
        assert!(probe.loads.is_empty());
    }

    #[test]
    fn doctor_reports_missing_fixtures() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = HarnessSettings::default();
        settings.project_root = Some(dir.path().to_path_buf());
        settings.output_dir = Some(dir.path().join("out"));

        let report = doctor(&settings).unwrap();
        assert_eq!(report.fixtures.len(), 2);
        assert!(report.fixtures.iter().all(|fixture| !fixture.present));
        assert_eq!(report.tools, settings.tools.len());
    }
}
