use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::matcher::SignalSpec;

/// Static configuration for one build tool under test.
///
/// Immutable once constructed; the ready/build patterns and their capture
/// semantics are the whole per-tool contract, so adding or removing a tool is
/// a configuration change rather than a code change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Display label including the version under test, e.g. "Vite 4.4.2".
    pub label: String,
    /// Local port the dev server claims. Exclusively owned by this tool
    /// while its server runs.
    pub port: u16,
    /// Package script that starts the dev server.
    pub dev_script: String,
    /// Milestone that marks the dev server as ready.
    pub ready: SignalSpec,
    /// Package script that runs the production build.
    pub build_script: String,
    /// Milestone that marks the production build as complete.
    pub build: SignalSpec,
    /// Skip root/leaf HMR measurement for this variant.
    #[serde(default)]
    pub skip_hmr: bool,
}

impl ToolSpec {
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }
}

/// User configuration for the harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    /// Demo project the tools build; defaults to the working directory.
    pub project_root: Option<PathBuf>,
    /// Repetitions per tool.
    pub runs: u32,
    /// Package-script runner invoked as `<runner> run <script>`.
    pub runner: String,
    /// Fixture nearest the render entry point, relative to the project root.
    pub root_fixture: PathBuf,
    /// Fixture deep in the component tree, relative to the project root.
    pub leaf_fixture: PathBuf,
    /// Cache folders wiped before each cold start, relative to the project
    /// root. Missing folders are skipped.
    pub cache_dirs: Vec<PathBuf>,
    /// Where reports and charts land; defaults to the platform data dir.
    pub output_dir: Option<PathBuf>,
    /// Budget for the dev server's ready signal.
    pub ready_timeout_ms: u64,
    /// Budget for the page load event.
    pub navigation_timeout_ms: u64,
    /// Budget for each HMR console marker.
    pub console_timeout_ms: u64,
    /// Budget for the production build.
    pub build_timeout_ms: u64,
    /// Minimum gap between the root and leaf fixture writes, so the two
    /// measurements stay isolated.
    pub hmr_settle_ms: u64,
    /// Pause between stopping a dev server and starting the build.
    pub stop_settle_ms: u64,
    /// Pause between tools, letting socket teardown finish.
    pub tool_settle_ms: u64,
    /// Render a bar chart alongside the table.
    pub chart: bool,
    pub tools: Vec<ToolSpec>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            project_root: None,
            runs: 3,
            runner: "npm".into(),
            root_fixture: PathBuf::from("src/comps/triangle.jsx"),
            leaf_fixture: PathBuf::from("src/comps/triangle_1_1_2_1_2_2_1.jsx"),
            cache_dirs: vec![
                PathBuf::from("node_modules/.cache"),
                PathBuf::from("node_modules/.vite"),
                PathBuf::from("node_modules/.farm"),
                PathBuf::from(".next"),
            ],
            output_dir: None,
            ready_timeout_ms: 120_000,
            navigation_timeout_ms: 60_000,
            console_timeout_ms: 30_000,
            build_timeout_ms: 300_000,
            hmr_settle_ms: 1_000,
            stop_settle_ms: 500,
            tool_settle_ms: 500,
            chart: false,
            tools: default_tools(),
        }
    }
}

impl HarnessSettings {
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Unable to read config at {}", path.display()))?;
            let parsed: Self = toml::from_str(&raw)
                .with_context(|| format!("Malformed config at {}", path.display()))?;
            Ok(parsed)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory {}", parent.display())
            })?;
        }
        let serialised = toml::to_string_pretty(self)?;
        fs::write(path, serialised)
            .with_context(|| format!("Failed to persist config to {}", path.display()))
    }

    pub fn resolve_project_root(&self) -> Result<PathBuf> {
        if let Some(path) = &self.project_root {
            return Ok(path.clone());
        }
        std::env::current_dir().context("Unable to resolve working directory")
    }

    pub fn resolve_output_dir(&self) -> Result<PathBuf> {
        if let Some(path) = &self.output_dir {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("dev", "hmr-bench", "hmr-bench")
            .context("Unable to resolve platform data directory")?;
        Ok(dirs.data_dir().join("reports"))
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("dev", "hmr-bench", "hmr-bench")
        .context("Unable to resolve platform config directory")?;
    Ok(dirs.config_dir().join("config.toml"))
}

/// Built-in tool table matching the demo project's package scripts.
///
/// Ready/build duration sources follow each tool's own log line: tools that
/// print a figure use self-report, Turbopack (which prints a bare milestone)
/// is timed on the host clock.
pub fn default_tools() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            label: "Vite 4.4.2".into(),
            port: 5173,
            dev_script: "start:vite".into(),
            ready: SignalSpec::self_report(r"ready in ([\d.]+)\s*(m?s)"),
            build_script: "build:vite".into(),
            build: SignalSpec::self_report(r"built in ([\d.]+)(m?s)"),
            skip_hmr: false,
        },
        ToolSpec {
            label: "Rspack 0.2.5".into(),
            port: 8080,
            dev_script: "start:rspack".into(),
            ready: SignalSpec::self_report(r"Time: ([\d.]+)\s*(m?s)"),
            build_script: "build:rspack".into(),
            build: SignalSpec::self_report(r"Time: ([\d.]+)\s*(m?s)"),
            skip_hmr: false,
        },
        ToolSpec {
            label: "Webpack(babel) 5.88.0".into(),
            port: 8081,
            dev_script: "start:webpack".into(),
            ready: SignalSpec::self_report(r"compiled .+ in ([\d.]+)\s*(m?s)"),
            build_script: "build:webpack".into(),
            build: SignalSpec::self_report(r"compiled .+ in ([\d.]+)\s*(m?s)"),
            skip_hmr: false,
        },
        ToolSpec {
            label: "Turbopack 13.4.9".into(),
            port: 3000,
            dev_script: "start:turbopack".into(),
            ready: SignalSpec::host_clock("started server on").with_alt(r"Ready in ([\d.]+)(m?s)"),
            build_script: "build:turbopack".into(),
            build: SignalSpec::host_clock("Creating an optimized"),
            skip_hmr: false,
        },
        ToolSpec {
            label: "Farm 0.10.3".into(),
            port: 9000,
            dev_script: "start".into(),
            ready: SignalSpec::self_report(r"Ready on (?:.+) in ([\d.]+)(m?s)"),
            build_script: "build".into(),
            build: SignalSpec::self_report(r"in ([\d.]+)(m?s)"),
            skip_hmr: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::DurationSource;

    #[test]
    fn settings_round_trip_through_toml() {
        let settings = HarnessSettings::default();
        let serialised = toml::to_string_pretty(&settings).unwrap();
        let parsed: HarnessSettings = toml::from_str(&serialised).unwrap();
        assert_eq!(parsed.runs, settings.runs);
        assert_eq!(parsed.tools.len(), settings.tools.len());
        assert_eq!(parsed.tools[0].label, "Vite 4.4.2");
    }

    #[test]
    fn load_or_default_without_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = HarnessSettings::load_or_default(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(settings.runs, 3);
        assert!(!settings.tools.is_empty());
    }

    #[test]
    fn save_then_load_preserves_tool_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut settings = HarnessSettings::default();
        settings.runs = 7;
        settings.save(&path).unwrap();

        let parsed = HarnessSettings::load_or_default(&path).unwrap();
        assert_eq!(parsed.runs, 7);
        let vite = &parsed.tools[0];
        assert_eq!(vite.ready.source, DurationSource::SelfReport);
        assert!(vite.ready.pattern.contains("ready in"));
    }

    #[test]
    fn turbopack_ready_is_host_clock() {
        let tools = default_tools();
        let turbopack = tools
            .iter()
            .find(|tool| tool.label.starts_with("Turbopack"))
            .unwrap();
        assert_eq!(turbopack.ready.source, DurationSource::HostClock);
        assert!(turbopack.ready.alt_pattern.is_some());
    }

    #[test]
    fn tool_url_uses_configured_port() {
        let tools = default_tools();
        assert_eq!(tools[0].url(), "http://localhost:5173");
    }
}
