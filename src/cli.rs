use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::default_config_path;
use crate::{Harness, doctor};

#[derive(Parser, Debug)]
#[command(name = "hmr-bench", version, about = "Dev-server and build latency benchmark for front-end build tools", long_about = None)]
pub struct Cli {
    /// Repetitions per tool (overrides the configured value).
    #[arg(long, value_name = "COUNT")]
    pub runs: Option<u32>,

    /// Custom config path.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Demo project directory the tools build.
    #[arg(long, value_name = "DIR")]
    pub project: Option<PathBuf>,

    /// Directory reports and charts are written to.
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Render a bar chart of the results alongside the table.
    #[arg(long, action = ArgAction::SetTrue)]
    pub chart: bool,

    /// Measure only tools whose label contains VALUE (can be repeated).
    #[arg(long = "tool", value_name = "VALUE")]
    pub tools: Vec<String>,

    /// Skip the production-build phase for every tool.
    #[arg(long, action = ArgAction::SetTrue)]
    pub skip_build: bool,

    /// Write the default configuration file and exit.
    #[arg(long, action = ArgAction::SetTrue)]
    pub write_config: bool,

    /// Check runner, browser, and fixtures without measuring anything.
    #[arg(long, action = ArgAction::SetTrue)]
    pub doctor: bool,

    /// Increase logging verbosity.
    #[arg(long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "hmr_bench=debug"
    } else {
        "hmr_bench=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn resolve_config_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    match override_path {
        Some(path) => Ok(path),
        None => default_config_path(),
    }
}

fn health_line(label: &str, value: &str) {
    println!("  {label:<14}: {value}");
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = resolve_config_path(cli.config.clone())?;
    info!(path = %config_path.display(), "using benchmark config");

    let mut settings = crate::config::HarnessSettings::load_or_default(&config_path)?;

    if cli.write_config {
        settings.save(&config_path)?;
        println!("Configuration written to {}", config_path.display());
        return Ok(());
    }

    if let Some(runs) = cli.runs {
        settings.runs = runs;
    }
    if let Some(project) = cli.project.clone() {
        settings.project_root = Some(project);
    }
    if let Some(output) = cli.output.clone() {
        settings.output_dir = Some(output);
    }
    if cli.chart {
        settings.chart = true;
    }
    if !cli.tools.is_empty() {
        settings.tools.retain(|tool| {
            cli.tools
                .iter()
                .any(|needle| tool.label.to_lowercase().contains(&needle.to_lowercase()))
        });
        if settings.tools.is_empty() {
            bail!(
                "no configured tool matches {:?}; check --tool against the configured labels",
                cli.tools
            );
        }
    }
    if cli.skip_build {
        for tool in &mut settings.tools {
            tool.build_script.clear();
        }
    }

    if cli.doctor {
        let report = doctor(&settings)?;
        println!("Benchmark environment:");
        health_line("project root", &report.project_root.display().to_string());
        health_line("output dir", &report.output_dir.display().to_string());
        health_line("tools", &report.tools.to_string());
        match (&report.runner_bin, &report.runner_error) {
            (Some(path), _) => health_line("runner", &path.display().to_string()),
            (None, Some(error)) => health_line("runner", &format!("MISSING ({error})")),
            (None, None) => health_line("runner", "MISSING"),
        }
        match (&report.browser, &report.browser_error) {
            (Some(path), _) => health_line("browser", &path.display().to_string()),
            (None, Some(error)) => health_line("browser", &format!("MISSING ({error})")),
            (None, None) => health_line("browser", "MISSING"),
        }
        for fixture in &report.fixtures {
            let status = if fixture.present { "ok" } else { "MISSING" };
            health_line("fixture", &format!("{} ({status})", fixture.path.display()));
        }
        return Ok(());
    }

    let harness = Harness::from_settings(settings)?;
    let report = harness.run()?;

    info!(path = %report.json_path.display(), "benchmark complete");
    if let Some(chart) = &report.chart_path {
        info!(path = %chart.display(), "chart rendered");
    }

    if report.aggregate.all_failed() {
        bail!("every tool failed in every repetition; see the failure list above");
    }
    Ok(())
}
