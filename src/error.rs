use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds for a single tool's measurement within one repetition.
///
/// These travel inside `anyhow::Error` through the orchestrator; callers that
/// need to distinguish "tool never started" from "tool never served a page"
/// downcast to this enum.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The subprocess could not be spawned at all (command not found etc.).
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The subprocess exited with a non-zero code before its expected output
    /// signal matched. Signal-terminated exits (no code) are not routed here;
    /// they are the normal result of an explicit stop.
    #[error("process exited with code {code} before matching the {context} signal")]
    UnexpectedExit { context: &'static str, code: i32 },

    /// The process exited cleanly but never emitted the expected signal.
    #[error("process exited without emitting the expected {context} signal")]
    MissingSignal { context: &'static str },

    /// No ready signal within the configured budget; backstop against a hung
    /// dev server that neither matches nor exits.
    #[error("no {context} signal within {timeout_ms} ms")]
    SignalDeadline {
        context: &'static str,
        timeout_ms: u64,
    },

    /// The page never fired its load event. Distinct from server-start
    /// failures so operators can tell "never served a page" from "never
    /// started".
    #[error("navigation to {url} did not complete within {timeout_ms} ms")]
    NavigationTimeout { url: String, timeout_ms: u64 },

    /// An expected console marker never arrived.
    #[error("console marker {marker:?} not observed within {timeout_ms} ms")]
    ConsoleTimeout { marker: String, timeout_ms: u64 },

    /// A self-report duration source was configured but the matched line
    /// carried no captured figure. Failing loudly here beats recording a
    /// negative or undefined duration.
    #[error("matched the {context} signal but captured no self-reported duration")]
    MissingSelfReport { context: &'static str },

    /// I/O against one of the two fixture files.
    #[error("fixture file {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    pub fn launch(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::Launch {
            command: command.into(),
            source,
        }
    }
}
