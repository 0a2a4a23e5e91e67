use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::ToolSpec;
use crate::error::HarnessError;
use crate::matcher::{DurationSource, SignalMatcher, sanitize_chunk};

/// Materialised subprocess invocation, ready to be spawned or logged.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<String>,
    cwd: PathBuf,
}

impl CommandSpec {
    pub fn new(program: PathBuf, args: Vec<String>, cwd: PathBuf) -> Self {
        Self { program, args, cwd }
    }

    /// `<runner> run <script>` in the project root, stdout/stderr piped.
    pub fn package_script(runner: &Path, script: &str, project_root: &Path) -> Self {
        Self::new(
            runner.to_path_buf(),
            vec!["run".into(), script.into()],
            project_root.to_path_buf(),
        )
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group so stop() can take down forked helpers too.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }
}

enum ScanEvent {
    Chunk(String),
}

/// Manages one build tool's dev-server/build lifecycle and translates its
/// unstructured output into timing signals.
pub struct ToolRunner {
    label: String,
    child: Option<Child>,
}

/// Output scanned so far plus the running child state for one milestone wait.
struct OutputScan {
    rx: Receiver<ScanEvent>,
    buffer: String,
}

// Scanned output is unbounded in principle; keep a rolling window large
// enough that no milestone line can straddle out of it.
const SCAN_WINDOW_BYTES: usize = 64 * 1024;

impl OutputScan {
    fn attach(child: &mut Child) -> Self {
        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx);
        }
        Self {
            rx,
            buffer: String::new(),
        }
    }

    fn absorb(&mut self, chunk: String) {
        self.buffer.push_str(&chunk);
        if self.buffer.len() > SCAN_WINDOW_BYTES {
            let cut = self.buffer.len() - SCAN_WINDOW_BYTES;
            // Stay on a char boundary.
            let cut = (cut..self.buffer.len())
                .find(|index| self.buffer.is_char_boundary(*index))
                .unwrap_or(0);
            self.buffer.drain(..cut);
        }
    }

    /// Pull any buffered chunks without blocking beyond `wait`.
    fn poll(&mut self, wait: Duration) -> bool {
        let mut received = false;
        match self.rx.recv_timeout(wait) {
            Ok(ScanEvent::Chunk(chunk)) => {
                self.absorb(chunk);
                received = true;
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
        while let Ok(ScanEvent::Chunk(chunk)) = self.rx.try_recv() {
            self.absorb(chunk);
            received = true;
        }
        received
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut stream: R, tx: Sender<ScanEvent>) {
    thread::spawn(move || {
        let mut raw = [0u8; 4096];
        loop {
            match stream.read(&mut raw) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    // Keep draining even if the receiver is gone, so the
                    // child never blocks on a full pipe.
                    let _ = tx.send(ScanEvent::Chunk(sanitize_chunk(&raw[..n])));
                }
            }
        }
    });
}

impl ToolRunner {
    pub fn new(tool: &ToolSpec) -> Self {
        Self {
            label: tool.label.clone(),
            child: None,
        }
    }

    /// Launch the dev-server command and wait for the ready milestone.
    ///
    /// Returns the server start duration in milliseconds: host-measured
    /// elapsed since spawn, or the self-reported figure from the matched
    /// line, per the tool's configured duration source.
    pub fn start(
        &mut self,
        command: &CommandSpec,
        matcher: &SignalMatcher,
        timeout: Duration,
    ) -> Result<u64, HarnessError> {
        debug_assert!(self.child.is_none(), "start called while a server runs");

        let launched = Instant::now();
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| HarnessError::launch(command.describe(), source))?;
        let mut scan = OutputScan::attach(&mut child);
        info!(tool = %self.label, command = %command.describe(), "dev server spawned");

        let deadline = launched + timeout;
        loop {
            if scan.poll(Duration::from_millis(25)) {
                if let Some(matched) = matcher.scan(&scan.buffer) {
                    let duration_ms =
                        match start_duration(matcher.source(), matched.self_reported_ms, launched)
                        {
                            Ok(duration_ms) => duration_ms,
                            Err(err) => {
                                let _ = kill_process_group(&mut child);
                                let _ = child.wait();
                                return Err(err);
                            }
                        };
                    self.child = Some(child);
                    info!(tool = %self.label, duration_ms, "dev server ready");
                    return Ok(duration_ms);
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    // Drain whatever the pipes still hold before judging.
                    while scan.poll(Duration::from_millis(10)) {}
                    if let Some(matched) = matcher.scan(&scan.buffer) {
                        let duration_ms = start_duration(
                            matcher.source(),
                            matched.self_reported_ms,
                            launched,
                        )?;
                        self.child = Some(child);
                        return Ok(duration_ms);
                    }
                    return Err(match status.code() {
                        Some(code) if code != 0 => HarnessError::UnexpectedExit {
                            context: "ready",
                            code,
                        },
                        // Exit 0 or signal-terminated, still no match.
                        _ => HarnessError::MissingSignal { context: "ready" },
                    });
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(HarnessError::launch(command.describe(), source));
                }
            }

            if Instant::now() >= deadline {
                let _ = kill_process_group(&mut child);
                let _ = child.wait();
                return Err(HarnessError::SignalDeadline {
                    context: "ready",
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Terminate the dev-server process group and wait for the child to
    /// exit, so the port is confirmed released before the next claimant.
    /// Idempotent; safe to call when no server is running.
    pub fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        kill_process_group(&mut child)
            .with_context(|| format!("Failed to terminate {} dev server", self.label))?;
        let status = child
            .wait()
            .with_context(|| format!("Failed to reap {} dev server", self.label))?;
        // A signal-terminated exit (no code) is the expected result here.
        info!(tool = %self.label, exit_code = ?status.code(), "dev server stopped");
        Ok(())
    }

    /// Launch the production-build command, wait for the completion
    /// milestone, and wait for process exit before resolving. Waiting for
    /// exit guards against partially flushed output races and gives
    /// host-clock tools their full process duration.
    pub fn build(
        &mut self,
        command: &CommandSpec,
        matcher: &SignalMatcher,
        timeout: Duration,
    ) -> Result<u64, HarnessError> {
        let launched = Instant::now();
        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| HarnessError::launch(command.describe(), source))?;
        let mut scan = OutputScan::attach(&mut child);
        info!(tool = %self.label, command = %command.describe(), "build started");

        let deadline = launched + timeout;
        let mut matched: Option<Option<u64>> = None;
        loop {
            if scan.poll(Duration::from_millis(25)) && matched.is_none() {
                if let Some(signal) = matcher.scan(&scan.buffer) {
                    matched = Some(signal.self_reported_ms);
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => {
                    while scan.poll(Duration::from_millis(10)) {}
                    if matched.is_none() {
                        if let Some(signal) = matcher.scan(&scan.buffer) {
                            matched = Some(signal.self_reported_ms);
                        }
                    }
                    let elapsed_ms = launched.elapsed().as_millis() as u64;

                    if let Some(code) = status.code() {
                        if code != 0 {
                            return Err(HarnessError::UnexpectedExit {
                                context: "build",
                                code,
                            });
                        }
                    }
                    let Some(self_reported) = matched else {
                        return Err(HarnessError::MissingSignal { context: "build" });
                    };
                    let duration_ms = match matcher.source() {
                        DurationSource::HostClock => elapsed_ms,
                        DurationSource::SelfReport => self_reported
                            .ok_or(HarnessError::MissingSelfReport { context: "build" })?,
                    };
                    info!(tool = %self.label, duration_ms, "build finished");
                    return Ok(duration_ms);
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(HarnessError::launch(command.describe(), source));
                }
            }

            if Instant::now() >= deadline {
                let _ = kill_process_group(&mut child);
                let _ = child.wait();
                return Err(HarnessError::SignalDeadline {
                    context: "build",
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }
}

impl Drop for ToolRunner {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(err) = self.stop() {
                warn!(tool = %self.label, error = %err, "dev server teardown failed");
            }
        }
    }
}

fn start_duration(
    source: DurationSource,
    self_reported_ms: Option<u64>,
    launched: Instant,
) -> Result<u64, HarnessError> {
    match source {
        DurationSource::HostClock => Ok(launched.elapsed().as_millis() as u64),
        DurationSource::SelfReport => {
            self_reported_ms.ok_or(HarnessError::MissingSelfReport { context: "ready" })
        }
    }
}

/// Kill the child and its whole process group; build tools commonly fork
/// helper processes that would otherwise keep the port.
fn kill_process_group(child: &mut Child) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        let pgid = unsafe { libc::getpgid(pid) };
        if pgid != -1 {
            unsafe { libc::killpg(pgid, libc::SIGKILL) };
        }
    }
    match child.kill() {
        // Already gone is fine.
        Err(err) if err.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        other => other,
    }
}

/// Delete the configured cache folders so every repetition is a true cold
/// start. Missing folders are logged and skipped.
pub fn clean_cache_dirs(project_root: &Path, cache_dirs: &[PathBuf]) {
    for dir in cache_dirs {
        let path = project_root.join(dir);
        if !path.exists() {
            debug!(path = %path.display(), "cache folder absent, skipping");
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => info!(path = %path.display(), "deleted cache folder"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to delete cache folder"),
        }
    }
}
