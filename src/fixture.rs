use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::HarnessError;

/// Moment a fixture mutation hit the disk.
///
/// Both clocks are captured so the probe can prefer the in-page epoch
/// timestamp (immune to host/browser clock skew in the other direction) and
/// fall back to host-side elapsed time when the console message carries no
/// timestamp. Returned by value from the triggers; nothing here lives in
/// shared state.
#[derive(Debug, Clone, Copy)]
pub struct MutationStamp {
    /// Unix epoch milliseconds at write completion.
    pub epoch_ms: i64,
    /// Host monotonic clock at write completion.
    pub written_at: Instant,
}

struct FixtureFile {
    path: PathBuf,
    original: Option<Vec<u8>>,
}

impl FixtureFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            original: None,
        }
    }

    fn trigger(&mut self, marker: &str) -> Result<MutationStamp, HarnessError> {
        let original = fs::read(&self.path).map_err(|source| HarnessError::Fixture {
            path: self.path.clone(),
            source,
        })?;
        // Capture before the first write of a cycle; repeated triggers keep
        // the earliest snapshot so restore stays byte-exact.
        if self.original.is_none() {
            self.original = Some(original);
        }

        let statement = format!("\nconsole.log('{marker}', Date.now());\n");
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|source| HarnessError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        file.write_all(statement.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| HarnessError::Fixture {
                path: self.path.clone(),
                source,
            })?;

        debug!(path = %self.path.display(), marker, "appended HMR trigger");
        Ok(MutationStamp {
            epoch_ms: Utc::now().timestamp_millis(),
            written_at: Instant::now(),
        })
    }

    fn restore(&mut self) -> Result<(), HarnessError> {
        if let Some(original) = self.original.take() {
            fs::write(&self.path, original).map_err(|source| HarnessError::Fixture {
                path: self.path.clone(),
                source,
            })?;
            debug!(path = %self.path.display(), "restored fixture");
        }
        Ok(())
    }

    fn dirty(&self) -> bool {
        self.original.is_some()
    }
}

/// Produces a deterministic, reversible rebuild trigger against the two
/// instrumented component files.
///
/// The fixture tree returning to its pre-run state after every repetition is
/// the one invariant that matters here: `restore` is idempotent, and `Drop`
/// is a backstop so an aborted repetition cannot corrupt the next one.
pub struct MutationInjector {
    root: FixtureFile,
    leaf: FixtureFile,
}

pub const ROOT_MARKER: &str = "root hmr";
pub const LEAF_MARKER: &str = "leaf hmr";

impl MutationInjector {
    pub fn new(project_root: &Path, root_fixture: &Path, leaf_fixture: &Path) -> Self {
        Self {
            root: FixtureFile::new(project_root.join(root_fixture)),
            leaf: FixtureFile::new(project_root.join(leaf_fixture)),
        }
    }

    /// Append the root marker statement and return the write stamp.
    pub fn trigger_root(&mut self) -> Result<MutationStamp, HarnessError> {
        self.root.trigger(ROOT_MARKER)
    }

    /// Append the leaf marker statement and return the write stamp. The
    /// caller is responsible for the settling delay after the root trigger;
    /// the two writes are intentionally staggered, never simultaneous.
    pub fn trigger_leaf(&mut self) -> Result<MutationStamp, HarnessError> {
        self.leaf.trigger(LEAF_MARKER)
    }

    /// Write back the captured content of both files. Safe to call when
    /// nothing was triggered; runs both restores even if the first fails.
    pub fn restore(&mut self) -> Result<(), HarnessError> {
        let root = self.root.restore();
        let leaf = self.leaf.restore();
        root.and(leaf)
    }
}

impl Drop for MutationInjector {
    fn drop(&mut self) {
        if self.root.dirty() || self.leaf.dirty() {
            if let Err(err) = self.restore() {
                warn!(error = %err, "failed to restore fixtures during teardown");
            }
        }
    }
}
