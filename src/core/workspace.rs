//! Per-run workspace: scratch directory, log sink and journal location.
//!
//! Layout:
//! ```text
//! <root>/
//!   .lock            exclusive advisory lock held for the run
//!   journal.jsonl    run events (see `Journal`)
//!   .logs/run.log    step headers and summaries
//!   .logs/NN-step.log captured output of each external process
//!   *.patch          patch artifacts
//! ```
//!
//! Log handles are buffered and flushed on `close()` and on drop, so a run
//! that fails or is cancelled still leaves complete logs behind.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use tokio::fs;
use tracing::{debug, info, warn};

/// Name of the log directory inside the workspace root
pub const LOGS_DIR: &str = ".logs";

/// Name of the journal file inside the workspace root
pub const JOURNAL_FILE: &str = "journal.jsonl";
const LOCK_FILE: &str = ".lock";
const TAIL_LINES: usize = 20;

/// How the workspace root is being entered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceMode {
    /// The root must not hold a previous run's journal
    Fresh,
    /// Continue a previous run; its journal must exist
    Resume,
}

/// Scoped workspace for one pipeline run
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    logs_dir: PathBuf,
    verbose: bool,
    run_log: Mutex<BufWriter<File>>,
    lock: File,
}

impl Workspace {
    /// Create (or enter) the workspace root and its `.logs` directory and
    /// take the workspace lock.
    pub async fn acquire(
        root: impl Into<PathBuf>,
        verbose: bool,
        mode: WorkspaceMode,
    ) -> Result<Self> {
        let root = root.into();
        let logs_dir = root.join(LOGS_DIR);

        fs::create_dir_all(&logs_dir)
            .await
            .with_context(|| format!("Failed to create logs directory: {}", logs_dir.display()))?;

        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open workspace lock: {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!("Workspace {} is in use by another run", root.display())
        })?;

        let journal = root.join(JOURNAL_FILE);
        let has_journal = fs::metadata(&journal)
            .await
            .map(|m| m.len() > 0)
            .unwrap_or(false);
        match mode {
            WorkspaceMode::Fresh if has_journal => anyhow::bail!(
                "Workspace {} already holds a previous run; choose a fresh path or resume",
                root.display()
            ),
            WorkspaceMode::Resume if !has_journal => anyhow::bail!(
                "Workspace {} has no previous run to resume",
                root.display()
            ),
            _ => {}
        }

        let run_log_path = logs_dir.join("run.log");
        let run_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&run_log_path)
            .with_context(|| format!("Failed to open run log: {}", run_log_path.display()))?;

        debug!(root = %root.display(), ?mode, "Workspace acquired");

        Ok(Self {
            root,
            logs_dir,
            verbose,
            run_log: Mutex::new(BufWriter::new(run_log)),
            lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    pub fn journal_path(&self) -> PathBuf {
        self.root.join(JOURNAL_FILE)
    }

    /// Resolve a path relative to the workspace root
    pub fn path(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.root.join(relative)
    }

    /// Append a timestamped line to `.logs/run.log`
    pub fn log(&self, line: &str) {
        let mut writer = match self.run_log.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(writer, "{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S"), line) {
            warn!(error = %e, "Failed to write run log");
        }
    }

    /// Open the output log of the step at `index`
    pub fn step_log(&self, index: usize, step: &str) -> Result<StepLog> {
        let file_name = format!("{:02}-{}.log", index + 1, sanitize(step));
        let path = self.logs_dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open step log: {}", path.display()))?;

        Ok(StepLog {
            step: step.to_string(),
            path,
            writer: BufWriter::new(file),
            verbose: self.verbose,
            tail: VecDeque::with_capacity(TAIL_LINES),
        })
    }

    /// Scratch directory inside the workspace, removed when dropped
    pub fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        tempfile::Builder::new()
            .prefix(".scratch-")
            .tempdir_in(&self.root)
            .context("Failed to create scratch directory")
    }

    /// Flush all log handles and release the lock
    pub fn close(self) -> Result<()> {
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let mut writer = match self.run_log.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        writer.flush().context("Failed to flush run log")
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "Failed to flush workspace logs");
        }
        let _ = FileExt::unlock(&self.lock);
    }
}

/// Which stream of a subprocess a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Buffered log of one step's subprocess output
#[derive(Debug)]
pub struct StepLog {
    step: String,
    path: PathBuf,
    writer: BufWriter<File>,
    verbose: bool,
    tail: VecDeque<String>,
}

impl StepLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a header line (command, cwd) without echoing to the console
    pub fn note(&mut self, line: &str) {
        if let Err(e) = writeln!(self.writer, "# {}", line) {
            warn!(step = %self.step, error = %e, "Failed to write step log");
        }
    }

    /// Record one line of subprocess output
    pub fn line(&mut self, stream: Stream, line: &str) {
        let prefix = match stream {
            Stream::Stdout => "",
            Stream::Stderr => "[stderr] ",
        };
        if let Err(e) = writeln!(self.writer, "{}{}", prefix, line) {
            warn!(step = %self.step, error = %e, "Failed to write step log");
        }

        if self.verbose {
            info!(step = %self.step, "{}", line);
        } else {
            debug!(step = %self.step, "{}", line);
        }

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }

    /// Last lines seen, oldest first
    pub fn tail(&self) -> Vec<String> {
        self.tail.iter().cloned().collect()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .with_context(|| format!("Failed to flush step log: {}", self.path.display()))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
