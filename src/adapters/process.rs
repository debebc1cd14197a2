//! Logged subprocess execution.
//!
//! Commands are spawned directly (never through a shell). Stdout and stderr
//! are pumped line by line into the step's log while the process runs, and
//! the child is killed if the future is dropped (timeout or cancellation).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use crate::core::workspace::{StepLog, Stream};

/// A fully resolved command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    /// `program arg1 arg2 ...` for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Working directory does not exist: {0}")]
    MissingCwd(PathBuf),

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {seconds}s")]
    TimedOut { program: String, seconds: u64 },

    #[error("I/O error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run `invocation`, streaming its output into `log`. Returns the exit
/// status; classifying it is the caller's job.
pub async fn run_logged(invocation: &Invocation, log: &mut StepLog) -> Result<ExitStatus, ProcessError> {
    if !invocation.cwd.is_dir() {
        return Err(ProcessError::MissingCwd(invocation.cwd.clone()));
    }

    log.note(&format!("$ {}", invocation.display()));
    log.note(&format!("cwd: {}", invocation.cwd.display()));

    let program = invocation.program.clone();
    let io_err = |source| ProcessError::Io {
        program: program.clone(),
        source,
    };

    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .current_dir(&invocation.cwd)
        .envs(&invocation.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(io_err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "stdout/stderr pipes were not captured",
        )));
    };

    let pump = async {
        let mut out = BufReader::new(stdout).split(b'\n');
        let mut err = BufReader::new(stderr).split(b'\n');
        let (mut out_done, mut err_done) = (false, false);

        while !(out_done && err_done) {
            tokio::select! {
                segment = out.next_segment(), if !out_done => match segment? {
                    Some(bytes) => log.line(Stream::Stdout, &decode(&bytes)),
                    None => out_done = true,
                },
                segment = err.next_segment(), if !err_done => match segment? {
                    Some(bytes) => log.line(Stream::Stderr, &decode(&bytes)),
                    None => err_done = true,
                },
            }
        }

        child.wait().await
    };

    let status = match invocation.timeout {
        Some(limit) => timeout(limit, pump)
            .await
            .map_err(|_| ProcessError::TimedOut {
                program: invocation.program.clone(),
                seconds: limit.as_secs(),
            })?
            .map_err(io_err)?,
        None => pump.await.map_err(io_err)?,
    };

    log.note(&format!("exit status: {}", status));
    Ok(status)
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
}
