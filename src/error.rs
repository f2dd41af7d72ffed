use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;
use uuid::Uuid;

/// Where the stderr of one side of a send/receive pipeline ended up.
#[derive(Debug)]
pub enum StderrLog {
    /// Compressed into a log file on disk.
    File(PathBuf),
    /// Captured in memory for in-line reporting.
    Text(String),
}

impl fmt::Display for StderrLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StderrLog::File(path) => write!(f, "captured in {}", path.display()),
            StderrLog::Text(text) if text.trim().is_empty() => f.write_str("(no output)"),
            StderrLog::Text(text) => f.write_str(text.trim()),
        }
    }
}

#[derive(Error, Debug)]
pub enum CloneError {
    #[error("command {command} failed ({status}): {stderr}")]
    ExternalCommandFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error(
        "send/receive pipeline failed (send: {send_status}, receive: {recv_status}); \
         send stderr: {send_log}; receive stderr: {recv_log}"
    )]
    SendReceiveFailed {
        send_status: ExitStatus,
        recv_status: ExitStatus,
        send_log: StderrLog,
        recv_log: StderrLog,
    },

    #[error("subvolume show output for {path:?} is missing required attributes: {reason}")]
    InventoryIncomplete { path: PathBuf, reason: String },

    #[error("subvolume list and show disagree for {path:?}: listed id {listed}, shown id {shown}")]
    InventoryInconsistent {
        path: PathBuf,
        listed: u64,
        shown: u64,
    },

    #[error("source and destination are the same filesystem ({uuid})")]
    SameFilesystem { uuid: Uuid },

    #[error("cannot place {path:?}: containing subvolume {parent_id} has not been placed")]
    PlacementFailed { path: PathBuf, parent_id: u64 },

    #[error("cleanup action '{action}' failed: {reason}")]
    CleanupFailed { action: String, reason: String },
}
