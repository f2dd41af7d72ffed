use crate::btrfs::Btrfs;
use crate::core::plan::ReplicationJob;
use crate::process::{self, StderrMode};
use anyhow::{Context, Result};
use log::*;
use std::fs;
use std::path::{Path, PathBuf};

/// Stderr policy for a send/receive pipeline: gzip log files once verbosity
/// reaches 2, in-memory capture below that.
#[derive(Debug, Clone, Copy)]
pub struct LogPolicy {
    verbosity: u8,
}

impl LogPolicy {
    pub fn for_verbosity(verbosity: u8) -> Self {
        Self { verbosity }
    }

    fn verbose_children(&self) -> bool {
        self.verbosity >= 2
    }

    fn stderr_modes(&self, destination: &Path) -> (StderrMode, StderrMode) {
        if self.verbose_children() {
            let sanitized = destination.to_string_lossy().replace('/', "-");
            (
                StderrMode::GzipFile(PathBuf::from(format!("btrfs-send-{}.log.gz", sanitized))),
                StderrMode::GzipFile(PathBuf::from(format!("btrfs-recv-{}.log.gz", sanitized))),
            )
        } else {
            (StderrMode::Capture, StderrMode::Capture)
        }
    }
}

/// Runs one send/receive pipeline. Under dry-run the composed pipeline is
/// logged and nothing is executed.
pub fn send_receive(
    btrfs: &Btrfs,
    source: &Path,
    receive_dir: &Path,
    parent: Option<&Path>,
    clone_sources: &[PathBuf],
    policy: LogPolicy,
) -> Result<()> {
    let send = btrfs.send_command(source, parent, clone_sources, policy.verbose_children());
    let recv = btrfs.receive_command(receive_dir, policy.verbose_children());

    if btrfs.dry_run() {
        info!(
            "Would run: {} | {}",
            process::render_command(&send),
            process::render_command(&recv)
        );
        return Ok(());
    }

    info!("Sending {:?} into {:?}.", source, receive_dir);
    debug!(
        "Pipeline: {} | {}",
        process::render_command(&send),
        process::render_command(&recv)
    );
    let (send_stderr, recv_stderr) = policy.stderr_modes(receive_dir);
    process::pipe_checked(send, recv, send_stderr, recv_stderr)
        .with_context(|| format!("Failed to replicate {:?}.", source))
}

/// Executes planned jobs in order. A job whose received path already exists
/// is skipped, which keeps a re-entered plan from corrupting prior work.
pub fn execute_jobs(btrfs: &Btrfs, jobs: &[ReplicationJob], policy: LogPolicy) -> Result<()> {
    for job in jobs {
        if job.received_path.exists() {
            info!("Subvolume already present at {:?}, skipping transfer.", job.received_path);
            continue;
        }
        if !btrfs.dry_run() && !job.receive_dir.exists() {
            fs::create_dir_all(&job.receive_dir)
                .with_context(|| format!("Failed to create receive directory {:?}.", job.receive_dir))?;
        }
        send_receive(
            btrfs,
            &job.source_path,
            &job.receive_dir,
            job.parent.as_deref(),
            &job.clone_sources,
            policy,
        )?;
        if job.clear_ro {
            btrfs.set_ro(&job.received_path, false)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(received_path: PathBuf, receive_dir: PathBuf) -> ReplicationJob {
        ReplicationJob {
            subvol_id: 256,
            source_path: PathBuf::from("/mnt/old/a"),
            receive_dir,
            received_path,
            parent: None,
            clone_sources: Vec::new(),
            clear_ro: false,
        }
    }

    #[test]
    fn existing_destination_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let received = dir.path().join("a");
        std::fs::create_dir(&received).unwrap();

        // With a real (non dry-run) wrapper, reaching the pipeline would try
        // to spawn processes; the guard must return before that.
        let btrfs = Btrfs::new("btrfs-test-must-not-run", false);
        let jobs = vec![job(received, dir.path().to_path_buf())];
        execute_jobs(&btrfs, &jobs, LogPolicy::for_verbosity(0)).unwrap();
    }

    #[test]
    fn dry_run_logs_without_touching_the_destination() {
        let dir = tempfile::tempdir().unwrap();
        let receive_dir = dir.path().join("stage").join("256");
        let jobs = vec![job(receive_dir.join("a"), receive_dir.clone())];

        let btrfs = Btrfs::new("btrfs", true);
        execute_jobs(&btrfs, &jobs, LogPolicy::for_verbosity(0)).unwrap();
        assert!(!receive_dir.exists());
    }

    #[test]
    fn log_files_are_named_for_the_destination() {
        let policy = LogPolicy::for_verbosity(2);
        let (send, recv) = policy.stderr_modes(Path::new("/mnt/new/stage/256"));
        match (send, recv) {
            (StderrMode::GzipFile(send_path), StderrMode::GzipFile(recv_path)) => {
                assert_eq!(send_path, PathBuf::from("btrfs-send--mnt-new-stage-256.log.gz"));
                assert_eq!(recv_path, PathBuf::from("btrfs-recv--mnt-new-stage-256.log.gz"));
            }
            other => panic!("expected gzip log files, got {:?}", other),
        }
    }
}
