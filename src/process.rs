use crate::error::{CloneError, StderrLog};
use anyhow::{anyhow, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::*;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{ChildStderr, Command, Stdio};
use std::thread::{self, JoinHandle};

#[cfg(test)]
pub mod mocks {
    use mockall::automock;
    #[automock]
    pub trait FakeCmd {
        fn data() -> String;
    }
}

// Test Macro Support {{{
#[cfg(test)]
macro_rules! duct_cmd {
    ( $program:expr $(, $arg:expr )* ) => {
        {
        use crate::process::mocks::FakeCmd;
        $( let _ = $arg; )*
        duct::cmd!("echo", crate::process::mocks::MockFakeCmd::data())
        }
    };
}

#[cfg(not(test))]
macro_rules! duct_cmd {
    ( $program:expr $(, $arg:expr )* ) => {
        duct::cmd!($program, $($arg),*)
    };
}
// }}}

/// Runs a one-shot command to completion, returning its stdout with the
/// trailing newline removed. A non-zero exit raises `ExternalCommandFailed`
/// carrying the captured stderr.
pub fn read_checked(expression: duct::Expression) -> Result<String> {
    debug!("Running {:?}.", expression);
    let output = expression
        .stdout_capture()
        .stderr_capture()
        .unchecked()
        .run()
        .context("Failed to launch external command.")?;
    if !output.status.success() {
        return Err(CloneError::ExternalCommandFailed {
            command: format!("{:?}", expression),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        }
        .into());
    }
    let stdout = String::from_utf8(output.stdout).context("External command produced non-utf8 output.")?;
    Ok(stdout.trim_end_matches('\n').to_string())
}

/// Like `read_checked`, for commands whose output is irrelevant.
pub fn run_checked(expression: duct::Expression) -> Result<()> {
    read_checked(expression).map(|_| ())
}

/// Destination for one child's stderr stream.
#[derive(Debug)]
pub enum StderrMode {
    /// Drain into a gzip-compressed log file at the given path.
    GzipFile(PathBuf),
    /// Drain into memory for in-line error reporting.
    Capture,
}

pub fn render_command(command: &Command) -> String {
    format!("{:?}", command)
}

/// Spawns `send` and `recv`, wiring the sender's stdout to the receiver's
/// stdin, and waits for both. The parent's copy of the pipe write end is
/// dropped when the receiver is spawned, so the receiver observes EOF as soon
/// as the sender finishes. Both statuses are collected before any error is
/// raised; failure of either side yields `SendReceiveFailed`.
pub fn pipe_checked(
    mut send: Command,
    mut recv: Command,
    send_stderr: StderrMode,
    recv_stderr: StderrMode,
) -> Result<()> {
    send.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut sender = send
        .spawn()
        .with_context(|| format!("Failed to spawn {}.", render_command(&send)))?;
    let stream = sender.stdout.take().expect("spawned sender has a piped stdout");
    let sender_errors = sender.stderr.take().expect("spawned sender has a piped stderr");

    recv.stdin(Stdio::from(stream)).stdout(Stdio::null()).stderr(Stdio::piped());
    let mut receiver = match recv.spawn() {
        Ok(receiver) => receiver,
        Err(error) => {
            // Reap the sender so it cannot linger as an orphan.
            let _ = sender.kill();
            let _ = sender.wait();
            return Err(anyhow!(error)).with_context(|| format!("Failed to spawn {}.", render_command(&recv)));
        }
    };
    let receiver_errors = receiver.stderr.take().expect("spawned receiver has a piped stderr");

    let send_drain = drain_stderr(sender_errors, send_stderr);
    let recv_drain = drain_stderr(receiver_errors, recv_stderr);

    let recv_status = receiver.wait();
    let send_status = sender.wait();
    let recv_status = recv_status.context("Failed waiting for the receive process.")?;
    let send_status = send_status.context("Failed waiting for the send process.")?;

    let send_log = join_drain(send_drain)?;
    let recv_log = join_drain(recv_drain)?;

    if send_status.success() && recv_status.success() {
        Ok(())
    } else {
        Err(CloneError::SendReceiveFailed {
            send_status,
            recv_status,
            send_log,
            recv_log,
        }
        .into())
    }
}

fn drain_stderr(mut stream: ChildStderr, mode: StderrMode) -> JoinHandle<Result<StderrLog>> {
    thread::spawn(move || match mode {
        StderrMode::GzipFile(path) => {
            let file = File::create(&path).with_context(|| format!("Failed to create log file {:?}.", path))?;
            let mut encoder = GzEncoder::new(file, Compression::default());
            io::copy(&mut stream, &mut encoder).with_context(|| format!("Failed writing log file {:?}.", path))?;
            encoder
                .finish()
                .with_context(|| format!("Failed finishing log file {:?}.", path))?;
            Ok(StderrLog::File(path))
        }
        StderrMode::Capture => {
            let mut buffer = Vec::new();
            stream
                .read_to_end(&mut buffer)
                .context("Failed reading child stderr.")?;
            Ok(StderrLog::Text(String::from_utf8_lossy(&buffer).to_string()))
        }
    })
}

fn join_drain(handle: JoinHandle<Result<StderrLog>>) -> Result<StderrLog> {
    handle
        .join()
        .map_err(|_| anyhow!("A stderr capture thread panicked."))?
}
