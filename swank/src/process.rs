//! Lisp process supervisor.
//!
//! Launches `<lisp> --load <bootstrap script>`, drains its standard output
//! line by line so the pipe never fills, and shuts it down in two phases:
//! a termination signal, then a kill if it has not exited in time.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::{ProcessState, SwankEvent};

/// How long to wait for the output drain after the process is gone. A
/// grandchild can keep the pipe open after the process itself exits.
const DRAIN_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
#[error("failed to launch {}: {source}", binary.display())]
pub struct LaunchError {
    binary: PathBuf,
    #[source]
    source: io::Error,
}

pub(crate) struct LispProcess {
    binary: Option<PathBuf>,
    script: PathBuf,
    stop_timeout: Duration,
    state: ProcessState,
    child: Option<Child>,
    drain: Option<JoinHandle<()>>,
}

/// `<root>/<name>`, or `<cwd>/<name>` without a root directory.
pub(crate) fn script_path(root_dir: Option<&Path>, name: &str) -> PathBuf {
    match root_dir {
        Some(root) => root.join(name),
        None => std::env::current_dir().unwrap_or_default().join(name),
    }
}

impl LispProcess {
    pub fn new(binary: Option<PathBuf>, script: PathBuf, stop_timeout: Duration) -> Self {
        tracing::info!(script = %script.display(), "Swank startup file");
        Self {
            binary,
            script,
            stop_timeout,
            state: ProcessState::NotStarted,
            child: None,
            drain: None,
        }
    }

    pub fn state(&mut self) -> ProcessState {
        self.reap();
        self.state
    }

    pub fn is_running(&mut self) -> bool {
        self.reap();
        self.child.is_some()
    }

    /// Notice a child that exited on its own.
    fn reap(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::warn!(%status, "Lisp process exited unexpectedly");
                self.child = None;
                // The drain ends by itself once the pipe reaches EOF.
                self.drain = None;
                self.state = ProcessState::Stopped;
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("Polling Lisp process status failed: {e}"),
        }
    }

    /// Launch the Lisp process.
    ///
    /// Without a configured binary this does nothing and the process stays
    /// not running: the SWANK server is assumed to be started externally.
    pub fn start(&mut self, event_tx: mpsc::UnboundedSender<SwankEvent>) -> Result<(), LaunchError> {
        let Some(binary) = self.binary.clone() else {
            tracing::info!("No Lisp binary configured; assuming SWANK server already started");
            return Ok(());
        };
        if self.child.is_some() {
            tracing::info!("Lisp process already started");
            return Ok(());
        }

        tracing::info!(binary = %binary.display(), "Starting Lisp process");
        let mut child = Command::new(&binary)
            .arg("--load")
            .arg(&self.script)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError {
                binary: binary.clone(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            self.drain = Some(tokio::spawn(drain_output(stdout, event_tx)));
        }
        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Terminate the process and join the output drain.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            tracing::info!("Lisp process not running; nothing to stop");
            return;
        };
        self.state = ProcessState::Stopping;
        tracing::info!("Stopping Lisp process");

        terminate(&mut child);
        match tokio::time::timeout(self.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => tracing::info!(%status, "Lisp process exited"),
            Ok(Err(e)) => tracing::warn!("Waiting for Lisp process failed: {e}"),
            Err(_) => {
                tracing::warn!("Lisp process did not exit in time; killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!("Killing Lisp process failed: {e}");
                }
            }
        }

        if let Some(mut drain) = self.drain.take() {
            let joined = tokio::time::timeout(DRAIN_JOIN_TIMEOUT, &mut drain).await;
            if joined.is_err() {
                tracing::debug!("Lisp output still open after exit; abandoning drain");
                drain.abort();
            }
        }
        self.state = ProcessState::Stopped;
        tracing::info!("Lisp process and output drain stopped");
    }
}

/// Ask the process to exit. Falls back to a kill where no gentler signal exists.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: kill(2) takes plain integers and touches no memory. The
            // pid belongs to a child that has not been reaped yet, so it
            // cannot have been recycled.
            unsafe {
                if libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 {
                    return;
                }
            }
        }
    }
    let _ = child.start_kill();
}

async fn drain_output(stdout: ChildStdout, event_tx: mpsc::UnboundedSender<SwankEvent>) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                tracing::info!(target: "lisp", "{line}");
                let _ = event_tx.send(SwankEvent::ProcessOutput(line));
            }
            Err(e) => {
                tracing::debug!("Reading Lisp output failed: {e}");
                break;
            }
        }
    }
    tracing::debug!("Lisp output closed");
}
