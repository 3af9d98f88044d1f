//! Public types consumed by the host application.
//!
//! The host constructs a [`SwankConfig`], drives a
//! [`SwankClient`](crate::SwankClient), and reacts to the
//! [`SessionNotification`]s it hands back from `poll_events`.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpStream;

use crate::message::{DebugEntry, ReturnStatus, WireMessage};

/// Configuration for the SWANK client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwankConfig {
    /// Host the SWANK server listens on.
    pub host: String,
    pub port: u16,
    /// Lisp package evaluation requests run in.
    pub package: String,
    /// File name of the script that starts the SWANK server, resolved
    /// against the session's root directory.
    pub bootstrap_script: String,
    /// Connection attempts before giving up.
    pub connect_attempts: u32,
    /// Pause between connection attempts, in milliseconds.
    pub connect_backoff_ms: u64,
    /// Grace period between the termination signal and a forced kill.
    pub stop_timeout_ms: u64,
    /// Contrib modules loaded with `swank:swank-require` during bootstrap.
    pub modules: Vec<String>,
}

impl Default for SwankConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4005,
            package: "COMMON-LISP-USER".to_string(),
            bootstrap_script: "start-swank.lisp".to_string(),
            connect_attempts: 20,
            connect_backoff_ms: 500,
            stop_timeout_ms: 200,
            modules: [
                "swank-indentation",
                "swank-trace-dialog",
                "swank-package-fu",
                "swank-presentations",
                "swank-macrostep",
                "swank-fuzzy",
                "swank-fancy-inspector",
                "swank-c-p-c",
                "swank-arglists",
                "swank-repl",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl SwankConfig {
    #[must_use]
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Lifecycle of the supervised Lisp process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

/// Lifecycle of the socket connection to the SWANK server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Lisp-side thread a request runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadTag {
    /// `T`: any worker thread.
    Default,
    /// `:repl-thread`: the REPL's own thread.
    Repl,
}

impl fmt::Display for ThreadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("T"),
            Self::Repl => f.write_str(":repl-thread"),
        }
    }
}

/// What to do once a request's `:return` arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Nobody is waiting; side messages are dropped.
    Discard,
    /// Final bootstrap step; the session may now accept evaluations.
    SessionReady,
    /// A caller's evaluation.
    EvalComplete,
}

/// Everything that came back for one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalOutput {
    id: u64,
    status: ReturnStatus,
    messages: Vec<WireMessage>,
}

impl EvalOutput {
    pub(crate) fn new(id: u64, status: ReturnStatus, messages: Vec<WireMessage>) -> Self {
        Self {
            id,
            status,
            messages,
        }
    }

    /// Correlation id returned by `evaluate`.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn status(&self) -> &ReturnStatus {
        &self.status
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self.status, ReturnStatus::Abort(_))
    }

    /// Side-channel messages received while the evaluation ran, in order.
    #[must_use]
    pub fn messages(&self) -> &[WireMessage] {
        &self.messages
    }

    /// Printed text: every `:write-string` payload concatenated.
    #[must_use]
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .filter_map(WireMessage::write_string_text)
            .collect()
    }

    #[must_use]
    pub fn output_lines(&self) -> Vec<String> {
        self.text().lines().map(String::from).collect()
    }
}

/// Notifications the host application must handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotification {
    /// Bootstrap finished; `evaluate` is now accepted.
    SessionReady,
    /// The session could not be established.
    SessionFailed(String),
    /// A line the Lisp process printed on its standard output.
    OutputLine(String),
    EvalComplete(EvalOutput),
    /// The socket closed or broke; outstanding requests will never complete.
    ConnectionLost(String),
    /// The Lisp debugger was entered on some thread.
    DebuggerEntered(DebugEntry),
}

/// Messages from background tasks to the client, drained on the host's tick.
#[derive(Debug)]
pub(crate) enum SwankEvent {
    ProcessOutput(String),
    Connected(TcpStream),
    ConnectFailed(String),
    /// Events from the socket pumps carry the generation of the connection
    /// they belong to, so a stale report cannot touch a newer connection.
    Inbound { generation: u64, msg: WireMessage },
    ConnectionLost { generation: u64, reason: String },
}
