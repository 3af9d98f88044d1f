//! Connection establishment with bounded retries.
//!
//! The SWANK server takes a while to come up after the Lisp process starts,
//! so the first attempts are expected to be refused. The retry task never
//! reads or writes protocol data; it only hands over a connected socket.

use std::io;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::stop::{StopHandle, StopSignal, stop_pair};
use crate::types::{SwankConfig, SwankEvent};

/// Upper bound on a single connect attempt.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("could not connect to {addr} after {attempts} attempts: {source}")]
    Exhausted {
        addr: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("connection attempt cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SwankConfig) -> Self {
        Self {
            attempts: config.connect_attempts,
            backoff: config.connect_backoff(),
        }
    }
}

/// Try to connect until success, exhaustion, or stop.
///
/// The stop flag is checked before every attempt and interrupts the backoff
/// sleep.
pub(crate) async fn connect_with_retry(
    host: &str,
    port: u16,
    policy: &RetryPolicy,
    stop: &mut StopSignal,
) -> Result<TcpStream, ConnectError> {
    let addr = format!("{host}:{port}");
    let mut last_error = io::Error::new(io::ErrorKind::NotConnected, "no connection attempt made");

    for attempt in 1..=policy.attempts {
        if stop.is_stopped() {
            return Err(ConnectError::Cancelled);
        }
        match tokio::time::timeout(ATTEMPT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!("Could not set TCP_NODELAY: {e}");
                }
                tracing::info!(attempt, "Connected to SWANK server at {addr}");
                return Ok(stream);
            }
            Ok(Err(e)) => {
                tracing::debug!(attempt, "Connecting to {addr} failed: {e}");
                last_error = e;
            }
            Err(_) => {
                tracing::debug!(attempt, "Connecting to {addr} timed out");
                last_error = io::Error::new(io::ErrorKind::TimedOut, "connect attempt timed out");
            }
        }
        if attempt < policy.attempts && !policy.backoff.is_zero() {
            tokio::select! {
                () = stop.stopped() => return Err(ConnectError::Cancelled),
                () = tokio::time::sleep(policy.backoff) => {}
            }
        }
    }

    Err(ConnectError::Exhausted {
        addr,
        attempts: policy.attempts,
        source: last_error,
    })
}

/// Background retry task. Delivers exactly one of `Connected` or
/// `ConnectFailed`, or nothing if stopped first.
pub(crate) struct Connector {
    stop: StopHandle,
    handle: JoinHandle<()>,
}

impl Connector {
    pub fn spawn(
        host: String,
        port: u16,
        policy: RetryPolicy,
        event_tx: mpsc::UnboundedSender<SwankEvent>,
    ) -> Self {
        let (stop, mut signal) = stop_pair();
        let handle = tokio::spawn(async move {
            match connect_with_retry(&host, port, &policy, &mut signal).await {
                Ok(stream) => {
                    let _ = event_tx.send(SwankEvent::Connected(stream));
                }
                Err(ConnectError::Cancelled) => {
                    tracing::debug!("Swank connection attempts cancelled");
                }
                Err(e) => {
                    tracing::warn!("{e}");
                    let _ = event_tx.send(SwankEvent::ConnectFailed(e.to_string()));
                }
            }
        });
        Self { stop, handle }
    }

    /// Cancel outstanding attempts and wait for the task to finish.
    pub async fn stop(self) {
        self.stop.stop();
        if let Err(e) = self.handle.await {
            tracing::warn!("Swank connect task ended abnormally: {e}");
        }
    }
}
