//! Cooperative stop flag for background tasks.

use tokio::sync::watch;

/// Owner side: raises the flag.
#[derive(Debug)]
pub(crate) struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Task side: observes the flag.
#[derive(Debug, Clone)]
pub(crate) struct StopSignal {
    rx: watch::Receiver<bool>,
}

pub(crate) fn stop_pair() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopSignal { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the flag is raised or its handle is dropped.
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_is_observed_by_every_signal() {
        let (handle, mut signal) = stop_pair();
        let other = signal.clone();
        assert!(!signal.is_stopped());

        handle.stop();
        signal.stopped().await;
        assert!(signal.is_stopped());
        assert!(other.is_stopped());
    }

    #[tokio::test]
    async fn dropped_handle_releases_waiters() {
        let (handle, mut signal) = stop_pair();
        drop(handle);
        signal.stopped().await;
        assert!(!signal.is_stopped());
    }
}
