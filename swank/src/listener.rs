//! Socket pumps: inbound frames to the event queue, outbound frames to the socket.
//!
//! Neither pump owns session state. The listener decodes and forwards; the
//! writer encodes and writes. Either one reports a broken connection as
//! [`SwankEvent::ConnectionLost`] and exits.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::stop::{StopHandle, StopSignal, stop_pair};
use crate::types::SwankEvent;

#[derive(Debug)]
pub(crate) enum WriterCommand {
    Send(String),
    Shutdown,
}

/// Background task decoding frames from the read half of the socket.
pub(crate) struct Listener {
    stop: StopHandle,
    handle: JoinHandle<()>,
}

impl Listener {
    pub fn spawn<R>(reader: R, generation: u64, event_tx: mpsc::UnboundedSender<SwankEvent>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (stop, signal) = stop_pair();
        let handle = tokio::spawn(pump(FrameReader::new(reader), generation, event_tx, signal));
        Self { stop, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Ask the task to exit without waiting for it.
    pub fn signal_stop(&self) {
        self.stop.stop();
    }

    /// Stop the task and wait for it to finish.
    pub async fn stop(self) {
        self.stop.stop();
        if let Err(e) = self.handle.await {
            tracing::warn!("Swank listener task ended abnormally: {e}");
        }
    }
}

async fn pump<R>(
    mut reader: FrameReader<R>,
    generation: u64,
    event_tx: mpsc::UnboundedSender<SwankEvent>,
    mut stop: StopSignal,
) where
    R: AsyncRead + Unpin,
{
    loop {
        if stop.is_stopped() {
            break;
        }
        let result = tokio::select! {
            biased;
            () = stop.stopped() => break,
            result = reader.read_message() => result,
        };
        match result {
            Ok(Some(msg)) => {
                if event_tx
                    .send(SwankEvent::Inbound { generation, msg })
                    .is_err()
                {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!("Swank server closed the connection");
                let _ = event_tx.send(SwankEvent::ConnectionLost {
                    generation,
                    reason: "SWANK server closed the connection".to_string(),
                });
                break;
            }
            Err(e) => {
                tracing::warn!("Swank listener error: {e}");
                let _ = event_tx.send(SwankEvent::ConnectionLost {
                    generation,
                    reason: format!("protocol error: {e}"),
                });
                break;
            }
        }
    }
    tracing::debug!("Swank listener stopped");
}

/// Background task writing frames to the write half of the socket.
pub(crate) struct Writer {
    tx: mpsc::UnboundedSender<WriterCommand>,
    handle: JoinHandle<()>,
}

impl Writer {
    pub fn spawn<W>(writer: W, generation: u64, event_tx: mpsc::UnboundedSender<SwankEvent>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriterCommand>();
        let handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    WriterCommand::Send(text) => {
                        if let Err(e) = writer.write_message(&text).await {
                            tracing::warn!("Swank write error: {e}");
                            let _ = event_tx.send(SwankEvent::ConnectionLost {
                                generation,
                                reason: format!("write failed: {e}"),
                            });
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });
        Self { tx, handle }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<WriterCommand> {
        self.tx.clone()
    }

    /// Ask the task to flush queued frames and close the write half,
    /// without waiting for it.
    pub fn close(&self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Flush queued frames, close the write half, and wait for the task.
    pub async fn shutdown(self) {
        let _ = self.tx.send(WriterCommand::Shutdown);
        if let Err(e) = self.handle.await {
            tracing::warn!("Swank writer task ended abnormally: {e}");
        }
    }
}
