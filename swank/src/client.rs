//! `SwankClient`, the host application's single entry point.
//!
//! All session state lives here and is mutated only from the host's own
//! loop: `start_session`, `evaluate`, `poll_events`, and `shutdown`.
//! Background tasks (process output drain, connection retries, socket
//! listener, socket writer) communicate with it exclusively through the
//! event queue drained by `poll_events`.

use std::collections::VecDeque;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::connect::{Connector, RetryPolicy};
use crate::correlator::{Completion, Correlator, SendFailed};
use crate::listener::{Listener, Writer};
use crate::process::{LaunchError, LispProcess, script_path};
use crate::protocol;
use crate::types::{
    ConnectionState, Continuation, EvalOutput, ProcessState, SessionNotification, SwankConfig,
    SwankEvent, ThreadTag,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("Lisp instance not connected")]
    NotConnected,
    #[error("SWANK session is still starting up")]
    NotReady,
    #[error("SWANK connection lost while sending")]
    SendFailed,
}

/// Live socket halves and the request state riding on them.
struct Connection {
    generation: u64,
    listener: Listener,
    writer: Writer,
    correlator: Correlator,
}

/// Host-facing SWANK client.
pub struct SwankClient {
    config: SwankConfig,
    event_rx: mpsc::UnboundedReceiver<SwankEvent>,
    event_tx: mpsc::UnboundedSender<SwankEvent>,
    process: Option<LispProcess>,
    connector: Option<Connector>,
    connection: Option<Connection>,
    /// Generation of the most recent connection.
    generation: u64,
    /// Pumps of lost connections that have been told to exit.
    retired: Vec<(Listener, Writer)>,
    connection_state: ConnectionState,
    ready: bool,
    /// Notifications raised outside the event queue, delivered first.
    backlog: VecDeque<SessionNotification>,
}

impl SwankClient {
    #[must_use]
    pub fn new(config: SwankConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config,
            event_rx,
            event_tx,
            process: None,
            connector: None,
            connection: None,
            generation: 0,
            retired: Vec::new(),
            connection_state: ConnectionState::Disconnected,
            ready: false,
            backlog: VecDeque::new(),
        }
    }

    /// Launch the Lisp process (if a binary is given) and start connecting.
    ///
    /// A no-op while a session is starting or running. After a failure or a
    /// lost connection it may be called again.
    pub fn start_session(
        &mut self,
        lisp_binary: Option<PathBuf>,
        root_dir: Option<PathBuf>,
    ) -> Result<(), SessionError> {
        if matches!(
            self.connection_state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            tracing::info!("Swank session already started");
            return Ok(());
        }

        let process_running = self.process.as_mut().is_some_and(LispProcess::is_running);
        if !process_running {
            let script = script_path(root_dir.as_deref(), &self.config.bootstrap_script);
            let mut process = LispProcess::new(lisp_binary, script, self.config.stop_timeout());
            if let Err(e) = process.start(self.event_tx.clone()) {
                tracing::error!("{e}");
                self.connection_state = ConnectionState::Failed;
                return Err(e.into());
            }
            self.process = Some(process);
        }

        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            "Connecting to SWANK server"
        );
        self.connector = Some(Connector::spawn(
            self.config.host.clone(),
            self.config.port,
            RetryPolicy::from_config(&self.config),
            self.event_tx.clone(),
        ));
        self.connection_state = ConnectionState::Connecting;
        Ok(())
    }

    /// Evaluate `source` on the REPL thread.
    ///
    /// Returns the correlation id; the result arrives later as
    /// [`SessionNotification::EvalComplete`] carrying the same id.
    pub fn evaluate(&mut self, source: &str) -> Result<u64, SessionError> {
        let Some(connection) = self.connection.as_mut() else {
            tracing::info!("Not sending message: Lisp instance not connected");
            return Err(SessionError::NotConnected);
        };
        if !self.ready {
            return Err(SessionError::NotReady);
        }
        let form = protocol::listener_eval(source);
        match connection
            .correlator
            .submit(form, ThreadTag::Repl, Continuation::EvalComplete)
        {
            Ok(id) => Ok(id),
            Err(_) => {
                self.lose_connection("write to SWANK server failed".to_string());
                Err(SessionError::SendFailed)
            }
        }
    }

    /// Drain up to `budget` background events and return the resulting
    /// notifications. Never blocks.
    pub fn poll_events(&mut self, budget: usize) -> Vec<SessionNotification> {
        let mut count = 0;
        while count < budget {
            match self.event_rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                    count += 1;
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        self.backlog.drain(..).collect()
    }

    fn handle_event(&mut self, event: SwankEvent) {
        match event {
            SwankEvent::ProcessOutput(line) => {
                self.backlog.push_back(SessionNotification::OutputLine(line));
            }
            SwankEvent::Connected(stream) => self.on_connected(stream),
            SwankEvent::ConnectFailed(reason) => {
                tracing::error!("Could not connect to Lisp server: {reason}");
                self.connector = None;
                self.connection_state = ConnectionState::Failed;
                self.backlog
                    .push_back(SessionNotification::SessionFailed(reason));
            }
            SwankEvent::Inbound { generation, msg } => {
                let Some(connection) = self
                    .connection
                    .as_mut()
                    .filter(|connection| connection.generation == generation)
                else {
                    tracing::debug!(raw = msg.raw(), "Ignoring message for a closed connection");
                    return;
                };
                if let Some(entry) = msg.debug_entry() {
                    tracing::info!(level = entry.level, "Lisp debugger entered");
                    self.backlog
                        .push_back(SessionNotification::DebuggerEntered(entry));
                }
                match connection.correlator.on_inbound(msg) {
                    Ok(Some(completion)) => self.on_completion(completion),
                    Ok(None) => {}
                    Err(SendFailed { completed }) => {
                        if let Some(completion) = completed {
                            self.on_completion(*completion);
                        }
                        self.lose_connection("write to SWANK server failed".to_string());
                    }
                }
            }
            SwankEvent::ConnectionLost { generation, reason } => {
                if self.is_current(generation) {
                    self.lose_connection(reason);
                } else {
                    tracing::debug!(generation, "Ignoring loss of a retired connection: {reason}");
                }
            }
        }
    }

    fn on_connected(&mut self, stream: tokio::net::TcpStream) {
        // The retry task exits on its own after delivering the socket.
        self.connector = None;
        self.generation += 1;
        let generation = self.generation;
        let (read_half, write_half) = stream.into_split();
        let listener = Listener::spawn(read_half, generation, self.event_tx.clone());
        let writer = Writer::spawn(write_half, generation, self.event_tx.clone());
        let mut correlator = Correlator::new(self.config.package.clone(), writer.sender());
        self.connection_state = ConnectionState::Connected;
        self.ready = false;

        let mut send_failed = false;
        for (form, continuation) in protocol::bootstrap_sequence(&self.config) {
            if correlator
                .submit(form, ThreadTag::Default, continuation)
                .is_err()
            {
                send_failed = true;
                break;
            }
        }
        self.connection = Some(Connection {
            generation,
            listener,
            writer,
            correlator,
        });
        if send_failed {
            self.lose_connection("write to SWANK server failed".to_string());
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion.continuation {
            Continuation::Discard => {}
            Continuation::SessionReady => {
                tracing::info!("Swank setup complete");
                self.ready = true;
                self.backlog.push_back(SessionNotification::SessionReady);
            }
            Continuation::EvalComplete => {
                let status = completion.status();
                self.backlog
                    .push_back(SessionNotification::EvalComplete(EvalOutput::new(
                        completion.id,
                        status,
                        completion.messages,
                    )));
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|connection| connection.generation == generation)
    }

    /// Tear down request state; queued requests will never complete.
    fn lose_connection(&mut self, reason: String) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        tracing::error!(
            pending = connection.correlator.pending(),
            in_flight = ?connection.correlator.in_flight(),
            buffered = connection.correlator.buffered(),
            "Lost Lisp connection: {reason}"
        );
        connection.listener.signal_stop();
        connection.writer.close();
        self.retired
            .retain(|(listener, writer)| !(listener.is_finished() && writer.is_finished()));
        self.retired.push((connection.listener, connection.writer));
        self.ready = false;
        self.connection_state = ConnectionState::Disconnected;
        self.backlog
            .push_back(SessionNotification::ConnectionLost(reason));
    }

    /// Stop the listener, any pending connection attempts, and the Lisp
    /// process, in that order.
    pub async fn shutdown(&mut self) {
        tracing::info!("Stopping Swank client");
        let mut pumps: Vec<(Listener, Writer)> = self.retired.drain(..).collect();
        pumps.extend(
            self.connection
                .take()
                .map(|connection| (connection.listener, connection.writer)),
        );
        for (listener, writer) in pumps {
            listener.stop().await;
            writer.shutdown().await;
        }
        if let Some(connector) = self.connector.take() {
            connector.stop().await;
        }
        if let Some(process) = self.process.as_mut() {
            process.stop().await;
        }
        self.ready = false;
        self.connection_state = ConnectionState::Disconnected;
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    /// Also notices a Lisp process that exited on its own.
    pub fn process_state(&mut self) -> ProcessState {
        self.process
            .as_mut()
            .map_or(ProcessState::NotStarted, LispProcess::state)
    }

    /// Requests submitted on the current connection and not yet completed.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.connection
            .as_ref()
            .map_or(0, |connection| connection.correlator.pending())
    }

    #[must_use]
    pub fn config(&self) -> &SwankConfig {
        &self.config
    }
}
