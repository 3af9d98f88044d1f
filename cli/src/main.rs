//! Minerva CLI - line-oriented REPL over a SWANK session.
//!
//! # Event Loop
//!
//! Every 16ms tick:
//!
//! 1. Drain session notifications (`SwankClient::poll_events`) and print them
//! 2. Drain lines read from stdin by the input thread
//! 3. Submit queued lines once the session is ready
//!
//! Ctrl-C, or EOF once queued work is done, shuts the session down.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write, stdout};
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use minerva_config::{MinervaConfig, minerva_dir};
use minerva_swank::{ConnectionState, SessionNotification, SwankClient};

const TICK: Duration = Duration::from_millis(16);
const EVENT_BUDGET: usize = 64;
const PROMPT: &str = "CL-USER> ";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match open_log_file() {
        Some((path, file)) => {
            registry
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
            tracing::info!(path = %path.display(), "Logging initialized");
        }
        // Logs never go to the terminal the REPL prints on.
        None => registry.init(),
    }
}

/// First writable log file: `~/.minerva/logs/minerva.log`, then
/// `./.minerva/logs/minerva.log`.
fn open_log_file() -> Option<(PathBuf, fs::File)> {
    first_writable_log(
        minerva_dir()
            .into_iter()
            .chain([PathBuf::from(".minerva")]),
    )
}

fn first_writable_log(dirs: impl IntoIterator<Item = PathBuf>) -> Option<(PathBuf, fs::File)> {
    dirs.into_iter()
        .map(|dir| dir.join("logs"))
        .find_map(|dir| {
            fs::create_dir_all(&dir).ok()?;
            let path = dir.join("minerva.log");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()?;
            Some((path, file))
        })
}

/// Read stdin lines on a plain thread so a pending read never holds up
/// runtime shutdown. The channel closes at EOF.
fn spawn_input_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Reading stdin failed: {e}");
                    break;
                }
            }
        }
    });
    rx
}

fn prompt() -> Result<()> {
    let mut out = stdout();
    write!(out, "{PROMPT}")?;
    out.flush()?;
    Ok(())
}

fn render(notification: SessionNotification) -> Result<()> {
    match notification {
        SessionNotification::SessionReady => {
            println!("; SWANK session ready");
            prompt()?;
        }
        SessionNotification::SessionFailed(reason) => {
            eprintln!("; Could not start SWANK session: {reason}");
        }
        SessionNotification::OutputLine(line) => println!("{line}"),
        SessionNotification::EvalComplete(output) => {
            for line in output.output_lines() {
                println!("{line}");
            }
            if output.is_aborted() {
                println!("; Evaluation aborted");
            }
            prompt()?;
        }
        SessionNotification::ConnectionLost(reason) => {
            eprintln!("; Connection to Lisp lost: {reason}");
        }
        SessionNotification::DebuggerEntered(entry) => {
            println!("; Debugger entered (level {})", entry.level);
            for line in &entry.condition {
                println!(";   {line}");
            }
            for (index, (name, description)) in entry.restarts.iter().enumerate() {
                println!(";   {index}: [{name}] {description}");
            }
        }
    }
    Ok(())
}

async fn run_repl(client: &mut SwankClient) -> Result<()> {
    let mut input = spawn_input_reader();
    let mut input_closed = false;
    let mut queued: VecDeque<String> = VecDeque::new();

    let mut ticks = tokio::time::interval(TICK);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                tracing::info!("Interrupted");
                return Ok(());
            }
            _ = ticks.tick() => {}
        }

        for notification in client.poll_events(EVENT_BUDGET) {
            render(notification)?;
        }

        while !input_closed {
            match input.try_recv() {
                Ok(line) if line.trim().is_empty() => {}
                Ok(line) => queued.push_back(line),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => input_closed = true,
            }
        }

        let live = matches!(
            client.connection_state(),
            ConnectionState::Connecting | ConnectionState::Connected
        );
        if client.is_ready() {
            while let Some(line) = queued.pop_front() {
                if let Err(e) = client.evaluate(&line) {
                    eprintln!("; {e}");
                }
            }
        } else if !live {
            for line in queued.drain(..) {
                eprintln!("; Not evaluated, no Lisp session: {line}");
            }
        }

        if input_closed && queued.is_empty() && (client.pending_requests() == 0 || !live) {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = MinervaConfig::load();
    if !config.app.start_repl {
        tracing::info!("REPL disabled in configuration");
        println!("; REPL disabled (app.start_repl = false)");
        return Ok(());
    }

    let mut client = SwankClient::new(config.swank.clone());
    client
        .start_session(config.app.lisp_binary.clone(), config.app.root_dir.clone())
        .context("failed to start Lisp session")?;

    let result = run_repl(&mut client).await;
    client.shutdown().await;
    result
}
