//! SWANK message forms and the inbound dispatch table.

use crate::message::WireMessage;
use crate::sexpr::quote_string;
use crate::types::{Continuation, SwankConfig};

pub(crate) const CONNECTION_INFO: &str = "(swank:connection-info)";
pub(crate) const INIT_PRESENTATIONS: &str = "(swank:init-presentations)";
pub(crate) const CREATE_REPL: &str = r#"(swank-repl:create-repl nil :coding-system "utf-8-unix")"#;

/// What the session must do with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// A `:return`; `None` when its trailing id is not a correlation id.
    Complete(Option<u64>),
    /// Answer immediately; the message itself is not kept.
    Reply(String),
    /// Answer immediately and keep the message for the next completion.
    ReplyAndBuffer(String),
    /// Keep the message for the next completion.
    Buffer,
}

pub(crate) fn dispatch(msg: &WireMessage) -> Dispatch {
    if msg.is(":return") {
        return Dispatch::Complete(msg.return_id());
    }
    if msg.is(":ping") {
        return match emacs_pong(msg) {
            Some(pong) => Dispatch::Reply(pong),
            None => {
                tracing::warn!(raw = msg.raw(), "Ping without thread and tag; keeping it");
                Dispatch::Buffer
            }
        };
    }
    if let Some(token) = msg.write_token() {
        return Dispatch::ReplyAndBuffer(write_done(token));
    }
    Dispatch::Buffer
}

/// `(:emacs-rex <form> "<package>" <thread> <id>)`
pub(crate) fn emacs_rex(form: &str, package: &str, thread: &str, id: u64) -> String {
    format!("(:emacs-rex {form} {} {thread} {id})", quote_string(package))
}

/// Echo the two trailing elements of a `:ping` verbatim.
pub(crate) fn emacs_pong(ping: &WireMessage) -> Option<String> {
    match ping.elements() {
        [_, .., thread, tag] => Some(format!("(:emacs-pong {thread} {tag})")),
        _ => None,
    }
}

pub(crate) fn write_done(token: i64) -> String {
    format!("(:write-done {token})")
}

/// Wrap REPL input for evaluation on the REPL thread.
pub(crate) fn listener_eval(source: &str) -> String {
    format!("(swank-repl:listener-eval {})", quote_string(source))
}

pub(crate) fn swank_require(modules: &[String]) -> String {
    format!("(swank:swank-require '({}))", modules.join(" "))
}

/// The fixed per-connection handshake. Only the last step signals readiness.
pub(crate) fn bootstrap_sequence(config: &SwankConfig) -> Vec<(String, Continuation)> {
    vec![
        (CONNECTION_INFO.to_string(), Continuation::Discard),
        (swank_require(&config.modules), Continuation::Discard),
        (INIT_PRESENTATIONS.to_string(), Continuation::Discard),
        (CREATE_REPL.to_string(), Continuation::SessionReady),
    ]
}
