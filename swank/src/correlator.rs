//! Request correlation: at most one request in flight per session.
//!
//! Requests are queued in submission order. The head of the queue is the
//! only one ever sent without its `:return` having arrived; everything
//! behind it waits. Side-channel messages that arrive in between are
//! buffered and handed to whichever request completes next.

use std::collections::VecDeque;

use tokio::sync::mpsc;

use crate::listener::WriterCommand;
use crate::message::{ReturnStatus, WireMessage};
use crate::protocol::{self, Dispatch};
use crate::sexpr::Sexpr;
use crate::types::{Continuation, ThreadTag};

#[derive(Debug)]
struct PendingRequest {
    command: String,
    id: u64,
    thread: ThreadTag,
    continuation: Continuation,
}

/// A request whose `:return` has arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Completion {
    pub id: u64,
    pub continuation: Continuation,
    pub reply: WireMessage,
    /// Side-channel messages accumulated since the previous completion.
    pub messages: Vec<WireMessage>,
}

impl Completion {
    pub fn status(&self) -> ReturnStatus {
        self.reply
            .return_status()
            .unwrap_or(ReturnStatus::Ok(Sexpr::symbol("nil")))
    }
}

/// The writer pump is gone; the connection is unusable.
#[derive(Debug, thiserror::Error)]
#[error("socket writer has shut down")]
pub(crate) struct SendFailed {
    /// A request that completed before the failed send.
    pub completed: Option<Box<Completion>>,
}

pub(crate) struct Correlator {
    package: String,
    outbound: mpsc::UnboundedSender<WriterCommand>,
    queue: VecDeque<PendingRequest>,
    /// Id of the queue head once it has been sent.
    in_flight: Option<u64>,
    side_channel: Vec<WireMessage>,
    next_id: u64,
}

impl Correlator {
    pub fn new(package: impl Into<String>, outbound: mpsc::UnboundedSender<WriterCommand>) -> Self {
        Self {
            package: package.into(),
            outbound,
            queue: VecDeque::new(),
            in_flight: None,
            side_channel: Vec::new(),
            next_id: 1,
        }
    }

    /// Queue `command` and send it right away if nothing is in flight.
    ///
    /// Returns the correlation id assigned to the request.
    pub fn submit(
        &mut self,
        command: String,
        thread: ThreadTag,
        continuation: Continuation,
    ) -> Result<u64, SendFailed> {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(PendingRequest {
            command,
            id,
            thread,
            continuation,
        });
        if self.in_flight.is_none() {
            self.send_head()?;
        }
        Ok(id)
    }

    /// Apply one inbound message.
    pub fn on_inbound(&mut self, msg: WireMessage) -> Result<Option<Completion>, SendFailed> {
        tracing::debug!(raw = msg.raw(), "Swank reply");
        match protocol::dispatch(&msg) {
            Dispatch::Complete(Some(id)) => self.complete(id, msg),
            Dispatch::Complete(None) => {
                tracing::warn!(raw = msg.raw(), "Dropping :return without a correlation id");
                Ok(None)
            }
            Dispatch::Reply(reply) => {
                self.send(reply)?;
                Ok(None)
            }
            Dispatch::ReplyAndBuffer(reply) => {
                self.side_channel.push(msg);
                self.send(reply)?;
                Ok(None)
            }
            Dispatch::Buffer => {
                self.side_channel.push(msg);
                Ok(None)
            }
        }
    }

    fn complete(&mut self, id: u64, reply: WireMessage) -> Result<Option<Completion>, SendFailed> {
        let Some(position) = self.queue.iter().position(|request| request.id == id) else {
            tracing::warn!(id, "Dropping :return that matches no pending request");
            return Ok(None);
        };
        if position != 0 {
            tracing::warn!(id, position, "Reply arrived out of submission order");
        }
        let Some(request) = self.queue.remove(position) else {
            return Ok(None);
        };

        let completion = Completion {
            id: request.id,
            continuation: request.continuation,
            reply,
            messages: std::mem::take(&mut self.side_channel),
        };

        if self.in_flight == Some(id) {
            self.in_flight = None;
            if let Err(mut err) = self.send_head() {
                err.completed = Some(Box::new(completion));
                return Err(err);
            }
        }
        Ok(Some(completion))
    }

    fn send_head(&mut self) -> Result<(), SendFailed> {
        let Some(head) = self.queue.front() else {
            return Ok(());
        };
        let frame = protocol::emacs_rex(&head.command, &self.package, &head.thread.to_string(), head.id);
        self.in_flight = Some(head.id);
        self.send(frame)
    }

    fn send(&self, text: String) -> Result<(), SendFailed> {
        tracing::debug!(%text, "Sending to swank");
        self.outbound
            .send(WriterCommand::Send(text))
            .map_err(|_| SendFailed { completed: None })
    }

    /// Requests submitted but not yet completed, in-flight one included.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.in_flight
    }

    pub fn buffered(&self) -> usize {
        self.side_channel.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn correlator() -> (Correlator, mpsc::UnboundedReceiver<WriterCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Correlator::new("COMMON-LISP-USER", tx), rx)
    }

    fn msg(text: &str) -> WireMessage {
        WireMessage::parse(text).unwrap()
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<WriterCommand>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                WriterCommand::Send(text) => frames.push(text),
                WriterCommand::Shutdown => panic!("unexpected Shutdown"),
            }
        }
        frames
    }

    #[test]
    fn test_submit_when_idle_sends_immediately() {
        let (mut c, mut rx) = correlator();
        let id = c
            .submit("(swank:connection-info)".into(), ThreadTag::Default, Continuation::Discard)
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            sent(&mut rx),
            vec![r#"(:emacs-rex (swank:connection-info) "COMMON-LISP-USER" T 1)"#]
        );
        assert_eq!(c.in_flight(), Some(1));
    }

    #[test]
    fn test_at_most_one_request_in_flight() {
        let (mut c, mut rx) = correlator();
        for form in ["(a)", "(b)", "(c)"] {
            c.submit(form.into(), ThreadTag::Default, Continuation::Discard)
                .unwrap();
        }
        let frames = sent(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("(:emacs-rex (a) "));
        assert_eq!(c.pending(), 3);
        assert_eq!(c.in_flight(), Some(1));
    }

    #[test]
    fn test_replies_complete_in_order_and_release_next() {
        let (mut c, mut rx) = correlator();
        c.submit("(a)".into(), ThreadTag::Default, Continuation::Discard)
            .unwrap();
        c.submit("(b)".into(), ThreadTag::Repl, Continuation::EvalComplete)
            .unwrap();
        sent(&mut rx);

        assert!(c.on_inbound(msg("(:new-features (:swank))")).unwrap().is_none());
        let first = c.on_inbound(msg("(:return (:ok nil) 1)")).unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(first.continuation, Continuation::Discard);
        assert_eq!(first.messages.len(), 1);
        assert_eq!(
            sent(&mut rx),
            vec![r#"(:emacs-rex (b) "COMMON-LISP-USER" :repl-thread 2)"#]
        );

        c.on_inbound(msg(r#"(:write-string "3" :repl-result)"#))
            .unwrap();
        c.on_inbound(msg(r#"(:write-string "\n" :repl-result)"#))
            .unwrap();
        let second = c.on_inbound(msg("(:return (:ok nil) 2)")).unwrap().unwrap();
        assert_eq!(second.id, 2);
        assert_eq!(second.continuation, Continuation::EvalComplete);
        let texts: Vec<_> = second
            .messages
            .iter()
            .filter_map(WireMessage::write_string_text)
            .collect();
        assert_eq!(texts, vec!["3", "\n"]);

        assert_eq!(c.pending(), 0);
        assert_eq!(c.in_flight(), None);
        assert_eq!(c.buffered(), 0);
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn test_each_continuation_fires_exactly_once() {
        let (mut c, mut rx) = correlator();
        for _ in 0..3 {
            c.submit("(x)".into(), ThreadTag::Default, Continuation::EvalComplete)
                .unwrap();
        }
        let mut completed = Vec::new();
        for id in 1..=3 {
            if let Some(done) = c
                .on_inbound(msg(&format!("(:return (:ok nil) {id})")))
                .unwrap()
            {
                completed.push(done.id);
            }
            // A duplicate reply matches nothing.
            assert!(c
                .on_inbound(msg(&format!("(:return (:ok nil) {id})")))
                .unwrap()
                .is_none());
        }
        assert_eq!(completed, vec![1, 2, 3]);
        assert_eq!(sent(&mut rx).len(), 3);
    }

    #[test]
    fn test_ping_replies_without_touching_queue() {
        let (mut c, mut rx) = correlator();
        c.submit("(a)".into(), ThreadTag::Default, Continuation::Discard)
            .unwrap();
        sent(&mut rx);

        assert!(c.on_inbound(msg("(:ping 7 3)")).unwrap().is_none());
        assert_eq!(sent(&mut rx), vec!["(:emacs-pong 7 3)"]);
        assert_eq!(c.pending(), 1);
        assert_eq!(c.in_flight(), Some(1));
        assert_eq!(c.buffered(), 0);
    }

    #[test]
    fn test_write_string_acknowledged_and_buffered() {
        let (mut c, mut rx) = correlator();
        assert!(c
            .on_inbound(msg(r#"(:write-string "hi" nil 5)"#))
            .unwrap()
            .is_none());
        assert_eq!(sent(&mut rx), vec!["(:write-done 5)"]);
        assert_eq!(c.buffered(), 1);
    }

    #[test]
    fn test_unmatched_return_is_dropped() {
        let (mut c, mut rx) = correlator();
        c.submit("(a)".into(), ThreadTag::Default, Continuation::Discard)
            .unwrap();
        sent(&mut rx);
        c.on_inbound(msg("(:presentation-start 1 :repl-result)"))
            .unwrap();

        assert!(c.on_inbound(msg("(:return (:ok nil) 99)")).unwrap().is_none());
        assert_eq!(c.pending(), 1);
        assert_eq!(c.in_flight(), Some(1));
        assert_eq!(c.buffered(), 1);
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn test_reply_for_queued_request_keeps_head_in_flight() {
        let (mut c, mut rx) = correlator();
        c.submit("(a)".into(), ThreadTag::Default, Continuation::Discard)
            .unwrap();
        c.submit("(b)".into(), ThreadTag::Default, Continuation::EvalComplete)
            .unwrap();
        sent(&mut rx);

        let done = c.on_inbound(msg("(:return (:ok nil) 2)")).unwrap().unwrap();
        assert_eq!(done.id, 2);
        assert_eq!(c.in_flight(), Some(1));
        assert!(sent(&mut rx).is_empty());

        c.on_inbound(msg("(:return (:ok nil) 1)")).unwrap().unwrap();
        assert_eq!(c.in_flight(), None);
        assert_eq!(c.pending(), 0);
    }

    #[test]
    fn test_abort_still_delivers_side_messages() {
        let (mut c, _rx) = correlator();
        c.submit("(error \"x\")".into(), ThreadTag::Repl, Continuation::EvalComplete)
            .unwrap();
        c.on_inbound(msg(r#"(:write-string "partial" :repl-result)"#))
            .unwrap();
        let done = c
            .on_inbound(msg(r#"(:return (:abort "x") 1)"#))
            .unwrap()
            .unwrap();
        assert_eq!(done.messages.len(), 1);
        assert_eq!(
            done.status(),
            ReturnStatus::Abort(Some(Sexpr::string("x")))
        );
    }

    #[test]
    fn test_bootstrap_replies_leave_queue_empty() {
        let (mut c, mut rx) = correlator();
        for (form, continuation) in protocol::bootstrap_sequence(&Default::default()) {
            c.submit(form, ThreadTag::Default, continuation).unwrap();
        }
        let mut ready = 0;
        for id in 1..=4 {
            let done = c
                .on_inbound(msg(&format!("(:return (:ok nil) {id})")))
                .unwrap()
                .unwrap();
            if done.continuation == Continuation::SessionReady {
                ready += 1;
            }
        }
        assert_eq!(ready, 1);
        assert_eq!(c.pending(), 0);
        assert_eq!(sent(&mut rx).len(), 4);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let (mut c, _rx) = correlator();
        let a = c
            .submit("(a)".into(), ThreadTag::Default, Continuation::Discard)
            .unwrap();
        c.on_inbound(msg("(:return (:ok nil) 1)")).unwrap();
        let b = c
            .submit("(b)".into(), ThreadTag::Default, Continuation::Discard)
            .unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_send_failure_is_reported() {
        let (mut c, rx) = correlator();
        drop(rx);
        let err = c
            .submit("(a)".into(), ThreadTag::Default, Continuation::Discard)
            .unwrap_err();
        assert!(err.completed.is_none());
    }

    #[test]
    fn test_send_failure_after_completion_keeps_completion() {
        let (mut c, mut rx) = correlator();
        c.submit("(a)".into(), ThreadTag::Default, Continuation::EvalComplete)
            .unwrap();
        c.submit("(b)".into(), ThreadTag::Default, Continuation::Discard)
            .unwrap();
        sent(&mut rx);
        drop(rx);

        let err = c.on_inbound(msg("(:return (:ok 1) 1)")).unwrap_err();
        let completed = err.completed.unwrap();
        assert_eq!(completed.id, 1);
        assert_eq!(completed.continuation, Continuation::EvalComplete);
    }
}
