//! End-to-end session tests against a scripted SWANK server on loopback.

use std::time::Duration;

use minerva_swank::{
    ConnectionState, FrameReader, ProcessState, SessionError, SessionNotification, SwankClient,
    SwankConfig, WireMessage, encode,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

struct FakeServer {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl FakeServer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FrameReader::new(read_half),
            writer: write_half,
        }
    }

    /// Next frame sent by the client.
    async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    async fn send(&mut self, text: &str) {
        self.writer.write_all(&encode(text).unwrap()).await.unwrap();
    }

    /// Reply `(:ok nil)` to the next request and return it.
    async fn answer(&mut self) -> WireMessage {
        let frame = self.recv().await;
        let request = WireMessage::parse(frame).unwrap();
        assert!(request.is(":emacs-rex"), "unexpected frame {}", request.raw());
        let id = request.last().and_then(|id| id.as_int()).unwrap();
        self.send(&format!("(:return (:ok nil) {id})")).await;
        request
    }
}

fn config_for(port: u16) -> SwankConfig {
    SwankConfig {
        port,
        connect_attempts: 5,
        connect_backoff_ms: 10,
        ..SwankConfig::default()
    }
}

/// Poll the client until `done` accepts the notifications gathered so far.
async fn poll_until(
    client: &mut SwankClient,
    mut done: impl FnMut(&[SessionNotification]) -> bool,
) -> Vec<SessionNotification> {
    let mut seen = Vec::new();
    for _ in 0..500 {
        seen.extend(client.poll_events(64));
        if done(&seen) {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached; saw {seen:?}");
}

async fn ready_session() -> (SwankClient, FakeServer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut client = SwankClient::new(config_for(port));
    client.start_session(None, None).unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connecting);

    let handshake = tokio::spawn(async move {
        let mut server = FakeServer::accept(&listener).await;
        let mut forms = Vec::new();
        for _ in 0..4 {
            forms.push(server.answer().await.raw().to_string());
        }
        (server, forms)
    });

    let seen = poll_until(&mut client, |seen| {
        seen.contains(&SessionNotification::SessionReady)
    })
    .await;
    assert_eq!(
        seen.iter()
            .filter(|n| **n == SessionNotification::SessionReady)
            .count(),
        1
    );

    let (server, forms) = handshake.await.unwrap();
    assert!(forms[0].contains("swank:connection-info"));
    assert!(forms[1].contains("swank:swank-require"));
    assert!(forms[2].contains("swank:init-presentations"));
    assert!(forms[3].contains("swank-repl:create-repl"));
    (client, server)
}

#[tokio::test]
async fn bootstrap_signals_ready_exactly_once() {
    let (mut client, _server) = ready_session().await;
    assert!(client.is_ready());
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(client.process_state(), ProcessState::NotStarted);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.poll_events(64).is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn evaluation_collects_printed_output() {
    let (mut client, mut server) = ready_session().await;

    let id = client.evaluate("(progn (print 42) (+ 1 2))").unwrap();
    let script = tokio::spawn(async move {
        let request = server.recv().await;
        server.send(r#"(:write-string "42" nil 9)"#).await;
        let ack = server.recv().await;
        server.send("(:ping 2 11)").await;
        let pong = server.recv().await;
        server.send(r#"(:write-string "3" :repl-result)"#).await;
        server.send(&format!("(:return (:ok nil) {id})")).await;
        (server, request, ack, pong)
    });

    let seen = poll_until(&mut client, |seen| {
        seen.iter()
            .any(|n| matches!(n, SessionNotification::EvalComplete(_)))
    })
    .await;
    let (_server, request, ack, pong) = script.await.unwrap();
    assert_eq!(
        request,
        format!(
            r#"(:emacs-rex (swank-repl:listener-eval "(progn (print 42) (+ 1 2))") "COMMON-LISP-USER" :repl-thread {id})"#
        )
    );
    assert_eq!(ack, "(:write-done 9)");
    assert_eq!(pong, "(:emacs-pong 2 11)");

    let outputs: Vec<_> = seen
        .iter()
        .filter_map(|n| match n {
            SessionNotification::EvalComplete(output) => Some(output),
            _ => None,
        })
        .collect();
    assert_eq!(outputs.len(), 1);
    assert_eq!(outputs[0].id(), id);
    assert!(!outputs[0].is_aborted());
    assert_eq!(outputs[0].text(), "423");
    assert_eq!(client.pending_requests(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn queued_evaluations_are_sent_one_at_a_time() {
    let (mut client, mut server) = ready_session().await;

    let first = client.evaluate("1").unwrap();
    let second = client.evaluate("2").unwrap();
    assert_eq!(second, first + 1);
    assert_eq!(client.pending_requests(), 2);

    let frame = server.recv().await;
    assert!(frame.ends_with(&format!(" {first})")));
    let early = tokio::time::timeout(Duration::from_millis(100), server.recv()).await;
    assert!(early.is_err(), "second request sent before first completed");
    client.shutdown().await;
}

#[tokio::test]
async fn aborted_evaluation_still_completes() {
    let (mut client, mut server) = ready_session().await;

    let id = client.evaluate("(error \"boom\")").unwrap();
    server.recv().await;
    server.send(r#"(:write-string "partial" nil)"#).await;
    server.send(&format!(r#"(:return (:abort "boom") {id})"#)).await;

    let seen = poll_until(&mut client, |seen| {
        seen.iter()
            .any(|n| matches!(n, SessionNotification::EvalComplete(_)))
    })
    .await;
    let Some(SessionNotification::EvalComplete(output)) = seen.last() else {
        panic!("expected EvalComplete, got {seen:?}");
    };
    assert!(output.is_aborted());
    assert_eq!(output.text(), "partial");
    client.shutdown().await;
}

#[tokio::test]
async fn server_close_mid_eval_reports_connection_lost() {
    let (mut client, mut server) = ready_session().await;

    client.evaluate("(sleep 60)").unwrap();
    server.recv().await;
    drop(server);

    let seen = poll_until(&mut client, |seen| {
        seen.iter()
            .any(|n| matches!(n, SessionNotification::ConnectionLost(_)))
    })
    .await;
    assert!(
        !seen
            .iter()
            .any(|n| matches!(n, SessionNotification::EvalComplete(_)))
    );
    assert!(!client.is_ready());
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(matches!(
        client.evaluate("1"),
        Err(SessionError::NotConnected)
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn unreachable_server_fails_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut client = SwankClient::new(SwankConfig {
        connect_attempts: 3,
        connect_backoff_ms: 0,
        ..config_for(port)
    });
    client.start_session(None, None).unwrap();

    let seen = poll_until(&mut client, |seen| {
        seen.iter()
            .any(|n| matches!(n, SessionNotification::SessionFailed(_)))
    })
    .await;
    assert_eq!(seen.len(), 1);
    assert_eq!(client.connection_state(), ConnectionState::Failed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(client.poll_events(64).is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn evaluate_before_ready_is_rejected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut client = SwankClient::new(config_for(port));
    client.start_session(None, None).unwrap();
    // Starting again while connecting is a no-op.
    client.start_session(None, None).unwrap();

    let _server = FakeServer::accept(&listener).await;
    for _ in 0..100 {
        client.poll_events(64);
        if client.connection_state() == ConnectionState::Connected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(matches!(
        client.evaluate("(+ 1 2)"),
        Err(SessionError::NotReady)
    ));
    client.shutdown().await;
}
