use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use wireloom::protocol::flow::{self, BoxFut, Delivery, Pull, Push};
use wireloom::protocol::frame::{self, FrameKind, Header, Pattern, Signal};
use wireloom::protocol::session::{connect, SessionId};
use wireloom::socket::memory::socket_pair;
use wireloom::Task;

fn pull_from(items: Vec<Vec<u8>>) -> Pull {
    let queue = Arc::new(parking_lot::Mutex::new(VecDeque::from(items)));
    Box::new(move || -> BoxFut<Option<Vec<u8>>> {
        let queue = queue.clone();
        Box::pin(async move { queue.lock().pop_front() })
    })
}

/// A pull source that never yields, keeping the stream open until a
/// deadline decides the session's fate.
fn pull_pending() -> Pull {
    Box::new(|| Box::pin(std::future::pending()))
}

fn discard_push() -> Push {
    Box::new(|_delivery: Delivery| Box::pin(async { true }))
}

/// Scenario: the responder never acknowledges the INIT. The initiator
/// cancels with the handshake deadline reason, after emitting exactly
/// one SIG INIT with step 0 and body [0x00].
#[tokio::test]
async fn init_timeout_cancels_initiator() {
    let (initiator_socket, silent_peer) = socket_pair(16);
    let id = SessionId { key: 3, nonce: 1 };
    let task = Task::new();

    connect(
        initiator_socket,
        id,
        task.clone(),
        Duration::from_millis(100),
        Duration::from_millis(1_000),
        pull_pending(),
        discard_push(),
    )
    .await;

    assert_eq!(task.is_cancelled().as_deref(), Some("timeout: sig init"));

    // Exactly one frame was emitted: SIG, our key/nonce, step 0, INIT.
    let peer_task = Task::new();
    let bytes = timeout(
        Duration::from_millis(500),
        silent_peer.recv(|_| true, &peer_task),
    )
    .await
    .unwrap()
    .unwrap();
    let (header, payload) = Header::parse(&bytes).unwrap();
    assert_eq!(header, Header::new(FrameKind::Sig, 3, 1));
    assert_eq!(payload, &[0x00, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(frame::match_signal(Some(0), payload), Some((0, Signal::Init)));

    peer_task.deadline(Duration::from_millis(100), "no more frames");
    assert!(silent_peer.recv(|_| true, &peer_task).await.is_err());
}

/// Scenario: the responder acknowledges the handshake and the first two
/// messages, then goes silent. The initiator emits MSG#3, receives no
/// ACK, and cancels with the send-ack deadline reason.
#[tokio::test]
async fn missing_ack_cancels_stream() {
    let (initiator_socket, responder_socket) = socket_pair(32);
    let id = SessionId { key: 9, nonce: 2 };
    let task = Task::new();

    // Hand-rolled responder: ACK the INIT, then ACK only MSG 1 and 2.
    let responder = tokio::spawn(async move {
        let peer_task = Task::new();
        let (header, _, _) = flow::recv_signal(
            &responder_socket,
            Pattern::any().with_key(9),
            Some(0),
            Some(Signal::Init),
            &peer_task,
        )
        .await
        .unwrap();
        let sid = SessionId {
            key: 9,
            nonce: header.nonce,
        };
        flow::send_ack(&responder_socket, sid, 0).unwrap();

        let mut acked = Vec::new();
        for step in 1..=2u32 {
            let (_, got, _) = flow::recv_frame(
                &responder_socket,
                Pattern::of(FrameKind::Msg, 9, sid.nonce),
                Some(step),
                &peer_task,
            )
            .await
            .unwrap();
            flow::send_ack(&responder_socket, sid, got).unwrap();
            acked.push(got);
        }

        // MSG 3 arrives but is never acknowledged.
        let (_, third, _) = flow::recv_frame(
            &responder_socket,
            Pattern::of(FrameKind::Msg, 9, sid.nonce),
            Some(3),
            &peer_task,
        )
        .await
        .unwrap();
        (acked, third)
    });

    connect(
        initiator_socket,
        id,
        task.clone(),
        Duration::from_millis(150),
        Duration::from_millis(5_000),
        pull_from(vec![vec![1], vec![2], vec![3]]),
        discard_push(),
    )
    .await;

    assert_eq!(task.is_cancelled().as_deref(), Some("timeout: send ack"));

    let (acked, third) = responder.await.unwrap();
    assert_eq!(acked, vec![1, 2]);
    assert_eq!(third, 3);
}

/// The initiator's listen half enforces its own silence deadline once
/// the session is established.
#[tokio::test]
async fn listen_silence_kills_established_session() {
    let (initiator_socket, responder_socket) = socket_pair(32);
    let id = SessionId { key: 4, nonce: 6 };
    let task = Task::new();

    // The responder completes the handshake, then never sends.
    tokio::spawn(async move {
        let peer_task = Task::new();
        let got = flow::recv_signal(
            &responder_socket,
            Pattern::any().with_key(4),
            Some(0),
            Some(Signal::Init),
            &peer_task,
        )
        .await;
        if let Ok((header, _, _)) = got {
            let sid = SessionId {
                key: 4,
                nonce: header.nonce,
            };
            let _ = flow::send_ack(&responder_socket, sid, 0);
            // Hold the socket open without traffic.
            std::future::pending::<()>().await;
        }
    });

    connect(
        initiator_socket,
        id,
        task.clone(),
        Duration::from_millis(500),
        Duration::from_millis(100),
        pull_pending(),
        discard_push(),
    )
    .await;

    assert_eq!(task.is_cancelled().as_deref(), Some("timeout: listen"));
}
