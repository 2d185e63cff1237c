//! Sequenced data flow: the sender (`stream`) and receiver (`listen`)
//! halves of a session, plus the filtered receive / raw send primitives
//! they are built from.
//!
//! The sender claims a step per message, arms an ACK receive under a
//! deadline subtask before the MSG leaves, and only pulls the next
//! payload once the ACK for the previous step arrived. The receiver
//! awaits contiguous ascending steps under a silence deadline, delivers
//! the payload, and emits the ACK after delivery. Mismatched steps are
//! skipped by the receive predicate and never acknowledged.

use crate::error::SocketError;
use crate::protocol::counter::StepCounter;
use crate::protocol::frame::{self, FrameKind, Header, Pattern, Signal};
use crate::protocol::session::SessionId;
use crate::socket::VirtualSocket;
use crate::task::{RaceOutcome, Task};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Boxed future used by the pull/push callbacks.
pub type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Produces the next outbound payload; `None` ends the stream.
pub type Pull = Box<dyn FnMut() -> BoxFut<Option<Vec<u8>>> + Send>;

/// One inbound delivery handed to the consumer.
#[derive(Debug)]
pub enum Delivery {
    /// An in-order payload.
    Payload(Vec<u8>),
    /// The listen loop failed; carries the cancellation reason.
    Failed(String),
}

/// Consumes inbound deliveries; returns whether the payload was
/// accepted.
pub type Push = Box<dyn FnMut(Delivery) -> BoxFut<bool> + Send>;

/// Await the next frame matching `pattern` whose payload carries the
/// expected step. Bound to `task` for cancellation.
pub async fn recv_frame(
    socket: &VirtualSocket,
    pattern: Pattern,
    expect_step: Option<u32>,
    task: &Task,
) -> Result<(Header, u32, Vec<u8>), SocketError> {
    let bytes = socket
        .recv(
            move |frame| {
                pattern
                    .matches(frame)
                    .and_then(|(_, payload)| frame::match_step(expect_step, payload))
                    .is_some()
            },
            task,
        )
        .await?;
    // The predicate guaranteed this shape.
    match pattern
        .matches(&bytes)
        .and_then(|(header, payload)| {
            frame::match_step(expect_step, payload)
                .map(|(step, body)| (header, step, body.to_vec()))
        }) {
        Some(parsed) => Ok(parsed),
        None => Err(SocketError::Closed),
    }
}

/// Await the next SIG frame matching `pattern`, its step, and the
/// wanted signal code.
pub async fn recv_signal(
    socket: &VirtualSocket,
    pattern: Pattern,
    expect_step: Option<u32>,
    want: Option<Signal>,
    task: &Task,
) -> Result<(Header, u32, Signal), SocketError> {
    let pattern = pattern.with_kind(FrameKind::Sig);
    let bytes = socket
        .recv(
            move |frame| {
                pattern
                    .matches(frame)
                    .and_then(|(_, payload)| frame::match_signal(expect_step, payload))
                    .is_some_and(|(_, signal)| want.is_none() || want == Some(signal))
            },
            task,
        )
        .await?;
    match pattern.matches(&bytes).and_then(|(header, payload)| {
        frame::match_signal(expect_step, payload).map(|(step, signal)| (header, step, signal))
    }) {
        Some(parsed) => Ok(parsed),
        None => Err(SocketError::Closed),
    }
}

/// Emit a step-branded MSG frame.
pub fn send_msg(
    socket: &VirtualSocket,
    id: SessionId,
    step: u32,
    body: &[u8],
) -> Result<(), SocketError> {
    socket.send(Header::new(FrameKind::Msg, id.key, id.nonce).brand(&frame::brand_step(step, body)))
}

/// Emit an ACK for `step`; the body is empty.
pub fn send_ack(socket: &VirtualSocket, id: SessionId, step: u32) -> Result<(), SocketError> {
    socket.send(Header::new(FrameKind::Ack, id.key, id.nonce).brand(&frame::brand_step(step, &[])))
}

/// Emit a SIG frame carrying `signal` at `step`.
pub fn send_signal(
    socket: &VirtualSocket,
    id: SessionId,
    step: u32,
    signal: Signal,
) -> Result<(), SocketError> {
    socket
        .send(Header::new(FrameKind::Sig, id.key, id.nonce).brand(&frame::brand_signal(step, signal)))
}

/// Sender half of a session.
///
/// Pulls payloads until the source is exhausted (`None`) or the task
/// resolves. Each MSG must be acknowledged with its own step within
/// `ack_deadline` before the next payload is pulled; a missed ACK
/// cancels the session task with the deadline reason.
pub async fn stream(
    socket: &VirtualSocket,
    id: SessionId,
    task: &Task,
    steps: &StepCounter,
    ack_deadline: Duration,
    pull: &mut Pull,
) {
    loop {
        if task.is_cancelled().is_some() {
            return;
        }
        let source = task.subtask();
        let payload = match source.race(pull()).await {
            RaceOutcome::Value(Some(payload)) => payload,
            RaceOutcome::Value(None) => {
                debug!(key = id.key, nonce = id.nonce, "stream source exhausted");
                return;
            }
            RaceOutcome::Cancelled(_) => return,
        };

        let step = steps.claim();
        let ack_watch = task.subtask();
        ack_watch.deadline(ack_deadline, "send ack");
        // The ACK filter is reserved before the MSG leaves.
        let ack = recv_frame(
            socket,
            Pattern::of(FrameKind::Ack, id.key, id.nonce),
            Some(step),
            &ack_watch,
        );
        if send_msg(socket, id, step, &payload).is_err() {
            ack_watch.cleanup("socket closed");
            task.cancel("socket closed");
            return;
        }
        debug!(key = id.key, nonce = id.nonce, step, "msg sent");

        match ack.await {
            Ok(_) => {
                ack_watch.cleanup("send acked");
                debug!(key = id.key, nonce = id.nonce, step, "msg acked");
            }
            Err(SocketError::Cancelled(reason)) => {
                task.cancel(reason);
                return;
            }
            Err(SocketError::Closed) => {
                task.cancel("socket closed");
                return;
            }
        }
    }
}

/// Receiver half of a session.
///
/// Claims the next expected step, awaits its MSG under the silence
/// deadline, delivers the payload, and acknowledges it. On deadline or
/// cancellation the consumer is handed a [`Delivery::Failed`] and the
/// session task cancels.
pub async fn listen(
    socket: &VirtualSocket,
    id: SessionId,
    task: &Task,
    steps: &StepCounter,
    silent_deadline: Duration,
    push: &mut Push,
) {
    loop {
        if task.is_cancelled().is_some() {
            return;
        }
        let step = steps.claim();
        let silence = task.subtask();
        silence.deadline(silent_deadline, "listen");

        match recv_frame(
            socket,
            Pattern::of(FrameKind::Msg, id.key, id.nonce),
            Some(step),
            &silence,
        )
        .await
        {
            Ok((_, _, body)) => {
                silence.cleanup("msg received");
                let accepted = push(Delivery::Payload(body)).await;
                if accepted {
                    // The ACK follows the delivery, never precedes it.
                    if send_ack(socket, id, step).is_err() {
                        task.cancel("socket closed");
                        return;
                    }
                    debug!(key = id.key, nonce = id.nonce, step, "msg delivered and acked");
                } else {
                    // No retransmit exists; withholding the ACK lets the
                    // peer's deadline end the session.
                    warn!(
                        key = id.key,
                        nonce = id.nonce,
                        step,
                        "consumer rejected payload, ack withheld"
                    );
                }
            }
            Err(SocketError::Cancelled(reason)) => {
                let _ = push(Delivery::Failed(reason.clone())).await;
                task.cancel(reason);
                return;
            }
            Err(SocketError::Closed) => {
                let _ = push(Delivery::Failed("socket closed".to_string())).await;
                task.cancel("socket closed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::memory::socket_pair;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    const ID: SessionId = SessionId {
        key: 7,
        nonce: 3,
    };

    fn pull_from(items: Vec<Vec<u8>>) -> Pull {
        let queue = Arc::new(parking_lot::Mutex::new(std::collections::VecDeque::from(
            items,
        )));
        Box::new(move || -> BoxFut<Option<Vec<u8>>> {
            let queue = queue.clone();
            Box::pin(async move { queue.lock().pop_front() })
        })
    }

    fn push_into() -> (Push, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let push: Push = Box::new(move |delivery| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(delivery);
                true
            })
        });
        (push, rx)
    }

    #[tokio::test]
    async fn test_stream_waits_for_each_ack() {
        let (local, remote) = socket_pair(16);
        let task = Task::new();
        let steps = StepCounter::starting_at(1);
        let mut pull = pull_from(vec![vec![0xaa], vec![0xbb]]);

        let peer = tokio::spawn(async move {
            let peer_task = Task::new();
            let mut seen = Vec::new();
            for expect in 1..=2u32 {
                let (_, step, body) = recv_frame(
                    &remote,
                    Pattern::of(FrameKind::Msg, ID.key, ID.nonce),
                    Some(expect),
                    &peer_task,
                )
                .await
                .unwrap();
                seen.push((step, body));
                send_ack(&remote, ID, step).unwrap();
            }
            seen
        });

        stream(
            &local,
            ID,
            &task,
            &steps,
            Duration::from_millis(500),
            &mut pull,
        )
        .await;

        // Exhausted normally: the task was not cancelled.
        assert_eq!(task.is_cancelled(), None);
        let seen = peer.await.unwrap();
        assert_eq!(seen, vec![(1, vec![0xaa]), (2, vec![0xbb])]);
    }

    #[tokio::test]
    async fn test_stream_cancels_on_missing_ack() {
        let (local, remote) = socket_pair(16);
        let task = Task::new();
        let steps = StepCounter::starting_at(1);
        let mut pull = pull_from(vec![vec![1], vec![2], vec![3]]);

        // The peer acknowledges only the first two messages.
        let peer = tokio::spawn(async move {
            let peer_task = Task::new();
            for expect in 1..=2u32 {
                let (_, step, _) = recv_frame(
                    &remote,
                    Pattern::of(FrameKind::Msg, ID.key, ID.nonce),
                    Some(expect),
                    &peer_task,
                )
                .await
                .unwrap();
                send_ack(&remote, ID, step).unwrap();
            }
            remote
        });

        stream(
            &local,
            ID,
            &task,
            &steps,
            Duration::from_millis(100),
            &mut pull,
        )
        .await;

        assert_eq!(task.is_cancelled().as_deref(), Some("timeout: send ack"));
        drop(peer);
    }

    #[tokio::test]
    async fn test_listen_delivers_in_order_and_acks() {
        let (local, remote) = socket_pair(16);
        let task = Task::new();
        let steps = StepCounter::starting_at(1);
        let (mut push, mut delivered) = push_into();

        let listener = {
            let local = local.clone();
            let task = task.clone();
            tokio::spawn(async move {
                listen(
                    &local,
                    ID,
                    &task,
                    &steps,
                    Duration::from_millis(500),
                    &mut push,
                )
                .await;
            })
        };

        send_msg(&remote, ID, 1, &[0x11]).unwrap();
        send_msg(&remote, ID, 2, &[0x22]).unwrap();

        let ack_task = Task::new();
        for expect in 1..=2u32 {
            let (_, step, _) = recv_frame(
                &remote,
                Pattern::of(FrameKind::Ack, ID.key, ID.nonce),
                Some(expect),
                &ack_task,
            )
            .await
            .unwrap();
            assert_eq!(step, expect);
        }

        match delivered.recv().await.unwrap() {
            Delivery::Payload(body) => assert_eq!(body, vec![0x11]),
            other => panic!("unexpected delivery: {other:?}"),
        }
        match delivered.recv().await.unwrap() {
            Delivery::Payload(body) => assert_eq!(body, vec![0x22]),
            other => panic!("unexpected delivery: {other:?}"),
        }

        task.cancel("test over");
        let _ = listener.await;
    }

    #[tokio::test]
    async fn test_listen_skips_out_of_step_messages() {
        let (local, remote) = socket_pair(16);
        let task = Task::new();
        let steps = StepCounter::starting_at(1);
        let (mut push, mut delivered) = push_into();

        let listener = {
            let local = local.clone();
            let task = task.clone();
            tokio::spawn(async move {
                listen(
                    &local,
                    ID,
                    &task,
                    &steps,
                    Duration::from_millis(500),
                    &mut push,
                )
                .await;
            })
        };

        // A stray future step arrives first; it must be neither
        // delivered nor acknowledged.
        send_msg(&remote, ID, 9, &[0x99]).unwrap();
        send_msg(&remote, ID, 1, &[0x01]).unwrap();

        let ack_task = Task::new();
        let (_, step, _) = recv_frame(
            &remote,
            Pattern::of(FrameKind::Ack, ID.key, ID.nonce),
            None,
            &ack_task,
        )
        .await
        .unwrap();
        assert_eq!(step, 1);

        match delivered.recv().await.unwrap() {
            Delivery::Payload(body) => assert_eq!(body, vec![0x01]),
            other => panic!("unexpected delivery: {other:?}"),
        }
        assert!(delivered.try_recv().is_err());

        task.cancel("test over");
        let _ = listener.await;
    }

    #[tokio::test]
    async fn test_listen_times_out_on_silence() {
        let (local, _remote) = socket_pair(16);
        let task = Task::new();
        let steps = StepCounter::starting_at(1);
        let (mut push, mut delivered) = push_into();

        listen(
            &local,
            ID,
            &task,
            &steps,
            Duration::from_millis(50),
            &mut push,
        )
        .await;

        assert_eq!(task.is_cancelled().as_deref(), Some("timeout: listen"));
        match timeout(Duration::from_millis(100), delivered.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Delivery::Failed(reason) => assert_eq!(reason, "timeout: listen"),
            other => panic!("unexpected delivery: {other:?}"),
        }
    }
}
