//! Session establishment and teardown.
//!
//! [`connect`] drives the initiator half: it reserves the INIT
//! acknowledgement, emits `SIG INIT`, and once acknowledged runs the
//! outbound stream and inbound listen on their own multiplexed handles.
//! When the stream source is exhausted the session task is cleaned up,
//! `SIG TERM` goes out, and every session handle drops.
//!
//! [`channel`] drives the responder half as an accept loop: each
//! iteration awaits one `SIG INIT` on the route's accept socket,
//! acknowledges it under the nonce captured from the frame header, and
//! launches the session flows plus a TERM watch on fresh multiplexed
//! handles. Sessions run concurrently; the loop immediately returns to
//! accepting.
//!
//! Per-session state machine:
//!
//! ```text
//! WAIT_INIT ──init──▶ ACTIVE ──local exhaust──▶ HALF_CLOSED_LOCAL ──term──▶ CLOSED
//!     │                 │ │
//!  deadline             │ └──TERM received──▶ CLOSED
//!     ▼                 └──listen/ack deadline──▶ DEAD
//!    DEAD
//! ```
//!
//! `CLOSED` and `DEAD` both release the multiplexed handles and cancel
//! the session's subtasks.

use crate::error::SocketError;
use crate::protocol::counter::StepCounter;
use crate::protocol::flow::{self, Pull, Push};
use crate::protocol::frame::{self, FrameKind, Pattern, Signal};
use crate::socket::VirtualSocket;
use crate::task::Task;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Session identity: the route key plus the initiator-allocated nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub key: u16,
    pub nonce: u16,
}

/// Initiator half of a session.
///
/// `socket` is the session's main handle (the caller multiplexes it off
/// the connection socket); the inbound listen runs on a sibling handle
/// derived here. `pull` feeds the outbound stream; `push` receives
/// inbound deliveries.
pub async fn connect(
    socket: VirtualSocket,
    id: SessionId,
    task: Task,
    ack_deadline: Duration,
    silent_deadline: Duration,
    mut pull: Pull,
    mut push: Push,
) {
    let steps = StepCounter::new();
    let init_step = steps.claim();

    let guard = task.subtask();
    guard.deadline(ack_deadline, "sig init");
    // The ACK filter carries the nonce this side allocated; it is
    // reserved before the INIT leaves.
    let ack = flow::recv_frame(
        &socket,
        Pattern::of(FrameKind::Ack, id.key, id.nonce),
        Some(init_step),
        &guard,
    );
    if flow::send_signal(&socket, id, init_step, Signal::Init).is_err() {
        task.cancel("socket closed");
        socket.close();
        return;
    }
    debug!(key = id.key, nonce = id.nonce, "sig init sent");

    match ack.await {
        Ok(_) => guard.cleanup("sig init acked"),
        Err(SocketError::Cancelled(reason)) => {
            task.cancel(reason);
            socket.close();
            return;
        }
        Err(SocketError::Closed) => {
            task.cancel("socket closed");
            socket.close();
            return;
        }
    }
    debug!(key = id.key, nonce = id.nonce, "session established");

    // Active: inbound listen gets its own handle so its predicate never
    // competes with the stream's ACK filter.
    let listen_socket = socket.multiplex();
    let recv_steps = steps.clone();
    let listener = {
        let listen_socket = listen_socket.clone();
        let listen_task = task.clone();
        tokio::spawn(async move {
            flow::listen(
                &listen_socket,
                id,
                &listen_task,
                &recv_steps,
                silent_deadline,
                &mut push,
            )
            .await;
        })
    };

    flow::stream(&socket, id, &task, &steps, ack_deadline, &mut pull).await;

    if task.is_cancelled().is_none() {
        task.cleanup("connect stream finished");
        let term_step = steps.claim();
        let _ = flow::send_signal(&socket, id, term_step, Signal::Term);
        debug!(key = id.key, nonce = id.nonce, "sig term sent");
    }

    listen_socket.close();
    socket.close();
    let _ = listener.await;
}

/// Responder accept loop for one route.
///
/// `create_handle` is invoked once per accepted session with the fresh
/// session task and yields the pull/push pair backing it. The loop runs
/// until `task` resolves or the accept socket closes.
pub async fn channel<F>(
    socket: VirtualSocket,
    key: u16,
    task: Task,
    ack_deadline: Duration,
    silent_deadline: Duration,
    mut create_handle: F,
) where
    F: FnMut(Task) -> (Pull, Push) + Send,
{
    // Nonces with a live session; INITs repeating one of these are
    // stale duplicates, not new sessions.
    let active: Arc<Mutex<HashSet<u16>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        if task.is_cancelled().is_some() {
            return;
        }
        let session_task = task.subtask();
        let steps = StepCounter::new();
        let init_step = steps.claim();

        let guard = session_task.subtask();
        guard.deadline(silent_deadline, "sig init");

        // Await INIT on the accept socket itself: its inbox persists
        // across iterations, so an INIT arriving mid-setup buffers
        // instead of vanishing.
        let wanted = {
            let active = active.clone();
            let pattern = Pattern::any().with_kind(FrameKind::Sig).with_key(key);
            move |bytes: &[u8]| {
                pattern
                    .matches(bytes)
                    .and_then(|(header, payload)| {
                        frame::match_signal(Some(init_step), payload)
                            .map(|(_, signal)| (header, signal))
                    })
                    .is_some_and(|(header, signal)| {
                        signal == Signal::Init && !active.lock().contains(&header.nonce)
                    })
            }
        };
        let init = socket.recv(wanted, &guard).await;

        let header = match init {
            Ok(bytes) => match frame::Header::parse(&bytes) {
                Some((header, _)) => header,
                None => {
                    session_task.cancel("malformed init frame");
                    continue;
                }
            },
            Err(SocketError::Cancelled(reason)) => {
                session_task.cancel(reason.clone());
                if task.is_cancelled().is_some() {
                    return;
                }
                // Accept window expired without an INIT; re-arm.
                debug!(key, reason = %reason, "accept window recycled");
                continue;
            }
            Err(SocketError::Closed) => {
                session_task.cancel("socket closed");
                return;
            }
        };
        guard.cleanup("sig init received");

        // The responder's nonce is whatever the INIT header carried.
        let id = SessionId {
            key,
            nonce: header.nonce,
        };
        active.lock().insert(id.nonce);
        debug!(key, nonce = id.nonce, "session accepted");

        let (mut pull, mut push) = create_handle(session_task.clone());
        let recv_steps = steps.clone();

        // Session handles exist before the INIT ACK goes out, so no
        // session frame can outrun them.
        let listen_socket = socket.multiplex();
        let term_socket = socket.multiplex();
        let stream_socket = socket.multiplex();

        if socket
            .send(
                frame::Header::new(FrameKind::Ack, key, id.nonce)
                    .brand(&frame::brand_step(init_step, &[])),
            )
            .is_err()
        {
            warn!(key, nonce = id.nonce, "accept socket closed before init ack");
            session_task.cancel("socket closed");
            listen_socket.close();
            term_socket.close();
            stream_socket.close();
            active.lock().remove(&id.nonce);
            return;
        }

        // Inbound flow.
        {
            let listen_socket = listen_socket.clone();
            let listen_task = session_task.clone();
            tokio::spawn(async move {
                flow::listen(
                    &listen_socket,
                    id,
                    &listen_task,
                    &recv_steps,
                    silent_deadline,
                    &mut push,
                )
                .await;
            });
        }

        // Remote teardown watch: a TERM under this nonce, any step.
        {
            let term_socket = term_socket.clone();
            let term_task = session_task.clone();
            tokio::spawn(async move {
                let got = flow::recv_signal(
                    &term_socket,
                    Pattern::any().with_key(key).with_nonce(id.nonce),
                    None,
                    Some(Signal::Term),
                    &term_task,
                )
                .await;
                if got.is_ok() {
                    debug!(key, nonce = id.nonce, "sig term received");
                    term_task.cleanup("sig term received");
                }
            });
        }

        // Outbound flow and local completion.
        {
            let stream_socket = stream_socket.clone();
            let stream_task = session_task.clone();
            tokio::spawn(async move {
                flow::stream(
                    &stream_socket,
                    id,
                    &stream_task,
                    &steps,
                    ack_deadline,
                    &mut pull,
                )
                .await;
                if stream_task.is_cancelled().is_none() {
                    stream_task.cleanup("channel stream finished");
                }
            });
        }

        // Supervisor: release the session handles once it resolves.
        {
            let supervisor = session_task.clone();
            let active = active.clone();
            tokio::spawn(async move {
                let reason = supervisor.cancelled().await;
                debug!(key, nonce = id.nonce, reason = %reason, "session closed");
                listen_socket.close();
                term_socket.close();
                stream_socket.close();
                active.lock().remove(&id.nonce);
            });
        }
    }
}
