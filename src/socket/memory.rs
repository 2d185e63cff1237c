//! In-memory transport: two cross-connected virtual sockets.
//!
//! Frame delivery is immediate and ordered, which makes this the
//! reference transport for tests and for same-process endpoint pairs.

use super::VirtualSocket;

/// Build two virtual sockets whose outboxes feed each other's inboxes.
///
/// Everything sent on one side is delivered, in order, to every inbox
/// of the other side.
pub fn socket_pair(capacity: usize) -> (VirtualSocket, VirtualSocket) {
    let a = VirtualSocket::new(capacity);
    let b = VirtualSocket::new(capacity);

    let to_b = b.clone();
    a.connect_sink(Box::new(move |frame| {
        to_b.deliver(frame);
        true
    }))
    .expect("fresh outbox accepts a sink");

    let to_a = a.clone();
    b.connect_sink(Box::new(move |frame| {
        to_a.deliver(frame);
        true
    }))
    .expect("fresh outbox accepts a sink");

    (a, b)
}
