//! Error taxonomy for the runtime.
//!
//! Each layer owns a small typed error: queues raise terminal errors
//! synchronously, sockets surface cancellation to awaiting consumers,
//! codecs report boundary failures that the runtime suppresses, and the
//! route layer raises fatal configuration errors at bind/start time.

use thiserror::Error;

/// Terminal queue errors.
///
/// Once a queue has been dropped, every interaction raises `Closed`
/// synchronously; a pending waiter is rejected with the same error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue was dropped; no further push/take/flush is possible.
    #[error("queue closed")]
    Closed,

    /// `connect_push` was called on a queue that already has a sink.
    #[error("queue already connected to a sink")]
    AlreadyConnected,

    /// `connect_push` was called while take/flush waiters were queued.
    #[error("queue has pending waiters")]
    WaitersPending,

    /// `take` or `flush` on a queue whose pushes route through a sink.
    #[error("operation not available on a connected queue")]
    Connected,
}

/// Errors surfaced by socket receive paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SocketError {
    /// The socket handle (or its inbox) was dropped.
    #[error("socket closed")]
    Closed,

    /// The task bound to the receive resolved before a frame matched.
    /// Deadline-driven cancellations carry a `timeout: ` reason prefix.
    #[error("Task cancelled: {0}")]
    Cancelled(String),
}

/// Codec boundary failures.
///
/// Decode errors are suppressed by the runtime: the frame is dropped and
/// the failure logged, never propagated into the session.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[source] anyhow::Error),

    #[error("decode failed: {0}")]
    Decode(#[source] anyhow::Error),
}

/// Fatal route configuration errors, raised at bind or start time.
#[derive(Debug, Error)]
pub enum RouteError {
    /// A key was registered twice on the same router.
    #[error("route key {0:#06x} already registered")]
    DuplicateKey(u16),

    /// A single `Route` object was bound a second time.
    #[error("route key {0:#06x} already bound")]
    AlreadyBound(u16),

    /// A route issued by a different router was passed in.
    #[error("route key {0:#06x} belongs to a different router")]
    ForeignRoute(u16),

    /// `start` was called while a route still had no binding.
    #[error("route key {0:#06x} has no binding")]
    Unbound(u16),

    /// A caller was used before its router was started.
    #[error("router not started")]
    NotStarted,
}

/// Errors surfaced to application callers on the typed route surface.
#[derive(Debug, Error)]
pub enum CallError {
    /// The service queue was full; the message was not enqueued.
    #[error("Failed to send")]
    SendFailed,

    /// The session resolved before the expected reply arrived.
    #[error("session failed: {0}")]
    SessionFailed(String),

    /// Route-level misconfiguration (unstarted router, etc.).
    #[error(transparent)]
    Route(#[from] RouteError),
}
