//! # Wireloom
//!
//! A bidirectional RPC runtime that multiplexes many logical streams of
//! five interaction shapes (unary request/reply, send-channel, one-way
//! stream, listen, and duplex) over a single ordered, framed message
//! transport. Either endpoint may initiate any route; acknowledgement,
//! deadlines, cancellation, and bounded buffering are built in.
//!
//! ## Layering
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ route:    typed callers / responder bindings  │
//! ├───────────────────────────────────────────────┤
//! │ endpoint: Service <-> protocol via the codec  │
//! ├───────────────────────────────────────────────┤
//! │ protocol: frames, steps, sessions, ACKs       │
//! ├───────────────────────────────────────────────┤
//! │ socket:   multiplexing fan-out over one wire  │
//! ├───────────────────────────────────────────────┤
//! │ queue / task: bounded buffers, cancellation   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Transports plug in at the bottom: anything that can feed ordered
//! binary frames into a [`socket::VirtualSocket`] (see
//! [`socket::memory`] and [`socket::tcp`]) carries the whole stack.

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod route;
pub mod service;
pub mod socket;
pub mod task;

pub use codec::{BincodeCodec, Codec, JsonCodec, WireCodec};
pub use config::ProtocolConfig;
pub use endpoint::{Endpoint, Initiate};
pub use error::{CallError, CodecError, QueueError, RouteError, SocketError};
pub use queue::{CircularQueue, ConnectableQueue};
pub use route::{Route, Router, RouterHandle};
pub use service::Service;
pub use socket::VirtualSocket;
pub use task::{PollStep, RaceOutcome, Task};

/// The current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// Maximum time a sender waits for a per-message ACK.
    pub const ACK_DEADLINE: Duration = Duration::from_millis(5_000);

    /// Maximum inbound silence tolerated by the responder.
    pub const CLIENT_SILENT_DEADLINE: Duration = Duration::from_millis(30_000);

    /// Maximum inbound silence tolerated by the initiator.
    pub const SERVER_SILENT_DEADLINE: Duration = Duration::from_millis(30_000);

    /// Depth of socket inboxes and the shared outbox.
    pub const SOCKET_CAPACITY: usize = 64;
}
