//! Runtime configuration.
//!
//! A single flat struct carries every tunable the protocol recognizes.
//! Defaults are defined once in [`crate::defaults`] and applied by the
//! `Default` impl; a route may carry its own override (see
//! [`crate::route::Route::set_config`]).

use crate::codec::WireCodec;
use crate::defaults;
use std::time::Duration;

/// Protocol timing and capacity configuration.
///
/// Deadlines are cooperative: each arms a cancellation on the relevant
/// session task with a `timeout: ` reason rather than forcibly aborting
/// I/O.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Maximum time a sender waits for the per-message ACK before the
    /// session is declared dead.
    pub ack_deadline: Duration,

    /// Maximum inter-message silence the responder tolerates on its
    /// inbound stream.
    pub client_silent_deadline: Duration,

    /// Symmetric silence deadline observed by the initiator.
    pub server_silent_deadline: Duration,

    /// Depth of every virtual socket inbox and of the shared outbox.
    pub socket_capacity: usize,

    /// Payload codec used by the typed route surface.
    pub codec: WireCodec,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_deadline: defaults::ACK_DEADLINE,
            client_silent_deadline: defaults::CLIENT_SILENT_DEADLINE,
            server_silent_deadline: defaults::SERVER_SILENT_DEADLINE,
            socket_capacity: defaults::SOCKET_CAPACITY,
            codec: WireCodec::default(),
        }
    }
}

impl ProtocolConfig {
    /// Override the ACK deadline.
    pub fn with_ack_deadline(mut self, deadline: Duration) -> Self {
        self.ack_deadline = deadline;
        self
    }

    /// Override the responder-side silence deadline.
    pub fn with_client_silent_deadline(mut self, deadline: Duration) -> Self {
        self.client_silent_deadline = deadline;
        self
    }

    /// Override the initiator-side silence deadline.
    pub fn with_server_silent_deadline(mut self, deadline: Duration) -> Self {
        self.server_silent_deadline = deadline;
        self
    }

    /// Override the socket inbox/outbox depth.
    pub fn with_socket_capacity(mut self, capacity: usize) -> Self {
        self.socket_capacity = capacity;
        self
    }

    /// Override the payload codec.
    pub fn with_codec(mut self, codec: WireCodec) -> Self {
        self.codec = codec;
        self
    }
}
