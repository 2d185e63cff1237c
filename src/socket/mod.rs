//! # Virtual Socket Layer
//!
//! This module provides the multiplexing fan-out socket that turns one
//! framed transport into many logical consumers. It defines the socket
//! surface the protocol layer is written against and the adapter seams
//! concrete transports plug into.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  deliver()   ┌──────────────────────────┐
//! │ Transport  │─────────────▶│ inbox per multiplex handle│──▶ recv()
//! │  adapter   │              │                          │
//! │            │◀─────────────│ shared ConnectableQueue  │◀── send()
//! └────────────┘ connect_sink │         outbox           │
//!                             └──────────────────────────┘
//! ```
//!
//! Every inbound frame is broadcast into each live inbox; a consumer's
//! `recv` polls its own inbox until its predicate matches, so sibling
//! handles never contend for frames. Outbound frames share one outbox:
//! before a transport sink is connected they buffer up to the configured
//! capacity, and drain in order at connect time.
//!
//! Adapter responsibilities:
//! - inbound binary frame → [`VirtualSocket::deliver`]
//! - outbound drain → [`VirtualSocket::connect_sink`]
//! - transport close → [`VirtualSocket::drop_all`]

use crate::error::SocketError;
use crate::queue::{CircularQueue, ConnectableQueue, PushSink};
use crate::task::Task;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub mod memory;
pub mod tcp;

struct SocketShared {
    capacity: usize,
    outbox: ConnectableQueue<Vec<u8>>,
    inboxes: Mutex<HashMap<u64, Arc<CircularQueue<Vec<u8>>>>>,
    next_inbox: AtomicU64,
    closed_flag: AtomicBool,
    /// Capacity-1 signal resolved when the last handle drops. Re-armed
    /// after each observer so every sibling waiter resolves.
    closed: CircularQueue<()>,
}

/// Multiplexing socket handle.
///
/// A handle owns one inbox; [`VirtualSocket::multiplex`] derives a
/// sibling with a private inbox over the same outbox and transport.
/// Dropping a handle removes only its inbox; the outbox cascades shut
/// when the last inbox goes.
pub struct VirtualSocket {
    shared: Arc<SocketShared>,
    inbox_id: u64,
}

impl Clone for VirtualSocket {
    /// Clones share the same inbox. Use [`VirtualSocket::multiplex`]
    /// for an independent consumer.
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            inbox_id: self.inbox_id,
        }
    }
}

impl VirtualSocket {
    /// Create a socket with one inbox and an unconnected outbox, both
    /// bounded at `capacity`.
    pub fn new(capacity: usize) -> Self {
        let shared = Arc::new(SocketShared {
            capacity,
            outbox: ConnectableQueue::new(capacity),
            inboxes: Mutex::new(HashMap::new()),
            next_inbox: AtomicU64::new(1),
            closed_flag: AtomicBool::new(false),
            closed: CircularQueue::new(1),
        });
        let inbox_id = shared.next_inbox.fetch_add(1, Ordering::Relaxed);
        shared
            .inboxes
            .lock()
            .insert(inbox_id, Arc::new(CircularQueue::new(capacity)));
        Self { shared, inbox_id }
    }

    /// Enqueue bytes for transmission. Never blocks the caller.
    ///
    /// If the outbox is full before a transport sink is connected, the
    /// frame is dropped with a warning.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), SocketError> {
        match self.shared.outbox.push(bytes) {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("outbox full, outbound frame dropped");
                Ok(())
            }
            Err(_) => Err(SocketError::Closed),
        }
    }

    /// Await the next inbound frame matching `predicate`.
    ///
    /// Frames this consumer's predicate rejects are discarded from its
    /// inbox (siblings hold their own copies). Cancellable by `task`,
    /// surfacing the resolution reason.
    pub async fn recv<P>(&self, mut predicate: P, task: &Task) -> Result<Vec<u8>, SocketError>
    where
        P: FnMut(&[u8]) -> bool + Send,
    {
        let inbox = self.inbox().ok_or(SocketError::Closed)?;
        loop {
            tokio::select! {
                taken = inbox.take() => match taken {
                    Ok(bytes) => {
                        if predicate(&bytes) {
                            return Ok(bytes);
                        }
                        debug!(len = bytes.len(), "frame skipped by recv predicate");
                    }
                    Err(_) => return Err(SocketError::Closed),
                },
                reason = task.cancelled() => {
                    return Err(SocketError::Cancelled(reason));
                }
            }
        }
    }

    /// Derive a sibling handle with its own inbox.
    ///
    /// The new inbox is registered atomically: it observes every frame
    /// delivered after this call returns.
    pub fn multiplex(&self) -> VirtualSocket {
        let inbox_id = self.shared.next_inbox.fetch_add(1, Ordering::Relaxed);
        let inbox = Arc::new(CircularQueue::new(self.shared.capacity));
        if self.shared.closed_flag.load(Ordering::Acquire) {
            inbox.close();
        } else {
            self.shared.inboxes.lock().insert(inbox_id, inbox);
        }
        VirtualSocket {
            shared: self.shared.clone(),
            inbox_id,
        }
    }

    /// Release this handle's inbox.
    ///
    /// When the last inbox goes, the outbox is dropped too and the
    /// closed signal resolves.
    pub fn close(&self) {
        let last = {
            let mut inboxes = self.shared.inboxes.lock();
            if let Some(inbox) = inboxes.remove(&self.inbox_id) {
                inbox.close();
            }
            inboxes.is_empty()
        };
        if last {
            self.cascade_close();
        }
    }

    /// Drop every inbox and the outbox at once.
    ///
    /// Used by transport adapters when the underlying connection closes.
    pub fn drop_all(&self) {
        let inboxes: Vec<_> = self.shared.inboxes.lock().drain().collect();
        for (_, inbox) in inboxes {
            inbox.close();
        }
        self.cascade_close();
    }

    /// Resolves once this handle (or its last multiplex sibling) drops.
    pub async fn closed(&self) {
        if self.shared.closed_flag.load(Ordering::Acquire) {
            return;
        }
        if self.shared.closed.take().await.is_ok() {
            // Re-arm so every sibling observer resolves too.
            let _ = self.shared.closed.push(());
        }
    }

    /// Whether the cascade close has happened.
    pub fn is_closed(&self) -> bool {
        self.shared.closed_flag.load(Ordering::Acquire)
    }

    /// Broadcast an inbound frame into every live inbox.
    ///
    /// Transport adapters call this for each framed binary message. A
    /// full inbox drops only that subscriber's copy.
    pub fn deliver(&self, mut bytes: Vec<u8>) {
        let inboxes = self.shared.inboxes.lock();
        let total = inboxes.len();
        for (index, inbox) in inboxes.values().enumerate() {
            // The last subscriber takes ownership of the buffer.
            let frame = if index + 1 == total {
                std::mem::take(&mut bytes)
            } else {
                bytes.clone()
            };
            match inbox.push(frame) {
                Ok(true) => {}
                Ok(false) => warn!("inbox full, inbound frame dropped for one consumer"),
                Err(_) => debug!("inbound frame arrived after inbox close"),
            }
        }
    }

    /// Attach the transport's push-sink to the outbox.
    ///
    /// Buffered outbound frames drain into the sink in FIFO order.
    /// Fails if a sink is already attached.
    pub fn connect_sink(&self, sink: PushSink<Vec<u8>>) -> Result<(), SocketError> {
        self.shared
            .outbox
            .connect_push(sink)
            .map_err(|_| SocketError::Closed)
    }

    /// Number of live inboxes, for diagnostics.
    pub fn fan_out(&self) -> usize {
        self.shared.inboxes.lock().len()
    }

    fn inbox(&self) -> Option<Arc<CircularQueue<Vec<u8>>>> {
        self.shared.inboxes.lock().get(&self.inbox_id).cloned()
    }

    fn cascade_close(&self) {
        if !self.shared.closed_flag.swap(true, Ordering::AcqRel) {
            debug!("last socket handle dropped, closing outbox");
            self.shared.outbox.close();
            let _ = self.shared.closed.push(());
        }
    }
}

impl std::fmt::Debug for VirtualSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualSocket")
            .field("inbox_id", &self.inbox_id)
            .field("fan_out", &self.fan_out())
            .field("closed", &self.is_closed())
            .finish()
    }
}
