//! Bounded queues underpinning every buffer in the runtime.
//!
//! [`CircularQueue`] is a bounded FIFO with asynchronous take semantics
//! and a terminal drop: pushes never block, takes suspend until a value
//! arrives, and dropping the queue rejects every pending waiter with a
//! terminal error. [`ConnectableQueue`] extends it with a push-through
//! sink used by the virtual socket outbox: once a transport connects,
//! pushes bypass storage and flow synchronously into the sink.
//!
//! Invariant maintained throughout: waiters are only queued while the
//! buffer is empty, and a push delivers to the oldest waiter before it
//! may store anything.

use crate::error::QueueError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Fixed-capacity ring: `capacity + 1` slots with head/tail indices.
struct Ring<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity + 1);
        slots.resize_with(capacity + 1, || None);
        Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        (self.tail + 1) % self.slots.len() == self.head
    }

    fn len(&self) -> usize {
        (self.tail + self.slots.len() - self.head) % self.slots.len()
    }

    fn push_tail(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[self.tail] = Some(value);
        self.tail = (self.tail + 1) % self.slots.len();
        true
    }

    fn pop_head(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        value
    }

    /// Remove every buffered element in FIFO order and reset the indices.
    fn drain_all(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(value) = self.pop_head() {
            out.push(value);
        }
        out
    }
}

/// A suspended consumer, FIFO among its siblings.
enum Waiter<T> {
    /// Resolves with the next pushed value.
    Take(oneshot::Sender<T>),
    /// Resolves with every available value (at least one).
    Flush(oneshot::Sender<Vec<T>>),
    /// Resolves with the next pushed value, then drops the queue.
    TakeThenDrop(oneshot::Sender<T>),
}

struct QueueCore<T> {
    ring: Ring<T>,
    waiters: VecDeque<Waiter<T>>,
    closed: bool,
}

impl<T> QueueCore<T> {
    fn new(capacity: usize) -> Self {
        Self {
            ring: Ring::new(capacity),
            waiters: VecDeque::new(),
            closed: false,
        }
    }

    /// Hand `value` to the oldest live waiter, or store it.
    ///
    /// A waiter whose receiving side has been dropped (its take was
    /// cancelled mid-await) hands the value back; the next waiter is
    /// tried so no value is lost.
    fn push_value(&mut self, mut value: T) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter {
                Waiter::Take(tx) => match tx.send(value) {
                    Ok(()) => return true,
                    Err(returned) => value = returned,
                },
                Waiter::Flush(tx) => match tx.send(vec![value]) {
                    Ok(()) => return true,
                    Err(mut returned) => {
                        value = returned.pop().expect("flush waiter returned the batch");
                    }
                },
                Waiter::TakeThenDrop(tx) => match tx.send(value) {
                    Ok(()) => {
                        self.close();
                        return true;
                    }
                    Err(returned) => value = returned,
                },
            }
        }
        self.ring.push_tail(value)
    }

    fn close(&mut self) {
        self.closed = true;
        // Dropping the senders rejects every suspended waiter.
        self.waiters.clear();
        self.ring.drain_all();
    }
}

/// Bounded FIFO with async take, bulk flush, and terminal drop.
pub struct CircularQueue<T> {
    inner: Mutex<QueueCore<T>>,
}

impl<T: Send> CircularQueue<T> {
    /// Create a queue holding at most `capacity` buffered values.
    ///
    /// A capacity of zero is legal: such a queue only ever hands values
    /// directly to suspended waiters.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueCore::new(capacity)),
        }
    }

    /// Push a value.
    ///
    /// Returns `true` if the value was handed to a waiter or stored,
    /// `false` if the buffer was full (the value is discarded). Raises
    /// the terminal error once the queue has been dropped.
    pub fn push(&self, value: T) -> Result<bool, QueueError> {
        let mut core = self.inner.lock();
        if core.closed {
            return Err(QueueError::Closed);
        }
        Ok(core.push_value(value))
    }

    /// Take the oldest value, suspending until one is available.
    pub async fn take(&self) -> Result<T, QueueError> {
        let rx = {
            let mut core = self.inner.lock();
            if core.closed {
                return Err(QueueError::Closed);
            }
            if let Some(value) = core.ring.pop_head() {
                return Ok(value);
            }
            let (tx, rx) = oneshot::channel();
            core.waiters.push_back(Waiter::Take(tx));
            rx
        };
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Take every buffered value in FIFO order.
    ///
    /// If the buffer is empty, suspends and resolves with a one-element
    /// batch as soon as the next value is pushed; future pushes are not
    /// batched.
    pub async fn flush(&self) -> Result<Vec<T>, QueueError> {
        let rx = {
            let mut core = self.inner.lock();
            if core.closed {
                return Err(QueueError::Closed);
            }
            if !core.ring.is_empty() {
                return Ok(core.ring.drain_all());
            }
            let (tx, rx) = oneshot::channel();
            core.waiters.push_back(Waiter::Flush(tx));
            rx
        };
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Take the next value and drop the queue immediately after.
    pub async fn take_then_drop(&self) -> Result<T, QueueError> {
        let rx = {
            let mut core = self.inner.lock();
            if core.closed {
                return Err(QueueError::Closed);
            }
            if let Some(value) = core.ring.pop_head() {
                core.close();
                return Ok(value);
            }
            let (tx, rx) = oneshot::channel();
            core.waiters.push_back(Waiter::TakeThenDrop(tx));
            rx
        };
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Mark the queue terminal.
    ///
    /// Every pending waiter is rejected with [`QueueError::Closed`] and
    /// every subsequent operation raises it synchronously. Buffered
    /// values are discarded.
    pub fn close(&self) {
        self.inner.lock().close();
    }

    /// Whether the queue has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.inner.lock().ring.len()
    }

    /// Whether the buffer currently holds no values.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().ring.is_empty()
    }
}

/// Synchronous push-through sink attached to a [`ConnectableQueue`].
pub type PushSink<T> = Box<dyn FnMut(T) -> bool + Send>;

/// [`CircularQueue`] with a push-through connector.
///
/// Until connected it buffers like the plain queue. `connect_push`
/// drains the buffer into the sink in FIFO order and atomically flips
/// the queue into connected mode, after which every push delegates to
/// the sink synchronously. The sink runs under the queue lock and must
/// not re-enter the queue.
pub struct ConnectableQueue<T> {
    inner: Mutex<ConnectableCore<T>>,
}

struct ConnectableCore<T> {
    core: QueueCore<T>,
    sink: Option<PushSink<T>>,
}

impl<T: Send> ConnectableQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ConnectableCore {
                core: QueueCore::new(capacity),
                sink: None,
            }),
        }
    }

    /// Attach the push-through sink.
    ///
    /// Fails if a sink is already attached or any waiter is suspended.
    /// Buffered values drain into the sink in FIFO order before the
    /// transition completes.
    pub fn connect_push(&self, mut sink: PushSink<T>) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        if inner.core.closed {
            return Err(QueueError::Closed);
        }
        if inner.sink.is_some() {
            return Err(QueueError::AlreadyConnected);
        }
        if !inner.core.waiters.is_empty() {
            return Err(QueueError::WaitersPending);
        }
        for value in inner.core.ring.drain_all() {
            if !sink(value) {
                tracing::warn!("connect-time drain rejected a buffered value");
            }
        }
        inner.sink = Some(sink);
        Ok(())
    }

    /// Push a value, through the sink when connected.
    pub fn push(&self, value: T) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock();
        if inner.core.closed {
            return Err(QueueError::Closed);
        }
        match inner.sink.as_mut() {
            Some(sink) => Ok(sink(value)),
            None => Ok(inner.core.push_value(value)),
        }
    }

    /// Take the oldest buffered value. Forbidden once connected.
    pub async fn take(&self) -> Result<T, QueueError> {
        let rx = {
            let mut inner = self.inner.lock();
            if inner.core.closed {
                return Err(QueueError::Closed);
            }
            if inner.sink.is_some() {
                return Err(QueueError::Connected);
            }
            if let Some(value) = inner.core.ring.pop_head() {
                return Ok(value);
            }
            let (tx, rx) = oneshot::channel();
            inner.core.waiters.push_back(Waiter::Take(tx));
            rx
        };
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Whether a sink has been attached.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().sink.is_some()
    }

    /// Mark the queue terminal; rejects waiters and detaches the sink.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.core.close();
        inner.sink = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().core.closed
    }

    /// Number of values buffered while unconnected.
    pub fn len(&self) -> usize {
        self.inner.lock().core.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().core.ring.is_empty()
    }
}
