//! Application-facing service queues.
//!
//! A [`Service`] is the pair of bounded queues binding one session to
//! its application: the *internal* queue is the pull side the protocol
//! sender drains, the *external* queue is the push side the protocol
//! receiver delivers into. Loading `None` internally signals the end of
//! the outbound stream. The service is exclusively owned by its session
//! task; when that task resolves the queues are dropped.
//!
//! Two shapes exist: `once` (one-shot in each direction, the unary
//! building block) and `many` (capacity-configurable queues for the
//! channel, stream, listen, and duplex shapes).

use crate::queue::CircularQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Application-side schema check applied after decode.
pub type Validator<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

enum Shape<I, E> {
    Once(OnceCore<I, E>),
    Many(ManyCore<I, E>),
}

struct OnceCore<I, E> {
    internal: CircularQueue<Option<I>>,
    loaded: AtomicBool,
    pulled: AtomicBool,
    external: CircularQueue<E>,
    /// Flips to `true` when the single external delivery lands (or the
    /// service closes). The second internal pull waits on this, which
    /// sequences the unary exchange: the reply is home before the
    /// stream exhausts and TERM goes out.
    delivered: watch::Sender<bool>,
    accepted: AtomicBool,
}

struct ManyCore<I, E> {
    internal: CircularQueue<Option<I>>,
    external: CircularQueue<E>,
}

/// Bounded queue pair binding one session to the application.
pub struct Service<I, E> {
    shape: Shape<I, E>,
    validator: Option<Validator<E>>,
}

impl<I: Send, E: Send> Service<I, E> {
    /// One-shot service: a single value each way, terminal after both
    /// directions resolved.
    pub fn once() -> Self {
        let (delivered, _) = watch::channel(false);
        Self {
            shape: Shape::Once(OnceCore {
                internal: CircularQueue::new(1),
                loaded: AtomicBool::new(false),
                pulled: AtomicBool::new(false),
                external: CircularQueue::new(1),
                delivered,
                accepted: AtomicBool::new(false),
            }),
            validator: None,
        }
    }

    /// Capacity-configurable service.
    ///
    /// `internal_capacity` bounds the outbound (pull) queue,
    /// `external_capacity` the inbound (push) queue. Either may be 0 to
    /// forbid buffering in that direction.
    pub fn many(internal_capacity: usize, external_capacity: usize) -> Self {
        Self {
            shape: Shape::Many(ManyCore {
                internal: CircularQueue::new(internal_capacity),
                external: CircularQueue::new(external_capacity),
            }),
            validator: None,
        }
    }

    /// Attach a schema check applied to every decoded inbound value.
    pub fn with_validator(mut self, validator: Validator<E>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Queue a value for the outbound stream; `None` ends it.
    ///
    /// Returns `false` when the queue is full, the one-shot was already
    /// loaded, or the service has been dropped.
    pub fn load_internal(&self, item: Option<I>) -> bool {
        match &self.shape {
            Shape::Once(core) => {
                if core.loaded.swap(true, Ordering::AcqRel) {
                    return false;
                }
                core.internal.push(item).unwrap_or(false)
            }
            Shape::Many(core) => core.internal.push(item).unwrap_or(false),
        }
    }

    /// Pull side for the protocol sender. Resolves with the next
    /// outbound value, or `None` once the stream is finished.
    pub async fn internal(&self) -> Option<I> {
        match &self.shape {
            Shape::Once(core) => {
                if !core.pulled.swap(true, Ordering::AcqRel) {
                    return core.internal.take().await.ok().flatten();
                }
                // Both one-shots must resolve before the session may
                // wind down.
                let mut delivered = core.delivered.subscribe();
                loop {
                    if *delivered.borrow_and_update() {
                        return None;
                    }
                    if delivered.changed().await.is_err() {
                        return None;
                    }
                }
            }
            Shape::Many(core) => core.internal.take().await.ok().flatten(),
        }
    }

    /// Push side for the protocol receiver.
    ///
    /// Returns `false` when the inbound queue is full, the one-shot was
    /// already delivered, or the service has been dropped.
    pub fn external(&self, item: E) -> bool {
        match &self.shape {
            Shape::Once(core) => {
                if core.accepted.swap(true, Ordering::AcqRel) {
                    return false;
                }
                let stored = core.external.push(item).unwrap_or(false);
                if stored {
                    let _ = core.delivered.send(true);
                }
                stored
            }
            Shape::Many(core) => core.external.push(item).unwrap_or(false),
        }
    }

    /// Await the next inbound value. `None` once the service dropped.
    pub async fn take_external(&self) -> Option<E> {
        match &self.shape {
            Shape::Once(core) => core.external.take().await.ok(),
            Shape::Many(core) => core.external.take().await.ok(),
        }
    }

    /// Apply the attached schema check, if any.
    pub fn validate(&self, raw: &E) -> bool {
        match &self.validator {
            Some(validator) => validator(raw),
            None => true,
        }
    }

    /// Drop both queues. Called when the owning session task resolves.
    pub fn close(&self) {
        debug!("service queues dropped");
        match &self.shape {
            Shape::Once(core) => {
                core.internal.close();
                // A delivered-but-unclaimed value stays claimable; new
                // deliveries are already barred by the one-shot flag.
                if core.external.is_empty() {
                    core.external.close();
                }
                // Wake a pull blocked on the delivery gate.
                let _ = core.delivered.send(true);
            }
            Shape::Many(core) => {
                core.internal.close();
                core.external.close();
            }
        }
    }

    /// Whether the service has been dropped.
    pub fn is_closed(&self) -> bool {
        match &self.shape {
            Shape::Once(core) => core.internal.is_closed(),
            Shape::Many(core) => core.internal.is_closed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_once_load_then_pull() {
        let service = Service::<u32, u32>::once();

        assert!(service.load_internal(Some(21)));
        assert!(!service.load_internal(Some(22)));

        assert_eq!(service.internal().await, Some(21));
    }

    #[tokio::test]
    async fn test_once_pull_then_load() {
        let service = Arc::new(Service::<u32, u32>::once());

        let svc = service.clone();
        let puller = tokio::spawn(async move { svc.internal().await });
        tokio::task::yield_now().await;

        assert!(service.load_internal(Some(7)));
        assert_eq!(puller.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_once_second_pull_waits_for_delivery() {
        let service = Arc::new(Service::<u32, u32>::once());
        service.load_internal(Some(1));
        assert_eq!(service.internal().await, Some(1));

        // The second pull gates on the external one-shot.
        let svc = service.clone();
        let second = tokio::spawn(async move { svc.internal().await });
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        assert!(service.external(42));
        assert_eq!(second.await.unwrap(), None);
        assert_eq!(service.take_external().await, Some(42));
    }

    #[tokio::test]
    async fn test_once_external_is_one_shot() {
        let service = Service::<u32, u32>::once();
        assert!(service.external(1));
        assert!(!service.external(2));
        assert_eq!(service.take_external().await, Some(1));
    }

    #[tokio::test]
    async fn test_many_round_trip_preserves_fifo() {
        let service = Service::<u32, u32>::many(4, 4);

        assert!(service.load_internal(Some(1)));
        assert!(service.load_internal(Some(2)));
        assert!(service.load_internal(None));

        assert_eq!(service.internal().await, Some(1));
        assert_eq!(service.internal().await, Some(2));
        assert_eq!(service.internal().await, None);

        assert!(service.external(10));
        assert!(service.external(20));
        assert_eq!(service.take_external().await, Some(10));
        assert_eq!(service.take_external().await, Some(20));
    }

    #[test]
    fn test_many_full_queue_rejects() {
        let service = Service::<u32, u32>::many(1, 1);

        assert!(service.load_internal(Some(1)));
        assert!(!service.load_internal(Some(2)));

        assert!(service.external(1));
        assert!(!service.external(2));
    }

    #[tokio::test]
    async fn test_close_unblocks_everything() {
        let service = Arc::new(Service::<u32, u32>::many(1, 1));

        let svc = service.clone();
        let pull = tokio::spawn(async move { svc.internal().await });
        let svc = service.clone();
        let take = tokio::spawn(async move { svc.take_external().await });
        tokio::task::yield_now().await;

        service.close();
        assert_eq!(pull.await.unwrap(), None);
        assert_eq!(take.await.unwrap(), None);
        assert!(!service.load_internal(Some(1)));
        assert!(!service.external(1));
        assert!(service.is_closed());
    }

    #[tokio::test]
    async fn test_once_close_releases_delivery_gate() {
        let service = Arc::new(Service::<u32, u32>::once());
        service.load_internal(Some(1));
        assert_eq!(service.internal().await, Some(1));

        let svc = service.clone();
        let second = tokio::spawn(async move { svc.internal().await });
        tokio::task::yield_now().await;

        service.close();
        assert_eq!(
            timeout(Duration::from_millis(100), second)
                .await
                .unwrap()
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_validator_applies() {
        let service = Service::<u32, u32>::many(1, 1)
            .with_validator(Arc::new(|value: &u32| *value % 2 == 0));

        assert!(service.validate(&4));
        assert!(!service.validate(&3));
    }
}
