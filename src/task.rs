//! Cancellable lifetime handles with deadlines and structured subtasks.
//!
//! A [`Task`] is the unit of lifetime in the runtime: every session,
//! every armed receive, and every deadline hangs off one. The terminal
//! slot resolves exactly once, either with an abortive cancel reason or
//! a `cleanup: `-prefixed completion reason, and children derived via
//! [`Task::subtask`] cancel automatically when the parent resolves.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::debug;

/// Deadlines beyond this are clamped; `Duration::MAX` disables the
/// timer entirely.
const MAX_DEADLINE: Duration = Duration::from_millis((1 << 31) - 1);

/// Outcome of racing a future against a task's terminal slot.
#[derive(Debug)]
pub enum RaceOutcome<T> {
    /// The future finished first.
    Value(T),
    /// The task resolved first; carries the reason.
    Cancelled(String),
}

impl<T> RaceOutcome<T> {
    /// The raced value, if the future won.
    pub fn value(self) -> Option<T> {
        match self {
            RaceOutcome::Value(v) => Some(v),
            RaceOutcome::Cancelled(_) => None,
        }
    }
}

/// One step of a [`Task::poll`] loop.
pub enum PollStep {
    /// Run the next iteration.
    Continue,
    /// Terminate the loop normally.
    Done,
    /// Cancel the polling task with this reason and stop.
    Fail(String),
}

/// Boxed future returned by a poll body.
pub type PollFuture = std::pin::Pin<Box<dyn Future<Output = PollStep> + Send>>;

struct TaskState {
    /// `Some` once the terminal slot resolved. `watch` keeps the value
    /// readable after resolution, which is what makes `is_cancelled`
    /// stable.
    done: watch::Sender<Option<String>>,
    timer: Mutex<Option<AbortHandle>>,
}

/// Cancellable lifetime token.
///
/// Clones share the same terminal slot; [`Task::subtask`] derives a new
/// one with structured parent/child cancellation instead.
#[derive(Clone)]
pub struct Task {
    state: Arc<TaskState>,
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl Task {
    /// Create an active task with an unresolved terminal slot.
    pub fn new() -> Self {
        let (done, _) = watch::channel(None);
        Self {
            state: Arc::new(TaskState {
                done,
                timer: Mutex::new(None),
            }),
        }
    }

    /// Resolve the terminal slot abortively. A second call is a no-op.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let first = self.state.done.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(reason.clone());
                true
            } else {
                false
            }
        });
        if first {
            debug!(reason = %reason, "task cancelled");
        }
    }

    /// Resolve the terminal slot as intentional completion.
    ///
    /// Records the reason with a `cleanup: ` prefix and clears any armed
    /// deadline timer. Like `cancel`, exactly-once.
    pub fn cleanup(&self, reason: impl Into<String>) {
        if let Some(timer) = self.state.timer.lock().take() {
            timer.abort();
        }
        self.cancel(format!("cleanup: {}", reason.into()));
    }

    /// The resolution reason, once set. Stable across calls.
    pub fn is_cancelled(&self) -> Option<String> {
        self.state.done.borrow().clone()
    }

    /// Suspend until the terminal slot resolves; yields the reason.
    pub async fn cancelled(&self) -> String {
        let mut rx = self.state.done.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // Every handle was dropped without resolving; treat the
                // lifetime as over.
                return "task dropped".to_string();
            }
        }
    }

    /// Schedule a cancel with reason `timeout: <reason>` after `after`.
    ///
    /// `Duration::MAX` is a no-op; excessive durations are clamped. A
    /// new deadline replaces a previously armed one.
    pub fn deadline(&self, after: Duration, reason: &str) {
        if after == Duration::MAX {
            return;
        }
        let after = after.min(MAX_DEADLINE);
        let task = self.clone();
        let reason = format!("timeout: {reason}");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            task.cancel(reason);
        });
        let mut timer = self.state.timer.lock();
        if let Some(previous) = timer.replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Race `fut` against this task's terminal slot.
    ///
    /// Resolves with whichever side finishes first, then cleans the task
    /// up. Intended for dedicated subtasks guarding a single await;
    /// loops select against [`Task::cancelled`] themselves instead.
    pub async fn race<F: Future>(&self, fut: F) -> RaceOutcome<F::Output> {
        let outcome = tokio::select! {
            value = fut => RaceOutcome::Value(value),
            reason = self.cancelled() => RaceOutcome::Cancelled(reason),
        };
        self.cleanup("race finished");
        outcome
    }

    /// Run `fut` under a fresh child task.
    ///
    /// Returns the child handle (for `cancel`/`deadline`) and the raced
    /// future. The child is cleaned up when the race resolves.
    pub fn wrap<F>(&self, fut: F) -> (Task, impl Future<Output = RaceOutcome<F::Output>>)
    where
        F: Future,
    {
        let child = self.subtask();
        let racer = child.clone();
        (child, async move { racer.race(fut).await })
    }

    /// Loop `pull` until this task resolves or the body terminates.
    ///
    /// Each iteration receives a clone of the task. A body returning
    /// [`PollStep::Fail`] cancels the task with its reason.
    pub async fn poll<F>(&self, mut pull: F)
    where
        F: FnMut(Task) -> PollFuture + Send,
    {
        loop {
            if self.is_cancelled().is_some() {
                return;
            }
            let step = tokio::select! {
                step = pull(self.clone()) => step,
                _ = self.cancelled() => return,
            };
            match step {
                PollStep::Continue => continue,
                PollStep::Done => return,
                PollStep::Fail(reason) => {
                    self.cancel(reason);
                    return;
                }
            }
        }
    }

    /// Derive a child task that cancels when this task resolves.
    ///
    /// The child's reason is `parent cancelled: <parent reason>`. The
    /// child may resolve first without affecting the parent.
    pub fn subtask(&self) -> Task {
        let child = Task::new();
        let parent = self.clone();
        let watcher = child.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = parent.cancelled() => {
                    watcher.cancel(format!("parent cancelled: {reason}"));
                }
                _ = watcher.cancelled() => {}
            }
        });
        child
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn test_cancel_is_exactly_once_and_stable() {
        let task = Task::new();
        assert_eq!(task.is_cancelled(), None);

        task.cancel("first");
        task.cancel("second");
        task.cleanup("third");

        assert_eq!(task.is_cancelled().as_deref(), Some("first"));
        // Stable: repeated reads agree.
        assert_eq!(task.is_cancelled().as_deref(), Some("first"));
        assert_eq!(task.cancelled().await, "first");
    }

    #[tokio::test]
    async fn test_cleanup_prefixes_reason() {
        let task = Task::new();
        task.cleanup("stream finished");
        assert_eq!(
            task.is_cancelled().as_deref(),
            Some("cleanup: stream finished")
        );
    }

    #[tokio::test]
    async fn test_deadline_cancels_with_timeout_reason() {
        tokio::time::pause();
        let task = Task::new();
        task.deadline(Duration::from_millis(100), "send ack");

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(task.is_cancelled(), None);

        tokio::time::advance(Duration::from_millis(2)).await;
        assert_eq!(task.cancelled().await, "timeout: send ack");
    }

    #[tokio::test]
    async fn test_cleanup_clears_deadline() {
        tokio::time::pause();
        let task = Task::new();
        task.deadline(Duration::from_millis(100), "late");
        task.cleanup("done early");

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(task.is_cancelled().as_deref(), Some("cleanup: done early"));
    }

    #[tokio::test]
    async fn test_infinite_deadline_is_noop() {
        let task = Task::new();
        task.deadline(Duration::MAX, "never");
        assert!(task.state.timer.lock().is_none());
    }

    #[tokio::test]
    async fn test_subtask_cancels_when_parent_resolves() {
        let parent = Task::new();
        let child = parent.subtask();

        parent.cancel("lost transport");
        // Resolution propagates within one scheduling turn.
        let reason = timeout(Duration::from_millis(100), child.cancelled())
            .await
            .unwrap();
        assert_eq!(reason, "parent cancelled: lost transport");
    }

    #[tokio::test]
    async fn test_subtask_resolution_leaves_parent_alone() {
        let parent = Task::new();
        let child = parent.subtask();

        child.cancel("local");
        tokio::task::yield_now().await;
        assert_eq!(parent.is_cancelled(), None);
    }

    #[tokio::test]
    async fn test_race_value_and_cancellation() {
        let task = Task::new();
        let sub = task.subtask();
        match sub.race(async { 5u8 }).await {
            RaceOutcome::Value(v) => assert_eq!(v, 5),
            RaceOutcome::Cancelled(r) => panic!("unexpected cancel: {r}"),
        }
        // The raced subtask is cleaned up afterwards.
        assert!(sub.is_cancelled().unwrap().starts_with("cleanup: "));

        let task = Task::new();
        let sub = task.subtask();
        task.cancel("abort");
        let outcome = sub
            .race(async {
                sleep(Duration::from_secs(5)).await;
            })
            .await;
        match outcome {
            RaceOutcome::Cancelled(reason) => {
                assert_eq!(reason, "parent cancelled: abort");
            }
            RaceOutcome::Value(()) => panic!("future should not win"),
        }
    }

    #[tokio::test]
    async fn test_wrap_exposes_child_handle() {
        let task = Task::new();
        let (child, raced) = task.wrap(async { 7u8 });
        match raced.await {
            RaceOutcome::Value(v) => assert_eq!(v, 7),
            RaceOutcome::Cancelled(r) => panic!("unexpected cancel: {r}"),
        }
        // The child resolved with the race.
        assert!(child.is_cancelled().is_some());

        let task = Task::new();
        let (child, raced) = task.wrap(async {
            sleep(Duration::from_secs(5)).await;
        });
        child.deadline(Duration::from_millis(20), "wrapped await");
        match raced.await {
            RaceOutcome::Cancelled(reason) => {
                assert_eq!(reason, "timeout: wrapped await");
            }
            RaceOutcome::Value(()) => panic!("future should not win"),
        }
    }

    #[tokio::test]
    async fn test_poll_fail_cancels_task() {
        let task = Task::new();
        let mut remaining = 3u8;
        task.poll(move |_t| {
            remaining -= 1;
            let step = if remaining == 0 {
                PollStep::Fail("exhausted".to_string())
            } else {
                PollStep::Continue
            };
            Box::pin(async move { step }) as PollFuture
        })
        .await;

        assert_eq!(task.is_cancelled().as_deref(), Some("exhausted"));
    }

    #[tokio::test]
    async fn test_poll_stops_on_done_without_resolving() {
        let task = Task::new();
        task.poll(|_t| Box::pin(async { PollStep::Done }) as PollFuture)
            .await;
        assert_eq!(task.is_cancelled(), None);
    }
}
