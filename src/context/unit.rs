use std::fmt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use super::timer::{TimerId, TimerTable};
use super::worker::{Job, WorkerConfig, WorkerPool};

tokio::task_local! {
    static CURRENT: Context;
}

/// A task scheduled on a context.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Context identifier, unique for the lifetime of its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// The context no longer accepts work (its worker has stopped).
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("context {0} is closed")]
pub struct ContextClosed(pub ContextId);

struct Queued {
    context: Context,
    task: Task,
}

/// Execution affinity token.
///
/// Every task submitted to a context runs on the same worker thread, one at a
/// time, in submission order. The context is released when its last handle is
/// dropped and its queue is empty.
#[derive(Clone)]
pub struct Context {
    id: ContextId,
    worker: usize,
    tx: mpsc::UnboundedSender<Queued>,
    spawner: Option<mpsc::WeakUnboundedSender<Job>>,
    timers: Arc<TimerTable>,
}

impl Context {
    /// Get context ID.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Index of the worker this context is pinned to.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Whether the calling code is running inside this context.
    pub fn is_current(&self) -> bool {
        current_context().is_some_and(|c| c.id == self.id)
    }

    /// Whether the context can still accept work.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a task on this context.
    pub fn run<F>(&self, task: F) -> Result<(), ContextClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(Queued {
                context: self.clone(),
                task: Box::pin(task),
            })
            .map_err(|_| ContextClosed(self.id))
    }

    /// Run a future on this context and wait for its output.
    ///
    /// Called from inside the same context the future runs inline, since
    /// queueing it behind the caller would never complete.
    pub async fn call<F, T>(&self, fut: F) -> Result<T, ContextClosed>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_current() {
            return Ok(fut.await);
        }

        let (tx, rx) = oneshot::channel();
        self.run(async move {
            let _ = tx.send(fut.await);
        })?;
        rx.await.map_err(|_| ContextClosed(self.id))
    }

    /// Run `task` on this context once `delay` has elapsed.
    pub fn set_timer<F, Fut>(&self, delay: Duration, task: F) -> Result<TimerId, ContextClosed>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (id, token) = self.timers.insert();
        let context = self.clone();

        let sleeper = async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let timers = context.timers.clone();
            let fire = async move {
                // Cancelled while queued behind other work
                if token.is_cancelled() {
                    return;
                }
                timers.remove(id);
                task().await;
            };
            if let Err(e) = context.run(fire) {
                context.timers.remove(id);
                debug!(timer = %id, error = %e, "timer dropped");
            }
        };

        self.spawn_timer(id, Box::pin(sleeper))?;
        Ok(id)
    }

    /// Run `task` on this context every `period` until the timer is
    /// cancelled. The first run happens one period from now.
    ///
    /// `task` is invoked on the worker to build each run's future; the
    /// future itself runs on the context.
    pub fn set_periodic<F, Fut>(&self, period: Duration, mut task: F) -> Result<TimerId, ContextClosed>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let (id, token) = self.timers.insert();
        let context = self.clone();

        let sleeper = async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                let run = task();
                let token = token.clone();
                let fire = async move {
                    if !token.is_cancelled() {
                        run.await;
                    }
                };
                if let Err(e) = context.run(fire) {
                    context.timers.remove(id);
                    debug!(timer = %id, error = %e, "periodic timer stopped");
                    break;
                }
            }
        };

        self.spawn_timer(id, Box::pin(sleeper))?;
        Ok(id)
    }

    /// Cancel a timer. Returns false when it already fired or was cancelled.
    /// Cancelling from inside the context guarantees no further run.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    fn spawn_timer(&self, id: TimerId, sleeper: Job) -> Result<(), ContextClosed> {
        let submitted = self
            .spawner
            .as_ref()
            .and_then(mpsc::WeakUnboundedSender::upgrade)
            .is_some_and(|tx| tx.send(sleeper).is_ok());

        if !submitted {
            self.timers.remove(id);
            return Err(ContextClosed(self.id));
        }
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .finish()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Context {}

/// The context the calling task is executing on, if any.
pub fn current_context() -> Option<Context> {
    CURRENT.try_with(Context::clone).ok()
}

/// Drains one context queue on its worker.
async fn drive(mut rx: mpsc::UnboundedReceiver<Queued>) {
    while let Some(Queued { context, task }) = rx.recv().await {
        let id = context.id;
        let result = CURRENT
            .scope(context, AssertUnwindSafe(task).catch_unwind())
            .await;
        if result.is_err() {
            error!(context = %id, "task panicked");
        }
    }
}

/// Allocates contexts on a worker pool.
pub struct ContextPool {
    workers: WorkerPool,
    next_id: AtomicU64,
    timers: Arc<TimerTable>,
}

impl ContextPool {
    /// Start the worker threads backing this pool.
    pub fn new(config: &WorkerConfig) -> io::Result<Self> {
        Ok(Self {
            workers: WorkerPool::new(config)?,
            next_id: AtomicU64::new(1),
            timers: Arc::new(TimerTable::default()),
        })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Allocate a new context pinned to the next worker.
    pub fn create(&self) -> Context {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let (worker, spawner) = match self.workers.next_worker() {
            Some(worker) if worker.submit(Box::pin(drive(rx))) => (worker.id(), worker.spawner()),
            Some(worker) => {
                warn!(context = %id, worker = worker.id(), "worker stopped, context closed");
                (worker.id(), None)
            }
            None => {
                warn!(context = %id, "worker pool is shut down, context closed");
                (0, None)
            }
        };

        Context {
            id,
            worker,
            tx,
            spawner,
            timers: self.timers.clone(),
        }
    }

    /// Schedule `task` on `context`, allocating a fresh context when none is
    /// given. Returns the context the task was queued on.
    pub fn run<F>(&self, context: Option<&Context>, task: F) -> Context
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let context = match context {
            Some(context) => context.clone(),
            None => self.create(),
        };

        if let Err(e) = context.run(task) {
            warn!(error = %e, "task dropped");
        }

        context
    }

    /// Cancel a timer set on any context of this pool.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    /// Number of timers that have not fired or been cancelled.
    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    /// Stop all workers. Pending tasks are dropped.
    pub fn shutdown(&mut self) {
        self.workers.shutdown();
    }
}

impl fmt::Debug for ContextPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn pool(workers: usize) -> ContextPool {
        ContextPool::new(&WorkerConfig {
            workers,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_run_allocates_context() {
        let pool = pool(2);
        let (tx, rx) = oneshot::channel();

        let context = pool.run(None, async move {
            let _ = tx.send(current_context().map(|c| c.id()));
        });

        assert_eq!(rx.await.unwrap(), Some(context.id()));
    }

    #[tokio::test]
    async fn test_get_context_outside_task() {
        assert!(current_context().is_none());
    }

    #[tokio::test]
    async fn test_tasks_run_in_submission_order() {
        let pool = pool(4);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let context = pool.create();

        for i in 0..50u32 {
            let seen = seen.clone();
            context
                .run(async move {
                    // Yield inside the task; the next task must still wait.
                    if i % 7 == 0 {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    seen.lock().unwrap().push(i);
                })
                .unwrap();
        }

        context.call(async {}).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_tasks_never_overlap() {
        let pool = pool(2);
        let context = pool.create();
        let active = Arc::new(Mutex::new((0usize, 0usize)));

        for _ in 0..20 {
            let active = active.clone();
            context
                .run(async move {
                    {
                        let mut guard = active.lock().unwrap();
                        guard.0 += 1;
                        guard.1 = guard.1.max(guard.0);
                    }
                    tokio::task::yield_now().await;
                    active.lock().unwrap().0 -= 1;
                })
                .unwrap();
        }

        context.call(async {}).await.unwrap();
        assert_eq!(active.lock().unwrap().1, 1);
    }

    #[tokio::test]
    async fn test_call_returns_value() {
        let pool = pool(1);
        let context = pool.create();
        let value = context.call(async { 21 * 2 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_call_from_same_context_runs_inline() {
        let pool = pool(1);
        let context = pool.create();
        let inner = context.clone();

        let value = context
            .call(async move { inner.call(async { "inline" }).await.unwrap() })
            .await
            .unwrap();

        assert_eq!(value, "inline");
    }

    #[tokio::test]
    async fn test_context_stays_on_one_worker() {
        let pool = pool(3);
        let context = pool.create();
        let mut names = Vec::new();

        for _ in 0..5 {
            let name = context
                .call(async { std::thread::current().name().map(str::to_string) })
                .await
                .unwrap();
            names.push(name);
        }

        names.dedup();
        assert_eq!(names.len(), 1);
        assert_eq!(
            names[0].as_deref(),
            Some(format!("eventgate-worker-{}", context.worker()).as_str())
        );
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_context() {
        let pool = pool(1);
        let context = pool.create();

        context.run(async { panic!("boom") }).unwrap();

        let value = context.call(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_closed_after_shutdown() {
        let mut pool = pool(1);
        let context = pool.create();
        pool.shutdown();

        let result = context.call(async {}).await;
        assert_eq!(result, Err(ContextClosed(context.id())));

        let late = pool.create();
        assert!(late.is_closed());
    }

    #[tokio::test]
    async fn test_timers_fire_on_context_in_deadline_order() {
        let pool = pool(2);
        let context = pool.create();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = oneshot::channel();

        for (delay, label) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let seen = seen.clone();
            context
                .set_timer(Duration::from_millis(delay), move || async move {
                    seen.lock().unwrap().push((label, current_context().map(|c| c.id())));
                })
                .unwrap();
        }
        context
            .set_timer(Duration::from_millis(60), move || async move {
                let _ = tx.send(());
            })
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        let here = Some(context.id());
        assert_eq!(*seen.lock().unwrap(), vec![("a", here), ("b", here), ("c", here)]);
        assert_eq!(pool.active_timers(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let pool = pool(1);
        let context = pool.create();
        let fired = Arc::new(Mutex::new(false));

        let id = {
            let fired = fired.clone();
            context
                .set_timer(Duration::from_millis(20), move || async move {
                    *fired.lock().unwrap() = true;
                })
                .unwrap()
        };
        assert!(context.cancel_timer(id));
        assert!(!pool.cancel_timer(id));

        tokio::time::sleep(Duration::from_millis(60)).await;
        context.call(async {}).await.unwrap();
        assert!(!*fired.lock().unwrap());
    }

    #[tokio::test]
    async fn test_cancel_stops_periodic() {
        let pool = pool(1);
        let context = pool.create();
        let ticks = Arc::new(Mutex::new(0u32));

        let id = {
            let ticks = ticks.clone();
            context
                .set_periodic(Duration::from_millis(5), move || {
                    let ticks = ticks.clone();
                    async move {
                        *ticks.lock().unwrap() += 1;
                    }
                })
                .unwrap()
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            while *ticks.lock().unwrap() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // Cancelling on the context means no run is in flight
        let inner = context.clone();
        assert!(context.call(async move { inner.cancel_timer(id) }).await.unwrap());
        let stopped_at = *ticks.lock().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        context.call(async {}).await.unwrap();
        assert_eq!(*ticks.lock().unwrap(), stopped_at);
        assert_eq!(pool.active_timers(), 0);
    }

    #[tokio::test]
    async fn test_timer_on_closed_context_fails() {
        let mut pool = pool(1);
        let context = pool.create();
        pool.shutdown();

        let result = context.set_timer(Duration::from_millis(1), || async {});
        assert_eq!(result, Err(ContextClosed(context.id())));
        assert_eq!(pool.active_timers(), 0);
    }
}
