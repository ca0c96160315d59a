use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing::{debug, error, info, span, Level};

/// A unit of work handed to a worker thread.
pub(crate) type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Worker thread configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker threads (0 = num_cpus)
    pub workers: usize,

    /// Thread stack size
    pub stack_size: usize,

    /// Thread name prefix
    pub name_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            stack_size: 2 * 1024 * 1024, // 2MB
            name_prefix: "eventgate-worker".to_string(),
        }
    }
}

/// Worker thread handle.
///
/// Each worker owns a single-threaded tokio runtime. Jobs submitted to it are
/// spawned onto that runtime and never leave the thread.
pub struct Worker {
    id: usize,
    tx: Option<mpsc::UnboundedSender<Job>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn a new worker thread
    pub fn spawn(id: usize, config: &WorkerConfig) -> io::Result<Self> {
        let name = format!("{}-{}", config.name_prefix, id);
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<io::Result<()>>();

        let handle = thread::Builder::new()
            .name(name)
            .stack_size(config.stack_size)
            .spawn(move || {
                let span = span!(Level::DEBUG, "worker", id = id);
                let _enter = span.enter();

                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "failed to build worker runtime");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let _ = ready_tx.send(Ok(()));
                debug!("worker thread started");

                // Run until every sender is gone
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        tokio::spawn(job);
                    }
                });

                debug!("worker thread stopped");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(io::Error::other("worker thread exited before start")),
        }

        Ok(Self {
            id,
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Get worker ID
    pub fn id(&self) -> usize {
        self.id
    }

    /// Hand a job to this worker. Returns false once the worker has stopped.
    pub(crate) fn submit(&self, job: Job) -> bool {
        match &self.tx {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Weak handle to the job queue. It does not keep the worker alive.
    pub(crate) fn spawner(&self) -> Option<mpsc::WeakUnboundedSender<Job>> {
        self.tx.as_ref().map(mpsc::UnboundedSender::downgrade)
    }

    /// Stop accepting jobs and join the worker thread
    pub fn join(&mut self) {
        self.tx.take();

        if let Some(handle) = self.handle.take() {
            // A worker cannot join itself; the thread exits on its own once
            // the channel closes.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if let Err(e) = handle.join() {
                error!(worker_id = self.id, "worker thread panicked: {:?}", e);
            }
        }
    }
}

/// Worker pool servicing execution contexts.
pub struct WorkerPool {
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(config: &WorkerConfig) -> io::Result<Self> {
        let num_workers = if config.workers == 0 {
            num_cpus::get()
        } else {
            config.workers
        };

        let workers = (0..num_workers)
            .map(|id| Worker::spawn(id, config))
            .collect::<io::Result<Vec<_>>>()?;

        info!(workers = workers.len(), "worker pool started");

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Pick the next worker, round-robin.
    pub(crate) fn next_worker(&self) -> Option<&Worker> {
        if self.workers.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers.get(index)
    }

    /// Get number of workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Shutdown all workers
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        debug!(workers = self.workers.len(), "shutting down worker pool");

        for worker in &mut self.workers {
            worker.join();
        }
        self.workers.clear();

        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
