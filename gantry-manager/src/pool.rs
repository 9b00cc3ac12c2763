//! Worker pool
//!
//! A fixed number of workers drain a shared priority queue. Every remote
//! call made outside an interactive caller runs here, so one stuck call
//! only occupies one worker.
//!
//! Tasks are boxed futures carrying a name and a priority; lower priorities
//! run first and equal priorities run in submission order. The result of a
//! task is delivered through its [`TaskHandle`].

use chrono::{DateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::JobError;

/// Priority of submission batches
pub const SUBMIT_PRIORITY: u8 = 3;
/// Priority of finalization work
pub const FINALISE_PRIORITY: u8 = 5;

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueuedTask {
    priority: u8,
    seq: u64,
    name: String,
    future: BoxedTask,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    // BinaryHeap is a max-heap: invert so the lowest (priority, seq) pops first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// What one worker is doing
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerStatus {
    pub name: String,
    /// Task being run, `None` when idle
    pub task: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl WorkerStatus {
    fn idle(name: String) -> Self {
        Self {
            name,
            task: None,
            since: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.task.is_none()
    }
}

/// Handle to the result of a pool task
pub struct TaskHandle<T> {
    name: String,
    rx: oneshot::Receiver<T>,
}

impl<T> TaskHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the task to finish
    pub async fn join(self) -> Result<T, JobError> {
        self.rx.await.map_err(|_| JobError::TaskLost(self.name))
    }

    /// Returns the outcome if the task is no longer pending
    ///
    /// Only the first call after completion yields the value.
    pub fn poll_result(&mut self) -> Option<Result<T, JobError>> {
        match self.rx.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(JobError::TaskLost(self.name.clone())))
            }
        }
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<QueuedTask>>,
    notify: Notify,
    workers: Mutex<Vec<WorkerStatus>>,
    shutdown: CancellationToken,
}

/// Fixed-size pool of workers draining a priority queue
pub struct WorkerPool {
    shared: Arc<Shared>,
    next_seq: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `size` workers; they stop when `shutdown` is cancelled
    pub fn start(size: usize, shutdown: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            workers: Mutex::new(
                (0..size)
                    .map(|i| WorkerStatus::idle(format!("worker-{}", i)))
                    .collect(),
            ),
            shutdown,
        });

        let handles = (0..size)
            .map(|index| tokio::spawn(worker_loop(Arc::clone(&shared), index)))
            .collect();

        info!("Started worker pool with {} worker(s)", size);

        Self {
            shared,
            next_seq: AtomicU64::new(0),
            handles: Mutex::new(handles),
        }
    }

    /// Queues `future` and returns a handle to its output
    pub fn add_function<F, T>(&self, name: impl Into<String>, priority: u8, future: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = oneshot::channel();
        let task: BoxedTask = Box::pin(async move {
            // The handle may have been dropped; the result is then discarded.
            let _ = tx.send(future.await);
        });

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.shared.queue.lock().unwrap().push(QueuedTask {
            priority,
            seq,
            name: name.clone(),
            future: task,
        });
        self.shared.notify.notify_one();

        debug!("Queued task {} (priority {})", name, priority);
        TaskHandle { name, rx }
    }

    /// Number of tasks waiting for a worker
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Drops every pending task; their handles resolve to `TaskLost`
    pub fn clear_queue(&self) -> usize {
        // Tasks may clean up when dropped; do it with the queue unlocked
        let pending: Vec<QueuedTask> = self.shared.queue.lock().unwrap().drain().collect();
        let dropped = pending.len();
        drop(pending);
        if dropped > 0 {
            warn!("Dropped {} pending task(s)", dropped);
        }
        dropped
    }

    pub fn worker_status(&self) -> Vec<WorkerStatus> {
        self.shared.workers.lock().unwrap().clone()
    }

    pub fn size(&self) -> usize {
        self.shared.workers.lock().unwrap().len()
    }

    /// Stops the workers after their current task and waits for them
    pub async fn shutdown(&self) {
        self.shared.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker exited abnormally: {}", e);
            }
        }
        self.clear_queue();
        info!("Worker pool stopped");
    }
}

async fn worker_loop(shared: Arc<Shared>, index: usize) {
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        let next = shared.queue.lock().unwrap().pop();
        let Some(task) = next else {
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = shared.shutdown.cancelled() => break,
            }
            continue;
        };

        set_current(&shared, index, Some(task.name.clone()));
        debug!("Worker {} running {}", index, task.name);

        // A panic inside the task surfaces here as a JoinError
        if let Err(e) = tokio::spawn(task.future).await {
            error!("Task {} panicked: {}", task.name, e);
        }

        set_current(&shared, index, None);
    }

    debug!("Worker {} stopped", index);
}

fn set_current(shared: &Shared, index: usize, task: Option<String>) {
    let mut workers = shared.workers.lock().unwrap();
    if let Some(status) = workers.get_mut(index) {
        status.since = task.as_ref().map(|_| Utc::now());
        status.task = task;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_result_is_delivered() {
        let pool = WorkerPool::start(2, CancellationToken::new());
        let handle = pool.add_function("add", 1, async { 2 + 2 });
        assert_eq!(handle.join().await.unwrap(), 4);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_lower_priority_runs_first() {
        let pool = WorkerPool::start(1, CancellationToken::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single worker so the next tasks queue up
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = pool.add_function("blocker", 0, async move {
            let _ = release_rx.await;
        });
        while pool.queue_len() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut handles = Vec::new();
        for (name, priority) in [("late", 9u8), ("early", 1), ("middle", 5), ("early-2", 1)] {
            let order = Arc::clone(&order);
            handles.push(pool.add_function(name, priority, async move {
                order.lock().unwrap().push(name);
            }));
        }
        assert_eq!(pool.queue_len(), 4);

        release_tx.send(()).unwrap();
        blocker.join().await.unwrap();
        for handle in handles {
            handle.join().await.unwrap();
        }

        assert_eq!(
            *order.lock().unwrap(),
            vec!["early", "early-2", "middle", "late"]
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::start(1, CancellationToken::new());
        let bad = pool.add_function("bad", 1, async {
            panic!("boom");
        });
        assert!(matches!(bad.join().await, Err(JobError::TaskLost(name)) if name == "bad"));

        let good = pool.add_function("good", 1, async { "still alive" });
        assert_eq!(good.join().await.unwrap(), "still alive");
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_status_and_clear_queue() {
        let pool = WorkerPool::start(1, CancellationToken::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let running = pool.add_function("slow", 1, async move {
            let _ = release_rx.await;
        });

        while pool.worker_status()[0].is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.worker_status()[0].task.as_deref(), Some("slow"));

        let mut pending = pool.add_function("pending", 1, async { 1 });
        assert_eq!(pool.clear_queue(), 1);
        assert_eq!(pool.queue_len(), 0);
        assert!(matches!(pending.poll_result(), Some(Err(JobError::TaskLost(_)))));

        release_tx.send(()).unwrap();
        running.join().await.unwrap();
        pool.shutdown().await;
    }
}
