use crate::jobs::{Action, JobRegistry, JobState};
use crate::planner::Planner;
use crate::privileged::SystemExecutor;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const CANCEL_SETTLE: Duration = Duration::from_secs(5);
const SHUTDOWN_ERROR: &str = "cancelled by shutdown before start";
const ABORT_ERROR: &str = "aborted by shutdown while running";

#[derive(Clone, Debug)]
pub struct Task {
    pub job_id: String,
    pub action: Action,
}

#[derive(Clone, Copy, Debug)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum SubmitError {
    #[error("worker queue is full")]
    QueueFull,
    #[error("worker pool is shutting down")]
    Closed,
}

impl SubmitError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "pool_closed",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownOutcome {
    Drained,
    Cancelled { remaining: usize },
    AlreadyStopped,
}

// The slot is held until the worker finishes the task, so queued plus
// running tasks never exceed workers + queue_capacity.
struct QueuedTask {
    task: Task,
    _slot: OwnedSemaphorePermit,
}

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<QueuedTask>>>;

struct WorkerContext {
    jobs: Arc<JobRegistry>,
    planner: Planner,
    executor: Arc<dyn SystemExecutor>,
    cancel: CancellationToken,
    // Jobs between their Running transition and their recorded outcome.
    running: Mutex<HashSet<String>>,
}

impl WorkerContext {
    fn running(&self) -> MutexGuard<'_, HashSet<String>> {
        self.running.lock().unwrap_or_else(|err| err.into_inner())
    }
}

pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<QueuedTask>>>,
    queue: SharedQueue,
    slots: Arc<Semaphore>,
    workers: Mutex<Option<JoinSet<()>>>,
    context: Arc<WorkerContext>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Spawn the workers on the current tokio runtime.
    pub fn start(
        config: PoolConfig,
        jobs: Arc<JobRegistry>,
        planner: Planner,
        executor: Arc<dyn SystemExecutor>,
    ) -> Self {
        let workers = config.workers.max(1);
        let slots = workers + config.queue_capacity;
        let (sender, receiver) = mpsc::channel(slots);
        let queue: SharedQueue = Arc::new(tokio::sync::Mutex::new(receiver));
        let context = Arc::new(WorkerContext {
            jobs,
            planner,
            executor,
            cancel: CancellationToken::new(),
            running: Mutex::new(HashSet::new()),
        });

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(worker_loop(worker_id, Arc::clone(&queue), Arc::clone(&context)));
        }
        info!(
            workers,
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );

        Self {
            sender: Mutex::new(Some(sender)),
            queue,
            slots: Arc::new(Semaphore::new(slots)),
            workers: Mutex::new(Some(set)),
            context,
            closed: AtomicBool::new(false),
        }
    }

    fn lock_sender(&self) -> MutexGuard<'_, Option<mpsc::Sender<QueuedTask>>> {
        self.sender.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Enqueue without waiting.
    pub fn submit(&self, task: Task) -> Result<(), SubmitError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SubmitError::Closed);
        }

        let slot = match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(slot) => slot,
            Err(TryAcquireError::NoPermits) => return Err(SubmitError::QueueFull),
            Err(TryAcquireError::Closed) => return Err(SubmitError::Closed),
        };

        let sender = self.lock_sender();
        let Some(sender) = sender.as_ref() else {
            return Err(SubmitError::Closed);
        };
        match sender.try_send(QueuedTask { task, _slot: slot }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(TrySendError::Closed(_)) => Err(SubmitError::Closed),
        }
    }

    /// Stop intake, let workers drain the queue for up to `grace`, then
    /// cancel whatever is still running. Later calls return immediately.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        if self.closed.swap(true, Ordering::SeqCst) {
            return ShutdownOutcome::AlreadyStopped;
        }
        self.slots.close();
        self.lock_sender().take();

        let set = self
            .workers
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        let Some(mut set) = set else {
            return ShutdownOutcome::AlreadyStopped;
        };

        info!(grace_secs = grace.as_secs(), "worker pool draining");
        if tokio::time::timeout(grace, join_all(&mut set)).await.is_ok() {
            info!("worker pool drained");
            return ShutdownOutcome::Drained;
        }

        let remaining = set.len();
        warn!(remaining, "shutdown grace elapsed; cancelling running commands");
        self.context.cancel.cancel();
        if tokio::time::timeout(CANCEL_SETTLE, join_all(&mut set))
            .await
            .is_err()
        {
            error!(remaining = set.len(), "aborting unresponsive workers");
            set.abort_all();
            join_all(&mut set).await;
            self.fail_abandoned();
        }
        self.fail_unstarted().await;
        ShutdownOutcome::Cancelled { remaining }
    }

    // Aborted workers never record an outcome for the job they were running.
    fn fail_abandoned(&self) {
        let abandoned: Vec<String> = self.context.running().drain().collect();
        for job_id in abandoned {
            warn!(job_id = %job_id, "failing job abandoned by an aborted worker");
            let _ = self.context.jobs.transition(
                &job_id,
                JobState::Failed,
                Some(ABORT_ERROR.to_string()),
            );
        }
    }

    async fn fail_unstarted(&self) {
        let mut queue = self.queue.lock().await;
        while let Ok(queued) = queue.try_recv() {
            let _ = self.context.jobs.transition(
                &queued.task.job_id,
                JobState::Failed,
                Some(SHUTDOWN_ERROR.to_string()),
            );
        }
    }
}

async fn join_all(set: &mut JoinSet<()>) {
    while let Some(joined) = set.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(err = %err, "worker panicked");
            }
        }
    }
}

async fn worker_loop(worker_id: usize, queue: SharedQueue, ctx: Arc<WorkerContext>) {
    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            next = async { queue.lock().await.recv().await } => next,
        };
        let Some(queued) = next else {
            break;
        };
        run_task(worker_id, &ctx, &queued.task).await;
    }
}

async fn run_task(worker_id: usize, ctx: &WorkerContext, task: &Task) {
    // The forward-only transition is what guarantees single execution.
    if let Err(err) = ctx.jobs.transition(&task.job_id, JobState::Running, None) {
        warn!(worker_id, job_id = %task.job_id, kind = err.kind(), err = %err, "skipping task");
        return;
    }
    ctx.running().insert(task.job_id.clone());

    let distro = ctx.executor.distribution();
    info!(
        worker_id,
        job_id = %task.job_id,
        action = %task.action,
        distro = distro.as_str(),
        "job started"
    );

    let outcome = match ctx.planner.plan(distro, task.action) {
        Ok(commands) => {
            let mut result = Ok(());
            for command in &commands {
                info!(job_id = %task.job_id, command = %command, "running command");
                if let Err(err) = ctx.executor.run_privileged(command, &ctx.cancel).await {
                    warn!(
                        job_id = %task.job_id,
                        command = %command,
                        kind = err.kind(),
                        "command failed"
                    );
                    result = Err(err.to_string());
                    break;
                }
            }
            result
        }
        Err(err) => {
            warn!(job_id = %task.job_id, kind = err.kind(), "no command plan");
            Err(err.to_string())
        }
    };

    let transition = match outcome {
        Ok(()) => {
            info!(job_id = %task.job_id, "job succeeded");
            ctx.jobs.transition(&task.job_id, JobState::Succeeded, None)
        }
        Err(message) => {
            warn!(job_id = %task.job_id, error = %message, "job failed");
            ctx.jobs.transition(&task.job_id, JobState::Failed, Some(message))
        }
    };
    ctx.running().remove(&task.job_id);
    if let Err(err) = transition {
        error!(
            job_id = %task.job_id,
            kind = err.kind(),
            err = %err,
            "could not record job outcome"
        );
    }
}
