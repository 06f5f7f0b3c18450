use crate::error::GatewayError;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;
use tracing::{error, warn};

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_QUEUE_SIZE: usize = 1000;

type SharedResult = Arc<dyn Any + Send + Sync>;
type TaskOutcome = Result<SharedResult, GatewayError>;
type BoxedWork = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

/// Options for a single queued execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Tasks sharing a queue id run strictly one at a time, FIFO. Defaults to
    /// `"default"`; distinct ids run fully concurrently.
    pub queue_id: Option<String>,
    pub delay_before: Option<Duration>,
    pub delay_after: Option<Duration>,
    /// When a task with a unique key settles, every still-pending task in the
    /// same queue carrying the same key is resolved with the identical outcome
    /// without running its own work.
    pub unique_key: Option<String>,
    /// Caller-visible bound on a single task; defaults to one minute.
    pub timeout: Option<Duration>,
}

struct QueueTask {
    work: BoxedWork,
    tx: oneshot::Sender<TaskOutcome>,
    delay_before: Option<Duration>,
    delay_after: Option<Duration>,
    unique_key: Option<String>,
    timeout: Duration,
}

struct QueueState {
    pending: VecDeque<QueueTask>,
    running: bool,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueState>>,
    outstanding: AtomicUsize,
}

/// Named-queue task serializer.
///
/// Admission is bounded globally: past `MAX_QUEUE_SIZE` outstanding tasks,
/// enqueueing fails immediately instead of growing without limit. A worker is
/// started lazily on the first enqueue to an idle queue and exits when that
/// queue drains.
#[derive(Clone)]
pub struct ExecQueue {
    inner: Arc<Inner>,
}

impl Default for ExecQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                outstanding: AtomicUsize::new(0),
            }),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    pub async fn exec<T, Fut>(&self, work: Fut, options: ExecOptions) -> Result<T, GatewayError>
    where
        T: Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let queue_id = options
            .queue_id
            .unwrap_or_else(|| "default".to_string());

        if self.inner.outstanding.load(Ordering::SeqCst) >= MAX_QUEUE_SIZE {
            error!(
                queue_id,
                max = MAX_QUEUE_SIZE,
                "cannot exec more tasks, the execution queue is full"
            );
            return Err(GatewayError::QueueFull);
        }
        self.inner.outstanding.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        let boxed: BoxedWork = Box::pin(async move {
            work.await.map(|value| Arc::new(value) as SharedResult)
        });
        let task = QueueTask {
            work: boxed,
            tx,
            delay_before: options.delay_before,
            delay_after: options.delay_after,
            unique_key: options.unique_key,
            timeout: options.timeout.unwrap_or(DEFAULT_TASK_TIMEOUT),
        };

        let start_worker = {
            let mut queues = self
                .inner
                .queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let state = queues.entry(queue_id.clone()).or_insert_with(|| QueueState {
                pending: VecDeque::new(),
                running: false,
            });
            state.pending.push_back(task);
            if state.running {
                false
            } else {
                state.running = true;
                true
            }
        };

        if start_worker {
            let inner = self.inner.clone();
            let id = queue_id.clone();
            tokio::spawn(async move {
                drain_queue(inner, id).await;
            });
        }

        match rx.await {
            Ok(Ok(shared)) => shared
                .downcast::<T>()
                .map(|value| (*value).clone())
                .map_err(|_| {
                    GatewayError::Param(format!(
                        "coalesced result type mismatch on queue: {queue_id}"
                    ))
                }),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(queue_id, "queue worker dropped a task before settling it");
                Err(GatewayError::Transport(
                    "queue worker dropped the task".to_string(),
                ))
            }
        }
    }
}

async fn drain_queue(inner: Arc<Inner>, queue_id: String) {
    loop {
        let task = {
            let mut queues = inner
                .queues
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(state) = queues.get_mut(&queue_id) else {
                return;
            };
            match state.pending.pop_front() {
                Some(task) => task,
                None => {
                    state.running = false;
                    return;
                }
            }
        };

        let QueueTask {
            work,
            tx,
            delay_before,
            delay_after,
            unique_key,
            timeout,
        } = task;

        if let Some(delay) = delay_before {
            sleep(delay).await;
        }

        // The work future is owned here, so the timeout branch drops (and
        // thereby cancels) it before the queue advances.
        let outcome: TaskOutcome = tokio::select! {
            result = work => result,
            _ = sleep(timeout) => Err(GatewayError::Timeout { queue_id: queue_id.clone() }),
        };

        if let Some(key) = unique_key.as_deref() {
            let coalesced = take_matching(&inner, &queue_id, key);
            for waiter in coalesced {
                let _ = waiter.tx.send(outcome.clone());
                inner.outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let _ = tx.send(outcome);
        inner.outstanding.fetch_sub(1, Ordering::SeqCst);

        if let Some(delay) = delay_after {
            sleep(delay).await;
        }
    }
}

fn take_matching(inner: &Arc<Inner>, queue_id: &str, unique_key: &str) -> Vec<QueueTask> {
    let mut queues = inner
        .queues
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let Some(state) = queues.get_mut(queue_id) else {
        return Vec::new();
    };
    let mut kept = VecDeque::with_capacity(state.pending.len());
    let mut taken = Vec::new();
    while let Some(task) = state.pending.pop_front() {
        if task.unique_key.as_deref() == Some(unique_key) {
            taken.push(task);
        } else {
            kept.push_back(task);
        }
    }
    state.pending = kept;
    taken
}
