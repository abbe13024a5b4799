//! Lane scheduler — named FIFO queues with per-lane concurrency caps.
//!
//! Same-session work goes through a `session:<key>` lane at concurrency 1,
//! so transcript writes never interleave. Workload-class lanes (`subagent`,
//! `main`, `cron`) run at their own configurable widths. Lanes are created
//! on demand and hold no worker tasks while idle.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lane name for delegated sub-agent runs.
pub const SUBAGENT_LANE: &str = "subagent";

/// Conventional lane name prefix for per-session lanes.
pub fn session_lane(session_key: &str) -> String {
    format!("session:{session_key}")
}

/// Errors surfaced by the scheduler itself. Task errors travel inside the
/// task's own return value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaneError {
    /// The task's context was cancelled before it started.
    #[error("task cancelled before execution")]
    Cancelled,
}

type Job = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Telemetry callback invoked when a task waited longer than the
/// configured threshold: `(wait, queued_ahead_at_enqueue)`.
pub type WaitCallback = Arc<dyn Fn(Duration, usize) + Send + Sync>;

/// Per-enqueue options.
#[derive(Clone, Default)]
pub struct EnqueueOptions {
    /// Override the scheduler-wide wait warning threshold.
    pub warn_after: Option<Duration>,
    /// Called (once, at launch) if the task waited longer than the threshold.
    pub on_wait: Option<WaitCallback>,
}

struct QueuedTask {
    id: u64,
    job: Job,
    cancel: CancellationToken,
    enqueued_at: Instant,
    queued_ahead: usize,
    warn_after: Duration,
    on_wait: Option<WaitCallback>,
}

struct LaneState {
    queued: VecDeque<QueuedTask>,
    active: usize,
    max_concurrent: usize,
}

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct LaneSchedulerConfig {
    /// Concurrency for lanes that were never explicitly configured.
    pub default_concurrency: usize,
    /// Wait threshold before the telemetry warning fires.
    pub warn_after: Duration,
}

impl Default for LaneSchedulerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 1,
            warn_after: Duration::from_secs(5),
        }
    }
}

/// Named serial (or bounded-concurrent) task queues.
pub struct LaneScheduler {
    lanes: Mutex<HashMap<String, LaneState>>,
    next_id: AtomicU64,
    config: LaneSchedulerConfig,
}

impl LaneScheduler {
    /// Create a scheduler with the given defaults.
    pub fn new(config: LaneSchedulerConfig) -> Arc<Self> {
        Arc::new(LaneScheduler {
            lanes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            config,
        })
    }

    /// Place `task` on `lane` and wait for it to finish.
    ///
    /// The task receives a child view of `cancel`; cancelling before launch
    /// removes the entry from the queue, cancelling during execution is the
    /// task's own business. Task errors (inside `T`) propagate to the caller
    /// and do not poison the lane.
    pub async fn enqueue<T, F, Fut>(
        self: &Arc<Self>,
        lane: &str,
        cancel: CancellationToken,
        task: F,
    ) -> Result<T, LaneError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue_with_opts(lane, cancel, EnqueueOptions::default(), task)
            .await
    }

    /// `enqueue` with explicit wait-telemetry options.
    pub async fn enqueue_with_opts<T, F, Fut>(
        self: &Arc<Self>,
        lane: &str,
        cancel: CancellationToken,
        opts: EnqueueOptions,
        task: F,
    ) -> Result<T, LaneError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel::<T>();

        let task_cancel = cancel.clone();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let out = task(task_cancel).await;
                let _ = tx.send(out);
            })
        });

        {
            let mut lanes = self.lanes.lock().unwrap();
            let state = lanes.entry(lane.to_string()).or_insert_with(|| LaneState {
                queued: VecDeque::new(),
                active: 0,
                max_concurrent: self.config.default_concurrency,
            });
            let queued_ahead = state.queued.len() + state.active;
            state.queued.push_back(QueuedTask {
                id,
                job,
                cancel: cancel.clone(),
                enqueued_at: Instant::now(),
                queued_ahead,
                warn_after: opts.warn_after.unwrap_or(self.config.warn_after),
                on_wait: opts.on_wait,
            });
        }
        self.pump(lane);

        tokio::select! {
            _ = cancel.cancelled() => {
                if self.remove_queued(lane, id) {
                    return Err(LaneError::Cancelled);
                }
                // Already launched — the task sees the cancellation itself.
                rx.await.map_err(|_| LaneError::Cancelled)
            }
            res = &mut rx => res.map_err(|_| LaneError::Cancelled),
        }
    }

    /// Adjust a lane's concurrency cap. In-flight tasks are unaffected.
    pub fn set_concurrency(self: &Arc<Self>, lane: &str, max_concurrent: usize) {
        {
            let mut lanes = self.lanes.lock().unwrap();
            let state = lanes.entry(lane.to_string()).or_insert_with(|| LaneState {
                queued: VecDeque::new(),
                active: 0,
                max_concurrent: self.config.default_concurrency,
            });
            state.max_concurrent = max_concurrent.max(1);
        }
        self.pump(lane);
    }

    /// Number of tasks waiting in a lane's queue.
    pub fn queue_depth(&self, lane: &str) -> usize {
        let lanes = self.lanes.lock().unwrap();
        lanes.get(lane).map_or(0, |s| s.queued.len())
    }

    /// Number of tasks a lane is currently executing.
    pub fn active(&self, lane: &str) -> usize {
        let lanes = self.lanes.lock().unwrap();
        lanes.get(lane).map_or(0, |s| s.active)
    }

    /// Launch queued tasks while the lane is under its cap.
    fn pump(self: &Arc<Self>, lane: &str) {
        loop {
            let task = {
                let mut lanes = self.lanes.lock().unwrap();
                let state = match lanes.get_mut(lane) {
                    Some(s) => s,
                    None => return,
                };
                if state.active >= state.max_concurrent {
                    return;
                }
                // Skip entries cancelled while queued.
                let task = loop {
                    match state.queued.pop_front() {
                        Some(t) if t.cancel.is_cancelled() => {
                            debug!(lane = lane, task = t.id, "dropping cancelled queued task");
                            continue;
                        }
                        Some(t) => break t,
                        None => return,
                    }
                };
                state.active += 1;
                task
            };

            let waited = task.enqueued_at.elapsed();
            if waited > task.warn_after {
                warn!(
                    lane = lane,
                    wait_ms = waited.as_millis() as u64,
                    queued_ahead = task.queued_ahead,
                    "lane task waited past threshold"
                );
                if let Some(cb) = &task.on_wait {
                    cb(waited, task.queued_ahead);
                }
            }

            let sched = Arc::clone(self);
            let lane_name = lane.to_string();
            tokio::spawn(async move {
                (task.job)().await;
                sched.task_finished(&lane_name);
            });
        }
    }

    fn task_finished(self: &Arc<Self>, lane: &str) {
        {
            let mut lanes = self.lanes.lock().unwrap();
            if let Some(state) = lanes.get_mut(lane) {
                state.active = state.active.saturating_sub(1);
            }
        }
        self.pump(lane);
    }

    /// Remove a still-queued task. Returns false if it already launched.
    fn remove_queued(&self, lane: &str, id: u64) -> bool {
        let mut lanes = self.lanes.lock().unwrap();
        if let Some(state) = lanes.get_mut(lane) {
            let before = state.queued.len();
            state.queued.retain(|t| t.id != id);
            return state.queued.len() < before;
        }
        false
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
