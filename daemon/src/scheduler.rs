//! Task Scheduler (C1), per spec.md §4.1.
//!
//! Each named task gets its own background loop. Non-overlap (I5/P6) is a
//! single `AtomicBool` guard per task rather than a `Mutex` around the body,
//! because the scheduler must be able to *see* that a task is busy and skip
//! the tick rather than block waiting for it.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

pub type TaskFn = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct TaskDef {
    pub id: String,
    pub interval: Duration,
    pub run_on_start: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub run_count: u64,
    pub last_run_at: Option<time::OffsetDateTime>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub current_interval: Option<Duration>,
}

struct RegisteredTask {
    def: TaskDef,
    f: TaskFn,
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    consecutive_failures: Arc<AtomicU32>,
    current_interval_ms: Arc<std::sync::atomic::AtomicU64>,
    stats: Arc<Mutex<TaskStats>>,
    trigger: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Runs named periodic and one-shot tasks. See spec.md §4.1 for the full
/// contract (non-overlap, pause/resume, cooperative shutdown, backoff).
pub struct Scheduler {
    tasks: HashMap<String, Arc<RegisteredTask>>,
    shutdown: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            shutdown: Arc::new(Notify::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn register(&mut self, def: TaskDef, f: TaskFn) {
        let task = Arc::new(RegisteredTask {
            def,
            f,
            running: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            current_interval_ms: Arc::new(std::sync::atomic::AtomicU64::new(0)),
            stats: Arc::new(Mutex::new(TaskStats::default())),
            trigger: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        });
        self.tasks.insert(task.def.id.clone(), task);
    }

    /// Starts every registered task's periodic loop. Callers that need the
    /// boot sequence from spec.md §4.1 ("explicitly trigger `payouts_sync`,
    /// `work_acceptor`, and `ad_creator` once, in that order, before
    /// enabling the periodic ticker") should call [`Scheduler::trigger`] for
    /// those ids first, then call this.
    pub async fn start(&self) {
        for task in self.tasks.values() {
            let loop_task = task.clone();
            let shutdown = self.shutdown.clone();
            let interval = task.def.interval;
            task.current_interval_ms
                .store(interval.as_millis() as u64, Ordering::SeqCst);
            let run_on_start = task.def.run_on_start;

            let join = tokio::spawn(async move {
                if run_on_start {
                    run_once(&loop_task).await;
                }
                loop {
                    let current = Duration::from_millis(
                        loop_task.current_interval_ms.load(Ordering::SeqCst),
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(current) => {}
                        _ = loop_task.trigger.notified() => {}
                        _ = shutdown.notified() => break,
                    }
                    if loop_task.paused.load(Ordering::SeqCst) {
                        continue;
                    }
                    run_once(&loop_task).await;
                }
            });
            *task.handle.lock().await = Some(join);
        }
    }

    /// Runs a task immediately, respecting the one-at-a-time rule: if the
    /// task is currently in flight, this is a no-op (spec.md §4.1(d)).
    pub fn trigger(&self, id: &str) {
        if let Some(task) = self.tasks.get(id) {
            task.trigger.notify_one();
        }
    }

    /// Runs a task immediately and waits for it to complete -- used for the
    /// boot sequence, which must finish before the periodic ticker starts.
    pub async fn trigger_and_wait(&self, id: &str) {
        if let Some(task) = self.tasks.get(id) {
            run_once(task).await;
        }
    }

    pub fn pause(&self, id: &str) {
        if let Some(task) = self.tasks.get(id) {
            task.paused.store(true, Ordering::SeqCst);
        }
    }

    pub fn resume(&self, id: &str) {
        if let Some(task) = self.tasks.get(id) {
            task.paused.store(false, Ordering::SeqCst);
            task.trigger.notify_one();
        }
    }

    pub async fn stats(&self, id: &str) -> Option<TaskStats> {
        let task = self.tasks.get(id)?;
        Some(task.stats.lock().await.clone())
    }

    /// Cancels cooperatively and waits for in-flight runs to finish, up to
    /// `grace_period` (default 30s per spec.md §4.1(c)).
    pub async fn stop(&self, grace_period: Option<Duration>) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let grace_period = grace_period.unwrap_or(DEFAULT_STOP_GRACE_PERIOD);
        for task in self.tasks.values() {
            let mut handle = task.handle.lock().await;
            if let Some(join) = handle.take() {
                match tokio::time::timeout(grace_period, join).await {
                    Ok(_) => {}
                    Err(_) => warn!(task_id = %task.def.id, "task did not stop within grace period"),
                }
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[instrument(skip(task), fields(task_id = %task.def.id))]
async fn run_once(task: &Arc<RegisteredTask>) {
    if task
        .running
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        // Previous run still in flight: skip, don't queue (spec.md §4.1(a)).
        return;
    }

    let result = (task.f)().await;
    task.running.store(false, Ordering::SeqCst);

    let mut stats = task.stats.lock().await;
    stats.run_count += 1;
    stats.last_run_at = Some(time::OffsetDateTime::now_utc());

    match result {
        Ok(()) => {
            task.consecutive_failures.store(0, Ordering::SeqCst);
            task.current_interval_ms.store(
                task.def.interval.as_millis() as u64,
                Ordering::SeqCst,
            );
            stats.last_error = None;
            stats.consecutive_failures = 0;
            stats.current_interval = Some(task.def.interval);
        }
        Err(err) => {
            error!(task_id = %task.def.id, error = %err, "task execution failed");
            let failures = task.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            stats.last_error = Some(err.to_string());
            stats.consecutive_failures = failures;

            if failures >= DEFAULT_FAILURE_THRESHOLD {
                let doubled = Duration::from_millis(
                    task.current_interval_ms.load(Ordering::SeqCst) * 2,
                );
                let capped = doubled.min(MAX_BACKOFF).max(task.def.interval);
                task.current_interval_ms
                    .store(capped.as_millis() as u64, Ordering::SeqCst);
                stats.current_interval = Some(capped);
                info!(task_id = %task.def.id, backoff_ms = capped.as_millis(), "widened task interval after repeated failures");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;

    #[tokio::test]
    async fn non_overlapping_ticks_run_exactly_once_concurrently() {
        let mut scheduler = Scheduler::new();
        let in_flight = Arc::new(Counter::new(0));
        let max_seen = Arc::new(Counter::new(0));
        let in_flight2 = in_flight.clone();
        let max_seen2 = max_seen.clone();

        scheduler.register(
            TaskDef {
                id: "t".into(),
                interval: Duration::from_millis(5),
                run_on_start: false,
            },
            Arc::new(move || {
                let in_flight = in_flight2.clone();
                let max_seen = max_seen2.clone();
                Box::pin(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(40)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        scheduler.stop(None).await;

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pause_prevents_new_ticks() {
        let mut scheduler = Scheduler::new();
        let count = Arc::new(Counter::new(0));
        let count2 = count.clone();
        scheduler.register(
            TaskDef {
                id: "t".into(),
                interval: Duration::from_millis(5),
                run_on_start: false,
            },
            Arc::new(move || {
                let count = count2.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );
        scheduler.start().await;
        scheduler.pause("t");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let paused_count = count.load(Ordering::SeqCst);
        scheduler.stop(None).await;
        assert_eq!(paused_count, 0);
    }

    #[tokio::test]
    async fn repeated_failures_widen_interval_and_reset_on_success() {
        let mut scheduler = Scheduler::new();
        let attempt = Arc::new(Counter::new(0));
        let attempt2 = attempt.clone();
        scheduler.register(
            TaskDef {
                id: "t".into(),
                interval: Duration::from_millis(1),
                run_on_start: false,
            },
            Arc::new(move || {
                let attempt = attempt2.clone();
                Box::pin(async move {
                    let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 5 {
                        anyhow::bail!("synthetic failure {n}")
                    }
                    Ok(())
                })
            }),
        );
        for _ in 0..6 {
            scheduler.trigger_and_wait("t").await;
        }
        let stats = scheduler.stats("t").await.unwrap();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.current_interval, Some(Duration::from_millis(1)));
    }
}
