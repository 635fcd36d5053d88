//! Bounded task execution and periodic scheduling.

use crate::error::{TaskError, TaskResult};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of concurrently running submitted tasks
    pub max_workers: usize,

    /// Maximum number of tasks waiting for a worker slot
    pub queue_size: usize,

    /// How long `shutdown` waits for in-flight tasks before giving up
    pub shutdown_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 40,
            queue_size: 100,
            shutdown_wait: Duration::from_secs(10),
        }
    }
}

/// Task scheduler backing the session store's background work.
///
/// One-shot tasks run on a bounded worker pool: when every worker slot is
/// taken and the wait queue is full, the submitting task runs the job inline
/// instead of dropping it. Periodic jobs are named, run at a fixed period and
/// survive their own failures. Panics are logged, never silently swallowed.
///
/// The scheduler is constructed and injected explicitly; the host application
/// owns its lifecycle and calls [`TaskScheduler::shutdown`] on the way out.
///
/// # Examples
///
/// ```no_run
/// use cloakroom_tasks::TaskScheduler;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), cloakroom_tasks::TaskError> {
/// let scheduler = TaskScheduler::new();
///
/// scheduler
///     .schedule_periodic("cleanup", Duration::from_secs(60), Duration::from_secs(60), || async {
///         // sweep expired entries
///         Ok(())
///     })?;
///
/// scheduler.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TaskScheduler {
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    periodic: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Create a scheduler with default configuration.
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with custom configuration.
    pub fn with_config(config: SchedulerConfig) -> Self {
        debug!(
            max_workers = config.max_workers,
            queue_size = config.queue_size,
            "Initializing task scheduler"
        );
        Self {
            permits: Arc::new(Semaphore::new(config.max_workers)),
            queued: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            periodic: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Submit a one-shot task.
    ///
    /// If a worker slot is free the task runs on it. If not, the task waits in
    /// the bounded queue. When the queue is full as well, the task runs inline
    /// on the submitting future, so submission applies backpressure instead of
    /// shedding load.
    pub async fn submit<F, Fut>(&self, label: &str, task: F) -> TaskResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TaskError::Rejected(label.to_string()));
        }

        let label = label.to_string();

        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                let fut = task();
                tokio::spawn(async move {
                    run_logged(&label, fut).await;
                    drop(permit);
                });
            }
            Err(_) if self.queued.load(Ordering::SeqCst) < self.config.queue_size => {
                self.queued.fetch_add(1, Ordering::SeqCst);
                let permits = self.permits.clone();
                let queued = self.queued.clone();
                let fut = task();
                tokio::spawn(async move {
                    let permit = permits.acquire_owned().await;
                    queued.fetch_sub(1, Ordering::SeqCst);
                    run_logged(&label, fut).await;
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(task = %label, "Worker pool saturated, running task on submitter");
                run_logged(&label, task()).await;
            }
        }

        Ok(())
    }

    /// Register a named periodic job.
    ///
    /// The first run happens after `initial_delay`, subsequent runs every
    /// `period`. A run that returns an error or panics is logged and does not
    /// cancel future runs. A slow run delays the next one but never overlaps
    /// it.
    pub fn schedule_periodic<F, Fut>(
        &self,
        name: &str,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) -> TaskResult<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            error!(job = %name, "Scheduler is shut down, discarding periodic job");
            return Err(TaskError::Rejected(name.to_string()));
        }

        let mut periodic = self.periodic.lock().expect("periodic job table poisoned");

        if periodic.contains_key(name) {
            return Err(TaskError::JobAlreadyExists(name.to_string()));
        }

        info!(job = %name, period_secs = period.as_secs(), "Scheduling periodic job");

        let job_name = name.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match AssertUnwindSafe(job()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(job = %job_name, error = %e, "Periodic job failed"),
                    Err(_) => error!(job = %job_name, "Periodic job panicked"),
                }
            }
        });

        periodic.insert(name.to_string(), handle);
        Ok(())
    }

    /// Spawn a named long-running task (e.g. a blocking subscription loop).
    ///
    /// The task is tracked and aborted at shutdown. It does not consume a
    /// worker slot: it is expected to live for the scheduler's lifetime.
    pub fn spawn_long_running<Fut>(&self, name: &str, fut: Fut) -> TaskResult<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TaskError::Rejected(name.to_string()));
        }

        let mut periodic = self.periodic.lock().expect("periodic job table poisoned");

        if periodic.contains_key(name) {
            return Err(TaskError::JobAlreadyExists(name.to_string()));
        }

        let label = name.to_string();
        let handle = tokio::spawn(async move {
            run_logged(&label, fut).await;
        });

        periodic.insert(name.to_string(), handle);
        Ok(())
    }

    /// Cancel a named periodic or long-running task.
    pub fn cancel(&self, name: &str) -> bool {
        let mut periodic = self.periodic.lock().expect("periodic job table poisoned");

        if let Some(handle) = periodic.remove(name) {
            handle.abort();
            debug!(job = %name, "Cancelled scheduled job");
            true
        } else {
            false
        }
    }

    /// Number of currently occupied worker slots.
    pub fn active_workers(&self) -> usize {
        self.config.max_workers - self.permits.available_permits()
    }

    /// Whether the scheduler still accepts work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting work, cancel scheduled jobs, and wait for in-flight
    /// tasks up to the configured bound. Proceeds regardless afterwards.
    pub async fn shutdown(&self) {
        info!("Shutting down task scheduler");
        self.running.store(false, Ordering::SeqCst);

        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut periodic = self.periodic.lock().expect("periodic job table poisoned");
            periodic.drain().collect()
        };

        for (name, handle) in handles {
            debug!(job = %name, "Cancelling scheduled job");
            handle.abort();
        }

        let drained = tokio::time::timeout(
            self.config.shutdown_wait,
            self.permits.acquire_many(self.config.max_workers as u32),
        )
        .await;

        match drained {
            Ok(_) => debug!("All workers drained"),
            Err(_) => warn!(
                wait_secs = self.config.shutdown_wait.as_secs(),
                "Workers still busy after shutdown wait, proceeding"
            ),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_logged(label: &str, fut: impl Future<Output = ()>) {
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        error!(task = %label, "Task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_submit_runs_task() {
        let scheduler = TaskScheduler::new();
        let counter = Arc::new(AtomicU32::new(0));

        let c = counter.clone();
        scheduler
            .submit("increment", move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_saturated_pool_runs_on_submitter() {
        let scheduler = TaskScheduler::with_config(SchedulerConfig {
            max_workers: 1,
            queue_size: 0,
            shutdown_wait: Duration::from_secs(1),
        });

        // Occupy the single worker slot.
        scheduler
            .submit("blocker", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Queue is zero-sized, so this runs inline and completes before
        // submit returns.
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        scheduler
            .submit("inline", move || async move {
                r.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_periodic_job_survives_failure() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicU32::new(0));

        let r = runs.clone();
        scheduler
            .schedule_periodic(
                "flaky",
                Duration::from_millis(0),
                Duration::from_millis(10),
                move || {
                    let r = r.clone();
                    async move {
                        let n = r.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            Err(TaskError::ExecutionFailed("first run fails".into()))
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_duplicate_periodic_job_rejected() {
        let scheduler = TaskScheduler::new();
        let job = || {
            scheduler.schedule_periodic(
                "sweep",
                Duration::from_secs(60),
                Duration::from_secs(60),
                || async { Ok(()) },
            )
        };

        job().unwrap();
        assert!(matches!(job(), Err(TaskError::JobAlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let scheduler = TaskScheduler::new();
        scheduler.shutdown().await;

        let result = scheduler.submit("late", || async {}).await;
        assert!(matches!(result, Err(TaskError::Rejected(_))));
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_cancel_stops_periodic_job() {
        let scheduler = TaskScheduler::new();
        let runs = Arc::new(AtomicU32::new(0));

        let r = runs.clone();
        scheduler
            .schedule_periodic(
                "cancellable",
                Duration::from_millis(0),
                Duration::from_millis(10),
                move || {
                    let r = r.clone();
                    async move {
                        r.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(scheduler.cancel("cancellable"));

        let after_cancel = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    }
}
