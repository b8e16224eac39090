//! Named recurring jobs with broadcast run notifications

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{CleanupError, Result};

/// A schedulable unit of work; called once per run
pub type JobTask = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Notification emitted by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Succeeded { job_id: String },
    Failed { job_id: String, error: String },
    Removed { job_id: String },
}

impl JobEvent {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Succeeded { job_id }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Removed { job_id } => job_id,
        }
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Registry of recurring jobs
///
/// Each job runs immediately when added and then every `interval`. Every run
/// is spawned on its own task, so a slow run overlaps the next tick instead
/// of delaying it. Errors and panics inside a run are reported as
/// [`JobEvent::Failed`] and never stop the timer.
pub struct Scheduler {
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
    events: broadcast::Sender<JobEvent>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            jobs: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Receive job notifications from this point on
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Register a job and run it right away
    ///
    /// Fails without side effects if `job_id` is taken or `interval` is zero.
    /// Must be called from within a Tokio runtime.
    pub fn add_job(&self, job_id: &str, interval: Duration, task: JobTask) -> Result<()> {
        if interval.is_zero() {
            return Err(CleanupError::InvalidInterval(format!(
                "job '{}' needs a positive interval",
                job_id
            )));
        }

        let mut jobs = self.lock_jobs()?;
        if jobs.contains_key(job_id) {
            return Err(CleanupError::JobAlreadyExists(job_id.to_string()));
        }

        let handle = tokio::spawn(run_timer(
            job_id.to_string(),
            interval,
            task,
            self.events.clone(),
        ));
        jobs.insert(job_id.to_string(), handle);

        info!(job_id, interval_secs = interval.as_secs(), "Scheduled job");
        Ok(())
    }

    /// Cancel future runs of a job; a run already in flight completes
    pub fn remove_job(&self, job_id: &str) -> Result<()> {
        let handle = self
            .lock_jobs()?
            .remove(job_id)
            .ok_or_else(|| CleanupError::JobNotFound(job_id.to_string()))?;

        handle.abort();
        self.notify(JobEvent::Removed {
            job_id: job_id.to_string(),
        });
        info!(job_id, "Removed job");
        Ok(())
    }

    /// Cancel every job and clear the registry
    pub fn stop_all(&self) {
        let drained: Vec<(String, JoinHandle<()>)> = match self.jobs.lock() {
            Ok(mut jobs) => jobs.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };

        for (job_id, handle) in drained {
            handle.abort();
            self.notify(JobEvent::Removed { job_id });
        }
    }

    /// Ids of the registered jobs, in no particular order
    pub fn list_jobs(&self) -> Vec<String> {
        self.jobs
            .lock()
            .map(|jobs| jobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock_jobs(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>>> {
        self.jobs
            .lock()
            .map_err(|e| CleanupError::Unknown(format!("Scheduler registry poisoned: {}", e)))
    }

    fn notify(&self, event: JobEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let jobs = match self.jobs.get_mut() {
            Ok(jobs) => jobs,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, handle) in jobs.drain() {
            handle.abort();
        }
    }
}

async fn run_timer(
    job_id: String,
    period: Duration,
    task: JobTask,
    events: broadcast::Sender<JobEvent>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // First tick completes immediately
        ticker.tick().await;
        debug!(job_id = %job_id, "Starting job run");
        tokio::spawn(run_once(job_id.clone(), task.clone(), events.clone()));
    }
}

async fn run_once(job_id: String, task: JobTask, events: broadcast::Sender<JobEvent>) {
    // Build the future inside the guarded block so a panicking task body is caught too
    let outcome = AssertUnwindSafe(async move { task().await })
        .catch_unwind()
        .await;

    let event = match outcome {
        Ok(Ok(())) => JobEvent::Succeeded { job_id },
        Ok(Err(e)) => {
            warn!(job_id = %job_id, "Job run failed: {}", e);
            JobEvent::Failed {
                job_id,
                error: e.to_string(),
            }
        }
        Err(panic) => {
            let error = panic_message(panic.as_ref());
            warn!(job_id = %job_id, "Job run panicked: {}", error);
            JobEvent::Failed { job_id, error }
        }
    };

    let _ = events.send(event);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

/// Wrap an async closure as a [`JobTask`]
pub fn job<F, Fut>(f: F) -> JobTask
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: Arc<AtomicUsize>) -> JobTask {
        job(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_immediately_then_periodically() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_job("A", Duration::from_secs(60), counting_job(counter.clone()))
            .unwrap();

        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_add_fails_and_first_keeps_running() {
        let scheduler = Scheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler
            .add_job("A", Duration::from_secs(10), counting_job(first.clone()))
            .unwrap();
        let err = scheduler
            .add_job("A", Duration::from_secs(10), counting_job(second.clone()))
            .unwrap_err();
        assert!(matches!(err, CleanupError::JobAlreadyExists(ref id) if id == "A"));

        tokio::time::sleep(Duration::from_secs(25)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 3);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.list_jobs(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_unknown_job_fails() {
        let scheduler = Scheduler::new();
        scheduler
            .add_job("A", Duration::from_secs(3600), counting_job(Arc::default()))
            .unwrap();

        let err = scheduler.remove_job("B").unwrap_err();
        assert_eq!(err.to_string(), "Job 'B' does not exist");
        assert_eq!(scheduler.list_jobs(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let scheduler = Scheduler::new();
        let err = scheduler
            .add_job("A", Duration::ZERO, counting_job(Arc::default()))
            .unwrap_err();
        assert!(matches!(err, CleanupError::InvalidInterval(_)));
        assert!(scheduler.list_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_for_success_failure_and_removal() {
        let scheduler = Scheduler::new();
        let mut events = scheduler.subscribe();

        scheduler
            .add_job("ok", Duration::from_secs(60), counting_job(Arc::default()))
            .unwrap();
        settle().await;
        assert_eq!(
            events.recv().await.unwrap(),
            JobEvent::Succeeded {
                job_id: "ok".to_string()
            }
        );

        scheduler
            .add_job(
                "bad",
                Duration::from_secs(60),
                job(|| async { Err(CleanupError::ApiError("quota".to_string())) }),
            )
            .unwrap();
        settle().await;
        match events.recv().await.unwrap() {
            JobEvent::Failed { job_id, error } => {
                assert_eq!(job_id, "bad");
                assert!(error.contains("quota"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        scheduler.remove_job("ok").unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            JobEvent::Removed {
                job_id: "ok".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_run_does_not_stop_timer() {
        let scheduler = Scheduler::new();
        let mut events = scheduler.subscribe();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();

        scheduler
            .add_job(
                "panicky",
                Duration::from_secs(5),
                job(move || {
                    let runs = runs_clone.clone();
                    async move {
                        if runs.fetch_add(1, Ordering::SeqCst) < usize::MAX {
                            panic!("boom");
                        }
                        Ok(())
                    }
                }),
            )
            .unwrap();

        settle().await;
        match events.recv().await.unwrap() {
            JobEvent::Failed { error, .. } => assert!(error.contains("boom")),
            other => panic!("unexpected event {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_before_future_is_built_is_reported() {
        let scheduler = Scheduler::new();
        let mut events = scheduler.subscribe();
        let task: JobTask = Arc::new(|| -> BoxFuture<'static, Result<()>> {
            panic!("setup failed")
        });

        scheduler
            .add_job("eager", Duration::from_secs(60), task)
            .unwrap();
        settle().await;

        match events.recv().await {
            Ok(JobEvent::Failed { job_id, error }) => {
                assert_eq!(job_id, "eager");
                assert!(error.contains("setup failed"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(scheduler.list_jobs(), vec!["eager".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_clears_registry() {
        let scheduler = Scheduler::new();
        let mut events = scheduler.subscribe();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler
            .add_job("A", Duration::from_secs(10), counting_job(counter.clone()))
            .unwrap();
        scheduler
            .add_job("B", Duration::from_secs(10), counting_job(counter.clone()))
            .unwrap();
        settle().await;

        scheduler.stop_all();
        assert!(scheduler.list_jobs().is_empty());

        let mut removed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let JobEvent::Removed { job_id } = event {
                removed.push(job_id);
            }
        }
        removed.sort();
        assert_eq!(removed, vec!["A".to_string(), "B".to_string()]);

        let before = counter.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), before);
    }
}
