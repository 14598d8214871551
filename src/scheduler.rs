use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Local;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::effects::ScheduledJob;


type JobMap = HashMap<String, JoinHandle<()>>;

fn lock(jobs: &Mutex<JobMap>) -> MutexGuard<'_, JobMap> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Delayed one-shot jobs keyed by task id.
///
/// A job is forgotten as soon as it starts running, so revoking it from within
/// its own run is a no-op.
#[derive(Clone, Default)]
pub(crate) struct Scheduler {
    jobs: Arc<Mutex<JobMap>>,
}

impl Scheduler {
    /// Runs `fire(job)` at `job.eta`, or right away if that has passed.
    /// A pending job with the same task id is replaced.
    pub fn schedule<F, Fut>(&self, job: ScheduledJob, fire: F)
    where
        F: FnOnce(ScheduledJob) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = (job.eta - Local::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let task_id = job.task_id.clone();
        debug!(%task_id, time_id = job.time_id, delay_secs = delay.as_secs(), "job queued");

        let jobs = Arc::clone(&self.jobs);
        // hold the map while spawning so the task cannot forget itself before it is inserted
        let mut guard = lock(&self.jobs);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&jobs).remove(&job.task_id);
            debug!(task_id = %job.task_id, "job running");
            fire(job).await;
        });
        if let Some(previous) = guard.insert(task_id, handle) {
            previous.abort();
        }
    }

    /// Cancels a pending job; returns whether one was pending.
    pub fn revoke(&self, task_id: &str) -> bool {
        match lock(&self.jobs).remove(task_id) {
            Some(handle) => {
                handle.abort();
                debug!(task_id, "job revoked");
                true
            },
            None => false,
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_pending(&self, task_id: &str) -> bool {
        lock(&self.jobs).contains_key(task_id)
    }
}
