use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::effects::{Effects, JobChange, ScheduledJob};
use crate::error::AppResult;
use crate::hub::Hub;
use crate::model::Config;
use crate::reminders;
use crate::scheduler::Scheduler;
use crate::store::Database;


/// Everything a request, socket or job needs.
pub(crate) struct AppState {
    pub config: Config,
    pub db: RwLock<Database>,
    pub hub: Hub,
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(config: Config, db: Database) -> Arc<AppState> {
        Arc::new(AppState {
            config,
            db: RwLock::new(db),
            hub: Hub::default(),
            scheduler: Scheduler::default(),
        })
    }

    pub fn persist(&self, db: &Database) -> AppResult<()> {
        match &self.config.data_path {
            Some(path) => db.store(Path::new(path)),
            None => Ok(()),
        }
    }

    /// Runs a mutating operation under the write lock, stores the data and
    /// applies the effects once the lock is released. A failed operation or
    /// store leaves the data as it was.
    pub async fn mutate<T, F>(self: &Arc<Self>, op: F) -> AppResult<T>
    where
        F: FnOnce(&mut Database) -> AppResult<(T, Effects)>,
    {
        let (value, effects) = {
            let mut db = self.db.write().await;
            let snapshot = db.clone();
            let outcome = op(&mut db).and_then(|outcome| {
                self.persist(&db)?;
                Ok(outcome)
            });
            match outcome {
                Ok(outcome) => outcome,
                Err(e) => {
                    debug!("operation failed, rolling back: {}", e);
                    *db = snapshot;
                    return Err(e);
                },
            }
        };
        self.apply(effects);
        Ok(value)
    }

    /// Pushes broadcasts to the hub and hands job changes to the scheduler.
    pub fn apply(self: &Arc<Self>, effects: Effects) {
        for broadcast in &effects.broadcasts {
            let reached = self.hub.deliver(broadcast);
            debug!(group = %broadcast.group, reached, "broadcast delivered");
        }
        for change in effects.jobs {
            match change {
                JobChange::Schedule(job) => {
                    let state = Arc::clone(self);
                    self.scheduler.schedule(job, move |job| async move {
                        state.fire(job).await;
                    });
                },
                JobChange::Revoke(task_id) => {
                    self.scheduler.revoke(&task_id);
                },
            }
        }
    }

    async fn fire(self: Arc<Self>, job: ScheduledJob) {
        let effects = {
            let mut db = self.db.write().await;
            let effects = reminders::fire_reminder(&mut db, job.time_id, &job.task_id, Local::now());
            if let Err(e) = self.persist(&db) {
                error!("failed to store data after reminder job {}: {}", job.task_id, e);
            }
            effects
        };
        self.apply(effects);
    }

    /// Archives expired reminders; run at startup and then periodically.
    pub async fn sweep(self: &Arc<Self>) {
        let effects = {
            let mut db = self.db.write().await;
            let effects = reminders::archive_expired(&mut db, Local::now());
            if let Err(e) = self.persist(&db) {
                error!("failed to store data after sweep: {}", e);
            }
            effects
        };
        if !effects.jobs.is_empty() {
            info!(revoked = effects.revoked().count(), "expired reminders archived");
        }
        self.apply(effects);
    }

    /// Queues a job for every running reminder time.
    pub async fn resume_reminders(self: &Arc<Self>) {
        let effects = {
            let mut db = self.db.write().await;
            reminders::resume_all(&mut db, Local::now())
        };
        info!(jobs = effects.scheduled().count(), "reminder jobs resumed");
        self.apply(effects);
    }
}

/// Spawns the periodic reminder sweep.
pub(crate) fn spawn_sweeper(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(state.config.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            // the first tick completes immediately
            interval.tick().await;
            state.sweep().await;
        }
    })
}


#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use tokio::sync::mpsc;

    use super::*;
    use crate::effects::Group;
    use crate::testutil::{self, Fixture};

    fn state_with(fx: Fixture) -> (Arc<AppState>, Fixture) {
        (AppState::new(testutil::config(), fx.db.clone()), fx)
    }

    #[tokio::test]
    async fn mutate_applies_broadcasts_after_commit() {
        let (state, fx) = state_with(Fixture::new());
        let (tx, mut rx) = mpsc::channel(8);
        state.hub.register(fx.patient_user, vec![Group::User(fx.patient_user)], tx);

        let user = fx.patient_user;
        let value = state.mutate(|db| {
            let mut effects = Effects::default();
            crate::notify::counts_update(db, user, &mut effects);
            Ok((7, effects))
        }).await.unwrap();
        assert_eq!(value, 7);

        let frame = rx.recv().await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["notification"]["type"], "counts");
    }

    #[tokio::test]
    async fn failed_operation_applies_nothing() {
        let (state, _fx) = state_with(Fixture::new());
        let outcome: AppResult<()> = state.mutate(|db| {
            db.drug(4242)?;
            Ok(((), Effects::default()))
        }).await;
        assert!(outcome.is_err());
        assert_eq!(state.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn failed_operation_rolls_back_earlier_writes() {
        let (state, fx) = state_with(Fixture::new());
        let drug = fx.drug;
        let outcome: AppResult<()> = state.mutate(|db| {
            db.drug_mut(drug)?.stock = 0;
            db.drug(4242)?;
            Ok(((), Effects::default()))
        }).await;
        assert!(outcome.is_err());
        assert_eq!(state.db.read().await.drug(drug).unwrap().stock, 40);
    }

    #[tokio::test]
    async fn refill_request_failing_midway_changes_nothing() {
        let mut fx = Fixture::new();
        let rx = testutil::add_prescription(&mut fx, 30);
        // the sender lookup happens after the refill flag is set
        fx.db.accounts.remove(fx.patient_user);
        let (state, fx) = state_with(fx);

        let patient = fx.as_patient;
        let outcome = state.mutate(|db| {
            let effects = crate::prescriptions::request_refill(db, &crate::hub::Nobody, &patient, rx, chrono::Utc::now())?;
            Ok(((), effects))
        }).await;
        assert!(outcome.is_err());
        let db = state.db.read().await;
        assert!(!db.prescriptions.get(rx).unwrap().refill_pending);
        assert_eq!(db.threads.len(), 0);
    }

    #[tokio::test]
    async fn scheduled_reminder_fires_through_the_state() {
        let mut fx = Fixture::new();
        let reminder_id = {
            let rx = testutil::add_prescription(&mut fx, 30);
            let principal = crate::accounts::Principal { account_id: fx.patient_user, role: crate::model::Role::Patient };
            let (id, _) = reminders::create_reminder(&mut fx.db, &principal, reminders::NewReminder {
                prescription_id: rx,
                frequency: 1,
                times: vec!["23:59".to_owned()],
                day_amount: None,
            }, Local::now()).unwrap();
            id
        };
        let time_id = fx.db.times_of_reminder(reminder_id)[0];
        let task_id = fx.db.next_task_id(time_id);
        fx.db.reminder_times.get_mut(time_id).unwrap().task_id = Some(task_id.clone());

        let (state, fx) = state_with(fx);
        let (tx, mut rx) = mpsc::channel(8);
        state.hub.register(fx.patient_user, vec![Group::User(fx.patient_user)], tx);

        let mut effects = Effects::default();
        effects.schedule(ScheduledJob::new(task_id.clone(), time_id, Local::now() + ChronoDuration::milliseconds(20)));
        state.apply(effects);

        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(parsed["notification"]["type"], "reminder");

        // the next day's job replaced the fired one
        let next = state.db.read().await
            .reminder_time(time_id).unwrap()
            .task_id.clone().unwrap();
        assert_ne!(next, task_id);
        for _ in 0..200 {
            if state.scheduler.is_pending(&next) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(state.scheduler.is_pending(&next));
        assert!(!state.scheduler.is_pending(&task_id));
    }
}
