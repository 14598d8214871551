use std::fmt;

use chrono::{DateTime, Local};
use derive_new::new;
use serde_json::Value;


/// A broadcast target, equivalent to a channel-layer group name.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum Group {
    User(u64),
    Pharmacy(u64),
    Thread(u64),
}
impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::User(id) => write!(f, "user_{}", id),
            Group::Pharmacy(id) => write!(f, "pharmacy_{}", id),
            Group::Thread(id) => write!(f, "thread_{}", id),
        }
    }
}

#[derive(Clone, Debug, new, PartialEq)]
pub(crate) struct Broadcast {
    pub group: Group,
    pub payload: Value,
}

#[derive(Clone, Debug, new, PartialEq)]
pub(crate) struct ScheduledJob {
    pub task_id: String,
    pub time_id: u64,
    pub eta: DateTime<Local>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum JobChange {
    Schedule(ScheduledJob),
    Revoke(String),
}

/// Side effects produced by a domain operation, applied once the database lock is released.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Effects {
    pub broadcasts: Vec<Broadcast>,
    pub jobs: Vec<JobChange>,
}

impl Effects {
    pub fn broadcast(&mut self, group: Group, payload: Value) {
        self.broadcasts.push(Broadcast::new(group, payload));
    }

    pub fn schedule(&mut self, job: ScheduledJob) {
        self.jobs.push(JobChange::Schedule(job));
    }

    pub fn revoke(&mut self, task_id: String) {
        self.jobs.push(JobChange::Revoke(task_id));
    }

    pub fn broadcasts_to(&self, group: Group) -> impl Iterator<Item = &Broadcast> {
        self.broadcasts.iter().filter(move |b| b.group == group)
    }

    pub fn scheduled(&self) -> impl Iterator<Item = &ScheduledJob> {
        self.jobs.iter().filter_map(|j| match j {
            JobChange::Schedule(job) => Some(job),
            JobChange::Revoke(_) => None,
        })
    }

    pub fn revoked(&self) -> impl Iterator<Item = &str> {
        self.jobs.iter().filter_map(|j| match j {
            JobChange::Schedule(_) => None,
            JobChange::Revoke(task_id) => Some(task_id.as_str()),
        })
    }
}
