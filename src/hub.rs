use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::effects::{Broadcast, Group};


pub(crate) type ConnId = u64;

/// Answers whether a user currently has a socket open on a thread.
pub(crate) trait Presence {
    fn is_viewing(&self, user_id: u64, thread_id: u64) -> bool;
}

/// No connection is viewing anything; used by jobs and HTTP-originated changes in tests.
pub(crate) struct Nobody;
impl Presence for Nobody {
    fn is_viewing(&self, _user_id: u64, _thread_id: u64) -> bool { false }
}

impl Presence for HashSet<(u64, u64)> {
    fn is_viewing(&self, user_id: u64, thread_id: u64) -> bool {
        self.contains(&(user_id, thread_id))
    }
}


#[derive(Default)]
struct HubInner {
    groups: HashMap<Group, HashMap<ConnId, mpsc::Sender<String>>>,
    memberships: HashMap<ConnId, Vec<Group>>,
    /// user id -> connection -> thread being viewed
    viewing: HashMap<u64, HashMap<ConnId, Option<u64>>>,
}

/// Process-local registry of WebSocket connections and the groups they joined.
#[derive(Default)]
pub(crate) struct Hub {
    inner: Mutex<HubInner>,
    next_conn: AtomicU64,
}

impl Hub {
    fn lock(&self) -> MutexGuard<'_, HubInner> {
        // the maps stay consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, user_id: u64, groups: Vec<Group>, sender: mpsc::Sender<String>) -> ConnId {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
        let mut inner = self.lock();
        for group in &groups {
            inner.groups.entry(*group).or_default().insert(conn, sender.clone());
        }
        inner.memberships.insert(conn, groups);
        inner.viewing.entry(user_id).or_default().insert(conn, None);
        debug!(conn, user_id, "connection registered");
        conn
    }

    pub fn unregister(&self, user_id: u64, conn: ConnId) {
        let mut inner = self.lock();
        if let Some(groups) = inner.memberships.remove(&conn) {
            for group in groups {
                let now_empty = match inner.groups.get_mut(&group) {
                    Some(members) => {
                        members.remove(&conn);
                        members.is_empty()
                    },
                    None => false,
                };
                if now_empty {
                    inner.groups.remove(&group);
                }
            }
        }
        let user_gone = match inner.viewing.get_mut(&user_id) {
            Some(conns) => {
                conns.remove(&conn);
                conns.is_empty()
            },
            None => false,
        };
        if user_gone {
            inner.viewing.remove(&user_id);
        }
        debug!(conn, user_id, "connection unregistered");
    }

    pub fn set_viewing(&self, user_id: u64, conn: ConnId, thread_id: Option<u64>) {
        let mut inner = self.lock();
        inner.viewing.entry(user_id).or_default().insert(conn, thread_id);
    }

    /// Sends `payload` to every connection in `group`; returns how many were reached.
    pub fn send(&self, group: Group, payload: &str) -> usize {
        let senders: Vec<(ConnId, mpsc::Sender<String>)> = {
            let inner = self.lock();
            match inner.groups.get(&group) {
                Some(members) => members.iter().map(|(c, s)| (*c, s.clone())).collect(),
                None => return 0,
            }
        };

        let mut reached = 0;
        for (conn, sender) in senders {
            match sender.try_send(payload.to_owned()) {
                Ok(()) => reached += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(conn, %group, "connection queue full; dropping frame");
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(conn, %group, "connection already closed");
                },
            }
        }
        reached
    }

    pub fn deliver(&self, broadcast: &Broadcast) -> usize {
        let text = broadcast.payload.to_string();
        self.send(broadcast.group, &text)
    }

    pub fn connection_count(&self) -> usize {
        self.lock().memberships.len()
    }
}

impl Presence for Hub {
    fn is_viewing(&self, user_id: u64, thread_id: u64) -> bool {
        self.lock()
            .viewing
            .get(&user_id)
            .map(|conns| conns.values().any(|v| *v == Some(thread_id)))
            .unwrap_or(false)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_reaches_group_members_only() {
        let hub = Hub::default();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        hub.register(1, vec![Group::User(1), Group::Pharmacy(7)], tx1);
        hub.register(2, vec![Group::User(2), Group::Pharmacy(7)], tx2);

        assert_eq!(hub.send(Group::User(1), "one"), 1);
        assert_eq!(hub.send(Group::Pharmacy(7), "all"), 2);
        assert_eq!(hub.send(Group::Thread(3), "nobody"), 0);

        assert_eq!(rx1.try_recv().unwrap(), "one");
        assert_eq!(rx1.try_recv().unwrap(), "all");
        assert_eq!(rx2.try_recv().unwrap(), "all");
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn viewing_follows_any_open_connection() {
        let hub = Hub::default();
        let (tx, _rx) = mpsc::channel(4);
        let first = hub.register(5, vec![Group::User(5)], tx.clone());
        let second = hub.register(5, vec![Group::Thread(9)], tx);

        assert!(!hub.is_viewing(5, 9));
        hub.set_viewing(5, second, Some(9));
        assert!(hub.is_viewing(5, 9));
        hub.set_viewing(5, first, Some(3));
        assert!(hub.is_viewing(5, 9));
        assert!(hub.is_viewing(5, 3));

        hub.unregister(5, second);
        assert!(!hub.is_viewing(5, 9));
        assert_eq!(hub.send(Group::Thread(9), "x"), 0);
        hub.unregister(5, first);
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn full_queue_drops_frame() {
        let hub = Hub::default();
        let (tx, mut rx) = mpsc::channel(1);
        hub.register(1, vec![Group::User(1)], tx);
        assert_eq!(hub.send(Group::User(1), "a"), 1);
        assert_eq!(hub.send(Group::User(1), "b"), 0);
        assert_eq!(rx.try_recv().unwrap(), "a");
    }
}
