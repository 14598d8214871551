//! Notification rows and the counts-bearing payloads pushed to connected clients.
//!
//! Every per-user payload carries the two unread counters (`unread_count` for
//! the notification feed, `unread_messages` for message read statuses) so a
//! client never has to poll for them after a push.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::effects::{Effects, Group};
use crate::model::{Notification, StockStatus};
use crate::store::Database;


/// What a new notification row refers to.
#[derive(Clone, Debug, Default)]
pub(crate) struct NotificationTarget {
    pub message_id: Option<u64>,
    pub reminder_id: Option<u64>,
    pub prescription_id: Option<u64>,
    pub drug_id: Option<u64>,
    pub content: Option<String>,
    pub link: Option<String>,
}

pub(crate) fn create_notification(
    db: &mut Database,
    user_id: u64,
    target: NotificationTarget,
    now: DateTime<Utc>,
) -> u64 {
    db.notifications.insert_with(|id| Notification {
        id,
        user_id,
        message_id: target.message_id,
        reminder_id: target.reminder_id,
        prescription_id: target.prescription_id,
        drug_id: target.drug_id,
        content: target.content,
        link: target.link,
        time: now,
        is_read: false,
    })
}

/// Attaches the user's current unread counts to `data` and queues it for the user's group.
pub(crate) fn with_counts(db: &Database, user_id: u64, mut data: Map<String, Value>, effects: &mut Effects) {
    let (unread_count, unread_messages) = db.unread_counts(user_id);
    data.insert("unread_count".to_owned(), Value::from(unread_count));
    data.insert("unread_messages".to_owned(), Value::from(unread_messages));
    effects.broadcast(Group::User(user_id), json!({ "notification": Value::Object(data) }));
}

/// Pushes only the counters, e.g. after something was marked read.
pub(crate) fn counts_update(db: &Database, user_id: u64, effects: &mut Effects) {
    let mut data = Map::new();
    data.insert("type".to_owned(), Value::from("counts"));
    with_counts(db, user_id, data, effects);
}

/// Per-pharmacy summary pushed to every staff socket of the pharmacy.
pub(crate) fn pharmacy_update(db: &Database, pharmacy_id: u64, event: &str, effects: &mut Effects) {
    let pending_refills = db.prescriptions.values()
        .filter(|p| p.refill_pending)
        .filter(|p| db.drugs.get(p.drug_id).map(|d| d.pharmacy_id == pharmacy_id).unwrap_or(false))
        .count();
    let pharmacy_drugs = || db.drugs.values().filter(|d| d.pharmacy_id == pharmacy_id);
    let pending_resupplies = pharmacy_drugs().filter(|d| d.resupply_pending).count();
    let low_stock = pharmacy_drugs().filter(|d| d.status == StockStatus::LowStock).count();
    let out_of_stock = pharmacy_drugs().filter(|d| d.status == StockStatus::OutOfStock).count();

    effects.broadcast(Group::Pharmacy(pharmacy_id), json!({
        "pharmacy": {
            "pharmacy_id": pharmacy_id,
            "event": event,
            "pending_refills": pending_refills,
            "pending_resupplies": pending_resupplies,
            "low_stock": low_stock,
            "out_of_stock": out_of_stock,
        }
    }));
}

/// Creates a notification for one user and queues the pushes for it.
///
/// `data` is the type-specific part of the payload; `id` and `is_read` are filled in here.
/// Staff recipients also trigger a pharmacy-wide update.
pub(crate) fn notify_user(
    db: &mut Database,
    user_id: u64,
    target: NotificationTarget,
    mut data: Map<String, Value>,
    now: DateTime<Utc>,
    effects: &mut Effects,
) -> u64 {
    let notification_id = create_notification(db, user_id, target, now);
    data.insert("id".to_owned(), Value::from(notification_id));
    data.insert("is_read".to_owned(), Value::from(false));
    let event = data.get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("notification")
        .to_owned();
    with_counts(db, user_id, data, effects);
    if let Some(pharmacy_id) = db.pharmacy_of(user_id) {
        pharmacy_update(db, pharmacy_id, &event, effects);
    }
    notification_id
}

/// One notification per staff member of a pharmacy; the pharmacy update is queued once.
pub(crate) fn notify_staff(
    db: &mut Database,
    pharmacy_id: u64,
    target: NotificationTarget,
    data: Map<String, Value>,
    now: DateTime<Utc>,
    effects: &mut Effects,
) -> Vec<u64> {
    let event = data.get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("notification")
        .to_owned();
    let mut created = Vec::new();
    for user_id in db.pharmacy_staff(pharmacy_id) {
        let notification_id = create_notification(db, user_id, target.clone(), now);
        let mut user_data = data.clone();
        user_data.insert("id".to_owned(), Value::from(notification_id));
        user_data.insert("is_read".to_owned(), Value::from(false));
        with_counts(db, user_id, user_data, effects);
        created.push(notification_id);
    }
    pharmacy_update(db, pharmacy_id, &event, effects);
    created
}

/// Builds a payload map from a `json!` object literal.
pub(crate) fn payload(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}


pub(crate) fn mark_notification_read(db: &mut Database, user_id: u64, notification_id: u64) -> bool {
    match db.notifications.get_mut(notification_id) {
        Some(n) if n.user_id == user_id => {
            n.is_read = true;
            true
        },
        _ => false,
    }
}

pub(crate) fn mark_all_read(db: &mut Database, user_id: u64) -> usize {
    let mut changed = 0;
    for n in db.notifications.values_mut() {
        if n.user_id == user_id && !n.is_read {
            n.is_read = true;
            changed += 1;
        }
    }
    changed
}


#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::testutil::Fixture;

    #[test]
    fn payload_carries_both_counters() {
        let mut fx = Fixture::new();
        let mut effects = Effects::default();
        notify_user(
            &mut fx.db, fx.patient_user, NotificationTarget::default(),
            payload(json!({"type": "create_prescription"})), Utc::now(), &mut effects,
        );

        let pushed: Vec<_> = effects.broadcasts_to(Group::User(fx.patient_user)).collect();
        assert_eq!(pushed.len(), 1);
        let n = &pushed[0].payload["notification"];
        assert_eq!(n["type"], "create_prescription");
        assert_eq!(n["unread_count"], 1);
        assert_eq!(n["unread_messages"], 0);
        assert_eq!(n["is_read"], false);
        // patients have no pharmacy group
        assert_eq!(effects.broadcasts.len(), 1);
    }

    #[test]
    fn staff_notification_adds_pharmacy_broadcast() {
        let mut fx = Fixture::new();
        let mut effects = Effects::default();
        notify_user(
            &mut fx.db, fx.pharmacist_user, NotificationTarget::default(),
            payload(json!({"type": "message"})), Utc::now(), &mut effects,
        );
        let pharmacy: Vec<_> = effects.broadcasts_to(Group::Pharmacy(fx.pharmacy)).collect();
        assert_eq!(pharmacy.len(), 1);
        assert_eq!(pharmacy[0].payload["pharmacy"]["event"], "message");
    }

    #[test]
    fn notify_staff_reaches_admin_and_pharmacists() {
        let mut fx = Fixture::new();
        let mut effects = Effects::default();
        let created = notify_staff(
            &mut fx.db, fx.pharmacy, NotificationTarget::default(),
            payload(json!({"type": "low_stock"})), Utc::now(), &mut effects,
        );
        assert_eq!(created.len(), 2);
        assert_eq!(effects.broadcasts_to(Group::User(fx.admin_user)).count(), 1);
        assert_eq!(effects.broadcasts_to(Group::User(fx.pharmacist_user)).count(), 1);
        assert_eq!(effects.broadcasts_to(Group::Pharmacy(fx.pharmacy)).count(), 1);
    }

    #[test]
    fn mark_read_only_touches_own_rows() {
        let mut fx = Fixture::new();
        let now = Utc::now();
        let mine = create_notification(&mut fx.db, fx.patient_user, NotificationTarget::default(), now);
        create_notification(&mut fx.db, fx.patient_user, NotificationTarget::default(), now);
        let theirs = create_notification(&mut fx.db, fx.admin_user, NotificationTarget::default(), now);

        assert!(!mark_notification_read(&mut fx.db, fx.patient_user, theirs));
        assert!(mark_notification_read(&mut fx.db, fx.patient_user, mine));
        assert_eq!(fx.db.unread_counts(fx.patient_user).0, 1);
        assert_eq!(mark_all_read(&mut fx.db, fx.patient_user), 1);
        assert_eq!(fx.db.unread_counts(fx.admin_user).0, 1);
    }
}
