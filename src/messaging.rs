//! Threads, messages and per-user read statuses.
//!
//! A new message gets one `ReadStatus` per participant. Recipients whose socket
//! is currently on the thread get theirs pre-read and no feed entry; everybody
//! else gets an unread status plus an unread message notification. Either way
//! the recipient's user group receives refreshed counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::effects::{Effects, Group};
use crate::error::{AppError, AppResult};
use crate::hub::Presence;
use crate::model::{Attachment, Message, ReadStatus, Thread};
use crate::notify::{self, NotificationTarget};
use crate::store::Database;
use crate::util::chat_time;


pub(crate) fn thread_link(thread_id: u64) -> String {
    format!("/threads/{}", thread_id)
}

/// Returns the two-party thread between `a` and `b`, creating it when missing.
pub(crate) fn find_or_create_thread(db: &mut Database, a: u64, b: u64, now: DateTime<Utc>) -> u64 {
    let existing = db.threads.values()
        .find(|t| t.participants.len() == 2 && t.has_participant(a) && t.has_participant(b))
        .map(|t| t.id);
    match existing {
        Some(id) => id,
        None => db.threads.insert_with(|id| Thread::new(id, vec![a, b], now, now)),
    }
}

pub(crate) fn start_thread(db: &mut Database, user_id: u64, other_id: u64, now: DateTime<Utc>) -> AppResult<u64> {
    if user_id == other_id {
        return Err(AppError::bad_request("cannot start a thread with yourself"));
    }
    db.account(user_id)?;
    db.account(other_id)?;
    Ok(find_or_create_thread(db, user_id, other_id, now))
}

fn participant_thread(db: &Database, user_id: u64, thread_id: u64) -> AppResult<&Thread> {
    let thread = db.thread(thread_id)?;
    if !thread.has_participant(user_id) {
        return Err(AppError::Forbidden("not a participant of this thread"));
    }
    Ok(thread)
}

pub(crate) fn ensure_participant(db: &Database, user_id: u64, thread_id: u64) -> AppResult<()> {
    participant_thread(db, user_id, thread_id).map(|_| ())
}


#[derive(Clone, Debug, Default)]
pub(crate) struct NewMessage {
    pub content: String,
    pub link: Option<String>,
    pub attachment: Attachment,
    pub refill_fulfilled: Option<bool>,
    pub resupply_fulfilled: Option<bool>,
}
impl NewMessage {
    pub fn text<S: Into<String>>(content: S) -> NewMessage {
        NewMessage { content: content.into(), ..Default::default() }
    }
}

/// Stores a message and fans it out to the other participants.
pub(crate) fn post_message(
    db: &mut Database,
    presence: &dyn Presence,
    sender_id: u64,
    thread_id: u64,
    new: NewMessage,
    now: DateTime<Utc>,
) -> AppResult<(u64, Effects)> {
    let content = new.content.trim().to_owned();
    if content.is_empty() {
        return Err(AppError::bad_request("message content must not be empty"));
    }
    let recipients: Vec<u64> = participant_thread(db, sender_id, thread_id)?
        .participants.iter()
        .copied()
        .filter(|p| *p != sender_id)
        .collect();
    let sender_name = db.account(sender_id)?.full_name();

    let message_id = db.messages.insert_with(|id| Message::new(
        id,
        thread_id,
        sender_id,
        recipients.first().copied(),
        content.clone(),
        now,
        new.link.clone(),
        new.attachment.prescription_id,
        new.refill_fulfilled,
        new.attachment.drug_id,
        new.resupply_fulfilled,
    ));
    if let Some(thread) = db.threads.get_mut(thread_id) {
        thread.last_updated = now;
    }
    db.read_statuses.insert_with(|id| ReadStatus::new(id, message_id, sender_id, true));

    let timestamp = chat_time(&now);
    let mut effects = Effects::default();
    effects.broadcast(Group::Thread(thread_id), json!({
        "sender": sender_name,
        "content": content,
        "timestamp": timestamp,
    }));

    for recipient in recipients {
        let viewing = presence.is_viewing(recipient, thread_id);
        db.read_statuses.insert_with(|id| ReadStatus::new(id, message_id, recipient, viewing));

        let data = notify::payload(json!({
            "type": "message",
            "message_id": message_id,
            "sender": sender_name,
            "thread_id": thread_id,
            "content": content,
            "timestamp": timestamp,
        }));
        if viewing {
            debug!(recipient, thread_id, "recipient is viewing the thread; message pre-read");
            let mut data = data;
            data.insert("is_read".to_owned(), Value::from(true));
            notify::with_counts(db, recipient, data, &mut effects);
            if let Some(pharmacy_id) = db.pharmacy_of(recipient) {
                notify::pharmacy_update(db, pharmacy_id, "message", &mut effects);
            }
        } else {
            let target = NotificationTarget {
                message_id: Some(message_id),
                prescription_id: new.attachment.prescription_id,
                drug_id: new.attachment.drug_id,
                content: Some(format!("New message from {}", sender_name)),
                link: Some(thread_link(thread_id)),
                ..Default::default()
            };
            notify::notify_user(db, recipient, target, data, now, &mut effects);
        }
    }

    Ok((message_id, effects))
}

/// Marks the thread's messages and their notifications read for `user_id`.
pub(crate) fn mark_thread_read(db: &mut Database, user_id: u64, thread_id: u64) -> AppResult<Effects> {
    ensure_participant(db, user_id, thread_id)?;
    let message_ids: Vec<u64> = db.messages.values()
        .filter(|m| m.thread_id == thread_id)
        .map(|m| m.id)
        .collect();

    let mut changed = 0;
    for status in db.read_statuses.values_mut() {
        if status.user_id == user_id && !status.read && message_ids.contains(&status.message_id) {
            status.read = true;
            changed += 1;
        }
    }
    for n in db.notifications.values_mut() {
        let about_thread = n.message_id.map(|m| message_ids.contains(&m)).unwrap_or(false);
        if n.user_id == user_id && !n.is_read && about_thread {
            n.is_read = true;
            changed += 1;
        }
    }

    let mut effects = Effects::default();
    if changed > 0 {
        notify::counts_update(db, user_id, &mut effects);
    }
    Ok(effects)
}


#[derive(Clone, Debug, Serialize)]
pub(crate) struct ThreadSummary {
    pub id: u64,
    pub participants: Vec<String>,
    pub latest_message: Option<String>,
    pub latest_timestamp: Option<String>,
    pub unread: usize,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct MessageView {
    pub id: u64,
    pub sender_id: u64,
    pub sender: String,
    pub mine: bool,
    pub content: String,
    pub timestamp: String,
    pub link: Option<String>,
    pub prescription_id: Option<u64>,
    pub refill_fulfilled: Option<bool>,
    pub drug_id: Option<u64>,
    pub resupply_fulfilled: Option<bool>,
}

fn display_name(db: &Database, user_id: u64) -> String {
    db.accounts.get(user_id)
        .map(|a| a.full_name())
        .unwrap_or_else(|| "Unknown".to_owned())
}

/// The user's threads, most recently updated first.
pub(crate) fn list_threads(db: &Database, user_id: u64) -> Vec<ThreadSummary> {
    let mut summaries: Vec<ThreadSummary> = db.threads.values()
        .filter(|t| t.has_participant(user_id))
        .map(|t| {
            let latest = db.messages.values()
                .filter(|m| m.thread_id == t.id)
                .max_by_key(|m| (m.timestamp, m.id));
            let unread = db.read_statuses.values()
                .filter(|rs| rs.user_id == user_id && !rs.read)
                .filter(|rs| db.messages.get(rs.message_id).map(|m| m.thread_id == t.id).unwrap_or(false))
                .count();
            ThreadSummary {
                id: t.id,
                participants: t.participants.iter()
                    .filter(|p| **p != user_id)
                    .map(|p| display_name(db, *p))
                    .collect(),
                latest_message: latest.map(|m| m.content.clone()),
                latest_timestamp: latest.map(|m| chat_time(&m.timestamp)),
                unread,
                last_updated: t.last_updated,
            }
        })
        .collect();
    summaries.sort_by(|a, b| b.last_updated.cmp(&a.last_updated).then(b.id.cmp(&a.id)));
    summaries
}

/// Messages of a thread in chronological order.
pub(crate) fn thread_messages(db: &Database, user_id: u64, thread_id: u64) -> AppResult<Vec<MessageView>> {
    ensure_participant(db, user_id, thread_id)?;
    let mut messages: Vec<&Message> = db.messages.values()
        .filter(|m| m.thread_id == thread_id)
        .collect();
    messages.sort_by_key(|m| (m.timestamp, m.id));
    Ok(messages.into_iter()
        .map(|m| MessageView {
            id: m.id,
            sender_id: m.sender_id,
            sender: display_name(db, m.sender_id),
            mine: m.sender_id == user_id,
            content: m.content.clone(),
            timestamp: chat_time(&m.timestamp),
            link: m.link.clone(),
            prescription_id: m.prescription_id,
            refill_fulfilled: m.refill_fulfilled,
            drug_id: m.drug_id,
            resupply_fulfilled: m.resupply_fulfilled,
        })
        .collect())
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::hub::Nobody;
    use crate::testutil::Fixture;

    fn thread(fx: &mut Fixture) -> u64 {
        start_thread(&mut fx.db, fx.patient_user, fx.pharmacist_user, Utc::now()).unwrap()
    }

    #[test]
    fn threads_between_two_users_are_reused() {
        let mut fx = Fixture::new();
        let first = thread(&mut fx);
        let again = start_thread(&mut fx.db, fx.pharmacist_user, fx.patient_user, Utc::now()).unwrap();
        assert_eq!(first, again);
        assert!(start_thread(&mut fx.db, fx.patient_user, fx.patient_user, Utc::now()).is_err());
    }

    #[test]
    fn threads_need_two_existing_accounts() {
        let mut fx = Fixture::new();
        assert!(start_thread(&mut fx.db, 0, fx.patient_user, Utc::now()).is_err());
        assert!(start_thread(&mut fx.db, fx.patient_user, 9999, Utc::now()).is_err());
        assert_eq!(fx.db.threads.len(), 0);
    }

    #[test]
    fn absent_recipient_gets_unread_status_and_notification() {
        let mut fx = Fixture::new();
        let thread_id = thread(&mut fx);
        let (message_id, effects) = post_message(
            &mut fx.db, &Nobody, fx.patient_user, thread_id,
            NewMessage::text("Do you have Glucophage?"), Utc::now(),
        ).unwrap();

        assert_eq!(fx.db.unread_counts(fx.pharmacist_user), (1, 1));
        assert_eq!(fx.db.unread_counts(fx.patient_user), (0, 0));
        assert_eq!(fx.db.message(message_id).unwrap().recipient_id, Some(fx.pharmacist_user));

        let chat: Vec<_> = effects.broadcasts_to(Group::Thread(thread_id)).collect();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].payload["content"], "Do you have Glucophage?");

        let push = effects.broadcasts_to(Group::User(fx.pharmacist_user)).next().unwrap();
        assert_eq!(push.payload["notification"]["unread_messages"], 1);
        assert_eq!(push.payload["notification"]["thread_id"], thread_id);
        // staff recipient: pharmacy group as well
        assert_eq!(effects.broadcasts_to(Group::Pharmacy(fx.pharmacy)).count(), 1);
    }

    #[test]
    fn viewing_recipient_is_pre_read() {
        let mut fx = Fixture::new();
        let thread_id = thread(&mut fx);
        let mut viewing = HashSet::new();
        viewing.insert((fx.patient_user, thread_id));

        let (_, effects) = post_message(
            &mut fx.db, &viewing, fx.pharmacist_user, thread_id,
            NewMessage::text("Ready tomorrow."), Utc::now(),
        ).unwrap();

        assert_eq!(fx.db.unread_counts(fx.patient_user), (0, 0));
        let push = effects.broadcasts_to(Group::User(fx.patient_user)).next().unwrap();
        assert_eq!(push.payload["notification"]["is_read"], true);
        assert_eq!(push.payload["notification"]["unread_count"], 0);
        assert_eq!(effects.broadcasts_to(Group::Pharmacy(fx.pharmacy)).count(), 0);
    }

    #[test]
    fn outsiders_and_empty_messages_are_rejected() {
        let mut fx = Fixture::new();
        let thread_id = thread(&mut fx);
        let err = post_message(&mut fx.db, &Nobody, fx.admin_user, thread_id, NewMessage::text("hi"), Utc::now());
        assert!(matches!(err, Err(AppError::Forbidden(_))));
        let err = post_message(&mut fx.db, &Nobody, fx.patient_user, thread_id, NewMessage::text("   "), Utc::now());
        assert!(matches!(err, Err(AppError::BadRequest(_))));
        assert_eq!(fx.db.messages.len(), 0);
    }

    #[test]
    fn marking_thread_read_clears_both_tracks() {
        let mut fx = Fixture::new();
        let thread_id = thread(&mut fx);
        for text in ["one", "two"] {
            post_message(&mut fx.db, &Nobody, fx.patient_user, thread_id, NewMessage::text(text), Utc::now()).unwrap();
        }
        assert_eq!(fx.db.unread_counts(fx.pharmacist_user), (2, 2));
        assert_eq!(list_threads(&fx.db, fx.pharmacist_user)[0].unread, 2);

        let effects = mark_thread_read(&mut fx.db, fx.pharmacist_user, thread_id).unwrap();
        assert_eq!(fx.db.unread_counts(fx.pharmacist_user), (0, 0));
        assert_eq!(effects.broadcasts.len(), 1);

        // nothing left to change: no push
        let effects = mark_thread_read(&mut fx.db, fx.pharmacist_user, thread_id).unwrap();
        assert!(effects.broadcasts.is_empty());
    }

    #[test]
    fn thread_listing_and_history() {
        let mut fx = Fixture::new();
        let thread_id = thread(&mut fx);
        post_message(&mut fx.db, &Nobody, fx.patient_user, thread_id, NewMessage::text("first"), Utc::now()).unwrap();
        post_message(&mut fx.db, &Nobody, fx.pharmacist_user, thread_id, NewMessage::text("second"), Utc::now()).unwrap();

        let summaries = list_threads(&fx.db, fx.patient_user);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].latest_message.as_deref(), Some("second"));
        assert_eq!(summaries[0].participants, vec!["pharmacist Test".to_owned()]);

        let history = thread_messages(&fx.db, fx.patient_user, thread_id).unwrap();
        assert_eq!(history.iter().map(|m| m.content.as_str()).collect::<Vec<_>>(), vec!["first", "second"]);
        assert!(history[0].mine);
        assert!(!history[1].mine);
        assert!(thread_messages(&fx.db, fx.admin_user, thread_id).is_err());
    }
}
