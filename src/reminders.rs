//! Medication reminders: remaining-day bookkeeping, archiving and the per-time
//! job bookkeeping that the scheduler executes.
//!
//! Every active `ReminderTime` of an active reminder owns exactly one pending
//! job, identified by the `task_id` stored on the row. Scheduling a time that
//! already has a job revokes the old one first, so rescheduling is idempotent.
//! A job whose id no longer matches the row is stale and does nothing.

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use num_rational::Rational64;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::accounts::Principal;
use crate::effects::{Effects, ScheduledJob};
use crate::error::{AppError, AppResult};
use crate::model::{MedicationReminder, ReminderTime, Role};
use crate::notify::{self, NotificationTarget};
use crate::store::Database;
use crate::util::feed_time;


pub(crate) const MAX_TIMES_PER_REMINDER: usize = 5;
const SAME_MINUTE_NUDGE_SECS: i64 = 5;
pub(crate) const REMINDERS_LINK: &str = "/reminders";


/// Parses `HH:MM` or `HH:MM:SS`, truncated to the minute.
pub(crate) fn parse_time_of_day(text: &str) -> AppResult<NaiveTime> {
    let text = text.trim();
    let time = NaiveTime::parse_from_str(text, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M:%S"))
        .map_err(|_| AppError::bad_request(format!("invalid time of day {:?}", text)))?;
    Ok(truncate_to_minute(time))
}

fn truncate_to_minute(time: NaiveTime) -> NaiveTime {
    time.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

/// `date` at `time` in local time; inside a DST gap the wall clock is read as UTC.
pub(crate) fn local_at(date: NaiveDate, time: NaiveTime) -> DateTime<Local> {
    let naive = date.and_time(time);
    Local.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| Local.from_utc_datetime(&naive))
}

/// When a job for `time` should first run, seen from `now`.
///
/// Today at `time` if still ahead; a few seconds from now if `time` falls in the
/// current minute; otherwise tomorrow at `time`.
pub(crate) fn next_fire_time(time: NaiveTime, now: DateTime<Local>) -> DateTime<Local> {
    let time = truncate_to_minute(time);
    if now.hour() == time.hour() && now.minute() == time.minute() {
        return now + Duration::seconds(SAME_MINUTE_NUDGE_SECS);
    }
    let today = now.date_naive();
    let candidate = local_at(today, time);
    if candidate > now {
        candidate
    } else {
        local_at(today + Duration::days(1), time)
    }
}

/// The run after a job that just fired: never inside the current minute.
pub(crate) fn following_fire_time(time: NaiveTime, now: DateTime<Local>) -> DateTime<Local> {
    let time = truncate_to_minute(time);
    let today = now.date_naive();
    let candidate = local_at(today, time);
    if candidate > now + Duration::minutes(1) {
        candidate
    } else {
        local_at(today + Duration::days(1), time)
    }
}

/// Whole days a supply lasts at `doses_per_day`; at least one day.
pub(crate) fn days_of_supply(quantity: i64, doses_per_day: u32) -> i64 {
    if doses_per_day == 0 || quantity <= 0 {
        return 1;
    }
    let days = Rational64::new(quantity, i64::from(doses_per_day)).floor();
    if days.is_zero() {
        1
    } else {
        days.to_integer()
    }
}


fn put_job(db: &mut Database, time_id: u64, eta: DateTime<Local>, effects: &mut Effects) -> AppResult<()> {
    unschedule_time(db, time_id, effects)?;
    let task_id = db.next_task_id(time_id);
    db.reminder_times.get_mut(time_id)
        .ok_or(AppError::NotFound("reminder time"))?
        .task_id = Some(task_id.clone());
    debug!(time_id, %task_id, %eta, "reminder job scheduled");
    effects.schedule(ScheduledJob::new(task_id, time_id, eta));
    Ok(())
}

/// (Re)schedules the job of one reminder time.
pub(crate) fn schedule_time(db: &mut Database, time_id: u64, now: DateTime<Local>, effects: &mut Effects) -> AppResult<()> {
    let time = db.reminder_time(time_id)?.time;
    put_job(db, time_id, next_fire_time(time, now), effects)
}

/// Revokes the job of one reminder time, if any.
pub(crate) fn unschedule_time(db: &mut Database, time_id: u64, effects: &mut Effects) -> AppResult<()> {
    let rt = db.reminder_times.get_mut(time_id)
        .ok_or(AppError::NotFound("reminder time"))?;
    if let Some(old) = rt.task_id.take() {
        effects.revoke(old);
    }
    Ok(())
}

fn schedule_active_times(db: &mut Database, reminder_id: u64, now: DateTime<Local>, effects: &mut Effects) -> AppResult<()> {
    for time_id in db.times_of_reminder(reminder_id) {
        if db.reminder_time(time_id)?.is_active {
            schedule_time(db, time_id, now, effects)?;
        } else {
            unschedule_time(db, time_id, effects)?;
        }
    }
    Ok(())
}

fn unschedule_all_times(db: &mut Database, reminder_id: u64, effects: &mut Effects) -> AppResult<()> {
    for time_id in db.times_of_reminder(reminder_id) {
        unschedule_time(db, time_id, effects)?;
    }
    Ok(())
}


fn patient_id_of(db: &Database, principal: &Principal) -> AppResult<u64> {
    principal.require(Role::Patient)?;
    db.patient_by_user(principal.account_id)
        .map(|p| p.id)
        .ok_or(AppError::NotFound("patient profile"))
}

fn own_reminder<'a>(db: &'a Database, principal: &Principal, reminder_id: u64) -> AppResult<&'a MedicationReminder> {
    let patient_id = patient_id_of(db, principal)?;
    let reminder = db.reminder(reminder_id)?;
    if reminder.patient_id != patient_id {
        return Err(AppError::Forbidden("not your reminder"));
    }
    Ok(reminder)
}

fn own_time<'a>(db: &'a Database, principal: &Principal, time_id: u64) -> AppResult<(&'a ReminderTime, &'a MedicationReminder)> {
    let rt = db.reminder_time(time_id)?;
    let reminder = own_reminder(db, principal, rt.reminder_id)?;
    Ok((rt, reminder))
}

fn medicine_name(db: &Database, reminder: &MedicationReminder) -> String {
    db.prescriptions.get(reminder.prescription_id)
        .and_then(|rx| db.drugs.get(rx.drug_id))
        .map(|d| d.display_name().to_owned())
        .unwrap_or_else(|| "medication".to_owned())
}


#[derive(Clone, Debug, Deserialize)]
pub(crate) struct NewReminder {
    pub prescription_id: u64,
    pub frequency: u32,
    pub times: Vec<String>,
    #[serde(default)]
    pub day_amount: Option<i64>,
}

pub(crate) fn create_reminder(
    db: &mut Database,
    principal: &Principal,
    new: NewReminder,
    now: DateTime<Local>,
) -> AppResult<(u64, Effects)> {
    let patient_id = patient_id_of(db, principal)?;
    let prescription = db.prescription(new.prescription_id)?;
    if prescription.patient_id != patient_id {
        return Err(AppError::Forbidden("not your prescription"));
    }
    if new.frequency == 0 {
        return Err(AppError::bad_request("frequency must be at least 1"));
    }
    if new.times.is_empty() || new.times.len() > MAX_TIMES_PER_REMINDER {
        return Err(AppError::bad_request(format!("between 1 and {} times are required", MAX_TIMES_PER_REMINDER)));
    }
    let times = new.times.iter()
        .map(|t| parse_time_of_day(t))
        .collect::<AppResult<Vec<NaiveTime>>>()?;
    let day_amount = match new.day_amount {
        Some(days) if days <= 0 => return Err(AppError::bad_request("day amount must be positive")),
        Some(days) => days,
        None => days_of_supply(prescription.quantity, new.frequency),
    };

    let today = now.date_naive();
    let reminder_id = db.reminders.insert_with(|id| MedicationReminder::new(
        id,
        patient_id,
        new.prescription_id,
        new.frequency,
        today,
        day_amount,
        day_amount,
        true,
        false,
        None,
    ));
    for time in times {
        db.reminder_times.insert_with(|id| ReminderTime::new(id, reminder_id, time, true, None));
    }

    let mut effects = Effects::default();
    schedule_active_times(db, reminder_id, now, &mut effects)?;
    info!(reminder_id, day_amount, "reminder created");
    Ok((reminder_id, effects))
}

/// Turns a reminder off (freezing its remaining days) or back on (resuming from today).
pub(crate) fn toggle_reminder(db: &mut Database, principal: &Principal, reminder_id: u64, now: DateTime<Local>) -> AppResult<Effects> {
    let reminder = own_reminder(db, principal, reminder_id)?;
    if reminder.is_archived {
        return Err(AppError::conflict("archived reminders must be restored first"));
    }
    let today = now.date_naive();
    let mut effects = Effects::default();

    if reminder.is_active {
        let remaining = reminder.days_left(today);
        let reminder = db.reminder_mut(reminder_id)?;
        reminder.remaining_days = remaining;
        reminder.is_active = false;
        unschedule_all_times(db, reminder_id, &mut effects)?;
        info!(reminder_id, remaining, "reminder paused");
    } else {
        if reminder.remaining_days <= 0 {
            return Err(AppError::conflict("no days left on this reminder"));
        }
        let reminder = db.reminder_mut(reminder_id)?;
        reminder.start_date = today;
        reminder.day_amount = reminder.remaining_days;
        reminder.is_active = true;
        schedule_active_times(db, reminder_id, now, &mut effects)?;
        info!(reminder_id, "reminder resumed");
    }
    Ok(effects)
}

pub(crate) fn toggle_time(db: &mut Database, principal: &Principal, time_id: u64, now: DateTime<Local>) -> AppResult<Effects> {
    let (rt, reminder) = own_time(db, principal, time_id)?;
    let now_active = !rt.is_active;
    let reminder_running = reminder.is_active && !reminder.is_archived;

    db.reminder_times.get_mut(time_id)
        .ok_or(AppError::NotFound("reminder time"))?
        .is_active = now_active;

    let mut effects = Effects::default();
    if now_active && reminder_running {
        schedule_time(db, time_id, now, &mut effects)?;
    } else {
        unschedule_time(db, time_id, &mut effects)?;
    }
    Ok(effects)
}

pub(crate) fn edit_time(db: &mut Database, principal: &Principal, time_id: u64, time: &str, now: DateTime<Local>) -> AppResult<Effects> {
    let time = parse_time_of_day(time)?;
    let (rt, reminder) = own_time(db, principal, time_id)?;
    let running = rt.is_active && reminder.is_active && !reminder.is_archived;

    db.reminder_times.get_mut(time_id)
        .ok_or(AppError::NotFound("reminder time"))?
        .time = time;

    let mut effects = Effects::default();
    if running {
        schedule_time(db, time_id, now, &mut effects)?;
    }
    Ok(effects)
}

pub(crate) fn add_time(db: &mut Database, principal: &Principal, reminder_id: u64, time: &str, now: DateTime<Local>) -> AppResult<(u64, Effects)> {
    let time = parse_time_of_day(time)?;
    let reminder = own_reminder(db, principal, reminder_id)?;
    let running = reminder.is_active && !reminder.is_archived;
    if db.times_of_reminder(reminder_id).len() >= MAX_TIMES_PER_REMINDER {
        return Err(AppError::conflict(format!("a reminder has at most {} times", MAX_TIMES_PER_REMINDER)));
    }
    let time_id = db.reminder_times.insert_with(|id| ReminderTime::new(id, reminder_id, time, true, None));

    let mut effects = Effects::default();
    if running {
        schedule_time(db, time_id, now, &mut effects)?;
    }
    Ok((time_id, effects))
}

pub(crate) fn delete_reminder(db: &mut Database, principal: &Principal, reminder_id: u64) -> AppResult<Effects> {
    own_reminder(db, principal, reminder_id)?;
    let mut effects = Effects::default();
    unschedule_all_times(db, reminder_id, &mut effects)?;
    db.reminder_times.retain(|t| t.reminder_id != reminder_id);
    db.notifications.retain(|n| n.reminder_id != Some(reminder_id));
    db.reminders.remove(reminder_id);
    info!(reminder_id, "reminder deleted");
    Ok(effects)
}

/// Brings an archived reminder back for `days` (default: its previous day amount).
pub(crate) fn restore_reminder(
    db: &mut Database,
    principal: &Principal,
    reminder_id: u64,
    days: Option<i64>,
    now: DateTime<Local>,
) -> AppResult<Effects> {
    let reminder = own_reminder(db, principal, reminder_id)?;
    if !reminder.is_archived {
        return Err(AppError::conflict("only archived reminders can be restored"));
    }
    let days = match days {
        Some(d) if d <= 0 => return Err(AppError::bad_request("days must be positive")),
        Some(d) => d,
        None => reminder.day_amount.max(1),
    };

    {
        let reminder = db.reminder_mut(reminder_id)?;
        reminder.start_date = now.date_naive();
        reminder.day_amount = days;
        reminder.remaining_days = days;
        reminder.is_active = true;
        reminder.is_archived = false;
        reminder.restoration_time = Some(now.with_timezone(&Utc));
    }
    for time_id in db.times_of_reminder(reminder_id) {
        if let Some(rt) = db.reminder_times.get_mut(time_id) {
            rt.is_active = true;
        }
    }

    let mut effects = Effects::default();
    schedule_active_times(db, reminder_id, now, &mut effects)?;
    info!(reminder_id, days, "reminder restored");
    Ok(effects)
}

/// Refreshes remaining days and archives every reminder that ran out, paused ones included.
pub(crate) fn archive_expired(db: &mut Database, now: DateTime<Local>) -> Effects {
    let today = now.date_naive();
    let mut effects = Effects::default();

    let mut expired = Vec::new();
    for reminder in db.reminders.values_mut() {
        if reminder.is_archived {
            continue;
        }
        if reminder.is_active {
            reminder.remaining_days = reminder.days_left(today);
        }
        if reminder.remaining_days == 0 {
            reminder.is_active = false;
            reminder.is_archived = true;
            expired.push(reminder.id);
        }
    }

    for reminder_id in expired {
        for time_id in db.times_of_reminder(reminder_id) {
            if let Some(rt) = db.reminder_times.get_mut(time_id) {
                rt.is_active = false;
                if let Some(old) = rt.task_id.take() {
                    effects.revoke(old);
                }
            }
        }
        let (patient_user, medicine) = match db.reminders.get(reminder_id) {
            Some(r) => (
                db.patients.get(r.patient_id).map(|p| p.user_id),
                medicine_name(db, r),
            ),
            None => continue,
        };
        if let Some(user_id) = patient_user {
            let content = format!("Your {} reminder has ended and was archived", medicine);
            let target = NotificationTarget {
                reminder_id: Some(reminder_id),
                content: Some(content.clone()),
                link: Some(REMINDERS_LINK.to_owned()),
                ..Default::default()
            };
            let data = notify::payload(json!({
                "type": "reminder_archived",
                "reminder_id": reminder_id,
                "reminder": medicine,
                "content": content,
            }));
            notify::notify_user(db, user_id, target, data, now.with_timezone(&Utc), &mut effects);
        }
        info!(reminder_id, "reminder archived");
    }
    effects
}

/// Runs a due job: notifies the patient and queues the next day's job.
pub(crate) fn fire_reminder(db: &mut Database, time_id: u64, task_id: &str, now: DateTime<Local>) -> Effects {
    let mut effects = Effects::default();
    let rt = match db.reminder_times.get_mut(time_id) {
        Some(rt) => rt,
        None => return effects,
    };
    if rt.task_id.as_deref() != Some(task_id) {
        debug!(time_id, task_id, "stale reminder job ignored");
        return effects;
    }
    rt.task_id = None;
    let (time, time_active, reminder_id) = (rt.time, rt.is_active, rt.reminder_id);

    let (due, patient_user, medicine) = match db.reminders.get(reminder_id) {
        Some(r) => (
            r.is_active && !r.is_archived && time_active && r.days_left(now.date_naive()) > 0,
            db.patients.get(r.patient_id).map(|p| p.user_id),
            medicine_name(db, r),
        ),
        None => return effects,
    };
    let user_id = match (due, patient_user) {
        (true, Some(u)) => u,
        _ => return effects,
    };

    let created = now.with_timezone(&Utc);
    let content = format!("Time to take your {}", medicine);
    let target = NotificationTarget {
        reminder_id: Some(reminder_id),
        content: Some(content),
        link: Some(REMINDERS_LINK.to_owned()),
        ..Default::default()
    };
    let data = notify::payload(json!({
        "type": "reminder",
        "reminder_id": reminder_id,
        "reminder": medicine,
        "created_time": feed_time(&created),
    }));
    notify::notify_user(db, user_id, target, data, created, &mut effects);

    if let Err(e) = put_job(db, time_id, following_fire_time(time, now), &mut effects) {
        debug!(time_id, "could not queue next reminder job: {}", e);
    }
    effects
}

/// Queues jobs for every running reminder time, e.g. after a restart.
pub(crate) fn resume_all(db: &mut Database, now: DateTime<Local>) -> Effects {
    let today = now.date_naive();
    let running: Vec<u64> = db.reminders.values()
        .filter(|r| r.is_active && !r.is_archived && r.days_left(today) > 0)
        .map(|r| r.id)
        .collect();
    // jobs from a previous process are gone; their ids mean nothing any more
    for rt in db.reminder_times.values_mut() {
        rt.task_id = None;
    }
    let mut effects = Effects::default();
    for reminder_id in running {
        if let Err(e) = schedule_active_times(db, reminder_id, now, &mut effects) {
            debug!(reminder_id, "could not resume reminder: {}", e);
        }
    }
    effects
}


#[derive(Clone, Debug, Serialize)]
pub(crate) struct TimeView {
    pub id: u64,
    pub time: String,
    pub is_active: bool,
    pub scheduled: bool,
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct ReminderView {
    pub id: u64,
    pub prescription_id: u64,
    pub medicine: String,
    pub frequency: u32,
    pub start_date: NaiveDate,
    pub day_amount: i64,
    pub days_left: i64,
    pub is_active: bool,
    pub is_archived: bool,
    pub times: Vec<TimeView>,
}

pub(crate) fn list_reminders(db: &Database, principal: &Principal, today: NaiveDate) -> AppResult<Vec<ReminderView>> {
    let patient_id = patient_id_of(db, principal)?;
    let mut views: Vec<ReminderView> = db.reminders.values()
        .filter(|r| r.patient_id == patient_id)
        .map(|r| {
            let mut times: Vec<&ReminderTime> = db.reminder_times.values()
                .filter(|t| t.reminder_id == r.id)
                .collect();
            times.sort_by_key(|t| t.time);
            ReminderView {
                id: r.id,
                prescription_id: r.prescription_id,
                medicine: medicine_name(db, r),
                frequency: r.frequency,
                start_date: r.start_date,
                day_amount: r.day_amount,
                days_left: if r.is_active { r.days_left(today) } else { r.remaining_days },
                is_active: r.is_active,
                is_archived: r.is_archived,
                times: times.into_iter()
                    .map(|t| TimeView {
                        id: t.id,
                        time: t.time.format("%H:%M").to_string(),
                        is_active: t.is_active,
                        scheduled: t.task_id.is_some(),
                    })
                    .collect(),
            }
        })
        .collect();
    views.sort_by(|a, b| a.is_archived.cmp(&b.is_archived).then(a.id.cmp(&b.id)));
    Ok(views)
}


#[cfg(test)]
mod tests {
    use chrono::NaiveDateTime;

    use super::*;
    use crate::effects::Group;
    use crate::testutil::{add_prescription, Fixture};

    fn at(text: &str) -> DateTime<Local> {
        let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").unwrap();
        local_at(naive.date(), naive.time())
    }

    fn hm(text: &str) -> NaiveTime {
        parse_time_of_day(text).unwrap()
    }

    fn reminder(fx: &mut Fixture, times: &[&str], now: DateTime<Local>) -> (u64, Effects) {
        let rx = add_prescription(fx, 60);
        create_reminder(&mut fx.db, &fx.as_patient, NewReminder {
            prescription_id: rx,
            frequency: times.len() as u32,
            times: times.iter().map(|t| t.to_string()).collect(),
            day_amount: None,
        }, now).unwrap()
    }

    #[test]
    fn fire_time_today_tomorrow_or_nudged() {
        let now = at("2026-03-10 08:30:20");
        assert_eq!(next_fire_time(hm("09:00"), now), at("2026-03-10 09:00:00"));
        assert_eq!(next_fire_time(hm("08:00"), now), at("2026-03-11 08:00:00"));
        assert_eq!(next_fire_time(hm("08:30"), now), at("2026-03-10 08:30:25"));
        assert_eq!(following_fire_time(hm("08:30"), now), at("2026-03-11 08:30:00"));
        assert_eq!(following_fire_time(hm("21:00"), now), at("2026-03-10 21:00:00"));
    }

    #[test]
    fn time_parsing() {
        assert_eq!(hm("7:05"), NaiveTime::from_hms_opt(7, 5, 0).unwrap());
        assert_eq!(hm("21:15:42"), NaiveTime::from_hms_opt(21, 15, 0).unwrap());
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[test]
    fn supply_is_floored_ratio() {
        assert_eq!(days_of_supply(60, 2), 30);
        assert_eq!(days_of_supply(61, 2), 30);
        assert_eq!(days_of_supply(1, 3), 1);
        assert_eq!(days_of_supply(0, 3), 1);
    }

    #[test]
    fn creating_schedules_each_time() {
        let mut fx = Fixture::new();
        let now = at("2026-03-10 08:00:00");
        let (id, effects) = reminder(&mut fx, &["09:00", "21:00"], now);
        let reminder = fx.db.reminder(id).unwrap();
        assert_eq!(reminder.day_amount, 30);
        assert_eq!(reminder.start_date, now.date_naive());

        let jobs: Vec<_> = effects.scheduled().collect();
        assert_eq!(jobs.len(), 2);
        for job in jobs {
            assert_eq!(fx.db.reminder_time(job.time_id).unwrap().task_id.as_deref(), Some(job.task_id.as_str()));
        }
        assert_eq!(effects.revoked().count(), 0);
    }

    #[test]
    fn six_times_are_too_many() {
        let mut fx = Fixture::new();
        let rx = add_prescription(&mut fx, 60);
        let err = create_reminder(&mut fx.db, &fx.as_patient, NewReminder {
            prescription_id: rx,
            frequency: 6,
            times: vec!["01:00".into(), "02:00".into(), "03:00".into(), "04:00".into(), "05:00".into(), "06:00".into()],
            day_amount: None,
        }, Local::now());
        assert!(matches!(err, Err(AppError::BadRequest(_))));

        let (id, _) = reminder(&mut fx, &["01:00", "02:00", "03:00", "04:00", "05:00"], Local::now());
        assert!(matches!(add_time(&mut fx.db, &fx.as_patient, id, "06:00", Local::now()), Err(AppError::Conflict(_))));
    }

    #[test]
    fn toggle_off_then_on_reschedules_all_active_times() {
        let mut fx = Fixture::new();
        let start = at("2026-03-10 08:00:00");
        let (id, created) = reminder(&mut fx, &["09:00", "13:00", "21:00"], start);
        let original: Vec<String> = created.scheduled().map(|j| j.task_id.clone()).collect();

        // one time is switched off by the patient
        let paused_time = db_times(&fx, id)[1];
        toggle_time(&mut fx.db, &fx.as_patient, paused_time, start).unwrap();

        let later = at("2026-03-15 10:00:00");
        let off = toggle_reminder(&mut fx.db, &fx.as_patient, id, later).unwrap();
        assert_eq!(off.scheduled().count(), 0);
        assert_eq!(off.revoked().count(), 2);
        assert!(!fx.db.reminder(id).unwrap().is_active);
        assert_eq!(fx.db.reminder(id).unwrap().remaining_days, 15);

        let resume = at("2026-03-20 10:00:00");
        let on = toggle_reminder(&mut fx.db, &fx.as_patient, id, resume).unwrap();
        let rescheduled: Vec<_> = on.scheduled().collect();
        assert_eq!(rescheduled.len(), 2);
        for job in &rescheduled {
            assert!(!original.contains(&job.task_id));
            assert_ne!(job.time_id, paused_time);
        }
        let reminder = fx.db.reminder(id).unwrap();
        assert_eq!(reminder.start_date, resume.date_naive());
        assert_eq!(reminder.days_left(resume.date_naive()), 15);
    }

    fn db_times(fx: &Fixture, reminder_id: u64) -> Vec<u64> {
        fx.db.times_of_reminder(reminder_id)
    }

    #[test]
    fn editing_a_time_revokes_then_schedules() {
        let mut fx = Fixture::new();
        let now = at("2026-03-10 08:00:00");
        let (id, _) = reminder(&mut fx, &["09:00"], now);
        let time_id = db_times(&fx, id)[0];
        let before = fx.db.reminder_time(time_id).unwrap().task_id.clone().unwrap();

        let effects = edit_time(&mut fx.db, &fx.as_patient, time_id, "10:30", now).unwrap();
        assert_eq!(effects.revoked().collect::<Vec<_>>(), vec![before.as_str()]);
        let job = effects.scheduled().next().unwrap();
        assert_eq!(job.eta, at("2026-03-10 10:30:00"));

        // same again: still exactly one live job for the time
        let effects = schedule_then(&mut fx, time_id, now);
        assert_eq!(effects.revoked().count(), 1);
        assert_eq!(effects.scheduled().count(), 1);
    }

    fn schedule_then(fx: &mut Fixture, time_id: u64, now: DateTime<Local>) -> Effects {
        let mut effects = Effects::default();
        schedule_time(&mut fx.db, time_id, now, &mut effects).unwrap();
        effects
    }

    #[test]
    fn firing_notifies_and_queues_tomorrow() {
        let mut fx = Fixture::new();
        let now = at("2026-03-10 08:00:00");
        let (id, created) = reminder(&mut fx, &["09:00"], now);
        let job = created.scheduled().next().unwrap().clone();

        let fired_at = at("2026-03-10 09:00:00");
        let effects = fire_reminder(&mut fx.db, job.time_id, &job.task_id, fired_at);
        let push = effects.broadcasts_to(Group::User(fx.patient_user)).next().unwrap();
        assert_eq!(push.payload["notification"]["type"], "reminder");
        assert_eq!(push.payload["notification"]["reminder_id"], id);
        assert_eq!(push.payload["notification"]["reminder"], "Glucophage");

        let next = effects.scheduled().next().unwrap();
        assert_eq!(next.eta, at("2026-03-11 09:00:00"));
        assert_eq!(effects.revoked().count(), 0);

        // the consumed id is stale now
        let again = fire_reminder(&mut fx.db, job.time_id, &job.task_id, fired_at);
        assert_eq!(again, Effects::default());
        assert_eq!(fx.db.unread_counts(fx.patient_user).0, 1);
    }

    #[test]
    fn paused_reminder_job_does_nothing() {
        let mut fx = Fixture::new();
        let now = at("2026-03-10 08:00:00");
        let (id, created) = reminder(&mut fx, &["09:00"], now);
        let job = created.scheduled().next().unwrap().clone();
        // simulate a revoke that lost the race: the row still names the job
        fx.db.reminder_mut(id).unwrap().is_active = false;
        let effects = fire_reminder(&mut fx.db, job.time_id, &job.task_id, at("2026-03-10 09:00:00"));
        assert!(effects.broadcasts.is_empty());
        assert!(fx.db.reminder_time(job.time_id).unwrap().task_id.is_none());
    }

    #[test]
    fn expired_reminders_are_archived_and_restorable() {
        let mut fx = Fixture::new();
        let start = at("2026-03-01 08:00:00");
        let rx = add_prescription(&mut fx, 60);
        let (id, _) = create_reminder(&mut fx.db, &fx.as_patient, NewReminder {
            prescription_id: rx,
            frequency: 1,
            times: vec!["09:00".into()],
            day_amount: Some(3),
        }, start).unwrap();

        let effects = archive_expired(&mut fx.db, at("2026-03-03 08:00:00"));
        assert!(effects.broadcasts.is_empty());
        assert_eq!(fx.db.reminder(id).unwrap().remaining_days, 1);

        let effects = archive_expired(&mut fx.db, at("2026-03-04 08:00:00"));
        let reminder = fx.db.reminder(id).unwrap();
        assert!(reminder.is_archived);
        assert!(!reminder.is_active);
        assert_eq!(effects.revoked().count(), 1);
        assert_eq!(effects.broadcasts_to(Group::User(fx.patient_user)).count(), 1);
        assert!(toggle_reminder(&mut fx.db, &fx.as_patient, id, start).is_err());

        let restored = restore_reminder(&mut fx.db, &fx.as_patient, id, Some(7), at("2026-03-05 08:00:00")).unwrap();
        assert_eq!(restored.scheduled().count(), 1);
        let reminder = fx.db.reminder(id).unwrap();
        assert!(reminder.is_active && !reminder.is_archived);
        assert_eq!(reminder.days_left(NaiveDate::from_ymd_opt(2026, 3, 5).unwrap()), 7);
        assert!(reminder.restoration_time.is_some());
    }

    #[test]
    fn paused_after_running_out_is_still_archived() {
        let mut fx = Fixture::new();
        let rx = add_prescription(&mut fx, 60);
        let (id, _) = create_reminder(&mut fx.db, &fx.as_patient, NewReminder {
            prescription_id: rx,
            frequency: 1,
            times: vec!["09:00".into()],
            day_amount: Some(1),
        }, at("2026-03-10 08:00:00")).unwrap();

        toggle_reminder(&mut fx.db, &fx.as_patient, id, at("2026-03-11 07:00:00")).unwrap();
        assert_eq!(fx.db.reminder(id).unwrap().remaining_days, 0);
        assert!(toggle_reminder(&mut fx.db, &fx.as_patient, id, at("2026-03-11 07:30:00")).is_err());

        let effects = archive_expired(&mut fx.db, at("2026-03-11 08:00:00"));
        let reminder = fx.db.reminder(id).unwrap();
        assert!(reminder.is_archived && !reminder.is_active);
        assert_eq!(effects.broadcasts_to(Group::User(fx.patient_user)).count(), 1);

        let restored = restore_reminder(&mut fx.db, &fx.as_patient, id, Some(2), at("2026-03-12 08:00:00")).unwrap();
        assert_eq!(restored.scheduled().count(), 1);
        assert!(fx.db.reminder(id).unwrap().is_active);
    }

    #[test]
    fn paused_with_days_left_is_not_archived() {
        let mut fx = Fixture::new();
        let (id, _) = reminder(&mut fx, &["09:00"], at("2026-03-10 08:00:00"));
        toggle_reminder(&mut fx.db, &fx.as_patient, id, at("2026-03-11 08:00:00")).unwrap();

        let effects = archive_expired(&mut fx.db, at("2027-01-01 08:00:00"));
        assert!(effects.broadcasts.is_empty());
        let reminder = fx.db.reminder(id).unwrap();
        assert!(!reminder.is_archived && !reminder.is_active);
        assert!(reminder.remaining_days > 0);
    }

    #[test]
    fn delete_revokes_and_cascades() {
        let mut fx = Fixture::new();
        let (id, _) = reminder(&mut fx, &["09:00", "21:00"], at("2026-03-10 08:00:00"));
        let effects = delete_reminder(&mut fx.db, &fx.as_patient, id).unwrap();
        assert_eq!(effects.revoked().count(), 2);
        assert!(fx.db.reminder(id).is_err());
        assert!(fx.db.times_of_reminder(id).is_empty());
    }

    #[test]
    fn resume_all_skips_paused_and_archived() {
        let mut fx = Fixture::new();
        let now = at("2026-03-10 08:00:00");
        let (running, _) = reminder(&mut fx, &["09:00", "21:00"], now);
        let (paused, _) = reminder(&mut fx, &["10:00"], now);
        toggle_reminder(&mut fx.db, &fx.as_patient, paused, now).unwrap();

        let effects = resume_all(&mut fx.db, at("2026-03-11 07:00:00"));
        let jobs: Vec<_> = effects.scheduled().collect();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| fx.db.reminder_time(j.time_id).unwrap().reminder_id == running));
        // stale ids from the old process are dropped silently
        assert_eq!(effects.revoked().count(), 0);
    }

    #[test]
    fn listing_puts_archived_last() {
        let mut fx = Fixture::new();
        let now = at("2026-03-10 08:00:00");
        let (first, _) = reminder(&mut fx, &["09:00"], now);
        let (second, _) = reminder(&mut fx, &["21:00", "07:30"], now);
        fx.db.reminder_mut(first).unwrap().is_archived = true;
        let views = list_reminders(&fx.db, &fx.as_patient, now.date_naive()).unwrap();
        assert_eq!(views[0].id, second);
        assert_eq!(views[0].times[0].time, "07:30");
        assert_eq!(views[1].id, first);
    }
}
