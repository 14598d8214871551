//! `seed-demo`: fills an empty database with one pharmacy and enough activity
//! to exercise every screen (stock states, refills, reminders, read and unread
//! messages, notifications).

use std::fmt;

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, Utc};
use tracing::info;

use crate::accounts::{self, AccountFields, PatientRegistration, PharmacistRegistration, PharmacyRegistration};
use crate::error::{AppError, AppResult};
use crate::model::{Drug, Gender, MedicationReminder, Message, Prescription, ReadStatus, ReminderTime, Role, StockStatus, Thread};
use crate::notify::{self, NotificationTarget};
use crate::store::Database;


#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DemoAccount {
    pub username: String,
    pub role: Role,
    pub token: String,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct DemoSummary {
    pub accounts: Vec<DemoAccount>,
    pub join_code: String,
    pub drugs: usize,
    pub prescriptions: usize,
    pub reminders: usize,
    pub threads: usize,
    pub messages: usize,
    pub notifications: usize,
}
impl fmt::Display for DemoSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "demo data seeded (pharmacy join code {})", self.join_code)?;
        writeln!(
            f, "{} drugs, {} prescriptions, {} reminders, {} threads, {} messages, {} notifications",
            self.drugs, self.prescriptions, self.reminders, self.threads, self.messages, self.notifications,
        )?;
        for account in &self.accounts {
            writeln!(f, "{:<12} {:<15} {}", account.username, account.role.as_str(), account.token)?;
        }
        Ok(())
    }
}


fn fields(username: &str, first_name: &str, last_name: &str) -> AccountFields {
    AccountFields {
        username: username.to_owned(),
        email: format!("{}@mail.com", username),
        first_name: first_name.to_owned(),
        last_name: last_name.to_owned(),
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

struct Seeder<'a> {
    db: &'a mut Database,
    pharmacy_id: u64,
    threshold: i64,
    now: DateTime<Utc>,
    today: NaiveDate,
}

impl<'a> Seeder<'a> {
    fn drug(&mut self, name: &str, brand: &str, description: &str, dosage: &str, stock: i64, resupply_pending: bool) -> u64 {
        let (pharmacy_id, threshold) = (self.pharmacy_id, self.threshold);
        self.db.drugs.insert_with(|id| {
            let mut drug = Drug::new(
                id, pharmacy_id, name.to_owned(), brand.to_owned(), description.to_owned(),
                dosage.to_owned(), "ORAL".to_owned(), stock, StockStatus::InStock, resupply_pending,
            );
            drug.update_status(threshold);
            drug
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn prescription(&mut self, patient_id: u64, drug_id: u64, quantity: i64, prescriber: u64, valid_days: i64, refills_left: u32, refill_pending: bool) -> u64 {
        let (now, today) = (self.now, self.today);
        self.db.prescriptions.insert_with(|id| Prescription::new(
            id, patient_id, drug_id, quantity, prescriber, now,
            today + Duration::days(valid_days), refills_left, refill_pending, None,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn reminder(&mut self, patient_id: u64, prescription_id: u64, frequency: u32, started_days_ago: i64, day_amount: i64, archived: bool, times: &[NaiveTime]) -> u64 {
        let start_date = self.today - Duration::days(started_days_ago);
        let reminder_id = self.db.reminders.insert_with(|id| {
            let mut reminder = MedicationReminder::new(
                id, patient_id, prescription_id, frequency, start_date, day_amount, 0,
                !archived, archived, None,
            );
            reminder.remaining_days = reminder.days_left(start_date + Duration::days(started_days_ago));
            reminder
        });
        for time in times {
            self.db.reminder_times.insert_with(|id| ReminderTime::new(id, reminder_id, *time, !archived, None));
        }
        reminder_id
    }

    fn thread(&mut self, a: u64, b: u64, created_hours_ago: i64) -> u64 {
        let created = self.now - Duration::hours(created_hours_ago);
        self.db.threads.insert_with(|id| Thread::new(id, vec![a, b], created, created))
    }

    /// A message with a read status for both sides; the recipient's is unread unless `seen`.
    #[allow(clippy::too_many_arguments)]
    fn message(&mut self, thread_id: u64, sender: u64, recipient: u64, content: String, hours_ago: i64, seen: bool, tweak: impl FnOnce(&mut Message)) -> u64 {
        let timestamp = self.now - Duration::hours(hours_ago);
        let message_id = self.db.messages.insert_with(|id| {
            let mut message = Message::new(
                id, thread_id, sender, Some(recipient), content, timestamp,
                None, None, None, None, None,
            );
            tweak(&mut message);
            message
        });
        self.db.read_statuses.insert_with(|id| ReadStatus::new(id, message_id, sender, true));
        self.db.read_statuses.insert_with(|id| ReadStatus::new(id, message_id, recipient, seen));
        if let Some(thread) = self.db.threads.get_mut(thread_id) {
            if thread.last_updated < timestamp {
                thread.last_updated = timestamp;
            }
        }
        message_id
    }

    fn notification(&mut self, user_id: u64, target: NotificationTarget, hours_ago: i64, is_read: bool) -> u64 {
        let id = notify::create_notification(self.db, user_id, target, self.now - Duration::hours(hours_ago));
        if let Some(n) = self.db.notifications.get_mut(id) {
            n.is_read = is_read;
        }
        id
    }
}

/// Seeds an empty database. Refuses to touch one that already has accounts.
pub(crate) fn seed_demo(db: &mut Database, low_stock_threshold: i64, now: DateTime<Local>) -> AppResult<DemoSummary> {
    if db.accounts.len() > 0 {
        return Err(AppError::conflict("the database already has accounts; seed an empty one"));
    }
    let now_utc = now.with_timezone(&Utc);
    let mut accounts_made = Vec::new();

    let owner = accounts::register_pharmacy(db, PharmacyRegistration {
        account: fields("owner", "Olivia", "Grant"),
        pharmacy_name: "PulseRx Corner Pharmacy".to_owned(),
        street_address: "12 Market Street".to_owned(),
        city: "Springfield".to_owned(),
        state: "IL".to_owned(),
        zip_code: "62701".to_owned(),
    }, now_utc)?;
    let join_code = owner.join_code.clone().unwrap_or_default();
    accounts_made.push(DemoAccount { username: "owner".to_owned(), role: Role::PharmacyAdmin, token: owner.token.clone() });

    let pharmacist = accounts::register_pharmacist(db, PharmacistRegistration {
        account: fields("drjones", "Sarah", "Jones"),
        join_code: join_code.clone(),
    }, now_utc)?;
    accounts_made.push(DemoAccount { username: "drjones".to_owned(), role: Role::Pharmacist, token: pharmacist.token.clone() });

    let mut patients = Vec::new();
    for (username, first, last, born, gender) in [
        ("alice", "Alice", "Walker", (1961, 4, 2), Gender::Female),
        ("bob", "Bob", "Nguyen", (1975, 11, 23), Gender::Male),
        ("carmen", "Carmen", "Diaz", (1988, 7, 14), Gender::Female),
    ] {
        let registered = accounts::register_patient(db, PatientRegistration {
            account: fields(username, first, last),
            date_of_birth: NaiveDate::from_ymd_opt(born.0, born.1, born.2)
                .ok_or_else(|| AppError::Internal("bad demo birth date".to_owned()))?,
            gender,
            phone_number: "555-0100".to_owned(),
            pharmacy_id: Some(owner.profile_id),
        }, now_utc)?;
        accounts_made.push(DemoAccount { username: username.to_owned(), role: Role::Patient, token: registered.token.clone() });
        patients.push(registered);
    }
    let (alice, bob, carmen) = (&patients[0], &patients[1], &patients[2]);
    let rph_user = pharmacist.account_id;
    let rph = pharmacist.profile_id;

    let mut s = Seeder { db, pharmacy_id: owner.profile_id, threshold: low_stock_threshold, now: now_utc, today: now.date_naive() };

    let amoxil = s.drug("Amoxicillin", "Amoxil", "Antibiotic used to treat bacterial infections", "500mg capsules", 0, false);
    s.drug("Lisinopril", "Prinivil", "ACE inhibitor for high blood pressure", "10mg tablets", 0, true);
    let glucophage = s.drug("Metformin", "Glucophage", "Diabetes medication", "500mg tablets", 15, false);
    let lipitor = s.drug("Atorvastatin", "Lipitor", "Cholesterol medication", "20mg tablets", 25, false);
    let prilosec = s.drug("Omeprazole", "Prilosec", "Proton pump inhibitor for acid reflux", "20mg capsules", 150, false);
    let synthroid = s.drug("Levothyroxine", "Synthroid", "Thyroid hormone replacement", "50mcg tablets", 200, false);

    let rx_prilosec = s.prescription(alice.profile_id, prilosec, 30, rph, 180, 3, false);
    let rx_glucophage = s.prescription(alice.profile_id, glucophage, 60, rph, 180, 2, false);
    let rx_synthroid = s.prescription(bob.profile_id, synthroid, 30, rph, 90, 1, true);
    let rx_amoxil = s.prescription(bob.profile_id, amoxil, 20, rph, 60, 0, false);
    let rx_lipitor = s.prescription(carmen.profile_id, lipitor, 30, rph, 15, 0, false);

    s.reminder(alice.profile_id, rx_prilosec, 2, 10, 30, false, &[hm(9, 0), hm(21, 0)]);
    s.reminder(alice.profile_id, rx_glucophage, 1, 5, 60, false, &[hm(8, 30)]);
    let running_out = s.reminder(bob.profile_id, rx_synthroid, 1, 27, 30, false, &[hm(10, 0)]);
    s.reminder(alice.profile_id, rx_prilosec, 3, 60, 30, true, &[hm(8, 0), hm(14, 0), hm(20, 0)]);
    s.reminder(bob.profile_id, rx_amoxil, 2, 45, 20, true, &[hm(9, 0), hm(21, 0)]);
    s.reminder(carmen.profile_id, rx_lipitor, 1, 90, 30, true, &[hm(12, 0)]);

    let bob_thread = s.thread(bob.account_id, rph_user, 30);
    s.message(bob_thread, bob.account_id, rph_user, "Do you have Amoxil in stock? I need to fill my prescription.".to_owned(), 29, true,
        |m| m.drug_id = Some(amoxil));
    s.message(bob_thread, rph_user, bob.account_id, "Unfortunately, Amoxil is currently out of stock. We're waiting for a resupply. I'll notify you when it arrives.".to_owned(), 28, true,
        |m| { m.drug_id = Some(amoxil); m.resupply_fulfilled = Some(false); });
    s.message(bob_thread, bob.account_id, rph_user, "Thank you for letting me know. Please keep me updated.".to_owned(), 27, true, |_| {});
    let refill_request = s.message(bob_thread, bob.account_id, rph_user, "Hi, I need a refill for my Synthroid prescription. I'm running low.".to_owned(), 3, false,
        |m| m.prescription_id = Some(rx_synthroid));
    s.message(bob_thread, rph_user, bob.account_id, "I've received your refill request. We'll have it ready for pickup tomorrow.".to_owned(), 2, false,
        |m| m.prescription_id = Some(rx_synthroid));

    let alice_thread = s.thread(alice.account_id, rph_user, 12);
    let low_stock_note = s.message(alice_thread, rph_user, alice.account_id,
        "Hi Alice, just wanted to let you know that Glucophage is running low in our inventory. Please refill your prescription soon.".to_owned(), 12, false,
        |m| m.drug_id = Some(glucophage));

    let carmen_thread = s.thread(carmen.account_id, rph_user, 72);
    s.message(carmen_thread, carmen.account_id, rph_user, "What are your pharmacy hours on weekends?".to_owned(), 72, true, |_| {});
    s.message(carmen_thread, rph_user, carmen.account_id, "We're open Saturday 9am-5pm and Sunday 10am-4pm. Let me know if you need anything!".to_owned(), 71, true, |_| {});

    s.notification(rph_user, NotificationTarget {
        message_id: Some(refill_request),
        prescription_id: Some(rx_synthroid),
        content: Some("New refill request from Bob Nguyen".to_owned()),
        link: Some(crate::prescriptions::prescription_link(rx_synthroid)),
        ..Default::default()
    }, 3, false);
    s.notification(alice.account_id, NotificationTarget {
        message_id: Some(low_stock_note),
        drug_id: Some(glucophage),
        content: Some("Low stock alert for Glucophage".to_owned()),
        link: Some(crate::messaging::thread_link(alice_thread)),
        ..Default::default()
    }, 12, false);
    s.notification(bob.account_id, NotificationTarget {
        prescription_id: Some(rx_synthroid),
        content: Some("Pharmacist responded to your refill request".to_owned()),
        link: Some(crate::messaging::thread_link(bob_thread)),
        ..Default::default()
    }, 2, true);
    s.notification(bob.account_id, NotificationTarget {
        reminder_id: Some(running_out),
        content: Some("Your Synthroid reminder expires in 3 days".to_owned()),
        link: Some(crate::reminders::REMINDERS_LINK.to_owned()),
        ..Default::default()
    }, 6, false);
    s.notification(rph_user, NotificationTarget {
        drug_id: Some(amoxil),
        content: Some("Amoxil is out of stock".to_owned()),
        link: Some(crate::pharmacy::inventory_link(amoxil)),
        ..Default::default()
    }, 24, true);

    let summary = DemoSummary {
        accounts: accounts_made,
        join_code,
        drugs: db.drugs.len(),
        prescriptions: db.prescriptions.len(),
        reminders: db.reminders.len(),
        threads: db.threads.len(),
        messages: db.messages.len(),
        notifications: db.notifications.len(),
    };
    info!(drugs = summary.drugs, messages = summary.messages, "demo data seeded");
    Ok(summary)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::THRESHOLD;

    #[test]
    fn seeds_every_scenario() {
        let mut db = Database::default();
        let now = Local::now();
        let summary = seed_demo(&mut db, THRESHOLD, now).unwrap();

        assert_eq!(summary.accounts.len(), 5);
        assert_eq!(summary.drugs, 6);
        assert_eq!(summary.prescriptions, 5);
        assert_eq!(summary.reminders, 6);
        assert_eq!(summary.threads, 3);
        assert_eq!(summary.messages, 8);
        assert_eq!(summary.notifications, 5);

        let statuses: Vec<StockStatus> = db.drugs.values().map(|d| d.status).collect();
        assert_eq!(statuses.iter().filter(|s| **s == StockStatus::OutOfStock).count(), 2);
        assert_eq!(statuses.iter().filter(|s| **s == StockStatus::LowStock).count(), 2);
        assert_eq!(statuses.iter().filter(|s| **s == StockStatus::InStock).count(), 2);

        let archived = db.reminders.values().filter(|r| r.is_archived).count();
        assert_eq!(archived, 3);
        let bob = summary.accounts.iter().find(|a| a.username == "bob").unwrap();
        let bob_id = db.account_by_token(&bob.token).unwrap().id;
        let running_out = db.reminders.values()
            .find(|r| !r.is_archived && r.day_amount == 30 && r.start_date == now.date_naive() - Duration::days(27))
            .unwrap();
        assert_eq!(running_out.remaining_days, 3);
        // one unread message plus one unread notification
        assert_eq!(db.unread_counts(bob_id), (1, 1));
    }

    #[test]
    fn refuses_a_populated_database() {
        let mut db = Database::default();
        seed_demo(&mut db, THRESHOLD, Local::now()).unwrap();
        assert!(matches!(seed_demo(&mut db, THRESHOLD, Local::now()), Err(AppError::Conflict(_))));
    }
}
