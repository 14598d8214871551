use std::collections::{btree_map, BTreeMap};
use std::fs::File;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::model::{
    Account, Drug, MedicationReminder, Message, Notification, PatientProfile, PharmacistProfile,
    PharmacyProfile, Prescription, ReadStatus, ReminderTime, Role, Thread,
};


/// A table of rows keyed by id, with its own id counter.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct Table<T> {
    next_id: u64,
    rows: BTreeMap<u64, T>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Table { next_id: 1, rows: BTreeMap::new() }
    }
}

impl<T> Table<T> {
    pub fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Allocates an id and inserts the row produced by `make`.
    pub fn insert_with<F: FnOnce(u64) -> T>(&mut self, make: F) -> u64 {
        let id = self.allocate_id();
        self.rows.insert(id, make(id));
        id
    }

    pub fn get(&self, id: u64) -> Option<&T> { self.rows.get(&id) }
    pub fn get_mut(&mut self, id: u64) -> Option<&mut T> { self.rows.get_mut(&id) }
    pub fn remove(&mut self, id: u64) -> Option<T> { self.rows.remove(&id) }
    pub fn values(&self) -> btree_map::Values<'_, u64, T> { self.rows.values() }
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> { self.rows.values_mut() }
    pub fn len(&self) -> usize { self.rows.len() }

    pub fn retain<F: FnMut(&T) -> bool>(&mut self, mut keep: F) {
        self.rows.retain(|_, row| keep(row));
    }
}


#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub(crate) struct Database {
    pub accounts: Table<Account>,
    pub pharmacies: Table<PharmacyProfile>,
    pub pharmacists: Table<PharmacistProfile>,
    pub patients: Table<PatientProfile>,
    pub drugs: Table<Drug>,
    pub prescriptions: Table<Prescription>,
    pub reminders: Table<MedicationReminder>,
    pub reminder_times: Table<ReminderTime>,
    pub threads: Table<Thread>,
    pub messages: Table<Message>,
    pub read_statuses: Table<ReadStatus>,
    pub notifications: Table<Notification>,
    #[serde(default)]
    pub task_counter: u64,
}

impl Database {
    /// Loads the database from `path`; a missing file yields an empty database.
    pub fn load(path: &Path) -> AppResult<Database> {
        let reader = match File::open(path) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("data file {:?} does not exist yet; starting empty", path);
                return Ok(Database::default());
            },
            Err(e) => return Err(e.into()),
        };
        let db: Database = serde_json::from_reader(io::BufReader::new(reader))?;
        debug!(accounts = db.accounts.len(), drugs = db.drugs.len(), "loaded data file");
        Ok(db)
    }

    /// Writes the database to a sibling temp file, then renames it over `path`.
    pub fn store(&self, path: &Path) -> AppResult<()> {
        let mut temp_path = path.as_os_str().to_owned();
        temp_path.push(".tmp");
        {
            let writer = File::create(&temp_path)?;
            serde_json::to_writer_pretty(io::BufWriter::new(writer), self)?;
        }
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    pub fn next_task_id(&mut self, time_id: u64) -> String {
        self.task_counter += 1;
        format!("reminder-time-{}-{}", time_id, self.task_counter)
    }

    pub fn account(&self, id: u64) -> AppResult<&Account> {
        self.accounts.get(id).ok_or(AppError::NotFound("account"))
    }

    pub fn account_by_token(&self, token: &str) -> Option<&Account> {
        self.accounts.values().find(|a| a.token == token)
    }

    pub fn pharmacy(&self, id: u64) -> AppResult<&PharmacyProfile> {
        self.pharmacies.get(id).ok_or(AppError::NotFound("pharmacy"))
    }

    pub fn pharmacy_by_admin(&self, user_id: u64) -> Option<&PharmacyProfile> {
        self.pharmacies.values().find(|p| p.user_id == user_id)
    }

    pub fn pharmacy_by_join_code(&self, code: &str) -> Option<&PharmacyProfile> {
        self.pharmacies.values().find(|p| p.join_code.eq_ignore_ascii_case(code))
    }

    pub fn pharmacist_by_user(&self, user_id: u64) -> Option<&PharmacistProfile> {
        self.pharmacists.values().find(|p| p.user_id == user_id)
    }

    pub fn patient(&self, id: u64) -> AppResult<&PatientProfile> {
        self.patients.get(id).ok_or(AppError::NotFound("patient"))
    }

    pub fn patient_by_user(&self, user_id: u64) -> Option<&PatientProfile> {
        self.patients.values().find(|p| p.user_id == user_id)
    }

    pub fn drug(&self, id: u64) -> AppResult<&Drug> {
        self.drugs.get(id).ok_or(AppError::NotFound("drug"))
    }

    pub fn drug_mut(&mut self, id: u64) -> AppResult<&mut Drug> {
        self.drugs.get_mut(id).ok_or(AppError::NotFound("drug"))
    }

    pub fn prescription(&self, id: u64) -> AppResult<&Prescription> {
        self.prescriptions.get(id).ok_or(AppError::NotFound("prescription"))
    }

    pub fn prescription_mut(&mut self, id: u64) -> AppResult<&mut Prescription> {
        self.prescriptions.get_mut(id).ok_or(AppError::NotFound("prescription"))
    }

    pub fn reminder(&self, id: u64) -> AppResult<&MedicationReminder> {
        self.reminders.get(id).ok_or(AppError::NotFound("reminder"))
    }

    pub fn reminder_mut(&mut self, id: u64) -> AppResult<&mut MedicationReminder> {
        self.reminders.get_mut(id).ok_or(AppError::NotFound("reminder"))
    }

    pub fn reminder_time(&self, id: u64) -> AppResult<&ReminderTime> {
        self.reminder_times.get(id).ok_or(AppError::NotFound("reminder time"))
    }

    pub fn thread(&self, id: u64) -> AppResult<&Thread> {
        self.threads.get(id).ok_or(AppError::NotFound("thread"))
    }

    pub fn message(&self, id: u64) -> AppResult<&Message> {
        self.messages.get(id).ok_or(AppError::NotFound("message"))
    }

    /// Ids of the reminder times belonging to a reminder, in id order.
    pub fn times_of_reminder(&self, reminder_id: u64) -> Vec<u64> {
        self.reminder_times.values()
            .filter(|t| t.reminder_id == reminder_id)
            .map(|t| t.id)
            .collect()
    }

    /// Returns `(unread notifications, unread messages)` for a user.
    pub fn unread_counts(&self, user_id: u64) -> (usize, usize) {
        let unread_notifications = self.notifications.values()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count();
        let unread_messages = self.read_statuses.values()
            .filter(|rs| rs.user_id == user_id && !rs.read)
            .count();
        (unread_notifications, unread_messages)
    }

    /// The pharmacy an admin or pharmacist belongs to.
    pub fn pharmacy_of(&self, user_id: u64) -> Option<u64> {
        let account = self.accounts.get(user_id)?;
        match account.role {
            Role::PharmacyAdmin => self.pharmacy_by_admin(user_id).map(|p| p.id),
            Role::Pharmacist => self.pharmacist_by_user(user_id).map(|p| p.pharmacy_id),
            Role::Patient | Role::System => None,
        }
    }

    /// Account ids of the pharmacy admin followed by all pharmacists of the pharmacy.
    pub fn pharmacy_staff(&self, pharmacy_id: u64) -> Vec<u64> {
        let mut staff = Vec::new();
        if let Some(pharmacy) = self.pharmacies.get(pharmacy_id) {
            staff.push(pharmacy.user_id);
        }
        staff.extend(
            self.pharmacists.values()
                .filter(|p| p.pharmacy_id == pharmacy_id)
                .map(|p| p.user_id)
        );
        staff
    }

    pub fn username_taken(&self, username: &str) -> bool {
        self.accounts.values().any(|a| a.username.eq_ignore_ascii_case(username))
    }

    pub fn email_taken(&self, email: &str) -> bool {
        self.accounts.values().any(|a| a.email.eq_ignore_ascii_case(email))
    }
}
