use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use derive_new::new;
use serde::{Deserialize, Serialize};


pub(crate) const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 30;
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;


#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct Config {
    pub listen_addr: String,
    pub base_url: String,
    #[serde(default)]
    pub data_path: Option<String>,
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default)]
    pub auth_tokens: Vec<String>,
    #[serde(default = "Config::default_low_stock_threshold")]
    pub low_stock_threshold: i64,
    #[serde(default = "Config::default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}
impl Config {
    fn default_low_stock_threshold() -> i64 { DEFAULT_LOW_STOCK_THRESHOLD }
    fn default_sweep_interval_secs() -> u64 { DEFAULT_SWEEP_INTERVAL_SECS }
}


#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Role {
    PharmacyAdmin,
    Pharmacist,
    Patient,
    System,
}
impl Role {
    pub fn is_pharmacy_staff(self) -> bool {
        matches!(self, Role::PharmacyAdmin | Role::Pharmacist)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::PharmacyAdmin => "pharmacy admin",
            Role::Pharmacist => "pharmacist",
            Role::Patient => "patient",
            Role::System => "system",
        }
    }
}
impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub(crate) enum Gender {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StockStatus {
    InStock,
    LowStock,
    OutOfStock,
}
impl StockStatus {
    pub fn for_stock(stock: i64, low_stock_threshold: i64) -> StockStatus {
        if stock <= 0 {
            StockStatus::OutOfStock
        } else if stock <= low_stock_threshold {
            StockStatus::LowStock
        } else {
            StockStatus::InStock
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StockStatus::InStock => "In stock",
            StockStatus::LowStock => "Low stock",
            StockStatus::OutOfStock => "Out of stock",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StockStatus::InStock => "in_stock",
            StockStatus::LowStock => "low_stock",
            StockStatus::OutOfStock => "out_of_stock",
        }
    }
}


#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct Account {
    pub id: u64,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub token: String,
    pub date_joined: DateTime<Utc>,
}
impl Account {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct PharmacyProfile {
    pub id: u64,
    pub user_id: u64,
    pub pharmacy_name: String,
    pub street_address: String,
    pub city: String,
    pub state: String,
    pub zip_code: String,
    pub join_code: String,
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct PharmacistProfile {
    pub id: u64,
    pub user_id: u64,
    pub pharmacy_id: u64,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct PatientProfile {
    pub id: u64,
    pub user_id: u64,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub phone_number: String,
    pub pharmacy_id: Option<u64>,
}
impl PatientProfile {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct Drug {
    pub id: u64,
    pub pharmacy_id: u64,
    pub name: String,
    pub brand: String,
    pub description: String,
    pub dosage: String,
    pub route: String,
    pub stock: i64,
    pub status: StockStatus,
    pub resupply_pending: bool,
}
impl Drug {
    /// Recomputes `status` from `stock`; returns the status before the update.
    pub fn update_status(&mut self, low_stock_threshold: i64) -> StockStatus {
        let previous = self.status;
        self.status = StockStatus::for_stock(self.stock, low_stock_threshold);
        previous
    }

    pub fn display_name(&self) -> &str {
        if self.brand.is_empty() {
            &self.name
        } else {
            &self.brand
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct Prescription {
    pub id: u64,
    pub patient_id: u64,
    pub drug_id: u64,
    pub quantity: i64,
    pub prescribed_by: u64,
    pub prescribed_on: DateTime<Utc>,
    pub expiration_date: NaiveDate,
    pub refills_left: u32,
    pub refill_pending: bool,
    pub refilled_on: Option<DateTime<Utc>>,
}
impl Prescription {
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expiration_date < today
    }
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct MedicationReminder {
    pub id: u64,
    pub patient_id: u64,
    pub prescription_id: u64,
    pub frequency: u32,
    pub start_date: NaiveDate,
    pub day_amount: i64,
    pub remaining_days: i64,
    pub is_active: bool,
    pub is_archived: bool,
    pub restoration_time: Option<DateTime<Utc>>,
}
impl MedicationReminder {
    pub fn days_left(&self, today: NaiveDate) -> i64 {
        let elapsed = (today - self.start_date).num_days().max(0);
        (self.day_amount - elapsed).max(0)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct ReminderTime {
    pub id: u64,
    pub reminder_id: u64,
    pub time: NaiveTime,
    pub is_active: bool,
    pub task_id: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct Thread {
    pub id: u64,
    pub participants: Vec<u64>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}
impl Thread {
    pub fn has_participant(&self, user_id: u64) -> bool {
        self.participants.contains(&user_id)
    }
}

/// Optional link from a message to the record it is about.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct Attachment {
    pub prescription_id: Option<u64>,
    pub drug_id: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct Message {
    pub id: u64,
    pub thread_id: u64,
    pub sender_id: u64,
    pub recipient_id: Option<u64>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub link: Option<String>,
    pub prescription_id: Option<u64>,
    pub refill_fulfilled: Option<bool>,
    pub drug_id: Option<u64>,
    pub resupply_fulfilled: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Eq, new, PartialEq, Serialize)]
pub(crate) struct ReadStatus {
    pub id: u64,
    pub message_id: u64,
    pub user_id: u64,
    pub read: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct Notification {
    pub id: u64,
    pub user_id: u64,
    pub message_id: Option<u64>,
    pub reminder_id: Option<u64>,
    pub prescription_id: Option<u64>,
    pub drug_id: Option<u64>,
    pub content: Option<String>,
    pub link: Option<String>,
    pub time: DateTime<Utc>,
    pub is_read: bool,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stock_status_thresholds() {
        assert_eq!(StockStatus::for_stock(0, 30), StockStatus::OutOfStock);
        assert_eq!(StockStatus::for_stock(-3, 30), StockStatus::OutOfStock);
        assert_eq!(StockStatus::for_stock(1, 30), StockStatus::LowStock);
        assert_eq!(StockStatus::for_stock(30, 30), StockStatus::LowStock);
        assert_eq!(StockStatus::for_stock(31, 30), StockStatus::InStock);
    }

    #[test]
    fn days_left_counts_down_and_floors_at_zero() {
        let start = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let reminder = MedicationReminder::new(1, 1, 1, 2, start, 10, 10, true, false, None);
        assert_eq!(reminder.days_left(start), 10);
        assert_eq!(reminder.days_left(NaiveDate::from_ymd_opt(2026, 3, 4).unwrap()), 7);
        assert_eq!(reminder.days_left(NaiveDate::from_ymd_opt(2026, 3, 11).unwrap()), 0);
        assert_eq!(reminder.days_left(NaiveDate::from_ymd_opt(2026, 5, 1).unwrap()), 0);
        // a start date in the future does not add days
        assert_eq!(reminder.days_left(NaiveDate::from_ymd_opt(2026, 2, 20).unwrap()), 10);
    }

    #[test]
    fn role_serializes_snake_case() {
        let json = serde_json::to_string(&Role::PharmacyAdmin).unwrap();
        assert_eq!(json, "\"pharmacy_admin\"");
        assert!(Role::Pharmacist.is_pharmacy_staff());
        assert!(!Role::Patient.is_pharmacy_staff());
    }
}
