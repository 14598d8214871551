//! Shared fixture for the domain tests: one pharmacy with an admin, a pharmacist,
//! a patient and one drug.

use chrono::{NaiveDate, Utc};

use crate::accounts::Principal;
use crate::model::{
    Account, Config, Drug, Gender, PatientProfile, PharmacistProfile, PharmacyProfile, Prescription,
    Role, StockStatus,
};
use crate::store::Database;


pub(crate) const THRESHOLD: i64 = 30;

pub(crate) struct Fixture {
    pub db: Database,
    pub pharmacy: u64,
    pub admin_user: u64,
    pub pharmacist_user: u64,
    pub pharmacist: u64,
    pub patient_user: u64,
    pub patient: u64,
    pub drug: u64,
    pub as_admin: Principal,
    pub as_pharmacist: Principal,
    pub as_patient: Principal,
}

pub(crate) fn add_account(db: &mut Database, username: &str, role: Role) -> u64 {
    db.accounts.insert_with(|id| Account::new(
        id,
        username.to_owned(),
        format!("{}@mail.com", username),
        username.to_owned(),
        "Test".to_owned(),
        role,
        format!("token-{}", username),
        Utc::now(),
    ))
}

impl Fixture {
    pub fn new() -> Fixture {
        let mut db = Database::default();
        let admin_user = add_account(&mut db, "admin", Role::PharmacyAdmin);
        let pharmacist_user = add_account(&mut db, "pharmacist", Role::Pharmacist);
        let patient_user = add_account(&mut db, "patient", Role::Patient);

        let pharmacy = db.pharmacies.insert_with(|id| PharmacyProfile::new(
            id, admin_user, "Corner Pharmacy".to_owned(), "1 Main St".to_owned(),
            "Springfield".to_owned(), "IL".to_owned(), "62701".to_owned(), "JOIN01".to_owned(),
        ));
        let pharmacist = db.pharmacists.insert_with(|id| PharmacistProfile::new(
            id, pharmacist_user, pharmacy, "Sarah".to_owned(), "Jones".to_owned(),
        ));
        let patient = db.patients.insert_with(|id| PatientProfile::new(
            id, patient_user, "Pat".to_owned(), "Smith".to_owned(),
            NaiveDate::from_ymd_opt(1970, 5, 17).unwrap(), Gender::Female,
            "555-123-4567".to_owned(), Some(pharmacy),
        ));
        let drug = db.drugs.insert_with(|id| Drug::new(
            id, pharmacy, "Metformin".to_owned(), "Glucophage".to_owned(),
            "Diabetes medication".to_owned(), "500mg tablets".to_owned(), "ORAL".to_owned(),
            40, StockStatus::InStock, false,
        ));

        Fixture {
            db, pharmacy, admin_user, pharmacist_user, pharmacist, patient_user, patient, drug,
            as_admin: Principal { account_id: admin_user, role: Role::PharmacyAdmin },
            as_pharmacist: Principal { account_id: pharmacist_user, role: Role::Pharmacist },
            as_patient: Principal { account_id: patient_user, role: Role::Patient },
        }
    }
}

/// A prescription of the fixture drug for the fixture patient, prescribed by the fixture pharmacist.
pub(crate) fn add_prescription(fx: &mut Fixture, quantity: i64) -> u64 {
    let (patient, drug, pharmacist) = (fx.patient, fx.drug, fx.pharmacist);
    fx.db.prescriptions.insert_with(|id| Prescription::new(
        id, patient, drug, quantity, pharmacist, Utc::now(),
        NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(), 2, false, None,
    ))
}

pub(crate) fn config() -> Config {
    Config::new(
        "127.0.0.1:0".to_owned(),
        "http://localhost:8000/".to_owned(),
        None,
        None,
        vec!["system-token".to_owned()],
        THRESHOLD,
        3600,
    )
}
