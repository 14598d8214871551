use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::accounts::Principal;
use crate::effects::Effects;
use crate::error::{AppError, AppResult};
use crate::hub::Presence;
use crate::messaging::{self, NewMessage};
use crate::model::{
    Attachment, Drug, MedicationReminder, PatientProfile, Prescription, Role, StockStatus,
};
use crate::notify::{self, NotificationTarget};
use crate::store::Database;
use crate::util::unique_join_code;


const SEARCH_LIMIT: usize = 20;


/// Font Awesome icon class for an administration route.
pub(crate) fn med_icon(route: &str) -> &'static str {
    match route.trim().to_ascii_uppercase().as_str() {
        "ORAL" => "fa-capsules",
        "RESPIRATORY (INHALATION)" => "fa-lungs",
        "INTRATHECAL" => "fa-syringe",
        "OPHTHALMIC" => "fa-eye",
        "TOPICAL" => "fa-pump-soap",
        "SUBCUTANEOUS" => "fa-syringe",
        "INTRAMUSCULAR" => "fa-syringe",
        "INTRAVENOUS" => "fa-droplet",
        "SUBLINGUAL" => "fa-mouth",
        "NASAL" => "fa-head-side-cough",
        _ => "fa-question",
    }
}

pub(crate) fn inventory_link(drug_id: u64) -> String {
    format!("/inventory#drug-{}", drug_id)
}

/// The pharmacy of a staff principal.
pub(crate) fn staff_pharmacy(db: &Database, principal: &Principal) -> AppResult<u64> {
    principal.require_staff()?;
    db.pharmacy_of(principal.account_id)
        .ok_or(AppError::NotFound("pharmacy profile"))
}

/// Loads a drug and checks that it belongs to the principal's pharmacy.
pub(crate) fn own_drug<'a>(db: &'a Database, principal: &Principal, drug_id: u64) -> AppResult<&'a Drug> {
    let pharmacy_id = staff_pharmacy(db, principal)?;
    let drug = db.drug(drug_id)?;
    if drug.pharmacy_id != pharmacy_id {
        return Err(AppError::Forbidden("drug belongs to another pharmacy"));
    }
    Ok(drug)
}

pub(crate) fn regenerate_join_code(db: &mut Database, principal: &Principal) -> AppResult<String> {
    principal.require(Role::PharmacyAdmin)?;
    let pharmacy_id = staff_pharmacy(db, principal)?;
    let code = unique_join_code(|c| db.pharmacy_by_join_code(c).is_some());
    if let Some(pharmacy) = db.pharmacies.get_mut(pharmacy_id) {
        pharmacy.join_code = code.clone();
    }
    info!(pharmacy_id, "join code regenerated");
    Ok(code)
}


/// Stores a new stock level and queues staff alerts when the drug enters a worse state.
pub(crate) fn set_stock(
    db: &mut Database,
    drug_id: u64,
    stock: i64,
    low_stock_threshold: i64,
    now: DateTime<Utc>,
    effects: &mut Effects,
) -> AppResult<StockStatus> {
    let (pharmacy_id, previous, current, name, stock) = {
        let drug = db.drug_mut(drug_id)?;
        drug.stock = stock.max(0);
        let previous = drug.update_status(low_stock_threshold);
        (drug.pharmacy_id, previous, drug.status, drug.display_name().to_owned(), drug.stock)
    };

    if current != previous && current != StockStatus::InStock {
        let (kind, content) = match current {
            StockStatus::OutOfStock => ("out_of_stock", format!("{} is out of stock", name)),
            _ => ("low_stock", format!("Low stock alert for {} ({} left)", name, stock)),
        };
        let target = NotificationTarget {
            drug_id: Some(drug_id),
            content: Some(content.clone()),
            link: Some(inventory_link(drug_id)),
            ..Default::default()
        };
        let data = notify::payload(json!({
            "type": kind,
            "drug_id": drug_id,
            "drug": name,
            "stock": stock,
            "content": content,
        }));
        notify::notify_staff(db, pharmacy_id, target, data, now, effects);
    }
    Ok(current)
}


#[derive(Clone, Debug, Deserialize)]
pub(crate) struct NewDrug {
    pub name: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dosage: String,
    #[serde(default)]
    pub route: String,
    pub stock: i64,
}

pub(crate) fn add_drug(db: &mut Database, principal: &Principal, new: NewDrug, low_stock_threshold: i64) -> AppResult<u64> {
    let pharmacy_id = staff_pharmacy(db, principal)?;
    if new.name.trim().is_empty() {
        return Err(AppError::bad_request("drug name must not be empty"));
    }
    if new.stock < 0 {
        return Err(AppError::bad_request("stock must not be negative"));
    }
    let duplicate = db.drugs.values().any(|d| {
        d.pharmacy_id == pharmacy_id
            && d.name.eq_ignore_ascii_case(new.name.trim())
            && d.brand.eq_ignore_ascii_case(new.brand.trim())
    });
    if duplicate {
        return Err(AppError::conflict("this drug is already in the inventory"));
    }
    let status = StockStatus::for_stock(new.stock, low_stock_threshold);
    Ok(db.drugs.insert_with(|id| Drug::new(
        id,
        pharmacy_id,
        new.name.trim().to_owned(),
        new.brand.trim().to_owned(),
        new.description,
        new.dosage,
        new.route.trim().to_owned(),
        new.stock,
        status,
        false,
    )))
}

/// The pharmacy's drugs ordered by name, optionally limited to one stock status.
pub(crate) fn inventory(db: &Database, pharmacy_id: u64, status: Option<StockStatus>) -> Vec<&Drug> {
    let mut drugs: Vec<&Drug> = db.drugs.values()
        .filter(|d| d.pharmacy_id == pharmacy_id)
        .filter(|d| status.map(|s| d.status == s).unwrap_or(true))
        .collect();
    drugs.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()).then(a.id.cmp(&b.id)));
    drugs
}

pub(crate) fn medicine_search<'a>(db: &'a Database, pharmacy_id: u64, query: &str) -> Vec<&'a Drug> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    inventory(db, pharmacy_id, None).into_iter()
        .filter(|d| d.name.to_lowercase().contains(&needle) || d.brand.to_lowercase().contains(&needle))
        .take(SEARCH_LIMIT)
        .collect()
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct DrugDetail<'a> {
    pub drug: &'a Drug,
    pub icon: &'static str,
    pub active_prescriptions: usize,
    pub pending_refills: usize,
}

pub(crate) fn drug_detail<'a>(db: &'a Database, principal: &Principal, drug_id: u64) -> AppResult<DrugDetail<'a>> {
    let drug = own_drug(db, principal, drug_id)?;
    let prescriptions: Vec<&Prescription> = db.prescriptions.values()
        .filter(|p| p.drug_id == drug_id)
        .collect();
    Ok(DrugDetail {
        drug,
        icon: med_icon(&drug.route),
        active_prescriptions: prescriptions.len(),
        pending_refills: prescriptions.iter().filter(|p| p.refill_pending).count(),
    })
}


/// A pharmacist asks the pharmacy admin to restock a drug.
pub(crate) fn contact_admin(
    db: &mut Database,
    presence: &dyn Presence,
    principal: &Principal,
    drug_id: u64,
    note: Option<String>,
    now: DateTime<Utc>,
) -> AppResult<Effects> {
    principal.require(Role::Pharmacist)?;
    let (pharmacy_id, name, stock) = {
        let drug = own_drug(db, principal, drug_id)?;
        if drug.resupply_pending {
            return Err(AppError::conflict("a resupply is already pending for this drug"));
        }
        (drug.pharmacy_id, drug.display_name().to_owned(), drug.stock)
    };
    let admin_id = db.pharmacy(pharmacy_id)?.user_id;

    db.drug_mut(drug_id)?.resupply_pending = true;

    let thread_id = messaging::find_or_create_thread(db, principal.account_id, admin_id, now);
    let mut content = format!("Requesting resupply of {} ({} left).", name, stock);
    if let Some(note) = note.map(|n| n.trim().to_owned()).filter(|n| !n.is_empty()) {
        content.push(' ');
        content.push_str(&note);
    }
    let request = NewMessage {
        content,
        link: Some(inventory_link(drug_id)),
        attachment: Attachment { prescription_id: None, drug_id: Some(drug_id) },
        refill_fulfilled: None,
        resupply_fulfilled: None,
    };
    let (_, effects) = messaging::post_message(db, presence, principal.account_id, thread_id, request, now)?;
    info!(drug_id, pharmacy_id, "resupply requested");
    Ok(effects)
}

/// The admin restocks a drug: stock is reset to `amount` and the pending flag cleared.
pub(crate) fn resupply(
    db: &mut Database,
    principal: &Principal,
    drug_id: u64,
    amount: i64,
    low_stock_threshold: i64,
    now: DateTime<Utc>,
) -> AppResult<Effects> {
    principal.require(Role::PharmacyAdmin)?;
    if amount <= 0 {
        return Err(AppError::bad_request("resupply amount must be positive"));
    }
    let name = own_drug(db, principal, drug_id)?.display_name().to_owned();
    let pharmacy_id = staff_pharmacy(db, principal)?;

    let mut effects = Effects::default();
    db.drug_mut(drug_id)?.resupply_pending = false;
    set_stock(db, drug_id, amount, low_stock_threshold, now, &mut effects)?;

    for message in db.messages.values_mut() {
        if message.drug_id == Some(drug_id)
            && message.resupply_fulfilled.is_none()
            && message.recipient_id == Some(principal.account_id)
        {
            message.resupply_fulfilled = Some(true);
        }
    }

    let content = format!("{} was resupplied ({} in stock)", name, amount);
    let target = NotificationTarget {
        drug_id: Some(drug_id),
        content: Some(content.clone()),
        link: Some(inventory_link(drug_id)),
        ..Default::default()
    };
    let data = notify::payload(json!({
        "type": "resupply",
        "drug_id": drug_id,
        "drug": name,
        "stock": amount,
        "content": content,
    }));
    notify::notify_staff(db, pharmacy_id, target, data, now, &mut effects);
    info!(drug_id, amount, "drug resupplied");
    Ok(effects)
}


pub(crate) fn patient_search<'a>(db: &'a Database, principal: &Principal, query: &str) -> AppResult<Vec<&'a PatientProfile>> {
    principal.require_staff()?;
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Ok(Vec::new());
    }
    let mut found: Vec<&PatientProfile> = db.patients.values()
        .filter(|p| {
            p.full_name().to_lowercase().contains(&needle)
                || p.phone_number.contains(&needle)
                || db.accounts.get(p.user_id)
                    .map(|a| a.username.to_lowercase().contains(&needle))
                    .unwrap_or(false)
        })
        .collect();
    found.sort_by(|a, b| (&a.last_name, &a.first_name).cmp(&(&b.last_name, &b.first_name)));
    found.truncate(SEARCH_LIMIT);
    Ok(found)
}

fn is_patient_of(db: &Database, patient: &PatientProfile, pharmacy_id: u64) -> bool {
    patient.pharmacy_id == Some(pharmacy_id)
        || db.prescriptions.values().any(|rx| {
            rx.patient_id == patient.id
                && db.drugs.get(rx.drug_id).map(|d| d.pharmacy_id == pharmacy_id).unwrap_or(false)
        })
}

/// Patients registered with the pharmacy or holding one of its prescriptions.
pub(crate) fn my_patients<'a>(db: &'a Database, principal: &Principal) -> AppResult<Vec<&'a PatientProfile>> {
    let pharmacy_id = staff_pharmacy(db, principal)?;
    let mut patients: Vec<&PatientProfile> = db.patients.values()
        .filter(|p| is_patient_of(db, p, pharmacy_id))
        .collect();
    patients.sort_by(|a, b| (&a.last_name, &a.first_name).cmp(&(&b.last_name, &b.first_name)));
    Ok(patients)
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct PatientDetail<'a> {
    pub patient: &'a PatientProfile,
    pub email: Option<&'a str>,
    pub prescriptions: Vec<&'a Prescription>,
    pub reminders: Vec<&'a MedicationReminder>,
}

pub(crate) fn patient_profile<'a>(db: &'a Database, principal: &Principal, patient_id: u64) -> AppResult<PatientDetail<'a>> {
    let pharmacy_id = staff_pharmacy(db, principal)?;
    let patient = db.patient(patient_id)?;
    if !is_patient_of(db, patient, pharmacy_id) {
        return Err(AppError::Forbidden("not a patient of this pharmacy"));
    }
    let prescriptions = db.prescriptions.values()
        .filter(|rx| rx.patient_id == patient_id)
        .filter(|rx| db.drugs.get(rx.drug_id).map(|d| d.pharmacy_id == pharmacy_id).unwrap_or(false))
        .collect();
    let reminders = db.reminders.values()
        .filter(|r| r.patient_id == patient_id)
        .collect();
    Ok(PatientDetail {
        patient,
        email: db.accounts.get(patient.user_id).map(|a| a.email.as_str()),
        prescriptions,
        reminders,
    })
}
