use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::accounts::Principal;
use crate::effects::Effects;
use crate::error::{AppError, AppResult};
use crate::hub::Presence;
use crate::messaging::{self, NewMessage};
use crate::model::{Attachment, Prescription, Role};
use crate::notify::{self, NotificationTarget};
use crate::pharmacy::{own_drug, set_stock, staff_pharmacy};
use crate::store::Database;


pub(crate) fn prescription_link(prescription_id: u64) -> String {
    format!("/prescriptions#rx-{}", prescription_id)
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct NewPrescription {
    pub patient_id: u64,
    pub drug_id: u64,
    pub quantity: i64,
    pub expiration_date: NaiveDate,
    #[serde(default = "NewPrescription::default_refills")]
    pub refills: u32,
}
impl NewPrescription {
    fn default_refills() -> u32 { 3 }
}

pub(crate) fn create_prescription(
    db: &mut Database,
    principal: &Principal,
    new: NewPrescription,
    low_stock_threshold: i64,
    now: DateTime<Utc>,
) -> AppResult<(u64, Effects)> {
    principal.require(Role::Pharmacist)?;
    let pharmacist_id = db.pharmacist_by_user(principal.account_id)
        .map(|p| p.id)
        .ok_or(AppError::NotFound("pharmacist profile"))?;
    let (pharmacy_id, stock, drug_name) = {
        let drug = own_drug(db, principal, new.drug_id)?;
        (drug.pharmacy_id, drug.stock, drug.display_name().to_owned())
    };
    let patient_user = db.patient(new.patient_id)?.user_id;

    if new.quantity <= 0 {
        return Err(AppError::bad_request("quantity must be positive"));
    }
    if new.quantity > stock {
        return Err(AppError::conflict(format!("only {} of {} in stock", stock, drug_name)));
    }
    if new.expiration_date < now.with_timezone(&Local).date_naive() {
        return Err(AppError::bad_request("expiration date is in the past"));
    }

    let prescription_id = db.prescriptions.insert_with(|id| Prescription::new(
        id,
        new.patient_id,
        new.drug_id,
        new.quantity,
        pharmacist_id,
        now,
        new.expiration_date,
        new.refills,
        false,
        None,
    ));
    if let Some(patient) = db.patients.get_mut(new.patient_id) {
        if patient.pharmacy_id.is_none() {
            patient.pharmacy_id = Some(pharmacy_id);
        }
    }

    let mut effects = Effects::default();
    set_stock(db, new.drug_id, stock - new.quantity, low_stock_threshold, now, &mut effects)?;

    let content = format!("New prescription for {}", drug_name);
    let target = NotificationTarget {
        prescription_id: Some(prescription_id),
        content: Some(content.clone()),
        link: Some(prescription_link(prescription_id)),
        ..Default::default()
    };
    let data = notify::payload(json!({
        "type": "create_prescription",
        "prescription_id": prescription_id,
        "medicine": drug_name,
        "content": content,
    }));
    notify::notify_user(db, patient_user, target, data, now, &mut effects);
    info!(prescription_id, drug_id = new.drug_id, quantity = new.quantity, "prescription created");
    Ok((prescription_id, effects))
}

/// The patient asks the prescriber for a refill; the request travels as a message.
pub(crate) fn request_refill(
    db: &mut Database,
    presence: &dyn Presence,
    principal: &Principal,
    prescription_id: u64,
    now: DateTime<Utc>,
) -> AppResult<Effects> {
    principal.require(Role::Patient)?;
    let patient_id = db.patient_by_user(principal.account_id)
        .map(|p| p.id)
        .ok_or(AppError::NotFound("patient profile"))?;
    let prescription = db.prescription(prescription_id)?.clone();
    if prescription.patient_id != patient_id {
        return Err(AppError::Forbidden("not your prescription"));
    }
    if prescription.refill_pending {
        return Err(AppError::conflict("a refill is already pending"));
    }
    if prescription.refills_left == 0 {
        return Err(AppError::conflict("no refills left on this prescription"));
    }
    if prescription.is_expired(now.with_timezone(&Local).date_naive()) {
        return Err(AppError::conflict("prescription has expired"));
    }
    let prescriber_user = db.pharmacists.get(prescription.prescribed_by)
        .map(|p| p.user_id)
        .ok_or(AppError::NotFound("prescribing pharmacist"))?;
    let drug_name = db.drug(prescription.drug_id)?.display_name().to_owned();

    db.prescription_mut(prescription_id)?.refill_pending = true;

    let thread_id = messaging::find_or_create_thread(db, principal.account_id, prescriber_user, now);
    let request = NewMessage {
        content: format!("Hi, I need a refill for my {} prescription.", drug_name),
        link: Some(prescription_link(prescription_id)),
        attachment: Attachment { prescription_id: Some(prescription_id), drug_id: None },
        refill_fulfilled: None,
        resupply_fulfilled: None,
    };
    let (_, effects) = messaging::post_message(db, presence, principal.account_id, thread_id, request, now)?;
    info!(prescription_id, "refill requested");
    Ok(effects)
}

/// Staff approve or deny a pending refill.
pub(crate) fn fulfill_refill(
    db: &mut Database,
    principal: &Principal,
    prescription_id: u64,
    approve: bool,
    low_stock_threshold: i64,
    now: DateTime<Utc>,
) -> AppResult<Effects> {
    staff_pharmacy(db, principal)?;
    let prescription = db.prescription(prescription_id)?.clone();
    let (stock, drug_name) = {
        let drug = own_drug(db, principal, prescription.drug_id)?;
        (drug.stock, drug.display_name().to_owned())
    };
    if !prescription.refill_pending {
        return Err(AppError::conflict("no refill is pending"));
    }
    let patient_user = db.patient(prescription.patient_id)?.user_id;

    let mut effects = Effects::default();
    if approve {
        if prescription.quantity > stock {
            return Err(AppError::conflict(format!("only {} of {} in stock", stock, drug_name)));
        }
        {
            let rx = db.prescription_mut(prescription_id)?;
            rx.refills_left = rx.refills_left.saturating_sub(1);
            rx.refilled_on = Some(now);
        }
        set_stock(db, prescription.drug_id, stock - prescription.quantity, low_stock_threshold, now, &mut effects)?;
    }
    db.prescription_mut(prescription_id)?.refill_pending = false;

    for message in db.messages.values_mut() {
        if message.prescription_id == Some(prescription_id)
            && message.refill_fulfilled.is_none()
            && message.sender_id == patient_user
        {
            message.refill_fulfilled = Some(approve);
        }
    }

    let content = if approve {
        format!("Your refill of {} is ready", drug_name)
    } else {
        format!("Your refill request for {} was declined", drug_name)
    };
    let target = NotificationTarget {
        prescription_id: Some(prescription_id),
        content: Some(content.clone()),
        link: Some(prescription_link(prescription_id)),
        ..Default::default()
    };
    let data = notify::payload(json!({
        "type": "refill",
        "prescription_id": prescription_id,
        "approved": approve,
        "medicine": drug_name,
        "content": content,
    }));
    notify::notify_user(db, patient_user, target, data, now, &mut effects);
    info!(prescription_id, approve, "refill handled");
    Ok(effects)
}


#[derive(Clone, Debug, Serialize)]
pub(crate) struct PrescriptionView {
    pub id: u64,
    pub patient_id: u64,
    pub patient: String,
    pub drug_id: u64,
    pub medicine: String,
    pub quantity: i64,
    pub prescribed_by: String,
    pub prescribed_on: DateTime<Utc>,
    pub expiration_date: NaiveDate,
    pub refills_left: u32,
    pub refill_pending: bool,
    pub refilled_on: Option<DateTime<Utc>>,
}

fn view(db: &Database, rx: &Prescription) -> PrescriptionView {
    PrescriptionView {
        id: rx.id,
        patient_id: rx.patient_id,
        patient: db.patients.get(rx.patient_id).map(|p| p.full_name()).unwrap_or_default(),
        drug_id: rx.drug_id,
        medicine: db.drugs.get(rx.drug_id).map(|d| d.display_name().to_owned()).unwrap_or_default(),
        quantity: rx.quantity,
        prescribed_by: db.pharmacists.get(rx.prescribed_by)
            .map(|p| format!("{} {}", p.first_name, p.last_name))
            .unwrap_or_default(),
        prescribed_on: rx.prescribed_on,
        expiration_date: rx.expiration_date,
        refills_left: rx.refills_left,
        refill_pending: rx.refill_pending,
        refilled_on: rx.refilled_on,
    }
}

/// Patients see their own prescriptions; staff see those for their pharmacy's drugs.
pub(crate) fn list_prescriptions(db: &Database, principal: &Principal) -> AppResult<Vec<PrescriptionView>> {
    let mut rows: Vec<&Prescription> = match principal.role {
        Role::Patient => {
            let patient_id = db.patient_by_user(principal.account_id)
                .map(|p| p.id)
                .ok_or(AppError::NotFound("patient profile"))?;
            db.prescriptions.values().filter(|rx| rx.patient_id == patient_id).collect()
        },
        Role::PharmacyAdmin | Role::Pharmacist => {
            let pharmacy_id = staff_pharmacy(db, principal)?;
            db.prescriptions.values()
                .filter(|rx| db.drugs.get(rx.drug_id).map(|d| d.pharmacy_id == pharmacy_id).unwrap_or(false))
                .collect()
        },
        Role::System => db.prescriptions.values().collect(),
    };
    rows.sort_by(|a, b| b.prescribed_on.cmp(&a.prescribed_on).then(b.id.cmp(&a.id)));
    Ok(rows.into_iter().map(|rx| view(db, rx)).collect())
}
