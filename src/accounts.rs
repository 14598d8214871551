use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::effects::Effects;
use crate::error::{AppError, AppResult};
use crate::model::{Account, Gender, PatientProfile, PharmacistProfile, PharmacyProfile, Role};
use crate::notify;
use crate::store::Database;
use crate::util::{generate_token, unique_join_code};


/// The authenticated caller of a request or socket.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Principal {
    pub account_id: u64,
    pub role: Role,
}
impl Principal {
    pub fn system() -> Principal {
        Principal { account_id: 0, role: Role::System }
    }

    pub fn require(&self, role: Role) -> AppResult<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(AppError::Forbidden("wrong role for this action"))
        }
    }

    pub fn require_staff(&self) -> AppResult<()> {
        if self.role.is_pharmacy_staff() {
            Ok(())
        } else {
            Err(AppError::Forbidden("pharmacy staff only"))
        }
    }
}

/// Resolves a token to a principal; `system_tokens` map to the system role.
pub(crate) fn authenticate(db: &Database, system_tokens: &[String], token: &str) -> Option<Principal> {
    if token.is_empty() {
        return None;
    }
    if system_tokens.iter().any(|t| t == token) {
        return Some(Principal::system());
    }
    db.account_by_token(token)
        .map(|a| Principal { account_id: a.id, role: a.role })
}


#[derive(Clone, Debug, Deserialize)]
pub(crate) struct AccountFields {
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct PatientRegistration {
    #[serde(flatten)]
    pub account: AccountFields,
    pub date_of_birth: NaiveDate,
    pub gender: Gender,
    pub phone_number: String,
    #[serde(default)]
    pub pharmacy_id: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct PharmacyRegistration {
    #[serde(flatten)]
    pub account: AccountFields,
    pub pharmacy_name: String,
    #[serde(default)]
    pub street_address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip_code: String,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct PharmacistRegistration {
    #[serde(flatten)]
    pub account: AccountFields,
    pub join_code: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct Registered {
    pub account_id: u64,
    pub profile_id: u64,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_code: Option<String>,
}


fn create_account(db: &mut Database, fields: &AccountFields, role: Role, now: DateTime<Utc>) -> AppResult<Account> {
    let username = fields.username.trim();
    let email = fields.email.trim();
    if username.is_empty() {
        return Err(AppError::bad_request("username must not be empty"));
    }
    if !email.contains('@') {
        return Err(AppError::bad_request("email address is invalid"));
    }
    if db.username_taken(username) {
        return Err(AppError::conflict(format!("username {:?} is taken", username)));
    }
    if db.email_taken(email) {
        return Err(AppError::conflict(format!("email {:?} is already registered", email)));
    }

    let token = generate_token();
    let id = db.accounts.insert_with(|id| Account::new(
        id,
        username.to_owned(),
        email.to_owned(),
        fields.first_name.trim().to_owned(),
        fields.last_name.trim().to_owned(),
        role,
        token,
        now,
    ));
    db.account(id).cloned()
}

pub(crate) fn register_patient(db: &mut Database, reg: PatientRegistration, now: DateTime<Utc>) -> AppResult<Registered> {
    if let Some(pharmacy_id) = reg.pharmacy_id {
        db.pharmacy(pharmacy_id)?;
    }
    let account = create_account(db, &reg.account, Role::Patient, now)?;
    let profile_id = db.patients.insert_with(|id| PatientProfile::new(
        id,
        account.id,
        account.first_name.clone(),
        account.last_name.clone(),
        reg.date_of_birth,
        reg.gender,
        reg.phone_number.trim().to_owned(),
        reg.pharmacy_id,
    ));
    info!(account_id = account.id, "registered patient");
    Ok(Registered { account_id: account.id, profile_id, token: account.token, join_code: None })
}

pub(crate) fn register_pharmacy(db: &mut Database, reg: PharmacyRegistration, now: DateTime<Utc>) -> AppResult<Registered> {
    if reg.pharmacy_name.trim().is_empty() {
        return Err(AppError::bad_request("pharmacy name must not be empty"));
    }
    let account = create_account(db, &reg.account, Role::PharmacyAdmin, now)?;
    let join_code = unique_join_code(|c| db.pharmacy_by_join_code(c).is_some());
    let profile_id = db.pharmacies.insert_with(|id| PharmacyProfile::new(
        id,
        account.id,
        reg.pharmacy_name.trim().to_owned(),
        reg.street_address,
        reg.city,
        reg.state,
        reg.zip_code,
        join_code.clone(),
    ));
    info!(account_id = account.id, pharmacy_id = profile_id, "registered pharmacy");
    Ok(Registered { account_id: account.id, profile_id, token: account.token, join_code: Some(join_code) })
}

pub(crate) fn register_pharmacist(db: &mut Database, reg: PharmacistRegistration, now: DateTime<Utc>) -> AppResult<Registered> {
    let pharmacy_id = db.pharmacy_by_join_code(reg.join_code.trim())
        .map(|p| p.id)
        .ok_or_else(|| AppError::bad_request("unknown join code"))?;
    let account = create_account(db, &reg.account, Role::Pharmacist, now)?;
    let profile_id = db.pharmacists.insert_with(|id| PharmacistProfile::new(
        id,
        account.id,
        pharmacy_id,
        account.first_name.clone(),
        account.last_name.clone(),
    ));
    info!(account_id = account.id, pharmacy_id, "registered pharmacist");
    Ok(Registered { account_id: account.id, profile_id, token: account.token, join_code: None })
}

/// Sets the patient's pharmacy ("my pharmacy").
pub(crate) fn choose_pharmacy(db: &mut Database, principal: &Principal, pharmacy_id: u64) -> AppResult<()> {
    principal.require(Role::Patient)?;
    db.pharmacy(pharmacy_id)?;
    let patient_id = db.patient_by_user(principal.account_id)
        .map(|p| p.id)
        .ok_or(AppError::NotFound("patient profile"))?;
    if let Some(patient) = db.patients.get_mut(patient_id) {
        patient.pharmacy_id = Some(pharmacy_id);
    }
    Ok(())
}


/// The caller's feed, newest first, with the unread counters.
pub(crate) fn list_notifications(db: &Database, user_id: u64) -> Value {
    let mut feed: Vec<_> = db.notifications.values()
        .filter(|n| n.user_id == user_id)
        .collect();
    feed.sort_by(|a, b| b.time.cmp(&a.time).then(b.id.cmp(&a.id)));
    let (unread_count, unread_messages) = db.unread_counts(user_id);
    json!({
        "notifications": feed,
        "unread_count": unread_count,
        "unread_messages": unread_messages,
    })
}

pub(crate) fn mark_notification_read(db: &mut Database, user_id: u64, notification_id: u64) -> AppResult<Effects> {
    if !notify::mark_notification_read(db, user_id, notification_id) {
        return Err(AppError::NotFound("notification"));
    }
    let mut effects = Effects::default();
    notify::counts_update(db, user_id, &mut effects);
    Ok(effects)
}

pub(crate) fn mark_all_notifications_read(db: &mut Database, user_id: u64) -> Effects {
    notify::mark_all_read(db, user_id);
    let mut effects = Effects::default();
    notify::counts_update(db, user_id, &mut effects);
    effects
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::Group;
    use crate::notify::NotificationTarget;

    fn fields(username: &str) -> AccountFields {
        AccountFields {
            username: username.to_owned(),
            email: format!("{}@example.com", username),
            first_name: "Ada".to_owned(),
            last_name: "Lovelace".to_owned(),
        }
    }

    #[test]
    fn pharmacy_then_pharmacist_by_join_code() {
        let mut db = Database::default();
        let now = Utc::now();
        let pharmacy = register_pharmacy(&mut db, PharmacyRegistration {
            account: fields("owner"),
            pharmacy_name: "Main Street Pharmacy".to_owned(),
            street_address: String::new(),
            city: String::new(),
            state: String::new(),
            zip_code: String::new(),
        }, now).unwrap();
        let code = pharmacy.join_code.clone().unwrap();

        let pharmacist = register_pharmacist(&mut db, PharmacistRegistration {
            account: fields("helper"),
            join_code: code.to_lowercase(),
        }, now).unwrap();

        assert_eq!(db.pharmacy_of(pharmacist.account_id), Some(pharmacy.profile_id));
        assert_eq!(db.pharmacy_staff(pharmacy.profile_id), vec![pharmacy.account_id, pharmacist.account_id]);

        let principal = authenticate(&db, &[], &pharmacist.token).unwrap();
        assert_eq!(principal.role, Role::Pharmacist);
    }

    #[test]
    fn bad_join_code_and_duplicates_are_rejected() {
        let mut db = Database::default();
        let now = Utc::now();
        let err = register_pharmacist(&mut db, PharmacistRegistration {
            account: fields("helper"),
            join_code: "NOPE00".to_owned(),
        }, now).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(db.accounts.len(), 0);

        let reg = PatientRegistration {
            account: fields("pat"),
            date_of_birth: NaiveDate::from_ymd_opt(1990, 1, 1).unwrap(),
            gender: Gender::Male,
            phone_number: "555".to_owned(),
            pharmacy_id: None,
        };
        register_patient(&mut db, reg.clone(), now).unwrap();
        let err = register_patient(&mut db, reg, now).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn system_tokens_authenticate_as_system() {
        let db = Database::default();
        let tokens = vec!["ops-secret".to_owned()];
        assert_eq!(authenticate(&db, &tokens, "ops-secret"), Some(Principal::system()));
        assert_eq!(authenticate(&db, &tokens, ""), None);
        assert_eq!(authenticate(&db, &tokens, "other"), None);
    }

    #[test]
    fn feed_is_newest_first_and_mark_all_pushes_counts() {
        let mut fx = crate::testutil::Fixture::new();
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let later = Utc::now();
        let old = notify::create_notification(&mut fx.db, fx.patient_user, NotificationTarget::default(), earlier);
        let new = notify::create_notification(&mut fx.db, fx.patient_user, NotificationTarget::default(), later);

        let feed = list_notifications(&fx.db, fx.patient_user);
        assert_eq!(feed["notifications"][0]["id"], new);
        assert_eq!(feed["notifications"][1]["id"], old);
        assert_eq!(feed["unread_count"], 2);

        let effects = mark_all_notifications_read(&mut fx.db, fx.patient_user);
        let push = effects.broadcasts_to(Group::User(fx.patient_user)).next().unwrap();
        assert_eq!(push.payload["notification"]["unread_count"], 0);
    }

    #[test]
    fn patient_chooses_pharmacy() {
        let mut fx = crate::testutil::Fixture::new();
        let principal = Principal { account_id: fx.patient_user, role: Role::Patient };
        assert!(choose_pharmacy(&mut fx.db, &principal, 999).is_err());
        choose_pharmacy(&mut fx.db, &principal, fx.pharmacy).unwrap();
        assert_eq!(fx.db.patient(fx.patient).unwrap().pharmacy_id, Some(fx.pharmacy));
    }
}
