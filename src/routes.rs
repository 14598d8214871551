//! JSON API under `/api/`.
//!
//! Paths have the shape `/api/<collection>[/<id>][/<action>]`; registration is
//! the only part reachable without a token.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use chrono::{Local, Utc};
use http::HeaderMap;
use http::header::AUTHORIZATION;
use hyper::{Body, Method, Request, Response, Uri};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::accounts::{self, Principal};
use crate::effects::Effects;
use crate::error::{AppError, AppResult};
use crate::messaging::{self, NewMessage};
use crate::model::{Attachment, Config, Role, StockStatus};
use crate::pharmacy;
use crate::prescriptions;
use crate::reminders;
use crate::state::AppState;
use crate::store::Database;
use crate::util::{parse_query, websocket_base};


static API_PATH_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(
    "^/api/(?P<collection>[a-z-]+)(?:/(?P<id>[0-9]+))?(?:/(?P<action>[a-z-]+))?/?$"
).expect("failed to compile regex"));


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct ApiPath<'a> {
    pub collection: &'a str,
    pub id: Option<u64>,
    pub action: Option<&'a str>,
}

pub(crate) fn parse_api_path(path: &str) -> Option<ApiPath<'_>> {
    let caps = API_PATH_REGEX.captures(path)?;
    let id = match caps.name("id") {
        Some(m) => Some(m.as_str().parse().ok()?),
        None => None,
    };
    Some(ApiPath {
        collection: caps.name("collection")?.as_str(),
        id,
        action: caps.name("action").map(|m| m.as_str()),
    })
}

/// Token from `?token=` or an `Authorization: Token ...` header.
pub(crate) fn request_token(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = parse_query(uri.query()).remove("token") {
        return Some(token);
    }
    headers
        .get(AUTHORIZATION)?
        .to_str().ok()?
        .strip_prefix("Token ")
        .map(|t| t.trim().to_owned())
}

pub(crate) async fn authenticate_request(state: &AppState, uri: &Uri, headers: &HeaderMap) -> Option<Principal> {
    let token = request_token(uri, headers)?;
    let db = state.db.read().await;
    accounts::authenticate(&db, &state.config.auth_tokens, &token)
}


#[derive(Debug)]
pub(crate) enum Failure {
    App(AppError),
    Method(&'static str),
    NoRoute,
}
impl From<AppError> for Failure {
    fn from(e: AppError) -> Failure { Failure::App(e) }
}

type Outcome = Result<Value, Failure>;

fn json_body<T: DeserializeOwned>(body: &[u8]) -> AppResult<T> {
    let body: &[u8] = if body.iter().all(|b| b.is_ascii_whitespace()) { b"{}" } else { body };
    serde_json::from_slice(body)
        .map_err(|e| AppError::bad_request(format!("invalid JSON body: {}", e)))
}

fn to_value<T: serde::Serialize>(value: T) -> Outcome {
    serde_json::to_value(value)
        .map_err(|e| Failure::App(AppError::Json(e)))
}

fn require_method(method: &Method, expected: Method, allowed: &'static str) -> Result<(), Failure> {
    if *method == expected {
        Ok(())
    } else {
        Err(Failure::Method(allowed))
    }
}


#[derive(Deserialize)]
struct PharmacyChoice { pharmacy_id: u64 }

#[derive(Deserialize)]
struct ThreadStart { user_id: u64 }

#[derive(Deserialize)]
struct MessageBody {
    content: String,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    prescription_id: Option<u64>,
    #[serde(default)]
    drug_id: Option<u64>,
}

#[derive(Deserialize)]
struct ContactAdminBody {
    #[serde(default)]
    note: Option<String>,
}

#[derive(Deserialize)]
struct ResupplyBody { amount: i64 }

#[derive(Deserialize)]
struct FulfillBody {
    #[serde(default = "FulfillBody::default_approve")]
    approve: bool,
}
impl FulfillBody {
    fn default_approve() -> bool { true }
}

#[derive(Deserialize)]
struct RestoreBody {
    #[serde(default)]
    days: Option<i64>,
}

#[derive(Deserialize)]
struct TimeBody { time: String }


fn me(db: &Database, principal: &Principal, config: &Config) -> AppResult<Value> {
    if principal.role == Role::System {
        return Ok(json!({ "role": Role::System }));
    }
    let account = db.account(principal.account_id)?;
    let (unread_count, unread_messages) = db.unread_counts(account.id);
    let pharmacy_id = db.pharmacy_of(account.id)
        .or_else(|| db.patient_by_user(account.id).and_then(|p| p.pharmacy_id));
    Ok(json!({
        "id": account.id,
        "username": account.username,
        "full_name": account.full_name(),
        "role": account.role,
        "pharmacy_id": pharmacy_id,
        "unread_count": unread_count,
        "unread_messages": unread_messages,
        "websocket_base": websocket_base(&config.base_url),
    }))
}

fn pharmacies(db: &Database) -> Value {
    let list: Vec<Value> = db.pharmacies.values()
        .map(|p| json!({
            "id": p.id,
            "pharmacy_name": p.pharmacy_name,
            "city": p.city,
            "state": p.state,
        }))
        .collect();
    Value::from(list)
}

fn stock_filter(query: &HashMap<String, String>) -> AppResult<Option<StockStatus>> {
    match query.get("status").map(|s| s.as_str()) {
        None | Some("") | Some("all") => Ok(None),
        Some(other) => serde_json::from_value(Value::from(other))
            .map(Some)
            .map_err(|_| AppError::bad_request(format!("unknown stock status {:?}", other))),
    }
}

/// Runs a mutation that yields only effects.
async fn effects_only<F>(state: &Arc<AppState>, op: F) -> Outcome
where
    F: FnOnce(&mut Database) -> AppResult<Effects>,
{
    state.mutate(|db| Ok(((), op(db)?))).await?;
    Ok(json!({ "ok": true }))
}

pub(crate) async fn dispatch(
    state: &Arc<AppState>,
    principal: Principal,
    method: &Method,
    path: ApiPath<'_>,
    query: &HashMap<String, String>,
    body: &[u8],
) -> Outcome {
    let threshold = state.config.low_stock_threshold;
    let user_id = principal.account_id;
    let p = &principal;

    if principal.role == Role::System && !matches!((path.collection, path.id, path.action), ("sweep", None, None) | ("me", None, None)) {
        return Err(AppError::Forbidden("system tokens can only trigger the sweep").into());
    }

    match (path.collection, path.id, path.action) {
        ("me", None, None) => {
            require_method(method, Method::GET, "GET")?;
            let db = state.db.read().await;
            Ok(me(&db, p, &state.config)?)
        },
        ("pharmacies", None, None) => {
            require_method(method, Method::GET, "GET")?;
            Ok(pharmacies(&*state.db.read().await))
        },
        ("my-pharmacy", None, None) => {
            require_method(method, Method::POST, "POST")?;
            let choice: PharmacyChoice = json_body(body)?;
            state.mutate(|db| Ok((accounts::choose_pharmacy(db, p, choice.pharmacy_id)?, Effects::default()))).await?;
            Ok(json!({ "pharmacy_id": choice.pharmacy_id }))
        },
        ("join-code", None, None) => {
            require_method(method, Method::POST, "POST")?;
            let code = state.mutate(|db| Ok((pharmacy::regenerate_join_code(db, p)?, Effects::default()))).await?;
            Ok(json!({ "join_code": code }))
        },

        ("notifications", None, None) => {
            require_method(method, Method::GET, "GET")?;
            Ok(accounts::list_notifications(&*state.db.read().await, user_id))
        },
        ("notifications", None, Some("read-all")) => {
            require_method(method, Method::POST, "POST")?;
            effects_only(state, |db| Ok(accounts::mark_all_notifications_read(db, user_id))).await
        },
        ("notifications", Some(id), Some("read")) => {
            require_method(method, Method::POST, "POST")?;
            effects_only(state, |db| accounts::mark_notification_read(db, user_id, id)).await
        },

        ("threads", None, None) => match *method {
            Method::GET => to_value(messaging::list_threads(&*state.db.read().await, user_id)),
            Method::POST => {
                let start: ThreadStart = json_body(body)?;
                let thread_id = state.mutate(|db| Ok((messaging::start_thread(db, user_id, start.user_id, Utc::now())?, Effects::default()))).await?;
                Ok(json!({ "thread_id": thread_id, "link": messaging::thread_link(thread_id) }))
            },
            _ => Err(Failure::Method("GET, POST")),
        },
        ("threads", Some(thread_id), None) | ("threads", Some(thread_id), Some("messages")) => match *method {
            Method::GET => to_value(messaging::thread_messages(&*state.db.read().await, user_id, thread_id)?),
            Method::POST => {
                let msg: MessageBody = json_body(body)?;
                let new = NewMessage {
                    content: msg.content,
                    link: msg.link,
                    attachment: Attachment { prescription_id: msg.prescription_id, drug_id: msg.drug_id },
                    ..Default::default()
                };
                let message_id = state.mutate(|db| messaging::post_message(db, &state.hub, user_id, thread_id, new, Utc::now())).await?;
                Ok(json!({ "message_id": message_id }))
            },
            _ => Err(Failure::Method("GET, POST")),
        },
        ("threads", Some(thread_id), Some("read")) => {
            require_method(method, Method::POST, "POST")?;
            effects_only(state, |db| messaging::mark_thread_read(db, user_id, thread_id)).await
        },

        ("drugs", None, None) => match *method {
            Method::GET => {
                let db = state.db.read().await;
                let pharmacy_id = pharmacy::staff_pharmacy(&db, p)?;
                let drugs = match query.get("q") {
                    Some(q) => pharmacy::medicine_search(&db, pharmacy_id, q),
                    None => pharmacy::inventory(&db, pharmacy_id, stock_filter(query)?),
                };
                to_value(drugs)
            },
            Method::POST => {
                let new: pharmacy::NewDrug = json_body(body)?;
                let drug_id = state.mutate(|db| Ok((pharmacy::add_drug(db, p, new, threshold)?, Effects::default()))).await?;
                Ok(json!({ "drug_id": drug_id }))
            },
            _ => Err(Failure::Method("GET, POST")),
        },
        ("drugs", Some(drug_id), None) => {
            require_method(method, Method::GET, "GET")?;
            let db = state.db.read().await;
            to_value(pharmacy::drug_detail(&db, p, drug_id)?)
        },
        ("drugs", Some(drug_id), Some("contact-admin")) => {
            require_method(method, Method::POST, "POST")?;
            let contact: ContactAdminBody = json_body(body)?;
            effects_only(state, |db| pharmacy::contact_admin(db, &state.hub, p, drug_id, contact.note, Utc::now())).await
        },
        ("drugs", Some(drug_id), Some("resupply")) => {
            require_method(method, Method::POST, "POST")?;
            let resupply: ResupplyBody = json_body(body)?;
            effects_only(state, |db| pharmacy::resupply(db, p, drug_id, resupply.amount, threshold, Utc::now())).await
        },

        ("patients", None, None) => {
            require_method(method, Method::GET, "GET")?;
            let db = state.db.read().await;
            match query.get("q") {
                Some(q) => to_value(pharmacy::patient_search(&db, p, q)?),
                None => to_value(pharmacy::my_patients(&db, p)?),
            }
        },
        ("patients", Some(patient_id), None) => {
            require_method(method, Method::GET, "GET")?;
            let db = state.db.read().await;
            to_value(pharmacy::patient_profile(&db, p, patient_id)?)
        },

        ("prescriptions", None, None) => match *method {
            Method::GET => to_value(prescriptions::list_prescriptions(&*state.db.read().await, p)?),
            Method::POST => {
                let new: prescriptions::NewPrescription = json_body(body)?;
                let prescription_id = state.mutate(|db| prescriptions::create_prescription(db, p, new, threshold, Utc::now())).await?;
                Ok(json!({ "prescription_id": prescription_id }))
            },
            _ => Err(Failure::Method("GET, POST")),
        },
        ("prescriptions", Some(rx), Some("refill")) => {
            require_method(method, Method::POST, "POST")?;
            effects_only(state, |db| prescriptions::request_refill(db, &state.hub, p, rx, Utc::now())).await
        },
        ("prescriptions", Some(rx), Some("fulfill")) => {
            require_method(method, Method::POST, "POST")?;
            let fulfill: FulfillBody = json_body(body)?;
            effects_only(state, |db| prescriptions::fulfill_refill(db, p, rx, fulfill.approve, threshold, Utc::now())).await
        },

        ("reminders", None, None) => match *method {
            Method::GET => {
                let db = state.db.read().await;
                to_value(reminders::list_reminders(&db, p, Local::now().date_naive())?)
            },
            Method::POST => {
                let new: reminders::NewReminder = json_body(body)?;
                let reminder_id = state.mutate(|db| reminders::create_reminder(db, p, new, Local::now())).await?;
                Ok(json!({ "reminder_id": reminder_id }))
            },
            _ => Err(Failure::Method("GET, POST")),
        },
        ("reminders", Some(id), None) => {
            require_method(method, Method::DELETE, "DELETE")?;
            effects_only(state, |db| reminders::delete_reminder(db, p, id)).await
        },
        ("reminders", Some(id), Some("toggle")) => {
            require_method(method, Method::POST, "POST")?;
            effects_only(state, |db| reminders::toggle_reminder(db, p, id, Local::now())).await
        },
        ("reminders", Some(id), Some("restore")) => {
            require_method(method, Method::POST, "POST")?;
            let restore: RestoreBody = json_body(body)?;
            effects_only(state, |db| reminders::restore_reminder(db, p, id, restore.days, Local::now())).await
        },
        ("reminders", Some(id), Some("times")) => {
            require_method(method, Method::POST, "POST")?;
            let time: TimeBody = json_body(body)?;
            let time_id = state.mutate(|db| reminders::add_time(db, p, id, &time.time, Local::now())).await?;
            Ok(json!({ "time_id": time_id }))
        },
        ("reminder-times", Some(id), None) => {
            require_method(method, Method::PUT, "PUT")?;
            let time: TimeBody = json_body(body)?;
            effects_only(state, |db| reminders::edit_time(db, p, id, &time.time, Local::now())).await
        },
        ("reminder-times", Some(id), Some("toggle")) => {
            require_method(method, Method::POST, "POST")?;
            effects_only(state, |db| reminders::toggle_time(db, p, id, Local::now())).await
        },

        ("sweep", None, None) => {
            require_method(method, Method::POST, "POST")?;
            p.require(Role::System)?;
            state.sweep().await;
            Ok(json!({ "ok": true }))
        },

        _ => Err(Failure::NoRoute),
    }
}

async fn register(state: &Arc<AppState>, kind: Option<&str>, body: &[u8]) -> Outcome {
    let now = Utc::now();
    let registered = match kind {
        Some("patient") => {
            let reg: accounts::PatientRegistration = json_body(body)?;
            state.mutate(|db| Ok((accounts::register_patient(db, reg, now)?, Effects::default()))).await?
        },
        Some("pharmacy") => {
            let reg: accounts::PharmacyRegistration = json_body(body)?;
            state.mutate(|db| Ok((accounts::register_pharmacy(db, reg, now)?, Effects::default()))).await?
        },
        Some("pharmacist") => {
            let reg: accounts::PharmacistRegistration = json_body(body)?;
            state.mutate(|db| Ok((accounts::register_pharmacist(db, reg, now)?, Effects::default()))).await?
        },
        _ => return Err(Failure::NoRoute),
    };
    to_value(registered)
}

fn respond_failure(failure: Failure) -> Result<Response<Body>, Infallible> {
    match failure {
        Failure::NoRoute => crate::respond_404(),
        Failure::Method(allowed) => crate::respond_405(allowed),
        Failure::App(e) => crate::respond_error(&e),
    }
}

pub(crate) async fn handle_api(state: Arc<AppState>, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let (head, body) = request.into_parts();
    let api_path = match parse_api_path(head.uri.path()) {
        Some(p) => p,
        None => return crate::respond_404(),
    };

    let body_bytes = match hyper::body::to_bytes(body).await {
        Ok(bb) => bb,
        Err(e) => {
            error!("failed to read request body: {}", e);
            return crate::respond_500();
        },
    };

    // unauthenticated endpoints first
    if api_path.collection == "register" {
        if head.method != Method::POST {
            return crate::respond_405("POST");
        }
        return match register(&state, api_path.action, &body_bytes).await {
            Ok(value) => crate::respond_json(201, &value),
            Err(f) => respond_failure(f),
        };
    }

    let principal = match authenticate_request(&state, &head.uri, &head.headers).await {
        Some(p) => p,
        None => return crate::respond_403(),
    };

    let query = parse_query(head.uri.query());
    debug!(method = %head.method, path = head.uri.path(), user_id = principal.account_id, "api request");
    match dispatch(&state, principal, &head.method, api_path, &query, &body_bytes).await {
        Ok(value) => crate::respond_json(200, &value),
        Err(f) => respond_failure(f),
    }
}
