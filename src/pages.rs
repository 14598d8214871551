//! Server-rendered HTML pages. The token travels in the query string and is
//! carried along in every link.

use std::convert::Infallible;
use std::sync::Arc;

use askama::Template;
use chrono::{DateTime, Local, Utc};
use hyper::{Body, Method, Request, Response};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::error;

use crate::accounts::Principal;
use crate::error::{AppError, AppResult};
use crate::filters;
use crate::messaging::{self, MessageView, ThreadSummary};
use crate::model::{Drug, Role, StockStatus};
use crate::pharmacy;
use crate::prescriptions::{self, PrescriptionView};
use crate::reminders::{self, ReminderView};
use crate::routes::{authenticate_request, request_token};
use crate::state::AppState;
use crate::store::Database;
use crate::util::{parse_query, websocket_base};


const FEED_LENGTH: usize = 20;

static THREAD_PAGE_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(
    "^/threads/(?P<thread>[0-9]+)/?$"
).expect("failed to compile regex"));


struct FeedItem {
    content: String,
    href: String,
    time: DateTime<Utc>,
    is_read: bool,
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    token: String,
    notifications_ws: String,
    full_name: String,
    role: &'static str,
    is_staff: bool,
    unread_count: usize,
    unread_messages: usize,
    feed: Vec<FeedItem>,
    threads: Vec<ThreadSummary>,
}

#[derive(Template)]
#[template(path = "inventory.html")]
struct InventoryTemplate {
    token: String,
    notifications_ws: String,
    filter: String,
    drugs: Vec<Drug>,
    low_stock: usize,
    out_of_stock: usize,
}

#[derive(Template)]
#[template(path = "prescriptions.html")]
struct PrescriptionsTemplate {
    token: String,
    notifications_ws: String,
    is_staff: bool,
    prescriptions: Vec<PrescriptionView>,
}

#[derive(Template)]
#[template(path = "reminders.html")]
struct RemindersTemplate {
    token: String,
    notifications_ws: String,
    active: Vec<ReminderView>,
    archived: Vec<ReminderView>,
}

#[derive(Template)]
#[template(path = "thread.html")]
struct ThreadTemplate {
    token: String,
    notifications_ws: String,
    thread_id: u64,
    chat_ws: String,
    partner: String,
    messages: Vec<MessageView>,
}


fn dashboard(db: &Database, principal: &Principal, token: String, ws_base: &str) -> AppResult<String> {
    let account = db.account(principal.account_id)?;
    let (unread_count, unread_messages) = db.unread_counts(account.id);
    let mut notifications: Vec<_> = db.notifications.values()
        .filter(|n| n.user_id == account.id)
        .collect();
    notifications.sort_by(|a, b| b.time.cmp(&a.time).then(b.id.cmp(&a.id)));
    let feed = notifications.into_iter()
        .take(FEED_LENGTH)
        .map(|n| FeedItem {
            content: n.content.clone().unwrap_or_default(),
            href: with_token(n.link.as_deref().unwrap_or("/"), &token),
            time: n.time,
            is_read: n.is_read,
        })
        .collect();

    render(DashboardTemplate {
        notifications_ws: socket_url(ws_base, "/ws/notifications/", &token),
        token,
        full_name: account.full_name(),
        role: account.role.as_str(),
        is_staff: account.role.is_pharmacy_staff(),
        unread_count,
        unread_messages,
        feed,
        threads: messaging::list_threads(db, account.id),
    })
}

fn inventory(db: &Database, principal: &Principal, filter: Option<&str>, token: String, ws_base: &str) -> AppResult<String> {
    let pharmacy_id = pharmacy::staff_pharmacy(db, principal)?;
    let status = match filter {
        Some("low_stock") => Some(StockStatus::LowStock),
        Some("out_of_stock") => Some(StockStatus::OutOfStock),
        Some("in_stock") => Some(StockStatus::InStock),
        _ => None,
    };
    let all = pharmacy::inventory(db, pharmacy_id, None);
    let low_stock = all.iter().filter(|d| d.status == StockStatus::LowStock).count();
    let out_of_stock = all.iter().filter(|d| d.status == StockStatus::OutOfStock).count();

    render(InventoryTemplate {
        notifications_ws: socket_url(ws_base, "/ws/notifications/", &token),
        token,
        filter: filter.unwrap_or("all").to_owned(),
        drugs: pharmacy::inventory(db, pharmacy_id, status).into_iter().cloned().collect(),
        low_stock,
        out_of_stock,
    })
}

fn prescriptions_page(db: &Database, principal: &Principal, token: String, ws_base: &str) -> AppResult<String> {
    render(PrescriptionsTemplate {
        notifications_ws: socket_url(ws_base, "/ws/notifications/", &token),
        token,
        is_staff: principal.role.is_pharmacy_staff(),
        prescriptions: prescriptions::list_prescriptions(db, principal)?,
    })
}

fn reminders_page(db: &Database, principal: &Principal, token: String, ws_base: &str) -> AppResult<String> {
    let (archived, active): (Vec<ReminderView>, Vec<ReminderView>) = reminders::list_reminders(db, principal, Local::now().date_naive())?
        .into_iter()
        .partition(|r| r.is_archived);
    render(RemindersTemplate {
        notifications_ws: socket_url(ws_base, "/ws/notifications/", &token),
        token,
        active,
        archived,
    })
}

fn thread_page(db: &Database, principal: &Principal, thread_id: u64, token: String, ws_base: &str) -> AppResult<String> {
    let messages = messaging::thread_messages(db, principal.account_id, thread_id)?;
    let partner = db.thread(thread_id)?
        .participants.iter()
        .filter(|p| **p != principal.account_id)
        .filter_map(|p| db.accounts.get(*p))
        .map(|a| a.full_name())
        .collect::<Vec<_>>()
        .join(", ");
    render(ThreadTemplate {
        notifications_ws: socket_url(ws_base, "/ws/notifications/", &token),
        chat_ws: socket_url(ws_base, &format!("/ws/messages/{}/", thread_id), &token),
        token,
        thread_id,
        partner,
        messages,
    })
}

/// Adds the token to a page link, ahead of any `#fragment`.
fn with_token(link: &str, token: &str) -> String {
    let (path, fragment) = match link.find('#') {
        Some(i) => link.split_at(i),
        None => (link, ""),
    };
    let separator = if path.contains('?') { '&' } else { '?' };
    let token: String = form_urlencoded::byte_serialize(token.as_bytes()).collect();
    format!("{}{}token={}{}", path, separator, token, fragment)
}

fn socket_url(ws_base: &str, path: &str, token: &str) -> String {
    let token: String = form_urlencoded::byte_serialize(token.as_bytes()).collect();
    format!("{}{}?token={}", ws_base, path, token)
}

fn render<T: Template>(template: T) -> AppResult<String> {
    template.render()
        .map_err(|e| AppError::Internal(format!("error rendering template: {}", e)))
}


pub(crate) async fn handle_page(state: Arc<AppState>, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    if request.method() != Method::GET {
        return crate::respond_405("GET");
    }
    let principal = match authenticate_request(&state, request.uri(), request.headers()).await {
        Some(p) if p.role != Role::System => p,
        _ => return crate::respond_403(),
    };
    let token = request_token(request.uri(), request.headers()).unwrap_or_default();
    let ws_base = websocket_base(&state.config.base_url).unwrap_or_default();
    let query = parse_query(request.uri().query());
    let path = request.uri().path();

    let page = {
        let db = state.db.read().await;
        if path == "/" {
            dashboard(&db, &principal, token, &ws_base)
        } else if path == "/inventory" || path == "/inventory/" {
            inventory(&db, &principal, query.get("status").map(|s| s.as_str()), token, &ws_base)
        } else if path == "/prescriptions" || path == "/prescriptions/" {
            prescriptions_page(&db, &principal, token, &ws_base)
        } else if path == "/reminders" || path == "/reminders/" {
            reminders_page(&db, &principal, token, &ws_base)
        } else if let Some(thread_id) = THREAD_PAGE_REGEX.captures(path)
            .and_then(|caps| caps.name("thread"))
            .and_then(|m| m.as_str().parse::<u64>().ok())
        {
            thread_page(&db, &principal, thread_id, token, &ws_base)
        } else {
            return crate::respond_404();
        }
    };

    match page {
        Ok(html) => crate::respond_html(html),
        Err(e) => {
            if e.status() == 500 {
                error!("failed to render {}: {}", path, e);
            }
            crate::respond_error(&e)
        },
    }
}
