mod accounts;
mod effects;
mod error;
mod filters;
mod hub;
mod messaging;
mod model;
mod notify;
mod pages;
mod pharmacy;
mod prescriptions;
mod reminders;
mod routes;
mod scheduler;
mod seed;
mod state;
mod store;
#[cfg(test)]
mod testutil;
mod util;
mod ws;


use std::convert::Infallible;
use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use hyper::{Body, Request, Response, Server};
use hyper::service::{make_service_fn, service_fn};
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::error::AppError;
use crate::model::{Config, Role};
use crate::state::AppState;
use crate::store::Database;


const DEFAULT_LOG_FILTER: &str = "pulserx=info";


fn respond_500() -> Result<Response<Body>, Infallible> {
    let resp_body = Body::from("500 Something Went Wrong On The Server");
    let resp = Response::builder()
        .status(500)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(resp_body)
        .expect("failed to build body");
    Ok(resp)
}

fn respond_text(status: u16, text: String) -> Result<Response<Body>, Infallible> {
    let resp_res = Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Body::from(text));
    match resp_res {
        Ok(resp) => Ok(resp),
        Err(e) => {
            error!("failed to assemble {} response body: {}", status, e);
            respond_500()
        },
    }
}

fn respond_403() -> Result<Response<Body>, Infallible> {
    respond_text(403, "403 Forbidden; token missing or invalid".to_owned())
}

fn respond_404() -> Result<Response<Body>, Infallible> {
    respond_text(404, "404 Not Found".to_owned())
}

fn respond_405(allowed: &str) -> Result<Response<Body>, Infallible> {
    let resp_body = Body::from(format!("405 Wrong Method; try one of: {}", allowed));
    let resp_res = Response::builder()
        .status(405)
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("Allow", allowed)
        .body(resp_body);
    match resp_res {
        Ok(resp) => Ok(resp),
        Err(e) => {
            error!("failed to assemble 405 response body: {}", e);
            respond_500()
        },
    }
}

fn respond_json(status: u16, value: &Value) -> Result<Response<Body>, Infallible> {
    let body_string = match serde_json::to_string(value) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to serialize response: {}", e);
            return respond_500();
        },
    };
    let resp_res = Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Body::from(body_string));
    match resp_res {
        Ok(resp) => Ok(resp),
        Err(e) => {
            error!("failed to assemble {} response body: {}", status, e);
            respond_500()
        },
    }
}

/// Errors become `{"detail": ...}` with the matching status; internal ones are logged and hidden.
fn respond_error(e: &AppError) -> Result<Response<Body>, Infallible> {
    let status = e.status();
    if status >= 500 {
        error!("request failed: {}", e);
        return respond_500();
    }
    respond_json(status, &json!({ "detail": e.to_string() }))
}

fn respond_html(html: String) -> Result<Response<Body>, Infallible> {
    let resp_res = Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(Body::from(html));
    match resp_res {
        Ok(r) => Ok(r),
        Err(e) => {
            error!("failed to assemble response body: {}", e);
            respond_500()
        },
    }
}


async fn handle_request(state: Arc<AppState>, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    let uri_path = request.uri().path();

    if uri_path.starts_with("/ws/") {
        let channel = match ws::channel_for_path(uri_path) {
            Some(c) => c,
            None => return respond_404(),
        };
        let principal = match routes::authenticate_request(&state, request.uri(), request.headers()).await {
            Some(p) if p.role != Role::System => p,
            _ => return respond_403(),
        };
        return ws::upgrade(state, request, principal, channel).await;
    }

    if uri_path.starts_with("/api/") {
        return routes::handle_api(state, request).await;
    }

    pages::handle_page(state, request).await
}


fn load_config(config_path: &Path) -> Result<Config, String> {
    let mut config_file = File::open(config_path)
        .map_err(|e| format!("failed to open config file {:?}: {}", config_path, e))?;
    let mut config_string = String::new();
    config_file.read_to_string(&mut config_string)
        .map_err(|e| format!("failed to read config file {:?}: {}", config_path, e))?;
    toml::from_str(&config_string)
        .map_err(|e| format!("failed to parse config file {:?}: {}", config_path, e))
}

/// Logs to stderr, or to a daily file under `log_dir` when one is configured.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "pulserx.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        },
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .init();
            None
        },
    }
}

fn seed_demo(config: &Config, db: &mut Database) -> i32 {
    let data_path = match &config.data_path {
        Some(dp) => dp,
        None => {
            error!("seed-demo needs a data_path in the config file");
            return 1;
        },
    };
    let summary = match seed::seed_demo(db, config.low_stock_threshold, Local::now()) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to seed demo data: {}", e);
            return 1;
        },
    };
    if let Err(e) = db.store(Path::new(data_path)) {
        error!("failed to store demo data: {}", e);
        return 1;
    }
    print!("{}", summary);
    0
}


async fn perform() -> i32 {
    let mut args: Vec<OsString> = env::args_os().collect();
    let seed = args.len() > 1 && args.last().map(|a| a == "seed-demo").unwrap_or(false);
    if seed {
        args.pop();
    }
    if args.len() < 1 || args.len() > 2 {
        eprintln!("Usage: {:?} [CONFIGPATH.toml] [seed-demo]", args.get(0).cloned().unwrap_or_default());
        return 1;
    }
    let config_path: PathBuf = if args.len() > 1 {
        args[1].clone().into()
    } else {
        "config.toml".into()
    };

    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        },
    };
    let _log_guard = init_tracing(&config);

    let mut db = match &config.data_path {
        Some(dp) => match Database::load(Path::new(dp)) {
            Ok(db) => db,
            Err(e) => {
                error!("failed to load data from {:?}: {}", dp, e);
                return 1;
            },
        },
        None => Database::default(),
    };

    if seed {
        return seed_demo(&config, &mut db);
    }

    let addr: SocketAddr = match config.listen_addr.parse() {
        Ok(a) => a,
        Err(e) => {
            error!("failed to parse listen address and port {:?}: {}", config.listen_addr, e);
            return 1;
        },
    };

    let state = AppState::new(config, db);
    state.sweep().await;
    state.resume_reminders().await;
    state::spawn_sweeper(Arc::clone(&state));

    let make_service = make_service_fn(move |_conn| {
        let state = Arc::clone(&state);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| handle_request(Arc::clone(&state), request)))
        }
    });
    info!("listening on {}", addr);
    let server = Server::bind(&addr).serve(make_service);
    if let Err(e) = server.await {
        error!("server error: {}", e);
    }

    0
}


#[tokio::main]
async fn main() {
    std::process::exit(perform().await)
}
