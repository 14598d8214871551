use std::borrow::Cow;
use std::collections::HashMap;

use chrono::{DateTime, Local, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use url::Url;


const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub(crate) const JOIN_CODE_LENGTH: usize = 6;
const TOKEN_LENGTH: usize = 40;


pub(crate) fn generate_join_code<R: Rng>(rng: &mut R) -> String {
    (0..JOIN_CODE_LENGTH)
        .map(|_| JOIN_CODE_ALPHABET[rng.gen_range(0..JOIN_CODE_ALPHABET.len())] as char)
        .collect()
}

/// Generates a join code not accepted by `taken`.
pub(crate) fn unique_join_code<F: Fn(&str) -> bool>(taken: F) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let code = generate_join_code(&mut rng);
        if !taken(&code) {
            return code;
        }
    }
}

pub(crate) fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}


pub(crate) fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    match query {
        Some(q) => form_urlencoded::parse(q.as_bytes())
            .map(|(k, v): (Cow<str>, Cow<str>)| (k.into_owned(), v.into_owned()))
            .collect(),
        None => HashMap::new(),
    }
}


/// Chat timestamp, e.g. `Mar 04, 09:15 PM`.
pub(crate) fn chat_time(timestamp: &DateTime<Utc>) -> String {
    timestamp.with_timezone(&Local).format("%b %d, %I:%M %p").to_string()
}

/// Feed timestamp, e.g. `Mar. 4, 2026, 9:15 p.m.`.
pub(crate) fn feed_time(timestamp: &DateTime<Utc>) -> String {
    timestamp.with_timezone(&Local)
        .format("%b. %-d, %Y, %-I:%M %p")
        .to_string()
        .replace("AM", "a.m.")
        .replace("PM", "p.m.")
}


/// Derives the WebSocket base URL (`ws://` or `wss://`) from the HTTP base URL.
pub(crate) fn websocket_base(base_url: &str) -> Option<String> {
    let mut url: Url = base_url.parse().ok()?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    Some(url.as_str().trim_end_matches('/').to_owned())
}
