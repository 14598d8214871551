use askama;
use chrono::{DateTime, Utc};

use crate::pharmacy;
use crate::util;


pub(crate) fn br<S: ToString>(s: S) -> askama::Result<String> {
    Ok(s.to_string().replace("\n", "<br/>\n"))
}

pub(crate) fn med_icon<S: AsRef<str>>(route: S) -> askama::Result<&'static str> {
    Ok(pharmacy::med_icon(route.as_ref()))
}

pub(crate) trait AsDateTime {
    fn as_date_time(&self) -> &DateTime<Utc>;
}

impl AsDateTime for DateTime<Utc> {
    fn as_date_time(&self) -> &DateTime<Utc> {
        self
    }
}

impl<T: AsDateTime + ?Sized> AsDateTime for &T {
    fn as_date_time(&self) -> &DateTime<Utc> {
        (**self).as_date_time()
    }
}

pub(crate) fn chat_time<T: AsDateTime>(timestamp: T) -> askama::Result<String> {
    Ok(util::chat_time(timestamp.as_date_time()))
}
