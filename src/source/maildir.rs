//! `maildir` source: turns files dropped into a Maildir-style directory
//! into alerts.
//!
//! Every `interval` seconds the `new/` subdirectory is scanned. Each
//! regular file is parsed as a pseudo-header document: `Key: value` lines,
//! a blank separator line, then the message body. `From`, `Title`, `Host`
//! and `Date` map to the alert fields; any other header lands in `Info`.
//! Consumed files are moved to `cur/` whether or not they parsed.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{PostFn, Source, SourceError};
use crate::alert::Alert;
use crate::params;

const SOURCE_TYPE: &str = "maildir";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-zA-Z0-9-]+):[ \t]*(.*)$").unwrap())
}

struct MaildirSource {
    dir: PathBuf,
    interval: Duration,
}

/// Parse a pseudo-header alert document.
///
/// When a line before the blank separator is not a header, the whole
/// content is treated as the message body instead.
fn parse(text: &str) -> Alert {
    let mut a = Alert::default();
    let mut lines = text.lines();
    let mut headers = Vec::new();
    let mut body_start = 0usize;

    let mut offset = 0usize;
    let mut well_formed = false;
    for line in lines.by_ref() {
        if line.is_empty() {
            well_formed = !headers.is_empty();
            body_start = offset + 1;
            break;
        }
        match header_re().captures(line) {
            Some(caps) => headers.push((caps[1].to_string(), caps[2].to_string())),
            None => break,
        }
        offset += 1;
    }

    if !well_formed {
        a.message = text.to_string();
        return a;
    }

    for (key, value) in headers {
        match key.as_str() {
            "From" => a.from = value,
            "Title" => a.title = value,
            "Host" => a.host = value,
            "Date" => match parse_date(&value) {
                Some(t) => a.date = t,
                None => warn!(value = %value, "ignored ill-formatted date"),
            },
            _ => {
                a.set_info(key, Value::from(value));
            }
        }
    }

    a.message = text
        .lines()
        .skip(body_start)
        .collect::<Vec<_>>()
        .join("\n");
    a
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

impl MaildirSource {
    /// Scan `new/`, posting one alert per parseable file.
    fn scan(&self, post: &PostFn) {
        let new_dir = self.dir.join("new");
        let cur_dir = self.dir.join("cur");

        let entries = match std::fs::read_dir(&new_dir) {
            Ok(e) => e,
            Err(_) => return,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() || meta.len() > MAX_FILE_SIZE {
                continue;
            }

            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let mut alert = parse(&text);
                    if alert.has_default_date() {
                        alert.date = Utc::now();
                    }
                    match alert.validate() {
                        Ok(()) => {
                            debug!(file = %path.display(), from = %alert.from, "new alert");
                            post(alert);
                        }
                        Err(e) => {
                            warn!(file = %path.display(), error = %e, "ignored invalid alert file");
                        }
                    }
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "failed to read alert file");
                }
            }

            // Move aside regardless, so a broken file is not re-scanned
            // forever.
            if let Some(name) = path.file_name() {
                if let Err(e) = std::fs::rename(&path, cur_dir.join(name)) {
                    warn!(file = %path.display(), error = %e, "failed to archive alert file");
                }
            }
        }
    }
}

#[async_trait]
impl Source for MaildirSource {
    async fn run(&self, cancel: CancellationToken, post: PostFn) -> Result<(), SourceError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.scan(&post);
        }
    }
}

pub fn construct(p: &Map<String, Value>) -> Result<Arc<dyn Source>, SourceError> {
    let wrap = |e: params::ParamError| SourceError::construct(SOURCE_TYPE, e);

    let dir = params::req_str(p, "dir").map_err(wrap)?;
    let dir = PathBuf::from(dir);
    if !dir.is_absolute() {
        return Err(SourceError::construct(SOURCE_TYPE, "dir is not an absolute path"));
    }
    if dir.exists() && !dir.is_dir() {
        return Err(SourceError::construct(SOURCE_TYPE, "dir is not a directory"));
    }
    if !dir.exists() {
        warn!(dir = %dir.display(), "maildir directory does not exist");
    }

    let interval = match params::opt_i64(p, "interval").map_err(wrap)? {
        None => DEFAULT_INTERVAL,
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
        Some(_) => return Err(SourceError::construct(SOURCE_TYPE, "invalid interval")),
    };

    Ok(Arc::new(MaildirSource { dir, interval }))
}
