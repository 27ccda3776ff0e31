//! Alert data model.
//!
//! An [`Alert`] is one notification flowing through the pipeline: posted by
//! a source or the REST ingress, pooled, filtered, and finally delivered
//! along its routes. The wire format uses PascalCase field names and RFC 3339
//! dates; the `Stats` field is runtime-only and never serialized.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Maximum length of the `From` field, in characters.
pub const MAX_FROM_LENGTH: usize = 100;

/// Maximum length of the `Title` field, in characters.
pub const MAX_TITLE_LENGTH: usize = 250;

/// Validation errors for [`Alert`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error("empty From")]
    EmptyFrom,
    #[error("too long From")]
    TooLongFrom,
    #[error("multi-line From")]
    MultiLineFrom,
    #[error("empty Title")]
    EmptyTitle,
    #[error("too long Title")]
    TooLongTitle,
    #[error("multi-line Title")]
    MultiLineTitle,
}

/// A single alert.
///
/// Cloning is deep: `sub` alerts, `info` values and `routes` are all copied
/// recursively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Alert {
    /// Identifies who sent this alert, e.g. "NTP monitor".
    pub from: String,

    /// When the alert was generated. The Unix epoch means "unset"; the
    /// ingress path fills it with the time of acceptance.
    pub date: DateTime<Utc>,

    /// Hostname or IP address where the alert was generated.
    pub host: String,

    /// One-line description.
    pub title: String,

    /// Multi-line description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Route IDs along which this alert is delivered.
    pub routes: Vec<String>,

    /// Free-form additional properties.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub info: serde_json::Map<String, Value>,

    /// Values calculated dynamically by filters. Never serialized.
    #[serde(skip)]
    pub stats: HashMap<String, f64>,

    /// Alerts merged into this one.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sub: Vec<Alert>,
}

impl Default for Alert {
    fn default() -> Self {
        Self {
            from: String::new(),
            date: DateTime::<Utc>::UNIX_EPOCH,
            host: String::new(),
            title: String::new(),
            message: String::new(),
            routes: Vec::new(),
            info: serde_json::Map::new(),
            stats: HashMap::new(),
            sub: Vec::new(),
        }
    }
}

impl Alert {
    /// Create an alert stamped with the current time.
    pub fn new(from: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            title: title.into(),
            date: Utc::now(),
            ..Self::default()
        }
    }

    /// Whether `date` still carries the "unset" sentinel.
    pub fn has_default_date(&self) -> bool {
        self.date == DateTime::<Utc>::UNIX_EPOCH
    }

    /// Validate the `from` and `title` constraints.
    pub fn validate(&self) -> Result<(), AlertError> {
        if self.from.is_empty() {
            return Err(AlertError::EmptyFrom);
        }
        if self.from.chars().count() > MAX_FROM_LENGTH {
            return Err(AlertError::TooLongFrom);
        }
        if self.from.contains('\n') {
            return Err(AlertError::MultiLineFrom);
        }

        if self.title.is_empty() {
            return Err(AlertError::EmptyTitle);
        }
        if self.title.chars().count() > MAX_TITLE_LENGTH {
            return Err(AlertError::TooLongTitle);
        }
        if self.title.contains('\n') {
            return Err(AlertError::MultiLineTitle);
        }

        Ok(())
    }

    /// Set a value in `info`.
    pub fn set_info(&mut self, key: impl Into<String>, value: Value) {
        self.info.insert(key.into(), value);
    }

    /// Set a statistics value.
    pub fn set_stat(&mut self, key: impl Into<String>, value: f64) {
        self.stats.insert(key.into(), value);
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}@{}] {}", self.from, self.host, self.title)
    }
}
