//! Plugin construction parameters.
//!
//! [`PluginParams`] carries a plugin `type` plus its free-form parameter
//! table, as found in TOML config tables and REST request bodies. The typed
//! accessors distinguish a *missing* key (`Ok(None)`) from a *mistyped* one
//! (`Err`), so constructors can treat optional keys uniformly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Parameter extraction errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParamError {
    #[error("no such parameter: {0}")]
    Missing(String),
    #[error("parameter {key} is not {expected}")]
    BadType { key: String, expected: &'static str },
}

impl ParamError {
    fn bad(key: &str, expected: &'static str) -> Self {
        Self::BadType {
            key: key.to_string(),
            expected,
        }
    }
}

/// Construction parameters for filters, transports and sources.
///
/// On the wire the `type` key is flattened into the parameter object:
/// `{"type": "discard", "if": "...", ...}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginParams {
    /// Plugin type name, e.g. `"discard"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Everything else.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl PluginParams {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }
}

/// Look up an optional string parameter.
pub fn opt_str(params: &Map<String, Value>, key: &str) -> Result<Option<String>, ParamError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ParamError::bad(key, "a string")),
    }
}

/// Look up a mandatory string parameter.
pub fn req_str(params: &Map<String, Value>, key: &str) -> Result<String, ParamError> {
    opt_str(params, key)?.ok_or_else(|| ParamError::Missing(key.to_string()))
}

/// Look up an optional boolean parameter.
pub fn opt_bool(params: &Map<String, Value>, key: &str) -> Result<Option<bool>, ParamError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ParamError::bad(key, "a boolean")),
    }
}

/// Look up an optional integer parameter.
pub fn opt_i64(params: &Map<String, Value>, key: &str) -> Result<Option<i64>, ParamError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| ParamError::bad(key, "an integer")),
        Some(_) => Err(ParamError::bad(key, "an integer")),
    }
}

/// Look up an optional number parameter.
pub fn opt_f64(params: &Map<String, Value>, key: &str) -> Result<Option<f64>, ParamError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| ParamError::bad(key, "a number")),
        Some(_) => Err(ParamError::bad(key, "a number")),
    }
}

/// Look up an optional array-of-strings parameter.
pub fn opt_str_vec(
    params: &Map<String, Value>,
    key: &str,
) -> Result<Option<Vec<String>>, ParamError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut v = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => v.push(s.clone()),
                    _ => return Err(ParamError::bad(key, "an array of strings")),
                }
            }
            Ok(Some(v))
        }
        Some(_) => Err(ParamError::bad(key, "an array of strings")),
    }
}

/// Look up an optional RFC 3339 timestamp parameter.
pub fn opt_rfc3339(
    params: &Map<String, Value>,
    key: &str,
) -> Result<Option<DateTime<Utc>>, ParamError> {
    match opt_str(params, key)? {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| ParamError::bad(key, "an RFC 3339 time")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip() {
        let j = r#"{"type":"route","routes":["r1","r2"],"replace":true}"#;
        let p: PluginParams = serde_json::from_str(j).unwrap();
        assert_eq!(p.kind, "route");
        assert_eq!(p.params["replace"], json!(true));

        let v: Value = serde_json::to_value(&p).unwrap();
        assert_eq!(v["type"], "route");
        assert_eq!(v["routes"], json!(["r1", "r2"]));
    }

    #[test]
    fn test_toml_decode() {
        let t = "type = \"exec\"\ncommand = [\"sh\", \"-c\", \"true\"]\ntimeout = 3\n";
        let p: PluginParams = toml::from_str(t).unwrap();
        assert_eq!(p.kind, "exec");
        assert_eq!(opt_i64(&p.params, "timeout").unwrap(), Some(3));
        assert_eq!(
            opt_str_vec(&p.params, "command").unwrap().unwrap(),
            vec!["sh", "-c", "true"]
        );
    }

    #[test]
    fn test_missing_vs_bad_type() {
        let p: PluginParams =
            serde_json::from_str(r#"{"type":"t","n":3,"s":"x","b":true}"#).unwrap();
        assert_eq!(opt_str(&p.params, "absent").unwrap(), None);
        assert!(matches!(
            req_str(&p.params, "absent"),
            Err(ParamError::Missing(_))
        ));
        assert!(matches!(
            opt_str(&p.params, "n"),
            Err(ParamError::BadType { .. })
        ));
        assert_eq!(opt_bool(&p.params, "b").unwrap(), Some(true));
        assert_eq!(opt_i64(&p.params, "n").unwrap(), Some(3));
        assert_eq!(opt_f64(&p.params, "n").unwrap(), Some(3.0));
    }

    #[test]
    fn test_rfc3339() {
        let p: PluginParams =
            serde_json::from_str(r#"{"type":"t","expire":"2026-12-24T11:22:33Z","bad":"x"}"#)
                .unwrap();
        let t = opt_rfc3339(&p.params, "expire").unwrap().unwrap();
        assert_eq!(t.to_rfc3339(), "2026-12-24T11:22:33+00:00");
        assert!(opt_rfc3339(&p.params, "bad").is_err());
        assert_eq!(opt_rfc3339(&p.params, "absent").unwrap(), None);
    }
}
