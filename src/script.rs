//! Sandboxed script runtime.
//!
//! Filters use short [rhai](https://rhai.rs) expressions for predicates,
//! grouping keys, colour choices and alert editing. Each filter owns a
//! [`ScriptVm`]: a configured engine plus a base environment built from the
//! filter's helper script files. Every evaluation clones the base scope,
//! binds `alert` (or `alerts`) and runs a pre-compiled AST, so one
//! evaluation can never leak state into the next.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Datelike, Timelike, Utc};
use rhai::{Array, Dynamic, Engine, EvalAltResult, Map, Scope, AST};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::alert::Alert;

/// Script compilation, loading and evaluation errors.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("compile error: {0}")]
    Compile(String),
    #[error("runtime error: {0}")]
    Eval(String),
    #[error("failed to load script {path}: {reason}")]
    Load { path: String, reason: String },
    #[error("bad alert field {field}: {reason}")]
    Convert { field: &'static str, reason: String },
}

fn convert(field: &'static str, reason: impl Into<String>) -> ScriptError {
    ScriptError::Convert {
        field,
        reason: reason.into(),
    }
}

/// Base environment shared by all evaluations of one filter.
#[derive(Debug)]
struct HelperEnv {
    ast: AST,
    scope: Scope<'static>,
}

/// A per-filter script virtual machine.
///
/// Helper scripts loaded with [`load`](Self::load) persist as the base
/// environment: top-level variables land in the base scope, functions in the
/// helper AST merged into every evaluated expression.
#[derive(Debug)]
pub struct ScriptVm {
    engine: Engine,
    files: RwLock<Vec<PathBuf>>,
    helpers: RwLock<HelperEnv>,
}

impl Default for ScriptVm {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptVm {
    pub fn new() -> Self {
        Self {
            engine: build_engine(),
            files: RwLock::new(Vec::new()),
            helpers: RwLock::new(HelperEnv {
                ast: AST::empty(),
                scope: Scope::new(),
            }),
        }
    }

    /// Compile an expression for later evaluation. Called once at filter
    /// construction; a failure here aborts the construction.
    pub fn compile(&self, expr: &str) -> Result<AST, ScriptError> {
        self.engine
            .compile(expr)
            .map_err(|e| ScriptError::Compile(e.to_string()))
    }

    /// Load helper script files into the base environment, replacing any
    /// previously loaded environment.
    pub fn load<P: AsRef<Path>>(&self, files: &[P]) -> Result<(), ScriptError> {
        let mut ast = AST::empty();
        let mut scope = Scope::new();
        let mut paths = Vec::with_capacity(files.len());

        for file in files {
            let path = file.as_ref();
            let text = std::fs::read_to_string(path).map_err(|e| ScriptError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let compiled = self.engine.compile(&text).map_err(|e| ScriptError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            self.engine
                .run_ast_with_scope(&mut scope, &compiled)
                .map_err(|e| ScriptError::Load {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            ast = ast.merge(&compiled);
            paths.push(path.to_path_buf());
        }

        *self.helpers.write().unwrap() = HelperEnv { ast, scope };
        *self.files.write().unwrap() = paths;
        Ok(())
    }

    /// Re-load the helper files given to the last [`load`](Self::load) call.
    /// A no-op when no helper scripts are configured.
    pub fn reload(&self) -> Result<(), ScriptError> {
        let files = self.files.read().unwrap().clone();
        if files.is_empty() {
            return Ok(());
        }
        self.load(&files)
    }

    fn eval_bound(&self, ast: &AST, var: &str, value: Dynamic) -> Result<Dynamic, ScriptError> {
        let env = self.helpers.read().unwrap();
        let mut scope = env.scope.clone();
        scope.push_dynamic(var.to_string(), value);
        let merged = env.ast.merge(ast);
        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &merged)
            .map_err(|e| ScriptError::Eval(e.to_string()))
    }

    /// Evaluate with a single alert bound as `alert`.
    pub fn eval_alert(&self, ast: &AST, alert: &Alert) -> Result<Dynamic, ScriptError> {
        self.eval_bound(ast, "alert", alert_to_dynamic(alert))
    }

    /// Evaluate with a whole batch bound as `alerts`.
    pub fn eval_alerts(&self, ast: &AST, alerts: &[Alert]) -> Result<Dynamic, ScriptError> {
        let arr: Array = alerts.iter().map(alert_to_dynamic).collect();
        self.eval_bound(ast, "alerts", Dynamic::from_array(arr))
    }

    /// Run an editing script against a mutable projection of `alert` and
    /// read the result back into a fresh, validated [`Alert`].
    pub fn eval_edit(&self, ast: &AST, alert: &Alert) -> Result<Alert, ScriptError> {
        let env = self.helpers.read().unwrap();
        let mut scope = env.scope.clone();
        scope.push_dynamic("alert", alert_to_dynamic(alert));
        let merged = env.ast.merge(ast);
        self.engine
            .run_ast_with_scope(&mut scope, &merged)
            .map_err(|e| ScriptError::Eval(e.to_string()))?;

        let m = scope
            .get_value::<Map>("alert")
            .ok_or_else(|| convert("alert", "no longer an object map"))?;
        alert_from_map(&m)
    }
}

/// Build the shared engine configuration: resource limits plus the
/// timestamp type used for `alert.Date`.
fn build_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(1_000_000);
    engine.set_max_call_levels(32);

    engine
        .register_type_with_name::<DateTime<Utc>>("Timestamp")
        .register_fn("to_rfc3339", |t: &mut DateTime<Utc>| t.to_rfc3339())
        .register_fn("to_string", |t: &mut DateTime<Utc>| t.to_rfc3339())
        .register_fn("timestamp", |t: &mut DateTime<Utc>| t.timestamp())
        .register_get("year", |t: &mut DateTime<Utc>| t.year() as i64)
        .register_get("month", |t: &mut DateTime<Utc>| t.month() as i64)
        .register_get("day", |t: &mut DateTime<Utc>| t.day() as i64)
        .register_get("hour", |t: &mut DateTime<Utc>| t.hour() as i64)
        .register_get("minute", |t: &mut DateTime<Utc>| t.minute() as i64)
        .register_get("second", |t: &mut DateTime<Utc>| t.second() as i64)
        .register_fn("==", |a: DateTime<Utc>, b: DateTime<Utc>| a == b)
        .register_fn("<", |a: DateTime<Utc>, b: DateTime<Utc>| a < b)
        .register_fn(">", |a: DateTime<Utc>, b: DateTime<Utc>| a > b)
        .register_fn(
            "rfc3339",
            |s: &str| -> Result<DateTime<Utc>, Box<EvalAltResult>> {
                DateTime::parse_from_rfc3339(s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| e.to_string().into())
            },
        );

    engine
}

/// Project an alert into a script map with the canonical field names.
pub fn alert_to_dynamic(a: &Alert) -> Dynamic {
    let mut m = Map::new();
    m.insert("From".into(), a.from.clone().into());
    m.insert("Date".into(), Dynamic::from(a.date));
    m.insert("Host".into(), a.host.clone().into());
    m.insert("Title".into(), a.title.clone().into());
    m.insert("Message".into(), a.message.clone().into());

    let routes: Array = a.routes.iter().map(|r| r.clone().into()).collect();
    m.insert("Routes".into(), Dynamic::from_array(routes));

    let info = rhai::serde::to_dynamic(&a.info).unwrap_or_else(|_| Dynamic::from_map(Map::new()));
    m.insert("Info".into(), info);

    let mut stats = Map::new();
    for (k, v) in &a.stats {
        stats.insert(k.as_str().into(), (*v).into());
    }
    m.insert("Stats".into(), Dynamic::from_map(stats));

    let sub: Array = a.sub.iter().map(alert_to_dynamic).collect();
    m.insert("Sub".into(), Dynamic::from_array(sub));

    Dynamic::from_map(m)
}

fn map_string(v: &Dynamic, field: &'static str) -> Result<String, ScriptError> {
    v.clone()
        .into_string()
        .map_err(|typ| convert(field, format!("not a string but {typ}")))
}

/// Read an edited script map back into an [`Alert`].
///
/// Unknown keys are ignored. `Sub` is kept only while every element still
/// converts back to an alert shape.
pub fn alert_from_map(m: &Map) -> Result<Alert, ScriptError> {
    let mut a = Alert::default();

    for (k, v) in m {
        match k.as_str() {
            "From" => a.from = map_string(v, "From")?,
            "Host" => a.host = map_string(v, "Host")?,
            "Title" => a.title = map_string(v, "Title")?,
            "Message" => a.message = map_string(v, "Message")?,
            "Date" => {
                a.date = v
                    .clone()
                    .try_cast::<DateTime<Utc>>()
                    .ok_or_else(|| convert("Date", "not a timestamp"))?;
            }
            "Routes" => {
                let arr = v
                    .clone()
                    .try_cast::<Array>()
                    .ok_or_else(|| convert("Routes", "not an array of strings"))?;
                let mut routes = Vec::with_capacity(arr.len());
                for item in arr {
                    routes.push(
                        item.into_string()
                            .map_err(|_| convert("Routes", "not an array of strings"))?,
                    );
                }
                a.routes = routes;
            }
            "Info" => {
                a.info = rhai::serde::from_dynamic::<serde_json::Map<String, Value>>(v)
                    .map_err(|e| convert("Info", e.to_string()))?;
            }
            "Stats" => {
                let map = v
                    .clone()
                    .try_cast::<Map>()
                    .ok_or_else(|| convert("Stats", "not an object map"))?;
                let mut stats = std::collections::HashMap::with_capacity(map.len());
                for (sk, sv) in map {
                    let n = if let Ok(f) = sv.as_float() {
                        f
                    } else if let Ok(i) = sv.as_int() {
                        i as f64
                    } else {
                        return Err(convert("Stats", "non-numeric value"));
                    };
                    stats.insert(sk.to_string(), n);
                }
                a.stats = stats;
            }
            "Sub" => {
                if let Some(arr) = v.clone().try_cast::<Array>() {
                    let mut sub = Vec::with_capacity(arr.len());
                    let mut ok = true;
                    for item in arr {
                        match item.try_cast::<Map>().map(|im| alert_from_map(&im)) {
                            Some(Ok(child)) => sub.push(child),
                            _ => {
                                ok = false;
                                break;
                            }
                        }
                    }
                    if ok {
                        a.sub = sub;
                    }
                }
            }
            _ => {}
        }
    }

    a.validate()
        .map_err(|e| convert("alert", e.to_string()))?;
    Ok(a)
}

/// Coerce a script result to a boolean, logging when the script did not
/// return a real boolean.
pub fn coerce_bool(d: &Dynamic) -> bool {
    if !d.is_bool() {
        warn!(result_type = d.type_name(), "non-boolean script result coerced");
    }
    truthiness(d)
}

fn truthiness(d: &Dynamic) -> bool {
    if d.is_unit() {
        return false;
    }
    if let Ok(b) = d.as_bool() {
        return b;
    }
    if let Ok(i) = d.as_int() {
        return i != 0;
    }
    if let Ok(f) = d.as_float() {
        return f != 0.0;
    }
    if d.is_string() {
        return !d.clone().into_string().unwrap_or_default().is_empty();
    }
    true
}

/// Canonical string form of a grouping-key value.
pub fn key_string(d: &Dynamic) -> String {
    match rhai::serde::from_dynamic::<Value>(d) {
        Ok(v) => v.to_string(),
        Err(_) => d.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn alert() -> Alert {
        let mut a = Alert::new("mon", "cpu high");
        a.host = "web-1".to_string();
        a.routes = vec!["ops".to_string()];
        a.set_info("severity", Value::from(3));
        a.set_stat("rate", 0.5);
        a
    }

    #[test]
    fn test_predicate_fields() {
        let vm = ScriptVm::new();
        let ast = vm.compile(r#"alert.From == "mon" && alert.Info.severity >= 3"#).unwrap();
        let v = vm.eval_alert(&ast, &alert()).unwrap();
        assert_eq!(v.as_bool(), Ok(true));

        let ast = vm.compile(r#"alert.Routes.len() == 1"#).unwrap();
        assert_eq!(vm.eval_alert(&ast, &alert()).unwrap().as_bool(), Ok(true));

        let ast = vm.compile(r#"alert.Stats.rate > 0.4"#).unwrap();
        assert_eq!(vm.eval_alert(&ast, &alert()).unwrap().as_bool(), Ok(true));
    }

    #[test]
    fn test_batch_binding() {
        let vm = ScriptVm::new();
        let ast = vm.compile("alerts.len() >= 2").unwrap();
        let batch = vec![alert(), alert()];
        assert_eq!(vm.eval_alerts(&ast, &batch).unwrap().as_bool(), Ok(true));
    }

    #[test]
    fn test_compile_failure() {
        let vm = ScriptVm::new();
        assert!(vm.compile("alert.From ==").is_err());
    }

    #[test]
    fn test_no_state_leak_between_evaluations() {
        let vm = ScriptVm::new();
        let set = vm.compile("let leak = 1; true").unwrap();
        vm.eval_alert(&set, &alert()).unwrap();
        let probe = vm.compile("leak").unwrap();
        assert!(vm.eval_alert(&probe, &alert()).is_err());
    }

    #[test]
    fn test_helper_scripts_persist() {
        let vm = ScriptVm::new();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "fn noisy(a) {{ a.Title == \"cpu high\" }}\nlet threshold = 2;").unwrap();
        vm.load(&[f.path()]).unwrap();

        let ast = vm.compile("noisy(alert) && alert.Info.severity > threshold").unwrap();
        assert_eq!(vm.eval_alert(&ast, &alert()).unwrap().as_bool(), Ok(true));
    }

    #[test]
    fn test_date_methods() {
        let vm = ScriptVm::new();
        let mut a = alert();
        a.date = DateTime::parse_from_rfc3339("2026-03-01T10:20:30Z")
            .unwrap()
            .with_timezone(&Utc);
        let ast = vm.compile("alert.Date.year").unwrap();
        assert_eq!(vm.eval_alert(&ast, &a).unwrap().as_int(), Ok(2026));

        let ast = vm.compile("alert.Date.to_rfc3339()").unwrap();
        let s = vm.eval_alert(&ast, &a).unwrap().into_string().unwrap();
        assert!(s.starts_with("2026-03-01T10:20:30"));
    }

    #[test]
    fn test_edit_round_trip() {
        let vm = ScriptVm::new();
        let ast = vm
            .compile(r#"alert.Title = "edited"; alert.Routes.push("extra");"#)
            .unwrap();
        let edited = vm.eval_edit(&ast, &alert()).unwrap();
        assert_eq!(edited.title, "edited");
        assert_eq!(edited.routes, vec!["ops", "extra"]);
        assert_eq!(edited.from, "mon");
    }

    #[test]
    fn test_edit_type_mismatch_rejected() {
        let vm = ScriptVm::new();
        let ast = vm.compile("alert.From = 42;").unwrap();
        assert!(vm.eval_edit(&ast, &alert()).is_err());

        let ast = vm.compile("alert.Routes = 1;").unwrap();
        assert!(vm.eval_edit(&ast, &alert()).is_err());

        let ast = vm.compile(r#"alert.Title = "";"#).unwrap();
        assert!(vm.eval_edit(&ast, &alert()).is_err());
    }

    #[test]
    fn test_truthiness_coercion() {
        assert!(!truthiness(&Dynamic::UNIT));
        assert!(truthiness(&Dynamic::from(1_i64)));
        assert!(!truthiness(&Dynamic::from(0_i64)));
        assert!(truthiness(&Dynamic::from("x".to_string())));
        assert!(!truthiness(&Dynamic::from(String::new())));
        assert!(truthiness(&Dynamic::from_array(Array::new())));
    }

    #[test]
    fn test_key_string_is_canonical() {
        let vm = ScriptVm::new();
        let ast = vm.compile("alert.Host").unwrap();
        let k = key_string(&vm.eval_alert(&ast, &alert()).unwrap());
        assert_eq!(k, "\"web-1\"");

        let ast = vm.compile("[alert.From, alert.Host]").unwrap();
        let k = key_string(&vm.eval_alert(&ast, &alert()).unwrap());
        assert_eq!(k, "[\"mon\",\"web-1\"]");
    }
}
