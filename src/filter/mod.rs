//! Filter contract and registry.
//!
//! A filter is one stage of the alert pipeline: it may discard, edit,
//! merge, annotate or re-route the alerts of a batch. Concrete filters
//! embed [`BaseFilter`] for the shared state (id, label, activation,
//! expiration, the `if` condition and the private script environment) and
//! override only [`Filter::params`] and [`Filter::process`].

pub mod discard;
pub mod edit;
pub mod exec;
pub mod freq;
pub mod group;
pub mod route;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use rhai::AST;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::alert::Alert;
use crate::params::{self, PluginParams};
use crate::script::{self, ScriptVm};

/// Filter construction and processing errors.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter id: {0}")]
    InvalidId(String),
    #[error("no such filter type: {0}")]
    UnknownType(String),
    #[error("{id}: {reason}")]
    Construct { id: String, reason: String },
    #[error("{id}: {reason}")]
    Process { id: String, reason: String },
}

impl FilterError {
    pub fn construct(id: &str, reason: impl ToString) -> Self {
        Self::Construct {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn process(id: &str, reason: impl ToString) -> Self {
        Self::Process {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Whether `id` is acceptable as a filter or route ID.
pub fn valid_id(id: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^[a-zA-Z0-9_-]+$").unwrap())
        .is_match(id)
}

/// The interface filter plugins implement.
///
/// Everything except `params` and `process` has a default implementation
/// delegating to the embedded [`BaseFilter`].
#[async_trait]
pub trait Filter: Send + Sync + std::fmt::Debug {
    /// The shared state container.
    fn base(&self) -> &BaseFilter;

    /// Parameters sufficient to re-construct this filter.
    fn params(&self) -> PluginParams;

    /// Apply the filter to a batch and return the surviving alerts.
    async fn process(&self, alerts: Vec<Alert>) -> Result<Vec<Alert>, FilterError>;

    fn id(&self) -> &str {
        self.base().id()
    }
    fn label(&self) -> &str {
        self.base().label()
    }
    fn dynamic(&self) -> bool {
        self.base().dynamic()
    }
    fn set_dynamic(&self) {
        self.base().set_dynamic()
    }
    fn disabled(&self) -> bool {
        self.base().disabled()
    }
    fn enable(&self, enabled: bool) {
        self.base().enable(enabled)
    }
    fn inactivate(&self, until: DateTime<Utc>) {
        self.base().inactivate(until)
    }
    fn expired(&self) -> bool {
        self.base().expired()
    }
    fn reload(&self) -> Result<(), FilterError> {
        self.base().reload()
    }
}

/// The per-filter `if` condition.
#[derive(Debug)]
enum Condition {
    /// No condition: everything matches.
    Always,
    /// A compiled script expression, evaluated with `alert` or `alerts`.
    Script { src: String, ast: AST },
    /// An external command; exit code 0 means "matches".
    Command(Vec<String>),
}

#[derive(Debug, Default)]
struct Activation {
    disabled: bool,
    inactive_until: Option<DateTime<Utc>>,
}

/// Shared state and behaviour for all filters.
#[derive(Debug)]
pub struct BaseFilter {
    id: String,
    label: String,
    dynamic: AtomicBool,
    all: bool,
    expire: Option<DateTime<Utc>>,
    activation: Mutex<Activation>,
    condition: Condition,
    scripts: Vec<String>,
    vm: ScriptVm,
}

impl BaseFilter {
    /// Initialize from the common parameter vocabulary:
    /// `label`, `disabled`, `all`, `expire` (RFC 3339), `scripts`
    /// (helper script paths) and `if` (expression string or command array).
    pub fn init(id: &str, p: &Map<String, Value>) -> Result<Self, FilterError> {
        if !valid_id(id) {
            return Err(FilterError::InvalidId(id.to_string()));
        }
        let wrap = |e: params::ParamError| FilterError::construct(id, e);

        let label = params::opt_str(p, "label").map_err(wrap)?.unwrap_or_default();
        let disabled = params::opt_bool(p, "disabled").map_err(wrap)?.unwrap_or(false);
        let all = params::opt_bool(p, "all").map_err(wrap)?.unwrap_or(false);
        let expire = params::opt_rfc3339(p, "expire").map_err(wrap)?;
        let scripts = params::opt_str_vec(p, "scripts").map_err(wrap)?.unwrap_or_default();

        let vm = ScriptVm::new();
        if !scripts.is_empty() {
            vm.load(&scripts).map_err(|e| FilterError::construct(id, e))?;
        }

        let condition = match p.get("if") {
            None | Some(Value::Null) => Condition::Always,
            Some(Value::String(src)) => {
                let ast = vm
                    .compile(src)
                    .map_err(|e| FilterError::construct(id, format!("if: {e}")))?;
                Condition::Script {
                    src: src.clone(),
                    ast,
                }
            }
            Some(Value::Array(_)) => {
                let argv = params::opt_str_vec(p, "if").map_err(wrap)?.unwrap_or_default();
                if argv.is_empty() {
                    return Err(FilterError::construct(id, "if: empty command"));
                }
                Condition::Command(argv)
            }
            Some(_) => {
                return Err(FilterError::construct(
                    id,
                    "if must be a string or an array of strings",
                ));
            }
        };

        Ok(Self {
            id: id.to_string(),
            label,
            dynamic: AtomicBool::new(false),
            all,
            expire,
            activation: Mutex::new(Activation {
                disabled,
                inactive_until: None,
            }),
            condition,
            scripts,
            vm,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the filter processes whole batches instead of single alerts.
    pub fn all(&self) -> bool {
        self.all
    }

    pub fn dynamic(&self) -> bool {
        self.dynamic.load(Ordering::Relaxed)
    }

    pub fn set_dynamic(&self) {
        self.dynamic.store(true, Ordering::Relaxed);
    }

    /// Composite activation state: explicitly disabled, or still inside an
    /// inactivation window.
    pub fn disabled(&self) -> bool {
        let act = self.activation.lock().unwrap();
        act.disabled || act.inactive_until.is_some_and(|until| Utc::now() < until)
    }

    /// `enable(true)` clears both the disabled flag and any inactivation
    /// window; `enable(false)` sets the disabled flag.
    pub fn enable(&self, enabled: bool) {
        let mut act = self.activation.lock().unwrap();
        act.disabled = !enabled;
        if enabled {
            act.inactive_until = None;
        }
    }

    /// Disable the filter until `until`.
    pub fn inactivate(&self, until: DateTime<Utc>) {
        self.activation.lock().unwrap().inactive_until = Some(until);
    }

    /// A dynamic filter with an elapsed `expire` is garbage.
    pub fn expired(&self) -> bool {
        self.dynamic() && self.expire.is_some_and(|t| Utc::now() > t)
    }

    /// Re-load helper scripts into the private environment, if configured.
    pub fn reload(&self) -> Result<(), FilterError> {
        self.vm
            .reload()
            .map_err(|e| FilterError::construct(&self.id, e))
    }

    /// The filter's private script environment. Type-specific expressions
    /// (`by`, `code`, ...) compile against this so helper scripts apply.
    pub fn vm(&self) -> &ScriptVm {
        &self.vm
    }

    async fn run_if_command(&self, argv: &[String], stdin: Option<Vec<u8>>) -> Result<bool, FilterError> {
        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..]).stdout(Stdio::null()).stderr(Stdio::null());
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd
            .spawn()
            .map_err(|e| FilterError::process(&self.id, format!("if command: {e}")))?;

        if let Some(data) = stdin {
            let mut pipe = child.stdin.take().ok_or_else(|| {
                FilterError::process(&self.id, "if command: failed to open stdin")
            })?;
            pipe.write_all(&data)
                .await
                .map_err(|e| FilterError::process(&self.id, format!("if command: {e}")))?;
            drop(pipe);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FilterError::process(&self.id, format!("if command: {e}")))?;
        Ok(status.success())
    }

    /// Evaluate the `if` condition against a single alert.
    pub async fn if_alert(&self, a: &Alert) -> Result<bool, FilterError> {
        match &self.condition {
            Condition::Always => Ok(true),
            Condition::Script { ast, .. } => {
                let v = self
                    .vm
                    .eval_alert(ast, a)
                    .map_err(|e| FilterError::process(&self.id, e))?;
                Ok(script::coerce_bool(&v))
            }
            Condition::Command(argv) => {
                let data = serde_json::to_vec(a)
                    .map_err(|e| FilterError::process(&self.id, e))?;
                self.run_if_command(argv, Some(data)).await
            }
        }
    }

    /// Evaluate the `if` condition against a whole batch.
    pub async fn if_all(&self, alerts: &[Alert]) -> Result<bool, FilterError> {
        match &self.condition {
            Condition::Always => Ok(true),
            Condition::Script { ast, .. } => {
                let v = self
                    .vm
                    .eval_alerts(ast, alerts)
                    .map_err(|e| FilterError::process(&self.id, e))?;
                Ok(script::coerce_bool(&v))
            }
            Condition::Command(argv) => self.run_if_command(argv, None).await,
        }
    }

    /// Add the common parameters, emitting only non-default values.
    pub fn add_params(&self, m: &mut Map<String, Value>) {
        if !self.label.is_empty() {
            m.insert("label".to_string(), Value::from(self.label.clone()));
        }
        if self.activation.lock().unwrap().disabled {
            m.insert("disabled".to_string(), Value::from(true));
        }
        if self.all {
            m.insert("all".to_string(), Value::from(true));
        }
        if !self.scripts.is_empty() {
            m.insert("scripts".to_string(), Value::from(self.scripts.clone()));
        }
        match &self.condition {
            Condition::Always => {}
            Condition::Script { src, .. } => {
                m.insert("if".to_string(), Value::from(src.clone()));
            }
            Condition::Command(argv) => {
                m.insert("if".to_string(), Value::from(argv.clone()));
            }
        }
        if self.dynamic() {
            if let Some(t) = self.expire {
                m.insert("expire".to_string(), Value::from(t.to_rfc3339()));
            }
        }
    }
}

/// A filter constructor registered for a `type` string.
pub type FilterConstructor =
    fn(&str, &Map<String, Value>) -> Result<Arc<dyn Filter>, FilterError>;

static FILTER_TYPES: OnceLock<HashMap<&'static str, FilterConstructor>> = OnceLock::new();

fn registry() -> &'static HashMap<&'static str, FilterConstructor> {
    FILTER_TYPES.get_or_init(|| {
        let mut m: HashMap<&'static str, FilterConstructor> = HashMap::new();
        m.insert("discard", discard::construct);
        m.insert("edit", edit::construct);
        m.insert("exec", exec::construct);
        m.insert("freq", freq::construct);
        m.insert("group", group::construct);
        m.insert("route", route::construct);
        m
    })
}

/// Construct a filter of the given type.
pub fn new_filter(
    kind: &str,
    id: &str,
    p: &Map<String, Value>,
) -> Result<Arc<dyn Filter>, FilterError> {
    let ctor = registry()
        .get(kind)
        .ok_or_else(|| FilterError::UnknownType(kind.to_string()))?;
    ctor(id, p)
}
