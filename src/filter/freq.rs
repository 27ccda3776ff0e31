//! `freq` filter: annotates alerts with their recent occurrence frequency.
//!
//! Keeps a sliding-window sample of arrival times per classification key
//! and writes `count / divisor` into the alert's `Stats`. Alerts pass
//! through otherwise unchanged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rhai::AST;
use serde_json::{Map, Value};

use super::{BaseFilter, Filter, FilterError};
use crate::alert::Alert;
use crate::params::{self, PluginParams};
use crate::script;

const FILTER_TYPE: &str = "freq";

const DEFAULT_DURATION: Duration = Duration::from_secs(600);
const DEFAULT_DIVISOR: f64 = 10.0;

/// Sliding-window sample of event times.
///
/// Stale entries (strictly `t <= now - duration`) are expunged by
/// compacting the buffer in place; the common path never reallocates.
#[derive(Debug)]
struct Sample {
    duration: Duration,
    samples: Vec<Instant>,
}

impl Sample {
    fn new(duration: Duration) -> Self {
        Self {
            duration,
            samples: Vec::with_capacity(10),
        }
    }

    fn gc(&mut self, now: Instant) {
        let Some(expire) = now.checked_sub(self.duration) else {
            return;
        };
        self.samples.retain(|t| *t > expire);
    }

    fn add(&mut self, t: Instant) {
        self.samples.push(t);
    }

    fn count(&mut self, now: Instant) -> usize {
        self.gc(now);
        self.samples.len()
    }
}

/// Fixed-field classification, as an alternative to a `foreach` script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classify {
    None,
    From,
    Title,
    Host,
}

impl Classify {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "From" | "from" => Some(Self::From),
            "Title" | "title" => Some(Self::Title),
            "Host" | "host" => Some(Self::Host),
            _ => None,
        }
    }

    fn value(self, a: &Alert) -> String {
        match self {
            Self::None => String::new(),
            Self::From => a.from.clone(),
            Self::Title => a.title.clone(),
            Self::Host => a.host.clone(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::None => "",
            Self::From => "From",
            Self::Title => "Title",
            Self::Host => "Host",
        }
    }
}

#[derive(Debug)]
struct FreqFilter {
    base: BaseFilter,
    duration: Duration,
    divisor: f64,
    classify: Classify,
    foreach: Option<AST>,
    orig_foreach: String,
    key: String,
    samples: Mutex<HashMap<String, Sample>>,
}

impl FreqFilter {
    fn sample_key(&self, a: &Alert) -> Result<String, FilterError> {
        if let Some(ast) = &self.foreach {
            let v = self
                .base
                .vm()
                .eval_alert(ast, a)
                .map_err(|e| FilterError::process(self.base.id(), e))?;
            return Ok(script::key_string(&v));
        }
        Ok(self.classify.value(a))
    }

    fn calc(&self, a: &mut Alert, now: Instant) -> Result<(), FilterError> {
        let key = self.sample_key(a)?;

        let mut samples = self.samples.lock().unwrap();
        let sample = samples
            .entry(key)
            .or_insert_with(|| Sample::new(self.duration));
        sample.add(now);
        let freq = sample.count(now) as f64 / self.divisor;
        drop(samples);

        let stat_key = if self.key.is_empty() {
            self.base.id().to_string()
        } else {
            self.key.clone()
        };
        a.set_stat(stat_key, freq);
        Ok(())
    }
}

#[async_trait]
impl Filter for FreqFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    fn params(&self) -> PluginParams {
        let mut p = PluginParams::new(FILTER_TYPE);
        p.params
            .insert("duration".to_string(), Value::from(self.duration.as_secs()));
        p.params
            .insert("divisor".to_string(), Value::from(self.divisor));
        if self.classify != Classify::None {
            p.params
                .insert("classify".to_string(), Value::from(self.classify.name()));
        }
        if !self.orig_foreach.is_empty() {
            p.params
                .insert("foreach".to_string(), Value::from(self.orig_foreach.clone()));
        }
        if !self.key.is_empty() {
            p.params.insert("key".to_string(), Value::from(self.key.clone()));
        }
        self.base.add_params(&mut p.params);
        p
    }

    async fn process(&self, mut alerts: Vec<Alert>) -> Result<Vec<Alert>, FilterError> {
        let now = Instant::now();

        if self.base.all() {
            if self.base.if_all(&alerts).await? {
                for a in alerts.iter_mut() {
                    self.calc(a, now)?;
                }
            }
            return Ok(alerts);
        }

        for a in alerts.iter_mut() {
            if self.base.if_alert(a).await? {
                self.calc(a, now)?;
            }
        }
        Ok(alerts)
    }
}

pub fn construct(id: &str, p: &Map<String, Value>) -> Result<Arc<dyn Filter>, FilterError> {
    let wrap = |e: params::ParamError| FilterError::construct(id, e);

    let duration = match params::opt_i64(p, "duration").map_err(wrap)? {
        None => DEFAULT_DURATION,
        Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
        Some(_) => return Err(FilterError::construct(id, "invalid duration")),
    };

    let divisor = match params::opt_f64(p, "divisor").map_err(wrap)? {
        None => DEFAULT_DIVISOR,
        Some(d) if d > 0.0 => d,
        Some(_) => return Err(FilterError::construct(id, "invalid divisor")),
    };

    let classify = match params::opt_str(p, "classify").map_err(wrap)? {
        None => Classify::None,
        Some(s) => Classify::parse(&s)
            .ok_or_else(|| FilterError::construct(id, format!("no such class: {s}")))?,
    };

    let base = BaseFilter::init(id, p)?;

    let orig_foreach = params::opt_str(p, "foreach").map_err(wrap)?.unwrap_or_default();
    let foreach = if orig_foreach.is_empty() {
        None
    } else {
        Some(
            base.vm()
                .compile(&orig_foreach)
                .map_err(|e| FilterError::construct(id, format!("foreach: {e}")))?,
        )
    };

    Ok(Arc::new(FreqFilter {
        duration,
        divisor,
        classify,
        foreach,
        orig_foreach,
        key: params::opt_str(p, "key").map_err(wrap)?.unwrap_or_default(),
        samples: Mutex::new(HashMap::new()),
        base,
    }))
}
