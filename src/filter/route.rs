//! `route` filter: adds or replaces route IDs on matching alerts, with an
//! optional auto-mute that temporarily substitutes a quieter route set.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{BaseFilter, Filter, FilterError};
use crate::alert::Alert;
use crate::params::{self, PluginParams};

const FILTER_TYPE: &str = "route";

const DEFAULT_MUTE_SECONDS: i64 = 60;

#[derive(Debug)]
struct RouteFilter {
    base: BaseFilter,
    routes: Vec<String>,
    replace: bool,
    auto_mute: bool,
    mute_duration: Duration,
    mute_routes: Vec<String>,
    mute_until: Mutex<Option<Instant>>,
}

impl RouteFilter {
    fn route(&self, a: &mut Alert, now: Instant) {
        let mut routes = &self.routes;

        if self.auto_mute {
            let mut until = self.mute_until.lock().unwrap();
            match *until {
                Some(t) if now < t => routes = &self.mute_routes,
                // The deadline is armed only when a matching alert is seen
                // after the previous window elapsed; long quiet gaps never
                // mute at all.
                _ => *until = Some(now + self.mute_duration),
            }
        }

        if self.replace || a.routes.is_empty() {
            a.routes = routes.clone();
            return;
        }

        for r in routes {
            if !a.routes.contains(r) {
                a.routes.push(r.clone());
            }
        }
    }
}

#[async_trait]
impl Filter for RouteFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    fn params(&self) -> PluginParams {
        let mut p = PluginParams::new(FILTER_TYPE);
        p.params
            .insert("routes".to_string(), Value::from(self.routes.clone()));
        p.params
            .insert("replace".to_string(), Value::from(self.replace));
        p.params
            .insert("auto_mute".to_string(), Value::from(self.auto_mute));
        p.params.insert(
            "mute_seconds".to_string(),
            Value::from(self.mute_duration.as_secs()),
        );
        p.params
            .insert("mute_routes".to_string(), Value::from(self.mute_routes.clone()));
        self.base.add_params(&mut p.params);
        p
    }

    async fn process(&self, mut alerts: Vec<Alert>) -> Result<Vec<Alert>, FilterError> {
        let now = Instant::now();

        if self.base.all() {
            if self.base.if_all(&alerts).await? {
                for a in alerts.iter_mut() {
                    self.route(a, now);
                }
            }
            return Ok(alerts);
        }

        for a in alerts.iter_mut() {
            if self.base.if_alert(a).await? {
                self.route(a, now);
            }
        }
        Ok(alerts)
    }
}

pub fn construct(id: &str, p: &Map<String, Value>) -> Result<Arc<dyn Filter>, FilterError> {
    let wrap = |e: params::ParamError| FilterError::construct(id, e);

    let mute_seconds = match params::opt_i64(p, "mute_seconds").map_err(wrap)? {
        None => DEFAULT_MUTE_SECONDS,
        Some(s) if s > 0 => s,
        Some(_) => return Err(FilterError::construct(id, "invalid mute_seconds")),
    };

    Ok(Arc::new(RouteFilter {
        base: BaseFilter::init(id, p)?,
        routes: params::opt_str_vec(p, "routes").map_err(wrap)?.unwrap_or_default(),
        replace: params::opt_bool(p, "replace").map_err(wrap)?.unwrap_or(false),
        auto_mute: params::opt_bool(p, "auto_mute").map_err(wrap)?.unwrap_or(false),
        mute_duration: Duration::from_secs(mute_seconds as u64),
        mute_routes: params::opt_str_vec(p, "mute_routes")
            .map_err(wrap)?
            .unwrap_or_default(),
        mute_until: Mutex::new(None),
    }))
}
