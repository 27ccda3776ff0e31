//! `group` filter: merges alerts sharing a grouping key into one alert
//! carrying the originals in `Sub`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rhai::AST;
use serde_json::{Map, Value};

use super::{BaseFilter, Filter, FilterError};
use crate::alert::Alert;
use crate::params::{self, PluginParams};
use crate::script;

const FILTER_TYPE: &str = "group";

const DEFAULT_FROM_PREFIX: &str = "filter:";
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_TITLE: &str = "merged alert";

#[derive(Debug)]
struct GroupFilter {
    base: BaseFilter,
    by: Option<AST>,
    orig_by: String,
    from: String,
    title: String,
    message: String,
    routes: Vec<String>,
}

impl GroupFilter {
    /// Merge a non-empty group. A group of one is returned unchanged.
    fn merge(&self, group: Vec<Alert>) -> Alert {
        if group.len() == 1 {
            return group.into_iter().next().unwrap_or_default();
        }

        let first = &group[0];
        let mut merged = Alert {
            from: first.from.clone(),
            date: Utc::now(),
            host: first.host.clone(),
            title: first.title.clone(),
            message: first.message.clone(),
            routes: self.routes.clone(),
            ..Alert::default()
        };

        for a in &group[1..] {
            if a.from != first.from {
                merged.from = if self.from.is_empty() {
                    format!("{}{}", DEFAULT_FROM_PREFIX, self.base.id())
                } else {
                    self.from.clone()
                };
            }
            if a.host != first.host {
                merged.host = DEFAULT_HOST.to_string();
            }
            if a.title != first.title {
                merged.title = if self.title.is_empty() {
                    DEFAULT_TITLE.to_string()
                } else {
                    self.title.clone()
                };
            }
            if a.message != first.message {
                merged.message = self.message.clone();
            }
        }

        merged.sub = group;
        merged
    }

    fn key_of(&self, a: &Alert) -> Result<String, FilterError> {
        match &self.by {
            None => Ok(String::new()),
            Some(ast) => {
                let v = self
                    .base
                    .vm()
                    .eval_alert(ast, a)
                    .map_err(|e| FilterError::process(self.base.id(), e))?;
                Ok(script::key_string(&v))
            }
        }
    }
}

#[async_trait]
impl Filter for GroupFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    fn params(&self) -> PluginParams {
        let mut p = PluginParams::new(FILTER_TYPE);
        if !self.orig_by.is_empty() {
            p.params.insert("by".to_string(), Value::from(self.orig_by.clone()));
        }
        if !self.from.is_empty() {
            p.params.insert("from".to_string(), Value::from(self.from.clone()));
        }
        if !self.title.is_empty() {
            p.params.insert("title".to_string(), Value::from(self.title.clone()));
        }
        if !self.message.is_empty() {
            p.params
                .insert("message".to_string(), Value::from(self.message.clone()));
        }
        if !self.routes.is_empty() {
            p.params
                .insert("routes".to_string(), Value::from(self.routes.clone()));
        }
        self.base.add_params(&mut p.params);
        p
    }

    async fn process(&self, alerts: Vec<Alert>) -> Result<Vec<Alert>, FilterError> {
        let mut out = Vec::new();
        // BTreeMap keeps group emission order deterministic.
        let mut groups: BTreeMap<String, Vec<Alert>> = BTreeMap::new();

        if self.base.all() {
            if !self.base.if_all(&alerts).await? {
                return Ok(alerts);
            }
            for a in alerts {
                let key = self.key_of(&a)?;
                groups.entry(key).or_default().push(a);
            }
        } else {
            for a in alerts {
                if !self.base.if_alert(&a).await? {
                    out.push(a);
                    continue;
                }
                let key = self.key_of(&a)?;
                groups.entry(key).or_default().push(a);
            }
        }

        for (_, group) in groups {
            out.push(self.merge(group));
        }
        Ok(out)
    }
}

pub fn construct(id: &str, p: &Map<String, Value>) -> Result<Arc<dyn Filter>, FilterError> {
    let wrap = |e: params::ParamError| FilterError::construct(id, e);

    let base = BaseFilter::init(id, p)?;

    let orig_by = params::opt_str(p, "by").map_err(wrap)?.unwrap_or_default();
    let by = if orig_by.is_empty() {
        None
    } else {
        Some(
            base.vm()
                .compile(&orig_by)
                .map_err(|e| FilterError::construct(id, format!("by: {e}")))?,
        )
    };

    Ok(Arc::new(GroupFilter {
        by,
        orig_by,
        from: params::opt_str(p, "from").map_err(wrap)?.unwrap_or_default(),
        title: params::opt_str(p, "title").map_err(wrap)?.unwrap_or_default(),
        message: params::opt_str(p, "message").map_err(wrap)?.unwrap_or_default(),
        routes: params::opt_str_vec(p, "routes").map_err(wrap)?.unwrap_or_default(),
        base,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn alert(from: &str, host: &str, title: &str) -> Alert {
        let mut a = Alert::new(from, title);
        a.host = host.to_string();
        a
    }

    #[tokio::test]
    async fn test_universal_key_merges_everything() {
        let f = construct("g", &params(json!({"routes": ["ops"]}))).unwrap();
        let batch = vec![
            alert("m", "h1", "a"),
            alert("m", "h1", "b"),
            alert("m", "h1", "c"),
            alert("m", "h1", "d"),
        ];
        let out = f.process(batch).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sub.len(), 4);
        assert_eq!(out[0].routes, vec!["ops"]);
        assert!(out[0].info.is_empty());
        // Titles differ, so the synthesized default applies.
        assert_eq!(out[0].title, "merged alert");
        assert_eq!(out[0].from, "m");
        assert_eq!(out[0].host, "h1");
    }

    #[tokio::test]
    async fn test_singleton_group_passes_identity() {
        let f = construct("g", &Map::new()).unwrap();
        let a = alert("m", "h", "only");
        let out = f.process(vec![a.clone()]).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "only");
        assert!(out[0].sub.is_empty());
        assert_eq!(out[0].date, a.date);
    }

    #[tokio::test]
    async fn test_group_by_script_key() {
        let f = construct("g", &params(json!({"by": "alert.Host"}))).unwrap();
        let batch = vec![
            alert("m", "h1", "a"),
            alert("m", "h2", "b"),
            alert("m", "h1", "c"),
        ];
        let out = f.process(batch).await.unwrap();
        assert_eq!(out.len(), 2);
        let merged = out.iter().find(|a| !a.sub.is_empty()).unwrap();
        assert_eq!(merged.sub.len(), 2);
        assert_eq!(merged.host, "h1");
        let single = out.iter().find(|a| a.sub.is_empty()).unwrap();
        assert_eq!(single.title, "b");
    }

    #[tokio::test]
    async fn test_divergent_fields_fall_back() {
        let f = construct(
            "g",
            &params(json!({"from": "aggregator", "title": "storm"})),
        )
        .unwrap();
        let batch = vec![alert("a", "h1", "x"), alert("b", "h2", "y")];
        let out = f.process(batch).await.unwrap();
        assert_eq!(out[0].from, "aggregator");
        assert_eq!(out[0].host, "localhost");
        assert_eq!(out[0].title, "storm");

        let f = construct("g", &Map::new()).unwrap();
        let batch = vec![alert("a", "h1", "x"), alert("b", "h2", "y")];
        let out = f.process(batch).await.unwrap();
        assert_eq!(out[0].from, "filter:g");
    }

    #[tokio::test]
    async fn test_non_matching_bypass() {
        let f = construct("g", &params(json!({"if": "alert.From == \"m\""}))).unwrap();
        let batch = vec![
            alert("m", "h", "a"),
            alert("skip", "h", "b"),
            alert("m", "h", "c"),
        ];
        let out = f.process(batch).await.unwrap();
        // One bypassed alert plus one merged group.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].title, "b");
        assert_eq!(out[1].sub.len(), 2);
    }

    #[test]
    fn test_params_round_trip() {
        let src = params(json!({"by": "alert.Host", "routes": ["r1"], "title": "t"}));
        let f = construct("g", &src).unwrap();
        let p = f.params();
        assert_eq!(p.kind, "group");
        let g = construct("g", &p.params).unwrap();
        assert_eq!(g.params().params, p.params);
    }
}
