//! `discard` filter: drops matching alerts.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{BaseFilter, Filter, FilterError};
use crate::alert::Alert;
use crate::params::PluginParams;

const FILTER_TYPE: &str = "discard";

#[derive(Debug)]
struct DiscardFilter {
    base: BaseFilter,
}

#[async_trait]
impl Filter for DiscardFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    fn params(&self) -> PluginParams {
        let mut p = PluginParams::new(FILTER_TYPE);
        self.base.add_params(&mut p.params);
        p
    }

    async fn process(&self, alerts: Vec<Alert>) -> Result<Vec<Alert>, FilterError> {
        if self.base.all() {
            if self.base.if_all(&alerts).await? {
                return Ok(Vec::new());
            }
            return Ok(alerts);
        }

        let mut kept = Vec::with_capacity(alerts.len());
        for a in alerts {
            if !self.base.if_alert(&a).await? {
                kept.push(a);
            }
        }
        Ok(kept)
    }
}

pub fn construct(id: &str, p: &Map<String, Value>) -> Result<Arc<dyn Filter>, FilterError> {
    Ok(Arc::new(DiscardFilter {
        base: BaseFilter::init(id, p)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn test_discard_matching() {
        let f = construct("d", &params(json!({"if": "alert.From == \"noisy\""}))).unwrap();
        let batch = vec![Alert::new("noisy", "a"), Alert::new("quiet", "b")];
        let out = f.process(batch).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].from, "quiet");
    }

    #[tokio::test]
    async fn test_discard_without_condition_drops_everything() {
        let f = construct("d", &Map::new()).unwrap();
        let out = f.process(vec![Alert::new("m", "a")]).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_discard_all_mode() {
        let f = construct("d", &params(json!({"all": true, "if": "alerts.len() >= 2"})))
            .unwrap();
        let big = vec![Alert::new("m", "a"), Alert::new("m", "b")];
        assert!(f.process(big).await.unwrap().is_empty());

        let small = vec![Alert::new("m", "a")];
        assert_eq!(f.process(small).await.unwrap().len(), 1);
    }

    #[test]
    fn test_params_round_trip() {
        let src = params(json!({"label": "gate", "if": "alert.From == \"x\""}));
        let f = construct("d", &src).unwrap();
        let p = f.params();
        assert_eq!(p.kind, "discard");
        let g = construct("d", &p.params).unwrap();
        assert_eq!(g.params().params, p.params);
    }
}
