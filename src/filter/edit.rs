//! `edit` filter: runs a user script against a mutable projection of each
//! matching alert and replaces the alert with the validated result.

use std::sync::Arc;

use async_trait::async_trait;
use rhai::AST;
use serde_json::{Map, Value};

use super::{BaseFilter, Filter, FilterError};
use crate::alert::Alert;
use crate::params::{self, PluginParams};

const FILTER_TYPE: &str = "edit";

#[derive(Debug)]
struct EditFilter {
    base: BaseFilter,
    code: AST,
    orig_code: String,
}

#[async_trait]
impl Filter for EditFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    fn params(&self) -> PluginParams {
        let mut p = PluginParams::new(FILTER_TYPE);
        p.params
            .insert("code".to_string(), Value::from(self.orig_code.clone()));
        self.base.add_params(&mut p.params);
        p
    }

    async fn process(&self, mut alerts: Vec<Alert>) -> Result<Vec<Alert>, FilterError> {
        for a in alerts.iter_mut() {
            if !self.base.if_alert(a).await? {
                continue;
            }
            *a = self
                .base
                .vm()
                .eval_edit(&self.code, a)
                .map_err(|e| FilterError::process(self.base.id(), e))?;
        }
        Ok(alerts)
    }
}

pub fn construct(id: &str, p: &Map<String, Value>) -> Result<Arc<dyn Filter>, FilterError> {
    let code_src =
        params::req_str(p, "code").map_err(|e| FilterError::construct(id, e))?;

    // Editing operates on one alert at a time; batch mode makes no sense here.
    if params::opt_bool(p, "all")
        .map_err(|e| FilterError::construct(id, e))?
        .unwrap_or(false)
    {
        return Err(FilterError::construct(id, "all is not supported"));
    }

    let base = BaseFilter::init(id, p)?;
    let code = base
        .vm()
        .compile(&code_src)
        .map_err(|e| FilterError::construct(id, format!("code: {e}")))?;

    Ok(Arc::new(EditFilter {
        base,
        code,
        orig_code: code_src,
    }))
}
