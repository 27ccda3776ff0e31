//! `exec` filter: pipes matching alerts through an external command.
//!
//! Per-alert mode sends one alert as JSON on stdin and replaces it with the
//! single alert decoded from stdout. Batch mode (`all`) sends the JSON array
//! and replaces the whole batch with the decoded array.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use super::{BaseFilter, Filter, FilterError};
use crate::alert::Alert;
use crate::params::{self, PluginParams};

const FILTER_TYPE: &str = "exec";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct ExecFilter {
    base: BaseFilter,
    command: Vec<String>,
    timeout: Duration,
}

impl ExecFilter {
    async fn exec(&self, input: Vec<u8>) -> Result<Vec<u8>, FilterError> {
        let fail = |e: String| FilterError::process(self.base.id(), e);

        let mut child = tokio::process::Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| fail(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| fail("failed to open stdin".to_string()))?;

        let run = async {
            stdin
                .write_all(&input)
                .await
                .map_err(|e| fail(e.to_string()))?;
            drop(stdin);
            child
                .wait_with_output()
                .await
                .map_err(|e| fail(e.to_string()))
        };

        let output = if self.timeout.is_zero() {
            run.await?
        } else {
            tokio::time::timeout(self.timeout, run)
                .await
                .map_err(|_| fail(format!("command timed out after {:?}", self.timeout)))??
        };

        if !output.status.success() {
            return Err(fail(format!("command exited with {}", output.status)));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl Filter for ExecFilter {
    fn base(&self) -> &BaseFilter {
        &self.base
    }

    fn params(&self) -> PluginParams {
        let mut p = PluginParams::new(FILTER_TYPE);
        p.params
            .insert("command".to_string(), Value::from(self.command.clone()));
        p.params
            .insert("timeout".to_string(), Value::from(self.timeout.as_secs()));
        self.base.add_params(&mut p.params);
        p
    }

    async fn process(&self, alerts: Vec<Alert>) -> Result<Vec<Alert>, FilterError> {
        let fail = |e: serde_json::Error| FilterError::process(self.base.id(), e);

        if self.base.all() {
            if !self.base.if_all(&alerts).await? {
                return Ok(alerts);
            }
            let input = serde_json::to_vec(&alerts).map_err(fail)?;
            let output = self.exec(input).await?;
            return serde_json::from_slice::<Vec<Alert>>(&output).map_err(fail);
        }

        let mut processed = Vec::with_capacity(alerts.len());
        for a in alerts {
            if !self.base.if_alert(&a).await? {
                processed.push(a);
                continue;
            }
            let input = serde_json::to_vec(&a).map_err(fail)?;
            let output = self.exec(input).await?;
            processed.push(serde_json::from_slice::<Alert>(&output).map_err(fail)?);
        }
        Ok(processed)
    }
}

pub fn construct(id: &str, p: &Map<String, Value>) -> Result<Arc<dyn Filter>, FilterError> {
    let wrap = |e: params::ParamError| FilterError::construct(id, e);

    let command = params::opt_str_vec(p, "command")
        .map_err(wrap)?
        .unwrap_or_default();
    if command.is_empty() {
        return Err(FilterError::construct(id, "empty command"));
    }

    let timeout = match params::opt_i64(p, "timeout").map_err(wrap)? {
        None => DEFAULT_TIMEOUT,
        Some(secs) if secs >= 0 => Duration::from_secs(secs as u64),
        Some(_) => return Err(FilterError::construct(id, "wrong timeout")),
    };

    Ok(Arc::new(ExecFilter {
        base: BaseFilter::init(id, p)?,
        command,
        timeout,
    }))
}
