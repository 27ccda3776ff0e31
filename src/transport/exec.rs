//! `exec` transport: pipes alert JSON to an external command.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

use super::{Transport, TransportError};
use crate::alert::Alert;
use crate::params::{self, PluginParams};

const TRANSPORT_TYPE: &str = "exec";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

struct ExecTransport {
    label: String,
    command: Vec<String>,
    all: bool,
    timeout: Duration,
}

impl ExecTransport {
    async fn exec(&self, input: Vec<u8>) -> Result<(), TransportError> {
        let fail = |e: String| TransportError::deliver(TRANSPORT_TYPE, e);

        let mut child = tokio::process::Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
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
            child.wait().await.map_err(|e| fail(e.to_string()))
        };

        let status = if self.timeout.is_zero() {
            run.await?
        } else {
            tokio::time::timeout(self.timeout, run)
                .await
                .map_err(|_| fail(format!("command timed out after {:?}", self.timeout)))??
        };

        if !status.success() {
            return Err(fail(format!("command exited with {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for ExecTransport {
    fn params(&self) -> PluginParams {
        let mut p = PluginParams::new(TRANSPORT_TYPE);
        p.params
            .insert("command".to_string(), Value::from(self.command.clone()));
        p.params
            .insert("timeout".to_string(), Value::from(self.timeout.as_secs()));
        if !self.label.is_empty() {
            p.params
                .insert("label".to_string(), Value::from(self.label.clone()));
        }
        if self.all {
            p.params.insert("all".to_string(), Value::from(true));
        }
        p
    }

    fn name(&self) -> String {
        if self.label.is_empty() {
            TRANSPORT_TYPE.to_string()
        } else {
            self.label.clone()
        }
    }

    async fn deliver(&self, alerts: &[Alert]) -> Result<(), TransportError> {
        let fail = |e: serde_json::Error| TransportError::deliver(TRANSPORT_TYPE, e);

        if self.all {
            let data = serde_json::to_vec(alerts).map_err(fail)?;
            return self.exec(data).await;
        }

        for a in alerts {
            let data = serde_json::to_vec(a).map_err(fail)?;
            self.exec(data).await?;
        }
        Ok(())
    }
}

pub fn construct(p: &Map<String, Value>) -> Result<Arc<dyn Transport>, TransportError> {
    let wrap = |e: params::ParamError| TransportError::construct(TRANSPORT_TYPE, e);

    let command = params::opt_str_vec(p, "command").map_err(wrap)?.unwrap_or_default();
    if command.is_empty() {
        return Err(TransportError::construct(TRANSPORT_TYPE, "empty command"));
    }

    let timeout = match params::opt_i64(p, "timeout").map_err(wrap)? {
        None => DEFAULT_TIMEOUT,
        Some(secs) if secs >= 0 => Duration::from_secs(secs as u64),
        Some(_) => return Err(TransportError::construct(TRANSPORT_TYPE, "invalid timeout")),
    };

    Ok(Arc::new(ExecTransport {
        label: params::opt_str(p, "label").map_err(wrap)?.unwrap_or_default(),
        command,
        all: params::opt_bool(p, "all").map_err(wrap)?.unwrap_or(false),
        timeout,
    }))
}
