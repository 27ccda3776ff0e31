//! `webhook` transport: posts alert batches to a chat-style incoming
//! webhook.
//!
//! Delivery is asynchronous: `deliver` enqueues a message onto a bounded
//! in-process queue (drop-on-full) and a background sender task posts the
//! messages one at a time, honouring `Retry-After` on HTTP 429 and retrying
//! server errors with a fixed pacing delay, up to `max_retry` attempts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rhai::AST;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{Transport, TransportError};
use crate::alert::Alert;
use crate::params::{self, PluginParams};
use crate::script::ScriptVm;

const TRANSPORT_TYPE: &str = "webhook";

const QUEUE_SIZE: usize = 100;
const DEFAULT_MAX_RETRY: i64 = 3;

/// Minimum delay between consecutive posts, also the base retry delay.
const PACING: Duration = Duration::from_millis(1100);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

struct QueuedMessage {
    url: String,
    max_retry: usize,
    payload: Value,
}

struct WebhookTransport {
    label: String,
    url: String,
    max_retry: usize,
    orig_color: String,
    color: Option<AST>,
    vm: ScriptVm,
    // The sender task is spawned lazily on first delivery so construction
    // works outside a runtime (config --test, REST validation).
    queue: Mutex<Option<mpsc::Sender<QueuedMessage>>>,
}

impl WebhookTransport {
    fn attachment_color(&self, a: &Alert) -> String {
        let Some(ast) = &self.color else {
            return String::new();
        };
        match self.vm.eval_alert(ast, a) {
            Ok(v) => v.to_string(),
            Err(e) => {
                warn!(transport = %self.name(), error = %e, "color script failed");
                String::new()
            }
        }
    }

    fn build_payload(&self, alerts: &[Alert]) -> Value {
        let attachments: Vec<Value> = alerts
            .iter()
            .map(|a| {
                let mut att = json!({
                    "fallback": a.to_string(),
                    "title": a.title,
                    "text": a.message,
                });
                let color = self.attachment_color(a);
                if !color.is_empty() {
                    att["color"] = Value::from(color);
                }
                att
            })
            .collect();

        json!({
            "text": format!("{} new alert(s)", alerts.len()),
            "attachments": attachments,
        })
    }

    fn sender(&self) -> mpsc::Sender<QueuedMessage> {
        let mut guard = self.queue.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(QUEUE_SIZE);
        tokio::spawn(sender_loop(rx));
        *guard = Some(tx.clone());
        tx
    }
}

async fn sender_loop(mut rx: mpsc::Receiver<QueuedMessage>) {
    let client = reqwest::Client::new();
    while let Some(msg) = rx.recv().await {
        send_message(&client, &msg).await;
        tokio::time::sleep(PACING).await;
    }
}

async fn send_message(client: &reqwest::Client, msg: &QueuedMessage) {
    let mut retries = 0;

    loop {
        let result = client
            .post(&msg.url)
            .timeout(REQUEST_TIMEOUT)
            .json(&msg.payload)
            .send()
            .await;

        let delay = match result {
            Err(e) => {
                error!(url = %msg.url, error = %e, "webhook request failed");
                PACING
            }
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    info!(url = %msg.url, "webhook delivered");
                    return;
                }
                if status.as_u16() == 429 {
                    warn!(url = %msg.url, "webhook rate limit exceeded");
                    resp.headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or(PACING)
                } else if status.is_server_error() {
                    error!(url = %msg.url, status = %status, "webhook server error");
                    PACING
                } else {
                    // The request itself is bad; retrying will not help.
                    error!(url = %msg.url, status = %status, "webhook rejected request");
                    return;
                }
            }
        };

        if retries >= msg.max_retry {
            error!(url = %msg.url, "webhook gave up");
            return;
        }
        retries += 1;
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn params(&self) -> PluginParams {
        let mut p = PluginParams::new(TRANSPORT_TYPE);
        p.params.insert("url".to_string(), Value::from(self.url.clone()));
        p.params
            .insert("max_retry".to_string(), Value::from(self.max_retry));
        if !self.label.is_empty() {
            p.params
                .insert("label".to_string(), Value::from(self.label.clone()));
        }
        if !self.orig_color.is_empty() {
            p.params
                .insert("color".to_string(), Value::from(self.orig_color.clone()));
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
        let msg = QueuedMessage {
            url: self.url.clone(),
            max_retry: self.max_retry,
            payload: self.build_payload(alerts),
        };

        self.sender()
            .try_send(msg)
            .map_err(|_| TransportError::deliver(TRANSPORT_TYPE, "send queue is full"))
    }
}

pub fn construct(p: &Map<String, Value>) -> Result<Arc<dyn Transport>, TransportError> {
    let wrap = |e: params::ParamError| TransportError::construct(TRANSPORT_TYPE, e);

    let url = params::req_str(p, "url").map_err(wrap)?;
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(TransportError::construct(TRANSPORT_TYPE, "url must be HTTP(S)"));
    }

    let max_retry = match params::opt_i64(p, "max_retry").map_err(wrap)? {
        None => DEFAULT_MAX_RETRY,
        Some(n) if n >= 0 => n,
        Some(_) => return Err(TransportError::construct(TRANSPORT_TYPE, "invalid max_retry")),
    };

    let vm = ScriptVm::new();
    let orig_color = params::opt_str(p, "color").map_err(wrap)?.unwrap_or_default();
    let color = if orig_color.is_empty() {
        None
    } else {
        Some(
            vm.compile(&orig_color)
                .map_err(|e| TransportError::construct(TRANSPORT_TYPE, format!("color: {e}")))?,
        )
    };

    Ok(Arc::new(WebhookTransport {
        label: params::opt_str(p, "label").map_err(wrap)?.unwrap_or_default(),
        url,
        max_retry: max_retry as usize,
        orig_color,
        color,
        vm,
        queue: Mutex::new(None),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    fn transport(v: Value) -> Arc<dyn Transport> {
        construct(&params(v)).unwrap()
    }

    #[test]
    fn test_ctor_validation() {
        assert!(construct(&Map::new()).is_err());
        assert!(construct(&params(json!({"url": "ftp://x"}))).is_err());
        assert!(construct(&params(json!({"url": "https://x", "max_retry": -1}))).is_err());
        assert!(construct(&params(json!({"url": "https://x", "color": "1 +"}))).is_err());
    }

    #[test]
    fn test_payload_shape_and_color_script() {
        let t = transport(json!({
            "url": "https://hooks.example.com/T/B",
            "color": r#"if alert.Stats.freq > 0.5 { "danger" } else { "good" }"#
        }));

        let mut hot = Alert::new("mon", "cpu");
        hot.set_stat("freq", 0.9);
        let mut cool = Alert::new("mon", "idle");
        cool.set_stat("freq", 0.1);

        // Downcast through params/deliver is awkward; rebuild the payload
        // via a second construction instead.
        let w = construct(&t.params().params).unwrap();
        let p = w.params();
        assert_eq!(p.kind, "webhook");

        let inner = WebhookTransport {
            label: String::new(),
            url: "https://hooks.example.com/T/B".to_string(),
            max_retry: 3,
            orig_color: String::new(),
            color: None,
            vm: ScriptVm::new(),
            queue: Mutex::new(None),
        };
        let payload = inner.build_payload(&[hot.clone(), cool.clone()]);
        assert_eq!(payload["text"], "2 new alert(s)");
        assert_eq!(payload["attachments"][0]["title"], "cpu");
        assert!(payload["attachments"][0].get("color").is_none());

        let vm = ScriptVm::new();
        let colored = WebhookTransport {
            color: Some(
                vm.compile(r#"if alert.Stats.freq > 0.5 { "danger" } else { "good" }"#)
                    .unwrap(),
            ),
            vm,
            label: String::new(),
            url: "https://hooks.example.com/T/B".to_string(),
            max_retry: 3,
            orig_color: String::new(),
            queue: Mutex::new(None),
        };
        let payload = colored.build_payload(&[hot, cool]);
        assert_eq!(payload["attachments"][0]["color"], "danger");
        assert_eq!(payload["attachments"][1]["color"], "good");
    }

    #[tokio::test]
    async fn test_deliver_enqueues_without_blocking() {
        let t = transport(json!({"url": "http://127.0.0.1:1/unreachable", "max_retry": 0}));
        // Enqueue succeeds even though the endpoint is unreachable; the
        // sender task deals with the failure in the background.
        t.deliver(&[Alert::new("m", "t")]).await.unwrap();
    }

    #[test]
    fn test_params_round_trip() {
        let t = transport(json!({
            "url": "https://hooks.example.com/T/B",
            "label": "ops chat",
            "max_retry": 5,
            "color": "\"good\""
        }));
        let p = t.params();
        let u = construct(&p.params).unwrap();
        assert_eq!(u.params().params, p.params);
    }
}
