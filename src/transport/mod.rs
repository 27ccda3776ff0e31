//! Transport contract and registry.
//!
//! A transport is a concrete egress for alerts: a route maps its ID to an
//! ordered list of transports, each delivering independently.

pub mod exec;
pub mod webhook;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::alert::Alert;
use crate::params::PluginParams;

/// Transport construction and delivery errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no such transport type: {0}")]
    UnknownType(String),
    #[error("{transport}: {reason}")]
    Construct { transport: String, reason: String },
    #[error("{transport}: {reason}")]
    Deliver { transport: String, reason: String },
}

impl TransportError {
    pub fn construct(transport: &str, reason: impl ToString) -> Self {
        Self::Construct {
            transport: transport.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn deliver(transport: &str, reason: impl ToString) -> Self {
        Self::Deliver {
            transport: transport.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// The interface transport plugins implement.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Parameters sufficient to re-construct this transport.
    fn params(&self) -> PluginParams;

    /// A descriptive one-line name for logging.
    fn name(&self) -> String;

    /// Deliver a non-empty batch. A transport may merge the batch into one
    /// notification or send alerts one by one.
    async fn deliver(&self, alerts: &[Alert]) -> Result<(), TransportError>;
}

/// A transport constructor registered for a `type` string.
pub type TransportConstructor =
    fn(&Map<String, Value>) -> Result<Arc<dyn Transport>, TransportError>;

static TRANSPORT_TYPES: OnceLock<HashMap<&'static str, TransportConstructor>> = OnceLock::new();

fn registry() -> &'static HashMap<&'static str, TransportConstructor> {
    TRANSPORT_TYPES.get_or_init(|| {
        let mut m: HashMap<&'static str, TransportConstructor> = HashMap::new();
        m.insert("exec", exec::construct);
        m.insert("webhook", webhook::construct);
        m
    })
}

/// Construct a transport of the given type.
pub fn new_transport(
    kind: &str,
    p: &Map<String, Value>,
) -> Result<Arc<dyn Transport>, TransportError> {
    let ctor = registry()
        .get(kind)
        .ok_or_else(|| TransportError::UnknownType(kind.to_string()))?;
    ctor(p)
}
