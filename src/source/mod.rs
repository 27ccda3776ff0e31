//! Source contract and registry.
//!
//! A source is a concrete ingress producing alerts into the dispatcher
//! pool. Each source runs in its own task until cancelled and may block
//! on I/O freely.

pub mod maildir;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::alert::Alert;

/// Source construction and runtime errors.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no such source type: {0}")]
    UnknownType(String),
    #[error("{name}: {reason}")]
    Construct { name: String, reason: String },
    #[error("{name}: {reason}")]
    Run { name: String, reason: String },
}

impl SourceError {
    pub fn construct(source: &str, reason: impl ToString) -> Self {
        Self::Construct {
            name: source.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Callback used by sources to post generated alerts.
pub type PostFn = Arc<dyn Fn(Alert) + Send + Sync>;

/// The interface source plugins implement.
#[async_trait]
pub trait Source: Send + Sync {
    /// Run until `cancel` fires, calling `post` for each generated alert.
    async fn run(&self, cancel: CancellationToken, post: PostFn) -> Result<(), SourceError>;
}

/// A source constructor registered for a `type` string.
pub type SourceConstructor = fn(&Map<String, Value>) -> Result<Arc<dyn Source>, SourceError>;

static SOURCE_TYPES: OnceLock<HashMap<&'static str, SourceConstructor>> = OnceLock::new();

fn registry() -> &'static HashMap<&'static str, SourceConstructor> {
    SOURCE_TYPES.get_or_init(|| {
        let mut m: HashMap<&'static str, SourceConstructor> = HashMap::new();
        m.insert("maildir", maildir::construct);
        m
    })
}

/// Construct a source of the given type.
pub fn new_source(kind: &str, p: &Map<String, Value>) -> Result<Arc<dyn Source>, SourceError> {
    let ctor = registry()
        .get(kind)
        .ok_or_else(|| SourceError::UnknownType(kind.to_string()))?;
    ctor(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_type() {
        assert!(matches!(
            new_source("telepathy", &Map::new()),
            Err(SourceError::UnknownType(_))
        ));
    }
}
