//! Adaptive dispatch loop.
//!
//! The [`Dispatcher`] pools posted alerts and periodically drains them into
//! an [`AlertHandler`]. Under burst load the drain interval doubles up to a
//! maximum, collapsing alert storms into fewer notifications; after an
//! empty drain it snaps back to the initial interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::alert::Alert;
use crate::pool::AlertPool;

/// Default initial and maximum drain interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Consumer of drained batches.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    async fn handle(&self, batch: Vec<Alert>);
}

/// Accepts and pools alerts, then dispatches them periodically.
pub struct Dispatcher {
    pool: AlertPool,
    init_interval: Duration,
    max_interval: Duration,
    handler: Arc<dyn AlertHandler>,
}

impl Dispatcher {
    /// Create a dispatcher. `init` is clamped to at least one second and
    /// `max` to at least `init`.
    pub fn new(init: Duration, max: Duration, handler: Arc<dyn AlertHandler>) -> Self {
        let init = init.max(MIN_INTERVAL);
        let max = max.max(init);
        Self {
            pool: AlertPool::new(),
            init_interval: init,
            max_interval: max,
            handler,
        }
    }

    /// Put an alert into the pool. Never blocks on the handler.
    pub fn post(&self, a: Alert) {
        self.pool.put(a);
    }

    /// A deep copy of the currently pooled alerts.
    pub fn peek(&self) -> Vec<Alert> {
        self.pool.peek()
    }

    /// Run the dispatch loop until `cancel` fires.
    ///
    /// Handler invocations are strictly serialized and never run while the
    /// pool lock is held. On cancellation, one final drain happens if the
    /// pool is non-empty.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut current = self.init_interval;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Process pooled alerts before quitting, if any.
                    if self.pool.is_empty() {
                        return;
                    }
                }
                _ = tokio::time::sleep(current) => {}
            }

            let batch = self.pool.take();
            if batch.is_empty() {
                current = self.init_interval;
                continue;
            }

            debug!(nalerts = batch.len(), interval = ?current, "dispatching batch");
            self.handler.handle(batch).await;

            current = (current * 2).min(self.max_interval);
        }
    }
}
