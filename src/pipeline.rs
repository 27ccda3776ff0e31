//! Pipeline core: the ordered filter list, the route table and the batch
//! handler tying them together.
//!
//! The filter list and the route table are guarded by independent mutexes.
//! Neither lock is ever held while a filter or a transport is executing:
//! the handler works on snapshots taken under the lock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::alert::Alert;
use crate::dispatch::AlertHandler;
use crate::filter::{valid_id, Filter};
use crate::transport::Transport;

/// Pipeline mutation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("duplicate filter id: {0}")]
    DuplicateFilter(String),
    #[error("static filters cannot be removed")]
    StaticFilter,
    #[error("invalid route id: {0}")]
    InvalidRouteId(String),
}

/// The alert pipeline: filters in order, routes by ID.
#[derive(Default)]
pub struct Pipeline {
    filters: Mutex<Vec<Arc<dyn Filter>>>,
    routes: Mutex<BTreeMap<String, Vec<Arc<dyn Transport>>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired dynamic filters. Callers must hold the filter lock.
    fn gc(filters: &mut Vec<Arc<dyn Filter>>) {
        filters.retain(|f| !(f.dynamic() && f.expired()));
    }

    /// Snapshot of the current live filters.
    pub fn filters(&self) -> Vec<Arc<dyn Filter>> {
        let mut filters = self.filters.lock().unwrap();
        Self::gc(&mut filters);
        filters.clone()
    }

    /// Look up a filter by ID.
    pub fn get_filter(&self, id: &str) -> Option<Arc<dyn Filter>> {
        let mut filters = self.filters.lock().unwrap();
        Self::gc(&mut filters);
        filters.iter().find(|f| f.id() == id).cloned()
    }

    /// Add a filter from configuration. Static filters are append-only and
    /// conflict-strict.
    pub fn add_static_filter(&self, filter: Arc<dyn Filter>) -> Result<(), PipelineError> {
        let mut filters = self.filters.lock().unwrap();
        Self::gc(&mut filters);

        if filters.iter().any(|f| f.id() == filter.id()) {
            return Err(PipelineError::DuplicateFilter(filter.id().to_string()));
        }
        filters.push(filter);
        Ok(())
    }

    /// Add or replace a filter at runtime.
    ///
    /// Replacement preserves the position and inherits the dynamic flag of
    /// the outgoing entry; a fresh entry is appended and marked dynamic.
    pub fn put_filter(&self, filter: Arc<dyn Filter>) {
        let mut filters = self.filters.lock().unwrap();
        Self::gc(&mut filters);

        for slot in filters.iter_mut() {
            if slot.id() != filter.id() {
                continue;
            }
            if slot.dynamic() {
                filter.set_dynamic();
            }
            *slot = filter;
            return;
        }

        filter.set_dynamic();
        filters.push(filter);
    }

    /// Remove a dynamic filter by ID. Removing a static filter is refused;
    /// an absent ID is not an error.
    pub fn remove_filter(&self, id: &str) -> Result<(), PipelineError> {
        let mut filters = self.filters.lock().unwrap();

        if filters.iter().any(|f| f.id() == id && !f.dynamic()) {
            return Err(PipelineError::StaticFilter);
        }
        filters.retain(|f| f.id() != id && !(f.dynamic() && f.expired()));
        Ok(())
    }

    /// Add or replace a route.
    pub fn put_route(
        &self,
        id: &str,
        transports: Vec<Arc<dyn Transport>>,
    ) -> Result<(), PipelineError> {
        if !valid_id(id) {
            return Err(PipelineError::InvalidRouteId(id.to_string()));
        }
        self.routes.lock().unwrap().insert(id.to_string(), transports);
        Ok(())
    }

    /// Look up a route by ID.
    pub fn get_route(&self, id: &str) -> Option<Vec<Arc<dyn Transport>>> {
        self.routes.lock().unwrap().get(id).cloned()
    }

    /// Snapshot of the route IDs.
    pub fn route_ids(&self) -> Vec<String> {
        self.routes.lock().unwrap().keys().cloned().collect()
    }

    /// Partition survivors by route and deliver.
    ///
    /// The route table is snapshotted under the lock and released before
    /// any transport runs, so a slow transport never blocks route writers.
    async fn send_alerts(&self, alerts: Vec<Alert>) {
        let routes = self.routes.lock().unwrap().clone();

        let mut routed: BTreeMap<&str, Vec<Alert>> = BTreeMap::new();
        for id in routes.keys() {
            routed.insert(id.as_str(), Vec::new());
        }

        for a in &alerts {
            for id in &a.routes {
                match routed.get_mut(id.as_str()) {
                    Some(bucket) => bucket.push(a.clone()),
                    None => {
                        warn!(route = %id, title = %a.title, "unknown route");
                    }
                }
            }
        }

        for (id, transports) in &routes {
            let batch = routed.remove(id.as_str()).unwrap_or_default();
            if batch.is_empty() {
                continue;
            }

            info!(route = %id, nalerts = batch.len(), "sending alerts");
            for t in transports {
                if let Err(e) = t.deliver(&batch).await {
                    error!(route = %id, transport = %t.name(), error = %e, "failed to send alerts");
                }
            }
        }
    }
}

#[async_trait]
impl AlertHandler for Pipeline {
    /// Run one batch through the filter chain, then fan out the survivors.
    ///
    /// Any filter error aborts the whole cycle without delivering: wrong
    /// filtering must not turn into wrong delivery. The batch is dropped.
    async fn handle(&self, mut batch: Vec<Alert>) {
        if batch.is_empty() {
            return;
        }

        for f in self.filters() {
            if f.disabled() {
                continue;
            }

            if let Err(e) = f.reload() {
                error!(filter = %f.id(), error = %e, "failed to reload filter scripts");
                return;
            }

            batch = match f.process(batch).await {
                Ok(next) => next,
                Err(e) => {
                    error!(filter = %f.id(), error = %e, "failed to filter alerts");
                    return;
                }
            };

            if batch.is_empty() {
                info!(filter = %f.id(), "filters reduced all alerts");
                return;
            }
        }

        self.send_alerts(batch).await;
    }
}
