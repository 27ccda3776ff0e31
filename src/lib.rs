//! klaxon: alert aggregation and routing daemon.
//!
//! Heterogeneous ingress sources post alerts into a pooled dispatcher. The
//! dispatcher drains the pool over adaptive time windows and hands each
//! batch to an ordered pipeline of user-configurable filters, which may
//! discard, edit, merge, annotate or re-route alerts. Survivors fan out to
//! named routes, each an ordered list of transports.
//!
//! ## Architecture
//!
//! - **Dispatcher**: adaptive timer loop draining the alert pool
//! - **Pipeline**: filter chain, route table and batch handler
//! - **Filters**: discard, edit, exec, freq, group, route
//! - **Script runtime**: sandboxed rhai expressions for predicates,
//!   grouping keys and alert editing
//! - **REST API**: runtime inspection and mutation of the pipeline

pub mod alert;
pub mod api;
pub mod config;
pub mod dispatch;
pub mod filter;
pub mod params;
pub mod pipeline;
pub mod pool;
pub mod script;
pub mod source;
pub mod transport;

// Re-export the types most integrations need.
pub use alert::{Alert, AlertError};
pub use config::Config;
pub use dispatch::{AlertHandler, Dispatcher};
pub use filter::{new_filter, Filter, FilterError};
pub use params::PluginParams;
pub use pipeline::{Pipeline, PipelineError};
pub use source::{new_source, PostFn, Source, SourceError};
pub use transport::{new_transport, Transport, TransportError};
