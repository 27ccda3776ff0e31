//! klaxond - alert aggregation and routing daemon.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! klaxond
//!
//! # Run with an explicit configuration file
//! klaxond -f /etc/klaxon.toml
//!
//! # Validate the configuration and exit
//! klaxond -f klaxon.toml --test
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use klaxon::api::{create_app, ApiState};
use klaxon::config::Config;
use klaxon::dispatch::Dispatcher;
use klaxon::params;
use klaxon::pipeline::Pipeline;
use klaxon::source::{new_source, PostFn, Source};
use klaxon::{new_filter, new_transport};

const DEFAULT_CONFIG_PATH: &str = "/etc/klaxon.toml";

#[derive(Parser, Debug)]
#[command(name = "klaxond")]
#[command(about = "Alert aggregation and routing daemon")]
#[command(version)]
struct CliArgs {
    /// Configuration file name
    #[arg(short = 'f', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Test the configuration and exit
    #[arg(long)]
    test: bool,

    /// Override the configured listen address
    #[arg(long, value_name = "HOST:PORT")]
    addr: Option<String>,
}

/// Task identification for supervisor logging.
#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    Dispatcher,
    Source,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::Dispatcher => write!(f, "Dispatcher"),
            TaskName::Source => write!(f, "Source"),
        }
    }
}

fn init_logging(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.log.level.clone()));

    if cfg.log.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

/// Build the pipeline (routes and static filters) from configuration.
fn build_pipeline(cfg: &Config) -> Result<Arc<Pipeline>> {
    let pipeline = Arc::new(Pipeline::new());

    for (id, transport_params) in &cfg.routes {
        let mut transports = Vec::with_capacity(transport_params.len());
        for p in transport_params {
            let t = new_transport(&p.kind, &p.params)
                .with_context(|| format!("route {id}"))?;
            transports.push(t);
        }
        pipeline
            .put_route(id, transports)
            .with_context(|| format!("route {id}"))?;
    }

    let mut seen = HashSet::new();
    for p in &cfg.filters {
        let id = params::req_str(&p.params, "id")
            .with_context(|| format!("filter of type {}", p.kind))?;
        if !seen.insert(id.clone()) {
            bail!("duplicate filter id: {id}");
        }
        let f = new_filter(&p.kind, &id, &p.params).with_context(|| format!("filter {id}"))?;
        pipeline
            .add_static_filter(f)
            .with_context(|| format!("filter {id}"))?;
    }

    Ok(pipeline)
}

fn build_sources(cfg: &Config) -> Result<Vec<Arc<dyn Source>>> {
    let mut sources = Vec::with_capacity(cfg.sources.len());
    for p in &cfg.sources {
        let s = new_source(&p.kind, &p.params)
            .with_context(|| format!("source of type {}", p.kind))?;
        sources.push(s);
    }
    Ok(sources)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let cfg = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    init_logging(&cfg);

    let pipeline = build_pipeline(&cfg)?;
    let sources = build_sources(&cfg)?;

    let dispatcher = Arc::new(Dispatcher::new(
        cfg.initial_duration(),
        cfg.max_duration(),
        pipeline.clone(),
    ));

    if args.test {
        // All configurations are tested.
        println!("{}: configuration OK", args.config.display());
        return Ok(());
    }

    let server_addr = args.addr.unwrap_or_else(|| cfg.listen_addr());
    let state = ApiState::new(pipeline, dispatcher.clone(), Some(cfg.api_token.clone()));
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .with_context(|| format!("failed to bind to {server_addr}"))?;

    info!(addr = %server_addr, "klaxond starting");

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received ctrl-c, initiating shutdown");
        shutdown_token.cancel();
    });

    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    // Task: HTTP server.
    let http_cancel = cancel_token.clone();
    task_set.spawn(async move {
        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            http_cancel.cancelled().await;
        })
        .await;

        match result {
            Ok(()) => Ok(TaskName::HttpServer),
            Err(e) => Err(anyhow::anyhow!("HTTP server error: {e}")),
        }
    });

    // Task: dispatcher loop.
    let dispatch_cancel = cancel_token.clone();
    let dispatch = dispatcher.clone();
    task_set.spawn(async move {
        dispatch.run(dispatch_cancel).await;
        Ok(TaskName::Dispatcher)
    });

    // Tasks: one per source.
    for source in sources {
        let source_cancel = cancel_token.clone();
        let d = dispatcher.clone();
        let post: PostFn = Arc::new(move |a| d.post(a));
        task_set.spawn(async move {
            source
                .run(source_cancel, post)
                .await
                .map(|_| TaskName::Source)
                .map_err(|e| anyhow::anyhow!(e))
        });
    }

    // Supervisor loop: any task failure cancels the rest.
    let mut failure: Option<anyhow::Error> = None;
    while let Some(result) = task_set.join_next().await {
        match result {
            Ok(Ok(task_name)) => {
                info!(task = %task_name, "task completed");
            }
            Ok(Err(e)) => {
                error!(error = %e, "task failed");
                cancel_token.cancel();
                failure.get_or_insert(e);
            }
            Err(e) => {
                error!(error = %e, "task panicked");
                cancel_token.cancel();
                failure.get_or_insert(anyhow::anyhow!("task panicked: {e}"));
            }
        }
    }

    if let Some(e) = failure {
        return Err(e);
    }

    info!("klaxond shutdown complete");
    Ok(())
}
