//! `tuna-router` — the standalone meta load balancer process.
//!
//! Runs on the spot controller VM (colocated, the default) or on a
//! dedicated router VM. Configured entirely through the environment; the
//! orchestrator pushes backend URLs over `POST /router/config` once they
//! are known.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use tuna::router::{serve, RouterConfig};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RouterConfig::from_env();
    let port = config.port;
    serve(config)
        .await
        .with_context(|| format!("router failed to serve on port {port}"))
}
