//! Router HTTP server assembly.

use actix_web::{web, App, HttpServer};
use tracing::info;

use crate::router::config::RouterConfig;
use crate::router::handlers;
use crate::router::state::RouterState;

/// Wire the router's routes and state into a service config.
///
/// Shared between [`serve`] and the integration tests, so both exercise
/// the exact same routing table.
pub fn configure_app(cfg: &mut web::ServiceConfig, state: web::Data<RouterState>) {
    cfg.app_data(state)
        .route("/router/health", web::get().to(handlers::router_health))
        .route("/router/config", web::post().to(handlers::update_config))
        .default_service(web::route().to(handlers::proxy));
}

/// Run the meta load balancer until the process is killed.
pub async fn serve(config: RouterConfig) -> std::io::Result<()> {
    let port = config.port;
    let state = web::Data::new(RouterState::new(config));
    info!("router listening on 0.0.0.0:{port}");
    HttpServer::new(move || {
        let state = state.clone();
        App::new().configure(move |cfg| configure_app(cfg, state))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
