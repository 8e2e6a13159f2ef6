//! HTTP handlers: health, live reconfiguration, and the streaming proxy.

use std::sync::Arc;
use std::time::Instant;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::router::probes;
use crate::router::proxy::{
    build_proxy_url, constant_time_eq, filter_request_headers, filter_response_headers,
};
use crate::router::state::{Backend, RouterState};

fn extract_api_key(req: &HttpRequest, api_key_header: &str) -> String {
    if let Some(key) = req
        .headers()
        .get(api_key_header)
        .and_then(|v| v.to_str().ok())
    {
        return key.to_string();
    }
    if let Some(auth) = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
    {
        if auth.len() > 7 && auth[..7].eq_ignore_ascii_case("bearer ") {
            return auth[7..].to_string();
        }
    }
    String::new()
}

fn is_authorized(state: &RouterState, req: &HttpRequest) -> bool {
    if state.config.api_key.is_empty() {
        return true;
    }
    let provided = extract_api_key(req, &state.config.api_key_header);
    if provided.is_empty() {
        return false;
    }
    constant_time_eq(&provided, &state.config.api_key)
}

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().body("unauthorized")
}

/// `GET /router/health` — re-probe spot, then return the full snapshot.
pub async fn router_health(req: HttpRequest, state: web::Data<RouterState>) -> HttpResponse {
    if !state.config.allow_health_no_auth && !is_authorized(&state, &req) {
        return unauthorized();
    }
    // Refresh spot readiness so cost stats are not stale.
    probes::probe_spot_ready(&state).await;
    HttpResponse::Ok().json(state.snapshot())
}

/// `POST /router/config` — the orchestrator pushes backend URLs here.
pub async fn update_config(
    req: HttpRequest,
    state: web::Data<RouterState>,
    payload: web::Json<Value>,
) -> HttpResponse {
    if !is_authorized(&state, &req) {
        return unauthorized();
    }
    if let Some(url) = payload.get("serverless_url").and_then(Value::as_str) {
        state.set_serverless_url(url);
    }
    if let Some(token) = payload.get("serverless_auth_token").and_then(Value::as_str) {
        state.set_serverless_auth_token(token);
    }
    if let Some(url) = payload.get("spot_url").and_then(Value::as_str) {
        state.set_spot_url(url);
    }
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// Adds the elapsed upstream wall-clock to the backend's GPU seconds when
/// the response stream finishes or the client disconnects.
struct UsageGuard {
    state: Arc<RouterState>,
    backend: Backend,
    t0: Instant,
}

impl Drop for UsageGuard {
    fn drop(&mut self) {
        self.state
            .add_gpu_seconds(self.backend, self.t0.elapsed().as_secs_f64());
    }
}

fn stream_response(
    state: Arc<RouterState>,
    backend: Backend,
    t0: Instant,
    upstream: reqwest::Response,
) -> HttpResponse {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let headers = filter_response_headers(upstream.headers());

    let guard = UsageGuard { state, backend, t0 };
    let body = upstream.bytes_stream().map(move |chunk| {
        // The guard lives inside the stream; dropping the stream on any
        // exit path (completion or client disconnect) settles accounting.
        let _held = &guard;
        chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    });

    let mut builder = HttpResponse::build(status);
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            actix_web::http::header::HeaderName::try_from(name.as_str()),
            actix_web::http::header::HeaderValue::from_bytes(&value),
        ) {
            builder.insert_header((name, value));
        }
    }
    builder.streaming(body)
}

fn upstream_error() -> HttpResponse {
    HttpResponse::BadGateway().body("upstream_error")
}

fn maybe_log_route_stats(state: &RouterState) {
    let stats = state.route_stats();
    if stats.total > 0 && stats.total % 100 == 0 {
        info!(
            "requests={} spot={} ({:.0}%) serverless={} ({:.0}%) spot_ready={}",
            stats.total, stats.spot, stats.pct_spot, stats.serverless, stats.pct_serverless,
            state.is_ready(),
        );
    }
}

fn no_backends() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(json!({ "error": "No backends configured yet" }))
}

async fn send_upstream(
    state: &RouterState,
    method: &reqwest::Method,
    target: url::Url,
    headers: HeaderMap,
    body: &Bytes,
) -> std::result::Result<reqwest::Response, reqwest::Error> {
    let mut request = state
        .http()
        .request(method.clone(), target)
        .headers(headers)
        .timeout(state.config.upstream_timeout);
    if !body.is_empty() {
        request = request.body(body.clone());
    }
    request.send().await
}

/// Retry a failed spot request on the serverless backend.
async fn forward_to_serverless(
    state: web::Data<RouterState>,
    method: &reqwest::Method,
    path: &str,
    query: Option<&str>,
    base_headers: &HeaderMap,
    body: &Bytes,
) -> HttpResponse {
    let (serverless_url, auth_token) = state.serverless_target();
    let target = match build_proxy_url(&serverless_url, path, query) {
        Ok(t) => t,
        Err(e) => {
            warn!("refusing retry with unsafe proxy target: {e}");
            return upstream_error();
        }
    };

    // Swap the client's Authorization for the stored serverless token.
    let mut headers = base_headers.clone();
    headers.remove("authorization");
    if !auth_token.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {auth_token}")) {
            headers.insert("authorization", value);
        }
    }

    // The request counts as a serverless route; the failed spot attempt
    // contributed only GPU-seconds, never a route.
    state.record_route(Backend::Serverless);
    maybe_log_route_stats(&state);

    let t0 = Instant::now();
    match send_upstream(&state, method, target, headers, body).await {
        Ok(upstream) => {
            stream_response(state.clone().into_inner(), Backend::Serverless, t0, upstream)
        }
        Err(e) => {
            state.add_gpu_seconds(Backend::Serverless, t0.elapsed().as_secs_f64());
            warn!("upstream error: {e}");
            upstream_error()
        }
    }
}

/// Catch-all reverse proxy.
pub async fn proxy(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<RouterState>,
) -> HttpResponse {
    let serverless_url = state.serverless_url();
    let spot_url = state.spot_url();

    if serverless_url.is_empty() && spot_url.is_empty() {
        return no_backends();
    }
    if !is_authorized(&state, &req) {
        return unauthorized();
    }

    // Prefer spot (cheaper) when ready, else serverless (fast cold start).
    let backend = if !spot_url.is_empty() && state.is_ready() {
        Backend::Spot
    } else if !serverless_url.is_empty() {
        // Wake spot up while serverless carries the traffic.
        if !spot_url.is_empty() {
            probes::spawn_poke(state.clone().into_inner());
            probes::spawn_ready_check(state.clone().into_inner());
        }
        Backend::Serverless
    } else {
        return HttpResponse::ServiceUnavailable()
            .json(json!({ "error": "Spot backend not ready, no serverless fallback" }));
    };

    // Exactly one backend is credited with the route. Serverless can be
    // recorded now; a spot selection is recorded only once the failover
    // branches below are ruled out, so a request spot fails before the
    // first byte counts solely as the serverless retry that served it.
    if backend == Backend::Serverless {
        state.record_route(Backend::Serverless);
        maybe_log_route_stats(&state);
    }

    let path = req.path().to_string();
    let query = req.query_string();
    let query = (!query.is_empty()).then_some(query);
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    // Base header set: hop-by-hop, Host, and the router's own key dropped;
    // the client's Authorization preserved (spot backends see it).
    let base_headers = filter_request_headers(req.headers(), &state.config.api_key_header, false);

    let backend_base = match backend {
        Backend::Spot => &spot_url,
        Backend::Serverless => &serverless_url,
    };
    let target = match build_proxy_url(backend_base, &path, query) {
        Ok(t) => t,
        Err(e) => {
            warn!("refusing unsafe proxy target: {e}");
            return upstream_error();
        }
    };

    let headers = match backend {
        Backend::Spot => base_headers.clone(),
        Backend::Serverless => {
            let mut headers = base_headers.clone();
            headers.remove("authorization");
            let (_, auth_token) = state.serverless_target();
            if !auth_token.is_empty() {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {auth_token}")) {
                    headers.insert("authorization", value);
                }
            }
            headers
        }
    };

    let t0 = Instant::now();
    let attempt = send_upstream(&state, &method, target, headers, &body).await;

    match attempt {
        Err(e) => {
            state.add_gpu_seconds(backend, t0.elapsed().as_secs_f64());
            if backend == Backend::Spot && !serverless_url.is_empty() {
                warn!("spot request failed ({e}), retrying on serverless");
                state.set_ready(false, Some(e.to_string()));
                return forward_to_serverless(state, &method, &path, query, &base_headers, &body)
                    .await;
            }
            if backend == Backend::Spot {
                state.record_route(Backend::Spot);
                maybe_log_route_stats(&state);
            }
            warn!("upstream error: {e}");
            upstream_error()
        }
        Ok(upstream) => {
            let status = upstream.status().as_u16();
            // 5xx from spot before any byte was streamed: safe to fail over.
            if backend == Backend::Spot && status >= 500 && !serverless_url.is_empty() {
                drop(upstream);
                state.add_gpu_seconds(Backend::Spot, t0.elapsed().as_secs_f64());
                warn!("spot returned {status}, retrying on serverless");
                state.set_ready(false, Some(format!("status={status}")));
                return forward_to_serverless(state, &method, &path, query, &base_headers, &body)
                    .await;
            }
            if backend == Backend::Spot {
                state.record_route(Backend::Spot);
                maybe_log_route_stats(&state);
            }
            stream_response(state.into_inner(), backend, t0, upstream)
        }
    }
}
