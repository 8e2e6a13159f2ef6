//! Spot readiness probes and the scale-up poke.
//!
//! The synchronous probe is awaited by `/router/health` so cost timing is
//! never stale. The async variants fire as side effects of serverless-served
//! requests and are rate-limited through the state's claim clocks, so any
//! request volume produces at most one probe per interval.

use std::sync::Arc;

use tracing::debug;

use crate::router::proxy::join_url;
use crate::router::state::RouterState;

/// Probe the spot ready path once and record the outcome.
pub async fn probe_spot_ready(state: &RouterState) {
    let spot_url = state.spot_url();
    if spot_url.is_empty() {
        return;
    }
    let ready_url = join_url(&spot_url, &state.config.ready_path);
    let response = state
        .http()
        .get(&ready_url)
        .timeout(state.config.probe_timeout)
        .send()
        .await;
    match response {
        Ok(r) if r.status().is_success() => state.set_ready(true, None),
        Ok(r) => state.set_ready(false, Some(format!("status={}", r.status().as_u16()))),
        Err(e) => state.set_ready(false, Some(e.to_string())),
    }
}

/// Kick a background readiness probe, at most once per check interval.
pub fn spawn_ready_check(state: Arc<RouterState>) {
    if state.spot_url().is_empty() || !state.try_claim_check() {
        return;
    }
    tokio::spawn(async move {
        probe_spot_ready(&state).await;
    });
}

/// Poke the spot wake path so it scales up while serverless serves,
/// at most once per poke interval.
pub fn spawn_poke(state: Arc<RouterState>) {
    let spot_url = state.spot_url();
    if spot_url.is_empty() || !state.try_claim_poke() {
        return;
    }
    let poke_url = join_url(&spot_url, &state.config.poke_path);
    let timeout = state.config.poke_timeout;
    let http = state.http().clone();
    tokio::spawn(async move {
        if let Err(e) = http.get(&poke_url).timeout(timeout).send().await {
            debug!("spot poke failed (expected while cold): {e}");
        }
    });
}
