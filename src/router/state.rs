//! Shared mutable router state.
//!
//! One mutex protects everything that changes at runtime: backend URLs,
//! spot readiness, rate-limit clocks, and the accounting counters. Critical
//! sections only read and mutate fields; upstream I/O never runs under the
//! lock.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::router::config::RouterConfig;

/// Which backend served (or is about to serve) a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Spot,
    Serverless,
}

impl Backend {
    pub fn label(self) -> &'static str {
        match self {
            Backend::Spot => "spot",
            Backend::Serverless => "serverless",
        }
    }
}

#[derive(Debug)]
struct Inner {
    serverless_base_url: String,
    serverless_auth_token: String,
    spot_base_url: String,

    spot_ready: bool,
    last_probe_ts: Option<f64>,
    last_probe_err: Option<String>,
    last_check: Option<Instant>,
    last_poke: Option<Instant>,

    req_total: u64,
    req_to_spot: u64,
    req_to_serverless: u64,
    recent_routes: VecDeque<Backend>,

    gpu_seconds_spot: f64,
    gpu_seconds_serverless: f64,
    spot_ready_cumulative: Duration,
    spot_ready_since: Option<Instant>,
}

/// Snapshot of the accounting counters, serialized into `/router/health`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteStats {
    pub total: u64,
    pub spot: u64,
    pub serverless: u64,
    pub pct_spot: f64,
    pub pct_serverless: f64,
    pub window_total: usize,
    pub window_spot: usize,
    pub window_serverless: usize,
    pub gpu_seconds_spot: f64,
    pub gpu_seconds_serverless: f64,
    pub uptime_seconds: f64,
    pub spot_ready_seconds: f64,
}

/// All router state plus the shared upstream HTTP client.
pub struct RouterState {
    pub config: RouterConfig,
    http: reqwest::Client,
    inner: Mutex<Inner>,
    start_time: Instant,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl RouterState {
    pub fn new(config: RouterConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .expect("reqwest client");
        let inner = Inner {
            serverless_base_url: config.serverless_base_url.trim_end_matches('/').to_string(),
            serverless_auth_token: config.serverless_auth_token.clone(),
            spot_base_url: config.spot_base_url.trim_end_matches('/').to_string(),
            spot_ready: false,
            last_probe_ts: None,
            last_probe_err: None,
            last_check: None,
            last_poke: None,
            req_total: 0,
            req_to_spot: 0,
            req_to_serverless: 0,
            recent_routes: VecDeque::with_capacity(config.route_window_size),
            gpu_seconds_spot: 0.0,
            gpu_seconds_serverless: 0.0,
            spot_ready_cumulative: Duration::ZERO,
            spot_ready_since: None,
        };
        Self {
            config,
            http,
            inner: Mutex::new(inner),
            start_time: Instant::now(),
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    // -- URL accessors ----------------------------------------------------

    pub fn serverless_url(&self) -> String {
        self.inner.lock().serverless_base_url.clone()
    }

    pub fn spot_url(&self) -> String {
        self.inner.lock().spot_base_url.clone()
    }

    /// Consistent `(url, token)` pair for the serverless backend.
    pub fn serverless_target(&self) -> (String, String) {
        let inner = self.inner.lock();
        (inner.serverless_base_url.clone(), inner.serverless_auth_token.clone())
    }

    pub fn set_serverless_url(&self, url: &str) {
        self.inner.lock().serverless_base_url = url.trim_end_matches('/').to_string();
        info!("serverless URL updated: {url}");
    }

    pub fn set_serverless_auth_token(&self, token: &str) {
        self.inner.lock().serverless_auth_token = token.to_string();
        info!("serverless auth token updated");
    }

    pub fn set_spot_url(&self, url: &str) {
        self.inner.lock().spot_base_url = url.trim_end_matches('/').to_string();
        info!("spot URL updated: {url}");
    }

    // -- Readiness --------------------------------------------------------

    pub fn is_ready(&self) -> bool {
        self.inner.lock().spot_ready
    }

    /// Record a probe outcome, accumulating spot-ready time on transitions.
    pub fn set_ready(&self, ready: bool, err: Option<String>) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        if inner.spot_ready && !ready {
            if let Some(since) = inner.spot_ready_since.take() {
                inner.spot_ready_cumulative += now.duration_since(since);
            }
        } else if !inner.spot_ready && ready {
            inner.spot_ready_since = Some(now);
        }
        inner.spot_ready = ready;
        inner.last_probe_ts = Some(unix_now());
        inner.last_probe_err = err;
    }

    /// Cumulative spot-ready seconds including any open interval.
    pub fn spot_ready_seconds(&self) -> f64 {
        let inner = self.inner.lock();
        let mut total = inner.spot_ready_cumulative;
        if let Some(since) = inner.spot_ready_since {
            total += since.elapsed();
        }
        total.as_secs_f64()
    }

    // -- Rate-limit clocks ------------------------------------------------

    /// Claim a readiness-check slot; at most one per `check_min_interval`.
    pub fn try_claim_check(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let due = inner
            .last_check
            .map(|last| now.duration_since(last) >= self.config.check_min_interval)
            .unwrap_or(true);
        if due {
            inner.last_check = Some(now);
        }
        due
    }

    /// Claim a poke slot; at most one per `poke_min_interval`.
    pub fn try_claim_poke(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let due = inner
            .last_poke
            .map(|last| now.duration_since(last) >= self.config.poke_min_interval)
            .unwrap_or(true);
        if due {
            inner.last_poke = Some(now);
        }
        due
    }

    // -- Accounting -------------------------------------------------------

    pub fn record_route(&self, backend: Backend) {
        let mut inner = self.inner.lock();
        inner.req_total += 1;
        if inner.recent_routes.len() == self.config.route_window_size {
            inner.recent_routes.pop_front();
        }
        inner.recent_routes.push_back(backend);
        match backend {
            Backend::Spot => inner.req_to_spot += 1,
            Backend::Serverless => inner.req_to_serverless += 1,
        }
    }

    pub fn add_gpu_seconds(&self, backend: Backend, seconds: f64) {
        let mut inner = self.inner.lock();
        match backend {
            Backend::Spot => inner.gpu_seconds_spot += seconds,
            Backend::Serverless => inner.gpu_seconds_serverless += seconds,
        }
    }

    pub fn route_stats(&self) -> RouteStats {
        let (total, spot, serverless, window, gpu_spot, gpu_serverless, ready_seconds) = {
            let inner = self.inner.lock();
            let mut ready = inner.spot_ready_cumulative;
            if let Some(since) = inner.spot_ready_since {
                ready += since.elapsed();
            }
            (
                inner.req_total,
                inner.req_to_spot,
                inner.req_to_serverless,
                inner.recent_routes.iter().copied().collect::<Vec<_>>(),
                inner.gpu_seconds_spot,
                inner.gpu_seconds_serverless,
                ready.as_secs_f64(),
            )
        };
        let window_total = window.len();
        let window_spot = window.iter().filter(|b| **b == Backend::Spot).count();
        RouteStats {
            total,
            spot,
            serverless,
            pct_spot: if total > 0 { 100.0 * spot as f64 / total as f64 } else { 0.0 },
            pct_serverless: if total > 0 {
                100.0 * serverless as f64 / total as f64
            } else {
                0.0
            },
            window_total,
            window_spot,
            window_serverless: window_total - window_spot,
            gpu_seconds_spot: round2(gpu_spot),
            gpu_seconds_serverless: round2(gpu_serverless),
            uptime_seconds: round2(self.start_time.elapsed().as_secs_f64()),
            spot_ready_seconds: round2(ready_seconds),
        }
    }

    /// Full health snapshot served by `/router/health`.
    pub fn snapshot(&self) -> serde_json::Value {
        let (ready, probe_ts, probe_err, serverless_url, spot_url) = {
            let inner = self.inner.lock();
            (
                inner.spot_ready,
                inner.last_probe_ts,
                inner.last_probe_err.clone(),
                inner.serverless_base_url.clone(),
                inner.spot_base_url.clone(),
            )
        };
        json!({
            "skyserve_ready": ready,
            "last_probe_ts": probe_ts,
            "last_probe_err": probe_err,
            "serverless_base_url": serverless_url,
            "skyserve_base_url": spot_url,
            "route_stats": self.route_stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> RouterState {
        RouterState::new(RouterConfig {
            route_window_size: 3,
            check_min_interval: Duration::from_millis(50),
            poke_min_interval: Duration::from_millis(20),
            ..RouterConfig::default()
        })
    }

    #[test]
    fn test_url_updates_strip_trailing_slash() {
        let state = state();
        state.set_serverless_url("https://app.modal.run/");
        assert_eq!(state.serverless_url(), "https://app.modal.run");
        state.set_spot_url("http://1.2.3.4:30001///");
        assert_eq!(state.spot_url(), "http://1.2.3.4:30001");
    }

    #[test]
    fn test_route_counters_and_window() {
        let state = state();
        state.record_route(Backend::Spot);
        state.record_route(Backend::Serverless);
        state.record_route(Backend::Spot);
        state.record_route(Backend::Spot); // evicts the oldest entry

        let stats = state.route_stats();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.spot, 3);
        assert_eq!(stats.serverless, 1);
        assert_eq!(stats.window_total, 3);
        assert_eq!(stats.window_spot, 2);
        assert_eq!(stats.window_serverless, 1);
        assert_eq!(stats.pct_spot, 75.0);
    }

    #[test]
    fn test_exactly_one_backend_counter_per_route() {
        let state = state();
        state.record_route(Backend::Serverless);
        let stats = state.route_stats();
        assert_eq!(stats.spot + stats.serverless, stats.total);
    }

    #[test]
    fn test_spot_ready_transitions() {
        let state = state();
        assert_eq!(state.route_stats().spot_ready_seconds, 0.0);

        state.set_ready(true, None);
        std::thread::sleep(Duration::from_millis(30));
        let open_interval = state.spot_ready_seconds();
        assert!(open_interval > 0.0);

        // true -> true keeps the interval open, does not reset it.
        state.set_ready(true, None);
        std::thread::sleep(Duration::from_millis(10));
        assert!(state.spot_ready_seconds() > open_interval);

        // true -> false folds the interval into the cumulative counter.
        state.set_ready(false, Some("status=503".to_string()));
        let closed = state.spot_ready_seconds();
        assert!(closed >= open_interval);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(state.spot_ready_seconds(), closed);

        // false -> false is a no-op.
        state.set_ready(false, None);
        assert_eq!(state.spot_ready_seconds(), closed);
    }

    #[test]
    fn test_spot_ready_seconds_monotonic() {
        let state = state();
        let mut last = 0.0;
        for flip in [true, false, true, true, false, true] {
            state.set_ready(flip, None);
            std::thread::sleep(Duration::from_millis(5));
            let now = state.spot_ready_seconds();
            assert!(now >= last, "spot_ready_seconds went backwards: {now} < {last}");
            last = now;
        }
    }

    #[test]
    fn test_rate_limit_clocks() {
        let state = state();
        assert!(state.try_claim_check());
        assert!(!state.try_claim_check());
        std::thread::sleep(Duration::from_millis(60));
        assert!(state.try_claim_check());

        assert!(state.try_claim_poke());
        assert!(!state.try_claim_poke());
        std::thread::sleep(Duration::from_millis(25));
        assert!(state.try_claim_poke());
    }

    #[test]
    fn test_snapshot_shape() {
        let state = state();
        state.set_serverless_url("https://svl.example.com");
        state.set_ready(false, Some("connect error".to_string()));
        let snapshot = state.snapshot();
        assert_eq!(snapshot["skyserve_ready"], false);
        assert_eq!(snapshot["serverless_base_url"], "https://svl.example.com");
        assert_eq!(snapshot["last_probe_err"], "connect error");
        assert!(snapshot["route_stats"]["uptime_seconds"].is_number());
        assert_eq!(snapshot["route_stats"]["total"], 0);
    }

    #[test]
    fn test_gpu_seconds_accumulate() {
        let state = state();
        state.add_gpu_seconds(Backend::Spot, 1.25);
        state.add_gpu_seconds(Backend::Spot, 0.25);
        state.add_gpu_seconds(Backend::Serverless, 2.0);
        let stats = state.route_stats();
        assert_eq!(stats.gpu_seconds_spot, 1.5);
        assert_eq!(stats.gpu_seconds_serverless, 2.0);
    }
}
