//! Router configuration, read once from the environment at startup.

use std::time::Duration;

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y"),
        Err(_) => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Everything the router reads from its environment.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Initial backend URLs; both may arrive later via `/router/config`.
    pub serverless_base_url: String,
    pub serverless_auth_token: String,
    pub spot_base_url: String,

    /// Path probed to decide spot readiness.
    pub ready_path: String,
    /// Path poked to trigger spot scale-up.
    pub poke_path: String,

    pub probe_timeout: Duration,
    pub poke_timeout: Duration,
    pub connect_timeout: Duration,
    pub upstream_timeout: Duration,

    pub check_min_interval: Duration,
    pub poke_min_interval: Duration,

    /// Pre-shared key; empty disables authentication.
    pub api_key: String,
    pub api_key_header: String,
    pub allow_health_no_auth: bool,

    pub route_window_size: usize,
    pub port: u16,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            serverless_base_url: String::new(),
            serverless_auth_token: String::new(),
            spot_base_url: String::new(),
            ready_path: "/health".to_string(),
            poke_path: "/health".to_string(),
            probe_timeout: Duration::from_secs_f64(1.0),
            poke_timeout: Duration::from_secs_f64(0.3),
            connect_timeout: Duration::from_secs_f64(2.0),
            upstream_timeout: Duration::from_secs_f64(210.0),
            check_min_interval: Duration::from_secs_f64(1.0),
            poke_min_interval: Duration::from_secs_f64(0.5),
            api_key: String::new(),
            api_key_header: "x-api-key".to_string(),
            allow_health_no_auth: false,
            route_window_size: 200,
            port: 8080,
        }
    }
}

impl RouterConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            serverless_base_url: env_str("SERVERLESS_BASE_URL", "").trim_end_matches('/').to_string(),
            serverless_auth_token: env_str("SERVERLESS_AUTH_TOKEN", ""),
            spot_base_url: env_str("SKYSERVE_BASE_URL", "").trim_end_matches('/').to_string(),
            ready_path: env_str("SKYSERVE_READY_PATH", &defaults.ready_path),
            poke_path: env_str("SKYSERVE_POKE_PATH", &defaults.poke_path),
            probe_timeout: Duration::from_secs_f64(env_f64("PROBE_TIMEOUT_SECONDS", 1.0)),
            poke_timeout: Duration::from_secs_f64(env_f64("POKE_TIMEOUT_SECONDS", 0.3)),
            connect_timeout: Duration::from_secs_f64(env_f64("CONNECT_TIMEOUT_SECONDS", 2.0)),
            upstream_timeout: Duration::from_secs_f64(env_f64("UPSTREAM_TIMEOUT_SECONDS", 210.0)),
            check_min_interval: Duration::from_secs_f64(env_f64("CHECK_MIN_INTERVAL_SECONDS", 1.0)),
            poke_min_interval: Duration::from_secs_f64(env_f64("POKE_MIN_INTERVAL_SECONDS", 0.5)),
            api_key: env_str("API_KEY", ""),
            api_key_header: env_str("API_KEY_HEADER", &defaults.api_key_header).to_lowercase(),
            allow_health_no_auth: env_bool("ALLOW_HEALTH_NO_AUTH", false),
            route_window_size: env_usize("ROUTE_WINDOW_SIZE", 200),
            port: env_str("PORT", "8080").parse().unwrap_or(8080),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RouterConfig::default();
        assert_eq!(config.ready_path, "/health");
        assert_eq!(config.api_key_header, "x-api-key");
        assert_eq!(config.route_window_size, 200);
        assert_eq!(config.upstream_timeout, Duration::from_secs(210));
        assert!(!config.allow_health_no_auth);
    }
}
