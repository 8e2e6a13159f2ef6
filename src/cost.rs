//! Cost accounting: actual spend vs counterfactuals, from router counters
//! and catalog prices.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::state::DeploymentRecord;

/// Hourly cost of a dedicated router CPU VM. A colocated router rides on
/// the controller for free.
pub const ROUTER_CPU_COST_PER_HOUR: f64 = 0.04;

/// Cost breakdown for a hybrid deployment.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HybridCostReport {
    pub gpu_seconds_serverless: f64,
    pub gpu_seconds_spot: f64,
    pub spot_ready_seconds: f64,
    pub uptime_seconds: f64,
    pub total_requests: u64,

    pub serverless_price: f64,
    pub spot_price: f64,
    pub on_demand_price: f64,

    pub actual_serverless: f64,
    pub actual_spot: f64,
    pub actual_router: f64,
    pub actual_total: f64,

    /// What the same GPU-seconds would have cost entirely on serverless.
    pub all_serverless_counterfactual: f64,
    /// What a dedicated on-demand VM for the whole uptime would have cost.
    pub all_on_demand_counterfactual: f64,

    pub savings_vs_serverless: f64,
    pub savings_vs_on_demand: f64,
}

impl HybridCostReport {
    pub fn no_requests_yet(&self) -> bool {
        self.total_requests == 0
    }
}

/// Pricing summary for a serverless-only deployment; actual billing is
/// per-second of active compute, so this is an upper bound.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerlessOnlyCostReport {
    pub provider: String,
    pub gpu: String,
    pub gpu_count: u32,
    pub serverless_price: f64,
    pub uptime_seconds: f64,
    pub max_possible_cost: f64,
}

fn stat_f64(stats: &Value, key: &str) -> f64 {
    stats.get(key).and_then(Value::as_f64).unwrap_or(0.0)
}

/// Compute the hybrid cost report from a `route_stats` block and prices.
pub fn hybrid_cost(
    record: &DeploymentRecord,
    route_stats: &Value,
    serverless_price: f64,
    spot_price: f64,
    on_demand_price: f64,
) -> HybridCostReport {
    let gpu_sec_svl = stat_f64(route_stats, "gpu_seconds_serverless");
    let gpu_sec_spot = stat_f64(route_stats, "gpu_seconds_spot");
    let spot_ready_s = stat_f64(route_stats, "spot_ready_seconds");
    let uptime_s = stat_f64(route_stats, "uptime_seconds");
    let total_requests = route_stats.get("total").and_then(Value::as_u64).unwrap_or(0);
    let gpu_count = record.gpu_count.max(1) as f64;

    let colocated = record.router_metadata.get("colocated").map(String::as_str) == Some("true");
    let router_rate = if colocated { 0.0 } else { ROUTER_CPU_COST_PER_HOUR };

    let actual_serverless = (gpu_sec_svl / 3600.0) * serverless_price;
    let actual_spot = (spot_ready_s / 3600.0) * spot_price * gpu_count;
    let actual_router = (uptime_s / 3600.0) * router_rate;
    let actual_total = actual_serverless + actual_spot + actual_router;

    let all_serverless = ((gpu_sec_svl + gpu_sec_spot) / 3600.0) * serverless_price;
    let all_on_demand = (uptime_s / 3600.0) * on_demand_price * gpu_count;

    HybridCostReport {
        gpu_seconds_serverless: gpu_sec_svl,
        gpu_seconds_spot: gpu_sec_spot,
        spot_ready_seconds: spot_ready_s,
        uptime_seconds: uptime_s,
        total_requests,
        serverless_price,
        spot_price,
        on_demand_price,
        actual_serverless,
        actual_spot,
        actual_router,
        actual_total,
        all_serverless_counterfactual: all_serverless,
        all_on_demand_counterfactual: all_on_demand,
        savings_vs_serverless: all_serverless - actual_total,
        savings_vs_on_demand: all_on_demand - actual_total,
    }
}

/// Uptime of a record, from its creation timestamp to now.
pub fn record_uptime_seconds(record: &DeploymentRecord) -> f64 {
    if record.created_at.is_empty() {
        return 0.0;
    }
    DateTime::parse_from_rfc3339(&record.created_at)
        .map(|created| (Utc::now() - created.with_timezone(&Utc)).num_seconds().max(0) as f64)
        .unwrap_or(0.0)
}

/// Pricing summary for serverless-only deployments.
pub fn serverless_only_cost(record: &DeploymentRecord, serverless_price: f64) -> ServerlessOnlyCostReport {
    let uptime_s = record_uptime_seconds(record);
    let gpu_count = record.gpu_count.max(1);
    ServerlessOnlyCostReport {
        provider: record.serverless_provider.clone(),
        gpu: record.gpu.clone(),
        gpu_count,
        serverless_price,
        uptime_seconds: uptime_s,
        max_possible_cost: (uptime_s / 3600.0) * serverless_price * gpu_count as f64,
    }
}

/// Format seconds as a short human-readable duration.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{seconds:.0}s");
    }
    let minutes = seconds / 60.0;
    if minutes < 60.0 {
        return format!("{minutes:.0}m");
    }
    let hours = (minutes / 60.0).floor() as u64;
    let remaining_min = (minutes as u64) % 60;
    format!("{hours}h {remaining_min:02}m")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn record(colocated: bool) -> DeploymentRecord {
        let mut router_metadata = HashMap::new();
        if colocated {
            router_metadata.insert("colocated".to_string(), "true".to_string());
        }
        DeploymentRecord {
            service_name: "tuna-abcd1234".to_string(),
            gpu: "L4".to_string(),
            gpu_count: 1,
            serverless_provider: "modal".to_string(),
            router_metadata,
            ..Default::default()
        }
    }

    fn stats() -> Value {
        json!({
            "total": 1000,
            "gpu_seconds_serverless": 3600.0,
            "gpu_seconds_spot": 7200.0,
            "spot_ready_seconds": 7200.0,
            "uptime_seconds": 36000.0,
        })
    }

    #[test]
    fn test_hybrid_cost_math() {
        // serverless $0.80/h, spot $0.20/h, on-demand $0.60/h
        let report = hybrid_cost(&record(true), &stats(), 0.80, 0.20, 0.60);

        assert!((report.actual_serverless - 0.80).abs() < 1e-9); // 1h × 0.80
        assert!((report.actual_spot - 0.40).abs() < 1e-9); // 2h × 0.20
        assert_eq!(report.actual_router, 0.0); // colocated
        assert!((report.actual_total - 1.20).abs() < 1e-9);
        // 3h of GPU-time at serverless rates
        assert!((report.all_serverless_counterfactual - 2.40).abs() < 1e-9);
        // 10h uptime on an on-demand VM
        assert!((report.all_on_demand_counterfactual - 6.0).abs() < 1e-9);
        assert!((report.savings_vs_serverless - 1.20).abs() < 1e-9);
        assert!(!report.no_requests_yet());
    }

    #[test]
    fn test_router_vm_cost_when_not_colocated() {
        let report = hybrid_cost(&record(false), &stats(), 0.80, 0.20, 0.60);
        // 10h × $0.04
        assert!((report.actual_router - 0.40).abs() < 1e-9);
    }

    #[test]
    fn test_gpu_count_multiplies_spot_and_on_demand() {
        let mut r = record(true);
        r.gpu_count = 4;
        let report = hybrid_cost(&r, &stats(), 0.80, 0.20, 0.60);
        assert!((report.actual_spot - 1.60).abs() < 1e-9);
        assert!((report.all_on_demand_counterfactual - 24.0).abs() < 1e-9);
        // Serverless GPU-seconds already include per-GPU accounting.
        assert!((report.actual_serverless - 0.80).abs() < 1e-9);
    }

    #[test]
    fn test_zero_request_detection() {
        let report = hybrid_cost(&record(true), &json!({ "total": 0 }), 0.80, 0.20, 0.60);
        assert!(report.no_requests_yet());
        assert_eq!(report.actual_total, 0.0);
    }

    #[test]
    fn test_serverless_only_upper_bound() {
        let mut r = record(true);
        r.created_at = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        let report = serverless_only_cost(&r, 0.80);
        assert!((report.max_possible_cost - 1.60).abs() < 0.01);
        assert_eq!(report.gpu, "L4");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(42.0), "42s");
        assert_eq!(format_duration(150.0), "2m");
        assert_eq!(format_duration(9000.0), "2h 30m");
    }
}
