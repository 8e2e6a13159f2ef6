//! GPU catalog — hardware specs, provider offerings, and pricing.
//!
//! The static tables are the source of truth for serverless pricing and
//! provider GPU identifiers. Spot and on-demand VM prices are optional and
//! come from the workload scheduler's catalog when it is installed; every
//! fetch degrades to an empty map instead of failing the caller.

use std::collections::HashMap;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

/// Hardware facts for a GPU type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuSpec {
    pub short_name: &'static str,
    pub full_name: &'static str,
    pub vram_gb: u32,
    pub arch: &'static str,
}

/// One GPU offering from one serverless provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderGpu {
    pub gpu: &'static str,
    pub provider: &'static str,
    /// Provider-specific identifier (e.g. "nvidia-l4" for Cloud Run).
    pub provider_gpu_id: &'static str,
    /// USD per GPU-hour; 0.0 = unknown / not listed.
    pub price_per_gpu_hour: f64,
    /// Empty = available in all regions.
    pub regions: &'static [&'static str],
}

/// A spot or on-demand VM price resolved from the external catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct VmPrice {
    pub gpu: String,
    pub cloud: String,
    pub price_per_gpu_hour: f64,
    pub instance_type: String,
    /// Cheapest region for this offering.
    pub region: String,
}

pub const GPU_SPECS: &[GpuSpec] = &[
    GpuSpec { short_name: "T4", full_name: "NVIDIA T4", vram_gb: 16, arch: "turing" },
    GpuSpec { short_name: "A10", full_name: "NVIDIA A10", vram_gb: 24, arch: "ampere" },
    GpuSpec { short_name: "A10G", full_name: "NVIDIA A10G", vram_gb: 24, arch: "ampere" },
    GpuSpec { short_name: "L4", full_name: "NVIDIA L4", vram_gb: 24, arch: "ada" },
    GpuSpec { short_name: "A4000", full_name: "NVIDIA RTX A4000", vram_gb: 16, arch: "ampere" },
    GpuSpec { short_name: "A5000", full_name: "NVIDIA RTX A5000", vram_gb: 24, arch: "ampere" },
    GpuSpec { short_name: "A6000", full_name: "NVIDIA RTX A6000", vram_gb: 48, arch: "ampere" },
    GpuSpec { short_name: "RTX4090", full_name: "NVIDIA GeForce RTX 4090", vram_gb: 24, arch: "ada" },
    GpuSpec { short_name: "A40", full_name: "NVIDIA A40", vram_gb: 48, arch: "ampere" },
    GpuSpec { short_name: "L40", full_name: "NVIDIA L40", vram_gb: 48, arch: "ada" },
    GpuSpec { short_name: "L40S", full_name: "NVIDIA L40S", vram_gb: 48, arch: "ada" },
    GpuSpec { short_name: "A100_40GB", full_name: "NVIDIA A100 40GB", vram_gb: 40, arch: "ampere" },
    GpuSpec { short_name: "A100_80GB", full_name: "NVIDIA A100 80GB SXM", vram_gb: 80, arch: "ampere" },
    GpuSpec { short_name: "H100_MIG", full_name: "NVIDIA H100 MIG", vram_gb: 40, arch: "hopper" },
    GpuSpec { short_name: "H100", full_name: "NVIDIA H100 80GB HBM3", vram_gb: 80, arch: "hopper" },
    GpuSpec { short_name: "H200", full_name: "NVIDIA H200", vram_gb: 141, arch: "hopper" },
    GpuSpec { short_name: "B200", full_name: "NVIDIA B200", vram_gb: 192, arch: "blackwell" },
    GpuSpec { short_name: "RTX_PRO_6000", full_name: "NVIDIA RTX PRO 6000", vram_gb: 32, arch: "blackwell" },
];

/// Vendor shorthand → canonical short name.
const GPU_ALIASES: &[(&str, &str)] = &[
    ("A100", "A100_80GB"), // RunPod "A100" is the 80GB variant
    ("4090", "RTX4090"),
];

const CLOUDRUN_L4_REGIONS: &[&str] = &[
    "asia-east1", "asia-northeast1", "asia-south1", "asia-southeast1",
    "europe-west1", "europe-west4", "me-west1",
    "us-central1", "us-east1", "us-east4", "us-west1", "us-west4",
];

const AZURE_GPU_REGIONS: &[&str] = &[
    "australiaeast", "brazilsouth", "canadacentral", "canadaeast",
    "centralindia", "centralus", "eastasia", "eastus", "eastus2",
    "francecentral", "germanywestcentral", "japaneast", "koreacentral",
    "northcentralus", "northeurope", "southcentralus", "southeastasia",
    "swedencentral", "uksouth", "westeurope", "westus", "westus2", "westus3",
];

pub const PROVIDER_GPUS: &[ProviderGpu] = &[
    // Modal
    ProviderGpu { gpu: "T4", provider: "modal", provider_gpu_id: "T4", price_per_gpu_hour: 0.59, regions: &[] },
    ProviderGpu { gpu: "A10G", provider: "modal", provider_gpu_id: "A10G", price_per_gpu_hour: 1.10, regions: &[] },
    ProviderGpu { gpu: "L4", provider: "modal", provider_gpu_id: "L4", price_per_gpu_hour: 0.80, regions: &[] },
    ProviderGpu { gpu: "A40", provider: "modal", provider_gpu_id: "A40", price_per_gpu_hour: 1.10, regions: &[] },
    ProviderGpu { gpu: "L40S", provider: "modal", provider_gpu_id: "L40S", price_per_gpu_hour: 1.60, regions: &[] },
    ProviderGpu { gpu: "A100_40GB", provider: "modal", provider_gpu_id: "A100_40GB", price_per_gpu_hour: 1.82, regions: &[] },
    ProviderGpu { gpu: "A100_80GB", provider: "modal", provider_gpu_id: "A100_80GB", price_per_gpu_hour: 2.78, regions: &[] },
    ProviderGpu { gpu: "H100", provider: "modal", provider_gpu_id: "H100", price_per_gpu_hour: 3.95, regions: &[] },
    ProviderGpu { gpu: "B200", provider: "modal", provider_gpu_id: "B200", price_per_gpu_hour: 5.49, regions: &[] },
    // RunPod serverless, per-second prices converted to hourly
    ProviderGpu { gpu: "A4000", provider: "runpod", provider_gpu_id: "NVIDIA RTX A4000", price_per_gpu_hour: 0.43, regions: &[] },
    ProviderGpu { gpu: "A5000", provider: "runpod", provider_gpu_id: "NVIDIA RTX A5000", price_per_gpu_hour: 0.58, regions: &[] },
    ProviderGpu { gpu: "L4", provider: "runpod", provider_gpu_id: "NVIDIA L4", price_per_gpu_hour: 2.74, regions: &[] },
    ProviderGpu { gpu: "RTX4090", provider: "runpod", provider_gpu_id: "NVIDIA GeForce RTX 4090", price_per_gpu_hour: 1.01, regions: &[] },
    ProviderGpu { gpu: "A6000", provider: "runpod", provider_gpu_id: "NVIDIA RTX A6000", price_per_gpu_hour: 0.79, regions: &[] },
    ProviderGpu { gpu: "L40", provider: "runpod", provider_gpu_id: "NVIDIA L40", price_per_gpu_hour: 1.15, regions: &[] },
    ProviderGpu { gpu: "L40S", provider: "runpod", provider_gpu_id: "NVIDIA L40S", price_per_gpu_hour: 1.58, regions: &[] },
    ProviderGpu { gpu: "A40", provider: "runpod", provider_gpu_id: "NVIDIA A40", price_per_gpu_hour: 0.79, regions: &[] },
    ProviderGpu { gpu: "A100_80GB", provider: "runpod", provider_gpu_id: "NVIDIA A100-SXM4-80GB", price_per_gpu_hour: 1.12, regions: &[] },
    ProviderGpu { gpu: "H100", provider: "runpod", provider_gpu_id: "NVIDIA H100 80GB HBM3", price_per_gpu_hour: 4.97, regions: &[] },
    ProviderGpu { gpu: "H200", provider: "runpod", provider_gpu_id: "NVIDIA H200", price_per_gpu_hour: 0.0, regions: &[] },
    ProviderGpu { gpu: "B200", provider: "runpod", provider_gpu_id: "NVIDIA B200", price_per_gpu_hour: 0.0, regions: &[] },
    // Cloud Run
    ProviderGpu { gpu: "L4", provider: "cloudrun", provider_gpu_id: "nvidia-l4", price_per_gpu_hour: 0.84, regions: CLOUDRUN_L4_REGIONS },
    ProviderGpu { gpu: "RTX_PRO_6000", provider: "cloudrun", provider_gpu_id: "nvidia-rtx-pro-6000", price_per_gpu_hour: 0.84, regions: &["us-central1"] },
    // Azure Container Apps (retail prices, eastus)
    ProviderGpu { gpu: "T4", provider: "azure", provider_gpu_id: "Consumption-GPU-NC8as-T4", price_per_gpu_hour: 0.26, regions: AZURE_GPU_REGIONS },
    ProviderGpu { gpu: "A100_80GB", provider: "azure", provider_gpu_id: "Consumption-GPU-NC24-A100", price_per_gpu_hour: 1.90, regions: AZURE_GPU_REGIONS },
    // Baseten
    ProviderGpu { gpu: "T4", provider: "baseten", provider_gpu_id: "T4", price_per_gpu_hour: 0.63, regions: &[] },
    ProviderGpu { gpu: "L4", provider: "baseten", provider_gpu_id: "L4", price_per_gpu_hour: 0.85, regions: &[] },
    ProviderGpu { gpu: "A10G", provider: "baseten", provider_gpu_id: "A10G", price_per_gpu_hour: 1.21, regions: &[] },
    ProviderGpu { gpu: "A100_80GB", provider: "baseten", provider_gpu_id: "A100", price_per_gpu_hour: 4.00, regions: &[] },
    ProviderGpu { gpu: "H100_MIG", provider: "baseten", provider_gpu_id: "H100_MIG", price_per_gpu_hour: 3.75, regions: &[] },
    ProviderGpu { gpu: "H100", provider: "baseten", provider_gpu_id: "H100", price_per_gpu_hour: 6.50, regions: &[] },
    ProviderGpu { gpu: "B200", provider: "baseten", provider_gpu_id: "B200", price_per_gpu_hour: 9.98, regions: &[] },
    // Cerebrium
    ProviderGpu { gpu: "T4", provider: "cerebrium", provider_gpu_id: "TURING_T4", price_per_gpu_hour: 0.45, regions: &[] },
    ProviderGpu { gpu: "A10", provider: "cerebrium", provider_gpu_id: "AMPERE_A10", price_per_gpu_hour: 1.05, regions: &[] },
    ProviderGpu { gpu: "L4", provider: "cerebrium", provider_gpu_id: "ADA_L4", price_per_gpu_hour: 0.88, regions: &[] },
    ProviderGpu { gpu: "L40", provider: "cerebrium", provider_gpu_id: "ADA_L40", price_per_gpu_hour: 1.69, regions: &[] },
    ProviderGpu { gpu: "A100_40GB", provider: "cerebrium", provider_gpu_id: "AMPERE_A100_40GB", price_per_gpu_hour: 2.10, regions: &[] },
    ProviderGpu { gpu: "A100_80GB", provider: "cerebrium", provider_gpu_id: "AMPERE_A100_80GB", price_per_gpu_hour: 2.92, regions: &[] },
    ProviderGpu { gpu: "H100", provider: "cerebrium", provider_gpu_id: "HOPPER_H100", price_per_gpu_hour: 4.87, regions: &[] },
];

/// Our short name → the scheduler catalog's accelerator name.
const SKYPILOT_GPU_NAMES: &[(&str, &str)] = &[
    ("T4", "T4"),
    ("L4", "L4"),
    ("L40S", "L40S"),
    ("A10G", "A10G"),
    ("A100_40GB", "A100"),
    ("A100_80GB", "A100-80GB"),
    ("H100", "H100"),
    ("H200", "H200"),
    ("B200", "B200"),
];

/// Lookup hardware spec by canonical short name.
pub fn get_gpu_spec(name: &str) -> Option<&'static GpuSpec> {
    GPU_SPECS.iter().find(|s| s.short_name == name)
}

/// Resolve aliases to the canonical short name. `None` if completely unknown.
pub fn normalize_gpu_name(name: &str) -> Option<String> {
    if GPU_SPECS.iter().any(|s| s.short_name == name) {
        return Some(name.to_string());
    }
    GPU_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| canonical.to_string())
}

/// Provider-specific GPU identifier for a canonical short name.
pub fn provider_gpu_id(gpu: &str, provider: &str) -> Option<&'static str> {
    PROVIDER_GPUS
        .iter()
        .find(|e| e.gpu == gpu && e.provider == provider)
        .map(|e| e.provider_gpu_id)
}

/// Full `{short_name: provider_id}` map for one provider.
pub fn provider_gpu_map(provider: &str) -> HashMap<&'static str, &'static str> {
    PROVIDER_GPUS
        .iter()
        .filter(|e| e.provider == provider)
        .map(|e| (e.gpu, e.provider_gpu_id))
        .collect()
}

/// Region availability for a GPU on a provider. Empty = all regions.
pub fn provider_regions(gpu: &str, provider: &str) -> &'static [&'static str] {
    PROVIDER_GPUS
        .iter()
        .find(|e| e.gpu == gpu && e.provider == provider)
        .map(|e| e.regions)
        .unwrap_or(&[])
}

/// Static serverless price for a GPU+provider combo. 0.0 if not listed.
pub fn get_provider_price(gpu: &str, provider: &str) -> f64 {
    PROVIDER_GPUS
        .iter()
        .find(|e| e.gpu == gpu && e.provider == provider)
        .map(|e| e.price_per_gpu_hour)
        .unwrap_or(0.0)
}

/// The scheduler catalog's accelerator name for one of ours.
pub fn to_skypilot_gpu_name(gpu: &str) -> String {
    SKYPILOT_GPU_NAMES
        .iter()
        .find(|(ours, _)| *ours == gpu)
        .map(|(_, theirs)| theirs.to_string())
        .unwrap_or_else(|| gpu.to_string())
}

/// Catalog query result with convenience selectors.
#[derive(Debug, Clone, Default)]
pub struct CatalogQuery {
    pub results: Vec<ProviderGpu>,
    pub spot_prices: HashMap<String, VmPrice>,
}

impl CatalogQuery {
    /// Cheapest priced offering, ignoring entries with unknown price.
    pub fn cheapest(&self) -> Option<&ProviderGpu> {
        self.results
            .iter()
            .filter(|r| r.price_per_gpu_hour > 0.0)
            .min_by(|a, b| a.price_per_gpu_hour.total_cmp(&b.price_per_gpu_hour))
    }

    pub fn by_provider(&self, provider: &str) -> Vec<&ProviderGpu> {
        self.results.iter().filter(|r| r.provider == provider).collect()
    }

    /// Priced entries first, ascending; unpriced entries last.
    pub fn sorted_by_price(&self) -> Vec<&ProviderGpu> {
        let mut entries: Vec<&ProviderGpu> = self.results.iter().collect();
        entries.sort_by(|a, b| {
            (a.price_per_gpu_hour == 0.0, a.price_per_gpu_hour)
                .partial_cmp(&(b.price_per_gpu_hour == 0.0, b.price_per_gpu_hour))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        entries
    }
}

/// Query the static catalog with optional filters.
pub fn query(gpu: Option<&str>, provider: Option<&str>) -> CatalogQuery {
    let results = PROVIDER_GPUS
        .iter()
        .filter(|e| gpu.map(|g| e.gpu == g).unwrap_or(true))
        .filter(|e| provider.map(|p| e.provider == p).unwrap_or(true))
        .cloned()
        .collect();
    CatalogQuery {
        results,
        spot_prices: HashMap::new(),
    }
}

#[derive(Debug, Deserialize)]
struct SkyOffering {
    #[serde(default)]
    accelerator_count: u32,
    #[serde(default)]
    price: Option<f64>,
    #[serde(default)]
    spot_price: Option<f64>,
    #[serde(default)]
    instance_type: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

async fn fetch_sky_offerings(cloud: &str) -> Option<HashMap<String, Vec<SkyOffering>>> {
    let output = Command::new("sky")
        .args(["show-gpus", "--all", "--cloud", cloud, "--format", "json"])
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        debug!("sky show-gpus exited non-zero, skipping external prices");
        return None;
    }
    serde_json::from_slice(&output.stdout).ok()
}

fn cheapest_per_gpu(
    offerings: HashMap<String, Vec<SkyOffering>>,
    cloud: &str,
    pick: impl Fn(&SkyOffering) -> Option<f64>,
) -> HashMap<String, VmPrice> {
    let reverse: HashMap<&str, &str> = SKYPILOT_GPU_NAMES
        .iter()
        .map(|(ours, theirs)| (*theirs, *ours))
        .collect();

    let mut prices: HashMap<String, VmPrice> = HashMap::new();
    for (sky_name, entries) in offerings {
        let Some(our_name) = reverse.get(sky_name.as_str()) else {
            continue;
        };
        for info in entries {
            if info.accelerator_count != 1 {
                continue;
            }
            let Some(price) = pick(&info).filter(|p| p.is_finite() && *p > 0.0) else {
                continue;
            };
            let better = prices
                .get(*our_name)
                .map(|existing| price < existing.price_per_gpu_hour)
                .unwrap_or(true);
            if better {
                prices.insert(
                    our_name.to_string(),
                    VmPrice {
                        gpu: our_name.to_string(),
                        cloud: cloud.to_string(),
                        price_per_gpu_hour: price,
                        instance_type: info.instance_type.clone().unwrap_or_default(),
                        region: info.region.clone().unwrap_or_default(),
                    },
                );
            }
        }
    }
    prices
}

/// Cheapest spot price per GPU from the scheduler catalog.
///
/// Returns an empty map when the scheduler CLI is absent or errors.
pub async fn fetch_spot_prices(cloud: &str) -> HashMap<String, VmPrice> {
    match fetch_sky_offerings(cloud).await {
        Some(offerings) => cheapest_per_gpu(offerings, cloud, |o| o.spot_price),
        None => HashMap::new(),
    }
}

/// Cheapest on-demand price per GPU from the scheduler catalog.
pub async fn fetch_on_demand_prices(cloud: &str) -> HashMap<String, VmPrice> {
    match fetch_sky_offerings(cloud).await {
        Some(offerings) => cheapest_per_gpu(offerings, cloud, |o| o.price),
        None => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_known_and_alias() {
        assert_eq!(normalize_gpu_name("L4").as_deref(), Some("L4"));
        assert_eq!(normalize_gpu_name("A100").as_deref(), Some("A100_80GB"));
        assert_eq!(normalize_gpu_name("4090").as_deref(), Some("RTX4090"));
        assert!(normalize_gpu_name("Z999").is_none());
    }

    #[test]
    fn test_provider_gpu_id_lookup() {
        assert_eq!(provider_gpu_id("L4", "cloudrun"), Some("nvidia-l4"));
        assert_eq!(
            provider_gpu_id("A100_80GB", "runpod"),
            Some("NVIDIA A100-SXM4-80GB")
        );
        assert_eq!(provider_gpu_id("H100", "nosuch"), None);
    }

    #[test]
    fn test_query_filters() {
        let all_l4 = query(Some("L4"), None);
        assert!(all_l4.results.iter().all(|e| e.gpu == "L4"));
        assert!(all_l4.results.len() >= 4);

        let modal_only = query(None, Some("modal"));
        assert!(modal_only.results.iter().all(|e| e.provider == "modal"));
    }

    #[test]
    fn test_cheapest_skips_unpriced() {
        let result = query(Some("H200"), None);
        // H200 on runpod has price 0.0 (unknown) and must never win.
        assert!(result.cheapest().is_none() || result.cheapest().unwrap().price_per_gpu_hour > 0.0);

        let l4 = query(Some("L4"), None);
        let cheapest = l4.cheapest().unwrap();
        assert_eq!(cheapest.provider, "modal");
    }

    #[test]
    fn test_sorted_by_price_puts_unpriced_last() {
        let result = query(Some("B200"), None);
        let sorted = result.sorted_by_price();
        let last = sorted.last().unwrap();
        assert_eq!(last.price_per_gpu_hour, 0.0);
        let first = sorted.first().unwrap();
        assert!(first.price_per_gpu_hour > 0.0);
    }

    #[test]
    fn test_skypilot_name_map() {
        assert_eq!(to_skypilot_gpu_name("A100_80GB"), "A100-80GB");
        assert_eq!(to_skypilot_gpu_name("L4"), "L4");
        // Unmapped names fall through unchanged.
        assert_eq!(to_skypilot_gpu_name("A6000"), "A6000");
    }

    #[test]
    fn test_regions() {
        assert!(provider_regions("L4", "cloudrun").contains(&"us-central1"));
        assert!(provider_regions("L4", "modal").is_empty());
    }

    #[test]
    fn test_cheapest_per_gpu_prefers_lower() {
        let mut offerings = HashMap::new();
        offerings.insert(
            "L4".to_string(),
            vec![
                SkyOffering {
                    accelerator_count: 1,
                    price: Some(1.0),
                    spot_price: Some(0.30),
                    instance_type: Some("g6.xlarge".into()),
                    region: Some("us-east-1".into()),
                },
                SkyOffering {
                    accelerator_count: 1,
                    price: Some(0.9),
                    spot_price: Some(0.25),
                    instance_type: Some("g6.xlarge".into()),
                    region: Some("us-west-2".into()),
                },
                // Multi-GPU offerings are ignored.
                SkyOffering {
                    accelerator_count: 4,
                    price: Some(0.1),
                    spot_price: Some(0.01),
                    instance_type: Some("g6.12xlarge".into()),
                    region: Some("us-west-2".into()),
                },
            ],
        );
        let prices = cheapest_per_gpu(offerings, "aws", |o| o.spot_price);
        let l4 = prices.get("L4").unwrap();
        assert_eq!(l4.price_per_gpu_hour, 0.25);
        assert_eq!(l4.region, "us-west-2");
    }
}
