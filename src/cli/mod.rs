//! Command-line surface. Thin: argument parsing, environment forwarding,
//! and plain-text reporting around the library's operations.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::benchmark;
use crate::catalog;
use crate::cost;
use crate::error::TunaError;
use crate::models::{ColdStartMode, DeployRequest, HybridDeployment};
use crate::orchestrator;
use crate::providers::registry;
use crate::scaling::{load_scaling_policy, ScalingPolicy};
use crate::state::{status, StateStore, SPOT_PROVIDER_NAME};

#[derive(Parser)]
#[command(
    name = "tuna",
    version,
    about = "Hybrid GPU inference: serverless + spot behind a cost-aware router"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy a model on serverless + spot backends behind the router
    Deploy(DeployArgs),
    /// Tear down a deployment (or all of them)
    Destroy(DestroyArgs),
    /// Show component status for a deployment
    Status(StatusArgs),
    /// List recorded deployments
    List(ListArgs),
    /// Run a provider's preflight checks
    Check(CheckArgs),
    /// Show GPU offerings and prices
    ShowGpus(ShowGpusArgs),
    /// Cost dashboard for a deployment
    Cost(CostArgs),
    /// Cold-start benchmarking
    Benchmark(BenchmarkArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ColdStartModeArg {
    #[value(name = "fast_boot")]
    FastBoot,
    #[value(name = "no_fast_boot")]
    NoFastBoot,
}

impl From<ColdStartModeArg> for ColdStartMode {
    fn from(value: ColdStartModeArg) -> Self {
        match value {
            ColdStartModeArg::FastBoot => ColdStartMode::FastBoot,
            ColdStartModeArg::NoFastBoot => ColdStartMode::NoFastBoot,
        }
    }
}

#[derive(Args)]
struct CloudEnvArgs {
    /// Google Cloud project (forwarded as GOOGLE_CLOUD_PROJECT)
    #[arg(long)]
    gcp_project: Option<String>,
    /// Google Cloud region (forwarded as GOOGLE_CLOUD_REGION)
    #[arg(long)]
    gcp_region: Option<String>,
    /// Azure subscription (forwarded as AZURE_SUBSCRIPTION_ID)
    #[arg(long)]
    azure_subscription: Option<String>,
    /// Azure resource group (forwarded as AZURE_RESOURCE_GROUP)
    #[arg(long)]
    azure_resource_group: Option<String>,
    /// Azure region (forwarded as AZURE_REGION)
    #[arg(long)]
    azure_region: Option<String>,
    /// Azure Container Apps environment (forwarded as AZURE_ENVIRONMENT)
    #[arg(long)]
    azure_environment: Option<String>,
}

impl CloudEnvArgs {
    fn apply(&self) {
        let pairs = [
            ("GOOGLE_CLOUD_PROJECT", &self.gcp_project),
            ("GOOGLE_CLOUD_REGION", &self.gcp_region),
            ("AZURE_SUBSCRIPTION_ID", &self.azure_subscription),
            ("AZURE_RESOURCE_GROUP", &self.azure_resource_group),
            ("AZURE_REGION", &self.azure_region),
            ("AZURE_ENVIRONMENT", &self.azure_environment),
        ];
        for (name, value) in pairs {
            if let Some(value) = value {
                std::env::set_var(name, value);
            }
        }
    }
}

#[derive(Args)]
struct DeployArgs {
    /// Model to serve (HF repo id)
    #[arg(long)]
    model: String,
    /// GPU short name (L4, H100, A100_80GB, ...)
    #[arg(long)]
    gpu: String,
    #[arg(long, default_value_t = 1)]
    gpu_count: u32,
    #[arg(long, default_value_t = 1)]
    tp_size: u32,
    #[arg(long, default_value_t = 4096)]
    max_model_len: u32,
    /// Serverless provider; cheapest offering is picked when omitted
    #[arg(long)]
    serverless_provider: Option<String>,
    #[arg(long, default_value = "aws")]
    spot_cloud: String,
    #[arg(long)]
    region: Option<String>,
    #[arg(long, value_enum, default_value = "fast_boot")]
    cold_start_mode: ColdStartModeArg,
    /// Scaling policy YAML; CLI flags below override it
    #[arg(long)]
    scaling_policy: Option<PathBuf>,
    #[arg(long)]
    concurrency: Option<u32>,
    #[arg(long)]
    workers_max: Option<u32>,
    /// Keep at least one replica/worker warm everywhere
    #[arg(long)]
    no_scale_to_zero: bool,
    #[arg(long)]
    service_name: Option<String>,
    /// Grant anonymous invoke on the backends
    #[arg(long)]
    public: bool,
    /// Skip spot + router
    #[arg(long)]
    serverless_only: bool,
    /// Launch the router on a dedicated CPU VM instead of the controller
    #[arg(long)]
    use_different_vm_for_lb: bool,
    #[command(flatten)]
    cloud: CloudEnvArgs,
}

#[derive(Args)]
struct DestroyArgs {
    #[arg(long, conflicts_with = "all", required_unless_present = "all")]
    service_name: Option<String>,
    /// Destroy every active deployment
    #[arg(long)]
    all: bool,
    /// Also delete the Azure environment (slow)
    #[arg(long)]
    azure_cleanup_env: bool,
}

#[derive(Args)]
struct StatusArgs {
    #[arg(long)]
    service_name: String,
}

#[derive(Args)]
struct ListArgs {
    /// Filter by status (active, destroyed, failed)
    #[arg(long)]
    status: Option<String>,
}

#[derive(Args)]
struct CheckArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    gpu: Option<String>,
    #[command(flatten)]
    cloud: CloudEnvArgs,
}

#[derive(Args)]
struct ShowGpusArgs {
    #[arg(long)]
    gpu: Option<String>,
    #[arg(long)]
    provider: Option<String>,
    /// Include spot VM prices from the scheduler catalog
    #[arg(long)]
    spot: bool,
    #[arg(long, default_value = "aws")]
    spot_cloud: String,
}

#[derive(Args)]
struct CostArgs {
    #[arg(long)]
    service_name: String,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BenchScenario {
    FreshCold,
    WarmCold,
    Both,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BenchOutput {
    Table,
    Json,
    Csv,
}

#[derive(Args)]
struct BenchmarkArgs {
    #[arg(long)]
    provider: String,
    #[arg(long)]
    gpu: String,
    #[arg(long)]
    model: String,
    #[arg(long, value_enum, default_value = "both")]
    scenario: BenchScenario,
    #[arg(long, default_value_t = 3)]
    repeat: u32,
    /// Seconds to wait for scale-to-zero between warm runs
    #[arg(long, default_value_t = 300)]
    idle_wait: u64,
    #[arg(long, default_value_t = 512)]
    max_model_len: u32,
    #[arg(long)]
    no_teardown: bool,
    #[arg(long, value_enum, default_value = "table")]
    output: BenchOutput,
}

/// Parse arguments and dispatch. Returns the process exit code.
pub async fn run() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Deploy(args) => cmd_deploy(args).await,
        Command::Destroy(args) => cmd_destroy(args).await,
        Command::Status(args) => cmd_status(args).await,
        Command::List(args) => cmd_list(args).await,
        Command::Check(args) => cmd_check(args).await,
        Command::ShowGpus(args) => cmd_show_gpus(args).await,
        Command::Cost(args) => cmd_cost(args).await,
        Command::Benchmark(args) => cmd_benchmark(args).await,
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

type CmdResult = crate::error::Result<ExitCode>;

fn resolve_serverless_provider(args: &DeployArgs) -> (String, bool) {
    if let Some(provider) = &args.serverless_provider {
        return (provider.clone(), false);
    }
    let gpu = catalog::normalize_gpu_name(&args.gpu).unwrap_or_else(|| args.gpu.clone());
    let query = catalog::query(Some(&gpu), None);
    match query.cheapest() {
        Some(cheapest) => {
            println!("Serverless pricing for {gpu}:");
            for entry in query.sorted_by_price() {
                if entry.price_per_gpu_hour <= 0.0 {
                    continue;
                }
                let mark = if entry.provider == cheapest.provider { "*" } else { " " };
                println!("  {mark} {:<10} ${:.2}/hr", entry.provider, entry.price_per_gpu_hour);
            }
            println!();
            (cheapest.provider.to_string(), true)
        }
        None => ("modal".to_string(), false),
    }
}

async fn cmd_deploy(args: DeployArgs) -> CmdResult {
    args.cloud.apply();

    // Scaling policy: defaults <- YAML <- CLI flags.
    let mut scaling = match &args.scaling_policy {
        Some(path) => load_scaling_policy(path)?,
        None => ScalingPolicy::default(),
    };
    if let Some(concurrency) = args.concurrency {
        scaling.serverless.concurrency = concurrency;
    }
    if let Some(workers_max) = args.workers_max {
        scaling.serverless.workers_max = workers_max;
    }
    if args.no_scale_to_zero {
        scaling.spot.min_replicas = scaling.spot.min_replicas.max(1);
        scaling.serverless.scaledown_window = 300;
        scaling.serverless.workers_min = scaling.serverless.workers_min.max(1);
    }

    let (serverless_provider, auto_selected) = resolve_serverless_provider(&args);

    let mut request = DeployRequest::new(args.model.clone(), args.gpu.clone())
        .with_service_name(args.service_name.clone());
    request.gpu_count = args.gpu_count;
    request.tp_size = args.tp_size;
    request.max_model_len = args.max_model_len;
    request.serverless_provider = serverless_provider.clone();
    request.spot_cloud = args.spot_cloud.clone();
    request.region = args.region.clone();
    request.cold_start_mode = args.cold_start_mode.into();
    request.scaling = scaling;
    request.public = args.public;
    request.serverless_only = args.serverless_only;

    registry::ensure_registered(&serverless_provider)?;
    if !args.serverless_only {
        registry::ensure_registered(SPOT_PROVIDER_NAME)?;
    }

    if args.serverless_only {
        let mut ignored = Vec::new();
        if args.use_different_vm_for_lb {
            ignored.push("--use-different-vm-for-lb".to_string());
        }
        if args.no_scale_to_zero {
            ignored.push("--no-scale-to-zero".to_string());
        }
        if args.spot_cloud != "aws" {
            ignored.push(format!("--spot-cloud {}", args.spot_cloud));
        }
        if !ignored.is_empty() {
            eprintln!("Warning: {} ignored in serverless-only mode", ignored.join(", "));
        }
    }

    println!("Deploying {} on {}", request.model_name, request.gpu);
    println!("Service name: {}", request.service_name);
    if !auto_selected {
        println!("Serverless provider: {}", request.serverless_provider);
    }
    if args.serverless_only {
        println!("Mode: serverless-only");
    } else {
        println!("Spot cloud: {}", request.spot_cloud);
    }
    println!();

    // On Ctrl-C the partial state is persisted so destroy can clean up.
    let store = StateStore::from_env();
    let launch = async {
        if args.serverless_only {
            orchestrator::launch_serverless_only(&mut request).await
        } else {
            orchestrator::launch_hybrid(&mut request, args.use_different_vm_for_lb).await
        }
    };
    let result = tokio::select! {
        result = launch => match result {
            Ok(result) => result,
            Err(e) => {
                eprintln!("Deployment failed: {e}");
                HybridDeployment::default()
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\nDeployment interrupted! Saving partial state for cleanup...");
            HybridDeployment::default()
        }
    };
    store.save(&request, &result).await?;

    if result.total_failure() {
        eprintln!("\nDeployment failed: no components launched successfully.");
        eprintln!("Run: tuna destroy --service-name {}", request.service_name);
        return Ok(ExitCode::FAILURE);
    }

    println!();
    println!("{}", "=".repeat(60));
    println!("DEPLOYMENT RESULT");
    println!("{}", "=".repeat(60));
    println!("  vLLM:       {}", request.vllm_version);
    print_component("Router", &result.router);
    print_component("Serverless", &result.serverless);
    match &result.spot {
        Some(spot) if spot.endpoint_url.is_none() && spot.error.is_none() => {
            println!("  Spot:       launching in background...")
        }
        _ => print_component("Spot", &result.spot),
    }
    println!();
    if let Some(router_url) = &result.router_url {
        if result.router.as_ref().and_then(|r| r.endpoint_url.as_ref()).is_some() {
            println!("All traffic -> {router_url}");
        } else {
            println!("Endpoint -> {router_url}");
        }
    }
    println!("{}", "=".repeat(60));

    if result.has_error() {
        eprintln!(
            "\nSome components failed. To clean up: tuna destroy --service-name {}",
            request.service_name
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn print_component(label: &str, result: &Option<crate::models::DeploymentResult>) {
    let Some(result) = result else { return };
    if let Some(endpoint) = &result.endpoint_url {
        println!("  {label}:{}{endpoint}", " ".repeat(11_usize.saturating_sub(label.len())));
    } else if let Some(error) = &result.error {
        println!("  {label}:{}FAILED - {error}", " ".repeat(11_usize.saturating_sub(label.len())));
    }
}

async fn cmd_destroy(args: DestroyArgs) -> CmdResult {
    let store = StateStore::from_env();

    if args.all {
        let records = store.list(Some(status::ACTIVE)).await?;
        if records.is_empty() {
            println!("No active deployments to destroy.");
            return Ok(ExitCode::SUCCESS);
        }
        println!("Destroying {} active deployment(s)...", records.len());
        let mut failed = Vec::new();
        for record in &records {
            println!("\n--- {} ---", record.service_name);
            let outcome = async {
                registry::ensure_providers_for_record(record)?;
                orchestrator::destroy_hybrid(&record.service_name, Some(record), true).await
            }
            .await;
            match outcome {
                Ok(()) => {
                    store.update_status(&record.service_name, status::DESTROYED).await?;
                    println!("Destroyed: {}", record.service_name);
                }
                Err(e) => {
                    eprintln!("Failed to destroy {}: {e}", record.service_name);
                    failed.push(record.service_name.clone());
                }
            }
        }
        // One shared cleanup after the whole batch.
        orchestrator::cleanup_serve_controller(&crate::spot::sky::SkyCli).await;
        if !failed.is_empty() {
            eprintln!("\nFailed to destroy: {}", failed.join(", "));
            return Ok(ExitCode::FAILURE);
        }
        println!("\nDone.");
        return Ok(ExitCode::SUCCESS);
    }

    let service_name = args.service_name.expect("clap enforces service-name XOR all");
    let record = store.load(&service_name).await?.ok_or_else(|| {
        TunaError::NotFound(format!("no deployment record found for '{service_name}'"))
    })?;

    registry::ensure_providers_for_record(&record)?;
    println!("Destroying deployment: {service_name}");
    orchestrator::destroy_hybrid(&service_name, Some(&record), false).await?;
    store.update_status(&service_name, status::DESTROYED).await?;

    #[cfg(feature = "azure")]
    if args.azure_cleanup_env && record.serverless_provider_name.as_deref() == Some("azure") {
        println!("Deleting Azure environment (this takes 20+ min)...");
        crate::providers::azure::destroy_environment(&record.serverless_metadata).await;
    }
    #[cfg(not(feature = "azure"))]
    if args.azure_cleanup_env {
        eprintln!("Warning: azure support compiled out; skipping environment cleanup");
    }

    println!("Done.");
    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(args: StatusArgs) -> CmdResult {
    let store = StateStore::from_env();
    let record = store.load(&args.service_name).await?.ok_or_else(|| {
        TunaError::NotFound(format!("no deployment record found for '{}'", args.service_name))
    })?;
    registry::ensure_providers_for_record(&record)?;

    let report = orchestrator::status_hybrid(&args.service_name, &record).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_list(args: ListArgs) -> CmdResult {
    let store = StateStore::from_env();
    let records = store.list(args.status.as_deref()).await?;
    if records.is_empty() {
        println!("No deployments recorded.");
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "{:<22} {:<10} {:<28} {:<10} {:<12} {}",
        "SERVICE", "STATUS", "MODEL", "GPU", "SERVERLESS", "CREATED"
    );
    for record in records {
        println!(
            "{:<22} {:<10} {:<28} {:<10} {:<12} {}",
            record.service_name,
            record.status,
            record.model_name,
            record.gpu,
            record.serverless_provider,
            record.created_at,
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_check(args: CheckArgs) -> CmdResult {
    args.cloud.apply();
    registry::ensure_registered(&args.provider)?;
    let provider = registry::get_provider(&args.provider)?;

    // Minimal request just for preflight.
    let default_gpu = if matches!(args.provider.as_str(), "azure" | "cerebrium") {
        "T4"
    } else {
        "L4"
    };
    let mut request = DeployRequest::new("check", args.gpu.as_deref().unwrap_or(default_gpu));
    request.serverless_provider = args.provider.clone();
    request.region = std::env::var("GOOGLE_CLOUD_REGION").ok();

    println!("Checking {}...", args.provider);
    println!();
    let result = provider.preflight(&request).await;
    for check in &result.checks {
        let tag = if check.passed { "PASS" } else { "FAIL" };
        let suffix = if check.auto_fixed { " (auto-fixed)" } else { "" };
        println!("  [{tag}] {}: {}{suffix}", check.name, check.message);
        if !check.passed {
            if let Some(fix) = &check.fix_command {
                println!("         Fix: {fix}");
            }
        }
    }
    println!();
    if result.ok() {
        println!("{}: all checks passed.", args.provider);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}: {} check(s) failed.", args.provider, result.failed().len());
        Ok(ExitCode::FAILURE)
    }
}

async fn cmd_show_gpus(args: ShowGpusArgs) -> CmdResult {
    let gpu_filter = match &args.gpu {
        Some(gpu) => Some(catalog::normalize_gpu_name(gpu).ok_or_else(|| {
            TunaError::Config(format!("unknown GPU '{gpu}'"))
        })?),
        None => None,
    };

    let spot_prices = if args.spot {
        catalog::fetch_spot_prices(&args.spot_cloud).await
    } else {
        HashMap::new()
    };

    let result = catalog::query(gpu_filter.as_deref(), args.provider.as_deref());
    if result.results.is_empty() {
        println!("No offerings match.");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<14} {:<12} {:>12}   {}", "GPU", "PROVIDER", "PRICE", "DETAILS");
    for entry in result.sorted_by_price() {
        let price = if entry.price_per_gpu_hour > 0.0 {
            format!("${:.2}/hr", entry.price_per_gpu_hour)
        } else {
            "-".to_string()
        };
        let details = if entry.regions.is_empty() {
            String::new()
        } else {
            let mut regions = entry.regions[..entry.regions.len().min(3)].join(", ");
            if entry.regions.len() > 3 {
                regions.push_str(", ...");
            }
            regions
        };
        println!("{:<14} {:<12} {:>12}   {details}", entry.gpu, entry.provider, price);
    }

    if args.spot {
        println!();
        if spot_prices.is_empty() {
            println!("(spot prices unavailable: scheduler catalog not reachable)");
        } else {
            println!("{:<14} {:>12}   {:<16} {}", "GPU (spot)", "PRICE", "INSTANCE", "REGION");
            let mut entries: Vec<_> = spot_prices.values().collect();
            entries.sort_by(|a, b| a.gpu.cmp(&b.gpu));
            for price in entries {
                println!(
                    "{:<14} {:>12}   {:<16} {}",
                    price.gpu,
                    format!("${:.2}/hr", price.price_per_gpu_hour),
                    price.instance_type,
                    price.region,
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_cost(args: CostArgs) -> CmdResult {
    let store = StateStore::from_env();
    let record = store.load(&args.service_name).await?.ok_or_else(|| {
        TunaError::NotFound(format!("no deployment record found for '{}'", args.service_name))
    })?;
    registry::ensure_providers_for_record(&record)?;

    if record.is_serverless_only() {
        let price = catalog::get_provider_price(&record.gpu, &record.serverless_provider);
        let report = cost::serverless_only_cost(&record, price);
        println!();
        println!("Cost Dashboard: {} (serverless-only)", record.service_name);
        println!("GPU: {} x{} - Provider: {}", report.gpu, report.gpu_count, report.provider);
        println!("Rate: ${:.4}/GPU-hour", report.serverless_price);
        println!("Uptime: {}", cost::format_duration(report.uptime_seconds));
        println!("Max possible cost: ${:.2}", report.max_possible_cost);
        println!();
        println!("Serverless bills per-second of active compute, not idle time.");
        println!("Actual cost depends on request volume; check the provider's billing dashboard.");
        return Ok(ExitCode::SUCCESS);
    }

    let report = orchestrator::status_hybrid(&args.service_name, &record).await?;
    let route_stats = report
        .get("router")
        .and_then(|r| r.get("route_stats"))
        .cloned();
    let Some(route_stats) = route_stats else {
        eprintln!("Error: could not reach router for '{}'.", args.service_name);
        eprintln!(
            "Check deployment status with: tuna status --service-name {}",
            args.service_name
        );
        return Ok(ExitCode::FAILURE);
    };

    let serverless_price = catalog::get_provider_price(&record.gpu, &record.serverless_provider);
    let spot_prices = catalog::fetch_spot_prices(&record.spot_cloud).await;
    let spot_price = spot_prices
        .get(&record.gpu)
        .map(|p| p.price_per_gpu_hour)
        .unwrap_or(0.0);
    let on_demand_prices = catalog::fetch_on_demand_prices(&record.spot_cloud).await;
    let on_demand_price = on_demand_prices
        .get(&record.gpu)
        .map(|p| p.price_per_gpu_hour)
        .unwrap_or(0.0);

    let report = cost::hybrid_cost(&record, &route_stats, serverless_price, spot_price, on_demand_price);

    println!();
    println!("Cost Dashboard: {}", record.service_name);
    println!(
        "GPU: {} - Serverless: {} - Spot: {}",
        record.gpu, record.serverless_provider, record.spot_cloud
    );
    println!(
        "Uptime: {} - {} requests",
        cost::format_duration(report.uptime_seconds),
        report.total_requests
    );
    println!();
    println!("Actual costs:");
    println!(
        "  Serverless ({}):  ${:.2}   ({:.0} GPU-sec)",
        record.serverless_provider, report.actual_serverless, report.gpu_seconds_serverless
    );
    let spot_note = if report.spot_price == 0.0 { " (spot price unavailable)" } else { "" };
    println!(
        "  Spot ({}):         ${:.2}   ({} ready{spot_note})",
        record.spot_cloud,
        report.actual_spot,
        cost::format_duration(report.spot_ready_seconds)
    );
    println!("  Router CPU:          ${:.2}", report.actual_router);
    println!("  Total:               ${:.2}", report.actual_total);
    println!();
    println!("If you had used:");
    println!("  All serverless:      ${:.2}", report.all_serverless_counterfactual);
    if report.on_demand_price > 0.0 {
        println!("  All on-demand:       ${:.2}", report.all_on_demand_counterfactual);
    } else {
        println!("  All on-demand:       - (on-demand price unavailable)");
    }
    println!();
    if report.no_requests_yet() {
        println!("No requests yet: deployment is fresh.");
    } else if report.savings_vs_serverless > 0.0 && report.all_serverless_counterfactual > 0.0 {
        let pct = report.savings_vs_serverless / report.all_serverless_counterfactual * 100.0;
        println!(
            "You saved ${:.2} vs all-serverless ({pct:.0}% cheaper)",
            report.savings_vs_serverless
        );
    } else if report.actual_total > 0.0 {
        println!(
            "Hybrid cost: ${:.2} - All-serverless would be: ${:.2}",
            report.actual_total, report.all_serverless_counterfactual
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn print_benchmark_results(results: &[benchmark::RunResult], output: BenchOutput) {
    match output {
        BenchOutput::Json => {
            println!("{}", serde_json::to_string_pretty(results).unwrap_or_default())
        }
        BenchOutput::Csv => {
            println!(
                "scenario,provider,gpu,total_s,deploy_time_s,container_boot_s,model_load_s,\
                 health_ready_s,first_inference_s,ttft_s,error"
            );
            for r in results {
                let opt = |v: &Option<f64>| v.map(|x| format!("{x:.2}")).unwrap_or_default();
                println!(
                    "{},{},{},{:.2},{},{},{},{},{},{},{}",
                    r.scenario,
                    r.provider,
                    r.gpu,
                    r.total_s,
                    opt(&r.deploy_time_s),
                    opt(&r.container_boot_s),
                    opt(&r.model_load_s),
                    opt(&r.health_ready_s),
                    opt(&r.first_inference_s),
                    opt(&r.ttft_s),
                    r.error.clone().unwrap_or_default(),
                );
            }
        }
        BenchOutput::Table => {
            let fmt = |v: &Option<f64>| v.map(|x| format!("{x:.1}s")).unwrap_or_else(|| "-".to_string());
            println!(
                "{:<12} {:<8} {:<16} {:>8} {:>10} {:>10} {:>12} {:>10} {:>8}",
                "PROVIDER", "GPU", "SCENARIO", "DEPLOY", "BOOT", "LOAD", "HEALTH", "TTFT", "TOTAL"
            );
            for r in results {
                println!(
                    "{:<12} {:<8} {:<16} {:>8} {:>10} {:>10} {:>12} {:>10} {:>7.1}s",
                    r.provider,
                    r.gpu,
                    r.scenario,
                    fmt(&r.deploy_time_s),
                    fmt(&r.container_boot_s),
                    fmt(&r.model_load_s),
                    fmt(&r.health_ready_s),
                    fmt(&r.ttft_s),
                    r.total_s,
                );
                if let Some(error) = &r.error {
                    println!("    error: {error}");
                }
            }
        }
    }
}

async fn cmd_benchmark(args: BenchmarkArgs) -> CmdResult {
    let store = StateStore::from_env();
    let mut results = Vec::new();

    // For "both": keep the fresh deploy alive so the warm phase can reuse it.
    let keep_for_warm = matches!(args.scenario, BenchScenario::Both);

    if matches!(args.scenario, BenchScenario::FreshCold | BenchScenario::Both) {
        results.extend(
            benchmark::run_fresh_cold_start(
                &store,
                &args.provider,
                &args.gpu,
                &args.model,
                args.max_model_len,
                args.no_teardown || keep_for_warm,
            )
            .await?,
        );
    }

    if matches!(args.scenario, BenchScenario::WarmCold | BenchScenario::Both) {
        let record = benchmark::find_existing_deployment(&store, &args.provider, &args.model).await?;
        match record {
            Some(record) if record.serverless_endpoint.is_some() => {
                let endpoint = record.serverless_endpoint.clone().unwrap_or_default();
                let health_url = format!("{endpoint}/health");
                let runs = benchmark::run_warm_cold_start(
                    &args.provider,
                    &args.gpu,
                    &args.model,
                    &endpoint,
                    &health_url,
                    &record.serverless_metadata,
                    args.repeat,
                    Duration::from_secs(args.idle_wait),
                )
                .await?;
                if let Some(mean) = benchmark::mean_run(&runs) {
                    results.push(mean);
                }
                if !args.no_teardown && keep_for_warm {
                    let latest = store.load(&record.service_name).await?;
                    if let Some(latest) = &latest {
                        registry::ensure_providers_for_record(latest)?;
                    }
                    orchestrator::destroy_hybrid(&record.service_name, latest.as_ref(), false)
                        .await?;
                    store.update_status(&record.service_name, status::DESTROYED).await?;
                }
            }
            _ => {
                if matches!(args.scenario, BenchScenario::WarmCold) {
                    eprintln!(
                        "No active deployment found for {}/{}. Deploy first or use \
                         --scenario fresh-cold.",
                        args.provider, args.model
                    );
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }

    print_benchmark_results(&results, args.output);
    let failed = results.iter().any(|r| r.error.is_some()) || results.is_empty();
    Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
