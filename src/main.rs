//! # mcp-fleet
//!
//! MCP (Model Context Protocol) server answering read-only operational
//! questions about a fleet of managed AKS clusters (three environments x two
//! regions). Runs as a stdio JSON-RPC server — designed to be launched by an
//! AI agent host (e.g. Claude Code).
//!
//! ## Architecture
//!
//! ```text
//! main.rs       — entry point, logging init, cluster map load, server launch
//! config.rs     — YAML cluster map + env-var threshold overrides
//! registry.rs   — cluster ID resolution, lazy per-cluster client sets
//! mcp.rs        — MCP JSON-RPC protocol handler (stdio), cancellation
//! scrub.rs      — sensitive-value redaction (IPs, subscriptions, FQDNs)
//! envelope.rs   — ToolError record, partial-data semantics, fleet merge
//! fanout.rs     — one-or-all cluster dispatch with per-cluster isolation
//! validation.rs — namespace / pool / mode / range validation
//! model.rs      — domain records and severity/state enums
//! units.rs      — Kubernetes quantity parsing
//! clients/      — the five API source traits + kube and ARM implementations
//! tools/        — the six diagnostic tools and their classifiers
//! ```
//!
//! ## Tools
//!
//! - `check_node_pool_pressure` — per-pool request ratios and pressure levels
//! - `get_pod_health` — failed/pending pod diagnostics with failure grouping
//! - `get_kubernetes_upgrade_status` — versions, upgrades, support windows
//! - `get_upgrade_progress` — per-node upgrade state machine
//! - `get_upgrade_duration_metrics` — current timing + historical baselines
//! - `check_pdb_upgrade_risk` — PDB drain blockers, preflight and live

mod clients;
mod config;
mod envelope;
mod fanout;
mod mcp;
mod model;
mod registry;
mod scrub;
mod tools;
mod units;
mod validation;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use crate::config::Thresholds;
use crate::registry::{AppContext, ClusterRegistry};
use crate::scrub::Scrubber;

/// MCP server for AKS fleet diagnostics.
#[derive(Parser)]
#[command(name = "mcp-fleet", version)]
struct Cli {
    /// Path to the cluster map (YAML). Falls back to FLEET_CLUSTER_MAP, then
    /// ./clusters.yaml.
    #[arg(long)]
    clusters: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // JSON logs to stderr; stdout belongs to the JSON-RPC stream.
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    let path = config::cluster_map_path(cli.clusters.as_deref());
    let configs = match config::load_cluster_map(&path) {
        Ok(configs) => configs,
        Err(message) => {
            // Config errors are fatal and scrubbed like everything else.
            let scrubbed = Scrubber::default().scrub_text(&message);
            tracing::error!(error = %scrubbed, "configuration error");
            eprintln!("mcp-fleet: configuration error: {scrubbed}");
            std::process::exit(2);
        }
    };

    let thresholds = Thresholds::from_env();
    let cluster_count = configs.len();
    let ctx = Arc::new(AppContext::new(ClusterRegistry::new(configs), thresholds));

    tracing::info!(
        clusters = cluster_count,
        version = env!("CARGO_PKG_VERSION"),
        "mcp-fleet starting on stdio"
    );

    mcp::run_stdio(ctx).await;

    tracing::info!("mcp-fleet shutting down");
}
