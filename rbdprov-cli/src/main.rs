//! # rbdprov
//!
//! Expands sparse RBD test scenarios into full pool/image topologies and
//! provisions them on one Ceph cluster, or on two clusters with mirroring
//! configured between them.
//!
//! ## Usage
//! ```bash
//! rbdprov expand --config scenario.yaml --mirror
//! rbdprov provision --config scenario.yaml --inventory clusters.yaml --cluster ceph-a
//! rbdprov provision --config scenario.yaml --inventory clusters.yaml --cluster ceph-b --secondary --mirror
//! rbdprov mirror --config scenario.yaml --inventory clusters.yaml --primary ceph-a
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use rbdprov_common::LogFormat;
use rbdprov_core::{expand_fresh, ExpandContext, NamePlan, Provisioner, RawConfig};

mod cli;
mod config;

use cli::{Args, Command};
use config::Inventory;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    let format = if args.json_logs { LogFormat::Json } else { LogFormat::Pretty };
    format.init(&args.log_level)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting rbdprov"
    );

    match args.command {
        Command::Expand { config, secondary, mirror } => {
            let raw = load_scenario(&config)?;
            let ctx = ExpandContext {
                is_secondary: secondary,
                is_mirror: mirror,
            };
            let expanded = expand_fresh(&raw, ctx);
            print!("{}", serde_yaml::to_string(&expanded).context("Failed to render expanded config")?);
        }

        Command::Provision { config, inventory, cluster, client_node, secondary, mirror } => {
            let raw = load_scenario(&config)?;
            let inventory = Inventory::load(&inventory)?;
            let cluster = inventory.cluster(&cluster)?;
            let ctx = ExpandContext {
                is_secondary: secondary,
                is_mirror: mirror,
            };

            let handle = Provisioner::new(inventory.binder())
                .initial_rbd_config(cluster, &raw, client_node.as_deref(), ctx, &NamePlan::generate())
                .await
                .map_err(|e| {
                    error!(error = %e, cluster = %cluster.name, "Provisioning failed");
                    e
                })?;

            info!(
                cluster = %handle.cluster.name,
                client = %handle.client.id,
                "Cluster provisioned"
            );
            print!("{}", serde_yaml::to_string(&handle.config).context("Failed to render expanded config")?);
        }

        Command::Mirror { config, inventory, primary } => {
            let raw = load_scenario(&config)?;
            let inventory = Inventory::load(&inventory)?;

            let mirrored = Provisioner::new(inventory.binder())
                .initial_mirror_config(&primary, &inventory.clusters, &raw)
                .await
                .map_err(|e| {
                    error!(error = %e, primary = %primary, "Mirror provisioning failed");
                    e
                })?;

            for (name, handle) in &mirrored.handles {
                info!(cluster = %name, role = %handle.role, "Cluster provisioned");
            }
            let report = serde_json::json!({
                "clusters": mirrored.handles.keys().collect::<Vec<_>>(),
                "output": mirrored.output,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    info!("rbdprov finished");
    Ok(())
}

fn load_scenario(path: &str) -> Result<RawConfig> {
    let raw = RawConfig::load(path).with_context(|| format!("Failed to load scenario {}", path))?;
    info!(config_path = %path, "Scenario loaded");
    Ok(raw)
}
