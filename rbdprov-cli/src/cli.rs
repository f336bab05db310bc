//! Command-line argument parsing.

use clap::{Parser, Subcommand};

/// rbdprov - RBD test topology provisioner
#[derive(Parser, Debug)]
#[command(name = "rbdprov")]
#[command(about = "rbdprov - Expand RBD test scenarios and provision them on Ceph clusters")]
#[command(version)]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "RBDPROV_LOG_LEVEL")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the expanded topology of a scenario without touching any cluster
    Expand {
        /// Path to the scenario file (YAML or JSON)
        #[arg(short, long)]
        config: String,

        /// Expand for the secondary side of a mirror pair
        #[arg(long)]
        secondary: bool,

        /// Expand as part of a mirror setup (journal features, image split)
        #[arg(long)]
        mirror: bool,
    },

    /// Provision a scenario on one cluster
    Provision {
        /// Path to the scenario file (YAML or JSON)
        #[arg(short, long)]
        config: String,

        /// Path to the cluster inventory
        #[arg(short, long)]
        inventory: String,

        /// Cluster name from the inventory
        #[arg(long)]
        cluster: String,

        /// Node to run RBD commands from (first client node if not set)
        #[arg(long)]
        client_node: Option<String>,

        /// Provision the secondary side of a mirror pair
        #[arg(long)]
        secondary: bool,

        /// Provision as part of a mirror setup (journal features, image split)
        #[arg(long)]
        mirror: bool,
    },

    /// Provision a scenario on two clusters and mirror them
    Mirror {
        /// Path to the scenario file (YAML or JSON)
        #[arg(short, long)]
        config: String,

        /// Path to the cluster inventory
        #[arg(short, long)]
        inventory: String,

        /// Name of the primary cluster
        #[arg(long)]
        primary: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_role_flags() {
        let args = Args::try_parse_from([
            "rbdprov", "provision", "-c", "s.yaml", "-i", "inv.yaml", "--cluster", "ceph-b", "--secondary", "--mirror",
        ])
        .unwrap();
        match args.command {
            Command::Provision { cluster, secondary, mirror, client_node, .. } => {
                assert_eq!(cluster, "ceph-b");
                assert!(secondary);
                assert!(mirror);
                assert_eq!(client_node, None);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_provision_defaults_to_primary() {
        let args = Args::try_parse_from(["rbdprov", "provision", "-c", "s.yaml", "-i", "inv.yaml", "--cluster", "ceph-a"])
            .unwrap();
        assert!(matches!(
            args.command,
            Command::Provision { secondary: false, mirror: false, .. }
        ));
    }
}
