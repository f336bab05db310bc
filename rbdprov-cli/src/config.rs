//! Cluster inventory loading.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

use rbdprov_core::{CephCluster, CliBinder, ClusterBinder, MockBinder, MockRbd};

/// Cluster inventory: the clusters a scenario may be provisioned on.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Inventory {
    /// How RBD commands reach the clusters
    pub backend: Backend,
    /// RBD tool configuration
    pub tools: ToolsConfig,
    /// Clusters, in inventory order
    pub clusters: Vec<CephCluster>,
}

/// Backend type for RBD commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// `rbd`/`ceph` tools, locally or over SSH per node
    #[default]
    Cli,
    /// In-memory clusters (for dry runs)
    Mock,
}

/// Paths of the command line tools.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub rbd_path: String,
    pub ceph_path: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            rbd_path: "rbd".to_string(),
            ceph_path: "ceph".to_string(),
        }
    }
}

impl Inventory {
    /// Load the inventory from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Inventory file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read inventory file: {}", path.display()))?;

        let inventory: Inventory = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse inventory file")?;

        Ok(inventory)
    }

    /// Look up a cluster by name.
    pub fn cluster(&self, name: &str) -> Result<&CephCluster> {
        self.clusters
            .iter()
            .find(|c| c.name == name)
            .with_context(|| format!("Cluster {} is not in the inventory", name))
    }

    /// Binder for the configured backend.
    ///
    /// With the mock backend the first two clusters are paired as mirror
    /// peers; any further cluster gets a standalone in-memory cluster.
    pub fn binder(&self) -> Arc<dyn ClusterBinder> {
        match self.backend {
            Backend::Cli => Arc::new(
                CliBinder::new().with_paths(self.tools.rbd_path.clone(), self.tools.ceph_path.clone()),
            ),
            Backend::Mock => {
                let mut binder = match self.clusters.as_slice() {
                    [first, second, ..] => MockBinder::pair(&first.name, &second.name).0,
                    _ => MockBinder::new(),
                };
                let skip = if self.clusters.len() >= 2 { 2 } else { 0 };
                for cluster in self.clusters.iter().skip(skip) {
                    binder = binder.with_cluster(cluster.name.clone(), Arc::new(MockRbd::new(&cluster.name)));
                }
                Arc::new(binder)
            }
        }
    }
}
