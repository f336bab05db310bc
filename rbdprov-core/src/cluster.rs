//! Cluster inventory and binding a client node to an RBD binding.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

use crate::binding::{LocalRunner, MockRbd, RbdBinding, RbdCli, SshRunner};
use crate::error::{OperationError, Result};

/// Role name of the nodes RBD commands are run from.
pub const CLIENT_ROLE: &str = "client";

/// A node of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier, unique within its cluster
    pub id: String,
    /// Hostname or address used to reach the node
    pub hostname: String,
    /// Roles (`client`, `mon`, `osd`, ...)
    #[serde(default)]
    pub roles: Vec<String>,
    /// SSH user; commands are run locally when absent
    #[serde(default)]
    pub ssh_user: Option<String>,
}

impl Node {
    /// Create a new node reached locally.
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            ssh_user: None,
        }
    }

    pub fn with_ssh_user(mut self, user: impl Into<String>) -> Self {
        self.ssh_user = Some(user.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// A Ceph cluster as described by the test inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CephCluster {
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl CephCluster {
    /// Create a new cluster without nodes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn get_node_by_id(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Nodes carrying `role`, in inventory order.
    pub fn get_nodes(&self, role: &str) -> Vec<&Node> {
        self.nodes.iter().filter(|n| n.has_role(role)).collect()
    }

    /// The node named by `client_node`, else the first node with the client role.
    pub fn resolve_client(&self, client_node: Option<&str>) -> Result<&Node> {
        let node = match client_node {
            Some(id) => self.get_node_by_id(id).ok_or_else(|| {
                OperationError::PreconditionMissing(format!(
                    "node {} not found in cluster {}",
                    id, self.name
                ))
            }),
            None => self.get_nodes(CLIENT_ROLE).into_iter().next().ok_or_else(|| {
                OperationError::PreconditionMissing(format!(
                    "cluster {} has no node with role {}",
                    self.name, CLIENT_ROLE
                ))
            }),
        };
        if let Err(e) = &node {
            error!(cluster = %self.name, error = %e, "Client node resolution failed");
        }
        node
    }
}

/// Turns a cluster's client node into a binding that runs RBD commands there.
pub trait ClusterBinder: Send + Sync {
    fn bind(&self, cluster: &CephCluster, node: &Node) -> Result<Arc<dyn RbdBinding>>;
}

/// Binds to the `rbd`/`ceph` command line tools on the node, over SSH when
/// the node has an SSH user.
#[derive(Debug, Clone)]
pub struct CliBinder {
    rbd_path: String,
    ceph_path: String,
}

impl CliBinder {
    /// Create a new CLI binder using the tools found on `PATH`.
    pub fn new() -> Self {
        Self {
            rbd_path: "rbd".to_string(),
            ceph_path: "ceph".to_string(),
        }
    }

    pub fn with_paths(mut self, rbd_path: impl Into<String>, ceph_path: impl Into<String>) -> Self {
        self.rbd_path = rbd_path.into();
        self.ceph_path = ceph_path.into();
        self
    }
}

impl Default for CliBinder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterBinder for CliBinder {
    fn bind(&self, cluster: &CephCluster, node: &Node) -> Result<Arc<dyn RbdBinding>> {
        let cli = match &node.ssh_user {
            Some(user) => {
                debug!(cluster = %cluster.name, node = %node.id, user = %user, "Binding over SSH");
                RbdCli::new(Arc::new(SshRunner::new(node.hostname.clone(), user.clone())))
            }
            None => {
                debug!(cluster = %cluster.name, node = %node.id, "Binding locally");
                RbdCli::new(Arc::new(LocalRunner::new()))
            }
        };
        Ok(Arc::new(cli.with_paths(self.rbd_path.clone(), self.ceph_path.clone())))
    }
}

/// Binds clusters to in-memory [`MockRbd`] instances, by cluster name.
#[derive(Default)]
pub struct MockBinder {
    clusters: HashMap<String, Arc<MockRbd>>,
}

impl MockBinder {
    /// Create a new binder with no clusters.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, name: impl Into<String>, rbd: Arc<MockRbd>) -> Self {
        self.clusters.insert(name.into(), rbd);
        self
    }

    /// Two mirrored mock clusters named after their site.
    pub fn pair(primary: &str, secondary: &str) -> (Self, Arc<MockRbd>, Arc<MockRbd>) {
        let (a, b) = MockRbd::pair(primary, secondary);
        let (a, b) = (Arc::new(a), Arc::new(b));
        let binder = Self::new()
            .with_cluster(primary, a.clone())
            .with_cluster(secondary, b.clone());
        (binder, a, b)
    }
}

impl ClusterBinder for MockBinder {
    fn bind(&self, cluster: &CephCluster, _node: &Node) -> Result<Arc<dyn RbdBinding>> {
        match self.clusters.get(&cluster.name) {
            Some(rbd) => Ok(rbd.clone() as Arc<dyn RbdBinding>),
            None => Err(OperationError::PreconditionMissing(format!(
                "no mock cluster registered as {}",
                cluster.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> CephCluster {
        CephCluster::new("ceph-a")
            .with_node(Node::new("node1", "10.0.0.1", &["mon", "osd"]))
            .with_node(Node::new("node2", "10.0.0.2", &["client"]).with_ssh_user("cephuser"))
            .with_node(Node::new("node3", "10.0.0.3", &["client"]))
    }

    #[test]
    fn test_resolve_client_defaults_to_first_client() {
        let c = cluster();
        assert_eq!(c.resolve_client(None).unwrap().id, "node2");
        assert_eq!(c.resolve_client(Some("node3")).unwrap().id, "node3");
        assert!(matches!(
            c.resolve_client(Some("node9")),
            Err(OperationError::PreconditionMissing(_))
        ));
    }

    #[test]
    fn test_resolve_client_without_client_role() {
        let c = CephCluster::new("bare").with_node(Node::new("node1", "h", &["osd"]));
        assert!(c.resolve_client(None).is_err());
        assert_eq!(c.get_nodes("osd").len(), 1);
    }

    #[test]
    fn test_mock_binder_binds_by_cluster_name() {
        let (binder, _a, _b) = MockBinder::pair("ceph-a", "ceph-b");
        let c = cluster();
        let node = c.resolve_client(None).unwrap();
        assert!(binder.bind(&c, node).is_ok());
        assert!(binder.bind(&CephCluster::new("ceph-c"), node).is_err());
    }

    #[test]
    fn test_inventory_yaml() {
        let yaml = r#"
name: ceph-b
nodes:
  - id: node1
    hostname: 10.0.1.1
    roles: [client, mon]
    ssh_user: root
"#;
        let c: CephCluster = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(c.nodes[0].ssh_user.as_deref(), Some("root"));
        assert!(c.nodes[0].has_role("mon"));
    }
}
