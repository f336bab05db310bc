//! # rbdprov Core
//!
//! Provisioning engine for RBD (Ceph block device) test topologies.
//!
//! A sparse scenario ("one replicated and one erasure coded pool, five
//! images each, mirrored") is expanded into a fully specified topology and
//! then created on one cluster, or on two clusters with mirroring set up
//! between them. Workflows then exercise groups, snapshots and clones on the
//! provisioned images and check that each cluster behaves as its role
//! requires.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────────────────────────┐
//! │  RawConfig   │──▶│ expand() ─▶ ExpandedConfig           │
//! └──────────────┘   └──────────────────┬───────────────────┘
//!                                       ▼
//!                    ┌──────────────────────────────────────┐
//!                    │ Provisioner                          │
//!                    │  initial_rbd_config (one cluster)    │
//!                    │  initial_mirror_config (two)         │
//!                    │    PoolProvisioner / MirrorConfigurator│
//!                    └──────────────────┬───────────────────┘
//!                                       ▼ ProvisioningHandle
//!                    ┌──────────────────────────────────────┐
//!                    │ GroupWorkflow / SnapCloneWorkflow /  │
//!                    │ journal delay                        │
//!                    └──────────────────┬───────────────────┘
//!                                       ▼
//!                    ┌──────────────────────────────────────┐
//!                    │ RbdBinding: RbdCli (rbd/ceph tools)  │
//!                    │             MockRbd (in memory)      │
//!                    └──────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use rbdprov_core::{CephCluster, MockBinder, Node, Provisioner, RawConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (binder, _a, _b) = MockBinder::pair("ceph-a", "ceph-b");
//!     let clusters = vec![
//!         CephCluster::new("ceph-a").with_node(Node::new("a1", "10.0.0.1", &["client"])),
//!         CephCluster::new("ceph-b").with_node(Node::new("b1", "10.0.1.1", &["client"])),
//!     ];
//!
//!     let raw = RawConfig::from_yaml_str("rep_pool_config:\n  num_pools: 1\n  num_images: 2\n  mode: image\n").unwrap();
//!     let mirrored = Provisioner::new(Arc::new(binder))
//!         .initial_mirror_config("ceph-a", &clusters, &raw)
//!         .await
//!         .unwrap();
//!     println!("{:?}", mirrored.output);
//! }
//! ```

pub mod binding;
pub mod cluster;
pub mod config;
pub mod error;
pub mod names;
pub mod provision;
pub mod types;
pub mod wait;
pub mod workflows;

pub use binding::{MockRbd, RbdBinding, RbdCli};
pub use cluster::{CephCluster, ClusterBinder, CliBinder, MockBinder, Node};
pub use config::{expand, expand_fresh, ConfigShape, ExpandContext, ExpandedConfig, RawConfig};
pub use error::{OperationError, Result};
pub use names::{random_string, NamePlan};
pub use provision::{MirrorProvisioning, Provisioner, ProvisioningHandle};
pub use types::*;
pub use wait::WaitPolicy;
pub use workflows::{GroupWorkflow, SnapCloneWorkflow};
