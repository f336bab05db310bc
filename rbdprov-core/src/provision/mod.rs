//! Single cluster provisioning and dual cluster mirror orchestration.
//!
//! [`Provisioner::initial_rbd_config`] expands a scenario for one cluster and
//! creates its pools and images. [`Provisioner::initial_mirror_config`] does
//! that for a primary and a secondary cluster, in that order, and then sets
//! up mirroring per pool type in both directions.

mod mirror;
mod pools;

pub use mirror::{MirrorConfigurator, RbdMirrorConfigurator, DEFAULT_PEER_MODE, DEFAULT_RBD_CLIENT};
pub use pools::{PoolProvisioner, RbdPoolProvisioner, DEFAULT_EC_PG_NUM, DEFAULT_EC_PROFILE, DEFAULT_PG_NUM};

use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::binding::RbdBinding;
use crate::cluster::{CephCluster, ClusterBinder, Node};
use crate::config::{expand, ExpandContext, ExpandedConfig, RawConfig};
use crate::error::{OperationError, Result};
use crate::names::NamePlan;
use crate::types::{ClusterRole, CmdOutput, PoolType, POOL_MODE_SNAPSHOT_REJECTION};
use crate::wait::WaitPolicy;

/// One provisioned cluster, as handed to the workflows.
#[derive(Clone)]
pub struct ProvisioningHandle {
    pub rbd: Arc<dyn RbdBinding>,
    pub client: Node,
    /// Active pool types, in provisioning order
    pub pool_types: Vec<PoolType>,
    pub role: ClusterRole,
    pub cluster: CephCluster,
    /// The expansion this cluster was provisioned from
    pub config: ExpandedConfig,
}

impl ProvisioningHandle {
    pub fn is_secondary(&self) -> bool {
        self.role.is_secondary()
    }
}

impl fmt::Debug for ProvisioningHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningHandle")
            .field("cluster", &self.cluster.name)
            .field("client", &self.client.id)
            .field("role", &self.role)
            .field("pool_types", &self.pool_types)
            .finish()
    }
}

/// Result of provisioning a mirrored cluster pair.
#[derive(Debug, Clone)]
pub struct MirrorProvisioning {
    /// Handles keyed by cluster name, primary first
    pub handles: IndexMap<String, ProvisioningHandle>,
    /// Expected-outcome messages, e.g. pool mode snapshot rejections
    pub output: Vec<String>,
}

impl MirrorProvisioning {
    pub fn primary(&self) -> Option<&ProvisioningHandle> {
        self.handles.values().find(|h| h.role == ClusterRole::Primary)
    }

    pub fn secondary(&self) -> Option<&ProvisioningHandle> {
        self.handles.values().find(|h| h.role == ClusterRole::Secondary)
    }

    pub fn get(&self, cluster: &str) -> Option<&ProvisioningHandle> {
        self.handles.get(cluster)
    }
}

/// Provisions clusters through pluggable pool and mirror collaborators.
pub struct Provisioner {
    binder: Arc<dyn ClusterBinder>,
    pools: Arc<dyn PoolProvisioner>,
    mirror: Arc<dyn MirrorConfigurator>,
}

impl Provisioner {
    /// Create a new provisioner with the default rbd collaborators.
    pub fn new(binder: Arc<dyn ClusterBinder>) -> Self {
        Self {
            binder,
            pools: Arc::new(RbdPoolProvisioner::new()),
            mirror: Arc::new(RbdMirrorConfigurator::new(WaitPolicy::default())),
        }
    }

    pub fn with_pool_provisioner(mut self, pools: Arc<dyn PoolProvisioner>) -> Self {
        self.pools = pools;
        self
    }

    pub fn with_mirror_configurator(mut self, mirror: Arc<dyn MirrorConfigurator>) -> Self {
        self.mirror = mirror;
        self
    }

    /// Expand `raw` for one cluster and create its pools and images.
    ///
    /// The client node is `client_node` when given, else the first node with
    /// the client role. A failure while provisioning any pool type aborts the
    /// whole call with `CollaboratorError`.
    #[instrument(skip(self, cluster, raw, plan), fields(cluster = %cluster.name, is_secondary = ctx.is_secondary))]
    pub async fn initial_rbd_config(
        &self,
        cluster: &CephCluster,
        raw: &RawConfig,
        client_node: Option<&str>,
        ctx: ExpandContext,
        plan: &NamePlan,
    ) -> Result<ProvisioningHandle> {
        let config = expand(raw, ctx, plan);
        let client = cluster.resolve_client(client_node)?.clone();
        let rbd = self.binder.bind(cluster, &client)?;
        info!(client = %client.id, pool_types = ?config.pool_types, "Provisioning cluster");

        for &pool_type in &config.pool_types {
            let section = config.section(pool_type).ok_or_else(|| {
                OperationError::Internal(format!("expanded configuration has no {} section", pool_type))
            })?;
            if let Err(e) = self
                .pools
                .provision(rbd.as_ref(), pool_type, section, &config, ctx.is_secondary)
                .await
            {
                error!(pool_type = %pool_type, error = %e, "RBD configuration failed");
                return Err(OperationError::CollaboratorError(format!(
                    "RBD configuration failed for {} on {}: {}",
                    pool_type, cluster.name, e
                )));
            }
        }

        Ok(ProvisioningHandle {
            rbd,
            client,
            pool_types: config.pool_types.clone(),
            role: ClusterRole::from_is_secondary(ctx.is_secondary),
            cluster: cluster.clone(),
            config,
        })
    }

    /// Provision `primary` and the other cluster of `clusters` as its
    /// secondary, then configure mirroring for every active pool type.
    ///
    /// Both clusters share one [`NamePlan`], so they agree on pool names.
    /// When the primary to secondary setup of a pool type is rejected
    /// because the pool mirrors in pool mode, the message is recorded in
    /// `output` and the reverse direction is skipped for that pool type.
    #[instrument(skip(self, clusters, raw))]
    pub async fn initial_mirror_config(
        &self,
        primary: &str,
        clusters: &[CephCluster],
        raw: &RawConfig,
    ) -> Result<MirrorProvisioning> {
        let primary_cluster = clusters.iter().find(|c| c.name == primary).ok_or_else(|| {
            error!(primary = %primary, "Primary cluster not in cluster list");
            OperationError::PreconditionMissing(format!("cluster {} not found", primary))
        })?;
        let others: Vec<&CephCluster> = clusters.iter().filter(|c| c.name != primary).collect();
        let secondary_cluster = match others.as_slice() {
            [] => {
                error!(primary = %primary, "No secondary cluster to mirror to");
                return Err(OperationError::PreconditionMissing(
                    "mirroring needs a second cluster".to_string(),
                ));
            }
            [only] => *only,
            [first, ..] => {
                warn!(
                    clusters = clusters.len(),
                    secondary = %first.name,
                    "More than two clusters given, mirroring with the first non-primary cluster only"
                );
                *first
            }
        };

        let plan = NamePlan::generate();
        let primary_handle = self
            .initial_rbd_config(primary_cluster, raw, None, ExpandContext::mirror(false), &plan)
            .await?;
        let secondary_handle = self
            .initial_rbd_config(secondary_cluster, raw, None, ExpandContext::mirror(true), &plan)
            .await?;

        let mut output = Vec::new();
        for &pool_type in &primary_handle.pool_types {
            let Some(primary_section) = primary_handle.config.section(pool_type) else {
                continue;
            };
            let out = self
                .mirror
                .configure(&primary_handle, &secondary_handle, primary_section, false)
                .await?;

            if out.contains(POOL_MODE_SNAPSHOT_REJECTION) {
                info!(pool_type = %pool_type, "Snapshot mirroring rejected in pool mode, skipping reverse direction");
                output.push(format!("{} for {}", out, pool_type));
                continue;
            }

            let secondary_section = secondary_handle
                .config
                .section(pool_type)
                .unwrap_or(primary_section);
            self.mirror
                .configure(&secondary_handle, &primary_handle, secondary_section, true)
                .await?;
        }

        let mut handles = IndexMap::new();
        handles.insert(primary_cluster.name.clone(), primary_handle);
        handles.insert(secondary_cluster.name.clone(), secondary_handle);
        Ok(MirrorProvisioning { handles, output })
    }
}

/// Fail with `CollaboratorError` unless `out` reports success.
fn check(out: &CmdOutput, what: impl FnOnce() -> String) -> Result<()> {
    if out.exit_ok() {
        return Ok(());
    }
    let what = what();
    error!(operation = %what, stderr = %out.stderr.trim(), "Provisioning step failed");
    Err(OperationError::CollaboratorError(format!(
        "failed to {}: {}",
        what,
        out.stderr.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockBinder;
    use crate::config::PoolTypeConfig;
    use crate::types::POOL_MODE_SNAPSHOT_NOT_REJECTED;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records mirror calls and answers with a fixed outcome per pool type.
    struct RecordingMirror {
        calls: Mutex<Vec<(String, String, bool)>>,
        reject: Option<PoolType>,
    }

    impl RecordingMirror {
        fn new(reject: Option<PoolType>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                reject,
            }
        }

        fn calls(&self) -> Vec<(String, String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MirrorConfigurator for RecordingMirror {
        async fn configure(
            &self,
            local: &ProvisioningHandle,
            remote: &ProvisioningHandle,
            section: &PoolTypeConfig,
            is_secondary: bool,
        ) -> Result<String> {
            self.calls.lock().unwrap().push((
                local.cluster.name.clone(),
                remote.cluster.name.clone(),
                is_secondary,
            ));
            let rejected = self
                .reject
                .and_then(|pt| local.config.section(pt))
                .map(|s| s == section)
                .unwrap_or(false);
            Ok(if rejected {
                POOL_MODE_SNAPSHOT_REJECTION.to_string()
            } else {
                POOL_MODE_SNAPSHOT_NOT_REJECTED.to_string()
            })
        }
    }

    fn clusters() -> Vec<CephCluster> {
        vec![
            CephCluster::new("ceph-a").with_node(Node::new("a1", "10.0.0.1", &["client"])),
            CephCluster::new("ceph-b").with_node(Node::new("b1", "10.0.1.1", &["client"])),
        ]
    }

    #[tokio::test]
    async fn test_initial_rbd_config_returns_handle() {
        let (binder, a, _b) = MockBinder::pair("ceph-a", "ceph-b");
        let provisioner = Provisioner::new(Arc::new(binder));
        let raw = RawConfig::default();
        let handle = provisioner
            .initial_rbd_config(&clusters()[0], &raw, None, ExpandContext::primary(), &NamePlan::generate())
            .await
            .unwrap();

        assert_eq!(handle.pool_types, vec![PoolType::Replicated, PoolType::ErasureCoded]);
        assert_eq!(handle.client.id, "a1");
        assert_eq!(handle.role, ClusterRole::Primary);
        assert_eq!(a.call_count("image_create"), 2);
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_collaborator_error() {
        let (binder, a, _b) = MockBinder::pair("ceph-a", "ceph-b");
        a.fail_on("pool_create", "Error EPERM: access denied");
        let provisioner = Provisioner::new(Arc::new(binder));
        let err = provisioner
            .initial_rbd_config(&clusters()[0], &RawConfig::default(), None, ExpandContext::primary(), &NamePlan::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::CollaboratorError(ref m) if m.contains("rep_pool_config")));
        // The first failing pool type aborts the call.
        assert_eq!(a.call_count("pool_create"), 1);
    }

    #[tokio::test]
    async fn test_mirror_directions_per_pool_type() {
        let (binder, _a, _b) = MockBinder::pair("ceph-a", "ceph-b");
        let mirror = Arc::new(RecordingMirror::new(None));
        let provisioner = Provisioner::new(Arc::new(binder)).with_mirror_configurator(mirror.clone());

        let result = provisioner
            .initial_mirror_config("ceph-a", &clusters(), &RawConfig::default())
            .await
            .unwrap();

        assert!(result.output.is_empty());
        assert_eq!(result.primary().unwrap().cluster.name, "ceph-a");
        assert_eq!(result.secondary().unwrap().cluster.name, "ceph-b");
        let calls = mirror.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], ("ceph-a".into(), "ceph-b".into(), false));
        assert_eq!(calls[1], ("ceph-b".into(), "ceph-a".into(), true));
    }

    #[tokio::test]
    async fn test_pool_mode_rejection_skips_reverse_direction() {
        let (binder, _a, _b) = MockBinder::pair("ceph-a", "ceph-b");
        let mirror = Arc::new(RecordingMirror::new(Some(PoolType::ErasureCoded)));
        let provisioner = Provisioner::new(Arc::new(binder)).with_mirror_configurator(mirror.clone());

        let result = provisioner
            .initial_mirror_config("ceph-b", &clusters(), &RawConfig::default())
            .await
            .unwrap();

        assert_eq!(
            result.output,
            vec![format!("{} for ec_pool_config", POOL_MODE_SNAPSHOT_REJECTION)]
        );
        // rep: both directions, ec: primary to secondary only
        assert_eq!(mirror.calls().len(), 3);
        assert_eq!(result.handles.keys().collect::<Vec<_>>(), vec!["ceph-b", "ceph-a"]);
    }

    #[tokio::test]
    async fn test_mirror_needs_two_clusters() {
        let (binder, _a, _b) = MockBinder::pair("ceph-a", "ceph-b");
        let provisioner = Provisioner::new(Arc::new(binder));
        let one = vec![clusters().remove(0)];
        assert!(matches!(
            provisioner.initial_mirror_config("ceph-a", &one, &RawConfig::default()).await,
            Err(OperationError::PreconditionMissing(_))
        ));
        assert!(provisioner
            .initial_mirror_config("ceph-z", &clusters(), &RawConfig::default())
            .await
            .is_err());
    }
}
