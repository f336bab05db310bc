//! Mirror relationship setup between two provisioned clusters.

use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use super::{check, ProvisioningHandle};
use crate::binding::RbdBinding;
use crate::config::{PoolAttrs, PoolTypeConfig};
use crate::error::{OperationError, Result};
use crate::types::{
    CmdOutput, ImageRef, MirrorMode, MirrorType, PeerDirection, ScheduleScope,
    MIRROR_ALREADY_CONFIGURED, POOL_MODE_SNAPSHOT_NOT_REJECTED, POOL_MODE_SNAPSHOT_REJECTION,
    POOL_NOT_IN_IMAGE_MODE,
};
use crate::wait::{wait_until, WaitPolicy};

/// Peer mode used when a pool does not set `peer_mode`. Any other mode adds
/// the peers directly as `rbd_client@cluster`.
pub const DEFAULT_PEER_MODE: &str = "bootstrap";

/// Client used for directly added peers when a pool does not set `rbd_client`.
pub const DEFAULT_RBD_CLIENT: &str = "client.admin";

/// Configures mirroring of one pool type from `local` towards `remote`.
#[async_trait]
pub trait MirrorConfigurator: Send + Sync {
    /// Set up mirroring for every pool of `section` that has a `mode`.
    ///
    /// Image level mirroring is enabled, from `local`, for the images whose
    /// `is_secondary` flag equals `is_secondary`. Returns the outcome text;
    /// [`POOL_MODE_SNAPSHOT_REJECTION`] when snapshot mirroring was refused
    /// because the pool mirrors in pool mode.
    async fn configure(
        &self,
        local: &ProvisioningHandle,
        remote: &ProvisioningHandle,
        section: &PoolTypeConfig,
        is_secondary: bool,
    ) -> Result<String>;
}

/// [`MirrorConfigurator`] driving both clusters through their bindings.
#[derive(Debug, Clone, Default)]
pub struct RbdMirrorConfigurator {
    wait: WaitPolicy,
}

impl RbdMirrorConfigurator {
    /// Create a new mirror configurator that polls cluster state with `wait`.
    pub fn new(wait: WaitPolicy) -> Self {
        Self { wait }
    }

    /// Enable pool mirroring on both sides, pair the peers and confirm them.
    ///
    /// A pool that is already configured on `local` is left alone.
    async fn config_mirror(
        &self,
        local: &ProvisioningHandle,
        remote: &ProvisioningHandle,
        pool: &str,
        mode: MirrorMode,
        attrs: &PoolAttrs,
    ) -> Result<()> {
        let out = local.rbd.mirror_pool_enable(pool, mode).await?;
        if out.contains(MIRROR_ALREADY_CONFIGURED) {
            info!(pool = %pool, "RBD mirroring has already been configured for pool");
        } else {
            check(&out, || format!("enable {} mirroring on {} ({})", mode.as_str(), pool, local.cluster.name))?;

            let out = remote.rbd.mirror_pool_enable(pool, mode).await?;
            if !out.contains(MIRROR_ALREADY_CONFIGURED) {
                check(&out, || format!("enable {} mirroring on {} ({})", mode.as_str(), pool, remote.cluster.name))?;
            }

            let direction = attrs.way.map(PeerDirection::from).unwrap_or(PeerDirection::RxTx);
            match attrs.peer_mode.as_deref().unwrap_or(DEFAULT_PEER_MODE) {
                DEFAULT_PEER_MODE => self.bootstrap_peers(local, remote, pool, direction).await?,
                _ => {
                    let client = attrs.rbd_client.as_deref().unwrap_or(DEFAULT_RBD_CLIENT);
                    self.add_peers(local, remote, pool, client, direction).await?
                }
            }
            self.verify_peers(local, remote, pool, direction).await?;
        }

        // Image mode pools only report healthy once images are mirrored.
        if mode != MirrorMode::Image {
            self.wait_pool_healthy(local.rbd.as_ref(), &local.cluster.name, pool).await?;
            self.wait_pool_healthy(remote.rbd.as_ref(), &remote.cluster.name, pool).await?;
        }
        Ok(())
    }

    async fn bootstrap_peers(
        &self,
        local: &ProvisioningHandle,
        remote: &ProvisioningHandle,
        pool: &str,
        direction: PeerDirection,
    ) -> Result<()> {
        let out = local
            .rbd
            .mirror_peer_bootstrap_create(pool, &local.cluster.name)
            .await?;
        check(&out, || format!("create bootstrap token for {} on {}", pool, local.cluster.name))?;
        let token = out.stdout.trim();
        if token.is_empty() {
            error!(pool = %pool, "Bootstrap token is empty");
            return Err(OperationError::CollaboratorError(format!(
                "empty bootstrap token for pool {}",
                pool
            )));
        }

        let out = remote
            .rbd
            .mirror_peer_bootstrap_import(pool, &remote.cluster.name, token, direction)
            .await?;
        check(&out, || format!("import bootstrap token for {} on {}", pool, remote.cluster.name))?;
        info!(
            pool = %pool,
            primary = %local.cluster.name,
            secondary = %remote.cluster.name,
            direction = %direction.as_str(),
            "Mirror peers bootstrapped"
        );
        Ok(())
    }

    /// Register each side on the other as `client@cluster`. One-way mirroring
    /// only registers the primary on `remote`.
    async fn add_peers(
        &self,
        local: &ProvisioningHandle,
        remote: &ProvisioningHandle,
        pool: &str,
        client: &str,
        direction: PeerDirection,
    ) -> Result<()> {
        let mut targets = vec![(remote, local)];
        if direction == PeerDirection::RxTx {
            targets.push((local, remote));
        }
        for (target, peer) in targets {
            let spec = format!("{}@{}", client, peer.cluster.name);
            let out = target.rbd.mirror_pool_peer_add(pool, &spec, direction).await?;
            check(&out, || format!("add mirror peer {} to {} on {}", spec, pool, target.cluster.name))?;
            debug!(pool = %pool, cluster = %target.cluster.name, peer = %spec, "Mirror peer added");
        }
        info!(
            pool = %pool,
            client = %client,
            direction = %direction.as_str(),
            "Mirror peers added"
        );
        Ok(())
    }

    /// Every side that receives images must list a peer for `pool`.
    async fn verify_peers(
        &self,
        local: &ProvisioningHandle,
        remote: &ProvisioningHandle,
        pool: &str,
        direction: PeerDirection,
    ) -> Result<()> {
        let mut receivers = vec![remote];
        if direction == PeerDirection::RxTx {
            receivers.push(local);
        }
        for handle in receivers {
            let peers = handle.rbd.mirror_pool_peers(pool).await?;
            if peers.is_empty() {
                error!(pool = %pool, cluster = %handle.cluster.name, "Peers were not added");
                return Err(OperationError::CollaboratorError(format!(
                    "no mirror peer for pool {} on {}",
                    pool, handle.cluster.name
                )));
            }
            debug!(pool = %pool, cluster = %handle.cluster.name, peers = ?peers, "Mirror peers present");
        }
        Ok(())
    }

    async fn wait_pool_healthy(&self, rbd: &dyn RbdBinding, cluster: &str, pool: &str) -> Result<()> {
        let what = format!("mirror health OK for pool {} on {}", pool, cluster);
        wait_until(self.wait, &what, move || async move {
            rbd.mirror_pool_status(pool).await.map(|status| status.is_ok())
        })
        .await
    }

    async fn wait_image_state(&self, rbd: &dyn RbdBinding, cluster: &str, image: &ImageRef, state: &str) -> Result<()> {
        let what = format!("image {} to reach {} on {}", image, state, cluster);
        wait_until(self.wait, &what, move || async move {
            rbd.mirror_image_status(image)
                .await
                .map(|status| status.state.contains(state))
        })
        .await
    }

    /// Enable mirroring on one image and wait for both sides to settle.
    ///
    /// The pool-mode rejection is returned as output, not as an error.
    async fn enable_image_mirroring(
        &self,
        local: &ProvisioningHandle,
        remote: &ProvisioningHandle,
        image: &ImageRef,
        mirror_type: MirrorType,
        io_total: Option<&str>,
    ) -> Result<CmdOutput> {
        let out = local.rbd.mirror_image_enable(image, mirror_type).await?;
        if out.contains(POOL_NOT_IN_IMAGE_MODE) {
            return Ok(out);
        }
        check(&out, || format!("enable {} mirroring on image {}", mirror_type.as_str(), image))?;

        self.wait_pool_healthy(local.rbd.as_ref(), &local.cluster.name, &image.pool).await?;
        self.wait_pool_healthy(remote.rbd.as_ref(), &remote.cluster.name, &image.pool).await?;

        if let Some(io_total) = io_total {
            let bench = local.rbd.bench_write(image, io_total, None).await?;
            check(&bench, || format!("write {} to image {}", io_total, image))?;
        }

        futures::try_join!(
            self.wait_image_state(local.rbd.as_ref(), &local.cluster.name, image, "up+stopped"),
            self.wait_image_state(remote.rbd.as_ref(), &remote.cluster.name, image, "up+replaying"),
        )?;
        info!(image = %image, mirror_type = %mirror_type.as_str(), "Image mirroring enabled");
        Ok(out)
    }

    async fn add_schedules(&self, rbd: &dyn RbdBinding, image: &ImageRef, schedules: Vec<(&str, &str)>) -> Result<()> {
        for (level, interval) in schedules {
            let scope = ScheduleScope::from_level(level, image);
            let out = rbd.mirror_snapshot_schedule_add(&scope, interval).await?;
            if !out.exit_ok() || out.has_err() {
                // Not fatal.
                error!(image = %image, level = %level, interval = %interval, stderr = %out.stderr.trim(), "Adding snapshot scheduling failed");
            } else {
                debug!(image = %image, level = %level, interval = %interval, "Snapshot schedule added");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MirrorConfigurator for RbdMirrorConfigurator {
    #[instrument(skip(self, local, remote, section), fields(local = %local.cluster.name, remote = %remote.cluster.name))]
    async fn configure(
        &self,
        local: &ProvisioningHandle,
        remote: &ProvisioningHandle,
        section: &PoolTypeConfig,
        is_secondary: bool,
    ) -> Result<String> {
        let mut output = String::new();

        for (pool, spec) in &section.pools {
            let attrs = &spec.attrs;
            let Some(mode) = attrs.mode else {
                debug!(pool = %pool, "No mirror mode, skipping pool");
                continue;
            };

            info!(
                pool = %pool,
                mode = %mode.as_str(),
                peer_mode = %attrs.peer_mode.as_deref().unwrap_or(DEFAULT_PEER_MODE),
                "Configuring mirroring"
            );

            self.config_mirror(local, remote, pool, mode, attrs).await?;

            let pool_mode_snapshot =
                mode == MirrorMode::Pool && attrs.mirrormode == Some(MirrorType::Snapshot);
            let image_mode = mode == MirrorMode::Image && !section.options.do_not_enable_mirror_on_image;
            if !(image_mode || pool_mode_snapshot) {
                continue;
            }

            let mirror_type = attrs.mirrormode.unwrap_or(MirrorType::Journal);
            for (name, image) in spec.images_for_role(is_secondary) {
                let image_ref = ImageRef::new(pool.clone(), name.clone());
                let io_total = image.io_total.as_ref().map(|s| s.to_string());
                let out = self
                    .enable_image_mirroring(local, remote, &image_ref, mirror_type, io_total.as_deref())
                    .await?;

                if pool_mode_snapshot {
                    if out.contains(POOL_NOT_IN_IMAGE_MODE) {
                        output = POOL_MODE_SNAPSHOT_REJECTION.to_string();
                    } else if !is_secondary {
                        warn!(image = %image_ref, "Snapshot mirroring was not rejected in pool mode");
                        output = POOL_MODE_SNAPSHOT_NOT_REJECTED.to_string();
                    }
                }

                self.add_schedules(local.rbd.as_ref(), &image_ref, image.snap_schedules().collect())
                    .await?;
            }
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::MockRbd;
    use crate::cluster::{CephCluster, MockBinder, Node};
    use crate::config::{ExpandContext, RawConfig};
    use crate::names::NamePlan;
    use crate::provision::Provisioner;
    use crate::types::PoolType;
    use std::sync::Arc;

    const JOURNAL_SCENARIO: &str = r#"
rep-pool-only: true
rep_pool_config:
  mpool:
    mode: image
    mirrormode: journal
    pri_img:
      size: 1G
      io_total: 10M
      image-feature: exclusive-lock,journaling
    sec_img:
      size: 1G
      is_secondary: true
      image-feature: exclusive-lock,journaling
"#;

    struct Pair {
        primary: ProvisioningHandle,
        secondary: ProvisioningHandle,
        a: Arc<MockRbd>,
        b: Arc<MockRbd>,
    }

    async fn provision_pair(yaml: &str) -> Pair {
        let (binder, a, b) = MockBinder::pair("ceph-a", "ceph-b");
        let provisioner = Provisioner::new(Arc::new(binder));
        let raw = RawConfig::from_yaml_str(yaml).unwrap();
        let plan = NamePlan::generate();
        let cluster_a = CephCluster::new("ceph-a").with_node(Node::new("a1", "10.0.0.1", &["client"]));
        let cluster_b = CephCluster::new("ceph-b").with_node(Node::new("b1", "10.0.1.1", &["client"]));

        let primary = provisioner
            .initial_rbd_config(&cluster_a, &raw, None, ExpandContext::mirror(false), &plan)
            .await
            .unwrap();
        let secondary = provisioner
            .initial_rbd_config(&cluster_b, &raw, None, ExpandContext::mirror(true), &plan)
            .await
            .unwrap();
        Pair { primary, secondary, a, b }
    }

    fn section(handle: &ProvisioningHandle) -> &PoolTypeConfig {
        handle.config.section(PoolType::Replicated).unwrap()
    }

    #[tokio::test]
    async fn test_image_mode_journal_both_directions() {
        let pair = provision_pair(JOURNAL_SCENARIO).await;
        let configurator = RbdMirrorConfigurator::new(WaitPolicy::immediate());

        let out = configurator
            .configure(&pair.primary, &pair.secondary, section(&pair.primary), false)
            .await
            .unwrap();
        assert!(out.is_empty());
        let out = configurator
            .configure(&pair.secondary, &pair.primary, section(&pair.secondary), true)
            .await
            .unwrap();
        assert!(out.is_empty());

        let pri_img = ImageRef::new("mpool", "pri_img");
        let sec_img = ImageRef::new("mpool", "sec_img");
        assert_eq!(pair.b.image_is_primary(&pri_img), Some(false));
        assert_eq!(pair.a.image_is_primary(&sec_img), Some(false));

        // The reverse direction finds the pool configured and does not bootstrap again.
        assert_eq!(pair.a.call_count("mirror_peer_bootstrap_create"), 1);
        assert_eq!(pair.b.call_count("mirror_peer_bootstrap_create"), 0);
    }

    #[tokio::test]
    async fn test_pool_mode_snapshot_is_rejected() {
        let pair = provision_pair(
            "rep-pool-only: true\nrep_pool_config:\n  spool:\n    mode: pool\n    mirrormode: snapshot\n    img:\n      size: 1G\n",
        )
        .await;
        let configurator = RbdMirrorConfigurator::new(WaitPolicy::immediate());

        let out = configurator
            .configure(&pair.primary, &pair.secondary, section(&pair.primary), false)
            .await
            .unwrap();
        assert_eq!(out, POOL_MODE_SNAPSHOT_REJECTION);
        assert_eq!(pair.a.pool_mirror_mode("spool"), Some(MirrorMode::Pool));
        assert_eq!(pair.b.pool_mirror_mode("spool"), Some(MirrorMode::Pool));
    }

    #[tokio::test]
    async fn test_manual_peer_mode_uses_rbd_client() {
        let pair = provision_pair(
            "rep-pool-only: true\nrep_pool_config:\n  mpool:\n    mode: pool\n    peer_mode: manual\n    rbd_client: client.mirror\n    img:\n      size: 1G\n",
        )
        .await;
        let out = RbdMirrorConfigurator::new(WaitPolicy::immediate())
            .configure(&pair.primary, &pair.secondary, section(&pair.primary), false)
            .await
            .unwrap();
        assert!(out.is_empty());

        assert_eq!(pair.a.call_count("mirror_peer_bootstrap_create"), 0);
        assert_eq!(pair.a.call_count("mirror_pool_peer_add"), 1);
        assert_eq!(pair.b.call_count("mirror_pool_peer_add"), 1);
        assert_eq!(pair.a.mirror_pool_peers("mpool").await.unwrap(), vec!["ceph-b".to_string()]);
        assert_eq!(pair.b.mirror_pool_peers("mpool").await.unwrap(), vec!["ceph-a".to_string()]);
    }

    #[tokio::test]
    async fn test_manual_one_way_adds_peer_on_secondary_only() {
        let pair = provision_pair(
            "rep-pool-only: true\nrep_pool_config:\n  mpool:\n    mode: image\n    mirrormode: snapshot\n    way: one-way\n    peer_mode: manual\n    img:\n      size: 1G\n",
        )
        .await;
        RbdMirrorConfigurator::new(WaitPolicy::immediate())
            .configure(&pair.primary, &pair.secondary, section(&pair.primary), false)
            .await
            .unwrap();
        assert_eq!(pair.a.call_count("mirror_pool_peer_add"), 0);
        assert_eq!(pair.b.mirror_pool_peers("mpool").await.unwrap(), vec!["ceph-a".to_string()]);
    }

    #[tokio::test]
    async fn test_bootstrap_without_peer_fails() {
        let pair = provision_pair(JOURNAL_SCENARIO).await;
        pair.b.stub_on("mirror_peer_bootstrap_import", "");

        let err = RbdMirrorConfigurator::new(WaitPolicy::immediate())
            .configure(&pair.primary, &pair.secondary, section(&pair.primary), false)
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::CollaboratorError(ref m) if m.contains("no mirror peer")));
        assert_eq!(pair.a.call_count("mirror_image_enable"), 0);
    }

    #[tokio::test]
    async fn test_schedule_failure_is_not_fatal() {
        let pair = provision_pair(
            "rep-pool-only: true\nrep_pool_config:\n  mpool:\n    mode: image\n    mirrormode: snapshot\n    img:\n      size: 1G\n      snap_schedule_levels: [image]\n      snap_schedule_intervals: [1m]\n",
        )
        .await;
        pair.a.fail_on("mirror_snapshot_schedule_add", "rbd: failed to add schedule");

        let out = RbdMirrorConfigurator::new(WaitPolicy::immediate())
            .configure(&pair.primary, &pair.secondary, section(&pair.primary), false)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(pair.a.call_count("mirror_snapshot_schedule_add"), 1);
    }

    #[tokio::test]
    async fn test_pool_without_mode_is_skipped() {
        let pair = provision_pair("rep-pool-only: true\nrep_pool_config:\n  plain:\n    img:\n      size: 1G\n").await;
        let out = RbdMirrorConfigurator::default()
            .configure(&pair.primary, &pair.secondary, section(&pair.primary), false)
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(pair.a.call_count("mirror_pool_enable"), 0);
    }
}
