//! Role-aware snapshot and clone lifecycle of one image.
//!
//! Every mutating operation is checked against the role of the cluster it
//! runs on. On a primary it must complete; on a secondary (mirror target) it
//! must be refused with a read-only filesystem error, and succeeding there
//! is a failure in its own right.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::snap_schedule::verify_snapshot_schedule;
use crate::binding::{CloneRequest, RbdBinding};
use crate::error::{OperationError, Result};
use crate::names::random_string;
use crate::provision::ProvisioningHandle;
use crate::types::{ClusterRole, CmdOutput, ImageRef, SnapInfo, READ_ONLY_MARKER, SNAP_CREATE_READ_ONLY};
use crate::wait::{wait_until, WaitPolicy};

/// Which parts of [`SnapCloneWorkflow::clone_ops`] to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneOps {
    pub protect_snap: bool,
    pub create_clone: bool,
    pub num_clones_per_snap: u32,
    pub flatten_clone: bool,
    pub unprotect_snap: bool,
}

impl Default for CloneOps {
    fn default() -> Self {
        Self {
            protect_snap: true,
            create_clone: true,
            num_clones_per_snap: 1,
            flatten_clone: true,
            unprotect_snap: true,
        }
    }
}

/// Per-snapshot operation run by [`SnapCloneWorkflow::run_image_snap_ops`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapOp {
    Create,
    Clone(CloneOps),
    Rollback,
    Remove,
}

/// Snapshot and clone operations on images of one cluster.
#[derive(Clone)]
pub struct SnapCloneWorkflow {
    rbd: Arc<dyn RbdBinding>,
    role: ClusterRole,
    /// The other side of the mirror relationship, if any
    peer: Option<Arc<dyn RbdBinding>>,
    /// Polling for mirrored state on the peer
    wait: WaitPolicy,
}

impl SnapCloneWorkflow {
    /// Create a new workflow for a cluster with the given role.
    pub fn new(rbd: Arc<dyn RbdBinding>, role: ClusterRole) -> Self {
        Self {
            rbd,
            role,
            peer: None,
            wait: WaitPolicy::default(),
        }
    }

    pub fn from_handle(handle: &ProvisioningHandle) -> Self {
        Self::new(handle.rbd.clone(), handle.role)
    }

    /// Use `peer` as the other side: the secondary checked for mirrored
    /// snapshots from a primary, the primary protected from a secondary.
    pub fn with_peer(mut self, peer: Arc<dyn RbdBinding>) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_wait(mut self, wait: WaitPolicy) -> Self {
        self.wait = wait;
        self
    }

    pub fn role(&self) -> ClusterRole {
        self.role
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// All snapshots of `image`, mirror and group snapshots included.
    pub async fn snap_list(&self, image: &ImageRef) -> Result<Vec<SnapInfo>> {
        self.rbd.snap_list(image).await.map_err(|e| {
            error!(image = %image, error = %e, "Snapshot listing failed");
            e
        })
    }

    pub async fn snap_exists(&self, image: &ImageRef, snap: &str) -> Result<bool> {
        let exists = self.snap_list(image).await?.iter().any(|s| s.name == snap);
        if !exists {
            debug!(image = %image, snap = %snap, "Snapshot not present");
        }
        Ok(exists)
    }

    /// User snapshots of `image`; having none is a missing precondition.
    pub async fn get_user_defined_snaps(&self, image: &ImageRef) -> Result<Vec<SnapInfo>> {
        let snaps: Vec<SnapInfo> = self
            .snap_list(image)
            .await?
            .into_iter()
            .filter(SnapInfo::is_user_defined)
            .collect();
        if snaps.is_empty() {
            return Err(precondition(format!(
                "user defined snapshots are not present for image {}",
                image
            )));
        }
        Ok(snaps)
    }

    /// The snapshot named `snap`, else the first user snapshot of `image`.
    async fn target_snap(&self, image: &ImageRef, snap: Option<&str>) -> Result<SnapInfo> {
        match snap {
            Some(name) => Ok(self
                .snap_list(image)
                .await?
                .into_iter()
                .find(|s| s.name == name)
                .unwrap_or_else(|| SnapInfo::user(0, name))),
            None => {
                let mut snaps = self.get_user_defined_snaps(image).await?;
                Ok(snaps.remove(0))
            }
        }
    }

    // =========================================================================
    // Mutating operations
    // =========================================================================

    /// Create a snapshot and verify it for the cluster's role.
    ///
    /// On a primary the snapshot must be listed afterwards, every interval in
    /// `schedule_intervals` must produce mirror snapshots, and the peer (when
    /// set) must list the snapshot too. Returns the snapshot name.
    #[instrument(skip(self, image, schedule_intervals), fields(image = %image, role = %self.role))]
    pub async fn snap_create_list_and_verify(
        &self,
        image: &ImageRef,
        snap: Option<&str>,
        schedule_intervals: &[String],
    ) -> Result<String> {
        let snap = snap
            .map(str::to_string)
            .unwrap_or_else(|| format!("snap_{}", random_string(5)));
        let spec = image.snap_spec(&snap);
        let out = self.rbd.snap_create(image, &snap).await?;

        if self.role.is_secondary() {
            if out.contains(SNAP_CREATE_READ_ONLY) {
                info!(snap = %spec, "Snapshot creation failed as expected on secondary");
                return Ok(snap);
            }
            return Err(role_violation(&out, &format!("snapshot create of {} on secondary", spec)));
        }

        if !out.is_complete_done() {
            return Err(failure(format!(
                "snapshot create of {} did not complete: {}",
                spec,
                out.combined().trim()
            )));
        }
        if !self.snap_exists(image, &snap).await? {
            return Err(failure(format!("snapshot {} not listed on primary", spec)));
        }
        info!(snap = %spec, "Snapshot created on primary");

        for interval in schedule_intervals {
            verify_snapshot_schedule(self.rbd.as_ref(), image, interval)
                .await
                .map_err(|e| failure(format!("snapshot schedule of {} not verified: {}", image, e)))?;
        }

        if let Some(peer) = &self.peer {
            let peer = peer.as_ref();
            let name = snap.as_str();
            let what = format!("snapshot {} on secondary", spec);
            wait_until(self.wait, &what, move || async move {
                peer.snap_list(image)
                    .await
                    .map(|snaps| snaps.iter().any(|s| s.name == name))
            })
            .await
            .map_err(|e| failure(format!("snapshot {} not mirrored to secondary: {}", spec, e)))?;
            debug!(snap = %spec, "Snapshot present on secondary");
        }

        Ok(snap)
    }

    /// Protect, clone, flatten and unprotect snapshots of `image`.
    ///
    /// Works on `snap` when given, else on every user snapshot. On a
    /// secondary, protect and unprotect must be refused; because protection
    /// is not mirrored, a snapshot still unprotected on the primary is then
    /// protected there through the peer.
    #[instrument(skip(self, image, ops, schedule_intervals), fields(image = %image, role = %self.role))]
    pub async fn clone_ops(
        &self,
        image: &ImageRef,
        ops: &CloneOps,
        snap: Option<&str>,
        schedule_intervals: &[String],
    ) -> Result<()> {
        let snaps = match snap {
            Some(name) => vec![self.target_snap(image, Some(name)).await?],
            None => self.get_user_defined_snaps(image).await?,
        };

        if ops.protect_snap {
            info!(count = snaps.len(), "Protecting user snapshots");
            for snap in &snaps {
                let spec = image.snap_spec(&snap.name);
                let out = self.rbd.snap_protect(image, &snap.name).await?;
                if self.role.is_secondary() {
                    expect_read_only(&out, &format!("snapshot protect of {} on secondary", spec))?;
                    self.protect_on_primary(image, &snap.name, schedule_intervals).await;
                } else if out.has_err() {
                    return Err(failure(format!(
                        "snapshot protect of {} failed: {}",
                        spec,
                        out.stderr.trim()
                    )));
                } else {
                    debug!(snap = %spec, "Snapshot protected");
                }
            }
        }

        if ops.create_clone {
            info!(clones_per_snap = ops.num_clones_per_snap, "Creating clones");
            for snap in &snaps {
                for _ in 0..ops.num_clones_per_snap {
                    let req = CloneRequest {
                        source: image.clone(),
                        snap: snap.name.clone(),
                        dest: ImageRef::new(image.pool.clone(), format!("clone_{}", random_string(5)))
                            .with_namespace(image.namespace.as_deref()),
                        snap_id: None,
                        clone_format: None,
                    };
                    let out = self.rbd.clone_image(&req).await?;
                    if out.has_err() {
                        return Err(failure(format!(
                            "clone of {} failed: {}",
                            image.snap_spec(&snap.name),
                            out.stderr.trim()
                        )));
                    }
                    debug!(dest = %req.dest, "Clone created");
                }
            }
        }

        if ops.flatten_clone {
            info!("Flattening clones");
            for snap in &snaps {
                let spec = image.snap_spec(&snap.name);
                let children = self
                    .rbd
                    .children(image, &snap.name)
                    .await
                    .map_err(|e| failure(format!("fetching children of {} failed: {}", spec, e)))?;
                for child in children {
                    let out = self.rbd.flatten(&child).await?;
                    if !out.is_complete_done() {
                        return Err(failure(format!(
                            "flatten of clone {} failed: {}",
                            child,
                            out.stderr.trim()
                        )));
                    }
                    debug!(clone = %child, "Clone flattened");
                }
            }
        }

        if ops.unprotect_snap {
            info!("Unprotecting user snapshots");
            for snap in &snaps {
                let spec = image.snap_spec(&snap.name);
                let out = self.rbd.snap_unprotect(image, &snap.name).await?;
                if self.role.is_secondary() {
                    expect_read_only(&out, &format!("snapshot unprotect of {} on secondary", spec))?;
                } else if out.has_err() {
                    return Err(failure(format!(
                        "snapshot unprotect of {} failed: {}",
                        spec,
                        out.stderr.trim()
                    )));
                }
            }
        }

        Ok(())
    }

    /// Protect `snap` on the peer primary if it is not protected there yet.
    ///
    /// Failures are logged only.
    async fn protect_on_primary(&self, image: &ImageRef, snap: &str, schedule_intervals: &[String]) {
        let Some(primary) = &self.peer else {
            return;
        };
        let spec = image.snap_spec(snap);
        let protected = match primary.snap_list(image).await {
            Ok(snaps) => snaps.iter().any(|s| s.name == snap && s.protected),
            Err(e) => {
                error!(snap = %spec, error = %e, "Listing snapshots on primary failed");
                return;
            }
        };
        if protected {
            return;
        }

        match primary.snap_protect(image, snap).await {
            Ok(out) if !out.has_err() => info!(snap = %spec, "Snapshot protected on primary"),
            Ok(out) => error!(snap = %spec, stderr = %out.stderr.trim(), "Error while protecting snapshot at primary"),
            Err(e) => error!(snap = %spec, error = %e, "Error while protecting snapshot at primary"),
        }
        for interval in schedule_intervals {
            if let Err(e) = verify_snapshot_schedule(primary.as_ref(), image, interval).await {
                error!(image = %image, interval = %interval, error = %e, "Snapshot schedule verification failed");
            }
        }
    }

    /// Roll `image` back to `snap` (default: its first user snapshot).
    #[instrument(skip(self, image), fields(image = %image, role = %self.role))]
    pub async fn snap_rollback_and_verify(&self, image: &ImageRef, snap: Option<&str>) -> Result<()> {
        let target = self.target_snap(image, snap).await?;
        let spec = image.snap_spec(&target.name);
        let out = self.rbd.snap_rollback(image, &target.name).await?;

        if self.role.is_secondary() {
            return expect_read_only(&out, &format!("snapshot rollback of {} on secondary", spec));
        }
        if out.has_err() && !out.is_complete() {
            return Err(failure(format!(
                "snapshot rollback of {} failed: {}",
                spec,
                out.combined().trim()
            )));
        }
        info!(snap = %spec, "Snapshot rollback complete");
        Ok(())
    }

    /// Remove `snap` (default: the first user snapshot) and confirm it is gone.
    ///
    /// On a primary a protected snapshot is unprotected first.
    #[instrument(skip(self, image), fields(image = %image, role = %self.role))]
    pub async fn remove_snap_and_verify(&self, image: &ImageRef, snap: Option<&str>) -> Result<()> {
        let target = self.target_snap(image, snap).await?;
        let spec = image.snap_spec(&target.name);

        if !self.role.is_secondary() && target.protected {
            let out = self.rbd.snap_unprotect(image, &target.name).await?;
            if out.has_err() {
                return Err(failure(format!(
                    "error while unprotecting snapshot {}: {}",
                    spec,
                    out.stderr.trim()
                )));
            }
        }

        let out = self.rbd.snap_remove(image, &target.name).await?;
        if self.role.is_secondary() {
            return expect_read_only(&out, &format!("snapshot remove of {} on secondary", spec));
        }
        if out.has_err() && !out.is_complete_done() {
            return Err(failure(format!(
                "snapshot remove of {} failed: {}",
                spec,
                out.stderr.trim()
            )));
        }
        if self.snap_exists(image, &target.name).await? {
            return Err(failure(format!("snapshot {} exists even after removal", spec)));
        }
        info!(snap = %spec, "Snapshot removed");
        Ok(())
    }

    /// Purge all user snapshots of `image` and confirm none remain.
    ///
    /// On a primary without user snapshots one is created first, and
    /// protected snapshots are unprotected before the purge.
    #[instrument(skip(self, image), fields(image = %image, role = %self.role))]
    pub async fn purge_snap_and_verify(&self, image: &ImageRef) -> Result<()> {
        if self.role.is_secondary() {
            let out = self.rbd.snap_purge(image).await?;
            return expect_read_only(&out, &format!("snapshot purge of {} on secondary", image));
        }

        let snaps: Vec<SnapInfo> = self
            .snap_list(image)
            .await?
            .into_iter()
            .filter(SnapInfo::is_user_defined)
            .collect();
        for snap in snaps.iter().filter(|s| s.protected) {
            let out = self.rbd.snap_unprotect(image, &snap.name).await?;
            if out.has_err() {
                return Err(failure(format!(
                    "error while unprotecting snapshot {}: {}",
                    image.snap_spec(&snap.name),
                    out.stderr.trim()
                )));
            }
        }
        if snaps.is_empty() {
            let snap = format!("snap_{}", random_string(5));
            info!(snap = %snap, "No user snapshots, creating one before purge");
            let out = self.rbd.snap_create(image, &snap).await?;
            if !out.is_complete_done() {
                return Err(failure(format!(
                    "snapshot create of {} failed: {}",
                    image.snap_spec(&snap),
                    out.stderr.trim()
                )));
            }
        }

        let out = self.rbd.snap_purge(image).await?;
        if out.has_err() && !out.is_complete_done() {
            return Err(failure(format!(
                "snapshot purge of {} failed: {}",
                image,
                out.stderr.trim()
            )));
        }

        let remaining = self
            .snap_list(image)
            .await?
            .iter()
            .filter(|s| s.is_user_defined())
            .count();
        if remaining > 0 {
            return Err(failure(format!(
                "snapshot purge did not delete all snapshots of {}, {} left",
                image, remaining
            )));
        }
        info!("Snapshots purged");
        Ok(())
    }

    // =========================================================================
    // Fan-out
    // =========================================================================

    /// Run `op` for each snapshot in `snaps`.
    ///
    /// Sequentially, the run stops at the first failure and the results up to
    /// and including it are returned. With `parallel`, every snapshot is
    /// processed concurrently and all results are returned; the caller
    /// decides whether any failure fails the batch.
    #[instrument(skip(self, image, snaps, op), fields(image = %image, op = ?op, count = snaps.len()))]
    pub async fn run_image_snap_ops(
        &self,
        image: &ImageRef,
        snaps: &[String],
        op: &SnapOp,
        parallel: bool,
    ) -> Vec<Result<()>> {
        if parallel {
            return join_all(snaps.iter().map(|snap| self.run_snap_op(image, op, snap))).await;
        }

        let mut results = Vec::with_capacity(snaps.len());
        for snap in snaps {
            let result = self.run_snap_op(image, op, snap).await;
            let failed = result.is_err();
            results.push(result);
            if failed {
                warn!(snap = %snap, "Snapshot operation failed, stopping");
                break;
            }
        }
        results
    }

    async fn run_snap_op(&self, image: &ImageRef, op: &SnapOp, snap: &str) -> Result<()> {
        match op {
            SnapOp::Create => self
                .snap_create_list_and_verify(image, Some(snap), &[])
                .await
                .map(|_| ()),
            SnapOp::Clone(ops) => self.clone_ops(image, ops, Some(snap), &[]).await,
            SnapOp::Rollback => self.snap_rollback_and_verify(image, Some(snap)).await,
            SnapOp::Remove => self.remove_snap_and_verify(image, Some(snap)).await,
        }
    }
}

/// Accept `out` only if it is the read-only refusal of a secondary.
fn expect_read_only(out: &CmdOutput, what: &str) -> Result<()> {
    if out.has_err() && out.stderr.contains(READ_ONLY_MARKER) {
        info!(operation = %what, "Failed as expected");
        return Ok(());
    }
    Err(role_violation(out, what))
}

/// Error for an outcome that is not the refusal expected on a secondary.
fn role_violation(out: &CmdOutput, what: &str) -> OperationError {
    if out.succeeded() {
        error!(operation = %what, "Did not fail as expected");
        OperationError::UnexpectedSuccess(format!("{} did not fail", what))
    } else {
        error!(operation = %what, stderr = %out.stderr.trim(), "Failed without read-only error");
        OperationError::UnexpectedFailure(format!(
            "{} failed without a read-only error: {}",
            what,
            out.stderr.trim()
        ))
    }
}

fn precondition(reason: String) -> OperationError {
    error!(reason = %reason, "Snapshot operation precondition missing");
    OperationError::PreconditionMissing(reason)
}

fn failure(reason: String) -> OperationError {
    error!(reason = %reason, "Snapshot operation failed");
    OperationError::UnexpectedFailure(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{ImageCreate, MockRbd, PoolCreate};
    use crate::config::JOURNAL_IMAGE_FEATURES;
    use crate::types::{MirrorMode, MirrorType, ScheduleScope};

    struct Sites {
        primary: Arc<MockRbd>,
        secondary: Arc<MockRbd>,
        image: ImageRef,
    }

    impl Sites {
        fn on_primary(&self) -> SnapCloneWorkflow {
            SnapCloneWorkflow::new(self.primary.clone(), ClusterRole::Primary)
                .with_peer(self.secondary.clone())
                .with_wait(WaitPolicy::immediate())
        }

        fn on_secondary(&self) -> SnapCloneWorkflow {
            SnapCloneWorkflow::new(self.secondary.clone(), ClusterRole::Secondary)
                .with_peer(self.primary.clone())
                .with_wait(WaitPolicy::immediate())
        }
    }

    async fn mirrored(mirror_type: MirrorType) -> Sites {
        let (a, b) = MockRbd::pair("site-a", "site-b");
        let (primary, secondary) = (Arc::new(a), Arc::new(b));
        for rbd in [&primary, &secondary] {
            rbd.pool_create(&PoolCreate::replicated("p")).await.unwrap();
            rbd.mirror_pool_enable("p", MirrorMode::Image).await.unwrap();
        }
        let image = ImageRef::new("p", "img0");
        primary
            .image_create(&ImageCreate {
                image: image.clone(),
                size: "1G".to_string(),
                data_pool: None,
                features: Some(JOURNAL_IMAGE_FEATURES.to_string()),
            })
            .await
            .unwrap();
        primary.mirror_image_enable(&image, mirror_type).await.unwrap();
        Sites {
            primary,
            secondary,
            image,
        }
    }

    #[tokio::test]
    async fn test_snap_create_on_primary_is_mirrored() {
        let sites = mirrored(MirrorType::Journal).await;
        let snap = sites
            .on_primary()
            .snap_create_list_and_verify(&sites.image, None, &[])
            .await
            .unwrap();
        assert!(snap.starts_with("snap_"));
        assert!(sites.on_secondary().snap_exists(&sites.image, &snap).await.unwrap());
    }

    #[tokio::test]
    async fn test_snap_create_on_secondary_fails_as_expected() {
        let sites = mirrored(MirrorType::Journal).await;
        sites
            .on_secondary()
            .snap_create_list_and_verify(&sites.image, Some("s1"), &[])
            .await
            .unwrap();
        assert!(!sites.on_secondary().snap_exists(&sites.image, "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_mutation_succeeding_on_secondary_is_a_violation() {
        let sites = mirrored(MirrorType::Journal).await;
        // Primary image checked as if it were the mirror target.
        let wrong_role = SnapCloneWorkflow::new(sites.primary.clone(), ClusterRole::Secondary);
        let err = wrong_role
            .snap_create_list_and_verify(&sites.image, Some("s1"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::UnexpectedSuccess(_)));
        assert!(err.is_role_violation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snap_create_verifies_schedules() {
        let sites = mirrored(MirrorType::Snapshot).await;
        sites
            .primary
            .mirror_snapshot_schedule_add(&ScheduleScope::Image(sites.image.clone()), "1m")
            .await
            .unwrap();
        sites
            .on_primary()
            .snap_create_list_and_verify(&sites.image, Some("s1"), &["1m".to_string()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clone_ops_on_primary() {
        let sites = mirrored(MirrorType::Journal).await;
        let workflow = sites.on_primary();
        workflow.snap_create_list_and_verify(&sites.image, Some("s1"), &[]).await.unwrap();

        let ops = CloneOps {
            num_clones_per_snap: 2,
            ..Default::default()
        };
        workflow.clone_ops(&sites.image, &ops, None, &[]).await.unwrap();

        assert_eq!(sites.primary.call_count("clone_image"), 2);
        assert_eq!(sites.primary.call_count("flatten"), 2);
        assert!(sites.primary.children(&sites.image, "s1").await.unwrap().is_empty());
        let snaps = workflow.get_user_defined_snaps(&sites.image).await.unwrap();
        assert!(!snaps[0].protected);
    }

    #[tokio::test]
    async fn test_clone_ops_on_secondary_protects_on_primary() {
        let sites = mirrored(MirrorType::Journal).await;
        sites
            .on_primary()
            .snap_create_list_and_verify(&sites.image, Some("s1"), &[])
            .await
            .unwrap();

        sites
            .on_secondary()
            .clone_ops(&sites.image, &CloneOps::default(), Some("s1"), &[])
            .await
            .unwrap();

        let primary_snaps = sites.primary.snap_list(&sites.image).await.unwrap();
        assert!(primary_snaps.iter().any(|s| s.name == "s1" && s.protected));
        assert_eq!(sites.secondary.call_count("snap_protect"), 1);
        assert_eq!(sites.secondary.call_count("snap_unprotect"), 1);
    }

    #[tokio::test]
    async fn test_clone_ops_without_user_snaps() {
        let sites = mirrored(MirrorType::Journal).await;
        let err = sites
            .on_primary()
            .clone_ops(&sites.image, &CloneOps::default(), None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::PreconditionMissing(_)));
    }

    #[tokio::test]
    async fn test_rollback_by_role() {
        let sites = mirrored(MirrorType::Journal).await;
        sites
            .on_primary()
            .snap_create_list_and_verify(&sites.image, Some("s1"), &[])
            .await
            .unwrap();
        sites.on_primary().snap_rollback_and_verify(&sites.image, None).await.unwrap();
        sites.on_secondary().snap_rollback_and_verify(&sites.image, None).await.unwrap();
        assert!(sites
            .on_primary()
            .snap_rollback_and_verify(&sites.image, Some("missing"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_remove_protected_snap_on_primary() {
        let sites = mirrored(MirrorType::Journal).await;
        let workflow = sites.on_primary();
        workflow.snap_create_list_and_verify(&sites.image, Some("s1"), &[]).await.unwrap();
        sites.primary.snap_protect(&sites.image, "s1").await.unwrap();

        sites.on_secondary().remove_snap_and_verify(&sites.image, Some("s1")).await.unwrap();
        workflow.remove_snap_and_verify(&sites.image, None).await.unwrap();
        assert!(!sites.on_secondary().snap_exists(&sites.image, "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_creates_snapshot_when_none_exist() {
        let sites = mirrored(MirrorType::Journal).await;
        sites.on_primary().purge_snap_and_verify(&sites.image).await.unwrap();
        assert_eq!(sites.primary.call_count("snap_create"), 1);
        assert_eq!(sites.primary.call_count("snap_purge"), 1);
        sites.on_secondary().purge_snap_and_verify(&sites.image).await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_unprotects_first() {
        let sites = mirrored(MirrorType::Journal).await;
        let workflow = sites.on_primary();
        for snap in ["s1", "s2"] {
            workflow.snap_create_list_and_verify(&sites.image, Some(snap), &[]).await.unwrap();
        }
        sites.primary.snap_protect(&sites.image, "s2").await.unwrap();
        workflow.purge_snap_and_verify(&sites.image).await.unwrap();
        assert_eq!(sites.primary.call_count("snap_unprotect"), 1);
    }

    #[tokio::test]
    async fn test_sequential_fan_out_stops_at_first_failure() {
        let sites = mirrored(MirrorType::Journal).await;
        let workflow = sites.on_primary();
        for snap in ["s1", "s2"] {
            workflow.snap_create_list_and_verify(&sites.image, Some(snap), &[]).await.unwrap();
        }
        let snaps = vec!["s1".to_string(), "missing".to_string(), "s2".to_string()];

        let results = workflow
            .run_image_snap_ops(&sites.image, &snaps, &SnapOp::Remove, false)
            .await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(workflow.snap_exists(&sites.image, "s2").await.unwrap());
    }

    #[tokio::test]
    async fn test_parallel_fan_out_returns_every_result() {
        let sites = mirrored(MirrorType::Journal).await;
        let workflow = sites.on_primary();
        let snaps: Vec<String> = (0..4).map(|i| format!("s{}", i)).collect();

        let created = workflow
            .run_image_snap_ops(&sites.image, &snaps, &SnapOp::Create, true)
            .await;
        assert!(created.iter().all(Result::is_ok));

        let mut with_missing = snaps.clone();
        with_missing.insert(1, "missing".to_string());
        let removed = workflow
            .run_image_snap_ops(&sites.image, &with_missing, &SnapOp::Remove, true)
            .await;
        assert_eq!(removed.len(), 5);
        assert_eq!(removed.iter().filter(|r| r.is_err()).count(), 1);
        assert!(workflow.get_user_defined_snaps(&sites.image).await.is_err());
    }
}
