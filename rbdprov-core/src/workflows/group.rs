//! Consistency group operations, each confirmed by reading the result back.

use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::binding::RbdBinding;
use crate::error::{OperationError, Result};
use crate::names::random_string;
use crate::provision::ProvisioningHandle;
use crate::types::{CmdOutput, GroupSpec, ImageRef};

/// Pool used when a group or image spec does not name one.
pub const DEFAULT_POOL: &str = "rbd";

/// Create-then-confirm operations on RBD consistency groups.
#[derive(Clone)]
pub struct GroupWorkflow {
    rbd: Arc<dyn RbdBinding>,
}

impl GroupWorkflow {
    /// Create a new group workflow running against `rbd`.
    pub fn new(rbd: Arc<dyn RbdBinding>) -> Self {
        Self { rbd }
    }

    pub fn from_handle(handle: &ProvisioningHandle) -> Self {
        Self::new(handle.rbd.clone())
    }

    /// Create `group` and confirm it is listed.
    ///
    /// The pool must exist. A namespace that is not listed yet is created
    /// first.
    #[instrument(skip(self, group), fields(group = %group))]
    pub async fn create_group_and_verify(&self, group: &GroupSpec) -> Result<()> {
        let stats = self.rbd.pool_stats(&group.pool).await?;
        if stats.has_err() || !stats.exit_ok() {
            return Err(precondition(format!(
                "pool {} does not exist: {}",
                group.pool,
                stats.stderr.trim()
            )));
        }

        if let Some(namespace) = &group.namespace {
            let namespaces = self.rbd.namespace_list(&group.pool).await.map_err(|e| {
                precondition(format!("listing namespaces of {} failed: {}", group.pool, e))
            })?;
            if !namespaces.iter().any(|ns| ns == namespace) {
                info!(pool = %group.pool, namespace = %namespace, "Namespace not found, creating it");
                let out = self.rbd.namespace_create(&group.pool, namespace).await?;
                if out.has_err() {
                    return Err(failure(format!(
                        "namespace {}/{} creation failed: {}",
                        group.pool,
                        namespace,
                        out.stderr.trim()
                    )));
                }
            }
        }

        if group.group.is_empty() {
            return Err(precondition("group name is required".to_string()));
        }

        let out = self.rbd.group_create(group).await?;
        if out.has_err() {
            return Err(failure(format!(
                "group {} creation failed: {}",
                group,
                out.stderr.trim()
            )));
        }

        let groups = self
            .rbd
            .group_list(&group.pool, group.namespace.as_deref())
            .await?;
        if !groups.iter().any(|g| g == &group.group) {
            return Err(failure(format!("group {} not listed after creation", group)));
        }

        info!("Group created and verified");
        Ok(())
    }

    /// Add `image` to `group` and confirm the group lists it.
    #[instrument(skip(self, group, image), fields(group = %group, image = %image))]
    pub async fn add_image_to_group_and_verify(&self, group: &GroupSpec, image: &ImageRef) -> Result<()> {
        if group.group.is_empty() {
            return Err(precondition("group name is required".to_string()));
        }
        if image.image.is_empty() {
            return Err(precondition("image name is required".to_string()));
        }

        let out = self.rbd.group_image_add(group, image).await?;
        if out.has_err() {
            return Err(failure(format!(
                "adding image {} to group {} failed: {}",
                image,
                group,
                out.stderr.trim()
            )));
        }

        let members = self.rbd.group_image_list(group).await?;
        if !members.contains(image) {
            return Err(failure(format!(
                "image {} not listed in group {} after add",
                image, group
            )));
        }

        info!("Image added to group and verified");
        Ok(())
    }

    /// Create a group snapshot and confirm it is listed.
    ///
    /// A random name is used when `snap` is `None`. Returns the snapshot name.
    #[instrument(skip(self, group), fields(group = %group))]
    pub async fn create_snap_and_verify(&self, group: &GroupSpec, snap: Option<&str>) -> Result<String> {
        let snap = snap
            .map(str::to_string)
            .unwrap_or_else(|| format!("snap_{}", random_string(5)));

        let out = self.rbd.group_snap_create(group, &snap).await?;
        if out.has_err() {
            return Err(failure(format!(
                "group snapshot {} creation failed: {}",
                group.snap_spec(&snap),
                out.stderr.trim()
            )));
        }

        let snaps = self.rbd.group_snap_list(group).await?;
        if !snaps.iter().any(|s| s == &snap) {
            return Err(failure(format!(
                "group snapshot {} not listed after creation",
                group.snap_spec(&snap)
            )));
        }

        info!(snap = %snap, "Group snapshot created and verified");
        Ok(snap)
    }

    /// Roll `group` back to `snap`.
    ///
    /// Error output only counts as failure when it lacks the completion marker.
    #[instrument(skip(self, group, snap), fields(group = %group, snap = %snap))]
    pub async fn rollback_to_snap(&self, group: &GroupSpec, snap: &str) -> Result<()> {
        if group.group.is_empty() {
            return Err(precondition("group name is required".to_string()));
        }
        if snap.is_empty() {
            return Err(precondition("group snapshot name is required".to_string()));
        }

        let out = self.rbd.group_snap_rollback(group, snap).await?;
        if out.has_err() && !out.is_complete() {
            return Err(failure(format!(
                "rollback of group {} failed: {}",
                group.snap_spec(snap),
                out.stderr.trim()
            )));
        }

        info!("Group rolled back to snapshot");
        Ok(())
    }

    pub async fn group_info(&self, group: &GroupSpec) -> Result<CmdOutput> {
        self.rbd.group_info(group).await
    }

    pub async fn group_snap_info(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput> {
        self.rbd.group_snap_info(group, snap).await
    }
}

/// Group from a `pool/[namespace/]group` spec, or from discrete fields.
///
/// `pool` defaults to [`DEFAULT_POOL`].
pub fn group_spec(spec: Option<&str>, pool: Option<&str>, namespace: Option<&str>, group: &str) -> Result<GroupSpec> {
    match spec {
        Some(spec) => GroupSpec::parse(spec),
        None => Ok(GroupSpec::new(pool.unwrap_or(DEFAULT_POOL), group).with_namespace(namespace)),
    }
}

/// Image from a `pool/[namespace/]image` spec, or from discrete fields.
///
/// `pool` defaults to [`DEFAULT_POOL`].
pub fn image_ref(spec: Option<&str>, pool: Option<&str>, namespace: Option<&str>, image: &str) -> Result<ImageRef> {
    match spec {
        Some(spec) => ImageRef::parse(spec),
        None => Ok(ImageRef::new(pool.unwrap_or(DEFAULT_POOL), image).with_namespace(namespace)),
    }
}

fn precondition(reason: String) -> OperationError {
    error!(reason = %reason, "Group operation precondition missing");
    OperationError::PreconditionMissing(reason)
}

fn failure(reason: String) -> OperationError {
    error!(reason = %reason, "Group operation failed");
    OperationError::UnexpectedFailure(reason)
}
