//! RBD binding layer.
//!
//! Every cluster operation the provisioners and workflows need goes through
//! the [`RbdBinding`] trait:
//!
//! - [`RbdCli`] drives the `rbd`/`ceph` command line tools through a
//!   [`CommandRunner`] (local process or SSH)
//! - [`MockRbd`] is an in-memory cluster for tests, pairable with a peer to
//!   simulate mirroring
//!
//! Mutating calls hand back the raw [`CmdOutput`] so callers can apply the
//! completion and read-only marker rules. Listing calls parse the tool's
//! JSON output and return typed values; differences in how the tools format
//! their output are resolved here and nowhere else.

mod cli;
mod mock;
mod runner;

pub use cli::RbdCli;
pub use mock::MockRbd;
pub use runner::{shell_quote, CommandRunner, LocalRunner, SshRunner};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CmdOutput, GroupImageIdentity, GroupSpec, ImageRef, MirrorImageStatus, MirrorMode,
    MirrorPoolStatus, MirrorType, PeerDirection, ScheduleScope, SnapInfo,
};

/// Parameters for creating a pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolCreate {
    pub pool: String,
    pub pg_num: Option<u32>,
    pub pgp_num: Option<u32>,
    /// Erasure code profile; creates an erasure coded pool when set
    pub ec_profile: Option<String>,
}

impl PoolCreate {
    pub fn replicated(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            ..Default::default()
        }
    }
}

/// Parameters for creating an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCreate {
    pub image: ImageRef,
    pub size: String,
    pub data_pool: Option<String>,
    /// Comma separated feature list
    pub features: Option<String>,
}

/// Parameters for cloning a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub source: ImageRef,
    pub snap: String,
    pub dest: ImageRef,
    /// Clone by snapshot id instead of name
    pub snap_id: Option<u64>,
    /// `rbd_default_clone_format` override (1 or 2)
    pub clone_format: Option<u8>,
}

/// One RBD cluster as seen from a client node.
#[async_trait]
pub trait RbdBinding: Send + Sync {
    // =========================================================================
    // Pools
    // =========================================================================

    /// Create a replicated or erasure coded pool.
    async fn pool_create(&self, req: &PoolCreate) -> Result<CmdOutput>;

    /// Set an erasure code profile, `k_m` given as `k,m`.
    async fn ec_profile_set(&self, profile: &str, k_m: &str) -> Result<CmdOutput>;

    /// Set a pool option (`allow_ec_overwrites`, ...).
    async fn pool_set(&self, pool: &str, key: &str, value: &str) -> Result<CmdOutput>;

    async fn pool_application_enable(&self, pool: &str, app: &str) -> Result<CmdOutput>;

    async fn pool_init(&self, pool: &str) -> Result<CmdOutput>;

    /// `rbd pool stats`; an error on stderr means the pool does not exist.
    async fn pool_stats(&self, pool: &str) -> Result<CmdOutput>;

    // =========================================================================
    // Namespaces
    // =========================================================================

    async fn namespace_list(&self, pool: &str) -> Result<Vec<String>>;

    async fn namespace_create(&self, pool: &str, namespace: &str) -> Result<CmdOutput>;

    // =========================================================================
    // Images
    // =========================================================================

    async fn image_create(&self, req: &ImageCreate) -> Result<CmdOutput>;

    async fn image_list(&self, pool: &str, namespace: Option<&str>) -> Result<Vec<String>>;

    /// Write `io_total` bytes to an image.
    async fn bench_write(&self, image: &ImageRef, io_total: &str, io_size: Option<&str>) -> Result<CmdOutput>;

    async fn image_meta_set(&self, image: &ImageRef, key: &str, value: &str) -> Result<CmdOutput>;

    /// Value on stdout.
    async fn image_meta_get(&self, image: &ImageRef, key: &str) -> Result<CmdOutput>;

    /// `ceph config set <who> <key> <value>`
    async fn config_set(&self, who: &str, key: &str, value: &str) -> Result<CmdOutput>;

    /// `ceph config get <who> <key>`, value on stdout.
    async fn config_get(&self, who: &str, key: &str) -> Result<CmdOutput>;

    // =========================================================================
    // Groups
    // =========================================================================

    async fn group_create(&self, group: &GroupSpec) -> Result<CmdOutput>;

    /// Rename `group` to `new_name`, keeping its pool and namespace.
    async fn group_rename(&self, group: &GroupSpec, new_name: &str) -> Result<CmdOutput>;

    async fn group_remove(&self, group: &GroupSpec) -> Result<CmdOutput>;

    /// Group names in a pool (and namespace).
    async fn group_list(&self, pool: &str, namespace: Option<&str>) -> Result<Vec<String>>;

    async fn group_image_add(&self, group: &GroupSpec, image: &ImageRef) -> Result<CmdOutput>;

    /// Member images, each normalized to a full identity.
    async fn group_image_list(&self, group: &GroupSpec) -> Result<Vec<GroupImageIdentity>>;

    async fn group_snap_create(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput>;

    async fn group_snap_list(&self, group: &GroupSpec) -> Result<Vec<String>>;

    async fn group_snap_rollback(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput>;

    async fn group_info(&self, group: &GroupSpec) -> Result<CmdOutput>;

    async fn group_snap_info(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput>;

    // =========================================================================
    // Snapshots and clones
    // =========================================================================

    async fn snap_create(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput>;

    /// All snapshots of an image, every namespace included.
    async fn snap_list(&self, image: &ImageRef) -> Result<Vec<SnapInfo>>;

    async fn snap_protect(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput>;

    async fn snap_unprotect(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput>;

    async fn snap_remove(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput>;

    async fn snap_rollback(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput>;

    async fn snap_purge(&self, image: &ImageRef) -> Result<CmdOutput>;

    async fn clone_image(&self, req: &CloneRequest) -> Result<CmdOutput>;

    /// Clones of a snapshot.
    async fn children(&self, image: &ImageRef, snap: &str) -> Result<Vec<ImageRef>>;

    async fn flatten(&self, image: &ImageRef) -> Result<CmdOutput>;

    // =========================================================================
    // Mirroring
    // =========================================================================

    async fn mirror_pool_enable(&self, pool: &str, mode: MirrorMode) -> Result<CmdOutput>;

    /// Bootstrap token on stdout.
    async fn mirror_peer_bootstrap_create(&self, pool: &str, site_name: &str) -> Result<CmdOutput>;

    async fn mirror_peer_bootstrap_import(
        &self,
        pool: &str,
        site_name: &str,
        token: &str,
        direction: PeerDirection,
    ) -> Result<CmdOutput>;

    /// Register `remote` (`client@cluster`) as a peer of `pool` without a
    /// bootstrap token.
    async fn mirror_pool_peer_add(&self, pool: &str, remote: &str, direction: PeerDirection) -> Result<CmdOutput>;

    /// Site names of the pool's mirror peers.
    async fn mirror_pool_peers(&self, pool: &str) -> Result<Vec<String>>;

    async fn mirror_pool_status(&self, pool: &str) -> Result<MirrorPoolStatus>;

    async fn mirror_image_enable(&self, image: &ImageRef, mirror_type: MirrorType) -> Result<CmdOutput>;

    async fn mirror_image_status(&self, image: &ImageRef) -> Result<MirrorImageStatus>;

    async fn mirror_snapshot_schedule_add(&self, scope: &ScheduleScope, interval: &str) -> Result<CmdOutput>;
}
