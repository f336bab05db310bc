//! Pool and image creation for one cluster.

use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use super::check;
use crate::binding::{ImageCreate, PoolCreate, RbdBinding};
use crate::config::{ExpandedConfig, PoolAttrs, PoolTypeConfig};
use crate::error::{OperationError, Result};
use crate::types::{ImageRef, PoolType};

/// Placement groups used when a pool does not set `pg_num`.
pub const DEFAULT_PG_NUM: u32 = 64;

/// Placement groups of an erasure coded data pool without `ec_pg_num`.
pub const DEFAULT_EC_PG_NUM: u32 = 12;

/// Erasure code profile used when neither `ec_profile` nor `ec-pool-k-m` is given.
pub const DEFAULT_EC_PROFILE: &str = "default";

/// Creates the pools of one pool type and the images of the calling side.
#[async_trait]
pub trait PoolProvisioner: Send + Sync {
    /// Provision every pool in `section`.
    ///
    /// Only images whose `is_secondary` flag equals `is_secondary` are
    /// created; the other side of a mirror relationship creates the rest.
    async fn provision(
        &self,
        rbd: &dyn RbdBinding,
        pool_type: PoolType,
        section: &PoolTypeConfig,
        config: &ExpandedConfig,
        is_secondary: bool,
    ) -> Result<()>;
}

/// [`PoolProvisioner`] driving the cluster through an [`RbdBinding`].
#[derive(Debug, Clone, Default)]
pub struct RbdPoolProvisioner;

impl RbdPoolProvisioner {
    /// Create a new pool provisioner.
    pub fn new() -> Self {
        Self
    }

    async fn create_replicated_pool(
        &self,
        rbd: &dyn RbdBinding,
        pool: &str,
        attrs: &PoolAttrs,
        ceph_version: Option<u32>,
    ) -> Result<()> {
        let pg_num = attrs.pg_num.unwrap_or(DEFAULT_PG_NUM);
        let req = PoolCreate {
            pool: pool.to_string(),
            pg_num: Some(pg_num),
            pgp_num: Some(attrs.pgp_num.unwrap_or(pg_num)),
            ec_profile: None,
        };
        let out = rbd.pool_create(&req).await?;
        check(&out, || format!("create pool {}", pool))?;
        self.init_pool(rbd, pool, ceph_version).await
    }

    async fn create_data_pool(
        &self,
        rbd: &dyn RbdBinding,
        pool: &str,
        data_pool: &str,
        attrs: &PoolAttrs,
        ceph_version: Option<u32>,
    ) -> Result<()> {
        let profile = match (&attrs.ec_profile, &attrs.ec_pool_k_m) {
            (Some(profile), Some(k_m)) => {
                self.set_profile(rbd, profile, k_m).await?;
                profile.clone()
            }
            (None, Some(k_m)) => {
                let profile = format!("rbd_ec_profile_{}", pool);
                self.set_profile(rbd, &profile, k_m).await?;
                profile
            }
            (Some(profile), None) => profile.clone(),
            (None, None) => DEFAULT_EC_PROFILE.to_string(),
        };

        let pg_num = attrs.ec_pg_num.unwrap_or(DEFAULT_EC_PG_NUM);
        let req = PoolCreate {
            pool: data_pool.to_string(),
            pg_num: Some(pg_num),
            pgp_num: Some(attrs.ec_pgp_num.unwrap_or(pg_num)),
            ec_profile: Some(profile),
        };
        let out = rbd.pool_create(&req).await?;
        check(&out, || format!("create data pool {}", data_pool))?;

        let out = rbd.pool_set(data_pool, "allow_ec_overwrites", "true").await?;
        check(&out, || format!("enable ec overwrites on {}", data_pool))?;

        self.init_pool(rbd, data_pool, ceph_version).await
    }

    async fn set_profile(&self, rbd: &dyn RbdBinding, profile: &str, k_m: &str) -> Result<()> {
        debug!(profile = %profile, k_m = %k_m, "Setting erasure code profile");
        let out = rbd.ec_profile_set(profile, k_m).await?;
        check(&out, || format!("set erasure code profile {}", profile))
    }

    /// Tag the pool for rbd and initialize it (pool init exists from major version 3).
    async fn init_pool(&self, rbd: &dyn RbdBinding, pool: &str, ceph_version: Option<u32>) -> Result<()> {
        let out = rbd.pool_application_enable(pool, "rbd").await?;
        check(&out, || format!("enable rbd application on {}", pool))?;

        if ceph_version.map_or(true, |v| v >= 3) {
            let out = rbd.pool_init(pool).await?;
            check(&out, || format!("init pool {}", pool))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PoolProvisioner for RbdPoolProvisioner {
    #[instrument(skip(self, rbd, section, config), fields(pool_type = %pool_type))]
    async fn provision(
        &self,
        rbd: &dyn RbdBinding,
        pool_type: PoolType,
        section: &PoolTypeConfig,
        config: &ExpandedConfig,
        is_secondary: bool,
    ) -> Result<()> {
        let ceph_version = config.ceph_major_version();

        for (pool, spec) in &section.pools {
            info!(pool = %pool, "Creating pool");
            self.create_replicated_pool(rbd, pool, &spec.attrs, ceph_version).await?;

            let data_pool = if pool_type.is_ec() {
                let data_pool = spec.attrs.data_pool.as_deref().ok_or_else(|| {
                    error!(pool = %pool, "Erasure coded pool has no data pool");
                    OperationError::PreconditionMissing(format!(
                        "erasure coded pool {} has no data_pool",
                        pool
                    ))
                })?;
                self.create_data_pool(rbd, pool, data_pool, &spec.attrs, ceph_version)
                    .await?;
                Some(data_pool.to_string())
            } else {
                None
            };

            if config.do_not_create_image {
                debug!(pool = %pool, "Image creation disabled");
                continue;
            }

            for (name, image) in spec.images_for_role(is_secondary) {
                let image_ref = ImageRef::new(pool.clone(), name.clone());
                let req = ImageCreate {
                    image: image_ref.clone(),
                    size: image.size_or_default(),
                    data_pool: data_pool.clone(),
                    features: image.image_feature.clone(),
                };
                let out = rbd.image_create(&req).await?;
                check(&out, || format!("create image {}", image_ref))?;
                info!(image = %image_ref, size = %req.size, "Image created");

                if let (Some(io_total), false) = (&image.io_total, config.do_not_run_io) {
                    let io_total = io_total.to_string();
                    let io_size = image.io_size.as_ref().map(|s| s.to_string());
                    let out = rbd
                        .bench_write(&image_ref, &io_total, io_size.as_deref())
                        .await?;
                    check(&out, || format!("write {} to image {}", io_total, image_ref))?;
                    debug!(image = %image_ref, io_total = %io_total, "IO completed");
                }
            }
        }

        Ok(())
    }
}
