//! Expansion of a sparse scenario configuration into a fully specified topology.

use indexmap::IndexMap;
use serde_json::Map;
use tracing::{debug, info, warn};

use super::model::{
    read_lenient, ExpandedConfig, ImageSpec, PoolAttrs, PoolSpec, PoolTypeConfig, SectionOptions,
    Size, DEFAULT_IMAGE_SIZE, JOURNAL_IMAGE_FEATURES,
};
use super::raw::{classify, ConfigShape, CountsParams, RawConfig};
use crate::names::{NamePlan, SectionNames};
use crate::types::{MirrorType, PoolType};

/// Which side of a provisioning run an expansion is for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpandContext {
    /// Synthesize the secondary subset of images
    pub is_secondary: bool,
    /// Synthesized images get the journaling feature unless snapshot mirroring is requested
    pub is_mirror: bool,
}

impl ExpandContext {
    pub fn primary() -> Self {
        Self::default()
    }

    pub fn mirror(is_secondary: bool) -> Self {
        Self {
            is_secondary,
            is_mirror: true,
        }
    }
}

/// Expand `raw` with a freshly generated [`NamePlan`].
pub fn expand_fresh(raw: &RawConfig, ctx: ExpandContext) -> ExpandedConfig {
    expand(raw, ctx, &NamePlan::generate())
}

/// Expand `raw` for one cluster.
///
/// Never fails: a section with neither pools nor a readable `num_pools`
/// becomes one default pool with one default image. Fully specified sections
/// pass through unchanged, keys that could not be read included, so
/// expanding [`ExpandedConfig::to_raw`] again is a no-op.
pub fn expand(raw: &RawConfig, ctx: ExpandContext, plan: &NamePlan) -> ExpandedConfig {
    let pool_types = raw.active_pool_types();
    let mut sections = IndexMap::new();

    for &pool_type in &pool_types {
        let names = plan.section(pool_type);
        let section = match classify(raw.section(pool_type)) {
            ConfigShape::FullySpecified(map) => PoolTypeConfig::from_section(map),
            ConfigShape::CountsBased(params) => counts_section(pool_type, &params, raw, ctx, names),
            ConfigShape::Defaults(map) => {
                let mut section = default_section(pool_type, raw, ctx, names);
                let (options, unread) = read_lenient::<SectionOptions>(map, &Map::new())
                    .unwrap_or_else(|| (SectionOptions::default(), map.clone()));
                section.options = options;
                section.options.extra.extend(unread);
                section
            }
            ConfigShape::Empty => {
                info!(
                    pool_type = %pool_type,
                    "No configuration provided, creating one pool and one image with default parameters"
                );
                default_section(pool_type, raw, ctx, names)
            }
        };
        debug!(
            pool_type = %pool_type,
            pools = section.pools.len(),
            images = section.image_count(),
            "Expanded pool section"
        );
        sections.insert(pool_type, section);
    }

    ExpandedConfig {
        pool_types,
        sections,
        do_not_create_image: raw.do_not_create_image,
        do_not_run_io: raw.do_not_run_io,
        rhbuild: raw.rhbuild.clone(),
        extra: raw.extra.clone(),
    }
}

fn default_section(
    pool_type: PoolType,
    raw: &RawConfig,
    ctx: ExpandContext,
    names: &SectionNames,
) -> PoolTypeConfig {
    let image = ImageSpec {
        size: Some(Size::from(DEFAULT_IMAGE_SIZE)),
        io_total: (!raw.do_not_run_io).then(|| Size::from(DEFAULT_IMAGE_SIZE)),
        is_secondary: ctx.is_secondary,
        ..Default::default()
    };
    let attrs = PoolAttrs {
        data_pool: pool_type.is_ec().then(|| names.data_pool_stem.clone()),
        ..Default::default()
    };

    let mut images = IndexMap::new();
    images.insert(names.image_stem(ctx.is_secondary).to_string(), image);
    let mut pools = IndexMap::new();
    pools.insert(names.pool_stem.clone(), PoolSpec { attrs, images });

    PoolTypeConfig {
        pools,
        options: SectionOptions::default(),
    }
}

fn counts_section(
    pool_type: PoolType,
    params: &CountsParams,
    raw: &RawConfig,
    ctx: ExpandContext,
    names: &SectionNames,
) -> PoolTypeConfig {
    if params.num_secondary_images > params.num_images {
        warn!(
            pool_type = %pool_type,
            num_images = params.num_images,
            num_secondary_images = params.num_secondary_images,
            "num_secondary_images exceeds num_images"
        );
    }
    let images_per_pool = if ctx.is_secondary {
        params.num_secondary_images
    } else {
        params.num_images.saturating_sub(params.num_secondary_images)
    };

    let pool_prefix = params.pool_prefix.as_deref().unwrap_or(&names.pool_stem);
    let image_prefix = params
        .image_prefix
        .as_deref()
        .unwrap_or_else(|| names.image_stem(ctx.is_secondary));
    let data_pool_prefix = params
        .data_pool_prefix
        .as_deref()
        .unwrap_or(&names.data_pool_stem);

    let journaled = ctx.is_mirror && params.mirrormode != Some(MirrorType::Snapshot);

    let mut pools = IndexMap::new();
    for i in 0..params.num_pools {
        let mut images = IndexMap::new();
        for j in 0..images_per_pool {
            let image = ImageSpec {
                size: Some(params.size.clone().unwrap_or_else(|| Size::from(DEFAULT_IMAGE_SIZE))),
                io_total: (!raw.do_not_run_io).then(|| {
                    params
                        .io_total
                        .clone()
                        .unwrap_or_else(|| Size::from(DEFAULT_IMAGE_SIZE))
                }),
                io_size: params.io_size.clone(),
                is_secondary: ctx.is_secondary,
                image_feature: journaled.then(|| JOURNAL_IMAGE_FEATURES.to_string()),
                snap_schedule_levels: params.snap_schedule_levels.clone(),
                snap_schedule_intervals: params.snap_schedule_intervals.clone(),
                extra: Map::new(),
            };
            images.insert(format!("{}{}", image_prefix, j), image);
        }

        let mut attrs = PoolAttrs {
            pg_num: params.pg_num,
            pgp_num: params.pg_num.and(params.pgp_num),
            mode: params.mode,
            mirrormode: params.mirrormode,
            way: params.way,
            ..Default::default()
        };
        if pool_type.is_ec() {
            attrs.ec_pg_num = params.pg_num.and(params.ec_pg_num);
            attrs.ec_pgp_num = params.pg_num.and(params.ec_pgp_num);
            attrs.data_pool = Some(format!("{}{}", data_pool_prefix, i));
            attrs.ec_pool_k_m = params.ec_pool_k_m.clone();
            attrs.ec_profile = params.ec_profile.clone();
        }

        pools.insert(format!("{}{}", pool_prefix, i), PoolSpec { attrs, images });
    }

    PoolTypeConfig {
        pools,
        options: SectionOptions {
            do_not_enable_mirror_on_image: params.do_not_enable_mirror_on_image,
            test_config: params.test_config.clone(),
            extra: params.extra.clone(),
        },
    }
}
