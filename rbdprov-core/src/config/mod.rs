//! Scenario configuration: raw input, shape classification and expansion.

mod expand;
mod model;
mod raw;

pub use expand::{expand, expand_fresh, ExpandContext};
pub use model::{
    ExpandedConfig, ImageSpec, PoolAttrs, PoolSpec, PoolTypeConfig, SectionOptions, Size,
    DEFAULT_IMAGE_SIZE, JOURNAL_IMAGE_FEATURES,
};
pub use raw::{classify, getdict, ConfigShape, CountsParams, RawConfig, TEST_CONFIG_KEY};
