//! Canonical, fully expanded configuration model.

use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use tracing::warn;

use super::raw::{getdict, is_false, RawConfig, TEST_CONFIG_KEY};
use crate::types::{MirrorMode, MirrorType, MirrorWay, PoolType};

/// Feature set required on images mirrored with journaling.
pub const JOURNAL_IMAGE_FEATURES: &str = "exclusive-lock,journaling";

/// Default image size and IO volume.
pub const DEFAULT_IMAGE_SIZE: &str = "1G";

/// A size or byte count as authored: `1024` or `"10G"`.
///
/// Kept in its authored form so that writing a configuration back out
/// reproduces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Size {
    Bytes(u64),
    Text(String),
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Size::Bytes(n) => write!(f, "{}", n),
            Size::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Size {
    fn from(s: &str) -> Self {
        Size::Text(s.to_string())
    }
}

/// Read `map` as `T`, setting aside the entries `T` cannot read.
///
/// Every entry is tried on its own, together with `base`. Entries that fail
/// come back untouched for the caller to carry along. `None` when even the
/// readable entries do not form a `T`.
pub(crate) fn read_lenient<T: DeserializeOwned>(
    map: &Map<String, Value>,
    base: &Map<String, Value>,
) -> Option<(T, Map<String, Value>)> {
    if let Ok(value) = serde_json::from_value(Value::Object(map.clone())) {
        return Some((value, Map::new()));
    }

    let mut readable = base.clone();
    let mut unread = Map::new();
    for (key, value) in map.iter().filter(|(k, _)| !base.contains_key(k.as_str())) {
        let mut single = base.clone();
        single.insert(key.clone(), value.clone());
        if serde_json::from_value::<T>(Value::Object(single)).is_ok() {
            readable.insert(key.clone(), value.clone());
        } else {
            unread.insert(key.clone(), value.clone());
        }
    }
    if !unread.is_empty() {
        warn!(keys = ?unread.keys().collect::<Vec<_>>(), "Configuration keys could not be read, keeping them as authored");
    }
    serde_json::from_value(Value::Object(readable))
        .ok()
        .map(|value| (value, unread))
}

/// Read `map` as `T`, moving unreadable entries into `T`'s catch-all map.
fn read_with_extra<T, F>(map: &Map<String, Value>, extra: F) -> T
where
    T: DeserializeOwned + Default,
    F: FnOnce(&mut T) -> &mut Map<String, Value>,
{
    let (mut value, unread) = read_lenient::<T>(map, &Map::new()).unwrap_or_else(|| (T::default(), map.clone()));
    extra(&mut value).extend(unread);
    value
}

/// One image entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_total: Option<Size>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub io_size: Option<Size>,
    /// Created by the secondary side of a mirror relationship
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_secondary: bool,
    #[serde(rename = "image-feature", default, skip_serializing_if = "Option::is_none")]
    pub image_feature: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snap_schedule_levels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snap_schedule_intervals: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageSpec {
    pub fn size_or_default(&self) -> String {
        self.size
            .as_ref()
            .map(Size::to_string)
            .unwrap_or_else(|| DEFAULT_IMAGE_SIZE.to_string())
    }

    /// `(level, interval)` pairs; unpaired trailing entries are ignored.
    pub fn snap_schedules(&self) -> impl Iterator<Item = (&str, &str)> {
        self.snap_schedule_levels
            .iter()
            .zip(self.snap_schedule_intervals.iter())
            .map(|(l, i)| (l.as_str(), i.as_str()))
    }
}

/// Scalar attributes of a pool entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pg_num: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgp_num: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec_pg_num: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec_pgp_num: Option<u32>,
    /// Companion data pool (EC only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_pool: Option<String>,
    /// `k,m` for the erasure code profile
    #[serde(rename = "ec-pool-k-m", default, skip_serializing_if = "Option::is_none")]
    pub ec_pool_k_m: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<MirrorMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirrormode: Option<MirrorType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub way: Option<MirrorWay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rbd_client: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One pool entry: scalar attributes plus its images, keyed by image name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolSpec {
    pub attrs: PoolAttrs,
    pub images: IndexMap<String, ImageSpec>,
}

impl PoolSpec {
    /// Split an authored pool mapping into attributes and images.
    ///
    /// Entries that do not fit their typed field are kept in `extra`.
    pub fn from_map(map: &Map<String, Value>) -> Self {
        let scalars: Map<String, Value> = map
            .iter()
            .filter(|(k, v)| !v.is_object() || k.as_str() == TEST_CONFIG_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let attrs: PoolAttrs = read_with_extra(&scalars, |a: &mut PoolAttrs| &mut a.extra);

        let images = getdict(map)
            .map(|(name, image)| {
                let spec: ImageSpec = read_with_extra(image, |i: &mut ImageSpec| &mut i.extra);
                (name.clone(), spec)
            })
            .collect();

        Self { attrs, images }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = match serde_json::to_value(&self.attrs) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (name, image) in &self.images {
            if let Ok(value) = serde_json::to_value(image) {
                map.insert(name.clone(), value);
            }
        }
        map
    }

    /// Images created by the side whose role matches `is_secondary`.
    pub fn images_for_role(&self, is_secondary: bool) -> impl Iterator<Item = (&String, &ImageSpec)> {
        self.images
            .iter()
            .filter(move |(_, spec)| spec.is_secondary == is_secondary)
    }
}

impl Serialize for PoolSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PoolSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let map = Map::<String, Value>::deserialize(deserializer)?;
        Ok(PoolSpec::from_map(&map))
    }
}

/// Section-level options that are not pools.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SectionOptions {
    #[serde(default, skip_serializing_if = "is_false")]
    pub do_not_enable_mirror_on_image: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_config: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// All pools of one pool type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolTypeConfig {
    pub pools: IndexMap<String, PoolSpec>,
    pub options: SectionOptions,
}

impl PoolTypeConfig {
    /// Parse a fully specified section. Nothing authored is dropped.
    pub fn from_section(section: &Map<String, Value>) -> Self {
        let pools = getdict(section)
            .map(|(name, pool)| (name.clone(), PoolSpec::from_map(pool)))
            .collect();

        let rest: Map<String, Value> = section
            .iter()
            .filter(|(k, v)| k.as_str() == TEST_CONFIG_KEY || !v.is_object())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let options: SectionOptions = read_with_extra(&rest, |o: &mut SectionOptions| &mut o.extra);

        Self { pools, options }
    }

    /// Section mapping in authored (fully specified) form.
    pub fn to_section(&self) -> Map<String, Value> {
        let mut map = match serde_json::to_value(&self.options) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (name, pool) in &self.pools {
            map.insert(name.clone(), Value::Object(pool.to_map()));
        }
        map
    }

    pub fn image_count(&self) -> usize {
        self.pools.values().map(|p| p.images.len()).sum()
    }
}

impl Serialize for PoolTypeConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_section().serialize(serializer)
    }
}

/// Fully expanded configuration for one cluster.
///
/// Produced by [`super::expand`]; read-only for every downstream step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpandedConfig {
    /// Active pool types, in provisioning order
    pub pool_types: Vec<PoolType>,
    pub sections: IndexMap<PoolType, PoolTypeConfig>,
    pub do_not_create_image: bool,
    pub do_not_run_io: bool,
    pub rhbuild: Option<String>,
    /// Scenario keys not interpreted here
    pub extra: Map<String, Value>,
}

impl ExpandedConfig {
    pub fn section(&self, pool_type: PoolType) -> Option<&PoolTypeConfig> {
        self.sections.get(&pool_type)
    }

    /// Major product version from `rhbuild` (`"8.1"` -> 8).
    pub fn ceph_major_version(&self) -> Option<u32> {
        let build = self.rhbuild.as_deref()?;
        build
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|major| major.parse().ok())
    }

    /// Back to the authored form, with every section fully specified.
    ///
    /// Expanding the result again yields an equal configuration.
    pub fn to_raw(&self) -> RawConfig {
        let mut raw = RawConfig {
            ec_pool_only: !self.pool_types.contains(&PoolType::Replicated),
            rep_pool_only: !self.pool_types.contains(&PoolType::ErasureCoded),
            do_not_create_image: self.do_not_create_image,
            do_not_run_io: self.do_not_run_io,
            rhbuild: self.rhbuild.clone(),
            extra: self.extra.clone(),
            ..Default::default()
        };
        for (pool_type, section) in &self.sections {
            *raw.section_mut(*pool_type) = Some(Value::Object(section.to_section()));
        }
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pool_spec_splits_images_from_attrs() {
        let pool = json!({
            "pg_num": 32,
            "pgp_num": 32,
            "mode": "image",
            "mirrormode": "snapshot",
            "image_1": {"size": "2G", "is_secondary": true},
            "image_2": {"size": "4G", "io_total": "100M"}
        });
        let spec = PoolSpec::from_map(pool.as_object().unwrap());
        assert_eq!(spec.attrs.pg_num, Some(32));
        assert_eq!(spec.attrs.mode, Some(MirrorMode::Image));
        assert_eq!(spec.attrs.mirrormode, Some(MirrorType::Snapshot));
        assert_eq!(spec.images.len(), 2);
        assert_eq!(spec.images_for_role(true).count(), 1);
        assert_eq!(spec.images_for_role(false).next().unwrap().0, "image_2");
    }

    #[test]
    fn test_pool_spec_map_roundtrip_keeps_unknown_keys() {
        let pool = json!({"custom_flag": "x", "img": {"size": "1G", "encryption": "luks2"}});
        let spec = PoolSpec::from_map(pool.as_object().unwrap());
        assert_eq!(spec.attrs.extra.get("custom_flag"), Some(&json!("x")));
        let again = PoolSpec::from_map(&spec.to_map());
        assert_eq!(spec, again);
    }

    #[test]
    fn test_section_keeps_test_config_out_of_pools() {
        let section = json!({
            "do_not_enable_mirror_on_image": true,
            "test_config": {"group": "g1"},
            "p1": {"i1": {}}
        });
        let parsed = PoolTypeConfig::from_section(section.as_object().unwrap());
        assert_eq!(parsed.pools.len(), 1);
        assert!(parsed.options.do_not_enable_mirror_on_image);
        assert!(parsed.options.test_config.is_some());
        assert_eq!(parsed.image_count(), 1);
    }

    #[test]
    fn test_numeric_sizes_are_read_and_kept() {
        let pool = json!({"disk": {"size": 1024, "io_total": "10M"}});
        let spec = PoolSpec::from_map(pool.as_object().unwrap());
        let disk = &spec.images["disk"];
        assert_eq!(disk.size, Some(Size::Bytes(1024)));
        assert_eq!(disk.size_or_default(), "1024");
        assert_eq!(disk.io_total, Some(Size::from("10M")));
        assert_eq!(Value::Object(spec.to_map()), pool);
    }

    #[test]
    fn test_unreadable_entries_stay_as_authored() {
        let pool = json!({
            "pg_num": "lots",
            "mode": "sideways",
            "way": "one-way",
            "test_config": {"snap": "s1"},
            "img": {"size": [1, 2], "is_secondary": true}
        });
        let spec = PoolSpec::from_map(pool.as_object().unwrap());
        assert_eq!(spec.attrs.pg_num, None);
        assert_eq!(spec.attrs.mode, None);
        assert!(spec.attrs.way.is_some());
        assert_eq!(spec.attrs.extra.get("pg_num"), Some(&json!("lots")));
        assert_eq!(spec.attrs.extra.get("test_config"), Some(&json!({"snap": "s1"})));
        assert_eq!(spec.images.len(), 1);
        assert!(spec.images["img"].is_secondary);
        assert_eq!(Value::Object(spec.to_map()), pool);
    }

    #[test]
    fn test_ceph_major_version() {
        let mut config = ExpandedConfig::default();
        assert_eq!(config.ceph_major_version(), None);
        config.rhbuild = Some("8.1-rhel-9".into());
        assert_eq!(config.ceph_major_version(), Some(8));
    }

    #[test]
    fn test_image_snap_schedules_pairs() {
        let image = ImageSpec {
            snap_schedule_levels: vec!["image".into(), "pool".into()],
            snap_schedule_intervals: vec!["1m".into()],
            ..Default::default()
        };
        assert_eq!(image.snap_schedules().collect::<Vec<_>>(), vec![("image", "1m")]);
    }
}
