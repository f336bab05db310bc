//! User-facing configuration as authored in scenario files, and the
//! classifier that decides which shape each pool-type section has.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

use super::model::{read_lenient, Size};
use crate::error::{OperationError, Result};
use crate::types::{MirrorMode, MirrorType, MirrorWay, PoolType};

/// Reserved section key that carries per-scenario data, never a pool.
pub const TEST_CONFIG_KEY: &str = "test_config";

/// Scenario `config:` block before expansion.
///
/// Pool-type sections stay loosely typed until [`classify`] has decided
/// whether they are fully specified, counts based, or absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(rename = "ec-pool-only", default, skip_serializing_if = "is_false")]
    pub ec_pool_only: bool,
    #[serde(rename = "rep-pool-only", default, skip_serializing_if = "is_false")]
    pub rep_pool_only: bool,
    /// Create pools only
    #[serde(default, skip_serializing_if = "is_false")]
    pub do_not_create_image: bool,
    /// Omit `io_total` from synthesized images
    #[serde(default, skip_serializing_if = "is_false")]
    pub do_not_run_io: bool,
    /// Product build, e.g. `8.1`; its major number selects version dependent commands
    #[serde(default, deserialize_with = "string_or_number", skip_serializing_if = "Option::is_none")]
    pub rhbuild: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rep_pool_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec_pool_config: Option<Value>,
    /// Any other scenario keys, carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

pub(crate) fn is_false(b: &bool) -> bool {
    !*b
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

impl RawConfig {
    /// Parse a `config:` block from YAML (JSON is accepted as a YAML subset).
    ///
    /// A document whose only top-level key is `config` is unwrapped.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut doc: Value = serde_yaml::from_str(content)
            .map_err(|e| OperationError::InvalidConfig(format!("Failed to parse config: {}", e)))?;

        if let Value::Object(map) = &mut doc {
            if map.len() == 1 {
                if let Some(inner) = map.remove("config") {
                    doc = inner;
                }
            }
        }
        if doc.is_null() {
            return Ok(Self::default());
        }

        serde_json::from_value(doc)
            .map_err(|e| OperationError::InvalidConfig(format!("Invalid config block: {}", e)))
    }

    /// Load a `config:` block from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OperationError::InvalidConfig(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn section(&self, pool_type: PoolType) -> Option<&Value> {
        match pool_type {
            PoolType::Replicated => self.rep_pool_config.as_ref(),
            PoolType::ErasureCoded => self.ec_pool_config.as_ref(),
        }
    }

    pub fn section_mut(&mut self, pool_type: PoolType) -> &mut Option<Value> {
        match pool_type {
            PoolType::Replicated => &mut self.rep_pool_config,
            PoolType::ErasureCoded => &mut self.ec_pool_config,
        }
    }

    /// Pool types active for this configuration, in provisioning order.
    pub fn active_pool_types(&self) -> Vec<PoolType> {
        if self.ec_pool_only && self.rep_pool_only {
            warn!("Both ec-pool-only and rep-pool-only are set, provisioning both pool types");
            return PoolType::ALL.to_vec();
        }
        PoolType::ALL
            .iter()
            .copied()
            .filter(|pt| match pt {
                PoolType::Replicated => !self.ec_pool_only,
                PoolType::ErasureCoded => !self.rep_pool_only,
            })
            .collect()
    }
}

/// Count-and-defaults parameters of a counts based section.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CountsParams {
    pub num_pools: u32,
    #[serde(default = "one")]
    pub num_images: u32,
    #[serde(default)]
    pub num_secondary_images: u32,
    pub pool_prefix: Option<String>,
    pub image_prefix: Option<String>,
    pub data_pool_prefix: Option<String>,
    pub size: Option<Size>,
    pub io_total: Option<Size>,
    pub io_size: Option<Size>,
    pub pg_num: Option<u32>,
    pub pgp_num: Option<u32>,
    pub ec_pg_num: Option<u32>,
    pub ec_pgp_num: Option<u32>,
    pub mode: Option<MirrorMode>,
    pub mirrormode: Option<MirrorType>,
    pub way: Option<MirrorWay>,
    #[serde(rename = "ec-pool-k-m")]
    pub ec_pool_k_m: Option<String>,
    pub ec_profile: Option<String>,
    #[serde(default)]
    pub snap_schedule_levels: Vec<String>,
    #[serde(default)]
    pub snap_schedule_intervals: Vec<String>,
    #[serde(default)]
    pub do_not_enable_mirror_on_image: bool,
    pub test_config: Option<Value>,
    /// Keys that are not counts parameters, or whose value could not be read
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn one() -> u32 {
    1
}

/// Shape of one pool-type section, decided once by [`classify`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigShape<'a> {
    /// Already nested pool/image maps; passed through unchanged
    FullySpecified(&'a Map<String, Value>),
    /// `num_pools`, `num_images`, ... to be synthesized
    CountsBased(CountsParams),
    /// Neither pools nor a readable `num_pools`; one default pool with one
    /// default image, the authored keys kept as section options
    Defaults(&'a Map<String, Value>),
    /// Absent or empty; one default pool with one default image
    Empty,
}

/// Entries of `section` whose value is itself a mapping, excluding `test_config`.
///
/// These are the pools of a fully specified section (or the images of a pool).
pub fn getdict(section: &Map<String, Value>) -> impl Iterator<Item = (&String, &Map<String, Value>)> {
    section
        .iter()
        .filter(|(k, _)| k.as_str() != TEST_CONFIG_KEY)
        .filter_map(|(k, v)| v.as_object().map(|m| (k, m)))
}

/// Decide the shape of a pool-type section. Never fails: a mapping that is
/// neither nested nor a usable counts block becomes [`ConfigShape::Defaults`].
pub fn classify(section: Option<&Value>) -> ConfigShape<'_> {
    let map = match section {
        Some(Value::Object(map)) if !map.is_empty() => map,
        Some(Value::Object(_)) | Some(Value::Null) | None => return ConfigShape::Empty,
        Some(other) => {
            warn!(value = %other, "Pool section is not a mapping, using defaults");
            return ConfigShape::Empty;
        }
    };

    if getdict(map).next().is_some() {
        debug!("Pool section already fully specified");
        return ConfigShape::FullySpecified(map);
    }

    if let Some(num_pools) = map.get("num_pools") {
        let mut base = Map::new();
        base.insert("num_pools".to_string(), num_pools.clone());
        match read_lenient::<CountsParams>(map, &base) {
            Some((mut params, unread)) => {
                params.extra.extend(unread);
                return ConfigShape::CountsBased(params);
            }
            None => {
                warn!(num_pools = %num_pools, "num_pools is not a count, using defaults");
                return ConfigShape::Defaults(map);
            }
        }
    }

    debug!("Pool section has neither pools nor num_pools, using defaults");
    ConfigShape::Defaults(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_absent_and_empty() {
        assert_eq!(classify(None), ConfigShape::Empty);
        assert_eq!(classify(Some(&json!({}))), ConfigShape::Empty);
        assert_eq!(classify(Some(&json!(null))), ConfigShape::Empty);
        assert_eq!(classify(Some(&json!("yes"))), ConfigShape::Empty);
    }

    #[test]
    fn test_classify_fully_specified_ignores_scalars() {
        let section = json!({
            "do_not_enable_mirror_on_image": true,
            "pool_1": {"pg_num": 32, "image_1": {"size": "2G"}}
        });
        assert!(matches!(classify(Some(&section)), ConfigShape::FullySpecified(_)));
    }

    #[test]
    fn test_classify_test_config_alone_is_not_a_pool() {
        let section = json!({"num_pools": 1, "test_config": {"snap": "s"}});
        match classify(Some(&section)) {
            ConfigShape::CountsBased(params) => {
                assert_eq!(params.num_pools, 1);
                assert_eq!(params.num_images, 1);
                assert!(params.test_config.is_some());
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_classify_malformed_counts_defaults() {
        let section = json!({"num_pools": "many", "size": "2G"});
        assert_eq!(
            classify(Some(&section)),
            ConfigShape::Defaults(section.as_object().unwrap())
        );

        let scalars = json!({"do_not_enable_mirror_on_image": true});
        assert!(matches!(classify(Some(&scalars)), ConfigShape::Defaults(_)));
    }

    #[test]
    fn test_classify_counts_keeps_unreadable_keys() {
        let section = json!({
            "num_pools": 2,
            "pool_prefix": "p",
            "size": 2048,
            "pg_num": "lots",
            "owner": "qa"
        });
        match classify(Some(&section)) {
            ConfigShape::CountsBased(params) => {
                assert_eq!(params.num_pools, 2);
                assert_eq!(params.pool_prefix.as_deref(), Some("p"));
                assert_eq!(params.size, Some(Size::Bytes(2048)));
                assert_eq!(params.pg_num, None);
                assert_eq!(params.extra.get("pg_num"), Some(&json!("lots")));
                assert_eq!(params.extra.get("owner"), Some(&json!("qa")));
            }
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn test_getdict_only_mappings() {
        let section = json!({"a": 1, "b": {"x": 1}, "test_config": {"y": 2}});
        let keys: Vec<_> = getdict(section.as_object().unwrap()).map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec!["b".to_string()]);
    }

    #[test]
    fn test_active_pool_types() {
        let mut raw = RawConfig::default();
        assert_eq!(raw.active_pool_types(), vec![PoolType::Replicated, PoolType::ErasureCoded]);
        raw.ec_pool_only = true;
        assert_eq!(raw.active_pool_types(), vec![PoolType::ErasureCoded]);
        raw.ec_pool_only = false;
        raw.rep_pool_only = true;
        assert_eq!(raw.active_pool_types(), vec![PoolType::Replicated]);
    }

    #[test]
    fn test_from_yaml_unwraps_config_and_reads_rhbuild() {
        let raw = RawConfig::from_yaml_str(
            "config:\n  rhbuild: 8.1\n  rep-pool-only: true\n  rep_pool_config:\n    num_pools: 2\n",
        )
        .unwrap();
        assert!(raw.rep_pool_only);
        assert_eq!(raw.rhbuild.as_deref(), Some("8.1"));
        assert!(raw.rep_pool_config.is_some());
    }

    #[test]
    fn test_from_empty_yaml() {
        assert_eq!(RawConfig::from_yaml_str("").unwrap(), RawConfig::default());
    }
}
