//! Core type definitions shared by the expander, provisioners and workflows.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{OperationError, Result};

/// Marker printed by long running rbd operations on completion.
pub const COMPLETION_MARKER: &str = "100% complete";

/// Stricter completion marker used by snapshot create/remove/purge and flatten.
pub const COMPLETION_DONE_MARKER: &str = "100% complete...done";

/// Error class returned by mutating calls on a non-primary (mirror target) image.
pub const READ_ONLY_MARKER: &str = "Read-only file system";

/// Exact read-only error printed by `rbd snap create` on a non-primary image.
pub const SNAP_CREATE_READ_ONLY: &str = "failed to create snapshot: (30) Read-only file system";

/// Outcome recorded when snapshot mirroring is rejected for a pool in pool mode.
pub const POOL_MODE_SNAPSHOT_REJECTION: &str =
    "Snapshot based mirroring cannot be enabled in pool mode";

/// Outcome recorded when pool-mode snapshot mirroring was expected to fail but did not.
pub const POOL_MODE_SNAPSHOT_NOT_REJECTED: &str =
    "Snapshot based mirroring did not fail in pool mode";

/// rbd error for `mirror image enable` on a pool that is not in image mode.
pub const POOL_NOT_IN_IMAGE_MODE: &str =
    "cannot enable mirroring: pool is not in image mirror mode";

/// rbd message for `mirror pool enable` on an already configured pool.
pub const MIRROR_ALREADY_CONFIGURED: &str = "rbd: mirroring is already configured";

/// Image-meta key holding the journal replay delay (seconds) of one image.
pub const REPLAY_DELAY_META_KEY: &str = "conf_rbd_mirroring_replay_delay";

/// Cluster config key holding the journal replay delay (seconds) for a client.
pub const REPLAY_DELAY_CONFIG_KEY: &str = "rbd_mirroring_replay_delay";

/// Pool type tag. Selects the naming scheme and the EC-only fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PoolType {
    /// Replicated pools (`rep_pool_config`)
    #[serde(rename = "rep_pool_config")]
    Replicated,
    /// Erasure coded pools (`ec_pool_config`)
    #[serde(rename = "ec_pool_config")]
    ErasureCoded,
}

impl PoolType {
    /// All pool types in provisioning order.
    pub const ALL: [PoolType; 2] = [PoolType::Replicated, PoolType::ErasureCoded];

    /// Configuration key for this pool type.
    pub fn config_key(self) -> &'static str {
        match self {
            PoolType::Replicated => "rep_pool_config",
            PoolType::ErasureCoded => "ec_pool_config",
        }
    }

    /// Prefix used for synthesized names (`rep`, `ec`).
    pub fn name_stem(self) -> &'static str {
        match self {
            PoolType::Replicated => "rep",
            PoolType::ErasureCoded => "ec",
        }
    }

    pub fn is_ec(self) -> bool {
        self == PoolType::ErasureCoded
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_key())
    }
}

/// Role of a cluster handle in a mirror relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    Primary,
    Secondary,
}

impl ClusterRole {
    pub fn from_is_secondary(is_secondary: bool) -> Self {
        if is_secondary {
            ClusterRole::Secondary
        } else {
            ClusterRole::Primary
        }
    }

    pub fn is_secondary(self) -> bool {
        self == ClusterRole::Secondary
    }
}

impl fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterRole::Primary => f.write_str("primary"),
            ClusterRole::Secondary => f.write_str("secondary"),
        }
    }
}

/// Mirroring granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorMode {
    Pool,
    Image,
}

impl MirrorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MirrorMode::Pool => "pool",
            MirrorMode::Image => "image",
        }
    }
}

/// Mirroring mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorType {
    Journal,
    Snapshot,
}

impl MirrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            MirrorType::Journal => "journal",
            MirrorType::Snapshot => "snapshot",
        }
    }
}

/// Peer direction of a mirror relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorWay {
    #[serde(rename = "one-way")]
    OneWay,
    #[serde(rename = "two-way")]
    TwoWay,
}

/// Reference to an image: `pool/[namespace/]image`.
///
/// An empty namespace is normalized to `None`, so two references to the same
/// image compare equal however the namespace was reported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub pool: String,
    pub namespace: Option<String>,
    pub image: String,
}

/// Identity of an image that is a member of a group.
pub type GroupImageIdentity = ImageRef;

impl ImageRef {
    pub fn new(pool: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            namespace: None,
            image: image.into(),
        }
    }

    pub fn with_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_string);
        self
    }

    /// Parse `pool/image` or `pool/namespace/image`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (pool, namespace, image) = split_spec(spec, "image")?;
        Ok(Self::new(pool, image).with_namespace(namespace))
    }

    /// `pool/[namespace/]image`
    pub fn spec(&self) -> String {
        join_spec(&self.pool, self.namespace.as_deref(), &self.image)
    }

    /// `pool/[namespace/]image@snap`
    pub fn snap_spec(&self, snap: &str) -> String {
        format!("{}@{}", self.spec(), snap)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec())
    }
}

/// A consistency group: `pool/[namespace/]group`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupSpec {
    pub pool: String,
    pub namespace: Option<String>,
    pub group: String,
}

impl GroupSpec {
    pub fn new(pool: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            namespace: None,
            group: group.into(),
        }
    }

    pub fn with_namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.filter(|ns| !ns.is_empty()).map(str::to_string);
        self
    }

    /// Parse `pool/group` or `pool/namespace/group`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (pool, namespace, group) = split_spec(spec, "group")?;
        Ok(Self::new(pool, group).with_namespace(namespace))
    }

    /// `pool/[namespace/]group`
    pub fn spec(&self) -> String {
        join_spec(&self.pool, self.namespace.as_deref(), &self.group)
    }

    /// `pool/[namespace/]group@snap`
    pub fn snap_spec(&self, snap: &str) -> String {
        format!("{}@{}", self.spec(), snap)
    }
}

impl fmt::Display for GroupSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec())
    }
}

fn join_spec(pool: &str, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{}/{}/{}", pool, ns, name),
        None => format!("{}/{}", pool, name),
    }
}

fn split_spec<'a>(spec: &'a str, what: &str) -> Result<(&'a str, Option<&'a str>, &'a str)> {
    let parts: Vec<&str> = spec.split('/').collect();
    match parts.as_slice() {
        [pool, name] if !pool.is_empty() && !name.is_empty() => Ok((*pool, None, *name)),
        [pool, ns, name] if !pool.is_empty() && !name.is_empty() => Ok((*pool, Some(*ns), *name)),
        _ => Err(OperationError::InvalidConfig(format!(
            "{} spec '{}' must be pool/{} or pool/namespace/{}",
            what, spec, what, what
        ))),
    }
}

/// Raw output of one binding call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status, when the call was a process
    pub status: Option<i32>,
}

impl CmdOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: Some(0),
        }
    }

    /// Successful long running operation: progress on stderr ending with the marker.
    pub fn completed(operation: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: format!("{}: {}.\n", operation, COMPLETION_DONE_MARKER),
            status: Some(0),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            status: Some(1),
        }
    }

    /// stdout followed by stderr.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Zero exit status, or no error output when there is no status.
    pub fn exit_ok(&self) -> bool {
        match self.status {
            Some(code) => code == 0,
            None => !self.has_err(),
        }
    }

    pub fn has_err(&self) -> bool {
        !self.stderr.trim().is_empty()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }

    /// `100% complete` anywhere in the output.
    pub fn is_complete(&self) -> bool {
        self.combined().contains(COMPLETION_MARKER)
    }

    /// `100% complete...done` anywhere in the output.
    pub fn is_complete_done(&self) -> bool {
        self.combined().contains(COMPLETION_DONE_MARKER)
    }

    pub fn is_read_only(&self) -> bool {
        self.stderr.contains(READ_ONLY_MARKER)
    }

    /// No error, or an error stream that is only progress ending in completion.
    pub fn succeeded(&self) -> bool {
        !self.has_err() || self.is_complete()
    }
}

/// One entry of `rbd snap ls --all --format json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapInfo {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, deserialize_with = "bool_or_string")]
    pub protected: bool,
    #[serde(default)]
    pub namespace: Option<SnapNamespace>,
}

/// Snapshot namespace (`user`, `mirror`, `group`, `trash`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapNamespace {
    #[serde(rename = "type")]
    pub kind: String,
}

impl SnapInfo {
    pub fn user(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            size: 0,
            protected: false,
            namespace: Some(SnapNamespace { kind: "user".to_string() }),
        }
    }

    pub fn is_user_defined(&self) -> bool {
        self.namespace.as_ref().map(|ns| ns.kind == "user").unwrap_or(false)
    }
}

fn bool_or_string<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        Str(String),
    }

    Ok(match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => b,
        BoolOrString::Str(s) => s.eq_ignore_ascii_case("true"),
    })
}

/// Mirror status of one image as reported by `rbd mirror image status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorImageStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub description: String,
    /// Mirror snapshot ids, for snapshot based mirroring
    #[serde(default)]
    pub snapshot_ids: Vec<u64>,
}

impl MirrorImageStatus {
    pub fn is_local_primary(&self) -> bool {
        self.description.contains("local image is primary")
    }

    /// Journal entries not yet replayed, from a `replaying, {...}` description.
    pub fn entries_behind_primary(&self) -> Option<u64> {
        let rest = self.description.split("entries_behind_primary\":").nth(1)?;
        rest.trim_start()
            .split(|c: char| !c.is_ascii_digit())
            .next()?
            .parse()
            .ok()
    }
}

/// Summary of `rbd mirror pool status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorPoolStatus {
    #[serde(default)]
    pub health: String,
    #[serde(default)]
    pub daemon_health: String,
    #[serde(default)]
    pub image_health: String,
}

impl MirrorPoolStatus {
    pub fn is_ok(&self) -> bool {
        self.health == "OK"
    }
}

/// Direction of a bootstrapped mirror peer, as seen from the importing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerDirection {
    #[serde(rename = "rx-only")]
    RxOnly,
    #[serde(rename = "rx-tx")]
    RxTx,
}

impl PeerDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerDirection::RxOnly => "rx-only",
            PeerDirection::RxTx => "rx-tx",
        }
    }
}

impl From<MirrorWay> for PeerDirection {
    fn from(way: MirrorWay) -> Self {
        match way {
            MirrorWay::OneWay => PeerDirection::RxOnly,
            MirrorWay::TwoWay => PeerDirection::RxTx,
        }
    }
}

/// Target of a mirror snapshot schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScheduleScope {
    Cluster,
    Pool {
        pool: String,
        namespace: Option<String>,
    },
    Image(ImageRef),
}

impl ScheduleScope {
    /// Scope for a configured level name. Unknown levels are image level.
    pub fn from_level(level: &str, image: &ImageRef) -> Self {
        match level {
            "cluster" => ScheduleScope::Cluster,
            "pool" => ScheduleScope::Pool {
                pool: image.pool.clone(),
                namespace: None,
            },
            "namespace" if image.namespace.is_some() => ScheduleScope::Pool {
                pool: image.pool.clone(),
                namespace: image.namespace.clone(),
            },
            _ => ScheduleScope::Image(image.clone()),
        }
    }
}

/// Parse a schedule interval such as `1m`, `3h` or `1d`. Bare numbers are minutes.
pub fn parse_interval(interval: &str) -> Option<Duration> {
    let interval = interval.trim();
    let split = interval
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(interval.len());
    let (digits, unit) = interval.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let secs = match unit {
        "" | "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}
