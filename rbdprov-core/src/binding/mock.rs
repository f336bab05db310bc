//! In-memory RBD cluster for testing and development.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{CloneRequest, ImageCreate, PoolCreate, RbdBinding};
use crate::error::{OperationError, Result};
use crate::types::*;

/// Mock RBD cluster for testing.
///
/// Simulates pools, namespaces, images, groups and snapshots in memory.
/// Two instances built with [`MockRbd::pair`] behave like two mirrored
/// sites:
/// - enabling image mirroring creates a read-only replica on the peer
/// - snapshots and image-meta follow the primary to its replica
/// - journal writes reach the replica after the configured replay delay
/// - mirror snapshot schedules produce a new mirror snapshot per elapsed
///   interval (measured on the tokio clock)
///
/// Any operation can be made to fail with [`MockRbd::fail_on`].
pub struct MockRbd {
    state: Arc<RwLock<MockState>>,
    peer: Option<Arc<RwLock<MockState>>>,
}

struct MockState {
    site_name: String,
    pools: HashMap<String, MockPool>,
    ec_profiles: HashMap<String, String>,
    config: HashMap<(String, String), String>,
    images: HashMap<ImageRef, MockImage>,
    groups: HashMap<GroupSpec, MockGroup>,
    schedules: Vec<MockSchedule>,
    next_snap_id: u64,
    canned: HashMap<String, CmdOutput>,
    calls: Vec<String>,
}

#[derive(Default)]
struct MockPool {
    ec_profile: Option<String>,
    options: HashMap<String, String>,
    applications: BTreeSet<String>,
    initialized: bool,
    namespaces: BTreeSet<String>,
    mirror_mode: Option<MirrorMode>,
    peers: BTreeSet<String>,
}

#[derive(Clone)]
struct MockImage {
    size: u64,
    data_pool: Option<String>,
    features: Vec<String>,
    primary: bool,
    mirror: Option<MirrorType>,
    snaps: Vec<MockSnap>,
    meta: HashMap<String, String>,
    parent: Option<(ImageRef, String)>,
    /// Journal entries not yet replayed: (count, replayable at)
    pending: Vec<(u64, Instant)>,
    journal_tid: u64,
}

#[derive(Clone)]
struct MockSnap {
    id: u64,
    name: String,
    size: u64,
    protected: bool,
    mirror: bool,
}

#[derive(Default)]
struct MockGroup {
    images: Vec<ImageRef>,
    snaps: Vec<String>,
}

struct MockSchedule {
    scope: ScheduleScope,
    interval: Duration,
    last: Instant,
}

impl MockState {
    fn new(site_name: &str) -> Self {
        let mut ec_profiles = HashMap::new();
        ec_profiles.insert("default".to_string(), "2,1".to_string());
        Self {
            site_name: site_name.to_string(),
            pools: HashMap::new(),
            ec_profiles,
            config: HashMap::new(),
            images: HashMap::new(),
            groups: HashMap::new(),
            schedules: Vec::new(),
            next_snap_id: 0,
            canned: HashMap::new(),
            calls: Vec::new(),
        }
    }

    /// Record a call; returns the injected failure for `op`, if any.
    fn record(&mut self, op: &str) -> Option<CmdOutput> {
        self.calls.push(op.to_string());
        self.canned.get(op).cloned()
    }

    fn record_query(&mut self, op: &str) -> Result<()> {
        match self.record(op) {
            Some(out) if !out.exit_ok() => Err(OperationError::CommandFailed(out.stderr)),
            _ => Ok(()),
        }
    }

    fn has_pool(&self, pool: &str, namespace: Option<&str>) -> bool {
        match self.pools.get(pool) {
            Some(p) => namespace.map(|ns| p.namespaces.contains(ns)).unwrap_or(true),
            None => false,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_snap_id += 1;
        self.next_snap_id
    }

    fn user_snaps(&self, image: &ImageRef) -> Vec<MockSnap> {
        self.images
            .get(image)
            .map(|i| i.snaps.clone())
            .unwrap_or_default()
    }

    fn add_mirror_snapshot(&mut self, image: &ImageRef) {
        let id = self.next_id();
        let name = format!(".mirror.primary.{}.{}", self.site_name, id);
        if let Some(img) = self.images.get_mut(image) {
            let size = img.size;
            img.snaps.push(MockSnap {
                id,
                name,
                size,
                protected: false,
                mirror: true,
            });
        }
    }
}

fn no_pool(pool: &str) -> CmdOutput {
    CmdOutput::failed(format!(
        "rbd: error opening pool '{}': (2) No such file or directory\n",
        pool
    ))
}

fn no_image(image: &ImageRef) -> CmdOutput {
    CmdOutput::failed(format!(
        "rbd: error opening image {}: (2) No such file or directory\n",
        image.image
    ))
}

fn no_snap(snap: &str) -> CmdOutput {
    CmdOutput::failed(format!(
        "rbd: snapshot '{}' does not exist: (2) No such file or directory\n",
        snap
    ))
}

fn read_only(action: &str) -> CmdOutput {
    CmdOutput::failed(format!("rbd: {} failed: (30) {}\n", action, READ_ONLY_MARKER))
}

fn already_exists(what: &str) -> CmdOutput {
    CmdOutput::failed(format!("rbd: {} failed: (17) File exists\n", what))
}

fn busy(what: &str) -> CmdOutput {
    CmdOutput::failed(format!("rbd: {} failed: (16) Device or resource busy\n", what))
}

/// Ceph style reply: informational text on stderr with a zero exit status.
fn ceph_ok(message: String) -> CmdOutput {
    CmdOutput {
        stdout: String::new(),
        stderr: message,
        status: Some(0),
    }
}

fn query_err(out: CmdOutput) -> OperationError {
    OperationError::CommandFailed(out.stderr.trim().to_string())
}

/// Parse `1G`, `512M`, `10` (MiB) into bytes.
fn parse_size(size: &str) -> Option<u64> {
    let size = size.trim();
    let split = size.find(|c: char| !c.is_ascii_digit()).unwrap_or(size.len());
    let (digits, unit) = size.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let shift = match unit.to_ascii_uppercase().as_str() {
        "B" => 0,
        "K" | "KB" | "KIB" => 10,
        "" | "M" | "MB" | "MIB" => 20,
        "G" | "GB" | "GIB" => 30,
        "T" | "TB" | "TIB" => 40,
        _ => return None,
    };
    Some(value << shift)
}

fn schedule_applies(scope: &ScheduleScope, image: &ImageRef) -> bool {
    match scope {
        ScheduleScope::Cluster => true,
        ScheduleScope::Pool { pool, namespace } => {
            &image.pool == pool && (namespace.is_none() || &image.namespace == namespace)
        }
        ScheduleScope::Image(target) => target == image,
    }
}

fn make_replica(image: &MockImage) -> MockImage {
    let mut replica = image.clone();
    replica.primary = false;
    replica.parent = None;
    replica.pending.clear();
    for snap in &mut replica.snaps {
        snap.protected = false;
    }
    replica
}

fn install_replica(peer: &mut MockState, image: ImageRef, replica: MockImage) {
    if !peer.has_pool(&image.pool, image.namespace.as_deref()) {
        warn!(site = %peer.site_name, image = %image, "Peer pool missing, image not replicated");
        return;
    }
    if peer.images.get(&image).map(|i| i.primary).unwrap_or(false) {
        warn!(site = %peer.site_name, image = %image, "Peer already has a primary image with this name");
        return;
    }
    debug!(site = %peer.site_name, image = %image, "Replica created");
    peer.images.insert(image, replica);
}

/// Replace the replica's snapshot list; protect state stays local.
fn sync_snaps(peer: &mut MockState, image: &ImageRef, snaps: Vec<MockSnap>) {
    if let Some(replica) = peer.images.get_mut(image).filter(|r| !r.primary) {
        let protected: HashSet<String> = replica
            .snaps
            .iter()
            .filter(|s| s.protected)
            .map(|s| s.name.clone())
            .collect();
        replica.snaps = snaps
            .into_iter()
            .map(|mut s| {
                s.protected = protected.contains(&s.name);
                s
            })
            .collect();
    }
}

impl MockRbd {
    /// Create a new standalone mock cluster.
    pub fn new(site_name: &str) -> Self {
        info!(site = %site_name, "Creating mock RBD cluster");
        Self {
            state: Arc::new(RwLock::new(MockState::new(site_name))),
            peer: None,
        }
    }

    /// Create two mock clusters that mirror to each other.
    pub fn pair(primary_site: &str, secondary_site: &str) -> (Self, Self) {
        info!(primary = %primary_site, secondary = %secondary_site, "Creating mirrored mock RBD clusters");
        let a = Arc::new(RwLock::new(MockState::new(primary_site)));
        let b = Arc::new(RwLock::new(MockState::new(secondary_site)));
        (
            Self {
                state: a.clone(),
                peer: Some(b.clone()),
            },
            Self {
                state: b,
                peer: Some(a),
            },
        )
    }

    pub fn site_name(&self) -> String {
        self.state
            .read()
            .map(|s| s.site_name.clone())
            .unwrap_or_default()
    }

    /// Make every later call of `op` (a trait method name) fail with `stderr`.
    pub fn fail_on(&self, op: &str, stderr: &str) {
        if let Ok(mut s) = self.state.write() {
            s.canned.insert(op.to_string(), CmdOutput::failed(stderr));
        }
    }

    /// Make every later call of `op` succeed with `stdout` and change nothing.
    pub fn stub_on(&self, op: &str, stdout: &str) {
        if let Ok(mut s) = self.state.write() {
            s.canned.insert(op.to_string(), CmdOutput::ok(stdout));
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut s) = self.state.write() {
            s.canned.clear();
        }
    }

    /// Names of the trait methods called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.state.read().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.state
            .read()
            .map(|s| s.calls.iter().filter(|c| c.as_str() == op).count())
            .unwrap_or(0)
    }

    pub fn pool_exists(&self, pool: &str) -> bool {
        self.state
            .read()
            .map(|s| s.pools.contains_key(pool))
            .unwrap_or(false)
    }

    pub fn pool_option(&self, pool: &str, key: &str) -> Option<String> {
        let s = self.state.read().ok()?;
        s.pools.get(pool)?.options.get(key).cloned()
    }

    pub fn pool_is_initialized(&self, pool: &str) -> bool {
        self.state
            .read()
            .ok()
            .and_then(|s| s.pools.get(pool).map(|p| p.initialized && p.applications.contains("rbd")))
            .unwrap_or(false)
    }

    pub fn pool_mirror_mode(&self, pool: &str) -> Option<MirrorMode> {
        let s = self.state.read().ok()?;
        s.pools.get(pool)?.mirror_mode
    }

    /// `Some(true)` for a primary image, `Some(false)` for a replica.
    pub fn image_is_primary(&self, image: &ImageRef) -> Option<bool> {
        let s = self.state.read().ok()?;
        s.images.get(image).map(|i| i.primary)
    }

    pub fn image_features(&self, image: &ImageRef) -> Option<Vec<String>> {
        let s = self.state.read().ok()?;
        s.images.get(image).map(|i| i.features.clone())
    }

    pub fn image_data_pool(&self, image: &ImageRef) -> Option<String> {
        let s = self.state.read().ok()?;
        s.images.get(image)?.data_pool.clone()
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MockState>> {
        self.state
            .write()
            .map_err(|_| OperationError::Internal("Lock poisoned".to_string()))
    }

    /// Apply `f` to the peer cluster, if paired. Never called with our own lock held.
    fn with_peer<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> Result<Option<T>> {
        match &self.peer {
            Some(peer) => {
                let mut p = peer
                    .write()
                    .map_err(|_| OperationError::Internal("Lock poisoned".to_string()))?;
                Ok(Some(f(&mut p)))
            }
            None => Ok(None),
        }
    }

    fn push_snaps(&self, image: &ImageRef, snaps: Vec<MockSnap>) -> Result<()> {
        self.with_peer(|p| sync_snaps(p, image, snaps))?;
        Ok(())
    }
}

#[async_trait]
impl RbdBinding for MockRbd {
    #[instrument(skip(self, req), fields(pool = %req.pool))]
    async fn pool_create(&self, req: &PoolCreate) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("pool_create") {
            return Ok(out);
        }
        if s.pools.contains_key(&req.pool) {
            return Ok(ceph_ok(format!("pool '{}' already exists\n", req.pool)));
        }
        if let Some(profile) = &req.ec_profile {
            if !s.ec_profiles.contains_key(profile) {
                return Ok(CmdOutput::failed(format!(
                    "Error ENOENT: specified erasure code profile '{}' does not exist\n",
                    profile
                )));
            }
        }
        s.pools.insert(
            req.pool.clone(),
            MockPool {
                ec_profile: req.ec_profile.clone(),
                ..Default::default()
            },
        );
        debug!("Mock pool created");
        Ok(ceph_ok(format!("pool '{}' created\n", req.pool)))
    }

    async fn ec_profile_set(&self, profile: &str, k_m: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("ec_profile_set") {
            return Ok(out);
        }
        let valid = k_m
            .split_once(',')
            .map(|(k, m)| k.trim().parse::<u32>().is_ok() && m.trim().parse::<u32>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Ok(CmdOutput::failed(format!(
                "Error EINVAL: invalid k,m '{}'\n",
                k_m
            )));
        }
        s.ec_profiles.insert(profile.to_string(), k_m.to_string());
        Ok(CmdOutput::ok(""))
    }

    async fn pool_set(&self, pool: &str, key: &str, value: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("pool_set") {
            return Ok(out);
        }
        let Some(p) = s.pools.get_mut(pool) else {
            return Ok(CmdOutput::failed(format!("Error ENOENT: unrecognized pool '{}'\n", pool)));
        };
        if key == "allow_ec_overwrites" && p.ec_profile.is_none() {
            return Ok(CmdOutput::failed(
                "Error EINVAL: ec overwrites can only be enabled for an erasure coded pool\n",
            ));
        }
        p.options.insert(key.to_string(), value.to_string());
        Ok(ceph_ok(format!("set pool {} {} to {}\n", pool, key, value)))
    }

    async fn pool_application_enable(&self, pool: &str, app: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("pool_application_enable") {
            return Ok(out);
        }
        let Some(p) = s.pools.get_mut(pool) else {
            return Ok(CmdOutput::failed(format!("Error ENOENT: unrecognized pool '{}'\n", pool)));
        };
        p.applications.insert(app.to_string());
        Ok(ceph_ok(format!("enabled application '{}' on pool '{}'\n", app, pool)))
    }

    async fn pool_init(&self, pool: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("pool_init") {
            return Ok(out);
        }
        let Some(p) = s.pools.get_mut(pool) else {
            return Ok(no_pool(pool));
        };
        p.initialized = true;
        p.applications.insert("rbd".to_string());
        Ok(CmdOutput::ok(""))
    }

    async fn pool_stats(&self, pool: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("pool_stats") {
            return Ok(out);
        }
        if !s.pools.contains_key(pool) {
            return Ok(CmdOutput::failed(
                "rbd: failed to query pool stats: (2) No such file or directory\n",
            ));
        }
        let images: Vec<&MockImage> = s
            .images
            .iter()
            .filter(|(r, _)| r.pool == pool)
            .map(|(_, i)| i)
            .collect();
        let snaps: usize = images.iter().map(|i| i.snaps.len()).sum();
        let provisioned: u64 = images.iter().map(|i| i.size).sum();
        Ok(CmdOutput::ok(format!(
            "Total Images: {}\nTotal Snapshots: {}\nProvisioned Size: {} B\n",
            images.len(),
            snaps,
            provisioned
        )))
    }

    async fn namespace_list(&self, pool: &str) -> Result<Vec<String>> {
        let mut s = self.write()?;
        s.record_query("namespace_list")?;
        let p = s.pools.get(pool).ok_or_else(|| query_err(no_pool(pool)))?;
        Ok(p.namespaces.iter().cloned().collect())
    }

    async fn namespace_create(&self, pool: &str, namespace: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("namespace_create") {
            return Ok(out);
        }
        let Some(p) = s.pools.get_mut(pool) else {
            return Ok(no_pool(pool));
        };
        if !p.namespaces.insert(namespace.to_string()) {
            return Ok(already_exists("namespace create"));
        }
        Ok(CmdOutput::ok(""))
    }

    #[instrument(skip(self, req), fields(image = %req.image))]
    async fn image_create(&self, req: &ImageCreate) -> Result<CmdOutput> {
        let image = &req.image;
        let replica = {
            let mut s = self.write()?;
            if let Some(out) = s.record("image_create") {
                return Ok(out);
            }
            if !s.has_pool(&image.pool, image.namespace.as_deref()) {
                return Ok(no_pool(&image.pool));
            }
            if s.images.contains_key(image) {
                return Ok(already_exists("create"));
            }
            let pool_mode = match s.pools.get(&image.pool) {
                Some(p) if p.ec_profile.is_some() => {
                    return Ok(CmdOutput::failed(
                        "rbd: create error: (95) Operation not supported\n",
                    ));
                }
                Some(p) => p.mirror_mode,
                None => None,
            };
            if let Some(data_pool) = &req.data_pool {
                match s.pools.get(data_pool) {
                    None => return Ok(no_pool(data_pool)),
                    Some(dp)
                        if dp.ec_profile.is_some()
                            && dp.options.get("allow_ec_overwrites").map(String::as_str) != Some("true") =>
                    {
                        return Ok(CmdOutput::failed(
                            "rbd: create error: (22) Invalid argument\n",
                        ));
                    }
                    Some(_) => {}
                }
            }
            let Some(size) = parse_size(&req.size) else {
                return Ok(CmdOutput::failed(format!("rbd: invalid size value '{}'\n", req.size)));
            };
            let features: Vec<String> = req
                .features
                .as_deref()
                .map(|f| f.split(',').map(|x| x.trim().to_string()).filter(|x| !x.is_empty()).collect())
                .unwrap_or_default();
            let journaled = features.iter().any(|f| f == "journaling");

            let mut new_image = MockImage {
                size,
                data_pool: req.data_pool.clone(),
                features,
                primary: true,
                mirror: None,
                snaps: Vec::new(),
                meta: HashMap::new(),
                parent: None,
                pending: Vec::new(),
                journal_tid: 0,
            };
            // Journaled images in a pool-mode pool are mirrored as soon as they exist.
            let replica = if pool_mode == Some(MirrorMode::Pool) && journaled {
                new_image.mirror = Some(MirrorType::Journal);
                Some(make_replica(&new_image))
            } else {
                None
            };
            s.images.insert(image.clone(), new_image);
            replica
        };
        if let Some(replica) = replica {
            self.with_peer(|p| install_replica(p, image.clone(), replica))?;
        }
        debug!("Mock image created");
        Ok(CmdOutput::ok(""))
    }

    async fn image_list(&self, pool: &str, namespace: Option<&str>) -> Result<Vec<String>> {
        let mut s = self.write()?;
        s.record_query("image_list")?;
        if !s.has_pool(pool, namespace) {
            return Err(query_err(no_pool(pool)));
        }
        let mut names: Vec<String> = s
            .images
            .keys()
            .filter(|r| r.pool == pool && r.namespace.as_deref() == namespace)
            .map(|r| r.image.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn bench_write(&self, image: &ImageRef, io_total: &str, io_size: Option<&str>) -> Result<CmdOutput> {
        let (journaled, meta_delay, ops) = {
            let mut s = self.write()?;
            if let Some(out) = s.record("bench_write") {
                return Ok(out);
            }
            let Some(img) = s.images.get_mut(image) else {
                return Ok(no_image(image));
            };
            if !img.primary {
                return Ok(read_only("bench write"));
            }
            let total = parse_size(io_total).unwrap_or(0);
            let block = io_size.and_then(parse_size).unwrap_or(4096).max(1);
            let ops = (total / block).max(1);
            img.journal_tid += ops;
            let meta_delay = img
                .meta
                .get(REPLAY_DELAY_META_KEY)
                .and_then(|v| v.trim().parse::<u64>().ok());
            (img.mirror == Some(MirrorType::Journal), meta_delay, ops)
        };

        if journaled {
            self.with_peer(|p| {
                let delay = meta_delay
                    .or_else(|| {
                        p.config
                            .get(&("client".to_string(), REPLAY_DELAY_CONFIG_KEY.to_string()))
                            .and_then(|v| v.trim().parse::<u64>().ok())
                    })
                    .unwrap_or(0);
                if let Some(replica) = p.images.get_mut(image).filter(|r| !r.primary) {
                    replica.pending.push((ops, Instant::now() + Duration::from_secs(delay)));
                    replica.journal_tid += ops;
                }
            })?;
        }

        Ok(CmdOutput::ok(format!(
            "bench  type write io_size {} io_threads 16 bytes {} pattern sequential\nelapsed: 1   ops: {}\n",
            io_size.unwrap_or("4096"),
            io_total,
            ops
        )))
    }

    async fn image_meta_set(&self, image: &ImageRef, key: &str, value: &str) -> Result<CmdOutput> {
        let mirrored = {
            let mut s = self.write()?;
            if let Some(out) = s.record("image_meta_set") {
                return Ok(out);
            }
            let Some(img) = s.images.get_mut(image) else {
                return Ok(no_image(image));
            };
            if !img.primary {
                return Ok(read_only("setting metadata"));
            }
            img.meta.insert(key.to_string(), value.to_string());
            img.mirror.is_some()
        };
        if mirrored {
            self.with_peer(|p| {
                if let Some(replica) = p.images.get_mut(image).filter(|r| !r.primary) {
                    replica.meta.insert(key.to_string(), value.to_string());
                }
            })?;
        }
        Ok(CmdOutput::ok(""))
    }

    async fn image_meta_get(&self, image: &ImageRef, key: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("image_meta_get") {
            return Ok(out);
        }
        let Some(img) = s.images.get(image) else {
            return Ok(no_image(image));
        };
        Ok(match img.meta.get(key) {
            Some(value) => CmdOutput::ok(format!("{}\n", value)),
            None => CmdOutput::failed(format!(
                "failed to get metadata {} of image : (2) No such file or directory\n",
                key
            )),
        })
    }

    async fn config_set(&self, who: &str, key: &str, value: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("config_set") {
            return Ok(out);
        }
        s.config
            .insert((who.to_string(), key.to_string()), value.to_string());
        Ok(CmdOutput::ok(""))
    }

    async fn config_get(&self, who: &str, key: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("config_get") {
            return Ok(out);
        }
        let value = s
            .config
            .get(&(who.to_string(), key.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(CmdOutput::ok(format!("{}\n", value)))
    }

    async fn group_create(&self, group: &GroupSpec) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("group_create") {
            return Ok(out);
        }
        if !s.has_pool(&group.pool, group.namespace.as_deref()) {
            return Ok(no_pool(&group.pool));
        }
        if s.groups.contains_key(group) {
            return Ok(already_exists("create group"));
        }
        s.groups.insert(group.clone(), MockGroup::default());
        Ok(CmdOutput::ok(""))
    }

    async fn group_rename(&self, group: &GroupSpec, new_name: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("group_rename") {
            return Ok(out);
        }
        let mut renamed = group.clone();
        renamed.group = new_name.to_string();
        if s.groups.contains_key(&renamed) {
            return Ok(already_exists("rename group"));
        }
        match s.groups.remove(group) {
            Some(g) => {
                s.groups.insert(renamed, g);
                info!(group = %group, new_name = %new_name, "Group renamed");
                Ok(CmdOutput::ok(""))
            }
            None => Ok(CmdOutput::failed(format!(
                "rbd: error opening group {}: (2) No such file or directory\n",
                group.group
            ))),
        }
    }

    async fn group_remove(&self, group: &GroupSpec) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("group_remove") {
            return Ok(out);
        }
        if s.groups.remove(group).is_none() {
            return Ok(CmdOutput::failed(format!(
                "rbd: error removing group {}: (2) No such file or directory\n",
                group.group
            )));
        }
        Ok(CmdOutput::ok(""))
    }

    async fn group_list(&self, pool: &str, namespace: Option<&str>) -> Result<Vec<String>> {
        let mut s = self.write()?;
        s.record_query("group_list")?;
        if !s.has_pool(pool, namespace) {
            return Err(query_err(no_pool(pool)));
        }
        let mut names: Vec<String> = s
            .groups
            .keys()
            .filter(|g| g.pool == pool && g.namespace.as_deref() == namespace)
            .map(|g| g.group.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn group_image_add(&self, group: &GroupSpec, image: &ImageRef) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("group_image_add") {
            return Ok(out);
        }
        if !s.images.contains_key(image) {
            return Ok(no_image(image));
        }
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(CmdOutput::failed(format!(
                "rbd: error opening group {}: (2) No such file or directory\n",
                group.group
            )));
        };
        if g.images.contains(image) {
            return Ok(already_exists("add image to group"));
        }
        g.images.push(image.clone());
        Ok(CmdOutput::ok(""))
    }

    async fn group_image_list(&self, group: &GroupSpec) -> Result<Vec<GroupImageIdentity>> {
        let mut s = self.write()?;
        s.record_query("group_image_list")?;
        s.groups
            .get(group)
            .map(|g| g.images.clone())
            .ok_or_else(|| OperationError::CommandFailed(format!("rbd: group {} does not exist", group)))
    }

    async fn group_snap_create(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("group_snap_create") {
            return Ok(out);
        }
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(CmdOutput::failed(format!(
                "rbd: error opening group {}: (2) No such file or directory\n",
                group.group
            )));
        };
        if g.snaps.iter().any(|existing| existing == snap) {
            return Ok(already_exists("create group snapshot"));
        }
        g.snaps.push(snap.to_string());
        Ok(CmdOutput::ok(""))
    }

    async fn group_snap_list(&self, group: &GroupSpec) -> Result<Vec<String>> {
        let mut s = self.write()?;
        s.record_query("group_snap_list")?;
        s.groups
            .get(group)
            .map(|g| g.snaps.clone())
            .ok_or_else(|| OperationError::CommandFailed(format!("rbd: group {} does not exist", group)))
    }

    async fn group_snap_rollback(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("group_snap_rollback") {
            return Ok(out);
        }
        match s.groups.get(group) {
            Some(g) if g.snaps.iter().any(|existing| existing == snap) => {
                Ok(CmdOutput::completed("Rolling back to group snapshot"))
            }
            Some(_) => Ok(no_snap(snap)),
            None => Ok(CmdOutput::failed(format!(
                "rbd: error opening group {}: (2) No such file or directory\n",
                group.group
            ))),
        }
    }

    async fn group_info(&self, group: &GroupSpec) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("group_info") {
            return Ok(out);
        }
        Ok(match s.groups.get(group) {
            Some(g) => CmdOutput::ok(format!(
                "rbd group '{}':\n\tid: mock\n\timages: {}\n",
                group.group,
                g.images.len()
            )),
            None => CmdOutput::failed(format!(
                "rbd: error opening group {}: (2) No such file or directory\n",
                group.group
            )),
        })
    }

    async fn group_snap_info(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("group_snap_info") {
            return Ok(out);
        }
        Ok(match s.groups.get(group) {
            Some(g) if g.snaps.iter().any(|existing| existing == snap) => CmdOutput::ok(format!(
                "rbd group snapshot '{}':\n\tstate: complete\n\timage snap: .group.{}\n\timages: {}\n",
                snap,
                snap,
                g.images.len()
            )),
            Some(_) => no_snap(snap),
            None => CmdOutput::failed(format!(
                "rbd: error opening group {}: (2) No such file or directory\n",
                group.group
            )),
        })
    }

    #[instrument(skip(self, image, snap), fields(image = %image, snap = %snap))]
    async fn snap_create(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        let snaps = {
            let mut s = self.write()?;
            if let Some(out) = s.record("snap_create") {
                return Ok(out);
            }
            let id = s.next_id();
            let Some(img) = s.images.get_mut(image) else {
                return Ok(no_image(image));
            };
            if !img.primary {
                return Ok(CmdOutput::failed(format!("rbd: {}\n", SNAP_CREATE_READ_ONLY)));
            }
            if img.snaps.iter().any(|existing| existing.name == snap) {
                return Ok(already_exists("failed to create snapshot"));
            }
            let size = img.size;
            img.snaps.push(MockSnap {
                id,
                name: snap.to_string(),
                size,
                protected: false,
                mirror: false,
            });
            img.mirror.map(|_| img.snaps.clone())
        };
        if let Some(snaps) = snaps {
            self.push_snaps(image, snaps)?;
        }
        Ok(CmdOutput::completed("Creating snap"))
    }

    async fn snap_list(&self, image: &ImageRef) -> Result<Vec<SnapInfo>> {
        let mut s = self.write()?;
        s.record_query("snap_list")?;
        let img = s.images.get(image).ok_or_else(|| query_err(no_image(image)))?;
        Ok(img
            .snaps
            .iter()
            .map(|snap| SnapInfo {
                id: snap.id,
                name: snap.name.clone(),
                size: snap.size,
                protected: snap.protected,
                namespace: Some(SnapNamespace {
                    kind: if snap.mirror { "mirror" } else { "user" }.to_string(),
                }),
            })
            .collect())
    }

    async fn snap_protect(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("snap_protect") {
            return Ok(out);
        }
        let Some(img) = s.images.get_mut(image) else {
            return Ok(no_image(image));
        };
        if !img.primary {
            return Ok(read_only("protecting snap"));
        }
        let Some(entry) = img.snaps.iter_mut().find(|x| x.name == snap) else {
            return Ok(no_snap(snap));
        };
        if entry.protected {
            return Ok(busy("protecting snap"));
        }
        entry.protected = true;
        Ok(CmdOutput::ok(""))
    }

    async fn snap_unprotect(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("snap_unprotect") {
            return Ok(out);
        }
        let has_children = s
            .images
            .values()
            .any(|i| i.parent.as_ref().map(|(p, n)| p == image && n == snap).unwrap_or(false));
        let Some(img) = s.images.get_mut(image) else {
            return Ok(no_image(image));
        };
        if !img.primary {
            return Ok(read_only("unprotecting snap"));
        }
        let Some(entry) = img.snaps.iter_mut().find(|x| x.name == snap) else {
            return Ok(no_snap(snap));
        };
        if !entry.protected {
            return Ok(CmdOutput::failed(
                "rbd: unprotecting snap failed: (22) Invalid argument\n",
            ));
        }
        if has_children {
            return Ok(busy("unprotecting snap"));
        }
        entry.protected = false;
        Ok(CmdOutput::ok(""))
    }

    async fn snap_remove(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        let snaps = {
            let mut s = self.write()?;
            if let Some(out) = s.record("snap_remove") {
                return Ok(out);
            }
            let Some(img) = s.images.get_mut(image) else {
                return Ok(no_image(image));
            };
            if !img.primary {
                return Ok(read_only("failed to remove snapshot"));
            }
            let Some(pos) = img.snaps.iter().position(|x| x.name == snap) else {
                return Ok(no_snap(snap));
            };
            if img.snaps[pos].protected {
                return Ok(busy("failed to remove snapshot"));
            }
            img.snaps.remove(pos);
            img.mirror.map(|_| img.snaps.clone())
        };
        if let Some(snaps) = snaps {
            self.push_snaps(image, snaps)?;
        }
        Ok(CmdOutput::completed("Removing snap"))
    }

    async fn snap_rollback(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("snap_rollback") {
            return Ok(out);
        }
        let Some(img) = s.images.get(image) else {
            return Ok(no_image(image));
        };
        if !img.primary {
            return Ok(read_only("rollback"));
        }
        if !img.snaps.iter().any(|x| x.name == snap) {
            return Ok(no_snap(snap));
        }
        Ok(CmdOutput::completed("Rolling back to snapshot"))
    }

    async fn snap_purge(&self, image: &ImageRef) -> Result<CmdOutput> {
        let snaps = {
            let mut s = self.write()?;
            if let Some(out) = s.record("snap_purge") {
                return Ok(out);
            }
            let Some(img) = s.images.get_mut(image) else {
                return Ok(no_image(image));
            };
            if !img.primary {
                return Ok(read_only("removing snaps"));
            }
            if img.snaps.iter().any(|x| !x.mirror && x.protected) {
                return Ok(busy("removing snaps"));
            }
            img.snaps.retain(|x| x.mirror);
            img.mirror.map(|_| img.snaps.clone())
        };
        if let Some(snaps) = snaps {
            self.push_snaps(image, snaps)?;
        }
        Ok(CmdOutput::completed("Removing all snapshots"))
    }

    #[instrument(skip(self, req), fields(source = %req.source, dest = %req.dest))]
    async fn clone_image(&self, req: &CloneRequest) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("clone_image") {
            return Ok(out);
        }
        let Some(src) = s.images.get(&req.source) else {
            return Ok(no_image(&req.source));
        };
        let snap = match req.snap_id {
            Some(id) => src.snaps.iter().find(|x| x.id == id),
            None => src.snaps.iter().find(|x| x.name == req.snap),
        };
        let Some(snap) = snap else {
            return Ok(no_snap(&req.snap));
        };
        if req.clone_format == Some(1) && !snap.protected {
            return Ok(CmdOutput::failed(
                "rbd: clone error: (22) Invalid argument\nparent snapshot must be protected\n",
            ));
        }
        let snap_name = snap.name.clone();
        let size = src.size;
        let data_pool = src.data_pool.clone();
        if !s.has_pool(&req.dest.pool, req.dest.namespace.as_deref()) {
            return Ok(no_pool(&req.dest.pool));
        }
        if s.images.contains_key(&req.dest) {
            return Ok(already_exists("clone"));
        }
        s.images.insert(
            req.dest.clone(),
            MockImage {
                size,
                data_pool,
                features: vec!["layering".to_string()],
                primary: true,
                mirror: None,
                snaps: Vec::new(),
                meta: HashMap::new(),
                parent: Some((req.source.clone(), snap_name)),
                pending: Vec::new(),
                journal_tid: 0,
            },
        );
        Ok(CmdOutput::ok(""))
    }

    async fn children(&self, image: &ImageRef, snap: &str) -> Result<Vec<ImageRef>> {
        let mut s = self.write()?;
        s.record_query("children")?;
        let img = s.images.get(image).ok_or_else(|| query_err(no_image(image)))?;
        if !img.snaps.iter().any(|x| x.name == snap) {
            return Err(query_err(no_snap(snap)));
        }
        let mut children: Vec<ImageRef> = s
            .images
            .iter()
            .filter(|(_, i)| i.parent.as_ref().map(|(p, n)| p == image && n == snap).unwrap_or(false))
            .map(|(r, _)| r.clone())
            .collect();
        children.sort_by_key(|r| r.spec());
        Ok(children)
    }

    async fn flatten(&self, image: &ImageRef) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("flatten") {
            return Ok(out);
        }
        let Some(img) = s.images.get_mut(image) else {
            return Ok(no_image(image));
        };
        if !img.primary {
            return Ok(read_only("flatten"));
        }
        if img.parent.take().is_none() {
            return Ok(CmdOutput::failed(
                "rbd: flatten error: (22) Invalid argument\nImage flatten: 0% complete...failed.\n",
            ));
        }
        Ok(CmdOutput::completed("Image flatten"))
    }

    #[instrument(skip(self, pool, mode), fields(pool = %pool, mode = %mode.as_str()))]
    async fn mirror_pool_enable(&self, pool: &str, mode: MirrorMode) -> Result<CmdOutput> {
        let replicas = {
            let mut s = self.write()?;
            if let Some(out) = s.record("mirror_pool_enable") {
                return Ok(out);
            }
            let Some(p) = s.pools.get_mut(pool) else {
                return Ok(no_pool(pool));
            };
            if let Some(current) = p.mirror_mode {
                return Ok(CmdOutput {
                    stdout: format!("{} for pool {} in {} mode\n", MIRROR_ALREADY_CONFIGURED, pool, current.as_str()),
                    stderr: String::new(),
                    status: Some(0),
                });
            }
            p.mirror_mode = Some(mode);

            let mut replicas = Vec::new();
            if mode == MirrorMode::Pool {
                for (r, img) in s.images.iter_mut() {
                    if r.pool == pool && img.primary && img.features.iter().any(|f| f == "journaling") {
                        img.mirror = Some(MirrorType::Journal);
                        replicas.push((r.clone(), make_replica(img)));
                    }
                }
            }
            replicas
        };
        if !replicas.is_empty() {
            self.with_peer(|p| {
                for (r, replica) in replicas {
                    install_replica(p, r, replica);
                }
            })?;
        }
        Ok(CmdOutput::ok(""))
    }

    async fn mirror_peer_bootstrap_create(&self, pool: &str, site_name: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("mirror_peer_bootstrap_create") {
            return Ok(out);
        }
        match s.pools.get(pool).map(|p| p.mirror_mode.is_some()) {
            None => Ok(no_pool(pool)),
            Some(false) => Ok(CmdOutput::failed("rbd: mirroring not enabled on the pool\n")),
            Some(true) => {
                s.site_name = site_name.to_string();
                Ok(CmdOutput::ok(format!("mock-bootstrap:{}:{}\n", site_name, pool)))
            }
        }
    }

    async fn mirror_peer_bootstrap_import(
        &self,
        pool: &str,
        site_name: &str,
        token: &str,
        direction: PeerDirection,
    ) -> Result<CmdOutput> {
        let own_site = {
            let mut s = self.write()?;
            if let Some(out) = s.record("mirror_peer_bootstrap_import") {
                return Ok(out);
            }
            let remote_site = match token.trim().strip_prefix("mock-bootstrap:").and_then(|t| t.split(':').next()) {
                Some(site) if !site.is_empty() => site.to_string(),
                _ => {
                    return Ok(CmdOutput::failed(
                        "rbd: failed to decode peer bootstrap token\n",
                    ))
                }
            };
            s.site_name = site_name.to_string();
            let Some(p) = s.pools.get_mut(pool) else {
                return Ok(no_pool(pool));
            };
            if p.mirror_mode.is_none() {
                return Ok(CmdOutput::failed("rbd: mirroring not enabled on the pool\n"));
            }
            p.peers.insert(remote_site);
            site_name.to_string()
        };
        if direction == PeerDirection::RxTx {
            self.with_peer(|p| {
                if let Some(remote_pool) = p.pools.get_mut(pool) {
                    remote_pool.peers.insert(own_site);
                }
            })?;
        }
        Ok(CmdOutput::ok(""))
    }

    async fn mirror_pool_peer_add(&self, pool: &str, remote: &str, _direction: PeerDirection) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("mirror_pool_peer_add") {
            return Ok(out);
        }
        let Some(site) = remote
            .split_once('@')
            .map(|(_, site)| site)
            .filter(|site| !site.is_empty())
        else {
            return Ok(CmdOutput::failed(format!("rbd: invalid remote cluster spec '{}'\n", remote)));
        };
        let Some(p) = s.pools.get_mut(pool) else {
            return Ok(no_pool(pool));
        };
        if p.mirror_mode.is_none() {
            return Ok(CmdOutput::failed("rbd: mirroring not enabled on the pool\n"));
        }
        if !p.peers.insert(site.to_string()) {
            return Ok(CmdOutput::failed("rbd: mirror peer already exists\n"));
        }
        Ok(CmdOutput::ok(""))
    }

    async fn mirror_pool_peers(&self, pool: &str) -> Result<Vec<String>> {
        let mut s = self.write()?;
        s.record_query("mirror_pool_peers")?;
        let p = s.pools.get(pool).ok_or_else(|| query_err(no_pool(pool)))?;
        Ok(p.peers.iter().cloned().collect())
    }

    async fn mirror_pool_status(&self, pool: &str) -> Result<MirrorPoolStatus> {
        let (has_peers, own_site) = {
            let mut s = self.write()?;
            s.record_query("mirror_pool_status")?;
            let p = s.pools.get(pool).ok_or_else(|| query_err(no_pool(pool)))?;
            if p.mirror_mode.is_none() {
                return Err(OperationError::CommandFailed(
                    "rbd: mirroring not enabled on the pool".to_string(),
                ));
            }
            (!p.peers.is_empty(), s.site_name.clone())
        };
        let known_by_peer = self
            .with_peer(|p| {
                p.pools
                    .get(pool)
                    .map(|rp| rp.peers.contains(&own_site))
                    .unwrap_or(false)
            })?
            .unwrap_or(false);
        let health = if has_peers || known_by_peer { "OK" } else { "WARNING" };
        Ok(MirrorPoolStatus {
            health: health.to_string(),
            daemon_health: health.to_string(),
            image_health: health.to_string(),
        })
    }

    #[instrument(skip(self, image, mirror_type), fields(image = %image, mirror_type = %mirror_type.as_str()))]
    async fn mirror_image_enable(&self, image: &ImageRef, mirror_type: MirrorType) -> Result<CmdOutput> {
        let replica = {
            let mut s = self.write()?;
            if let Some(out) = s.record("mirror_image_enable") {
                return Ok(out);
            }
            match s.pools.get(&image.pool).map(|p| p.mirror_mode) {
                None => return Ok(no_pool(&image.pool)),
                Some(None) => {
                    return Ok(CmdOutput::failed(
                        "rbd: cannot enable mirroring: mirroring is not enabled on the pool\n",
                    ))
                }
                Some(Some(MirrorMode::Pool)) => {
                    return Ok(CmdOutput::failed(format!("rbd: {}\n", POOL_NOT_IN_IMAGE_MODE)));
                }
                Some(Some(MirrorMode::Image)) => {}
            }
            let Some(img) = s.images.get(image) else {
                return Ok(no_image(image));
            };
            if !img.primary {
                return Ok(CmdOutput::failed(
                    "rbd: cannot enable mirroring: image is not primary\n",
                ));
            }
            if img.mirror.is_some() {
                return Ok(CmdOutput::ok("Mirroring enabled\n"));
            }
            if mirror_type == MirrorType::Journal && !img.features.iter().any(|f| f == "journaling") {
                return Ok(CmdOutput::failed(
                    "rbd: cannot enable mirroring: journaling is not enabled\n",
                ));
            }
            if mirror_type == MirrorType::Snapshot {
                s.add_mirror_snapshot(image);
            }
            let Some(img) = s.images.get_mut(image) else {
                return Ok(no_image(image));
            };
            img.mirror = Some(mirror_type);
            make_replica(img)
        };
        self.with_peer(|p| install_replica(p, image.clone(), replica))?;
        Ok(CmdOutput::ok("Mirroring enabled\n"))
    }

    async fn mirror_image_status(&self, image: &ImageRef) -> Result<MirrorImageStatus> {
        let (status, new_snaps) = {
            let mut s = self.write()?;
            s.record_query("mirror_image_status")?;
            let (primary, mirror) = match s.images.get(image) {
                Some(img) => (img.primary, img.mirror),
                None => return Err(query_err(no_image(image))),
            };
            let Some(mirror) = mirror else {
                return Err(OperationError::CommandFailed(
                    "rbd: mirroring not enabled on the image".to_string(),
                ));
            };

            let now = Instant::now();
            let mut new_snaps = None;
            if primary && mirror == MirrorType::Snapshot {
                let mut due = 0u32;
                for sched in s.schedules.iter_mut().filter(|sc| schedule_applies(&sc.scope, image)) {
                    let elapsed = now.saturating_duration_since(sched.last);
                    let n = (elapsed.as_secs_f64() / sched.interval.as_secs_f64()) as u32;
                    if n > 0 {
                        sched.last += sched.interval * n;
                        due += n;
                    }
                }
                if due > 0 {
                    for _ in 0..due {
                        s.add_mirror_snapshot(image);
                    }
                    new_snaps = Some(s.user_snaps(image));
                }
            }

            let Some(img) = s.images.get_mut(image) else {
                return Err(query_err(no_image(image)));
            };
            let snapshot_ids = img.snaps.iter().filter(|x| x.mirror).map(|x| x.id).collect();
            let status = if img.primary {
                MirrorImageStatus {
                    state: "up+stopped".to_string(),
                    description: "local image is primary".to_string(),
                    snapshot_ids,
                }
            } else if mirror == MirrorType::Journal {
                img.pending.retain(|(_, at)| *at > now);
                let behind: u64 = img.pending.iter().map(|(n, _)| n).sum();
                MirrorImageStatus {
                    state: "up+replaying".to_string(),
                    description: format!(
                        "replaying, {{\"primary_position\":{{\"entry_tid\":{}}},\"non_primary_position\":{{\"entry_tid\":{}}},\"entries_behind_primary\":{}}}",
                        img.journal_tid,
                        img.journal_tid.saturating_sub(behind),
                        behind
                    ),
                    snapshot_ids,
                }
            } else {
                MirrorImageStatus {
                    state: "up+replaying".to_string(),
                    description: "replaying, {\"replay_state\":\"idle\"}".to_string(),
                    snapshot_ids,
                }
            };
            (status, new_snaps)
        };
        if let Some(snaps) = new_snaps {
            self.push_snaps(image, snaps)?;
        }
        Ok(status)
    }

    async fn mirror_snapshot_schedule_add(&self, scope: &ScheduleScope, interval: &str) -> Result<CmdOutput> {
        let mut s = self.write()?;
        if let Some(out) = s.record("mirror_snapshot_schedule_add") {
            return Ok(out);
        }
        let Some(every) = parse_interval(interval).filter(|d| !d.is_zero()) else {
            return Ok(CmdOutput::failed(format!(
                "rbd: invalid schedule interval '{}'\n",
                interval
            )));
        };
        s.schedules.push(MockSchedule {
            scope: scope.clone(),
            interval: every,
            last: Instant::now(),
        });
        Ok(CmdOutput::ok(""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn site_with_image(rbd: &MockRbd, pool: &str, image: &str, features: Option<&str>) -> ImageRef {
        rbd.pool_create(&PoolCreate::replicated(pool)).await.unwrap();
        let r = ImageRef::new(pool, image);
        let out = rbd
            .image_create(&ImageCreate {
                image: r.clone(),
                size: "1G".into(),
                data_pool: None,
                features: features.map(String::from),
            })
            .await
            .unwrap();
        assert!(out.exit_ok(), "{}", out.stderr);
        r
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle_on_primary() {
        let rbd = MockRbd::new("site-a");
        let image = site_with_image(&rbd, "p", "i", None).await;

        assert!(rbd.snap_create(&image, "s1").await.unwrap().is_complete_done());
        assert!(rbd.snap_protect(&image, "s1").await.unwrap().succeeded());
        assert!(rbd.snap_remove(&image, "s1").await.unwrap().has_err());
        assert!(rbd.snap_unprotect(&image, "s1").await.unwrap().succeeded());
        assert!(rbd.snap_remove(&image, "s1").await.unwrap().is_complete_done());
        assert!(rbd.snap_list(&image).await.unwrap().is_empty());
        assert_eq!(rbd.call_count("snap_remove"), 2);
    }

    #[tokio::test]
    async fn test_group_rename_and_remove() {
        let rbd = MockRbd::new("site-a");
        rbd.pool_create(&PoolCreate::replicated("p")).await.unwrap();
        let group = GroupSpec::new("p", "g1");
        assert!(rbd.group_create(&group).await.unwrap().succeeded());

        assert!(rbd.group_rename(&group, "g2").await.unwrap().succeeded());
        assert_eq!(rbd.group_list("p", None).await.unwrap(), vec!["g2".to_string()]);
        assert!(rbd.group_remove(&group).await.unwrap().has_err());

        assert!(rbd.group_remove(&GroupSpec::new("p", "g2")).await.unwrap().succeeded());
        assert!(rbd.group_list("p", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mirrored_replica_is_read_only() {
        let (primary, secondary) = MockRbd::pair("site-a", "site-b");
        let image = site_with_image(&primary, "p", "i", Some("exclusive-lock,journaling")).await;
        secondary.pool_create(&PoolCreate::replicated("p")).await.unwrap();
        primary.mirror_pool_enable("p", MirrorMode::Image).await.unwrap();
        secondary.mirror_pool_enable("p", MirrorMode::Image).await.unwrap();

        let out = primary.mirror_image_enable(&image, MirrorType::Journal).await.unwrap();
        assert!(out.exit_ok());
        assert_eq!(secondary.image_is_primary(&image), Some(false));

        primary.snap_create(&image, "s1").await.unwrap();
        let mirrored = secondary.snap_list(&image).await.unwrap();
        assert_eq!(mirrored[0].name, "s1");

        let out = secondary.snap_create(&image, "s2").await.unwrap();
        assert!(out.contains(SNAP_CREATE_READ_ONLY));
        assert!(secondary.snap_protect(&image, "s1").await.unwrap().is_read_only());
    }

    #[tokio::test]
    async fn test_manual_peer_add() {
        let rbd = MockRbd::new("site-a");
        rbd.pool_create(&PoolCreate::replicated("p")).await.unwrap();
        let out = rbd.mirror_pool_peer_add("p", "client.admin@site-b", PeerDirection::RxTx).await.unwrap();
        assert!(out.has_err());

        rbd.mirror_pool_enable("p", MirrorMode::Image).await.unwrap();
        assert!(rbd.mirror_pool_peer_add("p", "site-b", PeerDirection::RxTx).await.unwrap().has_err());
        assert!(rbd.mirror_pool_peer_add("p", "client.admin@site-b", PeerDirection::RxTx).await.unwrap().succeeded());
        assert_eq!(rbd.mirror_pool_peers("p").await.unwrap(), vec!["site-b".to_string()]);
        assert!(rbd.mirror_pool_peer_add("p", "client.admin@site-b", PeerDirection::RxTx).await.unwrap().has_err());
    }

    #[tokio::test]
    async fn test_stubbed_call_changes_nothing() {
        let rbd = MockRbd::new("site-a");
        rbd.stub_on("pool_create", "");
        assert!(rbd.pool_create(&PoolCreate::replicated("p")).await.unwrap().succeeded());
        assert!(!rbd.pool_exists("p"));
    }

    #[tokio::test]
    async fn test_pool_mode_rejects_image_enable() {
        let (primary, _secondary) = MockRbd::pair("site-a", "site-b");
        let image = site_with_image(&primary, "p", "i", None).await;
        primary.mirror_pool_enable("p", MirrorMode::Pool).await.unwrap();
        let out = primary.mirror_image_enable(&image, MirrorType::Snapshot).await.unwrap();
        assert!(out.contains(POOL_NOT_IN_IMAGE_MODE));

        let again = primary.mirror_pool_enable("p", MirrorMode::Pool).await.unwrap();
        assert!(again.contains(MIRROR_ALREADY_CONFIGURED));
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_replay_delay() {
        let (primary, secondary) = MockRbd::pair("site-a", "site-b");
        let image = site_with_image(&primary, "p", "i", Some("exclusive-lock,journaling")).await;
        secondary.pool_create(&PoolCreate::replicated("p")).await.unwrap();
        primary.mirror_pool_enable("p", MirrorMode::Image).await.unwrap();
        secondary.mirror_pool_enable("p", MirrorMode::Image).await.unwrap();
        primary.mirror_image_enable(&image, MirrorType::Journal).await.unwrap();
        primary.image_meta_set(&image, REPLAY_DELAY_META_KEY, "30").await.unwrap();

        primary.bench_write(&image, "1M", Some("4K")).await.unwrap();
        let status = secondary.mirror_image_status(&image).await.unwrap();
        assert_eq!(status.entries_behind_primary(), Some(256));

        tokio::time::sleep(Duration::from_secs(31)).await;
        let status = secondary.mirror_image_status(&image).await.unwrap();
        assert_eq!(status.entries_behind_primary(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_creates_mirror_snapshots() {
        let (primary, secondary) = MockRbd::pair("site-a", "site-b");
        let image = site_with_image(&primary, "p", "i", None).await;
        secondary.pool_create(&PoolCreate::replicated("p")).await.unwrap();
        primary.mirror_pool_enable("p", MirrorMode::Image).await.unwrap();
        primary.mirror_image_enable(&image, MirrorType::Snapshot).await.unwrap();
        primary
            .mirror_snapshot_schedule_add(&ScheduleScope::Image(image.clone()), "1m")
            .await
            .unwrap();

        let before = primary.mirror_image_status(&image).await.unwrap().snapshot_ids;
        assert_eq!(before.len(), 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        let after = primary.mirror_image_status(&image).await.unwrap().snapshot_ids;
        assert_eq!(after.len(), 3);
        assert_eq!(secondary.mirror_image_status(&image).await.unwrap().snapshot_ids, after);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let rbd = MockRbd::new("site-a");
        rbd.fail_on("pool_create", "Error EPERM: denied");
        let out = rbd.pool_create(&PoolCreate::replicated("p")).await.unwrap();
        assert!(!out.exit_ok());
        assert!(!rbd.pool_exists("p"));

        rbd.fail_on("group_list", "rbd: boom");
        assert!(matches!(
            rbd.group_list("p", None).await,
            Err(OperationError::CommandFailed(_))
        ));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1G"), Some(1 << 30));
        assert_eq!(parse_size("10"), Some(10 << 20));
        assert_eq!(parse_size("4K"), Some(4096));
        assert_eq!(parse_size("big"), None);
    }
}
