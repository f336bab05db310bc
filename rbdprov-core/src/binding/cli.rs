//! `rbd`/`ceph` command line implementation of [`RbdBinding`].

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, instrument};

use super::runner::CommandRunner;
use super::{CloneRequest, ImageCreate, PoolCreate, RbdBinding};
use crate::error::{OperationError, Result};
use crate::types::{
    CmdOutput, GroupImageIdentity, GroupSpec, ImageRef, MirrorImageStatus, MirrorMode,
    MirrorPoolStatus, MirrorType, PeerDirection, ScheduleScope, SnapInfo,
};

/// Drives a cluster through the `rbd` and `ceph` tools on one client node.
pub struct RbdCli {
    runner: Arc<dyn CommandRunner>,
    /// rbd CLI binary path
    rbd_path: String,
    /// ceph CLI binary path
    ceph_path: String,
}

impl RbdCli {
    /// Create a new binding that runs commands through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            rbd_path: "rbd".to_string(),
            ceph_path: "ceph".to_string(),
        }
    }

    /// Use custom `rbd` and `ceph` binaries.
    pub fn with_paths(mut self, rbd_path: impl Into<String>, ceph_path: impl Into<String>) -> Self {
        self.rbd_path = rbd_path.into();
        self.ceph_path = ceph_path.into();
        self
    }

    /// Execute an rbd command and return its raw output.
    async fn run_rbd(&self, args: Vec<String>) -> Result<CmdOutput> {
        debug!(target_node = %self.runner.target(), args = ?args, "Executing rbd command");
        self.runner.run(&self.rbd_path, &args, None).await
    }

    /// Execute a ceph command and return its raw output.
    async fn run_ceph(&self, args: Vec<String>) -> Result<CmdOutput> {
        debug!(target_node = %self.runner.target(), args = ?args, "Executing ceph command");
        self.runner.run(&self.ceph_path, &args, None).await
    }

    /// Execute an rbd command whose JSON output is required.
    async fn query_rbd<T: DeserializeOwned>(&self, args: Vec<String>) -> Result<T> {
        let what = args.iter().take(3).cloned().collect::<Vec<_>>().join(" ");
        let output = self.run_rbd(args).await?;
        parse_json(&what, &output)
    }
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Parse required JSON output, failing when the command reported an error.
fn parse_json<T: DeserializeOwned>(what: &str, output: &CmdOutput) -> Result<T> {
    if !output.exit_ok() {
        error!(command = %what, stderr = %output.stderr, "rbd command failed");
        return Err(OperationError::CommandFailed(format!(
            "rbd {} failed: {}",
            what,
            output.stderr.trim()
        )));
    }
    let stdout = output.stdout.trim();
    let stdout = if stdout.is_empty() { "[]" } else { stdout };
    serde_json::from_str(stdout)
        .map_err(|e| OperationError::ParseFailed(format!("rbd {} output: {}", what, e)))
}

fn pool_args(args: &mut Vec<String>, pool: &str, namespace: Option<&str>) {
    args.push("--pool".to_string());
    args.push(pool.to_string());
    if let Some(ns) = namespace {
        args.push("--namespace".to_string());
        args.push(ns.to_string());
    }
}

#[derive(Deserialize)]
struct NamedEntry {
    name: String,
}

#[derive(Deserialize)]
struct GroupImageEntry {
    image: String,
    pool: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Deserialize)]
struct GroupSnapEntry {
    #[serde(alias = "name")]
    snapshot: String,
}

#[derive(Deserialize)]
struct ChildEntry {
    pool: String,
    #[serde(default)]
    pool_namespace: Option<String>,
    image: String,
}

#[derive(Deserialize)]
struct MirrorSnapshotEntry {
    id: u64,
}

#[derive(Deserialize)]
struct PeerSiteEntry {
    #[serde(default)]
    state: String,
    #[serde(default)]
    description: String,
}

#[derive(Deserialize)]
struct MirrorImageStatusJson {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    snapshots: Vec<MirrorSnapshotEntry>,
    #[serde(default)]
    peer_sites: Vec<PeerSiteEntry>,
}

#[derive(Deserialize)]
struct MirrorPoolStatusJson {
    summary: MirrorPoolStatus,
}

#[derive(Deserialize)]
struct PeerEntry {
    #[serde(default)]
    site_name: String,
}

#[derive(Deserialize)]
struct MirrorPoolInfoJson {
    #[serde(default)]
    peers: Vec<PeerEntry>,
}

/// Group members from `rbd group image list`.
///
/// Accepts the JSON form as well as the plain form, whose lines are
/// `pool/image` or `pool/namespace/image`.
pub(crate) fn parse_group_images(output: &str) -> Result<Vec<GroupImageIdentity>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        let entries: Vec<GroupImageEntry> = serde_json::from_str(trimmed)
            .map_err(|e| OperationError::ParseFailed(format!("group image list: {}", e)))?;
        return Ok(entries
            .into_iter()
            .map(|e| ImageRef::new(e.pool, e.image).with_namespace(e.namespace.as_deref()))
            .collect());
    }
    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let spec = line.split_whitespace().next().unwrap_or(line);
            ImageRef::parse(spec)
                .map_err(|e| OperationError::ParseFailed(format!("group image list: {}", e)))
        })
        .collect()
}

fn parse_mirror_image_status(raw: MirrorImageStatusJson) -> MirrorImageStatus {
    let peer = raw.peer_sites.into_iter().next();
    let (peer_state, peer_description) = peer
        .map(|p| (p.state, p.description))
        .unwrap_or_default();
    MirrorImageStatus {
        state: raw.state.unwrap_or(peer_state),
        description: raw.description.unwrap_or(peer_description),
        snapshot_ids: raw.snapshots.into_iter().map(|s| s.id).collect(),
    }
}

#[async_trait]
impl RbdBinding for RbdCli {
    #[instrument(skip(self, req), fields(pool = %req.pool))]
    async fn pool_create(&self, req: &PoolCreate) -> Result<CmdOutput> {
        let mut a = args(["osd", "pool", "create", &req.pool]);
        if let Some(pg) = req.pg_num {
            a.push(pg.to_string());
            if let Some(pgp) = req.pgp_num {
                a.push(pgp.to_string());
            }
        }
        if let Some(profile) = &req.ec_profile {
            a.push("erasure".to_string());
            a.push(profile.clone());
        }
        self.run_ceph(a).await
    }

    async fn ec_profile_set(&self, profile: &str, k_m: &str) -> Result<CmdOutput> {
        let (k, m) = k_m.split_once(',').ok_or_else(|| {
            OperationError::InvalidConfig(format!("ec-pool-k-m '{}' must be k,m", k_m))
        })?;
        let k = format!("k={}", k.trim());
        let m = format!("m={}", m.trim());
        self.run_ceph(args([
            "osd",
            "erasure-code-profile",
            "set",
            profile,
            &k,
            &m,
            "crush-failure-domain=osd",
        ]))
        .await
    }

    async fn pool_set(&self, pool: &str, key: &str, value: &str) -> Result<CmdOutput> {
        self.run_ceph(args(["osd", "pool", "set", pool, key, value])).await
    }

    async fn pool_application_enable(&self, pool: &str, app: &str) -> Result<CmdOutput> {
        self.run_ceph(args(["osd", "pool", "application", "enable", pool, app])).await
    }

    async fn pool_init(&self, pool: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["pool", "init", pool])).await
    }

    async fn pool_stats(&self, pool: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["pool", "stats", pool])).await
    }

    async fn namespace_list(&self, pool: &str) -> Result<Vec<String>> {
        let entries: Vec<NamedEntry> = self
            .query_rbd(args(["namespace", "ls", "--pool", pool, "--format", "json"]))
            .await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    async fn namespace_create(&self, pool: &str, namespace: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["namespace", "create", "--pool", pool, "--namespace", namespace]))
            .await
    }

    #[instrument(skip(self, req), fields(image = %req.image))]
    async fn image_create(&self, req: &ImageCreate) -> Result<CmdOutput> {
        let spec = req.image.spec();
        let mut a = args(["create", &spec, "--size", &req.size]);
        if let Some(data_pool) = &req.data_pool {
            a.push("--data-pool".to_string());
            a.push(data_pool.clone());
        }
        if let Some(features) = &req.features {
            a.push("--image-feature".to_string());
            a.push(features.clone());
        }
        self.run_rbd(a).await
    }

    async fn image_list(&self, pool: &str, namespace: Option<&str>) -> Result<Vec<String>> {
        let mut a = args(["ls"]);
        pool_args(&mut a, pool, namespace);
        a.extend(args(["--format", "json"]));
        self.query_rbd(a).await
    }

    async fn bench_write(&self, image: &ImageRef, io_total: &str, io_size: Option<&str>) -> Result<CmdOutput> {
        let spec = image.spec();
        let mut a = args(["bench", "--io-type", "write", "--io-threads", "16", "--io-total", io_total]);
        if let Some(size) = io_size {
            a.push("--io-size".to_string());
            a.push(size.to_string());
        }
        a.push(spec);
        self.run_rbd(a).await
    }

    async fn image_meta_set(&self, image: &ImageRef, key: &str, value: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["image-meta", "set", &image.spec(), key, value])).await
    }

    async fn image_meta_get(&self, image: &ImageRef, key: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["image-meta", "get", &image.spec(), key])).await
    }

    async fn config_set(&self, who: &str, key: &str, value: &str) -> Result<CmdOutput> {
        self.run_ceph(args(["config", "set", who, key, value])).await
    }

    async fn config_get(&self, who: &str, key: &str) -> Result<CmdOutput> {
        self.run_ceph(args(["config", "get", who, key])).await
    }

    async fn group_create(&self, group: &GroupSpec) -> Result<CmdOutput> {
        self.run_rbd(args(["group", "create", &group.spec()])).await
    }

    async fn group_rename(&self, group: &GroupSpec, new_name: &str) -> Result<CmdOutput> {
        let mut renamed = group.clone();
        renamed.group = new_name.to_string();
        self.run_rbd(args(["group", "rename", &group.spec(), &renamed.spec()]))
            .await
    }

    async fn group_remove(&self, group: &GroupSpec) -> Result<CmdOutput> {
        self.run_rbd(args(["group", "rm", &group.spec()])).await
    }

    async fn group_list(&self, pool: &str, namespace: Option<&str>) -> Result<Vec<String>> {
        let mut a = args(["group", "ls"]);
        pool_args(&mut a, pool, namespace);
        a.extend(args(["--format", "json"]));
        self.query_rbd(a).await
    }

    async fn group_image_add(&self, group: &GroupSpec, image: &ImageRef) -> Result<CmdOutput> {
        self.run_rbd(args(["group", "image", "add", &group.spec(), &image.spec()]))
            .await
    }

    async fn group_image_list(&self, group: &GroupSpec) -> Result<Vec<GroupImageIdentity>> {
        let output = self
            .run_rbd(args(["group", "image", "list", &group.spec(), "--format", "json"]))
            .await?;
        if !output.exit_ok() {
            return Err(OperationError::CommandFailed(format!(
                "rbd group image list {} failed: {}",
                group,
                output.stderr.trim()
            )));
        }
        parse_group_images(&output.stdout)
    }

    async fn group_snap_create(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["group", "snap", "create", &group.snap_spec(snap)])).await
    }

    async fn group_snap_list(&self, group: &GroupSpec) -> Result<Vec<String>> {
        let entries: Vec<GroupSnapEntry> = self
            .query_rbd(args(["group", "snap", "list", &group.spec(), "--format", "json"]))
            .await?;
        Ok(entries.into_iter().map(|e| e.snapshot).collect())
    }

    async fn group_snap_rollback(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["group", "snap", "rollback", &group.snap_spec(snap)])).await
    }

    async fn group_info(&self, group: &GroupSpec) -> Result<CmdOutput> {
        self.run_rbd(args(["group", "info", &group.spec()])).await
    }

    async fn group_snap_info(&self, group: &GroupSpec, snap: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["group", "snap", "info", &group.snap_spec(snap)])).await
    }

    async fn snap_create(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["snap", "create", &image.snap_spec(snap)])).await
    }

    async fn snap_list(&self, image: &ImageRef) -> Result<Vec<SnapInfo>> {
        self.query_rbd(args(["snap", "ls", "--all", &image.spec(), "--format", "json"]))
            .await
    }

    async fn snap_protect(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["snap", "protect", &image.snap_spec(snap)])).await
    }

    async fn snap_unprotect(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["snap", "unprotect", &image.snap_spec(snap)])).await
    }

    async fn snap_remove(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["snap", "rm", &image.snap_spec(snap)])).await
    }

    async fn snap_rollback(&self, image: &ImageRef, snap: &str) -> Result<CmdOutput> {
        self.run_rbd(args(["snap", "rollback", &image.snap_spec(snap)])).await
    }

    async fn snap_purge(&self, image: &ImageRef) -> Result<CmdOutput> {
        self.run_rbd(args(["snap", "purge", &image.spec()])).await
    }

    #[instrument(skip(self, req), fields(source = %req.source, dest = %req.dest))]
    async fn clone_image(&self, req: &CloneRequest) -> Result<CmdOutput> {
        let mut a = args(["clone"]);
        if let Some(format) = req.clone_format {
            a.push("--rbd-default-clone-format".to_string());
            a.push(format.to_string());
        }
        match req.snap_id {
            Some(id) => {
                a.push("--snap-id".to_string());
                a.push(id.to_string());
                a.push(req.source.spec());
            }
            None => a.push(req.source.snap_spec(&req.snap)),
        }
        a.push(req.dest.spec());
        self.run_rbd(a).await
    }

    async fn children(&self, image: &ImageRef, snap: &str) -> Result<Vec<ImageRef>> {
        let entries: Vec<ChildEntry> = self
            .query_rbd(args(["children", &image.snap_spec(snap), "--format", "json"]))
            .await?;
        Ok(entries
            .into_iter()
            .map(|c| ImageRef::new(c.pool, c.image).with_namespace(c.pool_namespace.as_deref()))
            .collect())
    }

    async fn flatten(&self, image: &ImageRef) -> Result<CmdOutput> {
        self.run_rbd(args(["flatten", &image.spec()])).await
    }

    async fn mirror_pool_enable(&self, pool: &str, mode: MirrorMode) -> Result<CmdOutput> {
        self.run_rbd(args(["mirror", "pool", "enable", pool, mode.as_str()])).await
    }

    async fn mirror_peer_bootstrap_create(&self, pool: &str, site_name: &str) -> Result<CmdOutput> {
        self.run_rbd(args([
            "mirror", "pool", "peer", "bootstrap", "create", "--site-name", site_name, pool,
        ]))
        .await
    }

    #[instrument(skip(self, pool, site_name, token), fields(pool = %pool, site = %site_name))]
    async fn mirror_peer_bootstrap_import(
        &self,
        pool: &str,
        site_name: &str,
        token: &str,
        direction: PeerDirection,
    ) -> Result<CmdOutput> {
        let token_path = format!("/tmp/rbdprov-bootstrap-{}", pool);
        let written = self
            .runner
            .run("tee", &[token_path.clone()], Some(token.trim()))
            .await?;
        if !written.exit_ok() {
            return Ok(written);
        }

        let mut a = args(["mirror", "pool", "peer", "bootstrap", "import", "--site-name", site_name]);
        if direction == PeerDirection::RxOnly {
            a.push("--direction".to_string());
            a.push(direction.as_str().to_string());
        }
        a.push(pool.to_string());
        a.push(token_path);
        self.run_rbd(a).await
    }

    async fn mirror_pool_peer_add(&self, pool: &str, remote: &str, direction: PeerDirection) -> Result<CmdOutput> {
        let mut a = args(["mirror", "pool", "peer", "add"]);
        if direction == PeerDirection::RxOnly {
            a.push("--direction".to_string());
            a.push(direction.as_str().to_string());
        }
        a.push(pool.to_string());
        a.push(remote.to_string());
        self.run_rbd(a).await
    }

    async fn mirror_pool_peers(&self, pool: &str) -> Result<Vec<String>> {
        let info: MirrorPoolInfoJson = self
            .query_rbd(args(["mirror", "pool", "info", pool, "--format", "json"]))
            .await?;
        Ok(info.peers.into_iter().map(|p| p.site_name).collect())
    }

    async fn mirror_pool_status(&self, pool: &str) -> Result<MirrorPoolStatus> {
        let status: MirrorPoolStatusJson = self
            .query_rbd(args(["mirror", "pool", "status", pool, "--format", "json"]))
            .await?;
        Ok(status.summary)
    }

    async fn mirror_image_enable(&self, image: &ImageRef, mirror_type: MirrorType) -> Result<CmdOutput> {
        self.run_rbd(args(["mirror", "image", "enable", &image.spec(), mirror_type.as_str()]))
            .await
    }

    async fn mirror_image_status(&self, image: &ImageRef) -> Result<MirrorImageStatus> {
        let raw: MirrorImageStatusJson = self
            .query_rbd(args(["mirror", "image", "status", &image.spec(), "--format", "json"]))
            .await?;
        Ok(parse_mirror_image_status(raw))
    }

    async fn mirror_snapshot_schedule_add(&self, scope: &ScheduleScope, interval: &str) -> Result<CmdOutput> {
        let mut a = args(["mirror", "snapshot", "schedule", "add"]);
        match scope {
            ScheduleScope::Cluster => {}
            ScheduleScope::Pool { pool, namespace } => pool_args(&mut a, pool, namespace.as_deref()),
            ScheduleScope::Image(image) => {
                pool_args(&mut a, &image.pool, image.namespace.as_deref());
                a.push("--image".to_string());
                a.push(image.image.clone());
            }
        }
        a.push(interval.to_string());
        self.run_rbd(a).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every invocation and replies with a canned output.
    struct RecordingRunner {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        reply: CmdOutput,
    }

    impl RecordingRunner {
        fn new(reply: CmdOutput) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply,
            })
        }

        fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String], _input: Option<&str>) -> Result<CmdOutput> {
            self.calls
                .lock()
                .unwrap()
                .push((program.to_string(), args.to_vec()));
            Ok(self.reply.clone())
        }

        fn target(&self) -> String {
            "test".to_string()
        }
    }

    #[tokio::test]
    async fn test_clone_by_snap_id() {
        let runner = RecordingRunner::new(CmdOutput::ok(""));
        let cli = RbdCli::new(runner.clone());
        let req = CloneRequest {
            source: ImageRef::new("p", "parent"),
            snap: "s1".into(),
            dest: ImageRef::new("p", "child").with_namespace(Some("ns")),
            snap_id: Some(7),
            clone_format: Some(2),
        };
        cli.clone_image(&req).await.unwrap();

        let (program, args) = &runner.calls()[0];
        assert_eq!(program, "rbd");
        assert_eq!(
            args,
            &vec![
                "clone",
                "--rbd-default-clone-format",
                "2",
                "--snap-id",
                "7",
                "p/parent",
                "p/ns/child"
            ]
        );
    }

    #[tokio::test]
    async fn test_ec_pool_create_uses_ceph() {
        let runner = RecordingRunner::new(CmdOutput::ok(""));
        let cli = RbdCli::new(runner.clone());
        let req = PoolCreate {
            pool: "ecp".into(),
            pg_num: Some(32),
            pgp_num: Some(32),
            ec_profile: Some("prof".into()),
        };
        cli.pool_create(&req).await.unwrap();
        let (program, args) = &runner.calls()[0];
        assert_eq!(program, "ceph");
        assert_eq!(args, &vec!["osd", "pool", "create", "ecp", "32", "32", "erasure", "prof"]);
    }

    #[tokio::test]
    async fn test_group_rename_keeps_namespace() {
        let runner = RecordingRunner::new(CmdOutput::ok(""));
        let cli = RbdCli::new(runner.clone());
        let group = GroupSpec::new("p", "g1").with_namespace(Some("ns"));
        cli.group_rename(&group, "g2").await.unwrap();
        let (program, args) = &runner.calls()[0];
        assert_eq!(program, "rbd");
        assert_eq!(args, &vec!["group", "rename", "p/ns/g1", "p/ns/g2"]);
    }

    #[tokio::test]
    async fn test_peer_add_one_way() {
        let runner = RecordingRunner::new(CmdOutput::ok(""));
        let cli = RbdCli::new(runner.clone());
        cli.mirror_pool_peer_add("p", "client.mirror@site-a", PeerDirection::RxOnly)
            .await
            .unwrap();
        let (program, args) = &runner.calls()[0];
        assert_eq!(program, "rbd");
        assert_eq!(
            args,
            &vec!["mirror", "pool", "peer", "add", "--direction", "rx-only", "p", "client.mirror@site-a"]
        );
    }

    #[tokio::test]
    async fn test_snap_list_parses_json() {
        let json = r#"[{"id":4,"name":"s1","size":1073741824,"protected":"true","timestamp":"x","namespace":{"type":"user"}},
                       {"id":5,"name":".mirror.primary.x","size":1,"protected":"false","namespace":{"type":"mirror","state":"primary"}}]"#;
        let cli = RbdCli::new(RecordingRunner::new(CmdOutput::ok(json)));
        let snaps = cli.snap_list(&ImageRef::new("p", "i")).await.unwrap();
        assert_eq!(snaps.len(), 2);
        assert!(snaps[0].protected);
        assert!(snaps[0].is_user_defined());
        assert!(!snaps[1].is_user_defined());
    }

    #[tokio::test]
    async fn test_query_reports_command_failure() {
        let cli = RbdCli::new(RecordingRunner::new(CmdOutput::failed(
            "rbd: error opening pool 'nope': (2) No such file or directory",
        )));
        let err = cli.group_list("nope", None).await.unwrap_err();
        assert!(matches!(err, OperationError::CommandFailed(_)));
    }

    #[test]
    fn test_parse_group_images_formats() {
        let json = r#"[{"image":"i1","pool":"p","namespace":""},{"image":"i2","pool":"q","namespace":"ns"}]"#;
        let from_json = parse_group_images(json).unwrap();
        assert_eq!(from_json[0], ImageRef::new("p", "i1"));
        assert_eq!(from_json[1], ImageRef::new("q", "i2").with_namespace(Some("ns")));

        let from_text = parse_group_images("p/i1\nq/ns/i2\n").unwrap();
        assert_eq!(from_json, from_text);
    }

    #[test]
    fn test_mirror_image_status_falls_back_to_peer_site() {
        let raw: MirrorImageStatusJson = serde_json::from_str(
            r#"{"name":"i","peer_sites":[{"state":"up+replaying","description":"replaying"}],"snapshots":[{"id":11},{"id":12}]}"#,
        )
        .unwrap();
        let status = parse_mirror_image_status(raw);
        assert_eq!(status.state, "up+replaying");
        assert_eq!(status.snapshot_ids, vec![11, 12]);
    }
}
