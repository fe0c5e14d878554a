//! Asset registry for the fleet control plane.
//!
//! The registry owns every asset record. Reads hand out cloned snapshots;
//! mutations go through typed closures under the store lock, so per-asset
//! updates are serialized and no lock is ever held across an await. The
//! registry performs no transport calls.
//!
//! Persistence is a side effect of mutation: every change marks the store
//! dirty and nudges the background persister, which writes the per-kind
//! JSON files (`build_servers.json`, `hosts.json`, `boards.json`)
//! atomically. On restart, [`Registry::load_from`] replays those files.
//!
//! Components that schedule against asset state (the build queue, the
//! selectors) subscribe to a change counter via [`Registry::subscribe`]
//! instead of polling.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

use fleet_types::{Asset, AssetKind, Board, BuildServer, Error, Result, VirtHost};

pub mod statefile;

/// Per-kind state file names
pub const BUILD_SERVERS_FILE: &str = "build_servers.json";
pub const HOSTS_FILE: &str = "hosts.json";
pub const BOARDS_FILE: &str = "boards.json";

/// Registry-wide counts for the overview surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Overview {
    pub build_servers: KindCounts,
    pub virt_hosts: KindCounts,
    pub boards: KindCounts,
    pub active_builds: u32,
    pub running_guests: u32,
    pub boards_in_use: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct KindCounts {
    pub total: usize,
    /// Ready for work: online servers/hosts, available boards.
    pub ready: usize,
    pub maintenance: usize,
}

/// In-memory typed store of every managed asset.
pub struct Registry {
    assets: RwLock<HashMap<String, Asset>>,
    change_tx: watch::Sender<u64>,
    dirty: Notify,
    dirty_flag: AtomicBool,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let (change_tx, _) = watch::channel(0);
        Self {
            assets: RwLock::new(HashMap::new()),
            change_tx,
            dirty: Notify::new(),
            dirty_flag: AtomicBool::new(false),
        }
    }

    /// Observe the change counter; it bumps on every mutation.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }

    fn mark_changed(&self) {
        self.dirty_flag.store(true, Ordering::Release);
        self.dirty.notify_one();
        self.change_tx.send_modify(|version| *version += 1);
    }

    /// Register a new asset. The id must be unused.
    pub fn register(&self, asset: Asset) -> Result<()> {
        {
            let mut assets = self.assets.write().expect("registry lock poisoned");
            if assets.contains_key(asset.id()) {
                return Err(Error::conflict(format!(
                    "asset {} already registered",
                    asset.id()
                )));
            }
            assets.insert(asset.id().to_string(), asset);
        }
        self.mark_changed();
        Ok(())
    }

    /// Remove an asset outright. Decommission policy checks live in the
    /// group engine; this is the raw store operation.
    pub fn remove(&self, id: &str) -> Result<Asset> {
        let removed = {
            let mut assets = self.assets.write().expect("registry lock poisoned");
            assets.remove(id)
        };
        match removed {
            Some(asset) => {
                self.mark_changed();
                Ok(asset)
            }
            None => Err(Error::not_found("asset", id)),
        }
    }

    pub fn get(&self, id: &str) -> Option<Asset> {
        self.assets
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.assets
            .read()
            .expect("registry lock poisoned")
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.assets.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All assets, optionally filtered by kind, sorted by id for
    /// deterministic iteration.
    pub fn list(&self, kind: Option<AssetKind>) -> Vec<Asset> {
        let assets = self.assets.read().expect("registry lock poisoned");
        let mut result: Vec<Asset> = assets
            .values()
            .filter(|a| kind.is_none_or(|k| a.kind() == k))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id().cmp(b.id()));
        result
    }

    /// Members of a group, sorted by id.
    pub fn members_of_group(&self, group_id: &str) -> Vec<Asset> {
        let assets = self.assets.read().expect("registry lock poisoned");
        let mut result: Vec<Asset> = assets
            .values()
            .filter(|a| a.group_id() == Some(group_id))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.id().cmp(b.id()));
        result
    }

    pub fn servers(&self) -> Vec<BuildServer> {
        self.list(Some(AssetKind::BuildServer))
            .into_iter()
            .filter_map(|a| match a {
                Asset::BuildServer(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn hosts(&self) -> Vec<VirtHost> {
        self.list(Some(AssetKind::VirtHost))
            .into_iter()
            .filter_map(|a| match a {
                Asset::VirtHost(h) => Some(h),
                _ => None,
            })
            .collect()
    }

    pub fn boards(&self) -> Vec<Board> {
        self.list(Some(AssetKind::Board))
            .into_iter()
            .filter_map(|a| match a {
                Asset::Board(b) => Some(b),
                _ => None,
            })
            .collect()
    }

    pub fn server(&self, id: &str) -> Result<BuildServer> {
        match self.get(id) {
            Some(Asset::BuildServer(s)) => Ok(s),
            _ => Err(Error::not_found("build_server", id)),
        }
    }

    pub fn host(&self, id: &str) -> Result<VirtHost> {
        match self.get(id) {
            Some(Asset::VirtHost(h)) => Ok(h),
            _ => Err(Error::not_found("virt_host", id)),
        }
    }

    pub fn board(&self, id: &str) -> Result<Board> {
        match self.get(id) {
            Some(Asset::Board(b)) => Ok(b),
            _ => Err(Error::not_found("board", id)),
        }
    }

    /// Mutate a build server under the store lock. Bumps `updated_at` and
    /// returns the new value.
    pub fn update_server(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut BuildServer),
    ) -> Result<BuildServer> {
        let updated = {
            let mut assets = self.assets.write().expect("registry lock poisoned");
            match assets.get_mut(id) {
                Some(Asset::BuildServer(server)) => {
                    mutate(server);
                    server.updated_at = Utc::now();
                    server.clone()
                }
                _ => return Err(Error::not_found("build_server", id)),
            }
        };
        self.mark_changed();
        Ok(updated)
    }

    pub fn update_host(&self, id: &str, mutate: impl FnOnce(&mut VirtHost)) -> Result<VirtHost> {
        let updated = {
            let mut assets = self.assets.write().expect("registry lock poisoned");
            match assets.get_mut(id) {
                Some(Asset::VirtHost(host)) => {
                    mutate(host);
                    host.updated_at = Utc::now();
                    host.clone()
                }
                _ => return Err(Error::not_found("virt_host", id)),
            }
        };
        self.mark_changed();
        Ok(updated)
    }

    pub fn update_board(&self, id: &str, mutate: impl FnOnce(&mut Board)) -> Result<Board> {
        let updated = {
            let mut assets = self.assets.write().expect("registry lock poisoned");
            match assets.get_mut(id) {
                Some(Asset::Board(board)) => {
                    mutate(board);
                    board.updated_at = Utc::now();
                    board.clone()
                }
                _ => return Err(Error::not_found("board", id)),
            }
        };
        self.mark_changed();
        Ok(updated)
    }

    /// Re-link an asset's group membership.
    pub fn set_group(&self, id: &str, group_id: Option<String>) -> Result<()> {
        let changed = {
            let mut assets = self.assets.write().expect("registry lock poisoned");
            match assets.get_mut(id) {
                Some(Asset::BuildServer(s)) => {
                    s.group_id = group_id;
                    s.updated_at = Utc::now();
                    true
                }
                Some(Asset::VirtHost(h)) => {
                    h.group_id = group_id;
                    h.updated_at = Utc::now();
                    true
                }
                Some(Asset::Board(b)) => {
                    b.group_id = group_id;
                    b.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        };
        if changed {
            self.mark_changed();
            Ok(())
        } else {
            Err(Error::not_found("asset", id))
        }
    }

    pub fn set_maintenance(&self, id: &str, maintenance: bool) -> Result<()> {
        let changed = {
            let mut assets = self.assets.write().expect("registry lock poisoned");
            match assets.get_mut(id) {
                Some(Asset::BuildServer(s)) => {
                    s.maintenance = maintenance;
                    if maintenance {
                        s.status = fleet_types::ServerStatus::Maintenance;
                    }
                    s.updated_at = Utc::now();
                    true
                }
                Some(Asset::VirtHost(h)) => {
                    h.maintenance = maintenance;
                    if maintenance {
                        h.status = fleet_types::ServerStatus::Maintenance;
                    }
                    h.updated_at = Utc::now();
                    true
                }
                Some(Asset::Board(b)) => {
                    b.maintenance = maintenance;
                    if maintenance {
                        b.status = fleet_types::BoardStatus::Maintenance;
                    }
                    b.updated_at = Utc::now();
                    true
                }
                None => false,
            }
        };
        if changed {
            self.mark_changed();
            Ok(())
        } else {
            Err(Error::not_found("asset", id))
        }
    }

    /// Registry-wide counts.
    pub fn overview(&self) -> Overview {
        let assets = self.assets.read().expect("registry lock poisoned");
        let mut overview = Overview::default();
        for asset in assets.values() {
            match asset {
                Asset::BuildServer(s) => {
                    overview.build_servers.total += 1;
                    if s.status == fleet_types::ServerStatus::Online {
                        overview.build_servers.ready += 1;
                    }
                    if s.maintenance {
                        overview.build_servers.maintenance += 1;
                    }
                    overview.active_builds += s.active_build_count;
                }
                Asset::VirtHost(h) => {
                    overview.virt_hosts.total += 1;
                    if h.status == fleet_types::ServerStatus::Online {
                        overview.virt_hosts.ready += 1;
                    }
                    if h.maintenance {
                        overview.virt_hosts.maintenance += 1;
                    }
                    overview.running_guests += h.running_guest_count;
                }
                Asset::Board(b) => {
                    overview.boards.total += 1;
                    if b.status == fleet_types::BoardStatus::Available {
                        overview.boards.ready += 1;
                    }
                    if b.maintenance {
                        overview.boards.maintenance += 1;
                    }
                    if b.status == fleet_types::BoardStatus::InUse {
                        overview.boards_in_use += 1;
                    }
                }
            }
        }
        overview
    }

    /// Write all three per-kind state files atomically.
    pub fn save_to(&self, dir: &Path) -> anyhow::Result<()> {
        let (servers, hosts, boards) = {
            let assets = self.assets.read().expect("registry lock poisoned");
            let mut servers = BTreeMap::new();
            let mut hosts = BTreeMap::new();
            let mut boards = BTreeMap::new();
            for (id, asset) in assets.iter() {
                match asset {
                    Asset::BuildServer(s) => {
                        servers.insert(id.clone(), s.clone());
                    }
                    Asset::VirtHost(h) => {
                        hosts.insert(id.clone(), h.clone());
                    }
                    Asset::Board(b) => {
                        boards.insert(id.clone(), b.clone());
                    }
                }
            }
            (servers, hosts, boards)
        };

        statefile::save_map(&dir.join(BUILD_SERVERS_FILE), &servers)?;
        statefile::save_map(&dir.join(HOSTS_FILE), &hosts)?;
        statefile::save_map(&dir.join(BOARDS_FILE), &boards)?;
        Ok(())
    }

    /// Replay the per-kind state files into a fresh registry.
    pub fn load_from(dir: &Path) -> anyhow::Result<Self> {
        let registry = Self::new();
        let servers: BTreeMap<String, BuildServer> =
            statefile::load_map(&dir.join(BUILD_SERVERS_FILE))?;
        let hosts: BTreeMap<String, VirtHost> = statefile::load_map(&dir.join(HOSTS_FILE))?;
        let boards: BTreeMap<String, Board> = statefile::load_map(&dir.join(BOARDS_FILE))?;

        {
            let mut assets = registry.assets.write().expect("registry lock poisoned");
            for (id, server) in servers {
                assets.insert(id, Asset::BuildServer(server));
            }
            for (id, host) in hosts {
                assets.insert(id, Asset::VirtHost(host));
            }
            for (id, board) in boards {
                assets.insert(id, Asset::Board(board));
            }
        }
        Ok(registry)
    }

    /// Background persister: waits for mutations, debounces briefly, and
    /// writes the state files. Persistence is best-effort; failures are
    /// logged and retried on the next change.
    pub async fn run_persister(&self, dir: PathBuf, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = self.dirty.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // Coalesce bursts of mutations into one write.
            tokio::time::sleep(Duration::from_millis(200)).await;

            if self.dirty_flag.swap(false, Ordering::AcqRel) {
                match self.save_to(&dir) {
                    Ok(()) => debug!(dir = %dir.display(), "registry state persisted"),
                    Err(error) => {
                        warn!(%error, "failed to persist registry state");
                        self.dirty_flag.store(true, Ordering::Release);
                    }
                }
            }
        }

        // Final flush on shutdown.
        if self.dirty_flag.swap(false, Ordering::AcqRel) {
            if let Err(error) = self.save_to(&dir) {
                warn!(%error, "failed to persist registry state on shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use fleet_types::{
        BoardHealth, BoardStatus, HealthLevel, PowerControlConfig, ResourceUtilization,
        ServerStatus, ShellCredentials,
    };
    use std::collections::BTreeMap as Map;

    fn utc(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("timestamp")
    }

    fn creds(host: &str) -> ShellCredentials {
        ShellCredentials {
            hostname: host.to_string(),
            username: "fleet".to_string(),
            port: 22,
            key_path: None,
        }
    }

    fn server(id: &str) -> BuildServer {
        BuildServer {
            id: id.to_string(),
            hostname: id.to_string(),
            credentials: creds("10.0.0.1"),
            supported_architectures: vec!["arm64".to_string()],
            toolchains: vec![],
            total_cpu_cores: 8,
            total_memory_mb: 16_384,
            total_storage_gb: 500,
            status: ServerStatus::Online,
            health_level: HealthLevel::Healthy,
            utilization: ResourceUtilization::default(),
            active_build_count: 0,
            max_concurrent_builds: 4,
            queue_depth: 0,
            group_id: None,
            labels: Map::new(),
            maintenance: false,
            created_at: utc(0),
            updated_at: utc(0),
            last_probe_at: None,
        }
    }

    fn board(id: &str) -> Board {
        Board {
            id: id.to_string(),
            name: id.to_string(),
            board_type: "raspberry_pi_4".to_string(),
            architecture: "arm64".to_string(),
            power_control: PowerControlConfig::manual(),
            serial_number: None,
            credentials: Some(creds("10.0.1.1")),
            serial_device: None,
            serial_baud_rate: 115_200,
            status: BoardStatus::Available,
            health: BoardHealth::default(),
            flash_station_id: None,
            current_firmware_version: None,
            last_flash_at: None,
            assigned_test_id: None,
            group_id: None,
            labels: Map::new(),
            peripherals: vec![],
            maintenance: false,
            created_at: utc(0),
            updated_at: utc(0),
            last_probe_at: None,
        }
    }

    #[test]
    fn register_and_fetch_typed() {
        let registry = Registry::new();
        registry
            .register(Asset::BuildServer(server("srv-1")))
            .expect("register");

        assert!(registry.contains("srv-1"));
        assert_eq!(registry.server("srv-1").expect("server").id, "srv-1");
        // Wrong-kind lookups are not-found, not a panic.
        assert!(registry.board("srv-1").is_err());
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let registry = Registry::new();
        registry
            .register(Asset::BuildServer(server("srv-1")))
            .expect("register");
        let result = registry.register(Asset::BuildServer(server("srv-1")));
        assert!(matches!(result, Err(Error::Conflict(_))));
    }

    #[test]
    fn update_bumps_updated_at_and_notifies() {
        let registry = Registry::new();
        registry
            .register(Asset::BuildServer(server("srv-1")))
            .expect("register");
        let rx = registry.subscribe();
        let version_before = *rx.borrow();

        let updated = registry
            .update_server("srv-1", |s| s.active_build_count = 2)
            .expect("update");
        assert_eq!(updated.active_build_count, 2);
        assert!(updated.updated_at > utc(0));
        assert!(*rx.borrow() > version_before);
    }

    #[test]
    fn list_is_sorted_and_kind_filtered() {
        let registry = Registry::new();
        registry
            .register(Asset::BuildServer(server("srv-b")))
            .expect("register");
        registry
            .register(Asset::BuildServer(server("srv-a")))
            .expect("register");
        registry
            .register(Asset::Board(board("brd-1")))
            .expect("register");

        let servers = registry.servers();
        assert_eq!(
            servers.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["srv-a", "srv-b"]
        );
        assert_eq!(registry.list(None).len(), 3);
        assert_eq!(registry.list(Some(AssetKind::Board)).len(), 1);
    }

    #[test]
    fn group_membership_roundtrip() {
        let registry = Registry::new();
        registry
            .register(Asset::Board(board("brd-1")))
            .expect("register");
        registry
            .set_group("brd-1", Some("grp-lab".to_string()))
            .expect("set group");

        let members = registry.members_of_group("grp-lab");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id(), "brd-1");

        registry.set_group("brd-1", None).expect("clear group");
        assert!(registry.members_of_group("grp-lab").is_empty());
    }

    #[test]
    fn maintenance_forces_status() {
        let registry = Registry::new();
        registry
            .register(Asset::Board(board("brd-1")))
            .expect("register");
        registry.set_maintenance("brd-1", true).expect("set");
        let board = registry.board("brd-1").expect("board");
        assert!(board.maintenance);
        assert_eq!(board.status, BoardStatus::Maintenance);
    }

    #[test]
    fn remove_missing_is_not_found() {
        let registry = Registry::new();
        assert!(matches!(
            registry.remove("ghost"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn overview_counts_by_kind_and_status() {
        let registry = Registry::new();
        let mut busy = server("srv-1");
        busy.active_build_count = 3;
        registry.register(Asset::BuildServer(busy)).expect("register");
        let mut offline = server("srv-2");
        offline.status = ServerStatus::Offline;
        registry
            .register(Asset::BuildServer(offline))
            .expect("register");
        let mut in_use = board("brd-1");
        in_use.status = BoardStatus::InUse;
        registry.register(Asset::Board(in_use)).expect("register");

        let overview = registry.overview();
        assert_eq!(overview.build_servers.total, 2);
        assert_eq!(overview.build_servers.ready, 1);
        assert_eq!(overview.active_builds, 3);
        assert_eq!(overview.boards.total, 1);
        assert_eq!(overview.boards.ready, 0);
        assert_eq!(overview.boards_in_use, 1);
    }

    #[test]
    fn save_and_load_round_trip() {
        let td = tempfile::tempdir().expect("tempdir");
        let registry = Registry::new();
        registry
            .register(Asset::BuildServer(server("srv-1")))
            .expect("register");
        registry
            .register(Asset::Board(board("brd-1")))
            .expect("register");
        registry.save_to(td.path()).expect("save");

        assert!(td.path().join(BUILD_SERVERS_FILE).exists());
        assert!(td.path().join(HOSTS_FILE).exists());
        assert!(td.path().join(BOARDS_FILE).exists());

        let replayed = Registry::load_from(td.path()).expect("load");
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed.server("srv-1").expect("server").id, "srv-1");
        assert_eq!(replayed.board("brd-1").expect("board").id, "brd-1");
    }

    #[tokio::test(start_paused = true)]
    async fn persister_writes_after_mutation() {
        let td = tempfile::tempdir().expect("tempdir");
        let registry = std::sync::Arc::new(Registry::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let persister = {
            let registry = std::sync::Arc::clone(&registry);
            let dir = td.path().to_path_buf();
            tokio::spawn(async move { registry.run_persister(dir, shutdown_rx).await })
        };

        registry
            .register(Asset::BuildServer(server("srv-1")))
            .expect("register");

        // Let the debounce window elapse.
        tokio::time::sleep(Duration::from_millis(300)).await;
        tokio::task::yield_now().await;

        shutdown_tx.send(true).expect("shutdown");
        persister.await.expect("join");

        let replayed = Registry::load_from(td.path()).expect("load");
        assert_eq!(replayed.len(), 1);
    }
}
