//! ResourceStore — file-backed bookkeeping for tracked workloads.
//!
//! Disk writes happen synchronously under the store lock, so a crash can
//! never leave the in-memory maps ahead of the persisted state. Recovery of
//! the opposite case (directories on disk with no state record) happens in
//! [`ResourceStore::open`].

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use berth_core::message::now_timestamp;
use berth_core::state::AppState;

use crate::error::{StoreError, StoreResult};
use crate::layout::WorkspaceLayout;

/// Sentinel for image/container ids that have never been assigned.
pub const UNSET_ID: &str = "0";
/// Sentinel for a workload that has no allocated port yet.
pub const UNSET_PORT: u16 = 0;

const GITIGNORE: &str = "**/generated\ntemp/\n";

/// Container runtime handles of one workload, persisted per workload as
/// `management/<uuid>/image-data.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(rename = "imageId")]
    pub image_id: String,
    #[serde(rename = "containerId")]
    pub container_id: String,
    pub port: u16,
}

impl Default for ImageData {
    fn default() -> Self {
        Self {
            image_id: UNSET_ID.to_string(),
            container_id: UNSET_ID.to_string(),
            port: UNSET_PORT,
        }
    }
}

impl ImageData {
    pub fn has_image(&self) -> bool {
        self.image_id != UNSET_ID
    }

    pub fn has_container(&self) -> bool {
        !self.container_id.is_empty() && self.container_id != UNSET_ID
    }

    pub fn has_port(&self) -> bool {
        self.port != UNSET_PORT
    }
}

#[derive(Default)]
struct StoreInner {
    /// UUIDs with a management directory on disk ("currently tracked").
    active: HashSet<Uuid>,
    /// Every UUID ever issued, with its last known state. Never pruned,
    /// which is what keeps deleted UUIDs from being reissued.
    states: HashMap<Uuid, AppState>,
    image_data: HashMap<Uuid, ImageData>,
    ports: HashMap<Uuid, u16>,
}

pub struct ResourceStore {
    layout: WorkspaceLayout,
    min_port: u16,
    inner: Mutex<StoreInner>,
}

impl ResourceStore {
    /// Open the store rooted at `layout`, creating the directory skeleton
    /// and reconciling disk contents with the persisted state map.
    pub fn open(layout: WorkspaceLayout, min_port: u16) -> StoreResult<Self> {
        ensure_dir(layout.work_dir())?;
        ensure_dir(&layout.repositories_dir())?;
        ensure_dir(&layout.management_root())?;
        ensure_dir(&layout.temp_root())?;
        fs::write(layout.gitignore(), GITIGNORE)?;
        if !layout.audit_log().exists() {
            fs::write(layout.audit_log(), "")?;
        }

        let mut inner = StoreInner::default();

        for entry in fs::read_dir(layout.management_root())? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Ok(uuid) = entry.file_name().to_string_lossy().parse::<Uuid>()
            {
                inner.active.insert(uuid);
            }
        }
        info!(count = inner.active.len(), "loaded currently tracked data apps");

        let state_file = layout.state_file();
        if state_file.exists() {
            inner.states = serde_json::from_str(&fs::read_to_string(&state_file)?)?;
        } else {
            fs::write(&state_file, serde_json::to_string_pretty(&inner.states)?)?;
        }
        info!(count = inner.states.len(), "loaded lifecycle state records");

        // Crash recovery: directories on disk without a state record.
        let orphaned: Vec<Uuid> = inner
            .active
            .iter()
            .filter(|uuid| !inner.states.contains_key(uuid))
            .copied()
            .collect();
        if !orphaned.is_empty() {
            info!(
                count = orphaned.len(),
                "found tracked data apps without state records, marking UNKNOWN_STATE"
            );
            for uuid in orphaned {
                inner.states.insert(uuid, AppState::UnknownState);
            }
            fs::write(&state_file, serde_json::to_string_pretty(&inner.states)?)?;
        }

        // Pre-warm image metadata and the port allocation table.
        for uuid in inner.active.clone() {
            let data = load_image_data(&layout, uuid)?.unwrap_or_default();
            if data.has_port() {
                inner.ports.insert(uuid, data.port);
            }
            inner.image_data.insert(uuid, data);
        }

        Ok(Self {
            layout,
            min_port,
            inner: Mutex::new(inner),
        })
    }

    pub fn layout(&self) -> &WorkspaceLayout {
        &self.layout
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Registration ───────────────────────────────────────────────

    /// Allocate a fresh UUID and create the workload's directories,
    /// persisting the (already masked) registration request as the origin
    /// record. Partial failures roll the directories back.
    pub fn register(&self, origin_json: &str) -> StoreResult<Uuid> {
        let mut inner = self.lock();
        let uuid = sample_free_uuid(&inner.active, &inner.states);

        ensure_dir(&self.layout.management_dir(uuid))?;
        if let Err(error) = ensure_dir(&self.layout.repository_dir(uuid)) {
            let _ = fs::remove_dir_all(self.layout.management_dir(uuid));
            return Err(error);
        }
        if let Err(error) = fs::write(self.layout.origin_file(uuid), origin_json) {
            let _ = fs::remove_dir_all(self.layout.repository_dir(uuid));
            let _ = fs::remove_dir_all(self.layout.management_dir(uuid));
            return Err(error.into());
        }

        inner.active.insert(uuid);
        debug!(%uuid, "created data app directories");
        Ok(uuid)
    }

    /// The persisted origin record (masked registration request).
    pub fn load_origin(&self, uuid: Uuid) -> StoreResult<String> {
        Ok(fs::read_to_string(self.layout.origin_file(uuid))?)
    }

    /// Drop a UUID from the tracked set. Its state record stays behind,
    /// so the UUID is never handed out again.
    pub fn free(&self, uuid: Uuid) {
        let mut inner = self.lock();
        inner.active.remove(&uuid);
        inner.image_data.remove(&uuid);
    }

    /// Roll a partially registered workload back out of existence: the
    /// UUID loses both its tracked entry and its state record, as if the
    /// registration never happened.
    pub fn forget(&self, uuid: Uuid) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.active.remove(&uuid);
        if inner.states.remove(&uuid).is_some() {
            self.persist_states(&inner)?;
        }
        Ok(())
    }

    pub fn is_tracked(&self, uuid: Uuid) -> bool {
        self.lock().active.contains(&uuid)
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().active.len()
    }

    // ── Lifecycle state ────────────────────────────────────────────

    pub fn state_of(&self, uuid: Uuid) -> AppState {
        self.lock()
            .states
            .get(&uuid)
            .copied()
            .unwrap_or(AppState::UnknownDataApp)
    }

    pub fn set_state(&self, uuid: Uuid, state: AppState) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.states.insert(uuid, state);
        self.persist_states(&inner)
    }

    /// Compare-and-swap state advance used by async workers: move to
    /// `next` only if the workload is still in `expected`. Returns whether
    /// the swap happened.
    pub fn advance_state_if(
        &self,
        uuid: Uuid,
        expected: AppState,
        next: AppState,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner.states.get(&uuid) == Some(&expected) {
            inner.states.insert(uuid, next);
            self.persist_states(&inner)?;
            Ok(true)
        } else {
            debug!(%uuid, expected = %expected, "state moved concurrently, leaving untouched");
            Ok(false)
        }
    }

    fn persist_states(&self, inner: &StoreInner) -> StoreResult<()> {
        fs::write(
            self.layout.state_file(),
            serde_json::to_string_pretty(&inner.states)?,
        )?;
        Ok(())
    }

    // ── Image metadata ─────────────────────────────────────────────

    pub fn image_data(&self, uuid: Uuid) -> StoreResult<ImageData> {
        let mut inner = self.lock();
        self.ensure_image_data(&mut inner, uuid)?;
        Ok(inner.image_data.get(&uuid).cloned().unwrap_or_default())
    }

    pub fn set_image_id(&self, uuid: Uuid, image_id: &str) -> StoreResult<()> {
        self.update_image_data(uuid, |data| data.image_id = image_id.to_string())
    }

    pub fn set_container_id(&self, uuid: Uuid, container_id: &str) -> StoreResult<()> {
        self.update_image_data(uuid, |data| data.container_id = container_id.to_string())
    }

    pub fn set_port(&self, uuid: Uuid, port: u16) -> StoreResult<()> {
        self.update_image_data(uuid, |data| data.port = port)
    }

    fn ensure_image_data(&self, inner: &mut StoreInner, uuid: Uuid) -> StoreResult<()> {
        if !inner.image_data.contains_key(&uuid) {
            let data = load_image_data(&self.layout, uuid)?.unwrap_or_default();
            inner.image_data.insert(uuid, data);
        }
        Ok(())
    }

    fn update_image_data(
        &self,
        uuid: Uuid,
        mutate: impl FnOnce(&mut ImageData),
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        self.ensure_image_data(&mut inner, uuid)?;
        let data = inner.image_data.entry(uuid).or_default();
        mutate(data);
        let json = serde_json::to_string_pretty(data)?;
        fs::create_dir_all(self.layout.management_dir(uuid))?;
        fs::write(self.layout.image_data_file(uuid), json)?;
        Ok(())
    }

    // ── Port allocation ────────────────────────────────────────────

    /// Pick a random unused port in `[min_port, 65535]` and record it for
    /// `uuid`. Rejection sampling runs under the store lock, so two
    /// concurrent calls can never return the same port.
    pub fn allocate_port(&self, uuid: Uuid) -> u16 {
        let mut inner = self.lock();
        let mut rng = rand::thread_rng();
        let port = loop {
            let candidate: u16 = rng.gen_range(self.min_port..=u16::MAX);
            if !inner.ports.values().any(|&used| used == candidate) {
                break candidate;
            }
        };
        inner.ports.insert(uuid, port);
        debug!(%uuid, port, "allocated port");
        port
    }

    pub fn release_port(&self, uuid: Uuid) {
        self.lock().ports.remove(&uuid);
    }

    pub fn allocated_port(&self, uuid: Uuid) -> Option<u16> {
        self.lock().ports.get(&uuid).copied()
    }

    // ── Filesystem lifecycle ───────────────────────────────────────

    pub fn remove_repository_dir(&self, uuid: Uuid) -> StoreResult<()> {
        fs::remove_dir_all(self.layout.repository_dir(uuid))?;
        Ok(())
    }

    /// Strip the `.git` metadata from a freshly cloned workload so the
    /// source tree is committed into the audit repository as plain files.
    pub fn remove_git_metadata(&self, uuid: Uuid) -> StoreResult<()> {
        fs::remove_dir_all(self.layout.repository_dir(uuid).join(".git"))?;
        Ok(())
    }

    pub fn remove_management_dir(&self, uuid: Uuid) -> StoreResult<()> {
        fs::remove_dir_all(self.layout.management_dir(uuid))?;
        Ok(())
    }

    pub fn create_temp_dir(&self, uuid: Uuid) -> StoreResult<PathBuf> {
        let dir = self.layout.temp_dir(uuid);
        ensure_dir(&dir)?;
        Ok(dir)
    }

    pub fn remove_temp_dir(&self, uuid: Uuid) -> StoreResult<()> {
        fs::remove_dir_all(self.layout.temp_dir(uuid))?;
        Ok(())
    }

    // ── Audit log ──────────────────────────────────────────────────

    pub fn log_event(&self, uuid: Uuid, message: &str) -> StoreResult<()> {
        self.append_log(&format!("{uuid} - {message}"))
    }

    pub fn log_system(&self, message: &str) -> StoreResult<()> {
        self.append_log(message)
    }

    fn append_log(&self, line: &str) -> StoreResult<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.layout.audit_log())?;
        writeln!(file, "{} - {}", now_timestamp(), line)?;
        Ok(())
    }
}

/// Draw v4 UUIDs until one is found that has never been issued.
fn sample_free_uuid(active: &HashSet<Uuid>, states: &HashMap<Uuid, AppState>) -> Uuid {
    let mut uuid = Uuid::new_v4();
    while active.contains(&uuid) || states.contains_key(&uuid) {
        uuid = Uuid::new_v4();
    }
    uuid
}

fn load_image_data(layout: &WorkspaceLayout, uuid: Uuid) -> StoreResult<Option<ImageData>> {
    let file = layout.image_data_file(uuid);
    if !file.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&fs::read_to_string(file)?)?))
}

fn ensure_dir(dir: &Path) -> StoreResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    if dir.exists() {
        return Err(StoreError::ObstructedDir(dir.to_path_buf()));
    }
    fs::create_dir_all(dir)?;
    debug!(?dir, "created working directory");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &Path) -> ResourceStore {
        ResourceStore::open(WorkspaceLayout::new(dir), 10000).unwrap()
    }

    #[test]
    fn open_creates_directory_skeleton() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        assert!(store.layout().repositories_dir().is_dir());
        assert!(store.layout().management_root().is_dir());
        assert!(store.layout().temp_root().is_dir());
        assert!(store.layout().state_file().is_file());
        assert!(store.layout().audit_log().is_file());
        assert!(store.layout().gitignore().is_file());
    }

    #[test]
    fn register_creates_dirs_and_origin() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let uuid = store.register("{\"origin\":true}").unwrap();
        assert!(store.is_tracked(uuid));
        assert!(store.layout().repository_dir(uuid).is_dir());
        assert!(store.layout().management_dir(uuid).is_dir());
        assert_eq!(store.load_origin(uuid).unwrap(), "{\"origin\":true}");
    }

    #[test]
    fn register_issues_distinct_uuids() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut seen = HashSet::new();
        for _ in 0..32 {
            assert!(seen.insert(store.register("{}").unwrap()));
        }
    }

    #[test]
    fn unknown_uuid_reports_unknown_data_app() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert_eq!(store.state_of(Uuid::new_v4()), AppState::UnknownDataApp);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = {
            let store = open_store(dir.path());
            let uuid = store.register("{}").unwrap();
            store.set_state(uuid, AppState::Compiled).unwrap();
            uuid
        };

        let store = open_store(dir.path());
        assert_eq!(store.state_of(uuid), AppState::Compiled);
        assert!(store.is_tracked(uuid));
    }

    #[test]
    fn reconciliation_assigns_unknown_state() {
        let dir = tempfile::tempdir().unwrap();
        let layout = WorkspaceLayout::new(dir.path());
        let orphan = Uuid::new_v4();

        {
            let _ = open_store(dir.path());
            // Simulate a crash that left a management dir behind without a
            // state record.
            fs::create_dir_all(layout.management_dir(orphan)).unwrap();
        }

        let store = open_store(dir.path());
        assert!(store.is_tracked(orphan));
        assert_eq!(store.state_of(orphan), AppState::UnknownState);

        // The resolution was persisted, not just computed in memory.
        let persisted: HashMap<Uuid, AppState> =
            serde_json::from_str(&fs::read_to_string(layout.state_file()).unwrap()).unwrap();
        assert_eq!(persisted.get(&orphan), Some(&AppState::UnknownState));
    }

    #[test]
    fn advance_state_if_swaps_only_from_expected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let uuid = store.register("{}").unwrap();
        store.set_state(uuid, AppState::Starting).unwrap();

        assert!(
            store
                .advance_state_if(uuid, AppState::Starting, AppState::Running)
                .unwrap()
        );
        assert_eq!(store.state_of(uuid), AppState::Running);

        // A second worker completing late must not clobber the new state.
        assert!(
            !store
                .advance_state_if(uuid, AppState::Starting, AppState::Running)
                .unwrap()
        );
        assert_eq!(store.state_of(uuid), AppState::Running);
    }

    #[test]
    fn image_data_defaults_to_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let uuid = store.register("{}").unwrap();

        let data = store.image_data(uuid).unwrap();
        assert_eq!(data, ImageData::default());
        assert!(!data.has_image());
        assert!(!data.has_container());
        assert!(!data.has_port());
    }

    #[test]
    fn image_data_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = {
            let store = open_store(dir.path());
            let uuid = store.register("{}").unwrap();
            store.set_image_id(uuid, "sha256:abc").unwrap();
            store.set_container_id(uuid, "c1").unwrap();
            store.set_port(uuid, 12345).unwrap();
            uuid
        };

        let store = open_store(dir.path());
        let data = store.image_data(uuid).unwrap();
        assert_eq!(data.image_id, "sha256:abc");
        assert_eq!(data.container_id, "c1");
        assert_eq!(data.port, 12345);
        // The port table was pre-warmed from disk.
        assert_eq!(store.allocated_port(uuid), Some(12345));
    }

    #[test]
    fn allocated_ports_are_distinct_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());

        let mut ports = HashSet::new();
        for _ in 0..64 {
            let uuid = Uuid::new_v4();
            let port = store.allocate_port(uuid);
            assert!(port >= 10000);
            assert!(ports.insert(port), "port {port} handed out twice");
        }
    }

    #[test]
    fn released_port_can_be_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResourceStore::open(WorkspaceLayout::new(dir.path()), u16::MAX - 1).unwrap();

        // Only two candidate ports exist; exhaust, release, reallocate.
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let port_a = store.allocate_port(first);
        let port_b = store.allocate_port(second);
        assert_ne!(port_a, port_b);

        store.release_port(first);
        let third = store.allocate_port(Uuid::new_v4());
        assert_eq!(third, port_a);
    }

    #[test]
    fn freed_uuid_is_never_reissued() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let uuid = store.register("{}").unwrap();
        store.set_state(uuid, AppState::Deleted).unwrap();
        store.free(uuid);

        assert!(!store.is_tracked(uuid));
        // The state record survives as the tombstone that blocks reissue.
        assert_eq!(store.state_of(uuid), AppState::Deleted);

        let inner = store.lock();
        let sampled = sample_free_uuid(&inner.active, &inner.states);
        assert_ne!(sampled, uuid);
    }

    #[test]
    fn delete_flow_removes_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let uuid = store.register("{}").unwrap();

        store.remove_repository_dir(uuid).unwrap();
        store.remove_management_dir(uuid).unwrap();
        assert!(!store.layout().repository_dir(uuid).exists());
        assert!(!store.layout().management_dir(uuid).exists());
    }

    #[test]
    fn temp_dir_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let uuid = Uuid::new_v4();

        let tmp = store.create_temp_dir(uuid).unwrap();
        assert!(tmp.is_dir());
        store.remove_temp_dir(uuid).unwrap();
        assert!(!tmp.exists());
    }

    #[test]
    fn audit_log_appends_timestamped_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let uuid = Uuid::new_v4();

        store.log_system("Started the control plane.").unwrap();
        store.log_event(uuid, "Successfully registered Data App.").unwrap();

        let log = fs::read_to_string(store.layout().audit_log()).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("Started the control plane."));
        assert!(lines[1].contains(&uuid.to_string()));
        assert!(lines[1].ends_with("Successfully registered Data App."));
    }

    #[test]
    fn obstructed_work_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("work");
        fs::write(&blocked, "not a directory").unwrap();

        let result = ResourceStore::open(WorkspaceLayout::new(&blocked), 10000);
        assert!(matches!(result, Err(StoreError::ObstructedDir(_))));
    }
}
