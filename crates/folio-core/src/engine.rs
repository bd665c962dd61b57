//! Main Folio engine - the primary entry point for the client side
//!
//! `Folio` coordinates one tenant's local data: the tenant-root store,
//! lazily opened per-novel stores, the chapter room store, the purge
//! coordinator, and (once sync is attached) the connection resilience
//! controller plus one replica task per open store.
//!
//! # Example
//!
//! ```ignore
//! use folio_core::Folio;
//!
//! let folio = Folio::open("~/.folio/data", user_id)?;
//!
//! // Write offline; everything is committed to the local event log.
//! let novel = folio.create_novel("The Long Winter")?;
//! let volume = folio.create_volume(&novel.id, "Part One")?;
//! let chapter = folio.create_chapter(&novel.id, &volume.id, "Thaw")?;
//!
//! // Sync transparently once attached.
//! folio.attach_sync(config).await;
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::connection::{
    ConnectionController, ConnectionState, CredentialOracle, NetworkOracle,
};
use crate::error::{SyncError, SyncResult};
use crate::event::EventPayload;
use crate::order::key_between;
use crate::purge::{spawn_purge_coordinator, PurgeEnvironment};
use crate::rooms::RoomStore;
use crate::store::{self, LocalStore};
use crate::store_id::{make_novel_store_id, make_user_store_id, new_id, StoreId};
use crate::sync::replica::{purge_remote_store, spawn_replica, TcpHealthProbe};
use crate::sync::{ReplicaConfig, SyncEvent};
use crate::tables::{ChapterRow, NovelRow, VolumeRow};

/// Default capacity for the sync event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How to reach the sync server and as whom
pub struct SyncConfig {
    pub server_addr: SocketAddr,
    pub network: Arc<dyn NetworkOracle>,
    pub credentials: Arc<dyn CredentialOracle>,
}

struct SyncRuntime {
    controller: ConnectionController,
    replica_config: ReplicaConfig,
    replicas: HashMap<StoreId, JoinHandle<()>>,
}

struct FolioInner {
    data_dir: PathBuf,
    stores_dir: PathBuf,
    user_id: String,
    user_store: Arc<LocalStore>,
    novel_stores: RwLock<HashMap<String, Arc<LocalStore>>>,
    rooms: RoomStore,
    event_tx: broadcast::Sender<SyncEvent>,
    sync: Mutex<Option<SyncRuntime>>,
}

/// Main entry point for the Folio client engine. Cheap to clone.
#[derive(Clone)]
pub struct Folio {
    inner: Arc<FolioInner>,
    purge_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Folio {
    /// Open the engine for one tenant under the given data directory.
    ///
    /// Creates the directory layout on first use and starts the purge
    /// coordinator, resuming from the persisted watermark.
    pub fn open(data_dir: impl AsRef<Path>, user_id: impl Into<String>) -> SyncResult<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let user_id = user_id.into();
        info!(?data_dir, %user_id, "Opening Folio engine");

        std::fs::create_dir_all(&data_dir)?;
        let stores_dir = data_dir.join("stores");

        let user_store = Arc::new(LocalStore::open(
            &stores_dir,
            make_user_store_id(&user_id),
        )?);
        let rooms = RoomStore::open(data_dir.join("rooms.redb"))?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Arc::new(FolioInner {
            data_dir,
            stores_dir,
            user_id,
            user_store,
            novel_stores: RwLock::new(HashMap::new()),
            rooms,
            event_tx,
            sync: Mutex::new(None),
        });

        let env: Arc<dyn PurgeEnvironment> = inner.clone();
        let purge_task =
            spawn_purge_coordinator(inner.user_store.clone(), inner.user_id.clone(), env);

        Ok(Self {
            inner,
            purge_task: Arc::new(Mutex::new(Some(purge_task))),
        })
    }

    /// The tenant this engine is opened for
    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    /// Data directory path
    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// The tenant-root store
    pub fn user_store(&self) -> &Arc<LocalStore> {
        &self.inner.user_store
    }

    /// The chapter room store
    pub fn rooms(&self) -> &RoomStore {
        &self.inner.rooms
    }

    /// Subscribe to sync events from all replica tasks
    pub fn subscribe_sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_tx.subscribe()
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Novel commands (tenant-root store)
    // ═══════════════════════════════════════════════════════════════════════

    /// Create a novel; returns its materialized row
    pub fn create_novel(&self, title: impl Into<String>) -> SyncResult<NovelRow> {
        let id = new_id();
        let now = Self::now_ms();
        self.inner.user_store.commit(vec![EventPayload::NovelCreated {
            id: id.clone(),
            title: title.into(),
            created: now,
            modified: now,
        }])?;
        self.require_novel(&id)
    }

    /// Rename a novel
    pub fn rename_novel(&self, novel_id: &str, title: impl Into<String>) -> SyncResult<()> {
        self.require_novel(novel_id)?;
        self.inner
            .user_store
            .commit(vec![EventPayload::NovelTitleUpdated {
                id: novel_id.to_string(),
                title: title.into(),
                modified: Self::now_ms(),
            }])?;
        Ok(())
    }

    /// Soft-delete a novel: hidden from default queries, history kept
    pub fn trash_novel(&self, novel_id: &str) -> SyncResult<()> {
        self.require_novel(novel_id)?;
        self.inner.user_store.commit(vec![EventPayload::NovelDeleted {
            id: novel_id.to_string(),
            deleted: Self::now_ms(),
        }])?;
        Ok(())
    }

    /// Restore a soft-deleted novel
    pub fn restore_novel(&self, novel_id: &str) -> SyncResult<()> {
        self.require_novel(novel_id)?;
        self.inner.user_store.commit(vec![EventPayload::NovelRestored {
            id: novel_id.to_string(),
            modified: Self::now_ms(),
        }])?;
        Ok(())
    }

    /// Record that the user worked in a novel just now
    pub fn touch_novel(&self, novel_id: &str) -> SyncResult<()> {
        self.require_novel(novel_id)?;
        self.inner.user_store.commit(vec![EventPayload::NovelAccessed {
            id: novel_id.to_string(),
            last_accessed: Self::now_ms(),
        }])?;
        self.inner.user_store.set_last_accessed_novel(novel_id)
    }

    /// Delete a novel forever.
    ///
    /// Commits the `NovelPurged` event; the purge coordinator observes it
    /// and cascades to the novel's sub-store, its chapter rooms, and the
    /// remote actor. The novel need not be trashed first (owner
    /// force-purge).
    pub fn purge_novel(&self, novel_id: &str) -> SyncResult<()> {
        self.require_novel(novel_id)?;
        self.inner.user_store.commit(vec![EventPayload::NovelPurged {
            id: novel_id.to_string(),
            purged: Self::now_ms(),
        }])?;
        Ok(())
    }

    fn require_novel(&self, novel_id: &str) -> SyncResult<NovelRow> {
        self.inner
            .user_store
            .novel(novel_id)?
            .ok_or_else(|| SyncError::NovelNotFound(novel_id.to_string()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Volume & chapter commands (per-novel store)
    // ═══════════════════════════════════════════════════════════════════════

    /// Open (or get) the local store for a novel.
    ///
    /// If sync is attached, a replica task for the store is started too.
    pub fn open_novel(&self, novel_id: &str) -> SyncResult<Arc<LocalStore>> {
        self.require_novel(novel_id)?;
        let store_id = make_novel_store_id(&self.inner.user_id, novel_id);

        if let Some(store) = self.inner.novel_stores.read().get(novel_id) {
            return Ok(store.clone());
        }

        let store = Arc::new(LocalStore::open(&self.inner.stores_dir, store_id.clone())?);
        self.inner
            .novel_stores
            .write()
            .insert(novel_id.to_string(), store.clone());

        let mut sync = self.inner.sync.lock();
        if let Some(runtime) = sync.as_mut() {
            if !runtime.replicas.contains_key(&store_id) {
                let task = spawn_replica(
                    store.clone(),
                    runtime.replica_config.clone(),
                    runtime.controller.watch(),
                    self.inner.event_tx.clone(),
                );
                runtime.replicas.insert(store_id, task);
            }
        }
        Ok(store)
    }

    /// Create a volume in a novel
    pub fn create_volume(
        &self,
        novel_id: &str,
        title: impl Into<String>,
    ) -> SyncResult<VolumeRow> {
        let store = self.open_novel(novel_id)?;
        let id = new_id();
        let now = Self::now_ms();
        store.commit(vec![EventPayload::VolumeCreated {
            id: id.clone(),
            title: title.into(),
            created: now,
            modified: now,
        }])?;
        store
            .volume(&id)?
            .ok_or_else(|| SyncError::VolumeNotFound(id))
    }

    /// Rename a volume
    pub fn rename_volume(
        &self,
        novel_id: &str,
        volume_id: &str,
        title: impl Into<String>,
    ) -> SyncResult<()> {
        let store = self.open_novel(novel_id)?;
        store
            .volume(volume_id)?
            .ok_or_else(|| SyncError::VolumeNotFound(volume_id.to_string()))?;
        store.commit(vec![EventPayload::VolumeTitleUpdated {
            id: volume_id.to_string(),
            title: title.into(),
            modified: Self::now_ms(),
        }])?;
        Ok(())
    }

    /// Soft-delete a volume
    pub fn trash_volume(&self, novel_id: &str, volume_id: &str) -> SyncResult<()> {
        let store = self.open_novel(novel_id)?;
        store
            .volume(volume_id)?
            .ok_or_else(|| SyncError::VolumeNotFound(volume_id.to_string()))?;
        store.commit(vec![EventPayload::VolumeDeleted {
            id: volume_id.to_string(),
            deleted: Self::now_ms(),
        }])?;
        Ok(())
    }

    /// Create a chapter at the end of a volume
    pub fn create_chapter(
        &self,
        novel_id: &str,
        volume_id: &str,
        title: impl Into<String>,
    ) -> SyncResult<ChapterRow> {
        let store = self.open_novel(novel_id)?;
        store
            .volume(volume_id)?
            .ok_or_else(|| SyncError::VolumeNotFound(volume_id.to_string()))?;

        let chapters = store.chapters_of(volume_id)?;
        let order = key_between(chapters.last().map(|c| c.order.as_str()), None);

        let id = new_id();
        let now = Self::now_ms();
        store.commit(vec![EventPayload::ChapterCreated {
            id: id.clone(),
            volume_id: volume_id.to_string(),
            title: title.into(),
            order,
            created: now,
            modified: now,
        }])?;
        store
            .chapter(&id)?
            .ok_or_else(|| SyncError::ChapterNotFound(id))
    }

    /// Rename a chapter
    pub fn rename_chapter(
        &self,
        novel_id: &str,
        chapter_id: &str,
        title: impl Into<String>,
    ) -> SyncResult<()> {
        let store = self.open_novel(novel_id)?;
        store
            .chapter(chapter_id)?
            .ok_or_else(|| SyncError::ChapterNotFound(chapter_id.to_string()))?;
        store.commit(vec![EventPayload::ChapterTitleUpdated {
            id: chapter_id.to_string(),
            title: title.into(),
            modified: Self::now_ms(),
        }])?;
        Ok(())
    }

    /// Replace a chapter's body text
    pub fn update_chapter_body(
        &self,
        novel_id: &str,
        chapter_id: &str,
        body: impl Into<String>,
    ) -> SyncResult<()> {
        let store = self.open_novel(novel_id)?;
        store
            .chapter(chapter_id)?
            .ok_or_else(|| SyncError::ChapterNotFound(chapter_id.to_string()))?;
        store.commit(vec![EventPayload::ChapterBodyUpdated {
            id: chapter_id.to_string(),
            body: body.into(),
            modified: Self::now_ms(),
        }])?;
        Ok(())
    }

    /// Move a chapter within its volume, placing it right after
    /// `after_chapter` (or first when `None`).
    pub fn move_chapter(
        &self,
        novel_id: &str,
        chapter_id: &str,
        after_chapter: Option<&str>,
    ) -> SyncResult<()> {
        let store = self.open_novel(novel_id)?;
        let chapter = store
            .chapter(chapter_id)?
            .ok_or_else(|| SyncError::ChapterNotFound(chapter_id.to_string()))?;

        let siblings: Vec<_> = store
            .chapters_of(&chapter.volume_id)?
            .into_iter()
            .filter(|c| c.id != chapter_id)
            .collect();

        let anchor = match after_chapter {
            Some(id) => Some(
                siblings
                    .iter()
                    .position(|c| c.id == id)
                    .ok_or_else(|| SyncError::ChapterNotFound(id.to_string()))?,
            ),
            None => None,
        };
        let lo = anchor.map(|i| siblings[i].order.as_str());
        let hi = match anchor {
            Some(i) => siblings.get(i + 1).map(|c| c.order.as_str()),
            None => siblings.first().map(|c| c.order.as_str()),
        };
        let order = key_between(lo, hi);

        store.commit(vec![EventPayload::ChapterMoved {
            id: chapter_id.to_string(),
            order,
            modified: Self::now_ms(),
        }])?;
        Ok(())
    }

    /// Soft-delete a chapter
    pub fn trash_chapter(&self, novel_id: &str, chapter_id: &str) -> SyncResult<()> {
        let store = self.open_novel(novel_id)?;
        store
            .chapter(chapter_id)?
            .ok_or_else(|| SyncError::ChapterNotFound(chapter_id.to_string()))?;
        store.commit(vec![EventPayload::ChapterDeleted {
            id: chapter_id.to_string(),
            deleted: Self::now_ms(),
        }])?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sync lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    /// Attach the engine to a sync server.
    ///
    /// Builds the resilience controller (health-probing the server), runs
    /// the initial connection check, and starts replica tasks for the
    /// tenant store and every currently open novel store. The replicas
    /// only engage the transport while the controller reports
    /// `Connected`.
    pub async fn attach_sync(&self, config: SyncConfig) -> SyncResult<()> {
        let token = config
            .credentials
            .token()
            .unwrap_or_default();
        let controller = ConnectionController::new(
            config.network,
            config.credentials,
            Arc::new(TcpHealthProbe::new(config.server_addr)),
        );
        let replica_config = ReplicaConfig {
            server_addr: config.server_addr,
            token,
        };

        let mut replicas = HashMap::new();
        let user_store = self.inner.user_store.clone();
        replicas.insert(
            user_store.store_id().clone(),
            spawn_replica(
                user_store,
                replica_config.clone(),
                controller.watch(),
                self.inner.event_tx.clone(),
            ),
        );
        for store in self.inner.novel_stores.read().values() {
            replicas.insert(
                store.store_id().clone(),
                spawn_replica(
                    store.clone(),
                    replica_config.clone(),
                    controller.watch(),
                    self.inner.event_tx.clone(),
                ),
            );
        }

        *self.inner.sync.lock() = Some(SyncRuntime {
            controller: controller.clone(),
            replica_config,
            replicas,
        });

        controller.start().await;
        Ok(())
    }

    /// Current connection state (`LocalOnly` when sync was never attached)
    pub fn connection_state(&self) -> ConnectionState {
        self.inner
            .sync
            .lock()
            .as_ref()
            .map(|s| s.controller.state())
            .unwrap_or(ConnectionState::LocalOnly)
    }

    /// Trigger an immediate connection check (e.g. on a reachability
    /// change), cancelling any pending retry.
    pub async fn check_connection_now(&self) {
        let controller = self
            .inner
            .sync
            .lock()
            .as_ref()
            .map(|s| s.controller.clone());
        if let Some(controller) = controller {
            controller.check_now().await;
        }
    }

    /// Stop all background tasks. Local data stays on disk.
    pub fn shutdown(&self) {
        debug!("Shutting down Folio engine");
        if let Some(task) = self.purge_task.lock().take() {
            task.abort();
        }
        if let Some(runtime) = self.inner.sync.lock().take() {
            runtime.controller.shutdown();
            for (_, task) in runtime.replicas {
                task.abort();
            }
        }
    }
}

impl PurgeEnvironment for FolioInner {
    fn close_novel_store<'a>(&'a self, novel_id: &'a str) -> BoxFuture<'a, ()> {
        async move {
            let store = self.novel_stores.write().remove(novel_id);
            if let Some(store) = store {
                let store_id = store.store_id().clone();
                if let Some(runtime) = self.sync.lock().as_mut() {
                    if let Some(task) = runtime.replicas.remove(&store_id) {
                        task.abort();
                    }
                }
                debug!(%store_id, "Closed novel store");
            }
        }
        .boxed()
    }

    fn delete_local_store(&self, store_id: &StoreId) -> std::io::Result<bool> {
        store::delete_local_store(&self.stores_dir, store_id)
    }

    fn purge_rooms(&self, prefix: &str) -> SyncResult<usize> {
        self.rooms.teardown_sessions_by_prefix(prefix);
        self.rooms.delete_rooms_by_prefix(prefix)
    }

    fn purge_remote<'a>(&'a self, store_id: &'a StoreId) -> BoxFuture<'a, SyncResult<u32>> {
        async move {
            let config = self
                .sync
                .lock()
                .as_ref()
                .map(|s| s.replica_config.clone());
            match config {
                Some(config) => {
                    purge_remote_store(config.server_addr, &config.token, store_id).await
                }
                // Never attached to a server; nothing remote to purge.
                None => Ok(0),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::has_local_store;
    use crate::store_id::make_chapter_room_id;
    use tempfile::TempDir;

    fn test_engine() -> (Folio, TempDir) {
        let tmp = TempDir::new().unwrap();
        let folio = Folio::open(tmp.path(), new_id()).unwrap();
        (folio, tmp)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_novel_roundtrip() {
        let (folio, _tmp) = test_engine();

        let novel = folio.create_novel("The Long Winter").unwrap();
        assert_eq!(novel.title, "The Long Winter");

        folio.rename_novel(&novel.id, "The Longer Winter").unwrap();
        let novels = folio.user_store().novels().unwrap();
        assert_eq!(novels.len(), 1);
        assert_eq!(novels[0].title, "The Longer Winter");

        folio.trash_novel(&novel.id).unwrap();
        assert!(folio.user_store().novels().unwrap().is_empty());
        assert_eq!(folio.user_store().trashed_novels().unwrap().len(), 1);

        folio.restore_novel(&novel.id).unwrap();
        assert_eq!(folio.user_store().novels().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_novel_is_an_error() {
        let (folio, _tmp) = test_engine();
        assert!(matches!(
            folio.rename_novel("missing", "x"),
            Err(SyncError::NovelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chapter_ordering() {
        let (folio, _tmp) = test_engine();

        let novel = folio.create_novel("N").unwrap();
        let volume = folio.create_volume(&novel.id, "V").unwrap();
        let a = folio.create_chapter(&novel.id, &volume.id, "A").unwrap();
        let b = folio.create_chapter(&novel.id, &volume.id, "B").unwrap();
        let c = folio.create_chapter(&novel.id, &volume.id, "C").unwrap();

        let store = folio.open_novel(&novel.id).unwrap();
        let titles = |store: &Arc<LocalStore>| {
            store
                .chapters_of(&volume.id)
                .unwrap()
                .into_iter()
                .map(|ch| ch.title)
                .collect::<Vec<_>>()
        };
        assert_eq!(titles(&store), vec!["A", "B", "C"]);

        // Move C right after A.
        folio.move_chapter(&novel.id, &c.id, Some(&a.id)).unwrap();
        assert_eq!(titles(&store), vec!["A", "C", "B"]);

        // Move B to the front.
        folio.move_chapter(&novel.id, &b.id, None).unwrap();
        assert_eq!(titles(&store), vec!["B", "A", "C"]);
    }

    #[tokio::test]
    async fn test_chapter_body_and_trash() {
        let (folio, _tmp) = test_engine();

        let novel = folio.create_novel("N").unwrap();
        let volume = folio.create_volume(&novel.id, "V").unwrap();
        let chapter = folio.create_chapter(&novel.id, &volume.id, "One").unwrap();

        folio
            .update_chapter_body(&novel.id, &chapter.id, "First line.")
            .unwrap();
        let store = folio.open_novel(&novel.id).unwrap();
        assert_eq!(store.chapter(&chapter.id).unwrap().unwrap().body, "First line.");

        folio.trash_chapter(&novel.id, &chapter.id).unwrap();
        assert!(store.chapters_of(&volume.id).unwrap().is_empty());
        // The row itself survives soft delete.
        assert!(store.chapter(&chapter.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_novel_cascades_locally() {
        let (folio, tmp) = test_engine();
        let user_id = folio.user_id().to_string();

        let novel = folio.create_novel("Doomed").unwrap();
        let volume = folio.create_volume(&novel.id, "V").unwrap();
        let chapter = folio.create_chapter(&novel.id, &volume.id, "C").unwrap();

        let room_id = make_chapter_room_id(&user_id, &novel.id, &chapter.id);
        folio.rooms().append_update(&room_id, b"doc-update").unwrap();

        let store_id = make_novel_store_id(&user_id, &novel.id);
        let stores_dir = tmp.path().join("stores");
        assert!(has_local_store(&stores_dir, &store_id));

        folio.purge_novel(&novel.id).unwrap();

        // The coordinator runs in the background; wait for the cascade.
        let rooms = folio.rooms();
        let dir = stores_dir.clone();
        let sid = store_id.clone();
        wait_until(move || !has_local_store(&dir, &sid)).await;
        assert!(!rooms.has_room(&room_id).unwrap());

        // The novel row is gone from the materialized view too.
        assert!(folio.user_store().novel(&novel.id).unwrap().is_none());
        assert_eq!(
            folio.user_store().ui_state().unwrap().last_novel_purge_global_seq,
            folio.user_store().global_head().unwrap()
        );
    }

    #[tokio::test]
    async fn test_purge_watermark_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let user_id = new_id();

        let novel_id = {
            let folio = Folio::open(tmp.path(), user_id.clone()).unwrap();
            let novel = folio.create_novel("Doomed").unwrap();
            folio.purge_novel(&novel.id).unwrap();
            wait_until(|| {
                folio
                    .user_store()
                    .ui_state()
                    .unwrap()
                    .last_novel_purge_global_seq
                    > 0
            })
            .await;
            folio.shutdown();
            novel.id.clone()
        };

        // Reopening replays the log; the watermark keeps the purge from
        // re-deriving any work, and the novel store is not resurrected.
        let folio = Folio::open(tmp.path(), user_id.clone()).unwrap();
        let store_id = make_novel_store_id(&user_id, &novel_id);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!has_local_store(tmp.path().join("stores"), &store_id));
        assert!(folio.user_store().novel(&novel_id).unwrap().is_none());
    }
}
