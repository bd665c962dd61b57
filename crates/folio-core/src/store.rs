//! Local event-sourced store
//!
//! One [`LocalStore`] owns one redb database per [`StoreId`], holding:
//! - the append-only event log (postcard records keyed by local sequence)
//! - the materialized tables derived from it (see [`crate::tables`])
//! - the set of not-yet-acknowledged local events awaiting push
//! - the session-local [`UiState`] client document
//!
//! `commit` appends events and applies their reducers in a single write
//! transaction, so a query issued right after a commit always observes it
//! (read-after-write within one store handle). Queries are synchronous and
//! never touch the network.
//!
//! Committed events are re-broadcast on an in-process channel so that
//! subscribers (the sync replica, the purge coordinator) can follow the
//! log live; [`LocalStore::subscribe_events`] combines a replay of the
//! persisted log from a given global sequence with that live tail, which
//! is what makes subscriptions restartable across process restarts.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::{broadcast, watch};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::event::{Event, EventPayload, SeqNum};
use crate::store_id::{store_file_name, StoreId};
use crate::tables::{
    self, ChapterRow, NovelRow, VolumeRow, CHAPTERS_TABLE, NOVELS_TABLE, VOLUMES_TABLE,
};

// Event log, keyed by local sequence number
const EVENTS_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
// Local seqs committed here but not yet acknowledged by the sync actor
const PENDING_TABLE: TableDefinition<u64, ()> = TableDefinition::new("pending");
// Sequence counters
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");
// Session-local client documents (never synced)
const UI_STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("ui_state");

const LOCAL_HEAD: &str = "local_head";
const GLOBAL_HEAD: &str = "global_head";
const UI_STATE_KEY: &str = "ui_state";

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session-local client document for the tenant store.
///
/// `last_novel_purge_global_seq` is the purge coordinator's watermark: it
/// only ever advances, which is what makes purge observation idempotent
/// across restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UiState {
    pub last_accessed_novel_id: String,
    pub last_novel_purge_global_seq: u64,
}

/// One event-sourced local store: log plus materialized tables
pub struct LocalStore {
    store_id: StoreId,
    path: PathBuf,
    db: Arc<RwLock<Database>>,
    events_tx: broadcast::Sender<Event>,
    commit_tx: watch::Sender<u64>,
}

impl LocalStore {
    /// Open (or create) the store for `store_id` under `dir`.
    ///
    /// The database file name is derived deterministically from the store
    /// id (see [`store_file_name`]).
    pub fn open(dir: impl AsRef<Path>, store_id: StoreId) -> SyncResult<Self> {
        let path = dir.as_ref().join(store_file_name(&store_id));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(&path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(EVENTS_TABLE)?;
            let _ = write_txn.open_table(PENDING_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(UI_STATE_TABLE)?;
            let _ = write_txn.open_table(NOVELS_TABLE)?;
            let _ = write_txn.open_table(VOLUMES_TABLE)?;
            let _ = write_txn.open_table(CHAPTERS_TABLE)?;
        }
        write_txn.commit()?;

        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (commit_tx, _) = watch::channel(0);

        let store = Self {
            store_id,
            path,
            db: Arc::new(RwLock::new(db)),
            events_tx,
            commit_tx,
        };
        let _ = store.commit_tx.send_replace(store.local_head()?);
        Ok(store)
    }

    /// Id of this store
    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    /// Path of the backing database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Commit & log
    // ═══════════════════════════════════════════════════════════════════════

    /// Commit a batch of events.
    ///
    /// Assigns the local sequence and a provisional global sequence
    /// (head + 1; the sync actor's assignment is authoritative and acks
    /// rebase any divergence), appends all events transactionally, and
    /// applies their reducers to the materialized tables before returning.
    pub fn commit(&self, payloads: Vec<EventPayload>) -> SyncResult<Vec<Event>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let mut committed = Vec::with_capacity(payloads.len());
        let mut local_head;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            local_head = meta.get(LOCAL_HEAD)?.map(|v| v.value()).unwrap_or(0);
            let mut global_head = meta.get(GLOBAL_HEAD)?.map(|v| v.value()).unwrap_or(0);

            let mut events = write_txn.open_table(EVENTS_TABLE)?;
            let mut pending = write_txn.open_table(PENDING_TABLE)?;
            for payload in payloads {
                local_head += 1;
                global_head += 1;
                let event = Event {
                    seq: SeqNum {
                        local: local_head,
                        global: global_head,
                    },
                    payload,
                };
                events.insert(local_head, event.encode()?.as_slice())?;
                pending.insert(local_head, ())?;
                committed.push(event);
            }
            meta.insert(LOCAL_HEAD, local_head)?;
            meta.insert(GLOBAL_HEAD, global_head)?;
        }
        for event in &committed {
            tables::apply_event(&write_txn, &event.payload)?;
        }
        write_txn.commit()?;
        drop(db);

        debug!(store_id = %self.store_id, count = committed.len(), "Committed events");
        for event in &committed {
            let _ = self.events_tx.send(event.clone());
        }
        let _ = self.commit_tx.send_replace(local_head);
        Ok(committed)
    }

    /// Apply events received from the authoritative actor.
    ///
    /// Events whose global sequence is already covered are skipped, so
    /// replaying a pull stream is idempotent. Returns the number of events
    /// actually applied.
    pub fn apply_remote(&self, events: &[Event]) -> SyncResult<usize> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let mut applied = Vec::new();
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let mut local_head = meta.get(LOCAL_HEAD)?.map(|v| v.value()).unwrap_or(0);
            let mut global_head = meta.get(GLOBAL_HEAD)?.map(|v| v.value()).unwrap_or(0);

            let mut log = write_txn.open_table(EVENTS_TABLE)?;
            for event in events {
                if event.seq.global <= global_head {
                    continue;
                }
                local_head += 1;
                global_head = event.seq.global;
                let event = Event {
                    seq: SeqNum {
                        local: local_head,
                        global: event.seq.global,
                    },
                    payload: event.payload.clone(),
                };
                log.insert(local_head, event.encode()?.as_slice())?;
                applied.push(event);
            }
            meta.insert(LOCAL_HEAD, local_head)?;
            meta.insert(GLOBAL_HEAD, global_head)?;
        }
        for event in &applied {
            tables::apply_event(&write_txn, &event.payload)?;
        }
        write_txn.commit()?;
        drop(db);

        for event in &applied {
            let _ = self.events_tx.send(event.clone());
        }
        Ok(applied.len())
    }

    /// Rebase pushed events onto their authoritative global sequences.
    ///
    /// `locals` are the local seqs of the pushed batch, in push order;
    /// the actor assigned them `first_global..`.
    pub fn apply_ack(&self, locals: &[u64], first_global: u64) -> SyncResult<()> {
        if locals.is_empty() {
            return Ok(());
        }

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut log = write_txn.open_table(EVENTS_TABLE)?;
            let mut pending = write_txn.open_table(PENDING_TABLE)?;
            for (i, local) in locals.iter().enumerate() {
                let record = match log.get(local)? {
                    Some(v) => Event::decode(v.value())?,
                    None => continue,
                };
                let event = Event {
                    seq: SeqNum {
                        local: *local,
                        global: first_global + i as u64,
                    },
                    payload: record.payload,
                };
                log.insert(*local, event.encode()?.as_slice())?;
                pending.remove(local)?;
            }

            let last_global = first_global + locals.len() as u64 - 1;
            let mut meta = write_txn.open_table(META_TABLE)?;
            let global_head = meta.get(GLOBAL_HEAD)?.map(|v| v.value()).unwrap_or(0);
            if last_global > global_head {
                meta.insert(GLOBAL_HEAD, last_global)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Locally committed events not yet acknowledged by the actor
    pub fn pending_events(&self) -> SyncResult<Vec<Event>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let pending = read_txn.open_table(PENDING_TABLE)?;
        let log = read_txn.open_table(EVENTS_TABLE)?;

        let mut events = Vec::new();
        for entry in pending.iter()? {
            let (local, _) = entry?;
            if let Some(v) = log.get(local.value())? {
                events.push(Event::decode(v.value())?);
            }
        }
        Ok(events)
    }

    /// Committed events with `global > from_global`, optionally filtered
    /// by event-kind name, in log order.
    pub fn events_from(&self, from_global: u64, filter: &[String]) -> SyncResult<Vec<Event>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let log = read_txn.open_table(EVENTS_TABLE)?;

        let mut events = Vec::new();
        for entry in log.iter()? {
            let (_, v) = entry?;
            let event = Event::decode(v.value())?;
            if event.seq.global <= from_global {
                continue;
            }
            if !filter.is_empty() && !filter.iter().any(|f| f == event.payload.name()) {
                continue;
            }
            events.push(event);
        }
        Ok(events)
    }

    /// Number of events in the local log
    pub fn log_len(&self) -> SyncResult<u64> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let log = read_txn.open_table(EVENTS_TABLE)?;
        Ok(log.iter()?.count() as u64)
    }

    /// Highest local sequence number
    pub fn local_head(&self) -> SyncResult<u64> {
        self.meta(LOCAL_HEAD)
    }

    /// Highest known global sequence number (provisional heads included)
    pub fn global_head(&self) -> SyncResult<u64> {
        self.meta(GLOBAL_HEAD)
    }

    fn meta(&self, key: &str) -> SyncResult<u64> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let meta = read_txn.open_table(META_TABLE)?;
        Ok(meta.get(key)?.map(|v| v.value()).unwrap_or(0))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Queries (materialized view)
    // ═══════════════════════════════════════════════════════════════════════

    /// Visible novels, newest first
    pub fn novels(&self) -> SyncResult<Vec<NovelRow>> {
        let mut rows = self.all_novels()?;
        rows.retain(|r| r.deleted.is_none());
        rows.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(rows)
    }

    /// Soft-deleted novels, most recently trashed first
    pub fn trashed_novels(&self) -> SyncResult<Vec<NovelRow>> {
        let mut rows = self.all_novels()?;
        rows.retain(|r| r.deleted.is_some());
        rows.sort_by(|a, b| b.deleted.cmp(&a.deleted));
        Ok(rows)
    }

    /// Single novel by id, soft-deleted included
    pub fn novel(&self, id: &str) -> SyncResult<Option<NovelRow>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NOVELS_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(tables::decode_novel(v.value())?)),
            None => Ok(None),
        }
    }

    fn all_novels(&self) -> SyncResult<Vec<NovelRow>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(NOVELS_TABLE)?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            rows.push(tables::decode_novel(v.value())?);
        }
        Ok(rows)
    }

    /// Visible volumes, oldest first
    pub fn volumes(&self) -> SyncResult<Vec<VolumeRow>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(VOLUMES_TABLE)?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            let row = tables::decode_volume(v.value())?;
            if row.deleted.is_none() {
                rows.push(row);
            }
        }
        rows.sort_by_key(|r| r.created);
        Ok(rows)
    }

    /// Single volume by id
    pub fn volume(&self, id: &str) -> SyncResult<Option<VolumeRow>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(VOLUMES_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(tables::decode_volume(v.value())?)),
            None => Ok(None),
        }
    }

    /// Visible chapters of a volume in fractional-index order
    pub fn chapters_of(&self, volume_id: &str) -> SyncResult<Vec<ChapterRow>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CHAPTERS_TABLE)?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            let row = tables::decode_chapter(v.value())?;
            if row.volume_id == volume_id && row.deleted.is_none() {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| a.order.cmp(&b.order));
        Ok(rows)
    }

    /// Single chapter by id
    pub fn chapter(&self, id: &str) -> SyncResult<Option<ChapterRow>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(CHAPTERS_TABLE)?;
        match table.get(id)? {
            Some(v) => Ok(Some(tables::decode_chapter(v.value())?)),
            None => Ok(None),
        }
    }

    /// Drop the materialized tables and replay the full log from empty.
    ///
    /// Replay is deterministic: running it twice produces identical
    /// tables, which is what crash recovery relies on.
    pub fn rebuild(&self) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.delete_table(NOVELS_TABLE)?;
            let _ = write_txn.delete_table(VOLUMES_TABLE)?;
            let _ = write_txn.delete_table(CHAPTERS_TABLE)?;
            let _ = write_txn.open_table(NOVELS_TABLE)?;
            let _ = write_txn.open_table(VOLUMES_TABLE)?;
            let _ = write_txn.open_table(CHAPTERS_TABLE)?;
        }
        let mut replayed = Vec::new();
        {
            let log = write_txn.open_table(EVENTS_TABLE)?;
            for entry in log.iter()? {
                let (_, v) = entry?;
                replayed.push(Event::decode(v.value())?);
            }
        }
        for event in &replayed {
            tables::apply_event(&write_txn, &event.payload)?;
        }
        write_txn.commit()?;
        debug!(store_id = %self.store_id, events = replayed.len(), "Rebuilt materialized tables");
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // UiState client document
    // ═══════════════════════════════════════════════════════════════════════

    /// Load the session-local UiState, created with zeros on first access
    pub fn ui_state(&self) -> SyncResult<UiState> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(UI_STATE_TABLE)?;
        match table.get(UI_STATE_KEY)? {
            Some(v) => serde_json::from_slice(v.value())
                .map_err(|e| SyncError::Serialization(e.to_string())),
            None => Ok(UiState::default()),
        }
    }

    fn save_ui_state(&self, state: &UiState) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(UI_STATE_TABLE)?;
            let data =
                serde_json::to_vec(state).map_err(|e| SyncError::Serialization(e.to_string()))?;
            table.insert(UI_STATE_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remember the last novel the user worked in
    pub fn set_last_accessed_novel(&self, novel_id: &str) -> SyncResult<()> {
        let mut state = self.ui_state()?;
        state.last_accessed_novel_id = novel_id.to_string();
        self.save_ui_state(&state)
    }

    /// Advance the purge watermark. The watermark never decreases;
    /// returns `false` (and writes nothing) if `seq` is not ahead of it.
    pub fn advance_purge_watermark(&self, seq: u64) -> SyncResult<bool> {
        let mut state = self.ui_state()?;
        if seq <= state.last_novel_purge_global_seq {
            return Ok(false);
        }
        state.last_novel_purge_global_seq = seq;
        self.save_ui_state(&state)?;
        Ok(true)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Subscriptions
    // ═══════════════════════════════════════════════════════════════════════

    /// Subscribe to committed events matching a kind filter (empty filter
    /// matches all), resuming after `from_global`.
    ///
    /// The subscription first replays persisted events, then follows live
    /// commits. Dropping the handle cancels it.
    pub fn subscribe_events(&self, filter: Vec<String>, from_global: u64) -> EventSubscription {
        EventSubscription {
            db: self.db.clone(),
            filter,
            last_global: from_global,
            backlog: VecDeque::new(),
            live: self.events_tx.subscribe(),
            primed: false,
        }
    }

    /// Watch the local head advance on local commits (not remote applies)
    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }
}

/// Cancellable handle over a lazy, unbounded sequence of committed events.
///
/// Restartable by construction: create it with the last handled global
/// sequence and it replays everything after that before going live.
pub struct EventSubscription {
    db: Arc<RwLock<Database>>,
    filter: Vec<String>,
    last_global: u64,
    backlog: VecDeque<Event>,
    live: broadcast::Receiver<Event>,
    primed: bool,
}

impl EventSubscription {
    /// Next matching event, awaiting a live commit once the backlog is
    /// drained. Returns `None` when the store has been dropped.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            if !self.primed {
                self.primed = true;
                if let Err(e) = self.refill() {
                    debug!(error = %e, "Event subscription replay failed");
                }
            }
            if let Some(event) = self.backlog.pop_front() {
                self.last_global = event.seq.global;
                return Some(event);
            }
            match self.live.recv().await {
                Ok(event) => {
                    if event.seq.global > self.last_global && self.matches(&event) {
                        self.last_global = event.seq.global;
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Fell behind the channel; catch up from the log.
                    self.primed = false;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &Event) -> bool {
        self.filter.is_empty() || self.filter.iter().any(|f| f == event.payload.name())
    }

    fn refill(&mut self) -> SyncResult<()> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let log = read_txn.open_table(EVENTS_TABLE)?;
        for entry in log.iter()? {
            let (_, v) = entry?;
            let event = Event::decode(v.value())?;
            if event.seq.global > self.last_global && self.matches(&event) {
                self.backlog.push_back(event);
            }
        }
        Ok(())
    }
}

/// Does persisted local data exist for this store id?
pub fn has_local_store(dir: impl AsRef<Path>, store_id: &StoreId) -> bool {
    dir.as_ref().join(store_file_name(store_id)).exists()
}

/// Delete the persisted local data for a store id.
///
/// Returns `true` if a database file existed and was removed.
pub fn delete_local_store(dir: impl AsRef<Path>, store_id: &StoreId) -> std::io::Result<bool> {
    let path = dir.as_ref().join(store_file_name(store_id));
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_id::{make_user_store_id, new_id};
    use tempfile::TempDir;

    fn test_store() -> (LocalStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path(), make_user_store_id(&new_id())).unwrap();
        (store, tmp)
    }

    fn novel_created(id: &str, title: &str) -> EventPayload {
        EventPayload::NovelCreated {
            id: id.to_string(),
            title: title.to_string(),
            created: 1_700_000_000_000,
            modified: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_commit_is_read_after_write() {
        let (store, _tmp) = test_store();

        let events = store.commit(vec![novel_created("n1", "Draft")]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, SeqNum { local: 1, global: 1 });

        let novels = store.novels().unwrap();
        assert_eq!(novels.len(), 1);
        assert_eq!(novels[0].title, "Draft");
    }

    #[test]
    fn test_commit_assigns_increasing_seqs() {
        let (store, _tmp) = test_store();

        store.commit(vec![novel_created("n1", "One")]).unwrap();
        let events = store
            .commit(vec![novel_created("n2", "Two"), novel_created("n3", "Three")])
            .unwrap();
        assert_eq!(events[0].seq, SeqNum { local: 2, global: 2 });
        assert_eq!(events[1].seq, SeqNum { local: 3, global: 3 });
        assert_eq!(store.log_len().unwrap(), 3);
    }

    #[test]
    fn test_pending_until_acked() {
        let (store, _tmp) = test_store();

        store.commit(vec![novel_created("n1", "One")]).unwrap();
        store.commit(vec![novel_created("n2", "Two")]).unwrap();
        assert_eq!(store.pending_events().unwrap().len(), 2);

        // Actor acked the batch starting at global 5.
        store.apply_ack(&[1, 2], 5).unwrap();
        assert!(store.pending_events().unwrap().is_empty());
        assert_eq!(store.global_head().unwrap(), 6);

        let events = store.events_from(0, &[]).unwrap();
        assert_eq!(events[0].seq.global, 5);
        assert_eq!(events[1].seq.global, 6);
    }

    #[test]
    fn test_apply_remote_skips_covered_globals() {
        let (store, _tmp) = test_store();

        let remote = vec![
            Event {
                seq: SeqNum { local: 1, global: 1 },
                payload: novel_created("n1", "One"),
            },
            Event {
                seq: SeqNum { local: 2, global: 2 },
                payload: novel_created("n2", "Two"),
            },
        ];
        assert_eq!(store.apply_remote(&remote).unwrap(), 2);
        // Replaying the same stream applies nothing.
        assert_eq!(store.apply_remote(&remote).unwrap(), 0);
        assert_eq!(store.log_len().unwrap(), 2);
        // Remote events are never pending.
        assert!(store.pending_events().unwrap().is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let store_id = make_user_store_id(&new_id());

        {
            let store = LocalStore::open(tmp.path(), store_id.clone()).unwrap();
            store.commit(vec![novel_created("n1", "Kept")]).unwrap();
        }

        let store = LocalStore::open(tmp.path(), store_id).unwrap();
        assert_eq!(store.novels().unwrap()[0].title, "Kept");
        assert_eq!(store.local_head().unwrap(), 1);
    }

    #[test]
    fn test_rebuild_reproduces_tables() {
        let (store, _tmp) = test_store();

        store.commit(vec![novel_created("n1", "One")]).unwrap();
        store
            .commit(vec![EventPayload::NovelDeleted {
                id: "n1".into(),
                deleted: 7,
            }])
            .unwrap();
        store.commit(vec![novel_created("n2", "Two")]).unwrap();

        let before = (store.novels().unwrap(), store.trashed_novels().unwrap());
        store.rebuild().unwrap();
        let after = (store.novels().unwrap(), store.trashed_novels().unwrap());
        assert_eq!(before, after);

        // Replaying twice is still identical.
        store.rebuild().unwrap();
        assert_eq!(after, (store.novels().unwrap(), store.trashed_novels().unwrap()));
    }

    #[test]
    fn test_watermark_is_monotonic() {
        let (store, _tmp) = test_store();

        assert_eq!(store.ui_state().unwrap().last_novel_purge_global_seq, 0);
        assert!(store.advance_purge_watermark(5).unwrap());
        assert!(!store.advance_purge_watermark(5).unwrap());
        assert!(!store.advance_purge_watermark(3).unwrap());
        assert_eq!(store.ui_state().unwrap().last_novel_purge_global_seq, 5);
        assert!(store.advance_purge_watermark(9).unwrap());
    }

    #[tokio::test]
    async fn test_subscription_replays_then_follows() {
        let (store, _tmp) = test_store();

        store.commit(vec![novel_created("n1", "One")]).unwrap();
        store
            .commit(vec![EventPayload::NovelPurged {
                id: "n1".into(),
                purged: 1,
            }])
            .unwrap();

        let mut sub = store.subscribe_events(vec!["v1.NovelPurged".to_string()], 0);
        let first = sub.next().await.unwrap();
        assert_eq!(first.payload.name(), "v1.NovelPurged");
        assert_eq!(first.seq.global, 2);

        // A live commit of a non-matching kind is filtered out; the next
        // matching one is delivered.
        store.commit(vec![novel_created("n2", "Two")]).unwrap();
        store
            .commit(vec![EventPayload::NovelPurged {
                id: "n2".into(),
                purged: 2,
            }])
            .unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(second.payload.entity_id(), "n2");
    }

    #[tokio::test]
    async fn test_subscription_resumes_from_global() {
        let (store, _tmp) = test_store();

        for i in 0..5 {
            store
                .commit(vec![EventPayload::NovelPurged {
                    id: format!("n{i}"),
                    purged: i,
                }])
                .unwrap();
        }

        // Resuming from global 3 sees only 4 and 5.
        let mut sub = store.subscribe_events(vec!["v1.NovelPurged".to_string()], 3);
        assert_eq!(sub.next().await.unwrap().seq.global, 4);
        assert_eq!(sub.next().await.unwrap().seq.global, 5);
    }

    #[test]
    fn test_local_store_file_ops() {
        let tmp = TempDir::new().unwrap();
        let store_id = make_user_store_id(&new_id());
        assert!(!has_local_store(tmp.path(), &store_id));

        let store = LocalStore::open(tmp.path(), store_id.clone()).unwrap();
        assert!(has_local_store(tmp.path(), &store_id));
        drop(store);

        assert!(delete_local_store(tmp.path(), &store_id).unwrap());
        assert!(!has_local_store(tmp.path(), &store_id));
        assert!(!delete_local_store(tmp.path(), &store_id).unwrap());
    }
}
