//! Local persistence for collaborative chapter rooms
//!
//! The collaborative editor is a black box: a room's document is an
//! append-only list of opaque CRDT update blobs keyed by room id. Room
//! ids embed the owning `(user, novel, chapter)` triple, so all rooms of
//! one novel share a textual prefix and a novel purge can enumerate and
//! delete them with plain prefix scans.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::SyncResult;

// Update blobs keyed by (room id, update seq)
const ROOM_UPDATES_TABLE: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("room_updates");

/// Store of persisted room documents plus the live-session registry
pub struct RoomStore {
    db: Arc<RwLock<Database>>,
    sessions: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RoomStore {
    /// Open (or create) the room database at `path`
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ROOM_UPDATES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Append one opaque update blob to a room's document.
    ///
    /// Returns the update's sequence within the room.
    pub fn append_update(&self, room_id: &str, update: &[u8]) -> SyncResult<u64> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let seq;
        {
            let mut table = write_txn.open_table(ROOM_UPDATES_TABLE)?;
            seq = table
                .range((room_id, 0)..=(room_id, u64::MAX))?
                .last()
                .transpose()?
                .map(|(k, _)| k.value().1 + 1)
                .unwrap_or(1);
            table.insert((room_id, seq), update)?;
        }
        write_txn.commit()?;
        Ok(seq)
    }

    /// All persisted updates of a room, in append order
    pub fn updates(&self, room_id: &str) -> SyncResult<Vec<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ROOM_UPDATES_TABLE)?;

        let mut updates = Vec::new();
        for entry in table.range((room_id, 0)..=(room_id, u64::MAX))? {
            let (_, v) = entry?;
            updates.push(v.value().to_vec());
        }
        Ok(updates)
    }

    /// Does any persisted data exist for this room?
    pub fn has_room(&self, room_id: &str) -> SyncResult<bool> {
        Ok(!self.updates(room_id)?.is_empty())
    }

    /// Delete every persisted room document whose id starts with `prefix`.
    ///
    /// Returns the number of distinct rooms removed.
    pub fn delete_rooms_by_prefix(&self, prefix: &str) -> SyncResult<usize> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let mut rooms = std::collections::HashSet::new();
        {
            let mut table = write_txn.open_table(ROOM_UPDATES_TABLE)?;
            let mut doomed = Vec::new();
            for entry in table.range((prefix, 0)..)? {
                let (k, _) = entry?;
                let (room_id, seq) = k.value();
                if !room_id.starts_with(prefix) {
                    break;
                }
                doomed.push((room_id.to_string(), seq));
            }
            for (room_id, seq) in doomed {
                table.remove((room_id.as_str(), seq))?;
                rooms.insert(room_id);
            }
        }
        write_txn.commit()?;
        if !rooms.is_empty() {
            debug!(prefix, count = rooms.len(), "Deleted room documents");
        }
        Ok(rooms.len())
    }

    /// Register a live session task for a room, replacing (and aborting)
    /// any previous one.
    pub fn register_session(&self, room_id: &str, task: JoinHandle<()>) {
        let mut sessions = self.sessions.lock();
        if let Some(old) = sessions.insert(room_id.to_string(), task) {
            old.abort();
        }
    }

    /// Tear down one live session; `true` if one was running
    pub fn teardown_session(&self, room_id: &str) -> bool {
        match self.sessions.lock().remove(room_id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Tear down every live session whose room id starts with `prefix`
    pub fn teardown_sessions_by_prefix(&self, prefix: &str) -> usize {
        let mut sessions = self.sessions.lock();
        let doomed: Vec<String> = sessions
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect();
        for room_id in &doomed {
            if let Some(task) = sessions.remove(room_id) {
                task.abort();
            }
        }
        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_id::{make_chapter_room_id, make_chapter_room_prefix, new_id};
    use tempfile::TempDir;

    fn test_rooms() -> (RoomStore, TempDir) {
        let tmp = TempDir::new().unwrap();
        let rooms = RoomStore::open(tmp.path().join("rooms.redb")).unwrap();
        (rooms, tmp)
    }

    #[test]
    fn test_append_and_replay_updates() {
        let (rooms, _tmp) = test_rooms();
        let room_id = make_chapter_room_id(&new_id(), &new_id(), &new_id());

        assert!(!rooms.has_room(&room_id).unwrap());
        assert_eq!(rooms.append_update(&room_id, b"u1").unwrap(), 1);
        assert_eq!(rooms.append_update(&room_id, b"u2").unwrap(), 2);

        let updates = rooms.updates(&room_id).unwrap();
        assert_eq!(updates, vec![b"u1".to_vec(), b"u2".to_vec()]);
    }

    #[test]
    fn test_delete_rooms_by_prefix() {
        let (rooms, _tmp) = test_rooms();
        let user_id = new_id();
        let novel_a = new_id();
        let novel_b = new_id();

        let room_a1 = make_chapter_room_id(&user_id, &novel_a, &new_id());
        let room_a2 = make_chapter_room_id(&user_id, &novel_a, &new_id());
        let room_b = make_chapter_room_id(&user_id, &novel_b, &new_id());
        rooms.append_update(&room_a1, b"x").unwrap();
        rooms.append_update(&room_a1, b"y").unwrap();
        rooms.append_update(&room_a2, b"z").unwrap();
        rooms.append_update(&room_b, b"w").unwrap();

        let prefix = make_chapter_room_prefix(&user_id, &novel_a);
        assert_eq!(rooms.delete_rooms_by_prefix(&prefix).unwrap(), 2);

        assert!(!rooms.has_room(&room_a1).unwrap());
        assert!(!rooms.has_room(&room_a2).unwrap());
        // The other novel's room is untouched.
        assert!(rooms.has_room(&room_b).unwrap());

        // Purging again finds nothing; still succeeds.
        assert_eq!(rooms.delete_rooms_by_prefix(&prefix).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_session_registry_teardown() {
        let (rooms, _tmp) = test_rooms();
        let user_id = new_id();
        let novel_id = new_id();
        let room_1 = make_chapter_room_id(&user_id, &novel_id, &new_id());
        let room_2 = make_chapter_room_id(&user_id, &novel_id, &new_id());

        rooms.register_session(&room_1, tokio::spawn(std::future::pending()));
        rooms.register_session(&room_2, tokio::spawn(std::future::pending()));

        let prefix = make_chapter_room_prefix(&user_id, &novel_id);
        assert_eq!(rooms.teardown_sessions_by_prefix(&prefix), 2);
        assert_eq!(rooms.teardown_sessions_by_prefix(&prefix), 0);
        assert!(!rooms.teardown_session(&room_1));
    }
}
