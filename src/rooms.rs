//! Server-side collaborative rooms
//!
//! One room actor per chapter room id. The server never interprets the
//! collaborative document: it persists opaque update blobs, replays the
//! backlog to joiners, and relays new updates to the other members.
//! Rooms of a purged novel are torn down by id prefix, since room ids
//! embed their `(user, novel)` scope.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use folio_core::{SyncMessage, SyncResult, CLOSE_CODE_PURGE, CLOSE_REASON_PURGE};

// Update blobs keyed by (room id, update seq)
const ROOM_UPDATES_TABLE: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("room_updates");

/// Room membership and relay commands
pub enum RoomCommand {
    Join {
        conn_id: u64,
        tx: mpsc::UnboundedSender<SyncMessage>,
        reply: oneshot::Sender<Vec<Vec<u8>>>,
    },
    Leave {
        conn_id: u64,
    },
    Update {
        conn_id: u64,
        update: Vec<u8>,
    },
    /// Close every member with the purge close frame and stop the actor
    Close,
}

/// Registry of live room actors plus the shared persisted update store
pub struct RoomRegistry {
    db: Arc<RwLock<Database>>,
    rooms: Mutex<HashMap<String, mpsc::UnboundedSender<RoomCommand>>>,
}

impl RoomRegistry {
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
            rooms: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a room id to its actor, spawning it on first use
    pub fn room(&self, room_id: &str) -> mpsc::UnboundedSender<RoomCommand> {
        let mut rooms = self.rooms.lock();
        if let Some(tx) = rooms.get(room_id) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        debug!(room_id, "Spawning room actor");
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let actor = RoomActor {
            room_id: room_id.to_string(),
            db: self.db.clone(),
            members: HashMap::new(),
        };
        tokio::spawn(actor.run(cmd_rx));
        rooms.insert(room_id.to_string(), cmd_tx.clone());
        cmd_tx
    }

    /// Tear down every room under `prefix` and delete its persisted
    /// updates. Returns the number of live rooms closed.
    pub fn purge_prefix(&self, prefix: &str) -> SyncResult<usize> {
        let closed = {
            let mut rooms = self.rooms.lock();
            let doomed: Vec<String> = rooms
                .keys()
                .filter(|id| id.starts_with(prefix))
                .cloned()
                .collect();
            for room_id in &doomed {
                if let Some(tx) = rooms.remove(room_id) {
                    let _ = tx.send(RoomCommand::Close);
                }
            }
            doomed.len()
        };

        let db = self.db.read();
        let write_txn = db.begin_write()?;
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
            }
        }
        write_txn.commit()?;
        Ok(closed)
    }
}

struct RoomActor {
    room_id: String,
    db: Arc<RwLock<Database>>,
    members: HashMap<u64, mpsc::UnboundedSender<SyncMessage>>,
}

impl RoomActor {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<RoomCommand>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                RoomCommand::Join { conn_id, tx, reply } => {
                    let backlog = self.backlog().unwrap_or_else(|e| {
                        warn!(room_id = %self.room_id, error = %e, "Backlog read failed");
                        Vec::new()
                    });
                    self.members.insert(conn_id, tx);
                    let _ = reply.send(backlog);
                }
                RoomCommand::Leave { conn_id } => {
                    self.members.remove(&conn_id);
                }
                RoomCommand::Update { conn_id, update } => {
                    if let Err(e) = self.persist(&update) {
                        warn!(room_id = %self.room_id, error = %e, "Update persist failed");
                        continue;
                    }
                    self.members.retain(|id, tx| {
                        if *id == conn_id {
                            return true;
                        }
                        tx.send(SyncMessage::RoomUpdate {
                            update: update.clone(),
                        })
                        .is_ok()
                    });
                }
                RoomCommand::Close => {
                    for (_, tx) in self.members.drain() {
                        let _ = tx.send(SyncMessage::Closing {
                            code: CLOSE_CODE_PURGE,
                            reason: CLOSE_REASON_PURGE.to_string(),
                        });
                    }
                    break;
                }
            }
        }
        debug!(room_id = %self.room_id, "Room actor stopped");
    }

    fn backlog(&self) -> SyncResult<Vec<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(ROOM_UPDATES_TABLE)?;

        let mut updates = Vec::new();
        for entry in table.range((self.room_id.as_str(), 0)..=(self.room_id.as_str(), u64::MAX))? {
            let (_, v) = entry?;
            updates.push(v.value().to_vec());
        }
        Ok(updates)
    }

    fn persist(&self, update: &[u8]) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(ROOM_UPDATES_TABLE)?;
            let seq = table
                .range((self.room_id.as_str(), 0)..=(self.room_id.as_str(), u64::MAX))?
                .next_back()
                .transpose()?
                .map(|(k, _)| k.value().1 + 1)
                .unwrap_or(1);
            table.insert((self.room_id.as_str(), seq), update)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{make_chapter_room_id, make_chapter_room_prefix, new_id};
    use tempfile::TempDir;

    async fn join(
        registry: &RoomRegistry,
        room_id: &str,
        conn_id: u64,
    ) -> (mpsc::UnboundedReceiver<SyncMessage>, Vec<Vec<u8>>) {
        let room = registry.room(room_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let (reply, backlog) = oneshot::channel();
        room.send(RoomCommand::Join { conn_id, tx, reply }).unwrap();
        (rx, backlog.await.unwrap())
    }

    #[tokio::test]
    async fn test_update_relay_and_backlog() {
        let tmp = TempDir::new().unwrap();
        let registry = RoomRegistry::open(tmp.path().join("rooms.redb")).unwrap();
        let room_id = make_chapter_room_id(&new_id(), &new_id(), &new_id());

        let (mut rx1, backlog) = join(&registry, &room_id, 1).await;
        assert!(backlog.is_empty());

        let room = registry.room(&room_id);
        room.send(RoomCommand::Update {
            conn_id: 2,
            update: b"delta".to_vec(),
        })
        .unwrap();

        match rx1.recv().await.unwrap() {
            SyncMessage::RoomUpdate { update } => assert_eq!(update, b"delta".to_vec()),
            other => panic!("Wrong message: {other:?}"),
        }

        // A later joiner replays the persisted update.
        let (_rx2, backlog) = join(&registry, &room_id, 3).await;
        assert_eq!(backlog, vec![b"delta".to_vec()]);
    }

    #[tokio::test]
    async fn test_purge_prefix_closes_and_deletes() {
        let tmp = TempDir::new().unwrap();
        let registry = RoomRegistry::open(tmp.path().join("rooms.redb")).unwrap();
        let user_id = new_id();
        let novel_id = new_id();
        let room_id = make_chapter_room_id(&user_id, &novel_id, &new_id());

        let (mut rx, _) = join(&registry, &room_id, 1).await;
        registry
            .room(&room_id)
            .send(RoomCommand::Update {
                conn_id: 2,
                update: b"delta".to_vec(),
            })
            .unwrap();
        // Drain the relayed update first.
        assert!(matches!(
            rx.recv().await.unwrap(),
            SyncMessage::RoomUpdate { .. }
        ));

        let prefix = make_chapter_room_prefix(&user_id, &novel_id);
        assert_eq!(registry.purge_prefix(&prefix).unwrap(), 1);
        match rx.recv().await.unwrap() {
            SyncMessage::Closing { code, .. } => assert_eq!(code, CLOSE_CODE_PURGE),
            other => panic!("Wrong message: {other:?}"),
        }

        // Persisted updates are gone; a rejoin starts from empty.
        let (_rx, backlog) = join(&registry, &room_id, 4).await;
        assert!(backlog.is_empty());

        // Second purge finds nothing live with that prefix besides the
        // fresh room; deleting again still succeeds.
        assert_eq!(registry.purge_prefix(&prefix).unwrap(), 1);
    }
}
