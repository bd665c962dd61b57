//! Per-tenant sync actor
//!
//! One actor task exists per [`StoreId`], reached by routing on that id
//! (see [`crate::arena`]). The actor owns the store's authoritative log,
//! its attached duplex connections, and the authorization gate. It
//! processes commands one at a time, which serializes global sequence
//! assignment per store — the core correctness property that keeps
//! divergent replicas from ever producing conflicting sequence numbers.
//! It must not be weakened for throughput.
//!
//! `purge()` is idempotent and never partially completes: attached
//! connections are closed (with a defined close code/reason) before any
//! storage is wiped, the in-memory head cache is reset by plain
//! assignment, and the call reports how many connections it closed.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use folio_core::{
    store_file_name, user_id_of, DeniedKind, Event, SeqNum, StoreId, SyncError, SyncMessage,
    SyncResult, CLOSE_CODE_PURGE, CLOSE_REASON_PURGE,
};

use crate::auth::AuthOracle;

// Authoritative log, keyed by global sequence number
const LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("log");

/// Command channel depth per actor
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Result of attaching a replica connection
#[derive(Debug)]
pub struct AttachOk {
    pub global_head: u64,
    pub backlog: Vec<Event>,
}

/// Result of an accepted push
#[derive(Debug)]
pub struct PushOk {
    pub locals: Vec<u64>,
    pub first_global: u64,
}

/// Commands processed by the actor, strictly one at a time
pub enum ActorCommand {
    Attach {
        conn_id: u64,
        token: String,
        from_global: u64,
        tx: mpsc::UnboundedSender<SyncMessage>,
        reply: oneshot::Sender<Result<AttachOk, DeniedKind>>,
    },
    Detach {
        conn_id: u64,
    },
    Push {
        conn_id: u64,
        token: String,
        events: Vec<Event>,
        reply: oneshot::Sender<Result<PushOk, DeniedKind>>,
    },
    Purge {
        token: String,
        reply: oneshot::Sender<Result<u32, DeniedKind>>,
    },
}

/// Handle to a spawned actor. Cheap to clone.
#[derive(Clone)]
pub struct ActorHandle {
    cmd_tx: mpsc::Sender<ActorCommand>,
}

impl ActorHandle {
    pub async fn attach(
        &self,
        conn_id: u64,
        token: String,
        from_global: u64,
        tx: mpsc::UnboundedSender<SyncMessage>,
    ) -> SyncResult<Result<AttachOk, DeniedKind>> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorCommand::Attach {
            conn_id,
            token,
            from_global,
            tx,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| SyncError::RemoteUnavailable("actor stopped".to_string()))
    }

    pub async fn detach(&self, conn_id: u64) {
        let _ = self.cmd_tx.send(ActorCommand::Detach { conn_id }).await;
    }

    pub async fn push(
        &self,
        conn_id: u64,
        token: String,
        events: Vec<Event>,
    ) -> SyncResult<Result<PushOk, DeniedKind>> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorCommand::Push {
            conn_id,
            token,
            events,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| SyncError::RemoteUnavailable("actor stopped".to_string()))
    }

    pub async fn purge(&self, token: String) -> SyncResult<Result<u32, DeniedKind>> {
        let (reply, rx) = oneshot::channel();
        self.send(ActorCommand::Purge { token, reply }).await?;
        rx.await
            .map_err(|_| SyncError::RemoteUnavailable("actor stopped".to_string()))
    }

    async fn send(&self, cmd: ActorCommand) -> SyncResult<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| SyncError::RemoteUnavailable("actor stopped".to_string()))
    }
}

/// Spawn the actor task for one store
pub fn spawn_actor(
    store_id: StoreId,
    stores_dir: PathBuf,
    auth: Arc<dyn AuthOracle>,
) -> ActorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
    let actor = SyncActor {
        path: stores_dir.join(store_file_name(&store_id)),
        store_id,
        auth,
        db: None,
        global_head: 0,
        connections: HashMap::new(),
    };
    tokio::spawn(actor.run(cmd_rx));
    ActorHandle { cmd_tx }
}

struct SyncActor {
    store_id: StoreId,
    path: PathBuf,
    auth: Arc<dyn AuthOracle>,
    /// Lazily opened durable log; dropped (and the file removed) on purge
    db: Option<Database>,
    /// Cached head of the authoritative log; reset by assignment on purge
    global_head: u64,
    /// Attached duplex connections
    connections: HashMap<u64, mpsc::UnboundedSender<SyncMessage>>,
}

impl SyncActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ActorCommand>) {
        debug!(store_id = %self.store_id, "Sync actor started");
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ActorCommand::Attach {
                    conn_id,
                    token,
                    from_global,
                    tx,
                    reply,
                } => {
                    let _ = reply.send(self.handle_attach(conn_id, &token, from_global, tx));
                }
                ActorCommand::Detach { conn_id } => {
                    self.connections.remove(&conn_id);
                }
                ActorCommand::Push {
                    conn_id,
                    token,
                    events,
                    reply,
                } => {
                    let _ = reply.send(self.handle_push(conn_id, &token, events));
                }
                ActorCommand::Purge { token, reply } => {
                    let _ = reply.send(self.handle_purge(&token));
                }
            }
        }
        debug!(store_id = %self.store_id, "Sync actor stopped");
    }

    /// The per-request gate: session first, then tenant ownership derived
    /// from the store id itself.
    fn authorize(&self, token: &str) -> Result<(), DeniedKind> {
        let session = self
            .auth
            .session(token)
            .ok_or(DeniedKind::Unauthorized)?;
        let expected_owner =
            user_id_of(self.store_id.as_str()).ok_or(DeniedKind::AccessDenied)?;
        if session.user_id != expected_owner {
            return Err(DeniedKind::AccessDenied);
        }
        Ok(())
    }

    fn ensure_db(&mut self) -> SyncResult<&Database> {
        if self.db.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let db = Database::create(&self.path)?;
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(LOG_TABLE)?;
            }
            write_txn.commit()?;

            let read_txn = db.begin_read()?;
            let log = read_txn.open_table(LOG_TABLE)?;
            self.global_head = log
                .iter()?
                .next_back()
                .transpose()?
                .map(|(k, _)| k.value())
                .unwrap_or(0);
            drop(read_txn);
            self.db = Some(db);
        }
        Ok(self.db.as_ref().unwrap())
    }

    fn handle_attach(
        &mut self,
        conn_id: u64,
        token: &str,
        from_global: u64,
        tx: mpsc::UnboundedSender<SyncMessage>,
    ) -> Result<AttachOk, DeniedKind> {
        self.authorize(token)?;

        let backlog = match self.read_backlog(from_global) {
            Ok(backlog) => backlog,
            Err(e) => {
                warn!(store_id = %self.store_id, error = %e, "Backlog read failed");
                return Err(DeniedKind::AccessDenied);
            }
        };
        self.connections.insert(conn_id, tx);
        debug!(
            store_id = %self.store_id,
            conn_id,
            from_global,
            backlog = backlog.len(),
            "Replica attached"
        );
        Ok(AttachOk {
            global_head: self.global_head,
            backlog,
        })
    }

    fn read_backlog(&mut self, from_global: u64) -> SyncResult<Vec<Event>> {
        let db = self.ensure_db()?;
        let read_txn = db.begin_read()?;
        let log = read_txn.open_table(LOG_TABLE)?;

        let mut events = Vec::new();
        for entry in log.range(from_global + 1..)? {
            let (_, v) = entry?;
            events.push(Event::decode(v.value())?);
        }
        Ok(events)
    }

    fn handle_push(
        &mut self,
        conn_id: u64,
        token: &str,
        events: Vec<Event>,
    ) -> Result<PushOk, DeniedKind> {
        self.authorize(token)?;

        match self.append(events) {
            Ok((ok, appended)) => {
                // Fan the new events out to every other attached replica.
                self.connections.retain(|id, tx| {
                    if *id == conn_id {
                        return true;
                    }
                    tx.send(SyncMessage::Events {
                        events: appended.clone(),
                    })
                    .is_ok()
                });
                Ok(ok)
            }
            Err(e) => {
                warn!(store_id = %self.store_id, error = %e, "Push append failed");
                Err(DeniedKind::AccessDenied)
            }
        }
    }

    /// Assign strictly increasing global sequences and append durably
    fn append(&mut self, events: Vec<Event>) -> SyncResult<(PushOk, Vec<Event>)> {
        let first_global = self.global_head + 1;
        let mut locals = Vec::with_capacity(events.len());
        let mut appended = Vec::with_capacity(events.len());

        let db = self.ensure_db()?;
        let write_txn = db.begin_write()?;
        {
            let mut log = write_txn.open_table(LOG_TABLE)?;
            for (i, event) in events.into_iter().enumerate() {
                let global = first_global + i as u64;
                let event = Event {
                    seq: SeqNum {
                        local: event.seq.local,
                        global,
                    },
                    payload: event.payload,
                };
                log.insert(global, event.encode()?.as_slice())?;
                locals.push(event.seq.local);
                appended.push(event);
            }
        }
        write_txn.commit()?;

        self.global_head = first_global + appended.len() as u64 - 1;
        debug!(
            store_id = %self.store_id,
            first_global,
            count = appended.len(),
            "Appended events"
        );
        Ok((
            PushOk {
                locals,
                first_global,
            },
            appended,
        ))
    }

    /// Idempotent full-store purge: close connections first, then wipe
    /// storage, then reset the head cache.
    fn handle_purge(&mut self, token: &str) -> Result<u32, DeniedKind> {
        self.authorize(token)?;

        let closed = self.connections.len() as u32;
        for (_, tx) in self.connections.drain() {
            let _ = tx.send(SyncMessage::Closing {
                code: CLOSE_CODE_PURGE,
                reason: CLOSE_REASON_PURGE.to_string(),
            });
        }

        self.db = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(store_id = %self.store_id, error = %e, "Purge file removal failed"),
        }
        self.global_head = 0;

        info!(store_id = %self.store_id, closed, "Store purged");
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenTable;
    use folio_core::{make_user_store_id, new_id, EventPayload};
    use tempfile::TempDir;

    fn event(local: u64, id: &str) -> Event {
        Event {
            seq: SeqNum { local, global: local },
            payload: EventPayload::NovelCreated {
                id: id.to_string(),
                title: "T".to_string(),
                created: 1,
                modified: 1,
            },
        }
    }

    struct Fixture {
        handle: ActorHandle,
        _tmp: TempDir,
    }

    fn fixture(user_id: &str) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let auth = Arc::new(TokenTable::from_pairs([
            ("tok-1".to_string(), user_id.to_string()),
            ("tok-2".to_string(), new_id()),
        ]));
        let handle = spawn_actor(
            make_user_store_id(user_id),
            tmp.path().to_path_buf(),
            auth,
        );
        Fixture { handle, _tmp: tmp }
    }

    async fn backlog_len(handle: &ActorHandle) -> usize {
        let (tx, _rx) = mpsc::unbounded_channel();
        let ok = handle
            .attach(999, "tok-1".to_string(), 0, tx)
            .await
            .unwrap()
            .unwrap();
        handle.detach(999).await;
        ok.backlog.len()
    }

    #[tokio::test]
    async fn test_push_assigns_global_seqs() {
        let user_id = new_id();
        let f = fixture(&user_id);

        let ok = f
            .handle
            .push(1, "tok-1".to_string(), vec![event(1, "n1")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok.first_global, 1);
        assert_eq!(ok.locals, vec![1]);

        let ok = f
            .handle
            .push(1, "tok-1".to_string(), vec![event(2, "n2"), event(3, "n3")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok.first_global, 2);
        assert_eq!(ok.locals, vec![2, 3]);
        assert_eq!(backlog_len(&f.handle).await, 3);
    }

    #[tokio::test]
    async fn test_wrong_tenant_push_never_reaches_log() {
        let user_id = new_id();
        let f = fixture(&user_id);

        f.handle
            .push(1, "tok-1".to_string(), vec![event(1, "n1")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backlog_len(&f.handle).await, 1);

        // Same push replayed under another tenant's session.
        let denied = f
            .handle
            .push(2, "tok-2".to_string(), vec![event(1, "n1")])
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(denied, DeniedKind::AccessDenied);
        assert_eq!(backlog_len(&f.handle).await, 1);
    }

    #[tokio::test]
    async fn test_unknown_token_is_unauthorized() {
        let f = fixture(&new_id());
        let denied = f
            .handle
            .push(1, "bogus".to_string(), vec![event(1, "n1")])
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(denied, DeniedKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_malformed_store_id_is_access_denied() {
        let tmp = TempDir::new().unwrap();
        let auth = Arc::new(TokenTable::from_pairs([("tok".to_string(), new_id())]));
        let handle = spawn_actor(
            StoreId::from("not-a-store-id"),
            tmp.path().to_path_buf(),
            auth,
        );

        let denied = handle
            .push(1, "tok".to_string(), vec![event(1, "n1")])
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(denied, DeniedKind::AccessDenied);
    }

    #[tokio::test]
    async fn test_push_broadcasts_to_other_replicas() {
        let user_id = new_id();
        let f = fixture(&user_id);

        let (tx, mut rx) = mpsc::unbounded_channel();
        f.handle
            .attach(7, "tok-1".to_string(), 0, tx)
            .await
            .unwrap()
            .unwrap();

        f.handle
            .push(1, "tok-1".to_string(), vec![event(1, "n1")])
            .await
            .unwrap()
            .unwrap();

        match rx.recv().await.unwrap() {
            SyncMessage::Events { events } => {
                assert_eq!(events.len(), 1);
                assert_eq!(events[0].seq.global, 1);
            }
            other => panic!("Wrong message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_purge_twice_is_idempotent() {
        let user_id = new_id();
        let f = fixture(&user_id);

        f.handle
            .push(1, "tok-1".to_string(), vec![event(1, "n1")])
            .await
            .unwrap()
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        f.handle
            .attach(7, "tok-1".to_string(), 0, tx)
            .await
            .unwrap()
            .unwrap();

        let closed = f.handle.purge("tok-1".to_string()).await.unwrap().unwrap();
        assert_eq!(closed, 1);
        match rx.recv().await.unwrap() {
            SyncMessage::Closing { code, reason } => {
                assert_eq!(code, CLOSE_CODE_PURGE);
                assert_eq!(reason, CLOSE_REASON_PURGE);
            }
            other => panic!("Wrong message: {other:?}"),
        }

        // Second purge: zero connections, still ok.
        let closed = f.handle.purge("tok-1".to_string()).await.unwrap().unwrap();
        assert_eq!(closed, 0);

        // The log restarts from empty.
        assert_eq!(backlog_len(&f.handle).await, 0);
        let ok = f
            .handle
            .push(1, "tok-1".to_string(), vec![event(1, "n1")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ok.first_global, 1);
    }

    #[tokio::test]
    async fn test_purge_requires_ownership() {
        let f = fixture(&new_id());
        let denied = f.handle.purge("tok-2".to_string()).await.unwrap().unwrap_err();
        assert_eq!(denied, DeniedKind::AccessDenied);
    }
}
