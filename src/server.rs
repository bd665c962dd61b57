//! Sync server ingress
//!
//! A single TCP listener; the first frame of every connection is the
//! request: a health probe, a store attach, a room join, or a purge RPC.
//! The store/room id in that frame is resolved to exactly one actor
//! (stable routing by id, never broadcast), and the auth gate runs at
//! ingress before anything is forwarded — the actor then re-checks the
//! same invariant on every push.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use folio_core::{
    make_chapter_room_prefix, parse_store_id, DeniedKind, ParsedStoreId, SyncError, SyncMessage,
    SyncResult,
};

use crate::arena::ActorArena;
use crate::auth::{authorize, AuthOracle};
use crate::rooms::{RoomCommand, RoomRegistry};

/// The sync server: routing surface plus per-store actors
pub struct Server {
    listener: TcpListener,
    arena: Arc<ActorArena>,
    rooms: Arc<RoomRegistry>,
    auth: Arc<dyn AuthOracle>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Bind the listener and open the server's data directory
    pub async fn bind(
        addr: SocketAddr,
        data_dir: PathBuf,
        auth: Arc<dyn AuthOracle>,
    ) -> SyncResult<Self> {
        std::fs::create_dir_all(&data_dir)?;
        let listener = TcpListener::bind(addr).await?;
        let arena = Arc::new(ActorArena::new(data_dir.join("stores"), auth.clone()));
        let rooms = Arc::new(RoomRegistry::open(data_dir.join("rooms.redb"))?);

        Ok(Self {
            listener,
            arena,
            rooms,
            auth,
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// The actually bound address (useful with port 0)
    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; runs until the task is aborted
    pub async fn run(self) -> SyncResult<()> {
        info!(addr = %self.local_addr()?, "Sync server listening");
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            debug!(conn_id, %peer, "Connection accepted");

            let arena = self.arena.clone();
            let rooms = self.rooms.clone();
            let auth = self.auth.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, conn_id, arena, rooms, auth).await {
                    debug!(conn_id, error = %e, "Connection ended with error");
                }
            });
        }
    }
}

type Wire = Framed<TcpStream, LengthDelimitedCodec>;

async fn send(framed: &mut Wire, msg: &SyncMessage) -> SyncResult<()> {
    let bytes = msg.encode()?;
    framed
        .send(Bytes::from(bytes))
        .await
        .map_err(|e| SyncError::Network(e.to_string()))
}

async fn send_denied(framed: &mut Wire, kind: DeniedKind) -> SyncResult<()> {
    send(
        framed,
        &SyncMessage::Denied {
            kind,
            message: match kind {
                DeniedKind::Unauthorized => "no valid session".to_string(),
                DeniedKind::AccessDenied => "wrong tenant for this store".to_string(),
            },
        },
    )
    .await
}

async fn handle_connection(
    socket: TcpStream,
    conn_id: u64,
    arena: Arc<ActorArena>,
    rooms: Arc<RoomRegistry>,
    auth: Arc<dyn AuthOracle>,
) -> SyncResult<()> {
    let mut framed = folio_core::sync::protocol::framed(socket);

    let hello = match framed.next().await {
        Some(Ok(bytes)) => SyncMessage::decode(&bytes)?,
        Some(Err(e)) => return Err(SyncError::Network(e.to_string())),
        None => return Ok(()),
    };

    match hello {
        SyncMessage::Health => send(&mut framed, &SyncMessage::HealthOk).await,

        SyncMessage::OpenStore {
            store_id,
            token,
            from_global,
        } => {
            // Ingress gate; the actor re-checks on every push.
            if let Err(kind) = authorize(auth.as_ref(), &token, store_id.as_str()) {
                warn!(conn_id, %store_id, ?kind, "Store attach refused");
                return send_denied(&mut framed, kind).await;
            }
            let actor = arena.handle(&store_id);
            store_session(&mut framed, conn_id, actor, token, from_global).await
        }

        SyncMessage::OpenRoom { room_id, token } => {
            if let Err(kind) = authorize(auth.as_ref(), &token, &room_id) {
                warn!(conn_id, %room_id, ?kind, "Room join refused");
                return send_denied(&mut framed, kind).await;
            }
            let room = rooms.room(&room_id);
            room_session(&mut framed, conn_id, room).await
        }

        SyncMessage::Purge { store_id, token } => {
            let actor = arena.handle(&store_id);
            match actor.purge(token).await? {
                Ok(closed_connections) => {
                    // A purged novel takes its chapter rooms with it.
                    if let ParsedStoreId::Novel { user_id, novel_id } =
                        parse_store_id(store_id.as_str())
                    {
                        let prefix = make_chapter_room_prefix(&user_id, &novel_id);
                        if let Err(e) = rooms.purge_prefix(&prefix) {
                            warn!(%store_id, error = %e, "Room prefix purge failed");
                        }
                    }
                    arena.evict(&store_id);
                    send(&mut framed, &SyncMessage::Purged { closed_connections }).await
                }
                Err(kind) => {
                    warn!(conn_id, %store_id, ?kind, "Purge refused");
                    send_denied(&mut framed, kind).await
                }
            }
        }

        other => {
            debug!(conn_id, ?other, "Unexpected first frame");
            Ok(())
        }
    }
}

/// Duplex loop for an attached store replica
async fn store_session(
    framed: &mut Wire,
    conn_id: u64,
    actor: crate::actor::ActorHandle,
    token: String,
    from_global: u64,
) -> SyncResult<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let attach = match actor.attach(conn_id, token.clone(), from_global, tx).await? {
        Ok(attach) => attach,
        Err(kind) => return send_denied(framed, kind).await,
    };

    send(
        framed,
        &SyncMessage::StoreOpened {
            global_head: attach.global_head,
        },
    )
    .await?;
    if !attach.backlog.is_empty() {
        send(
            framed,
            &SyncMessage::Events {
                events: attach.backlog,
            },
        )
        .await?;
    }

    let result = loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(bytes)) => SyncMessage::decode(&bytes)?,
                    Some(Err(e)) => break Err(SyncError::Network(e.to_string())),
                    None => break Ok(()),
                };
                match msg {
                    SyncMessage::Push { token, events } => {
                        // The token travels with every push; the actor
                        // resolves the session anew each time.
                        match actor.push(conn_id, token, events).await? {
                            Ok(ok) => {
                                send(framed, &SyncMessage::PushAck {
                                    locals: ok.locals,
                                    first_global: ok.first_global,
                                }).await?;
                            }
                            Err(kind) => {
                                send_denied(framed, kind).await?;
                                break Ok(());
                            }
                        }
                    }
                    other => {
                        debug!(conn_id, ?other, "Ignoring unexpected frame");
                    }
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        let closing = matches!(msg, SyncMessage::Closing { .. });
                        send(framed, &msg).await?;
                        if closing {
                            // The actor purged this store out from under us.
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                }
            }
        }
    };

    actor.detach(conn_id).await;
    result
}

/// Duplex loop for a joined collaborative room
async fn room_session(
    framed: &mut Wire,
    conn_id: u64,
    room: mpsc::UnboundedSender<RoomCommand>,
) -> SyncResult<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (reply, backlog_rx) = oneshot::channel();
    room.send(RoomCommand::Join { conn_id, tx, reply })
        .map_err(|_| SyncError::RemoteUnavailable("room closed".to_string()))?;
    let backlog = backlog_rx
        .await
        .map_err(|_| SyncError::RemoteUnavailable("room closed".to_string()))?;

    send(framed, &SyncMessage::RoomOpened { backlog }).await?;

    let result = loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(bytes)) => SyncMessage::decode(&bytes)?,
                    Some(Err(e)) => break Err(SyncError::Network(e.to_string())),
                    None => break Ok(()),
                };
                if let SyncMessage::RoomUpdate { update } = msg {
                    if room.send(RoomCommand::Update { conn_id, update }).is_err() {
                        break Ok(());
                    }
                }
            }
            msg = rx.recv() => {
                match msg {
                    Some(msg) => {
                        let closing = matches!(msg, SyncMessage::Closing { .. });
                        send(framed, &msg).await?;
                        if closing {
                            break Ok(());
                        }
                    }
                    None => break Ok(()),
                }
            }
        }
    };

    let _ = room.send(RoomCommand::Leave { conn_id });
    result
}
