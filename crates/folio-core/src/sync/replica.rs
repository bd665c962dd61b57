//! Per-store client sync replica
//!
//! One background task per open store. While the resilience controller
//! reports `Connected`, the task dials the server, attaches to the
//! store's actor, pushes locally-committed-but-unacked events
//! (stop-and-wait: one batch in flight), rebases provisional global
//! sequences on ack, and applies pulled remote events through the same
//! reducer path as local commits. The moment the connection state leaves
//! `Connected`, the transport is torn down and the store falls back to
//! local-only persistence.
//!
//! `Unauthorized`/`AccessDenied` are terminal: the task emits the event
//! and exits instead of retrying.

use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::connection::ConnectionState;
use crate::error::{SyncError, SyncResult};
use crate::store::LocalStore;
use crate::store_id::StoreId;
use crate::sync::protocol::{self, DeniedKind, SyncMessage};

/// Delay before redialing after a session drops while still `Connected`
const REDIAL_DELAY_MS: u64 = 1000;

/// Events emitted by replica tasks for status displays and tests
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Session established and store attached
    Connected { store_id: StoreId },
    /// Session ended (server close, network drop, or state change)
    Disconnected { store_id: StoreId },
    /// A pushed batch was acknowledged
    Acked { store_id: StoreId, count: usize },
    /// Remote events were applied to the local store
    RemoteApplied { store_id: StoreId, count: usize },
    /// The server refused the session or a push; terminal
    Denied { store_id: StoreId, kind: DeniedKind },
    /// Transient session error
    SyncError { store_id: StoreId, message: String },
}

/// Where and as whom to sync
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub server_addr: std::net::SocketAddr,
    pub token: String,
}

enum SessionEnd {
    /// Server closed or the stream ended
    Closed,
    /// Connection state left `Connected`; transport torn down
    StateLeft,
    /// Terminal refusal; do not reconnect
    Denied,
}

/// Spawn the background sync task for one store
pub fn spawn_replica(
    store: Arc<LocalStore>,
    config: ReplicaConfig,
    conn: watch::Receiver<ConnectionState>,
    event_tx: broadcast::Sender<SyncEvent>,
) -> JoinHandle<()> {
    tokio::spawn(replica_task(store, config, conn, event_tx))
}

async fn replica_task(
    store: Arc<LocalStore>,
    config: ReplicaConfig,
    mut conn: watch::Receiver<ConnectionState>,
    event_tx: broadcast::Sender<SyncEvent>,
) {
    let store_id = store.store_id().clone();
    let session_id = Ulid::new();
    debug!(%store_id, %session_id, "Replica task started");

    loop {
        // Gate on the resilience controller.
        while *conn.borrow_and_update() != ConnectionState::Connected {
            if conn.changed().await.is_err() {
                return;
            }
        }

        match run_session(&store, &config, &mut conn, &event_tx).await {
            Ok(SessionEnd::Denied) => {
                debug!(%store_id, "Replica stopped after refusal");
                return;
            }
            Ok(SessionEnd::StateLeft) => {
                let _ = event_tx.send(SyncEvent::Disconnected {
                    store_id: store_id.clone(),
                });
            }
            Ok(SessionEnd::Closed) => {
                let _ = event_tx.send(SyncEvent::Disconnected {
                    store_id: store_id.clone(),
                });
                tokio::time::sleep(std::time::Duration::from_millis(REDIAL_DELAY_MS)).await;
            }
            Err(e) => {
                warn!(%store_id, error = %e, "Sync session failed");
                let _ = event_tx.send(SyncEvent::SyncError {
                    store_id: store_id.clone(),
                    message: e.to_string(),
                });
                tokio::time::sleep(std::time::Duration::from_millis(REDIAL_DELAY_MS)).await;
            }
        }
    }
}

async fn send(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    msg: &SyncMessage,
) -> SyncResult<()> {
    let bytes = msg.encode()?;
    framed
        .send(Bytes::from(bytes))
        .await
        .map_err(|e| SyncError::Network(e.to_string()))
}

async fn run_session(
    store: &Arc<LocalStore>,
    config: &ReplicaConfig,
    conn: &mut watch::Receiver<ConnectionState>,
    event_tx: &broadcast::Sender<SyncEvent>,
) -> SyncResult<SessionEnd> {
    let store_id = store.store_id().clone();

    let stream = TcpStream::connect(config.server_addr)
        .await
        .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?;
    let mut framed = protocol::framed(stream);

    // Authoritative watermark: provisional heads of pending events do not
    // count, the actor still owns those numbers.
    let pending = store.pending_events()?;
    let from_global = store.global_head()?.saturating_sub(pending.len() as u64);

    send(
        &mut framed,
        &SyncMessage::OpenStore {
            store_id: store_id.clone(),
            token: config.token.clone(),
            from_global,
        },
    )
    .await?;

    match recv(&mut framed).await? {
        Some(SyncMessage::StoreOpened { global_head }) => {
            debug!(%store_id, global_head, "Store attached");
        }
        Some(SyncMessage::Denied { kind, message }) => {
            info!(%store_id, ?kind, %message, "Store attach refused");
            let _ = event_tx.send(SyncEvent::Denied {
                store_id: store_id.clone(),
                kind,
            });
            return Ok(SessionEnd::Denied);
        }
        Some(other) => {
            return Err(SyncError::Network(format!(
                "unexpected attach reply: {other:?}"
            )));
        }
        None => return Ok(SessionEnd::Closed),
    }
    let _ = event_tx.send(SyncEvent::Connected {
        store_id: store_id.clone(),
    });

    let mut commits = store.subscribe_commits();
    // Local seqs of the one batch allowed in flight.
    let mut in_flight: Option<Vec<u64>> = None;
    push_next(&mut framed, store, config, &mut in_flight).await?;

    loop {
        tokio::select! {
            frame = framed.next() => {
                let msg = match frame {
                    Some(Ok(bytes)) => SyncMessage::decode(&bytes)?,
                    Some(Err(e)) => return Err(SyncError::Network(e.to_string())),
                    None => return Ok(SessionEnd::Closed),
                };
                match msg {
                    SyncMessage::Events { events } => {
                        let applied = store.apply_remote(&events)?;
                        if applied > 0 {
                            let _ = event_tx.send(SyncEvent::RemoteApplied {
                                store_id: store_id.clone(),
                                count: applied,
                            });
                        }
                    }
                    SyncMessage::PushAck { locals, first_global } => {
                        store.apply_ack(&locals, first_global)?;
                        in_flight = None;
                        let _ = event_tx.send(SyncEvent::Acked {
                            store_id: store_id.clone(),
                            count: locals.len(),
                        });
                        // Commits that queued up while the batch was in
                        // flight go out now.
                        push_next(&mut framed, store, config, &mut in_flight).await?;
                    }
                    SyncMessage::Denied { kind, message } => {
                        info!(%store_id, ?kind, %message, "Push refused");
                        let _ = event_tx.send(SyncEvent::Denied {
                            store_id: store_id.clone(),
                            kind,
                        });
                        return Ok(SessionEnd::Denied);
                    }
                    SyncMessage::Closing { code, reason } => {
                        info!(%store_id, code, %reason, "Server closed session");
                        return Ok(SessionEnd::Closed);
                    }
                    other => {
                        debug!(%store_id, ?other, "Ignoring unexpected frame");
                    }
                }
            }
            changed = commits.changed() => {
                if changed.is_err() {
                    return Ok(SessionEnd::Closed);
                }
                push_next(&mut framed, store, config, &mut in_flight).await?;
            }
            changed = conn.changed() => {
                if changed.is_err() || *conn.borrow() != ConnectionState::Connected {
                    return Ok(SessionEnd::StateLeft);
                }
            }
        }
    }
}

async fn recv(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
) -> SyncResult<Option<SyncMessage>> {
    match framed.next().await {
        Some(Ok(bytes)) => Ok(Some(SyncMessage::decode(&bytes)?)),
        Some(Err(e)) => Err(SyncError::Network(e.to_string())),
        None => Ok(None),
    }
}

/// Health probe dialing the sync server's `Health` endpoint
pub struct TcpHealthProbe {
    addr: std::net::SocketAddr,
    timeout: std::time::Duration,
}

impl TcpHealthProbe {
    pub fn new(addr: std::net::SocketAddr) -> Self {
        Self {
            addr,
            timeout: std::time::Duration::from_secs(5),
        }
    }

    async fn probe_once(&self) -> SyncResult<bool> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?;
        let mut framed = protocol::framed(stream);
        send(&mut framed, &SyncMessage::Health).await?;
        Ok(matches!(recv(&mut framed).await?, Some(SyncMessage::HealthOk)))
    }
}

impl crate::connection::HealthProbe for TcpHealthProbe {
    fn probe(&self) -> futures::future::BoxFuture<'_, bool> {
        Box::pin(async move {
            matches!(
                tokio::time::timeout(self.timeout, self.probe_once()).await,
                Ok(Ok(true))
            )
        })
    }
}

/// One-shot purge RPC against the remote actor for `store_id`.
///
/// Returns the number of connections the actor closed. Safe to call on a
/// store with zero connections and safe to call twice.
pub async fn purge_remote_store(
    addr: std::net::SocketAddr,
    token: &str,
    store_id: &StoreId,
) -> SyncResult<u32> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| SyncError::RemoteUnavailable(e.to_string()))?;
    let mut framed = protocol::framed(stream);
    send(
        &mut framed,
        &SyncMessage::Purge {
            store_id: store_id.clone(),
            token: token.to_string(),
        },
    )
    .await?;

    match recv(&mut framed).await? {
        Some(SyncMessage::Purged { closed_connections }) => Ok(closed_connections),
        Some(SyncMessage::Denied { kind, .. }) => Err(match kind {
            DeniedKind::Unauthorized => SyncError::Unauthorized,
            DeniedKind::AccessDenied => SyncError::AccessDenied,
        }),
        other => Err(SyncError::Network(format!(
            "unexpected purge reply: {other:?}"
        ))),
    }
}

/// Push the pending batch unless one is already awaiting its ack
async fn push_next(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
    store: &Arc<LocalStore>,
    config: &ReplicaConfig,
    in_flight: &mut Option<Vec<u64>>,
) -> SyncResult<()> {
    if in_flight.is_some() {
        return Ok(());
    }
    let events = store.pending_events()?;
    if events.is_empty() {
        return Ok(());
    }
    *in_flight = Some(events.iter().map(|e| e.seq.local).collect());
    debug!(store_id = %store.store_id(), count = events.len(), "Pushing events");
    send(
        framed,
        &SyncMessage::Push {
            token: config.token.clone(),
            events,
        },
    )
    .await
}
