//! Client/server synchronization layer
//!
//! Each store syncs against exactly one authoritative per-tenant actor on
//! the server, addressed by its [`StoreId`](crate::StoreId). The wire
//! protocol is a single postcard-encoded message enum carried in
//! length-delimited frames over TCP:
//!
//! ```text
//! Replica                          Sync actor
//!   |                                  |
//!   |-- OpenStore {id, token, from} -->|   auth gate: session + owner
//!   |<- StoreOpened {global_head} -----|
//!   |<- Events {backlog...} -----------|   pull: events after `from`
//!   |                                  |
//!   |-- Push {token, events} --------->|   auth gate again, serialize,
//!   |<- PushAck {locals, first_global} |   assign globals, append
//!   |<- Events {...} ------------------|   broadcast from other replicas
//! ```
//!
//! The replica task only holds a session while the resilience controller
//! reports `Connected`, and tears the transport down immediately when the
//! state changes.

pub mod protocol;
pub mod replica;

pub use protocol::{
    DeniedKind, SyncMessage, WireMessage, CLOSE_CODE_PURGE, CLOSE_REASON_PURGE,
};
pub use replica::{spawn_replica, ReplicaConfig, SyncEvent};
