//! Sync wire protocol
//!
//! Messages are serialized with postcard and carried in length-delimited
//! frames. Every credential-bearing message carries the token explicitly:
//! the server re-derives the expected owner from the store/room id and
//! re-checks the session on each request, never caching the decision.

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::event::Event;
use crate::store_id::StoreId;

/// Close code sent when a store is purged out from under its connections
pub const CLOSE_CODE_PURGE: u16 = 1012;
/// Close reason paired with [`CLOSE_CODE_PURGE`]
pub const CLOSE_REASON_PURGE: &str = "purge";

/// Why a request was refused. Both kinds are terminal for the triggering
/// request and are never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeniedKind {
    /// No valid session resolved from the presented token
    Unauthorized,
    /// Valid session, wrong tenant (malformed ids land here by policy)
    AccessDenied,
}

/// Messages exchanged between a replica and a sync actor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    // ── client → server ────────────────────────────────────────────────

    /// Liveness probe for the resilience controller
    Health,

    /// Attach this connection to a store's actor and pull events with
    /// `global > from_global`
    OpenStore {
        store_id: StoreId,
        token: String,
        from_global: u64,
    },

    /// Propose a batch of locally committed events for appending
    Push { token: String, events: Vec<Event> },

    /// Join a chapter's collaborative room
    OpenRoom { room_id: String, token: String },

    /// Opaque CRDT update for the joined room (either direction)
    RoomUpdate { update: Vec<u8> },

    /// Privileged: destroy the store's log, state, and connections
    Purge { store_id: StoreId, token: String },

    // ── server → client ────────────────────────────────────────────────

    /// Health probe reply
    HealthOk,

    /// The store is attached; backlog follows as `Events` frames
    StoreOpened { global_head: u64 },

    /// Committed events, in global-sequence order
    Events { events: Vec<Event> },

    /// The pushed batch was appended; `locals` (in push order) were
    /// assigned `first_global..`
    PushAck { locals: Vec<u64>, first_global: u64 },

    /// The room is joined; all persisted updates so far
    RoomOpened { backlog: Vec<Vec<u8>> },

    /// Purge completed (idempotent; zero connections is fine)
    Purged { closed_connections: u32 },

    /// Request refused; terminal for this request
    Denied { kind: DeniedKind, message: String },

    /// Server is closing this connection
    Closing { code: u16, reason: String },
}

impl SyncMessage {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        WireMessage::V1(self.clone()).encode()
    }

    /// Decode message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        Ok(WireMessage::decode(data)?.into_inner())
    }
}

/// Wrapper for versioned messages (future-proofing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(SyncMessage),
}

impl WireMessage {
    /// Encode wire message to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode wire message from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }

    /// Unwrap the inner message
    pub fn into_inner(self) -> SyncMessage {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    /// Get the protocol version
    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}

/// Wrap a TCP stream in the length-delimited framing both sides use
pub fn framed(stream: TcpStream) -> Framed<TcpStream, LengthDelimitedCodec> {
    Framed::new(stream, LengthDelimitedCodec::new())
}
