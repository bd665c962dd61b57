//! Folio Core Library
//!
//! Offline-first, event-sourced writing store (novels → volumes →
//! chapters) with transparent client/server sync.
//!
//! ## Overview
//!
//! Every mutation is an event committed to a local append-only log and
//! materialized into queryable tables in the same transaction, so the app
//! works fully offline. When connectivity exists, a per-store replica
//! task streams events to the one authoritative per-tenant actor on the
//! server and applies what other replicas pushed, so every live client of
//! a store converges. A cascading purge protocol propagates "delete this
//! novel forever" to the novel's sub-store, its chapter rooms, and the
//! remote actor — exactly once, even across restarts.
//!
//! ## Core Principles
//!
//! - **Local-first**: commits never wait for the network; queries never
//!   touch it
//! - **One owner per store**: store ids encode their tenant, and every
//!   sync operation re-checks ownership against the session
//! - **The log is the truth**: materialized tables are a disposable cache
//!   rebuilt by deterministic replay
//!
//! ## Quick Start
//!
//! ```ignore
//! use folio_core::Folio;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let folio = Folio::open("~/.folio/data", user_id)?;
//!
//!     let novel = folio.create_novel("The Long Winter")?;
//!     let volume = folio.create_volume(&novel.id, "Part One")?;
//!     folio.create_chapter(&novel.id, &volume.id, "Thaw")?;
//!
//!     for novel in folio.user_store().novels()? {
//!         println!("{}", novel.title);
//!     }
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod engine;
pub mod error;
pub mod event;
pub mod order;
pub mod purge;
pub mod rooms;
pub mod store;
pub mod store_id;
pub mod sync;
pub mod tables;

// Re-exports
pub use connection::{
    AlwaysOnline, ConnectionController, ConnectionState, CredentialOracle, HealthProbe,
    NetworkOracle, StaticCredentials,
};
pub use engine::{Folio, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use event::{Event, EventPayload, SeqNum};
pub use purge::{handle_novel_purged, spawn_purge_coordinator, PurgeEnvironment};
pub use rooms::RoomStore;
pub use store::{
    delete_local_store, has_local_store, EventSubscription, LocalStore, UiState,
};
pub use store_id::{
    make_chapter_room_id, make_chapter_room_prefix, make_novel_store_id, make_user_store_id,
    new_id, novel_id_of, parse_store_id, store_file_name, user_id_of, user_store_id_of,
    ParsedStoreId, StoreId,
};
pub use sync::{
    DeniedKind, ReplicaConfig, SyncEvent, SyncMessage, WireMessage, CLOSE_CODE_PURGE,
    CLOSE_REASON_PURGE,
};
pub use tables::{ChapterRow, NovelRow, VolumeRow};
