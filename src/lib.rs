//! Folio sync server library
//!
//! Server-side counterpart of `folio-core`: the per-tenant sync actors,
//! the arena routing store ids to them, the collaborative room relays,
//! the auth oracle boundary, and the TCP ingress tying them together.

pub mod actor;
pub mod arena;
pub mod auth;
pub mod rooms;
pub mod server;

pub use actor::{ActorHandle, AttachOk, PushOk};
pub use arena::ActorArena;
pub use auth::{authorize, AuthOracle, Session, TokenTable};
pub use rooms::{RoomCommand, RoomRegistry};
pub use server::Server;
