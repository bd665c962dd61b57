//! Actor arena
//!
//! Routing surface between connections and sync actors: each StoreId
//! resolves to exactly one actor handle, created lazily on the first
//! routed request and evicted after a purge. Handles live in an owned
//! map — never in ambient globals.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use folio_core::StoreId;

use crate::actor::{spawn_actor, ActorHandle};
use crate::auth::AuthOracle;

pub struct ActorArena {
    stores_dir: PathBuf,
    auth: Arc<dyn AuthOracle>,
    actors: Mutex<HashMap<StoreId, ActorHandle>>,
}

impl ActorArena {
    pub fn new(stores_dir: PathBuf, auth: Arc<dyn AuthOracle>) -> Self {
        Self {
            stores_dir,
            auth,
            actors: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a store id to its one actor, spawning it on first use
    pub fn handle(&self, store_id: &StoreId) -> ActorHandle {
        let mut actors = self.actors.lock();
        actors
            .entry(store_id.clone())
            .or_insert_with(|| {
                debug!(%store_id, "Spawning sync actor");
                spawn_actor(store_id.clone(), self.stores_dir.clone(), self.auth.clone())
            })
            .clone()
    }

    /// Drop the handle for a purged store; the next request respawns
    /// an actor that rebuilds from empty.
    pub fn evict(&self, store_id: &StoreId) {
        if self.actors.lock().remove(store_id).is_some() {
            debug!(%store_id, "Evicted sync actor");
        }
    }

    /// Number of live actors (for tests and introspection)
    pub fn len(&self) -> usize {
        self.actors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.lock().is_empty()
    }
}
