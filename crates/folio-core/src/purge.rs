//! Cascading purge coordinator
//!
//! A novel's "delete forever" is a single `v1.NovelPurged` event in the
//! tenant-root store. This coordinator is the long-lived subscriber that
//! turns that one event into the full cascade: shut down and delete the
//! novel's local sub-store, tear down and delete its chapter rooms, and
//! instruct the remote actor to purge.
//!
//! Idempotence across restarts comes from the [`UiState`] watermark
//! (`last_novel_purge_global_seq`): events at or below it are skipped,
//! and the watermark advances *before* any cleanup step runs, so a crash
//! mid-cascade never re-triggers the same work. The cleanup itself is
//! best-effort: step failures are logged and never roll the watermark
//! back — the watermark prevents duplicate triggering, not duplicate
//! execution.
//!
//! [`UiState`]: crate::store::UiState

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::event::{Event, EventPayload};
use crate::store::LocalStore;
use crate::store_id::{make_chapter_room_prefix, make_novel_store_id, StoreId};

/// Event kind the coordinator subscribes to
pub const NOVEL_PURGED: &str = "v1.NovelPurged";

/// The cleanup surface the coordinator drives.
///
/// Split out as a trait so tests can script it; [`crate::Folio`] is the
/// production implementation.
pub trait PurgeEnvironment: Send + Sync {
    /// Shut down any open handle (and its sync task) for a novel's store
    fn close_novel_store<'a>(&'a self, novel_id: &'a str) -> BoxFuture<'a, ()>;

    /// Delete the persisted local store; `true` if data existed
    fn delete_local_store(&self, store_id: &StoreId) -> std::io::Result<bool>;

    /// Tear down live room sessions and delete persisted room documents
    /// under `prefix`; returns how many rooms were removed
    fn purge_rooms(&self, prefix: &str) -> SyncResult<usize>;

    /// Instruct the remote sync actor to purge the store
    fn purge_remote<'a>(&'a self, store_id: &'a StoreId) -> BoxFuture<'a, SyncResult<u32>>;
}

/// Spawn the coordinator task for a tenant.
///
/// Subscribes to the tenant store's `v1.NovelPurged` events, resuming
/// from the persisted watermark.
pub fn spawn_purge_coordinator(
    user_store: Arc<LocalStore>,
    user_id: String,
    env: Arc<dyn PurgeEnvironment>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let watermark = match user_store.ui_state() {
            Ok(state) => state.last_novel_purge_global_seq,
            Err(e) => {
                warn!(error = %e, "Purge coordinator failed to load watermark");
                0
            }
        };
        debug!(%user_id, watermark, "Purge coordinator started");

        let mut sub = user_store.subscribe_events(vec![NOVEL_PURGED.to_string()], watermark);
        while let Some(event) = sub.next().await {
            match handle_novel_purged(&user_store, &user_id, env.as_ref(), &event).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(global = event.seq.global, "Purge event already handled, skipping")
                }
                Err(e) => warn!(error = %e, "Purge event handling failed"),
            }
        }
    })
}

/// Process one observed `NovelPurged` event.
///
/// Returns `Ok(false)` if the watermark shows it was already handled (no
/// side effects run), `Ok(true)` if the cascade was triggered.
pub async fn handle_novel_purged(
    user_store: &LocalStore,
    user_id: &str,
    env: &dyn PurgeEnvironment,
    event: &Event,
) -> SyncResult<bool> {
    let EventPayload::NovelPurged { id: novel_id, .. } = &event.payload else {
        return Ok(false);
    };
    let global = event.seq.global;

    if global <= user_store.ui_state()?.last_novel_purge_global_seq {
        return Ok(false);
    }

    // Advance first: a crash anywhere below never reprocesses this event.
    user_store.advance_purge_watermark(global)?;
    info!(%novel_id, global, "Purging novel data");

    let store_id = make_novel_store_id(user_id, novel_id);

    // (a) local event-log replica of the purged novel
    env.close_novel_store(novel_id).await;
    match env.delete_local_store(&store_id) {
        Ok(true) => debug!(%store_id, "Deleted local store"),
        Ok(false) => {}
        Err(e) => warn!(%store_id, error = %e, "Failed to delete local store"),
    }

    // (b) the novel's chapter rooms
    let prefix = make_chapter_room_prefix(user_id, novel_id);
    match env.purge_rooms(&prefix) {
        Ok(count) if count > 0 => debug!(%prefix, count, "Purged chapter rooms"),
        Ok(_) => {}
        Err(e) => warn!(%prefix, error = %e, "Failed to purge chapter rooms"),
    }

    // (c) the remote actor; failure is background noise, not a rollback
    match env.purge_remote(&store_id).await {
        Ok(closed) => debug!(%store_id, closed, "Remote store purged"),
        Err(e) => warn!(%store_id, error = %e, "Remote purge failed"),
    }

    Ok(true)
}
