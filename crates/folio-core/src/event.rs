//! Event model for the append-only store logs
//!
//! Every mutation is a typed, immutable event. Events carry two sequence
//! numbers: `local` is assigned by the committing replica before
//! confirmation and only orders events within that replica's log; `global`
//! is assigned by the authoritative sync actor and is strictly increasing
//! per store. Events are never mutated or removed from a log except by a
//! full-store purge.
//!
//! Log records and wire frames are serialized with postcard.

use serde::{Deserialize, Serialize};

/// Sequence numbers of a committed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqNum {
    /// Position in the committing replica's local log
    pub local: u64,
    /// Position in the store's authoritative log. Provisional (head + 1)
    /// until acknowledged by the sync actor.
    pub global: u64,
}

/// Typed payload of an event, partitioned by declared kind.
///
/// Novel-level kinds live in the tenant-root store; volume and chapter
/// kinds live in the per-novel store. Timestamps are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    NovelCreated {
        id: String,
        title: String,
        created: i64,
        modified: i64,
    },
    NovelTitleUpdated {
        id: String,
        title: String,
        modified: i64,
    },
    NovelDeleted {
        id: String,
        deleted: i64,
    },
    NovelRestored {
        id: String,
        modified: i64,
    },
    NovelAccessed {
        id: String,
        last_accessed: i64,
    },
    NovelPurged {
        id: String,
        purged: i64,
    },
    VolumeCreated {
        id: String,
        title: String,
        created: i64,
        modified: i64,
    },
    VolumeTitleUpdated {
        id: String,
        title: String,
        modified: i64,
    },
    VolumeDeleted {
        id: String,
        deleted: i64,
    },
    ChapterCreated {
        id: String,
        volume_id: String,
        title: String,
        order: String,
        created: i64,
        modified: i64,
    },
    ChapterTitleUpdated {
        id: String,
        title: String,
        modified: i64,
    },
    ChapterBodyUpdated {
        id: String,
        body: String,
        modified: i64,
    },
    ChapterMoved {
        id: String,
        order: String,
        modified: i64,
    },
    ChapterDeleted {
        id: String,
        deleted: i64,
    },
}

impl EventPayload {
    /// Stable event-kind name, used for subscription filters
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::NovelCreated { .. } => "v1.NovelCreated",
            EventPayload::NovelTitleUpdated { .. } => "v1.NovelTitleUpdated",
            EventPayload::NovelDeleted { .. } => "v1.NovelDeleted",
            EventPayload::NovelRestored { .. } => "v1.NovelRestored",
            EventPayload::NovelAccessed { .. } => "v1.NovelAccessed",
            EventPayload::NovelPurged { .. } => "v1.NovelPurged",
            EventPayload::VolumeCreated { .. } => "v1.VolumeCreated",
            EventPayload::VolumeTitleUpdated { .. } => "v1.VolumeTitleUpdated",
            EventPayload::VolumeDeleted { .. } => "v1.VolumeDeleted",
            EventPayload::ChapterCreated { .. } => "v1.ChapterCreated",
            EventPayload::ChapterTitleUpdated { .. } => "v1.ChapterTitleUpdated",
            EventPayload::ChapterBodyUpdated { .. } => "v1.ChapterBodyUpdated",
            EventPayload::ChapterMoved { .. } => "v1.ChapterMoved",
            EventPayload::ChapterDeleted { .. } => "v1.ChapterDeleted",
        }
    }

    /// Id of the entity this event targets
    pub fn entity_id(&self) -> &str {
        match self {
            EventPayload::NovelCreated { id, .. }
            | EventPayload::NovelTitleUpdated { id, .. }
            | EventPayload::NovelDeleted { id, .. }
            | EventPayload::NovelRestored { id, .. }
            | EventPayload::NovelAccessed { id, .. }
            | EventPayload::NovelPurged { id, .. }
            | EventPayload::VolumeCreated { id, .. }
            | EventPayload::VolumeTitleUpdated { id, .. }
            | EventPayload::VolumeDeleted { id, .. }
            | EventPayload::ChapterCreated { id, .. }
            | EventPayload::ChapterTitleUpdated { id, .. }
            | EventPayload::ChapterBodyUpdated { id, .. }
            | EventPayload::ChapterMoved { id, .. }
            | EventPayload::ChapterDeleted { id, .. } => id,
        }
    }
}

/// A committed event: sequence numbers plus typed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub seq: SeqNum,
    pub payload: EventPayload,
}

impl Event {
    /// Encode the event to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode an event from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }
}
