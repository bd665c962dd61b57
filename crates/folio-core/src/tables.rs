//! Materialized tables and event reducers
//!
//! The materialized view is a derived, disposable cache: rows are produced
//! by replaying the event log through exactly one deterministic reducer
//! per event kind, and can always be rebuilt from an empty state. It is
//! never a source of truth.
//!
//! Reducers are idempotent at the row level: inserts are guarded against
//! duplicate ids, updates are scoped `where id = X` and no-ops when the
//! row is missing, and the purge reducer's delete tolerates an absent row.
//! Soft delete sets the nullable `deleted` timestamp; only `NovelPurged`
//! physically removes a row.

use redb::{ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::event::EventPayload;

pub(crate) const NOVELS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("novels");
pub(crate) const VOLUMES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("volumes");
pub(crate) const CHAPTERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("chapters");

/// Materialized novel row (tenant-root store)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NovelRow {
    pub id: String,
    pub title: String,
    pub created: i64,
    pub modified: i64,
    pub last_accessed: Option<i64>,
    /// Soft-delete timestamp; the row is hidden from default queries but
    /// keeps its id and history until purged.
    pub deleted: Option<i64>,
}

/// Materialized volume row (novel store)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRow {
    pub id: String,
    pub title: String,
    pub created: i64,
    pub modified: i64,
    pub deleted: Option<i64>,
}

/// Materialized chapter row (novel store)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRow {
    pub id: String,
    pub volume_id: String,
    pub title: String,
    pub body: String,
    /// Fractional index for ordering chapters within a volume
    pub order: String,
    pub created: i64,
    pub modified: i64,
    pub deleted: Option<i64>,
}

fn to_json<T: Serialize>(row: &T) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(row).map_err(|e| SyncError::Serialization(e.to_string()))
}

fn from_json<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, SyncError> {
    serde_json::from_slice(data).map_err(|e| SyncError::Serialization(e.to_string()))
}

pub(crate) fn decode_novel(data: &[u8]) -> Result<NovelRow, SyncError> {
    from_json(data)
}

pub(crate) fn decode_volume(data: &[u8]) -> Result<VolumeRow, SyncError> {
    from_json(data)
}

pub(crate) fn decode_chapter(data: &[u8]) -> Result<ChapterRow, SyncError> {
    from_json(data)
}

/// Apply one event to the materialized tables inside the committing
/// write transaction.
pub(crate) fn apply_event(txn: &WriteTransaction, payload: &EventPayload) -> Result<(), SyncError> {
    match payload {
        EventPayload::NovelCreated {
            id,
            title,
            created,
            modified,
        } => {
            let mut table = txn.open_table(NOVELS_TABLE)?;
            if table.get(id.as_str())?.is_none() {
                let row = NovelRow {
                    id: id.clone(),
                    title: title.clone(),
                    created: *created,
                    modified: *modified,
                    last_accessed: None,
                    deleted: None,
                };
                table.insert(id.as_str(), to_json(&row)?.as_slice())?;
            }
        }
        EventPayload::NovelTitleUpdated {
            id,
            title,
            modified,
        } => {
            update_novel(txn, id, |row| {
                row.title = title.clone();
                row.modified = *modified;
            })?;
        }
        EventPayload::NovelDeleted { id, deleted } => {
            update_novel(txn, id, |row| row.deleted = Some(*deleted))?;
        }
        EventPayload::NovelRestored { id, modified } => {
            update_novel(txn, id, |row| {
                row.deleted = None;
                row.modified = *modified;
            })?;
        }
        EventPayload::NovelAccessed { id, last_accessed } => {
            update_novel(txn, id, |row| row.last_accessed = Some(*last_accessed))?;
        }
        EventPayload::NovelPurged { id, .. } => {
            let mut table = txn.open_table(NOVELS_TABLE)?;
            table.remove(id.as_str())?;
        }
        EventPayload::VolumeCreated {
            id,
            title,
            created,
            modified,
        } => {
            let mut table = txn.open_table(VOLUMES_TABLE)?;
            if table.get(id.as_str())?.is_none() {
                let row = VolumeRow {
                    id: id.clone(),
                    title: title.clone(),
                    created: *created,
                    modified: *modified,
                    deleted: None,
                };
                table.insert(id.as_str(), to_json(&row)?.as_slice())?;
            }
        }
        EventPayload::VolumeTitleUpdated {
            id,
            title,
            modified,
        } => {
            update_volume(txn, id, |row| {
                row.title = title.clone();
                row.modified = *modified;
            })?;
        }
        EventPayload::VolumeDeleted { id, deleted } => {
            update_volume(txn, id, |row| row.deleted = Some(*deleted))?;
        }
        EventPayload::ChapterCreated {
            id,
            volume_id,
            title,
            order,
            created,
            modified,
        } => {
            let mut table = txn.open_table(CHAPTERS_TABLE)?;
            if table.get(id.as_str())?.is_none() {
                let row = ChapterRow {
                    id: id.clone(),
                    volume_id: volume_id.clone(),
                    title: title.clone(),
                    body: String::new(),
                    order: order.clone(),
                    created: *created,
                    modified: *modified,
                    deleted: None,
                };
                table.insert(id.as_str(), to_json(&row)?.as_slice())?;
            }
        }
        EventPayload::ChapterTitleUpdated {
            id,
            title,
            modified,
        } => {
            update_chapter(txn, id, |row| {
                row.title = title.clone();
                row.modified = *modified;
            })?;
        }
        EventPayload::ChapterBodyUpdated { id, body, modified } => {
            update_chapter(txn, id, |row| {
                row.body = body.clone();
                row.modified = *modified;
            })?;
        }
        EventPayload::ChapterMoved {
            id,
            order,
            modified,
        } => {
            update_chapter(txn, id, |row| {
                row.order = order.clone();
                row.modified = *modified;
            })?;
        }
        EventPayload::ChapterDeleted { id, deleted } => {
            update_chapter(txn, id, |row| row.deleted = Some(*deleted))?;
        }
    }
    Ok(())
}

fn update_novel(
    txn: &WriteTransaction,
    id: &str,
    f: impl FnOnce(&mut NovelRow),
) -> Result<(), SyncError> {
    let mut table = txn.open_table(NOVELS_TABLE)?;
    let existing = match table.get(id)? {
        Some(v) => Some(from_json::<NovelRow>(v.value())?),
        None => None,
    };
    if let Some(mut row) = existing {
        f(&mut row);
        table.insert(id, to_json(&row)?.as_slice())?;
    }
    Ok(())
}

fn update_volume(
    txn: &WriteTransaction,
    id: &str,
    f: impl FnOnce(&mut VolumeRow),
) -> Result<(), SyncError> {
    let mut table = txn.open_table(VOLUMES_TABLE)?;
    let existing = match table.get(id)? {
        Some(v) => Some(from_json::<VolumeRow>(v.value())?),
        None => None,
    };
    if let Some(mut row) = existing {
        f(&mut row);
        table.insert(id, to_json(&row)?.as_slice())?;
    }
    Ok(())
}

fn update_chapter(
    txn: &WriteTransaction,
    id: &str,
    f: impl FnOnce(&mut ChapterRow),
) -> Result<(), SyncError> {
    let mut table = txn.open_table(CHAPTERS_TABLE)?;
    let existing = match table.get(id)? {
        Some(v) => Some(from_json::<ChapterRow>(v.value())?),
        None => None,
    };
    if let Some(mut row) = existing {
        f(&mut row);
        table.insert(id, to_json(&row)?.as_slice())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::Database;
    use tempfile::TempDir;

    fn test_db() -> (Database, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Database::create(tmp.path().join("tables.redb")).unwrap();
        (db, tmp)
    }

    fn apply(db: &Database, payload: &EventPayload) {
        let txn = db.begin_write().unwrap();
        apply_event(&txn, payload).unwrap();
        txn.commit().unwrap();
    }

    fn read_novel(db: &Database, id: &str) -> Option<NovelRow> {
        let txn = db.begin_read().unwrap();
        let table = txn.open_table(NOVELS_TABLE).ok()?;
        table
            .get(id)
            .unwrap()
            .map(|v| decode_novel(v.value()).unwrap())
    }

    #[test]
    fn test_novel_lifecycle() {
        let (db, _tmp) = test_db();

        apply(
            &db,
            &EventPayload::NovelCreated {
                id: "n1".into(),
                title: "Draft".into(),
                created: 100,
                modified: 100,
            },
        );
        let row = read_novel(&db, "n1").unwrap();
        assert_eq!(row.title, "Draft");
        assert!(row.deleted.is_none());

        apply(
            &db,
            &EventPayload::NovelTitleUpdated {
                id: "n1".into(),
                title: "Final".into(),
                modified: 200,
            },
        );
        assert_eq!(read_novel(&db, "n1").unwrap().title, "Final");

        apply(
            &db,
            &EventPayload::NovelDeleted {
                id: "n1".into(),
                deleted: 300,
            },
        );
        assert_eq!(read_novel(&db, "n1").unwrap().deleted, Some(300));

        apply(
            &db,
            &EventPayload::NovelRestored {
                id: "n1".into(),
                modified: 400,
            },
        );
        assert!(read_novel(&db, "n1").unwrap().deleted.is_none());

        apply(
            &db,
            &EventPayload::NovelPurged {
                id: "n1".into(),
                purged: 500,
            },
        );
        assert!(read_novel(&db, "n1").is_none());
    }

    #[test]
    fn test_duplicate_create_is_guarded() {
        let (db, _tmp) = test_db();

        apply(
            &db,
            &EventPayload::NovelCreated {
                id: "n1".into(),
                title: "First".into(),
                created: 1,
                modified: 1,
            },
        );
        // Replaying the same insert must not clobber the existing row.
        apply(
            &db,
            &EventPayload::NovelCreated {
                id: "n1".into(),
                title: "Second".into(),
                created: 2,
                modified: 2,
            },
        );
        assert_eq!(read_novel(&db, "n1").unwrap().title, "First");
    }

    #[test]
    fn test_update_on_missing_row_is_noop() {
        let (db, _tmp) = test_db();

        apply(
            &db,
            &EventPayload::ChapterTitleUpdated {
                id: "ghost".into(),
                title: "Nothing".into(),
                modified: 1,
            },
        );
        apply(
            &db,
            &EventPayload::NovelPurged {
                id: "ghost".into(),
                purged: 1,
            },
        );
        // No rows were created as a side effect.
        let txn = db.begin_read().unwrap();
        assert_eq!(
            txn.open_table(CHAPTERS_TABLE).unwrap().iter().unwrap().count(),
            0
        );
        assert_eq!(
            txn.open_table(NOVELS_TABLE).unwrap().iter().unwrap().count(),
            0
        );
    }

    #[test]
    fn test_chapter_rows() {
        let (db, _tmp) = test_db();

        apply(
            &db,
            &EventPayload::ChapterCreated {
                id: "c1".into(),
                volume_id: "v1".into(),
                title: "One".into(),
                order: "i".into(),
                created: 1,
                modified: 1,
            },
        );
        apply(
            &db,
            &EventPayload::ChapterBodyUpdated {
                id: "c1".into(),
                body: "Call me Ishmael.".into(),
                modified: 2,
            },
        );
        apply(
            &db,
            &EventPayload::ChapterMoved {
                id: "c1".into(),
                order: "r".into(),
                modified: 3,
            },
        );

        let txn = db.begin_read().unwrap();
        let table = txn.open_table(CHAPTERS_TABLE).unwrap();
        let row = decode_chapter(table.get("c1").unwrap().unwrap().value()).unwrap();
        assert_eq!(row.body, "Call me Ishmael.");
        assert_eq!(row.order, "r");
        assert_eq!(row.volume_id, "v1");
    }
}
