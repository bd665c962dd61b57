//! Store identity scheme
//!
//! Every event-sourced store is named by an opaque but parseable id that
//! encodes its owning tenant:
//!
//! - `user:<userId>` — the tenant-root store
//! - `user:<userId>:novel:<novelId>` — a novel store scoped to that tenant
//!
//! Chapter rooms extend the same grammar with a `:chapter:<chapterId>`
//! suffix. Id segments are 21-character nanoids (`[A-Za-z0-9_-]{21}`).
//!
//! Parsing is pure and total: malformed input yields [`ParsedStoreId::Unknown`]
//! (or `None`), never a panic. Callers treat `Unknown` as access-denial —
//! this module is the sole source of truth for "which tenant owns this
//! store", and every authorization decision is built on it.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of a nanoid segment
const ID_LENGTH: usize = 21;

/// nanoid default alphabet: A-Za-z0-9_-
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

const USER_PREFIX: &str = "user:";
const NOVEL_SEP: &str = ":novel:";
const CHAPTER_SEP: &str = ":chapter:";

/// Opaque identifier naming one event-sourced store and its owning tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(String);

impl StoreId {
    /// View the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the id, returning the underlying string
    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StoreId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Result of parsing a store id's textual grammar
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedStoreId {
    /// Tenant-root store: `user:<userId>`
    User { user_id: String },
    /// Novel store: `user:<userId>:novel:<novelId>`
    Novel { user_id: String, novel_id: String },
    /// Anything else, including room ids and malformed input
    Unknown,
}

/// Check that a segment is a well-formed 21-char nanoid
fn is_id_segment(s: &str) -> bool {
    s.len() == ID_LENGTH
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Generate a fresh 21-character nanoid segment
pub fn new_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LENGTH)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Build the tenant-root store id for a user
pub fn make_user_store_id(user_id: &str) -> StoreId {
    StoreId(format!("{USER_PREFIX}{user_id}"))
}

/// Build the novel store id for a `(user, novel)` pair
pub fn make_novel_store_id(user_id: &str, novel_id: &str) -> StoreId {
    StoreId(format!("{USER_PREFIX}{user_id}{NOVEL_SEP}{novel_id}"))
}

/// Build the collaborative room id for a chapter
pub fn make_chapter_room_id(user_id: &str, novel_id: &str, chapter_id: &str) -> String {
    format!("{USER_PREFIX}{user_id}{NOVEL_SEP}{novel_id}{CHAPTER_SEP}{chapter_id}")
}

/// Prefix shared by all chapter rooms of one novel
pub fn make_chapter_room_prefix(user_id: &str, novel_id: &str) -> String {
    format!("{USER_PREFIX}{user_id}{NOVEL_SEP}{novel_id}{CHAPTER_SEP}")
}

/// Parse an id against the closed store-id grammar.
///
/// Total over arbitrary strings: anything that is not exactly a user store
/// id or a novel store id (room ids included) parses to `Unknown`.
pub fn parse_store_id(id: &str) -> ParsedStoreId {
    let Some(rest) = id.strip_prefix(USER_PREFIX) else {
        return ParsedStoreId::Unknown;
    };

    if is_id_segment(rest) {
        return ParsedStoreId::User {
            user_id: rest.to_string(),
        };
    }

    if rest.len() < ID_LENGTH {
        return ParsedStoreId::Unknown;
    }
    let (user_id, tail) = rest.split_at(ID_LENGTH);
    if !is_id_segment(user_id) {
        return ParsedStoreId::Unknown;
    }

    match tail.strip_prefix(NOVEL_SEP) {
        Some(novel_id) if is_id_segment(novel_id) => ParsedStoreId::Novel {
            user_id: user_id.to_string(),
            novel_id: novel_id.to_string(),
        },
        _ => ParsedStoreId::Unknown,
    }
}

/// Extract the owning tenant from any store or room id.
///
/// Prefix-based: matches the leading `user:<userId>` and ignores the rest,
/// so it works on user stores, novel stores, and chapter room ids alike.
/// Returns `None` for malformed input.
pub fn user_id_of(id: &str) -> Option<&str> {
    let rest = id.strip_prefix(USER_PREFIX)?;
    if rest.len() < ID_LENGTH {
        return None;
    }
    let (user_id, tail) = rest.split_at(ID_LENGTH);
    if !is_id_segment(user_id) {
        return None;
    }
    if tail.is_empty() || tail.starts_with(':') {
        Some(user_id)
    } else {
        None
    }
}

/// Extract the novel id from a novel store id (full match only)
pub fn novel_id_of(id: &str) -> Option<String> {
    match parse_store_id(id) {
        ParsedStoreId::Novel { novel_id, .. } => Some(novel_id),
        _ => None,
    }
}

/// Tenant-root store id of any store or room id
pub fn user_store_id_of(id: &str) -> Option<StoreId> {
    user_id_of(id).map(make_user_store_id)
}

/// Deterministic file name for a store's local database.
///
/// `:` maps to `-`, so the novel stores of a tenant share the tenant's
/// file-name prefix and "does local data exist for id X" / "delete local
/// data for id X" are plain prefix operations on the stores directory.
pub fn store_file_name(store_id: &StoreId) -> String {
    format!("{}.redb", store_id.as_str().replace(':', "-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), ID_LENGTH);
        assert!(is_id_segment(&id));
    }

    #[test]
    fn test_new_id_unique() {
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn test_parse_user_store_id() {
        let user_id = new_id();
        let store_id = make_user_store_id(&user_id);
        assert_eq!(
            parse_store_id(store_id.as_str()),
            ParsedStoreId::User {
                user_id: user_id.clone()
            }
        );
        assert_eq!(user_id_of(store_id.as_str()), Some(user_id.as_str()));
    }

    #[test]
    fn test_parse_novel_store_id() {
        let user_id = new_id();
        let novel_id = new_id();
        let store_id = make_novel_store_id(&user_id, &novel_id);
        assert_eq!(
            parse_store_id(store_id.as_str()),
            ParsedStoreId::Novel {
                user_id: user_id.clone(),
                novel_id: novel_id.clone(),
            }
        );
        assert_eq!(user_id_of(store_id.as_str()), Some(user_id.as_str()));
        assert_eq!(novel_id_of(store_id.as_str()), Some(novel_id));
    }

    #[test]
    fn test_room_id_keeps_tenant_prefix() {
        let user_id = new_id();
        let novel_id = new_id();
        let chapter_id = new_id();
        let room_id = make_chapter_room_id(&user_id, &novel_id, &chapter_id);

        // Room ids are not store ids, but their tenant is still extractable.
        assert_eq!(parse_store_id(&room_id), ParsedStoreId::Unknown);
        assert_eq!(user_id_of(&room_id), Some(user_id.as_str()));
        assert!(room_id.starts_with(&make_chapter_room_prefix(&user_id, &novel_id)));
    }

    #[test]
    fn test_user_store_id_of_sub_resource() {
        let user_id = new_id();
        let novel_id = new_id();
        let store_id = make_novel_store_id(&user_id, &novel_id);
        assert_eq!(
            user_store_id_of(store_id.as_str()),
            Some(make_user_store_id(&user_id))
        );
    }

    #[test]
    fn test_malformed_ids_parse_to_unknown() {
        for id in [
            "",
            "user:",
            "user:short",
            "novel:abc",
            "user:tooooooooooooooooolong-extra",
            "user:has spaces in here!!",
            "user:AAAAAAAAAAAAAAAAAAAAA:novel:short",
            "user:AAAAAAAAAAAAAAAAAAAAA:volume:BBBBBBBBBBBBBBBBBBBBB",
            "useR:AAAAAAAAAAAAAAAAAAAAA",
        ] {
            assert_eq!(parse_store_id(id), ParsedStoreId::Unknown, "id: {id:?}");
        }
        assert_eq!(user_id_of("user:short"), None);
        assert_eq!(novel_id_of("user:short"), None);
        assert_eq!(user_store_id_of("garbage"), None);
    }

    #[test]
    fn test_store_file_name_is_prefix_friendly() {
        let user_id = new_id();
        let novel_id = new_id();
        let user_file = store_file_name(&make_user_store_id(&user_id));
        let novel_file = store_file_name(&make_novel_store_id(&user_id, &novel_id));

        assert!(user_file.ends_with(".redb"));
        assert!(novel_file.starts_with(&format!("user-{user_id}-novel-")));
        assert!(!novel_file.contains(':'));
    }
}
