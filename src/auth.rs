//! Authorization boundary
//!
//! Session issuance lives outside this system; the server only consumes
//! an oracle mapping forwarded credentials to a session. Every sync
//! request independently re-derives the expected owner from the store or
//! room id and compares it to the session's user id — the result is
//! never cached across requests.

use std::collections::HashMap;
use std::path::Path;

use folio_core::{user_id_of, DeniedKind, SyncError, SyncResult};

/// A resolved session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
}

/// External auth oracle: credentials in, session out
pub trait AuthOracle: Send + Sync {
    /// Resolve a session from a forwarded token; `None` if invalid
    fn session(&self, token: &str) -> Option<Session>;
}

/// Token table loaded from a JSON file (`{"<token>": "<user_id>"}`)
#[derive(Debug, Default)]
pub struct TokenTable {
    tokens: HashMap<String, String>,
}

impl TokenTable {
    /// Load the table from a JSON file
    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let data = std::fs::read(path)?;
        let tokens: HashMap<String, String> =
            serde_json::from_slice(&data).map_err(|e| SyncError::Serialization(e.to_string()))?;
        Ok(Self { tokens })
    }

    /// Build a table from `(token, user_id)` pairs
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(t, u)| (t.into(), u.into()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl AuthOracle for TokenTable {
    fn session(&self, token: &str) -> Option<Session> {
        self.tokens.get(token).map(|user_id| Session {
            user_id: user_id.clone(),
        })
    }
}

/// The per-request auth gate.
///
/// Resolves a session from the token, derives the expected owner from
/// the store/room id, and refuses on any mismatch. A malformed id has no
/// owner and is refused as `AccessDenied` by policy, never a crash.
pub fn authorize(
    auth: &dyn AuthOracle,
    token: &str,
    store_or_room_id: &str,
) -> Result<Session, DeniedKind> {
    let session = auth.session(token).ok_or(DeniedKind::Unauthorized)?;
    let expected_owner = user_id_of(store_or_room_id).ok_or(DeniedKind::AccessDenied)?;
    if session.user_id != expected_owner {
        return Err(DeniedKind::AccessDenied);
    }
    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{make_user_store_id, new_id};

    #[test]
    fn test_token_table_resolves_sessions() {
        let table = TokenTable::from_pairs([("tok-1", "user-a"), ("tok-2", "user-b")]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.session("tok-1").unwrap().user_id, "user-a");
        assert!(table.session("tok-3").is_none());
    }

    #[test]
    fn test_authorize_owner() {
        let user_id = new_id();
        let table = TokenTable::from_pairs([("tok".to_string(), user_id.clone())]);
        let store_id = make_user_store_id(&user_id);

        let session = authorize(&table, "tok", store_id.as_str()).unwrap();
        assert_eq!(session.user_id, user_id);
    }

    #[test]
    fn test_authorize_rejects_missing_session() {
        let table = TokenTable::default();
        let store_id = make_user_store_id(&new_id());
        assert_eq!(
            authorize(&table, "nope", store_id.as_str()),
            Err(DeniedKind::Unauthorized)
        );
    }

    #[test]
    fn test_authorize_rejects_wrong_tenant() {
        let table = TokenTable::from_pairs([("tok".to_string(), new_id())]);
        let store_id = make_user_store_id(&new_id());
        assert_eq!(
            authorize(&table, "tok", store_id.as_str()),
            Err(DeniedKind::AccessDenied)
        );
    }

    #[test]
    fn test_authorize_rejects_malformed_id() {
        let user_id = new_id();
        let table = TokenTable::from_pairs([("tok".to_string(), user_id)]);
        assert_eq!(
            authorize(&table, "tok", "not-a-store-id"),
            Err(DeniedKind::AccessDenied)
        );
    }
}
