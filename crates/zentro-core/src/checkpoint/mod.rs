//! Durable, versioned session state.
//!
//! A `CheckpointRecord` is the full snapshot of one session: its turns plus
//! the scratch state the orchestrator needs to resume. Stores keep records
//! per session key under a strictly increasing version; only the latest
//! version is consulted on resume.

pub mod file;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{CheckpointBackend, CheckpointConfig};
use crate::core::turn::{SessionKey, Turn, timestamp};
use crate::domain::UserId;
use crate::error::CheckpointError;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

/// Current on-disk record layout.
pub const SCHEMA_VERSION: u32 = 2;

/// Orchestration state carried between turns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scratch {
    /// Session title, set from the first user message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Acting user resolved from the session key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub schema_version: u32,
    pub session_key: SessionKey,
    pub version: u64,
    pub turns: Vec<Turn>,
    #[serde(default)]
    pub scratch: Scratch,
    pub saved_at: String,
}

impl CheckpointRecord {
    /// State of a session that has never been saved (version 0).
    pub fn empty(key: &SessionKey) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            session_key: key.clone(),
            version: 0,
            turns: Vec::new(),
            scratch: Scratch {
                title: None,
                user_id: key.user_id(),
            },
            saved_at: String::new(),
        }
    }

    /// The next version of this record with `turn` appended.
    #[must_use]
    pub fn successor(&self, turn: Turn, scratch: Scratch) -> Self {
        let mut turns = self.turns.clone();
        turns.push(turn);
        Self {
            schema_version: SCHEMA_VERSION,
            session_key: self.session_key.clone(),
            version: self.version + 1,
            turns,
            scratch,
            saved_at: timestamp(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CheckpointError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parses a stored record, upgrading older layouts.
    pub fn decode(bytes: &[u8]) -> Result<Self, CheckpointError> {
        let mut raw: Value = serde_json::from_slice(bytes)?;
        let schema = match raw.get("schema_version") {
            None => 1,
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or(CheckpointError::UnsupportedSchema(0))?,
        };

        match schema {
            1 => migrate_v1(&mut raw),
            SCHEMA_VERSION => {}
            other => return Err(CheckpointError::UnsupportedSchema(other)),
        }
        Ok(serde_json::from_value(raw)?)
    }
}

/// v1 records used `key` for the session key and had no scratch state.
fn migrate_v1(raw: &mut Value) {
    let Some(object) = raw.as_object_mut() else {
        return;
    };
    if let Some(key) = object.remove("key") {
        object.insert("session_key".to_string(), key);
    }
    let user_id = object
        .get("session_key")
        .and_then(Value::as_str)
        .and_then(|k| SessionKey::parse(k).ok())
        .and_then(|k| k.user_id());
    object
        .entry("scratch")
        .or_insert_with(|| serde_json::json!({ "user_id": user_id }));
    object.insert("schema_version".to_string(), SCHEMA_VERSION.into());
}

/// Checks the store-side invariants for saving `record` under `key` when the
/// latest persisted version is `latest` (0 if none).
pub(crate) fn check_save(
    key: &SessionKey,
    latest: u64,
    record: &CheckpointRecord,
) -> Result<(), CheckpointError> {
    if &record.session_key != key {
        return Err(CheckpointError::InvalidKey {
            key: key.to_string(),
            reason: "record belongs to another session",
        });
    }
    if record.version != latest + 1 {
        return Err(CheckpointError::VersionConflict {
            key: key.to_string(),
            expected: latest + 1,
            actual: record.version,
        });
    }
    Ok(())
}

/// Durable keyed store of session state.
///
/// Implementations own one long-lived connection and must tolerate
/// concurrent calls for different keys. Same-key serialization is the
/// caller's job; `save` still rejects out-of-order versions.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Latest record for `key`, or `None` for a session never saved.
    async fn load(&self, key: &SessionKey) -> Result<Option<CheckpointRecord>, CheckpointError>;

    /// Persists `record` as the new latest version. Durable on `Ok`; on
    /// error the previous version is intact.
    async fn save(&self, key: &SessionKey, record: &CheckpointRecord)
    -> Result<(), CheckpointError>;

    /// Releases the connection. Idempotent.
    async fn close(&self) -> Result<(), CheckpointError>;
}

/// Builds the configured store. Nothing is opened until first use.
pub fn from_config(config: &CheckpointConfig) -> Arc<dyn CheckpointStore> {
    match config.backend {
        CheckpointBackend::File => Arc::new(FileCheckpointStore::new(
            config.effective_dir(),
            config.effective_retain_versions(),
        )),
        CheckpointBackend::Memory => Arc::new(MemoryCheckpointStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::turn::PendingTurn;

    fn key(raw: &str) -> SessionKey {
        SessionKey::parse(raw).unwrap()
    }

    #[test]
    fn test_successor_appends_and_bumps_version() {
        let empty = CheckpointRecord::empty(&key("3:abc"));
        assert_eq!(empty.scratch.user_id, Some(3));

        let next = empty.successor(PendingTurn::new("hi").complete("hello".into()), Scratch::default());
        assert_eq!(next.version, 1);
        assert_eq!(next.turns.len(), 1);
        assert!(empty.turns.is_empty());
    }

    #[test]
    fn test_decode_migrates_v1_layout() {
        let v1 = json!({
            "key": "4:thread",
            "version": 2,
            "turns": [],
            "saved_at": "2025-01-01T00:00:00Z"
        });
        let record = CheckpointRecord::decode(&serde_json::to_vec(&v1).unwrap()).unwrap();
        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert_eq!(record.session_key.as_str(), "4:thread");
        assert_eq!(record.version, 2);
        assert_eq!(record.scratch.user_id, Some(4));
    }

    #[test]
    fn test_decode_rejects_future_schema() {
        let raw = json!({"schema_version": 9, "session_key": "api", "version": 1, "turns": [], "saved_at": ""});
        let err = CheckpointRecord::decode(&serde_json::to_vec(&raw).unwrap()).unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedSchema(9)));
    }

    #[test]
    fn test_decode_rejects_unsafe_key() {
        let raw = json!({"schema_version": 2, "session_key": "../x", "version": 1, "turns": [], "saved_at": ""});
        assert!(CheckpointRecord::decode(&serde_json::to_vec(&raw).unwrap()).is_err());
    }

    #[test]
    fn test_check_save_requires_next_version() {
        let k = key("api");
        let record = CheckpointRecord::empty(&k).successor(
            PendingTurn::new("a").complete("b".into()),
            Scratch::default(),
        );
        assert!(check_save(&k, 0, &record).is_ok());
        assert!(matches!(
            check_save(&k, 1, &record),
            Err(CheckpointError::VersionConflict { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            check_save(&key("other"), 0, &record),
            Err(CheckpointError::InvalidKey { .. })
        ));
    }
}
