//! Session-scoped key/value state store.
//!
//! The service mirrors each session's EFSM fields into a [`StateStore`]
//! under fixed keys so that an external orchestrator can observe them and
//! so a session can be resumed later.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;

/// Keys under which session fields are persisted.
pub mod keys {
    pub const STATE: &str = "repl_state";
    /// Only meaningful for the current review window.
    pub const PENDING_CODE: &str = "temp:repl_pending_code";
    pub const ITERATION: &str = "repl_iteration";
    pub const MAX_ITERATIONS: &str = "repl_max_iterations";
    /// Submissions accepted so far, including rejected ones.
    pub const SUBMISSIONS: &str = "repl_submissions";
    pub const CODE_HISTORY: &str = "repl_code_history";
    pub const SECURITY_LEVEL: &str = "repl_security_level";
    pub const FINAL_ANSWER: &str = "repl_final_answer";
    pub const LOCALS: &str = "repl_locals";
    pub const CONTEXT: &str = "repl_context";
    pub const LAST_OUTPUT: &str = "repl_last_output";
    pub const LAST_ERROR: &str = "repl_last_error";
    pub const ARTIFACT_ENABLED: &str = "repl_artifact_enabled";
}

/// Key/value storage scoped by session identifier.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Reads a value, returning `None` when the key was never set.
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Writes a value, replacing any previous one.
    async fn set(&self, session_id: &str, key: &str, value: serde_json::Value) -> Result<()>;

    /// Removes a single key.
    async fn remove(&self, session_id: &str, key: &str) -> Result<()>;

    /// Removes everything stored for a session.
    async fn clear(&self, session_id: &str) -> Result<()>;
}

/// In-process store, used by default and in tests.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    sessions: RwLock<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every key stored for a session.
    pub async fn dump(&self, session_id: &str) -> HashMap<String, serde_json::Value> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.get(key))
            .cloned())
    }

    async fn set(&self, session_id: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, session_id: &str, key: &str) -> Result<()> {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn values_are_scoped_by_session() {
        let store = MemoryStateStore::new();
        store.set("a", keys::STATE, json!("idle")).await.unwrap();
        store.set("b", keys::STATE, json!("complete")).await.unwrap();

        assert_eq!(store.get("a", keys::STATE).await.unwrap(), Some(json!("idle")));
        assert_eq!(store.get("b", keys::STATE).await.unwrap(), Some(json!("complete")));
        assert_eq!(store.get("c", keys::STATE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_and_clear() {
        let store = MemoryStateStore::new();
        store.set("a", keys::ITERATION, json!(3)).await.unwrap();
        store.set("a", keys::PENDING_CODE, json!("x = 1")).await.unwrap();

        store.remove("a", keys::PENDING_CODE).await.unwrap();
        assert_eq!(store.get("a", keys::PENDING_CODE).await.unwrap(), None);
        assert_eq!(store.dump("a").await.len(), 1);

        store.clear("a").await.unwrap();
        assert!(store.dump("a").await.is_empty());
    }

    #[test]
    fn usable_from_sync_code() {
        let store = MemoryStateStore::new();
        tokio_test::block_on(async {
            store.set("s", keys::FINAL_ANSWER, json!("42")).await.unwrap();
            assert_eq!(
                store.get("s", keys::FINAL_ANSWER).await.unwrap(),
                Some(json!("42"))
            );
        });
    }
}
