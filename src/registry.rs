//! Session registry: one sandbox and EFSM record per session identifier.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::sync::{Mutex, RwLock};

use crate::config::ExecutionLimits;
use crate::efsm::Session;
use crate::error::{Error, Result};
use crate::model::ModelClient;
use crate::sandbox::{CapabilitySet, SandboxEnvironment};

/// Opaque context supplied when a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "lowercase")]
pub enum ContextBlob {
    /// Plain text, bound as a string.
    Text(String),
    /// A JSON document, bound as frozen containers.
    Json(serde_json::Value),
}

impl ContextBlob {
    fn file_name(&self) -> &'static str {
        match self {
            ContextBlob::Text(_) => "context.txt",
            ContextBlob::Json(_) => "context.json",
        }
    }

    /// Writes the blob into `dir` and returns the file path.
    pub fn stage(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name());
        match self {
            ContextBlob::Text(text) => std::fs::write(&path, text)?,
            ContextBlob::Json(json) => std::fs::write(&path, serde_json::to_vec_pretty(json)?)?,
        }
        Ok(path)
    }

    /// Reads a staged blob back, choosing the form by file extension.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Ok(ContextBlob::Json(serde_json::from_str(&text)?)),
            _ => Ok(ContextBlob::Text(text)),
        }
    }
}

/// Initial contents of a new session's namespace.
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    pub context: Option<ContextBlob>,
    pub locals: serde_json::Map<String, serde_json::Value>,
    /// Save each execution to the artifact sink.
    pub artifacts_enabled: bool,
}

/// A registered session: its EFSM record plus lazily created sandbox.
pub struct SessionSlot {
    pub session: Session,
    /// Stdout of the last execution.
    pub last_output: String,
    /// Stderr of the last execution or rejection.
    pub last_error: String,
    seed: SessionSeed,
    sandbox: Option<Arc<StdMutex<SandboxEnvironment>>>,
    staging: Option<TempDir>,
    caps: CapabilitySet,
    limits: ExecutionLimits,
    model: Option<Arc<dyn ModelClient>>,
}

impl SessionSlot {
    /// Returns the session's sandbox, creating it on first use.
    pub fn sandbox(&mut self) -> Result<Arc<StdMutex<SandboxEnvironment>>> {
        if let Some(sandbox) = &self.sandbox {
            return Ok(Arc::clone(sandbox));
        }

        let mut sandbox = SandboxEnvironment::new(self.caps.clone(), self.limits);
        sandbox.set_model(self.model.clone());

        if let Some(context) = &self.seed.context {
            let dir = tempfile::Builder::new().prefix("gated-repl-").tempdir()?;
            let path = context.stage(dir.path())?;
            let staged = ContextBlob::load(&path)?;
            let bound = match &staged {
                ContextBlob::Text(text) => sandbox.bind_context_text(text),
                ContextBlob::Json(json) => sandbox.bind_context_json(json),
            };
            bound.map_err(|fault| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("context could not be bound: {}", fault),
                ))
            })?;
            tracing::debug!(session_id = %self.session.id(), path = %path.display(), "Staged session context");
            self.staging = Some(dir);
        }

        for (name, value) in &self.seed.locals {
            if let Err(fault) = sandbox.set_variable(name, value) {
                tracing::warn!(session_id = %self.session.id(), name = %name, error = %fault, "Skipping seeded variable");
            }
        }

        let sandbox = Arc::new(StdMutex::new(sandbox));
        self.sandbox = Some(Arc::clone(&sandbox));
        tracing::info!(session_id = %self.session.id(), "Created session sandbox");
        Ok(sandbox)
    }

    /// Returns true while a sandbox is allocated.
    pub fn has_sandbox(&self) -> bool {
        self.sandbox.is_some()
    }

    /// Directory holding the staged context, while allocated.
    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging.as_ref().map(|d| d.path())
    }

    pub fn context(&self) -> Option<&ContextBlob> {
        self.seed.context.as_ref()
    }

    pub fn artifacts_enabled(&self) -> bool {
        self.seed.artifacts_enabled
    }

    /// Runs `f` against the sandbox if one exists.
    pub fn with_sandbox<T>(&self, f: impl FnOnce(&SandboxEnvironment) -> T) -> Option<T> {
        let sandbox = self.sandbox.as_ref()?;
        let guard = sandbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Some(f(&guard))
    }

    /// Drops the sandbox and removes the staging directory.
    fn release(&mut self) {
        self.sandbox = None;
        if let Some(dir) = self.staging.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(session_id = %self.session.id(), path = %path.display(), error = %e, "Failed to remove context staging dir");
            }
        }
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// Maps session identifiers to their slots.
///
/// Each slot sits behind its own async mutex, which serializes operations
/// on one session while distinct sessions proceed in parallel.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionSlot>>>>,
    caps: CapabilitySet,
    limits: ExecutionLimits,
    model: Option<Arc<dyn ModelClient>>,
}

impl SessionRegistry {
    pub fn new(caps: CapabilitySet, limits: ExecutionLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            caps,
            limits,
            model: None,
        }
    }

    /// Attaches the model client handed to every new sandbox.
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Registers a session. The sandbox is created on first use.
    pub async fn create(&self, session: Session, seed: SessionSeed) -> Result<Arc<Mutex<SessionSlot>>> {
        let mut sessions = self.sessions.write().await;
        let id = session.id().to_string();
        if sessions.contains_key(&id) {
            return Err(Error::SessionExists(id));
        }
        let slot = Arc::new(Mutex::new(self.slot(session, seed)));
        sessions.insert(id.clone(), Arc::clone(&slot));
        tracing::info!(session_id = %id, "Registered session");
        Ok(slot)
    }

    /// Returns the slot for `id`, registering it via `make` if absent.
    pub async fn get_or_create(
        &self,
        id: &str,
        make: impl FnOnce() -> (Session, SessionSeed),
    ) -> Arc<Mutex<SessionSlot>> {
        let mut sessions = self.sessions.write().await;
        if let Some(slot) = sessions.get(id) {
            return Arc::clone(slot);
        }
        let (session, seed) = make();
        let slot = Arc::new(Mutex::new(self.slot(session, seed)));
        sessions.insert(id.to_string(), Arc::clone(&slot));
        tracing::info!(session_id = %id, "Registered session");
        slot
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Mutex<SessionSlot>>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownSession(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Releases a session's sandbox and staged context but keeps its record.
    pub async fn teardown(&self, id: &str) -> Result<()> {
        let slot = self.get(id).await?;
        let mut slot = slot.lock().await;
        slot.release();
        tracing::info!(session_id = %id, state = %slot.session.state(), "Tore down session sandbox");
        Ok(())
    }

    /// Removes a session entirely.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let slot = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
        slot.lock().await.release();
        tracing::info!(session_id = %id, "Removed session");
        Ok(())
    }

    fn slot(&self, session: Session, seed: SessionSeed) -> SessionSlot {
        SessionSlot {
            session,
            last_output: String::new(),
            last_error: String::new(),
            seed,
            sandbox: None,
            staging: None,
            caps: self.caps.clone(),
            limits: self.limits,
            model: self.model.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityLevel;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(CapabilitySet::all(), ExecutionLimits::default())
    }

    fn session(id: &str) -> Session {
        Session::new(id, SecurityLevel::Basic, 10)
    }

    #[tokio::test]
    async fn sandbox_is_created_lazily() {
        let registry = registry();
        let slot = registry.create(session("s1"), SessionSeed::default()).await.unwrap();
        let mut slot = slot.lock().await;
        assert!(!slot.has_sandbox());

        let sandbox = slot.sandbox().unwrap();
        assert!(slot.has_sandbox());
        let again = slot.sandbox().unwrap();
        assert!(Arc::ptr_eq(&sandbox, &again));
    }

    #[tokio::test]
    async fn duplicate_and_unknown_sessions_are_errors() {
        let registry = registry();
        registry.create(session("s1"), SessionSeed::default()).await.unwrap();
        assert!(matches!(
            registry.create(session("s1"), SessionSeed::default()).await,
            Err(Error::SessionExists(_))
        ));
        assert!(matches!(registry.get("nope").await, Err(Error::UnknownSession(_))));
    }

    #[tokio::test]
    async fn get_or_create_only_builds_once() {
        let registry = registry();
        let first = registry
            .get_or_create("s1", || (session("s1"), SessionSeed::default()))
            .await;
        let second = registry
            .get_or_create("s1", || panic!("must not rebuild"))
            .await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn context_is_staged_and_removed_on_teardown() {
        let registry = registry();
        let seed = SessionSeed {
            context: Some(ContextBlob::Json(serde_json::json!({"n": 3}))),
            ..SessionSeed::default()
        };
        let slot = registry.create(session("s1"), seed).await.unwrap();

        let staged = {
            let mut slot = slot.lock().await;
            let sandbox = slot.sandbox().unwrap();
            let result = sandbox.lock().unwrap().execute("context['n'] * 2");
            assert_eq!(result.stdout, "6\n");
            let dir = slot.staging_dir().unwrap().to_path_buf();
            assert!(dir.join("context.json").exists());
            dir
        };

        registry.teardown("s1").await.unwrap();
        assert!(!staged.exists());
        assert!(!slot.lock().await.has_sandbox());
        assert!(registry.contains("s1").await);
    }

    #[tokio::test]
    async fn seeded_locals_are_bound() {
        let registry = registry();
        let mut locals = serde_json::Map::new();
        locals.insert("rows".to_string(), serde_json::json!([1, 2, 3]));
        locals.insert("context".to_string(), serde_json::json!("ignored"));
        let seed = SessionSeed {
            context: Some(ContextBlob::Text("hello".to_string())),
            locals,
            artifacts_enabled: false,
        };
        let slot = registry.create(session("s1"), seed).await.unwrap();
        let mut slot = slot.lock().await;
        let sandbox = slot.sandbox().unwrap();
        let mut sandbox = sandbox.lock().unwrap();
        assert_eq!(sandbox.execute("len(rows)").stdout, "3\n");
        assert_eq!(sandbox.execute("context").stdout, "'hello'\n");
    }

    #[tokio::test]
    async fn sessions_do_not_share_namespaces() {
        let registry = registry();
        let a = registry.create(session("a"), SessionSeed::default()).await.unwrap();
        let b = registry.create(session("b"), SessionSeed::default()).await.unwrap();

        let sandbox_a = a.lock().await.sandbox().unwrap();
        sandbox_a.lock().unwrap().execute("x = 1");
        let sandbox_b = b.lock().await.sandbox().unwrap();
        let result = sandbox_b.lock().unwrap().execute("x");
        assert!(!result.success);
    }

    #[tokio::test]
    async fn remove_forgets_the_session() {
        let registry = registry();
        registry.create(session("s1"), SessionSeed::default()).await.unwrap();
        registry.remove("s1").await.unwrap();
        assert!(!registry.contains("s1").await);
        assert!(registry.remove("s1").await.is_err());
        assert!(registry.session_ids().await.is_empty());
    }
}
