//! Session-level operations exposed to an orchestrator.
//!
//! [`ReplService`] ties the EFSM, security filter, session registry and
//! sandbox together. Every operation takes the session's slot lock for its
//! whole duration, so calls against one session are serialized while
//! distinct sessions run in parallel. Session fields are mirrored into the
//! [`StateStore`] after each operation; store and artifact failures are
//! logged and never fail an otherwise successful operation.
//!
//! An execution runs to completion on its own task once it has started. If
//! the caller stops waiting, the sandbox is told to cancel, and the task still
//! records the result and returns the session to IDLE.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::OwnedMutexGuard;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::artifact::{artifact_name, render_artifact, ArtifactSink};
use crate::config::{ReplConfig, Validate};
use crate::efsm::{HistoryEntry, ReplState, ReviewOutcome, Session};
use crate::error::{Error, Result};
use crate::extract::truncate_output;
use crate::model::ModelClient;
use crate::registry::{ContextBlob, SessionRegistry, SessionSeed, SessionSlot};
use crate::sandbox::{ExecutionResult, SandboxEnvironment};
use crate::security::{SecurityFilter, SecurityLevel};
use crate::store::{keys, MemoryStateStore, StateStore};

/// Options for opening a session. Unset fields fall back to the config.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Session identifier; a UUID is generated when absent.
    pub id: Option<String>,
    pub security_level: Option<SecurityLevel>,
    pub max_iterations: Option<u32>,
    /// Read-only context bound as `context`.
    pub context: Option<ContextBlob>,
    /// Variables pre-bound in the namespace.
    pub locals: serde_json::Map<String, Value>,
    pub artifacts_enabled: Option<bool>,
}

/// How a submission or review was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Ready to execute.
    Approved,
    /// Discarded; the session is idle again.
    Rejected,
    /// Waiting for [`ReplService::resolve_review`].
    PendingReview,
}

/// Result of [`ReplService::submit_code`] and [`ReplService::resolve_review`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub status: ReviewStatus,
    /// EFSM state after the call.
    pub state: ReplState,
    /// Submission number, used for audit naming.
    pub submission: u64,
    /// Rejection reason, or the filter's advisory verdict under STRICT.
    pub reason: Option<String>,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: ReplState,
    pub iteration: u32,
    pub max_iterations: u32,
    pub security_level: SecurityLevel,
    /// Variable names currently defined in the namespace.
    pub variables: Vec<String>,
    pub history_count: usize,
    /// Last stdout, truncated for preview.
    pub last_output: String,
    pub last_error: String,
    pub pending_code: Option<String>,
    pub final_answer: Option<String>,
}

/// What [`ReplService::finalize`] should record as the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalAnswer {
    /// Literal answer text.
    Text(String),
    /// Name of a namespace variable whose string form is the answer.
    Variable(String),
}

/// Result of [`ReplService::finalize`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeResponse {
    pub state: ReplState,
    pub answer: String,
}

/// Result of [`ReplService::run_code`].
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Code ran; inspect `success` for runtime faults.
    Executed(ExecutionResult),
    /// Code was refused and never ran.
    Rejected { reason: String, stderr: String },
    /// STRICT review is pending; the advisory verdict is attached.
    PendingReview { submission: u64, advisory: String },
}

/// Review-gated REPL over many sessions.
pub struct ReplService {
    config: ReplConfig,
    filter: SecurityFilter,
    registry: SessionRegistry,
    mirror: Mirror,
}

/// Where session fields and artifacts are written. Cloned into execution
/// tasks that outlive the caller.
#[derive(Clone)]
struct Mirror {
    store: Arc<dyn StateStore>,
    artifacts: Option<Arc<dyn ArtifactSink>>,
}

/// Sets the cancel flag when the caller's future is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

impl ReplService {
    /// Creates a service backed by an in-memory state store.
    ///
    /// Fails if the configuration does not validate; warnings are logged.
    pub fn new(config: ReplConfig) -> Result<Self> {
        for warning in config.validate().into_result()? {
            tracing::warn!(warning = %warning, "REPL config warning");
        }
        Ok(Self {
            filter: SecurityFilter::new(config.denylist.clone()),
            registry: SessionRegistry::new(config.capabilities.clone(), config.limits),
            mirror: Mirror {
                store: Arc::new(MemoryStateStore::new()),
                artifacts: None,
            },
            config,
        })
    }

    /// Uses `store` for persisted session fields.
    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.mirror.store = store;
        self
    }

    /// Saves executions to `sink` for sessions with artifacts enabled.
    pub fn with_artifact_sink(mut self, sink: Arc<dyn ArtifactSink>) -> Self {
        self.mirror.artifacts = Some(sink);
        self
    }

    /// Makes `model` reachable from sandboxed code as `llm_query`.
    ///
    /// Only sandboxes created after this call see the model.
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.registry = SessionRegistry::new(self.config.capabilities.clone(), self.config.limits)
            .with_model(model);
        self
    }

    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.mirror.store
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Opens a new session and returns its identifier.
    pub async fn open_session(&self, options: SessionOptions) -> Result<String> {
        let id = options
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (session, seed) = self.session_parts(&id, options);

        let slot = self.registry.create(session, seed).await?;
        let slot = slot.lock().await;
        self.persist_session(&slot).await;
        if let Some(context) = slot.context() {
            match serde_json::to_value(context) {
                Ok(value) => self.persist(&id, keys::CONTEXT, value).await,
                Err(e) => tracing::warn!(session_id = %id, error = %e, "Failed to encode context"),
            }
        }
        self.persist(&id, keys::ARTIFACT_ENABLED, json!(slot.artifacts_enabled())).await;

        tracing::info!(
            session_id = %id,
            level = %slot.session.security_level(),
            max_iterations = slot.session.max_iterations(),
            "Opened REPL session"
        );
        Ok(id)
    }

    /// Returns the session's snapshot, opening it with defaults on first use.
    pub async fn ensure_session(&self, id: &str) -> SessionSnapshot {
        let slot = self
            .registry
            .get_or_create(id, || {
                self.session_parts(
                    id,
                    SessionOptions {
                        id: Some(id.to_string()),
                        ..SessionOptions::default()
                    },
                )
            })
            .await;
        let slot = slot.lock().await;
        self.snapshot(&slot)
    }

    /// Rebuilds a session from the state store.
    ///
    /// The namespace is reseeded from the persisted locals; values that
    /// were only placeholders come back as their placeholder strings.
    pub async fn resume_session(&self, id: &str) -> Result<SessionSnapshot> {
        if self.registry.contains(id).await {
            return Err(Error::SessionExists(id.to_string()));
        }

        let state: ReplState = self
            .load(id, keys::STATE)
            .await?
            .ok_or_else(|| Error::UnknownSession(id.to_string()))?;
        let iteration: u32 = self.load(id, keys::ITERATION).await?.unwrap_or(0);
        let max_iterations: u32 = self
            .load(id, keys::MAX_ITERATIONS)
            .await?
            .unwrap_or(self.config.max_iterations);
        let level: SecurityLevel = self
            .load(id, keys::SECURITY_LEVEL)
            .await?
            .unwrap_or(self.config.security_level);
        let pending: Option<String> = self.load(id, keys::PENDING_CODE).await?;
        let history: Vec<HistoryEntry> = self.load(id, keys::CODE_HISTORY).await?.unwrap_or_default();
        let final_answer: Option<String> = self.load(id, keys::FINAL_ANSWER).await?;
        let submissions: Option<u64> = self.load(id, keys::SUBMISSIONS).await?;
        let seed = SessionSeed {
            context: self.load(id, keys::CONTEXT).await?,
            locals: self.load(id, keys::LOCALS).await?.unwrap_or_default(),
            artifacts_enabled: self
                .load(id, keys::ARTIFACT_ENABLED)
                .await?
                .unwrap_or(self.config.artifacts_enabled),
        };

        let session = Session::restore(
            id,
            state,
            iteration,
            max_iterations,
            level,
            pending,
            history,
            final_answer,
        );
        let session = match submissions {
            Some(count) => session.with_submissions(count),
            None => session,
        };
        let slot = self.registry.create(session, seed).await?;
        let mut slot = slot.lock().await;
        slot.last_output = self.load(id, keys::LAST_OUTPUT).await?.unwrap_or_default();
        slot.last_error = self.load(id, keys::LAST_ERROR).await?.unwrap_or_default();
        self.persist_session(&slot).await;

        tracing::info!(session_id = %id, state = %slot.session.state(), iteration, "Resumed REPL session");
        Ok(self.snapshot(&slot))
    }

    /// Destroys a session and everything persisted for it.
    pub async fn reset(&self, id: &str) -> Result<()> {
        self.registry.remove(id).await?;
        if let Err(e) = self.mirror.store.clear(id).await {
            tracing::warn!(session_id = %id, error = %e, "Failed to clear session state");
        }
        tracing::info!(session_id = %id, "Reset REPL session");
        Ok(())
    }

    /// Submits code for review.
    ///
    /// Under NONE and BASIC the review resolves immediately: clean code is
    /// approved and flagged code is rejected, recorded in `last_error` as
    /// `Security Error: <reason>`, and the session returns to IDLE. Under
    /// STRICT the session waits in PENDING_REVIEW with the filter verdict
    /// returned as advice.
    pub async fn submit_code(&self, id: &str, code: &str) -> Result<ReviewResponse> {
        let slot = self.registry.get(id).await?;
        let mut slot = slot.lock().await;

        let session = &mut slot.session;
        if !session.state().is_terminal() && session.iterations_exhausted() {
            return Err(Error::IterationLimit {
                limit: session.max_iterations(),
            });
        }
        let submission = session.submit(code)?;
        let level = session.security_level();
        let verdict = self.filter.check(code, level);
        tracing::debug!(session_id = %id, submission, allowed = verdict.allowed, "Code submitted");

        let response = if !level.auto_resolves() {
            tracing::info!(session_id = %id, submission, advisory = %verdict.reason, "Code awaiting review");
            ReviewResponse {
                status: ReviewStatus::PendingReview,
                state: slot.session.state(),
                submission,
                reason: Some(verdict.reason),
            }
        } else if verdict.allowed {
            slot.session.resolve_review(ReviewOutcome::Approve)?;
            tracing::info!(session_id = %id, submission, "Code approved");
            ReviewResponse {
                status: ReviewStatus::Approved,
                state: slot.session.state(),
                submission,
                reason: None,
            }
        } else {
            self.reject(&mut slot, verdict.reason.clone())?;
            ReviewResponse {
                status: ReviewStatus::Rejected,
                state: slot.session.state(),
                submission,
                reason: Some(verdict.reason),
            }
        };

        self.persist_session(&slot).await;
        Ok(response)
    }

    /// Applies an external reviewer's decision to pending code.
    pub async fn resolve_review(
        &self,
        id: &str,
        approve: bool,
        reason: Option<&str>,
    ) -> Result<ReviewResponse> {
        let slot = self.registry.get(id).await?;
        let mut slot = slot.lock().await;
        let submission = slot.session.submissions();

        let response = if approve {
            slot.session.resolve_review(ReviewOutcome::Approve)?;
            tracing::info!(session_id = %id, submission, "Code approved by reviewer");
            ReviewResponse {
                status: ReviewStatus::Approved,
                state: slot.session.state(),
                submission,
                reason: reason.map(str::to_string),
            }
        } else {
            let reason = reason.unwrap_or("Rejected by reviewer").to_string();
            self.reject(&mut slot, reason.clone())?;
            ReviewResponse {
                status: ReviewStatus::Rejected,
                state: slot.session.state(),
                submission,
                reason: Some(reason),
            }
        };

        self.persist_session(&slot).await;
        Ok(response)
    }

    /// Runs the approved code.
    ///
    /// Runtime faults are reported in the result, not as errors. Stdout is
    /// truncated to the configured length. Dropping the returned future
    /// cancels the run; the session still returns to IDLE once the sandbox
    /// stops.
    pub async fn execute(&self, id: &str) -> Result<ExecutionResult> {
        let slot = self.registry.get(id).await?;
        let mut slot = slot.lock_owned().await;

        let state = slot.session.state();
        if state != ReplState::Approved {
            return Err(Error::InvalidTransition {
                from: state,
                to: ReplState::Executing,
            });
        }
        let sandbox = slot.sandbox()?;
        let code = slot.session.begin_execution()?;

        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(Arc::clone(&cancel));
        let run = Execution {
            code,
            sandbox,
            cancel,
            mirror: self.mirror.clone(),
            truncation: self.config.output_truncation_chars,
        };
        tokio::spawn(run.finish(slot))
            .await
            .map_err(|e| Error::Execution(format!("execution task failed: {}", e)))?
    }

    /// Submits and, when the review resolves immediately, executes.
    pub async fn run_code(&self, id: &str, code: &str) -> Result<RunOutcome> {
        let response = self.submit_code(id, code).await?;
        match response.status {
            ReviewStatus::Approved => Ok(RunOutcome::Executed(self.execute(id).await?)),
            ReviewStatus::Rejected => {
                let reason = response.reason.unwrap_or_default();
                Ok(RunOutcome::Rejected {
                    stderr: format!("Security Error: {}", reason),
                    reason,
                })
            }
            ReviewStatus::PendingReview => Ok(RunOutcome::PendingReview {
                submission: response.submission,
                advisory: response.reason.unwrap_or_default(),
            }),
        }
    }

    /// Returns a snapshot of the session.
    ///
    /// Creates the sandbox if needed, so seeded variables are listed before
    /// the first execution.
    pub async fn get_state(&self, id: &str) -> Result<SessionSnapshot> {
        let slot = self.registry.get(id).await?;
        let mut slot = slot.lock().await;
        if !slot.session.state().is_terminal() {
            slot.sandbox()?;
        }
        Ok(self.snapshot(&slot))
    }

    /// Completes the session with a final answer and releases its sandbox.
    ///
    /// A variable name may be quoted; surrounding whitespace and quotes are
    /// stripped before lookup.
    pub async fn finalize(&self, id: &str, answer: FinalAnswer) -> Result<FinalizeResponse> {
        let slot_ref = self.registry.get(id).await?;
        let mut slot = slot_ref.lock().await;

        let answer = match answer {
            FinalAnswer::Text(text) => text,
            FinalAnswer::Variable(name) => {
                let name = name
                    .trim()
                    .trim_matches(|c| c == '"' || c == '\'')
                    .to_string();
                if !slot.session.state().is_terminal() {
                    slot.sandbox()?;
                }
                let rendered = slot
                    .with_sandbox(|sandbox| {
                        if sandbox.has_variable(&name) {
                            sandbox.render_variable(&name)
                        } else {
                            None
                        }
                    })
                    .flatten();
                match rendered {
                    Some(value) => value,
                    None => {
                        let available = slot
                            .with_sandbox(|sandbox| sandbox.variable_names())
                            .unwrap_or_default();
                        return Err(Error::UnknownVariable { name, available });
                    }
                }
            }
        };

        slot.session.force_complete(answer.clone())?;
        self.persist_session(&slot).await;
        let response = FinalizeResponse {
            state: slot.session.state(),
            answer,
        };
        tracing::info!(session_id = %id, iteration = slot.session.iteration(), "Session finalized");
        drop(slot);

        self.registry.teardown(id).await?;
        Ok(response)
    }

    fn session_parts(&self, id: &str, options: SessionOptions) -> (Session, SessionSeed) {
        let session = Session::new(
            id,
            options.security_level.unwrap_or(self.config.security_level),
            options.max_iterations.unwrap_or(self.config.max_iterations),
        );
        let seed = SessionSeed {
            context: options.context,
            locals: options.locals,
            artifacts_enabled: options
                .artifacts_enabled
                .unwrap_or(self.config.artifacts_enabled),
        };
        (session, seed)
    }

    fn reject(&self, slot: &mut SessionSlot, reason: String) -> Result<()> {
        slot.session.resolve_review(ReviewOutcome::Reject {
            reason: reason.clone(),
        })?;
        let rejection = slot.session.reject_with_reason(None)?;
        slot.last_error = format!("Security Error: {}", rejection.reason);
        tracing::info!(session_id = %slot.session.id(), reason = %reason, "Code rejected");
        Ok(())
    }

    fn snapshot(&self, slot: &SessionSlot) -> SessionSnapshot {
        let session = &slot.session;
        SessionSnapshot {
            session_id: session.id().to_string(),
            state: session.state(),
            iteration: session.iteration(),
            max_iterations: session.max_iterations(),
            security_level: session.security_level(),
            variables: slot
                .with_sandbox(|sandbox| sandbox.variable_names())
                .unwrap_or_default(),
            history_count: session.history().len(),
            last_output: truncate_output(&slot.last_output, self.config.state_output_preview_chars),
            last_error: slot.last_error.clone(),
            pending_code: session.pending_code().map(str::to_string),
            final_answer: session.final_answer().map(str::to_string),
        }
    }

    async fn load<T: serde::de::DeserializeOwned>(&self, id: &str, key: &str) -> Result<Option<T>> {
        match self.mirror.store.get(id, key).await? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    async fn persist(&self, id: &str, key: &str, value: Value) {
        self.mirror.persist(id, key, value).await
    }

    async fn persist_session(&self, slot: &SessionSlot) {
        self.mirror.persist_session(slot).await
    }
}

/// An approved submission handed to its own task.
struct Execution {
    code: String,
    sandbox: Arc<StdMutex<SandboxEnvironment>>,
    cancel: Arc<AtomicBool>,
    mirror: Mirror,
    truncation: usize,
}

impl Execution {
    /// Runs the code on a blocking worker and records the result. Holds the
    /// slot lock until the session is back in IDLE.
    async fn finish(self, mut slot: OwnedMutexGuard<SessionSlot>) -> Result<ExecutionResult> {
        let id = slot.session.id().to_string();
        self.mirror.persist(&id, keys::STATE, json!(slot.session.state())).await;

        let worker_code = self.code.clone();
        let sandbox = self.sandbox;
        let cancel = self.cancel;
        let mut result = tokio::task::spawn_blocking(move || {
            let mut sandbox = sandbox.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            sandbox.execute_cancellable(&worker_code, cancel)
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(session_id = %id, error = %e, "Sandbox worker failed");
            ExecutionResult::failed(format!("RuntimeError: execution worker failed: {}", e))
        });
        result.stdout = truncate_output(&result.stdout, self.truncation);

        let iteration = slot.session.finish_execution(
            self.code.clone(),
            result.stdout.clone(),
            result.stderr.clone(),
        )?;
        slot.last_output = result.stdout.clone();
        slot.last_error = result.stderr.clone();

        tracing::info!(
            session_id = %id,
            iteration,
            success = result.success,
            steps = result.steps,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Execution finished"
        );

        if slot.artifacts_enabled() {
            self.mirror.save_artifact(&slot, &self.code, &result).await;
        }
        self.mirror.persist_session(&slot).await;
        self.mirror
            .persist(&id, keys::LOCALS, Value::Object(result.namespace.clone()))
            .await;
        Ok(result)
    }
}

impl Mirror {
    async fn persist(&self, id: &str, key: &str, value: Value) {
        if let Err(e) = self.store.set(id, key, value).await {
            tracing::warn!(session_id = %id, key = %key, error = %e, "Failed to persist session field");
        }
    }

    /// Mirrors the EFSM fields into the state store.
    async fn persist_session(&self, slot: &SessionSlot) {
        let session = &slot.session;
        let id = session.id();
        let history = serde_json::to_value(session.history()).unwrap_or_else(|e| {
            tracing::warn!(session_id = %id, error = %e, "Failed to encode code history");
            Value::Array(Vec::new())
        });

        self.persist(id, keys::STATE, json!(session.state())).await;
        self.persist(id, keys::ITERATION, json!(session.iteration())).await;
        self.persist(id, keys::MAX_ITERATIONS, json!(session.max_iterations())).await;
        self.persist(id, keys::SUBMISSIONS, json!(session.submissions())).await;
        self.persist(id, keys::SECURITY_LEVEL, json!(session.security_level())).await;
        self.persist(id, keys::CODE_HISTORY, history).await;
        self.persist(id, keys::LAST_OUTPUT, json!(slot.last_output)).await;
        self.persist(id, keys::LAST_ERROR, json!(slot.last_error)).await;

        match session.pending_code() {
            Some(code) => self.persist(id, keys::PENDING_CODE, json!(code)).await,
            None => {
                if let Err(e) = self.store.remove(id, keys::PENDING_CODE).await {
                    tracing::warn!(session_id = %id, error = %e, "Failed to clear pending code");
                }
            }
        }
        if let Some(answer) = session.final_answer() {
            self.persist(id, keys::FINAL_ANSWER, json!(answer)).await;
        }
    }

    async fn save_artifact(&self, slot: &SessionSlot, code: &str, result: &ExecutionResult) {
        let Some(sink) = &self.artifacts else {
            return;
        };
        let session = &slot.session;
        let iteration = session
            .history()
            .last()
            .map(|entry| entry.iteration)
            .unwrap_or_default();
        let name = artifact_name(session.submissions());
        let content = render_artifact(iteration, code, result).into_bytes();
        match sink.save_artifact(session.id(), &name, content).await {
            Ok(version) => {
                tracing::debug!(session_id = %session.id(), name = %name, version, "Saved code artifact")
            }
            Err(e) => {
                tracing::warn!(session_id = %session.id(), name = %name, error = %e, "Failed to save code artifact")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactSink;
    use crate::model::{FnModelClient, ModelError};
    use async_trait::async_trait;
    use std::fmt::Write as _;

    fn service() -> ReplService {
        ReplService::new(ReplConfig::default()).unwrap()
    }

    async fn open(service: &ReplService, level: SecurityLevel) -> String {
        service
            .open_session(SessionOptions {
                security_level: Some(level),
                ..SessionOptions::default()
            })
            .await
            .unwrap()
    }

    struct FailingStore;

    #[async_trait]
    impl StateStore for FailingStore {
        async fn get(&self, _: &str, _: &str) -> Result<Option<Value>> {
            Err(Error::StateStore("offline".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Value) -> Result<()> {
            Err(Error::StateStore("offline".into()))
        }
        async fn remove(&self, _: &str, _: &str) -> Result<()> {
            Err(Error::StateStore("offline".into()))
        }
        async fn clear(&self, _: &str) -> Result<()> {
            Err(Error::StateStore("offline".into()))
        }
    }

    #[tokio::test]
    async fn basic_submission_is_approved_immediately() {
        let service = service();
        let id = open(&service, SecurityLevel::Basic).await;

        let response = service.submit_code(&id, "1 + 1").await.unwrap();
        assert_eq!(response.status, ReviewStatus::Approved);
        assert_eq!(response.state, ReplState::Approved);
        assert_eq!(response.submission, 1);

        let result = service.execute(&id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "2\n");
        assert_eq!(service.get_state(&id).await.unwrap().state, ReplState::Idle);
    }

    #[tokio::test]
    async fn execute_requires_approval() {
        let service = service();
        let id = open(&service, SecurityLevel::Basic).await;
        assert!(matches!(
            service.execute(&id).await,
            Err(Error::InvalidTransition { from: ReplState::Idle, to: ReplState::Executing })
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let service = service();
        assert!(matches!(
            service.submit_code("missing", "1").await,
            Err(Error::UnknownSession(_))
        ));
        assert!(matches!(service.get_state("missing").await, Err(Error::UnknownSession(_))));
    }

    #[tokio::test]
    async fn strict_rejection_records_reason() {
        let service = service();
        let id = open(&service, SecurityLevel::Strict).await;

        let response = service.submit_code(&id, "x = 1").await.unwrap();
        assert_eq!(response.status, ReviewStatus::PendingReview);
        assert_eq!(response.reason.as_deref(), Some("Code passed security checks"));

        let review = service.resolve_review(&id, false, Some("not today")).await.unwrap();
        assert_eq!(review.status, ReviewStatus::Rejected);
        assert_eq!(review.state, ReplState::Idle);

        let state = service.get_state(&id).await.unwrap();
        assert_eq!(state.last_error, "Security Error: not today");
        assert_eq!(state.iteration, 0);
        assert!(state.pending_code.is_none());
    }

    #[tokio::test]
    async fn truncates_long_output() {
        let config = ReplConfig {
            output_truncation_chars: 10,
            state_output_preview_chars: 4,
            ..ReplConfig::default()
        };
        let service = ReplService::new(config).unwrap();
        let id = open(&service, SecurityLevel::None).await;

        match service.run_code(&id, "print('x' * 25)").await.unwrap() {
            RunOutcome::Executed(result) => {
                assert_eq!(result.stdout, "xxxxxxxxxx\n... [truncated, 16 chars omitted]");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let state = service.get_state(&id).await.unwrap();
        assert!(state.last_output.starts_with("xxxx\n... [truncated"));
    }

    #[tokio::test]
    async fn artifacts_are_saved_per_submission() {
        let sink = Arc::new(MemoryArtifactSink::new());
        let service = service().with_artifact_sink(sink.clone());
        let id = service
            .open_session(SessionOptions {
                artifacts_enabled: Some(true),
                ..SessionOptions::default()
            })
            .await
            .unwrap();

        service.run_code(&id, "print('hi')").await.unwrap();
        service.run_code(&id, "y = 2").await.unwrap();

        assert_eq!(
            sink.names(&id).await,
            vec!["repl_code_0001.txt".to_string(), "repl_code_0002.txt".to_string()]
        );
        let first = String::from_utf8(sink.latest(&id, "repl_code_0001.txt").await.unwrap()).unwrap();
        assert!(first.starts_with("# REPL Execution - Iteration 0\n"));
        assert!(first.contains("# stdout:\n# hi\n"));
    }

    #[tokio::test]
    async fn store_failures_do_not_fail_execution() {
        let service = service().with_store(Arc::new(FailingStore));
        let id = open(&service, SecurityLevel::Basic).await;

        match service.run_code(&id, "x = 5\nx + 1").await.unwrap() {
            RunOutcome::Executed(result) => {
                assert!(result.success);
                assert_eq!(result.stdout, "6\n");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn model_output_stays_on_secondary_channel() {
        let model = FnModelClient(|prompt: &str, out: &mut dyn std::fmt::Write| {
            let _ = write!(out, "thinking about {}", prompt);
            Ok::<_, ModelError>(format!("echo: {}", prompt))
        });
        let service = service().with_model(Arc::new(model));
        let id = open(&service, SecurityLevel::Basic).await;

        match service.run_code(&id, "llm_query('ping')").await.unwrap() {
            RunOutcome::Executed(result) => assert_eq!(result.stdout, "'echo: ping'\n"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn ensure_session_uses_config_defaults() {
        let service = service();
        let snapshot = service.ensure_session("fixed").await;
        assert_eq!(snapshot.session_id, "fixed");
        assert_eq!(snapshot.security_level, SecurityLevel::Basic);
        assert_eq!(snapshot.max_iterations, 20);
        assert!(service.registry().contains("fixed").await);
    }

    #[test]
    fn invalid_config_is_refused() {
        let config = ReplConfig {
            max_iterations: 0,
            ..ReplConfig::default()
        };
        assert!(matches!(ReplService::new(config), Err(Error::Config(_))));
    }
}
