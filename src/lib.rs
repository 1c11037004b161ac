//! Gated REPL - review-gated, stateful code evaluation sessions
//!
//! This library lets an orchestrator submit code snippets into per-session
//! namespaces, gate each submission through a review step, and execute the
//! approved code in a capability-restricted sandbox with interactive-shell
//! auto-printing. Model callbacks write to a secondary output channel that
//! never reaches the primary caller.

pub mod artifact;
pub mod config;
pub mod efsm;
pub mod error;
pub mod extract;
pub mod model;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod security;
pub mod service;
pub mod store;

pub use error::{Error, Result};

pub use artifact::{artifact_name, render_artifact, ArtifactSink, MemoryArtifactSink};
pub use config::{ExecutionLimits, ReplConfig, Validate, ValidationResult};
pub use efsm::{HistoryEntry, Rejection, ReplState, ReviewOutcome, Session};
pub use extract::{check_for_final_answer, find_code_blocks, truncate_output};
pub use model::{AsyncModelClient, BlockingModelClient, FnModelClient, ModelClient, ModelError};
pub use registry::{ContextBlob, SessionRegistry, SessionSeed, SessionSlot};
pub use router::{OutputRouter, OutputTarget, Redirect};
pub use sandbox::{
    Capability, CapabilitySet, ExecutionResult, Fault, FaultKind, SandboxEnvironment,
};
pub use security::{default_denylist, FilterVerdict, SecurityFilter, SecurityLevel, Signature};
pub use service::{
    FinalAnswer, FinalizeResponse, ReplService, ReviewResponse, ReviewStatus, RunOutcome,
    SessionOptions, SessionSnapshot,
};
pub use store::{MemoryStateStore, StateStore};
