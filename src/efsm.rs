//! Extended finite state machine gating submission, review and execution.
//!
//! ```text
//! IDLE -> PENDING_REVIEW -> APPROVED -> EXECUTING -> IDLE
//!              |
//!              +---------> REJECTED -> IDLE
//! any non-terminal state -> COMPLETE (force_complete only bypasses the table)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::security::SecurityLevel;

/// Discrete EFSM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReplState {
    /// Waiting for a submission.
    #[default]
    #[serde(rename = "idle")]
    Idle,
    /// Code submitted and awaiting a review decision.
    #[serde(rename = "code_pending_review")]
    PendingReview,
    /// Code approved and ready to run.
    #[serde(rename = "code_approved")]
    Approved,
    /// Code rejected; must be acknowledged before the next submission.
    #[serde(rename = "code_rejected")]
    Rejected,
    /// Code is running.
    #[serde(rename = "executing")]
    Executing,
    /// Session finished with a final answer.
    #[serde(rename = "complete")]
    Complete,
}

impl ReplState {
    /// All states, in declaration order.
    pub const ALL: [ReplState; 6] = [
        ReplState::Idle,
        ReplState::PendingReview,
        ReplState::Approved,
        ReplState::Rejected,
        ReplState::Executing,
        ReplState::Complete,
    ];

    /// Returns the states reachable from `self` through the transition table.
    pub fn allowed_transitions(&self) -> &'static [ReplState] {
        use ReplState::*;
        match self {
            Idle => &[PendingReview, Complete],
            PendingReview => &[Approved, Rejected, Complete],
            Approved => &[Executing, Complete],
            Rejected => &[Idle, Complete],
            Executing => &[Idle, Complete],
            Complete => &[],
        }
    }

    /// Returns true if the table allows `self -> to`.
    pub fn can_transition(&self, to: ReplState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// Returns true for the terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReplState::Complete)
    }

    /// Returns the persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplState::Idle => "idle",
            ReplState::PendingReview => "code_pending_review",
            ReplState::Approved => "code_approved",
            ReplState::Rejected => "code_rejected",
            ReplState::Executing => "executing",
            ReplState::Complete => "complete",
        }
    }
}

impl fmt::Display for ReplState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision that resolves a pending review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ReviewOutcome {
    /// Code may run.
    Approve,
    /// Code is refused for the given reason.
    Reject { reason: String },
}

/// One executed submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Code that ran.
    pub code: String,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Iteration count at the time the code ran.
    pub iteration: u32,
    /// RFC 3339 timestamp of completion.
    #[serde(default)]
    pub executed_at: Option<String>,
}

/// Code discarded by a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// The discarded code.
    pub code: String,
    /// Why it was refused.
    pub reason: String,
}

/// Per-session EFSM state plus its auxiliary data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: String,
    state: ReplState,
    iteration: u32,
    max_iterations: u32,
    security_level: SecurityLevel,
    pending_code: Option<String>,
    rejected: Option<Rejection>,
    history: Vec<HistoryEntry>,
    final_answer: Option<String>,
    submissions: u64,
}

impl Session {
    /// Creates an idle session.
    pub fn new(id: impl Into<String>, security_level: SecurityLevel, max_iterations: u32) -> Self {
        Self {
            id: id.into(),
            state: ReplState::Idle,
            iteration: 0,
            max_iterations,
            security_level,
            pending_code: None,
            rejected: None,
            history: Vec::new(),
            final_answer: None,
            submissions: 0,
        }
    }

    /// Rebuilds a session from persisted fields.
    ///
    /// A persisted `Executing` state cannot be resumed (the worker that ran
    /// it is gone), so it comes back as `Idle`. Pending code outside the
    /// review window is dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: impl Into<String>,
        state: ReplState,
        iteration: u32,
        max_iterations: u32,
        security_level: SecurityLevel,
        pending_code: Option<String>,
        history: Vec<HistoryEntry>,
        final_answer: Option<String>,
    ) -> Self {
        let state = match state {
            ReplState::Executing => ReplState::Idle,
            ReplState::PendingReview | ReplState::Approved if pending_code.is_none() => {
                ReplState::Idle
            }
            other => other,
        };
        let pending_code = match state {
            ReplState::PendingReview | ReplState::Approved => pending_code,
            _ => None,
        };
        let rejected = match state {
            ReplState::Rejected => Some(Rejection {
                code: String::new(),
                reason: "restored from persisted state".to_string(),
            }),
            _ => None,
        };
        let final_answer = if state.is_terminal() { final_answer } else { None };
        let submissions = history.len() as u64;

        Self {
            id: id.into(),
            state,
            iteration,
            max_iterations,
            security_level,
            pending_code,
            rejected,
            history,
            final_answer,
            submissions,
        }
    }

    /// Returns the session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the current state.
    pub fn state(&self) -> ReplState {
        self.state
    }

    /// Returns the number of completed executions.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Returns the iteration bound.
    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Returns true once the iteration bound is reached.
    pub fn iterations_exhausted(&self) -> bool {
        self.iteration >= self.max_iterations
    }

    /// Returns the security level.
    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    /// Returns the code awaiting review or execution, if any.
    pub fn pending_code(&self) -> Option<&str> {
        self.pending_code.as_deref()
    }

    /// Returns the rejection awaiting acknowledgement, if any.
    pub fn rejection(&self) -> Option<&Rejection> {
        self.rejected.as_ref()
    }

    /// Returns executed submissions in order.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Returns the final answer once complete.
    pub fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    /// Restores the submission counter, which also counts rejected code and
    /// so cannot be derived from the history. Never goes below the history
    /// length.
    pub fn with_submissions(mut self, submissions: u64) -> Self {
        self.submissions = submissions.max(self.history.len() as u64);
        self
    }

    /// Returns the number of submissions accepted so far.
    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    /// Stores code for review. Valid only from `Idle`.
    ///
    /// Returns the submission number, used for audit naming.
    pub fn submit(&mut self, code: impl Into<String>) -> Result<u64> {
        self.transition(ReplState::PendingReview)?;
        self.pending_code = Some(code.into());
        self.submissions += 1;
        Ok(self.submissions)
    }

    /// Resolves a pending review.
    pub fn resolve_review(&mut self, outcome: ReviewOutcome) -> Result<ReplState> {
        match outcome {
            ReviewOutcome::Approve => {
                self.transition(ReplState::Approved)?;
            }
            ReviewOutcome::Reject { reason } => {
                self.transition(ReplState::Rejected)?;
                let code = self.pending_code.take().unwrap_or_default();
                self.rejected = Some(Rejection { code, reason });
            }
        }
        Ok(self.state)
    }

    /// Moves `Approved -> Executing` and hands out the approved code.
    pub fn begin_execution(&mut self) -> Result<String> {
        self.transition(ReplState::Executing)?;
        Ok(self.pending_code.take().unwrap_or_default())
    }

    /// Moves `Executing -> Idle`, records the result and counts the iteration.
    pub fn finish_execution(
        &mut self,
        code: String,
        stdout: String,
        stderr: String,
    ) -> Result<u32> {
        self.transition(ReplState::Idle)?;
        self.history.push(HistoryEntry {
            code,
            stdout,
            stderr,
            iteration: self.iteration,
            executed_at: Some(chrono::Utc::now().to_rfc3339()),
        });
        self.pending_code = None;
        self.iteration += 1;
        Ok(self.iteration)
    }

    /// Acknowledges a rejection, moving `Rejected -> Idle`.
    ///
    /// `reason` overrides the recorded reason when provided.
    pub fn reject_with_reason(&mut self, reason: Option<&str>) -> Result<Rejection> {
        self.transition(ReplState::Idle)?;
        self.pending_code = None;
        let mut rejection = self.rejected.take().unwrap_or(Rejection {
            code: String::new(),
            reason: String::new(),
        });
        if let Some(reason) = reason {
            rejection.reason = reason.to_string();
        }
        Ok(rejection)
    }

    /// Ends the session from any non-terminal state with a final answer.
    ///
    /// This is the only operation that does not consult the transition
    /// table.
    pub fn force_complete(&mut self, answer: impl Into<String>) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: ReplState::Complete,
            });
        }
        tracing::debug!(session_id = %self.id, from = %self.state, "forcing completion");
        self.state = ReplState::Complete;
        self.pending_code = None;
        self.rejected = None;
        self.final_answer = Some(answer.into());
        Ok(())
    }

    fn transition(&mut self, to: ReplState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!(session_id = %self.id, from = %self.state, to = %to, "state transition");
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("s1", SecurityLevel::Basic, 20)
    }

    fn assert_invalid(result: Result<impl std::fmt::Debug>) {
        match result {
            Err(Error::InvalidTransition { .. }) => {}
            other => panic!("expected InvalidTransition, got {:?}", other),
        }
    }

    #[test]
    fn transition_table_matches_design() {
        use ReplState::*;
        assert!(Idle.can_transition(PendingReview));
        assert!(Idle.can_transition(Complete));
        assert!(!Idle.can_transition(Executing));
        assert!(PendingReview.can_transition(Rejected));
        assert!(!Approved.can_transition(Idle));
        assert!(Rejected.can_transition(Idle));
        assert!(Executing.can_transition(Idle));
        for state in ReplState::ALL {
            assert!(!Complete.can_transition(state));
        }
    }

    #[test]
    fn submit_from_idle_moves_to_pending_review() {
        let mut s = session();
        let n = s.submit("x = 1").unwrap();
        assert_eq!(n, 1);
        assert_eq!(s.state(), ReplState::PendingReview);
        assert_eq!(s.pending_code(), Some("x = 1"));
    }

    #[test]
    fn submit_outside_idle_is_invalid() {
        let mut s = session();
        s.submit("a").unwrap();
        assert_invalid(s.submit("b"));
        assert_eq!(s.pending_code(), Some("a"));
    }

    #[test]
    fn full_execution_cycle_increments_iteration_once() {
        let mut s = session();
        s.submit("1 + 1").unwrap();
        s.resolve_review(ReviewOutcome::Approve).unwrap();
        let code = s.begin_execution().unwrap();
        assert_eq!(code, "1 + 1");
        assert_eq!(s.state(), ReplState::Executing);
        assert!(s.pending_code().is_none());

        let iteration = s
            .finish_execution(code, "2\n".to_string(), String::new())
            .unwrap();
        assert_eq!(iteration, 1);
        assert_eq!(s.state(), ReplState::Idle);
        assert_eq!(s.history().len(), 1);
        assert_eq!(s.history()[0].iteration, 0);
        assert_eq!(s.history()[0].stdout, "2\n");
    }

    #[test]
    fn rejection_discards_code_and_allows_resubmission() {
        let mut s = session();
        s.submit("import os").unwrap();
        s.resolve_review(ReviewOutcome::Reject {
            reason: "os module import blocked".to_string(),
        })
        .unwrap();
        assert_eq!(s.state(), ReplState::Rejected);
        assert!(s.pending_code().is_none());

        let rejection = s.reject_with_reason(None).unwrap();
        assert_eq!(rejection.code, "import os");
        assert_eq!(rejection.reason, "os module import blocked");
        assert_eq!(s.state(), ReplState::Idle);
        assert_eq!(s.iteration(), 0);

        s.submit("1").unwrap();
        assert_eq!(s.submissions(), 2);
    }

    #[test]
    fn begin_execution_requires_approval() {
        let mut s = session();
        assert_invalid(s.begin_execution());
        s.submit("x").unwrap();
        assert_invalid(s.begin_execution());
    }

    #[test]
    fn force_complete_works_from_any_non_terminal_state() {
        let mut s = session();
        s.submit("x").unwrap();
        s.force_complete("42").unwrap();
        assert_eq!(s.state(), ReplState::Complete);
        assert_eq!(s.final_answer(), Some("42"));
        assert!(s.pending_code().is_none());

        let mut executing = session();
        executing.submit("x").unwrap();
        executing.resolve_review(ReviewOutcome::Approve).unwrap();
        executing.begin_execution().unwrap();
        executing.force_complete("done").unwrap();
        assert_eq!(executing.state(), ReplState::Complete);
    }

    #[test]
    fn complete_is_terminal() {
        let mut s = session();
        s.force_complete("done").unwrap();
        assert_invalid(s.submit("x"));
        assert_invalid(s.resolve_review(ReviewOutcome::Approve));
        assert_invalid(s.begin_execution());
        assert_invalid(s.force_complete("again"));
        assert_eq!(s.final_answer(), Some("done"));
    }

    #[test]
    fn restore_normalizes_inconsistent_fields() {
        let s = Session::restore(
            "s2",
            ReplState::Executing,
            3,
            20,
            SecurityLevel::Strict,
            Some("stale".to_string()),
            Vec::new(),
            Some("ignored".to_string()),
        );
        assert_eq!(s.state(), ReplState::Idle);
        assert!(s.pending_code().is_none());
        assert!(s.final_answer().is_none());
        assert_eq!(s.iteration(), 3);
    }

    #[test]
    fn restored_submission_counter_survives_rejections() {
        let mut s = Session::restore(
            "s4",
            ReplState::Idle,
            0,
            20,
            SecurityLevel::Basic,
            None,
            Vec::new(),
            None,
        )
        .with_submissions(3);
        assert_eq!(s.submissions(), 3);
        assert_eq!(s.submit("x = 1").unwrap(), 4);
    }

    #[test]
    fn state_serializes_to_persisted_names() {
        assert_eq!(
            serde_json::to_string(&ReplState::PendingReview).unwrap(),
            "\"code_pending_review\""
        );
        let parsed: ReplState = serde_json::from_str("\"code_rejected\"").unwrap();
        assert_eq!(parsed, ReplState::Rejected);
        assert_eq!(ReplState::Approved.to_string(), "code_approved");
    }

    #[test]
    fn iteration_bound_is_reported() {
        let mut s = Session::new("s3", SecurityLevel::None, 1);
        assert!(!s.iterations_exhausted());
        s.submit("1").unwrap();
        s.resolve_review(ReviewOutcome::Approve).unwrap();
        let code = s.begin_execution().unwrap();
        s.finish_execution(code, String::new(), String::new()).unwrap();
        assert!(s.iterations_exhausted());
    }
}
