//! End-to-end tests for review-gated sessions through the public service API.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use gated_repl::store::keys;
use gated_repl::{
    ContextBlob, Error, ExecutionLimits, FinalAnswer, MemoryStateStore, ReplConfig, ReplService,
    ReplState, ReviewStatus, RunOutcome, SecurityLevel, SessionOptions, StateStore,
};

fn service() -> ReplService {
    ReplService::new(ReplConfig::default()).expect("default config is valid")
}

async fn open(service: &ReplService, level: SecurityLevel) -> String {
    service
        .open_session(SessionOptions {
            security_level: Some(level),
            ..SessionOptions::default()
        })
        .await
        .expect("failed to open session")
}

async fn run(service: &ReplService, id: &str, code: &str) -> gated_repl::ExecutionResult {
    match service.run_code(id, code).await.expect("run_code failed") {
        RunOutcome::Executed(result) => result,
        other => panic!("expected execution, got {:?}", other),
    }
}

#[tokio::test]
async fn basic_level_rejects_shell_invocation_without_executing() {
    let service = service();
    let id = open(&service, SecurityLevel::Basic).await;

    let response = service
        .submit_code(&id, "import os\nos.system(\"ls\")")
        .await
        .unwrap();

    assert_eq!(response.status, ReviewStatus::Rejected);
    assert_eq!(response.state, ReplState::Idle);
    let reason = response.reason.unwrap();
    assert!(reason.contains("import os"), "reason: {}", reason);

    let state = service.get_state(&id).await.unwrap();
    assert_eq!(state.state, ReplState::Idle);
    assert_eq!(state.iteration, 0);
    assert_eq!(state.history_count, 0);
    assert!(state.last_error.starts_with("Security Error: "));
    assert!(state.last_error.contains("import os"));

    // Nothing was approved, so there is nothing to execute
    assert!(matches!(
        service.execute(&id).await,
        Err(Error::InvalidTransition { .. })
    ));

    // The session accepts a new submission
    assert_eq!(run(&service, &id, "1 + 1").await.stdout, "2\n");
}

#[tokio::test]
async fn namespace_persists_within_a_session_only() {
    let service = service();
    let first = open(&service, SecurityLevel::Basic).await;
    let second = open(&service, SecurityLevel::Basic).await;

    let result = run(&service, &first, "x = 5").await;
    assert!(result.success);
    assert_eq!(result.stdout, "");
    assert_eq!(result.namespace["x"], json!(5));

    assert_eq!(run(&service, &first, "x + 1").await.stdout, "6\n");

    let other = run(&service, &second, "x + 1").await;
    assert!(!other.success);
    assert!(other.stderr.starts_with("NameError"), "stderr: {}", other.stderr);

    let state = service.get_state(&first).await.unwrap();
    assert_eq!(state.iteration, 2);
    assert_eq!(state.variables, vec!["x".to_string()]);
}

#[tokio::test]
async fn runtime_fault_keeps_partial_output_and_session() {
    let service = service();
    let id = open(&service, SecurityLevel::Basic).await;

    let result = run(&service, &id, "total = 10\nprint(\"a\")\ntotal = total / 0").await;
    assert!(!result.success);
    assert_eq!(result.stdout, "a\n");
    assert!(result.stderr.starts_with("ZeroDivisionError"), "stderr: {}", result.stderr);

    let state = service.get_state(&id).await.unwrap();
    assert_eq!(state.state, ReplState::Idle);
    assert_eq!(state.iteration, 1);
    assert_eq!(state.last_error, result.stderr);

    assert_eq!(run(&service, &id, "total").await.stdout, "10\n");
}

#[tokio::test]
async fn strict_level_waits_for_reviewer() {
    let service = service();
    let id = open(&service, SecurityLevel::Strict).await;

    let response = service.submit_code(&id, "y = 3\ny * 2").await.unwrap();
    assert_eq!(response.status, ReviewStatus::PendingReview);
    assert_eq!(response.state, ReplState::PendingReview);

    let state = service.get_state(&id).await.unwrap();
    assert_eq!(state.pending_code.as_deref(), Some("y = 3\ny * 2"));

    // Execution before approval is refused
    assert!(matches!(
        service.execute(&id).await,
        Err(Error::InvalidTransition {
            from: ReplState::PendingReview,
            ..
        })
    ));

    let review = service.resolve_review(&id, true, None).await.unwrap();
    assert_eq!(review.state, ReplState::Approved);

    let result = service.execute(&id).await.unwrap();
    assert_eq!(result.stdout, "6\n");
    assert!(service.get_state(&id).await.unwrap().pending_code.is_none());
}

#[tokio::test]
async fn strict_advisory_flags_but_does_not_reject() {
    let service = service();
    let id = open(&service, SecurityLevel::Strict).await;

    match service.run_code(&id, "eval('1')").await.unwrap() {
        RunOutcome::PendingReview { submission, advisory } => {
            assert_eq!(submission, 1);
            assert!(advisory.contains("eval("));
        }
        other => panic!("expected pending review, got {:?}", other),
    }

    let review = service.resolve_review(&id, false, None).await.unwrap();
    assert_eq!(review.status, ReviewStatus::Rejected);
    assert_eq!(review.state, ReplState::Idle);
}

#[tokio::test]
async fn finalize_from_variable_completes_and_tears_down() {
    let service = service();
    let id = open(&service, SecurityLevel::Basic).await;
    run(&service, &id, "result = 'forty-two'").await;

    let missing = service
        .finalize(&id, FinalAnswer::Variable("answer".to_string()))
        .await;
    match missing {
        Err(Error::UnknownVariable { name, available }) => {
            assert_eq!(name, "answer");
            assert_eq!(available, vec!["result".to_string()]);
        }
        other => panic!("expected unknown variable, got {:?}", other),
    }

    let response = service
        .finalize(&id, FinalAnswer::Variable(" \"result\" ".to_string()))
        .await
        .unwrap();
    assert_eq!(response.answer, "forty-two");
    assert_eq!(response.state, ReplState::Complete);

    let state = service.get_state(&id).await.unwrap();
    assert_eq!(state.state, ReplState::Complete);
    assert_eq!(state.final_answer.as_deref(), Some("forty-two"));
    assert!(state.variables.is_empty());

    // Complete is terminal
    assert!(matches!(
        service.submit_code(&id, "1").await,
        Err(Error::InvalidTransition {
            from: ReplState::Complete,
            ..
        })
    ));
    assert!(service
        .finalize(&id, FinalAnswer::Text("again".to_string()))
        .await
        .is_err());

    let stored = service.store().get(&id, keys::FINAL_ANSWER).await.unwrap();
    assert_eq!(stored, Some(json!("forty-two")));
}

#[tokio::test]
async fn finalize_is_allowed_from_pending_review() {
    let service = service();
    let id = open(&service, SecurityLevel::Strict).await;
    service.submit_code(&id, "x = 1").await.unwrap();

    let response = service
        .finalize(&id, FinalAnswer::Text("done early".to_string()))
        .await
        .unwrap();
    assert_eq!(response.state, ReplState::Complete);
    assert!(service.get_state(&id).await.unwrap().pending_code.is_none());
}

#[tokio::test]
async fn iteration_limit_refuses_further_submissions() {
    let service = service();
    let id = service
        .open_session(SessionOptions {
            max_iterations: Some(2),
            ..SessionOptions::default()
        })
        .await
        .unwrap();

    run(&service, &id, "a = 1").await;
    run(&service, &id, "b = 2").await;

    assert!(matches!(
        service.submit_code(&id, "c = 3").await,
        Err(Error::IterationLimit { limit: 2 })
    ));

    // Finalizing is still possible
    let response = service
        .finalize(&id, FinalAnswer::Variable("b".to_string()))
        .await
        .unwrap();
    assert_eq!(response.answer, "2");
}

#[tokio::test]
async fn session_resumes_from_state_store() {
    let store = Arc::new(MemoryStateStore::new());
    let id = {
        let service = service().with_store(store.clone());
        let id = open(&service, SecurityLevel::None).await;
        run(&service, &id, "x = 41\nnames = ['a', 'b']").await;
        id
    };

    let dump = store.dump(&id).await;
    assert_eq!(dump[keys::STATE], json!("idle"));
    assert_eq!(dump[keys::ITERATION], json!(1));
    assert_eq!(dump[keys::SECURITY_LEVEL], json!("none"));
    assert_eq!(dump[keys::LOCALS]["x"], json!(41));

    let service = service().with_store(store.clone());
    let snapshot = service.resume_session(&id).await.unwrap();
    assert_eq!(snapshot.iteration, 1);
    assert_eq!(snapshot.history_count, 1);
    assert_eq!(snapshot.security_level, SecurityLevel::None);

    assert_eq!(run(&service, &id, "x + len(names)").await.stdout, "43\n");
    assert!(matches!(
        service.resume_session(&id).await,
        Err(Error::SessionExists(_))
    ));
    assert!(matches!(
        service.resume_session("never-opened").await,
        Err(Error::UnknownSession(_))
    ));
}

#[tokio::test]
async fn reset_destroys_session_and_state() {
    let service = service();
    let id = service
        .open_session(SessionOptions {
            id: Some("fixed-id".to_string()),
            ..SessionOptions::default()
        })
        .await
        .unwrap();
    run(&service, &id, "x = 1").await;

    assert!(matches!(
        service.open_session(SessionOptions {
            id: Some("fixed-id".to_string()),
            ..SessionOptions::default()
        })
        .await,
        Err(Error::SessionExists(_))
    ));

    service.reset(&id).await.unwrap();
    assert!(matches!(service.get_state(&id).await, Err(Error::UnknownSession(_))));
    assert_eq!(service.store().get(&id, keys::STATE).await.unwrap(), None);

    service
        .open_session(SessionOptions {
            id: Some("fixed-id".to_string()),
            ..SessionOptions::default()
        })
        .await
        .unwrap();
    let result = run(&service, "fixed-id", "x").await;
    assert!(!result.success);
}

#[tokio::test]
async fn context_and_locals_seed_the_namespace() {
    let service = service();
    let mut locals = serde_json::Map::new();
    locals.insert("threshold".to_string(), json!(2));
    let id = service
        .open_session(SessionOptions {
            context: Some(ContextBlob::Json(json!({"scores": [1, 2, 3, 4]}))),
            locals,
            ..SessionOptions::default()
        })
        .await
        .unwrap();

    let result = run(
        &service,
        &id,
        "big = [s for s in context['scores'] if s > threshold]\nbig",
    )
    .await;
    assert_eq!(result.stdout, "[3, 4]\n");

    let result = run(&service, &id, "context['scores'].append(5)").await;
    assert!(!result.success);
    assert!(result.stderr.starts_with("TypeError"), "stderr: {}", result.stderr);
    assert_eq!(run(&service, &id, "len(context['scores'])").await.stdout, "4\n");
}

#[tokio::test]
async fn runaway_loop_hits_step_limit() {
    let config = ReplConfig {
        limits: ExecutionLimits {
            max_steps: 10_000,
            ..ExecutionLimits::default()
        },
        ..ReplConfig::default()
    };
    let service = ReplService::new(config).unwrap();
    let id = open(&service, SecurityLevel::Basic).await;

    let result = run(&service, &id, "n = 0\nwhile True:\n    n += 1").await;
    assert!(!result.success);
    assert!(result.stderr.starts_with("StepLimitExceeded"), "stderr: {}", result.stderr);

    let state = service.get_state(&id).await.unwrap();
    assert_eq!(state.state, ReplState::Idle);
    assert_eq!(run(&service, &id, "n > 0").await.stdout, "True\n");
}

#[tokio::test]
async fn abandoned_execution_returns_the_session_to_idle() {
    let config = ReplConfig {
        limits: ExecutionLimits {
            max_steps: u64::MAX,
            wall_clock_ms: 60_000,
            ..ExecutionLimits::default()
        },
        ..ReplConfig::default()
    };
    let service = ReplService::new(config).unwrap();
    let id = open(&service, SecurityLevel::Basic).await;
    let response = service
        .submit_code(&id, "x = 0\nwhile True:\n    x += 1")
        .await
        .unwrap();
    assert_eq!(response.status, ReviewStatus::Approved);

    let abandoned = tokio::time::timeout(Duration::from_millis(50), service.execute(&id)).await;
    assert!(abandoned.is_err());

    // The slot lock is released once the cancelled run has been recorded
    let state = tokio::time::timeout(Duration::from_secs(10), service.get_state(&id))
        .await
        .expect("cancelled execution never finished")
        .unwrap();
    assert_eq!(state.state, ReplState::Idle);
    assert_eq!(state.iteration, 1);
    assert!(state.last_error.contains("cancelled"), "last_error: {}", state.last_error);

    assert_eq!(run(&service, &id, "x > 0").await.stdout, "True\n");
}

#[tokio::test]
async fn seeded_locals_are_visible_before_the_first_execution() {
    let service = service();
    let mut locals = serde_json::Map::new();
    locals.insert("answer".to_string(), json!(42));
    let seeded = SessionOptions {
        locals,
        ..SessionOptions::default()
    };

    let id = service.open_session(seeded.clone()).await.unwrap();
    let state = service.get_state(&id).await.unwrap();
    assert_eq!(state.variables, vec!["answer".to_string()]);
    let response = service
        .finalize(&id, FinalAnswer::Variable("answer".to_string()))
        .await
        .unwrap();
    assert_eq!(response.answer, "42");

    let id = service.open_session(seeded).await.unwrap();
    let response = service
        .finalize(&id, FinalAnswer::Variable(" 'answer' ".to_string()))
        .await
        .unwrap();
    assert_eq!(response.answer, "42");
}

#[tokio::test]
async fn submission_numbers_continue_after_resume() {
    let store = Arc::new(MemoryStateStore::new());
    let id = {
        let service = service().with_store(store.clone());
        let id = open(&service, SecurityLevel::Basic).await;
        let rejected = service
            .submit_code(&id, "import os\nos.system(\"ls\")")
            .await
            .unwrap();
        assert_eq!(rejected.status, ReviewStatus::Rejected);
        run(&service, &id, "x = 1").await;
        id
    };
    assert_eq!(store.dump(&id).await[keys::SUBMISSIONS], json!(2));

    let service = service().with_store(store.clone());
    service.resume_session(&id).await.unwrap();
    let response = service.submit_code(&id, "x + 1").await.unwrap();
    assert_eq!(response.submission, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_sessions_run_in_parallel() {
    let service = Arc::new(service());
    let mut handles = Vec::new();
    for i in 0..4 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let id = open(&service, SecurityLevel::Basic).await;
            run(&service, &id, &format!("v = {}", i)).await;
            run(&service, &id, "v * 10").await.stdout
        }));
    }

    let mut outputs = Vec::new();
    for handle in handles {
        outputs.push(handle.await.unwrap());
    }
    assert_eq!(outputs, vec!["0\n", "10\n", "20\n", "30\n"]);
}
