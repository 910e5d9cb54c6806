//! End-to-end runs of the conversational pipeline against both storage
//! backends.

use std::path::Path;
use std::sync::Arc;

use flowgate_core::approval::ApprovalStatus;
use flowgate_core::checkpoint::{replay_completed_steps, verify_chain, RunStatus};
use flowgate_core::config::{AppConfig, DocumentConfig};
use flowgate_core::event::EventBus;
use flowgate_core::state::{StatePatch, WorkflowState};
use flowgate_core::traits::{ApprovalRepository, CheckpointSaver};
use flowgate_core::types::{NodeError, ThreadId};
use flowgate_core::FlowgateError;

use flowgate_engine::pipeline::{conversation_graph, Collaborators, FINALIZE, HUMAN_APPROVAL};
use flowgate_engine::{
    node_fn, ApprovalManager, ExecutionEngine, GraphBuilder, KeywordRiskScorer,
    MemoryApprovalRepository, MemoryCheckpointStore, WorkflowService, ERROR_HANDLER,
};
use flowgate_store::{SqliteApprovalRepository, SqliteCheckpointStore};
use flowgate_test_utils::{append_message, panic_with, test_config, ManualClock};

const SAFE_QUERY: &str = "When are you open?";
const RISKY_QUERY: &str = "What dosage of ibuprofen should I take?";

fn config() -> AppConfig {
    let mut config = test_config();
    config.pipeline.documents = vec![
        DocumentConfig {
            id: "hours".into(),
            title: Some("Opening hours".into()),
            text: "We are open from 9am to 5pm on weekdays.".into(),
        },
        DocumentConfig {
            id: "pharmacy".into(),
            title: None,
            text: "Ibuprofen dosage depends on age and weight. Ask a pharmacist.".into(),
        },
    ];
    config
}

fn service(
    checkpoints: Arc<dyn CheckpointSaver>,
    repo: Arc<dyn ApprovalRepository>,
    clock: ManualClock,
) -> WorkflowService {
    let config = config();
    let bus = Arc::new(EventBus::default());
    let scorer = KeywordRiskScorer::from_config(&config.pipeline.risk_patterns).unwrap();
    let approvals = ApprovalManager::new(
        repo,
        Arc::new(scorer),
        Arc::new(clock),
        bus.clone(),
        config.approval.clone(),
    );
    let graph =
        conversation_graph(Collaborators::from_config(&config.pipeline), approvals.clone())
            .unwrap();
    let engine = ExecutionEngine::new(graph, checkpoints, bus, config.engine);
    WorkflowService::new(Arc::new(engine), approvals)
}

fn memory_service(clock: ManualClock) -> WorkflowService {
    service(
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryApprovalRepository::new()),
        clock,
    )
}

fn sqlite_service(path: &Path, clock: ManualClock) -> WorkflowService {
    service(
        Arc::new(SqliteCheckpointStore::open(path).unwrap()),
        Arc::new(SqliteApprovalRepository::open(path).unwrap()),
        clock,
    )
}

#[tokio::test]
async fn scenario_a_low_risk_finishes_in_one_invoke() {
    let svc = memory_service(ManualClock::default());
    let out = svc.execute(SAFE_QUERY, None, None).await.unwrap();

    assert_eq!(out.status, RunStatus::Completed);
    assert!(out.interrupted_at.is_none());
    assert_eq!(
        out.state.workflow_context.completed_steps,
        vec!["retrieve", "persona", "reason", "assess_risk", FINALIZE]
    );
    assert!(out.state.latest_message().unwrap().content.contains("9am to 5pm"));
    assert!(svc.pending_approvals().await.unwrap().is_empty());

    let history = svc.history(&out.thread_id).await.unwrap();
    verify_chain(&history).unwrap();
    assert_eq!(
        replay_completed_steps(&history),
        out.state.workflow_context.completed_steps
    );
}

#[tokio::test]
async fn scenario_b_high_risk_pauses_then_resumes() {
    let svc = memory_service(ManualClock::default());
    let out = svc.execute(RISKY_QUERY, None, None).await.unwrap();
    assert_eq!(out.status, RunStatus::PausedInterrupt);

    let status = svc.status(&out.thread_id).await.unwrap();
    assert_eq!(status.current_step.as_deref(), Some(HUMAN_APPROVAL));
    assert!(status.resumable);
    assert_eq!(status.approval.unwrap().status, ApprovalStatus::Pending);

    let done = svc
        .resume(&out.thread_id, StatePatch::decision(true, "pharmacist-1"))
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(
        done.state.workflow_context.completed_steps.last().map(String::as_str),
        Some(FINALIZE)
    );
    assert_eq!(done.state.approval_status(), Some(ApprovalStatus::Approved));
    assert!(done.state.latest_message().unwrap().content.contains("Ibuprofen dosage"));

    let history = svc.history(&out.thread_id).await.unwrap();
    verify_chain(&history).unwrap();
    assert_eq!(
        replay_completed_steps(&history),
        done.state.workflow_context.completed_steps
    );
}

#[tokio::test]
async fn resolved_thread_cannot_be_resumed_again() {
    let svc = memory_service(ManualClock::default());
    let out = svc.execute(RISKY_QUERY, None, None).await.unwrap();
    svc.resume(&out.thread_id, StatePatch::decision(true, "r1"))
        .await
        .unwrap();
    let before = svc.history(&out.thread_id).await.unwrap().len();

    let again = svc
        .resume(&out.thread_id, StatePatch::decision(false, "r2"))
        .await;
    assert!(matches!(again, Err(FlowgateError::ThreadNotResumable(_))));
    assert_eq!(svc.history(&out.thread_id).await.unwrap().len(), before);
}

#[tokio::test]
async fn scenario_c_expired_approval_reports_timeout() {
    let clock = ManualClock::default();
    let svc = memory_service(clock.clone());
    let out = svc.execute(RISKY_QUERY, None, None).await.unwrap();

    clock.advance(chrono::Duration::minutes(16));
    let status = svc.status(&out.thread_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Timeout);
    let approval = status.approval.unwrap();
    assert_eq!(approval.status, ApprovalStatus::Timeout);

    let trail = svc
        .approvals()
        .audit_trail(approval.approval_id.as_deref().unwrap())
        .await
        .unwrap();
    let last = trail.last().unwrap();
    assert_eq!(last.action, "timeout");
    assert_eq!(last.new_status, ApprovalStatus::Timeout);
}

#[tokio::test]
async fn scenario_d_throwing_node_is_recovered() {
    let mut b = GraphBuilder::new();
    b.add_node("explode", node_fn(panic_with("boom")))
        .unwrap()
        .add_node("done", node_fn(append_message("unreachable")))
        .unwrap();
    b.add_edge("explode", "done").unwrap();
    b.set_entry_point("explode").unwrap();
    b.mark_terminal("done").unwrap();
    let graph = b.compile().unwrap();

    let engine = ExecutionEngine::new(
        graph,
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(EventBus::default()),
        test_config().engine,
    );
    let out = engine
        .invoke(WorkflowState::from_user_message("hi"), ThreadId::new())
        .await
        .unwrap();

    assert_eq!(out.status, RunStatus::Completed);
    assert_eq!(out.state.errors.len(), 1);
    assert!(out.state.errors[0].recoverable);
    assert_eq!(out.state.errors[0].step, "explode");
    let handler_messages = out
        .state
        .messages
        .iter()
        .filter(|m| m.source() == Some(ERROR_HANDLER))
        .count();
    assert_eq!(handler_messages, 1);
    assert!(!out.state.messages.iter().any(|m| m.content == "unreachable"));
}

#[tokio::test]
async fn fatal_node_error_fails_the_run() {
    let mut b = GraphBuilder::new();
    b.add_node(
        "broken",
        node_fn(flowgate_test_utils::fail_with(NodeError::fatal("corrupt", "bad input"))),
    )
    .unwrap()
    .add_node("done", node_fn(append_message("ok")))
    .unwrap();
    b.add_edge("broken", "done").unwrap();
    b.set_entry_point("broken").unwrap();
    b.mark_terminal("done").unwrap();

    let engine = ExecutionEngine::new(
        b.compile().unwrap(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(EventBus::default()),
        test_config().engine,
    );
    let thread = ThreadId::new();
    let out = engine
        .invoke(WorkflowState::from_user_message("hi"), thread.clone())
        .await
        .unwrap();
    assert_eq!(out.status, RunStatus::Failed);
    assert!(!out.state.workflow_context.resumable);
    assert!(matches!(
        engine.resume(&thread, StatePatch::default()).await,
        Err(FlowgateError::ThreadNotResumable(_))
    ));
}

#[tokio::test]
async fn identical_draft_reuses_pending_request() {
    let svc = memory_service(ManualClock::default());
    let first = svc.execute(RISKY_QUERY, None, None).await.unwrap();
    let second = svc
        .execute(RISKY_QUERY, Some(first.thread_id.clone()), None)
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::PausedInterrupt);

    let first_id = first.state.approval_context.unwrap().approval_id;
    let second_id = second.state.approval_context.unwrap().approval_id;
    assert!(first_id.is_some());
    assert_eq!(first_id, second_id);
    assert_eq!(svc.pending_approvals().await.unwrap().len(), 1);
}

#[tokio::test]
async fn sqlite_backed_thread_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("flowgate.db");
    let clock = ManualClock::default();

    let thread = {
        let svc = sqlite_service(&path, clock.clone());
        let out = svc.execute(RISKY_QUERY, None, None).await.unwrap();
        assert_eq!(out.status, RunStatus::PausedInterrupt);
        svc.approvals().shutdown();
        out.thread_id
    };

    let svc = sqlite_service(&path, clock);
    assert_eq!(svc.approvals().restore().await.unwrap(), 1);
    let status = svc.status(&thread).await.unwrap();
    assert_eq!(status.current_step.as_deref(), Some(HUMAN_APPROVAL));
    assert!(status.resumable);

    let id = svc.pending_approvals().await.unwrap()[0].id.clone();
    let done = svc.decide(&id, true, "rev-1", None).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(
        svc.approvals().get(&id).await.unwrap().status,
        ApprovalStatus::Approved
    );

    let history = svc.history(&thread).await.unwrap();
    verify_chain(&history).unwrap();
    assert_eq!(
        replay_completed_steps(&history),
        done.state.workflow_context.completed_steps
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_timeout_and_decision_race_has_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    let clock = ManualClock::default();
    let svc = sqlite_service(&path, clock.clone());

    for round in 0..10 {
        let thread = format!("race-{}", round);
        let decision = svc
            .approvals()
            .assess_and_submit(&thread, RISKY_QUERY)
            .await
            .unwrap();
        let id = decision.request().unwrap().id.clone();

        let a = svc.approvals().clone();
        let b = svc.approvals().clone();
        let (id_a, id_b) = (id.clone(), id.clone());
        let timeout = tokio::spawn(async move { a.on_timeout(&id_a).await });
        let decide = tokio::spawn(async move { b.on_decision(&id_b, true, "rev").await });

        let timed_out = timeout.await.unwrap().unwrap();
        let decided = decide.await.unwrap().is_ok();
        assert!(timed_out ^ decided, "round {}: exactly one transition must win", round);

        let stored = svc.approvals().get(&id).await.unwrap();
        let expected = if timed_out {
            ApprovalStatus::Timeout
        } else {
            ApprovalStatus::Approved
        };
        assert_eq!(stored.status, expected);
    }
}
