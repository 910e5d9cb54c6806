//! Deterministic fakes and fixtures shared by Flowgate tests.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;

use flowgate_core::approval::{ApprovalRequest, ApprovalStatus, RiskLevel};
use flowgate_core::config::AppConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::event::FlowEvent;
use flowgate_core::state::WorkflowState;
use flowgate_core::traits::{Clock, RiskScorer};
use flowgate_core::types::{Message, NodeError};

/// Boxed future returned by node closures.
pub type NodeFuture = BoxFuture<'static, std::result::Result<WorkflowState, NodeError>>;

// ── Clock ───────────────────────────────────────────────────────────

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(fixed_epoch())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 2026-01-01T00:00:00Z.
pub fn fixed_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

// ── Risk scorers ────────────────────────────────────────────────────

/// Returns the same score for every input.
#[derive(Debug, Clone, Copy)]
pub struct FixedRiskScorer(pub f64);

impl RiskScorer for FixedRiskScorer {
    fn score<'a>(&'a self, _content: &'a str) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move { Ok(self.0) })
    }
}

/// Returns scores from a script in order, repeating the last one.
#[derive(Debug)]
pub struct ScriptedRiskScorer {
    scores: Vec<f64>,
    calls: AtomicUsize,
}

impl ScriptedRiskScorer {
    pub fn new(scores: Vec<f64>) -> Self {
        Self {
            scores,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RiskScorer for ScriptedRiskScorer {
    fn score<'a>(&'a self, _content: &'a str) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move {
            let idx = self.calls.fetch_add(1, Ordering::SeqCst);
            self.scores
                .get(idx)
                .or_else(|| self.scores.last())
                .copied()
                .ok_or_else(|| FlowgateError::RiskScoring("empty score script".into()))
        })
    }
}

/// Always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingRiskScorer;

impl RiskScorer for FailingRiskScorer {
    fn score<'a>(&'a self, _content: &'a str) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move { Err(FlowgateError::RiskScoring("scorer unavailable".into())) })
    }
}

// ── Node bodies ─────────────────────────────────────────────────────
//
// Closures for `node_fn`. They live here rather than in the engine so
// integration tests can share them.

/// Appends one assistant message.
pub fn append_message(
    text: impl Into<String>,
) -> impl Fn(WorkflowState) -> NodeFuture + Send + Sync + 'static {
    let text = text.into();
    move |state: WorkflowState| -> NodeFuture {
        let msg = Message::assistant(text.clone());
        Box::pin(async move { Ok(state.with_message(msg)) })
    }
}

/// Writes `value` under the node's own step-context key.
pub fn write_step_context(
    node: impl Into<String>,
    value: serde_json::Value,
) -> impl Fn(WorkflowState) -> NodeFuture + Send + Sync + 'static {
    let node = node.into();
    move |state: WorkflowState| -> NodeFuture {
        let node = node.clone();
        let value = value.clone();
        Box::pin(async move { Ok(state.with_step_context(&node, value)) })
    }
}

/// Returns `error` every time.
pub fn fail_with(error: NodeError) -> impl Fn(WorkflowState) -> NodeFuture + Send + Sync + 'static {
    move |_state: WorkflowState| -> NodeFuture {
        let error = error.clone();
        Box::pin(async move { Err(error) })
    }
}

/// Panics with `message`, as a throwing node would.
pub fn panic_with(
    message: &'static str,
) -> impl Fn(WorkflowState) -> NodeFuture + Send + Sync + 'static {
    move |_state: WorkflowState| -> NodeFuture { Box::pin(explode(message)) }
}

async fn explode(message: &'static str) -> std::result::Result<WorkflowState, NodeError> {
    panic!("{}", message)
}

/// Counts executions, then appends `text`.
pub fn counting(
    counter: Arc<AtomicUsize>,
    text: impl Into<String>,
) -> impl Fn(WorkflowState) -> NodeFuture + Send + Sync + 'static {
    let text = text.into();
    move |state: WorkflowState| -> NodeFuture {
        counter.fetch_add(1, Ordering::SeqCst);
        let msg = Message::assistant(text.clone());
        Box::pin(async move { Ok(state.with_message(msg)) })
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

/// A pending, high-risk request submitted at `now` with a 15 minute deadline.
pub fn pending_request(id: &str, thread_id: &str, now: DateTime<Utc>) -> ApprovalRequest {
    ApprovalRequest {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        content_hash: format!("hash-{}", id),
        risk_level: RiskLevel::High,
        risk_score: 0.7,
        status: ApprovalStatus::Pending,
        submitted_at: now,
        expires_at: now + chrono::Duration::minutes(15),
        escalated: false,
        reviewer_id: None,
        resolved_at: None,
        response_latency_ms: None,
    }
}

/// Configuration with the default thresholds and no node timeout.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.engine.node_timeout_secs = 0;
    config
}

/// Write `config` to a temporary TOML file.
pub fn config_file(config: &AppConfig) -> tempfile::NamedTempFile {
    let body = toml::to_string(config).expect("config serializes to TOML");
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

/// Wait up to `within` for the first event matching `pred`.
pub async fn wait_for_event<F>(
    rx: &mut tokio::sync::broadcast::Receiver<FlowEvent>,
    within: Duration,
    mut pred: F,
) -> Option<FlowEvent>
where
    F: FnMut(&FlowEvent) -> bool,
{
    tokio::time::timeout(within, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}
