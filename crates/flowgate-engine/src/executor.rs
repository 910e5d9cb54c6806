use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use flowgate_core::approval::ApprovalStatus;
use flowgate_core::checkpoint::{Checkpoint, CheckpointMetadata, InterruptKind, RunStatus};
use flowgate_core::config::EngineConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::event::{EventBus, FlowEvent};
use flowgate_core::state::{BranchRecord, ExecutionMetadata, StatePatch, StepError, WorkflowState};
use flowgate_core::traits::CheckpointSaver;
use flowgate_core::types::{NodeError, ThreadId};

use crate::graph::{CompiledGraph, NodeResult, ERROR_HANDLER};

/// Branch label recorded when a failure diverts execution to the error handler.
const ERROR_LABEL: &str = "error";

/// Result of one `invoke` or `resume` call.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub thread_id: ThreadId,
    pub status: RunStatus,
    pub state: WorkflowState,
    pub checkpoint_id: String,
    /// Node the run paused at, for `paused_interrupt` outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interrupted_at: Option<String>,
}

/// Approval part of a thread summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalSummary {
    pub approval_id: Option<String>,
    pub status: ApprovalStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub escalated: bool,
}

/// Summary of the latest checkpoint of a thread.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadStatus {
    pub thread_id: ThreadId,
    pub status: RunStatus,
    pub current_step: Option<String>,
    pub completed_steps: Vec<String>,
    pub resumable: bool,
    pub checkpoint_id: String,
    pub step_count: usize,
    pub approval: Option<ApprovalSummary>,
}

impl ThreadStatus {
    fn from_checkpoint(cp: &Checkpoint) -> Self {
        let ctx = &cp.state.workflow_context;
        Self {
            thread_id: cp.thread_id.clone(),
            status: cp.metadata.status,
            current_step: ctx.current_step.clone(),
            completed_steps: ctx.completed_steps.clone(),
            resumable: ctx.resumable,
            checkpoint_id: cp.checkpoint_id.clone(),
            step_count: cp.state.execution_metadata.step_count,
            approval: cp.state.approval_context.as_ref().map(|a| ApprovalSummary {
                approval_id: a.approval_id.clone(),
                status: a.status,
                expires_at: a.expires_at,
                escalated: a.escalated,
            }),
        }
    }
}

/// Where the loop picks up.
enum Next {
    /// Execute this node. `skip_interrupt` is set for the first node of a resume.
    Run { node: String, skip_interrupt: bool },
    /// Evaluate the routing table of a node that already completed.
    RouteFrom(String),
}

/// Per-invocation bookkeeping.
struct Run {
    thread_id: ThreadId,
    head: Option<String>,
    steps: usize,
    /// Errors recorded before this call started.
    error_floor: usize,
}

/// Drives a compiled graph: node → checkpoint → route, until a terminal node
/// or an interrupt.
///
/// Every node execution writes exactly one checkpoint. Invocations on the same
/// thread are serialized through a per-thread async mutex; different threads
/// run concurrently.
pub struct ExecutionEngine {
    graph: Arc<CompiledGraph>,
    checkpoints: Arc<dyn CheckpointSaver>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
    locks: Mutex<HashMap<ThreadId, Arc<tokio::sync::Mutex<()>>>>,
    cancel_flags: Mutex<HashSet<ThreadId>>,
}

impl ExecutionEngine {
    pub fn new(
        graph: CompiledGraph,
        checkpoints: Arc<dyn CheckpointSaver>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            checkpoints,
            event_bus,
            config,
            locks: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashSet::new()),
        }
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointSaver> {
        &self.checkpoints
    }

    fn thread_lock(&self, thread_id: &ThreadId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(thread_id.clone()).or_default().clone()
    }

    /// Drop the thread's lock entry once no other caller holds or waits on it.
    fn release_lock(&self, thread_id: &ThreadId, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let same = locks
            .get(thread_id)
            .is_some_and(|held| Arc::ptr_eq(held, &lock));
        // One reference in the map, one here.
        if same && Arc::strong_count(&lock) == 2 {
            locks.remove(thread_id);
        }
    }

    /// Run `work` while holding the thread's invocation mutex.
    async fn serialized<T>(
        &self,
        thread_id: &ThreadId,
        work: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let lock = self.thread_lock(thread_id);
        let result = {
            let _guard = lock.lock().await;
            work.await
        };
        self.release_lock(thread_id, lock);
        result
    }

    fn take_cancel_flag(&self, thread_id: &ThreadId) -> bool {
        self.cancel_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(thread_id)
    }

    /// Start a fresh run from the entry point.
    ///
    /// Engine-owned fields of `initial` are reset; completed steps and branch
    /// history carry over so the thread's history stays replayable. The first
    /// checkpoint is parented to the thread's current head, if any.
    pub async fn invoke(&self, initial: WorkflowState, thread_id: ThreadId) -> Result<RunOutcome> {
        let key = thread_id.clone();
        self.serialized(&key, self.invoke_locked(initial, thread_id))
            .await
    }

    async fn invoke_locked(&self, initial: WorkflowState, thread_id: ThreadId) -> Result<RunOutcome> {
        let head = self
            .checkpoints
            .get(&thread_id, None)
            .await?
            .map(|cp| cp.checkpoint_id);

        let mut state = initial;
        let ctx = &mut state.workflow_context;
        ctx.thread_id = Some(thread_id.to_string());
        ctx.current_step = None;
        ctx.resumable = true;
        ctx.cancel_requested = false;
        state.execution_metadata = ExecutionMetadata::default();

        info!(thread_id = %thread_id, entry = %self.graph.entry_point(), "Starting workflow run");
        self.event_bus.publish(FlowEvent::RunStarted {
            thread_id: thread_id.clone(),
            resumed: false,
        });

        let run = Run {
            thread_id,
            head,
            steps: 0,
            error_floor: state.errors.len(),
        };
        let entry = Next::Run {
            node: self.graph.entry_point().to_string(),
            skip_interrupt: false,
        };
        self.drive(run, state, entry).await
    }

    /// Continue a paused (or crashed) thread with `patch` merged into its state.
    pub async fn resume(&self, thread_id: &ThreadId, patch: StatePatch) -> Result<RunOutcome> {
        self.serialized(thread_id, self.resume_locked(thread_id, patch))
            .await
    }

    async fn resume_locked(&self, thread_id: &ThreadId, patch: StatePatch) -> Result<RunOutcome> {
        let latest = self
            .checkpoints
            .get(thread_id, None)
            .await?
            .ok_or_else(|| FlowgateError::ThreadNotFound(thread_id.to_string()))?;
        if !latest.resumable() {
            return Err(FlowgateError::ThreadNotResumable(thread_id.to_string()));
        }

        let state = latest.state.merge(patch);
        let meta = &latest.metadata;
        let next = match (&meta.resume_node, meta.node_completed) {
            (Some(node), _) => Next::Run {
                node: node.clone(),
                skip_interrupt: true,
            },
            (None, false) => Next::Run {
                node: meta.node.clone(),
                skip_interrupt: true,
            },
            (None, true) => Next::RouteFrom(meta.node.clone()),
        };

        info!(
            thread_id = %thread_id,
            from = %meta.node,
            status = %meta.status,
            "Resuming workflow run"
        );
        self.event_bus.publish(FlowEvent::RunStarted {
            thread_id: thread_id.clone(),
            resumed: true,
        });

        // A crash between a diversion checkpoint and the handler leaves the
        // diverted step's error unfinished; it still decides the final status.
        let error_floor = match meta.resume_node.as_deref() {
            Some(ERROR_HANDLER) => state
                .errors
                .iter()
                .rposition(|e| e.step == meta.node)
                .unwrap_or(state.errors.len()),
            _ => state.errors.len(),
        };
        let run = Run {
            thread_id: thread_id.clone(),
            head: Some(latest.checkpoint_id.clone()),
            steps: 0,
            error_floor,
        };
        self.drive(run, state, next).await
    }

    /// Summary of the latest checkpoint.
    pub async fn status(&self, thread_id: &ThreadId) -> Result<ThreadStatus> {
        let latest = self
            .checkpoints
            .get(thread_id, None)
            .await?
            .ok_or_else(|| FlowgateError::ThreadNotFound(thread_id.to_string()))?;
        Ok(ThreadStatus::from_checkpoint(&latest))
    }

    /// Full checkpoint history, oldest first.
    pub async fn history(&self, thread_id: &ThreadId) -> Result<Vec<Checkpoint>> {
        let history = self.checkpoints.list(thread_id).await?;
        if history.is_empty() {
            return Err(FlowgateError::ThreadNotFound(thread_id.to_string()));
        }
        Ok(history)
    }

    /// Cooperative cancellation.
    ///
    /// A running invocation stops at its next routing decision. Once the
    /// thread is idle, a paused thread gets a `cancelled` checkpoint; finished
    /// threads are left as they are.
    pub async fn cancel(&self, thread_id: &ThreadId) -> Result<ThreadStatus> {
        self.cancel_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread_id.clone());
        self.serialized(thread_id, self.cancel_locked(thread_id))
            .await
    }

    async fn cancel_locked(&self, thread_id: &ThreadId) -> Result<ThreadStatus> {
        self.take_cancel_flag(thread_id);

        let latest = self
            .checkpoints
            .get(thread_id, None)
            .await?
            .ok_or_else(|| FlowgateError::ThreadNotFound(thread_id.to_string()))?;
        if latest.metadata.status.is_finished() || !latest.resumable() {
            debug!(thread_id = %thread_id, status = %latest.metadata.status, "Cancel on finished thread ignored");
            return Ok(ThreadStatus::from_checkpoint(&latest));
        }

        let mut state = latest.state.clone();
        state.workflow_context.cancel_requested = true;
        state.workflow_context.resumable = false;
        let metadata = CheckpointMetadata {
            status: RunStatus::Cancelled,
            node: latest.metadata.node.clone(),
            step: state.execution_metadata.step_count,
            node_completed: false,
            resume_node: None,
            interrupt: None,
        };
        let cp = Checkpoint::new(
            thread_id.clone(),
            Some(latest.checkpoint_id.clone()),
            state,
            metadata,
        );
        let status = ThreadStatus::from_checkpoint(&cp);
        self.checkpoints.put(cp).await?;

        info!(thread_id = %thread_id, "Paused workflow cancelled");
        self.event_bus.publish(FlowEvent::RunFinished {
            thread_id: thread_id.clone(),
            status: RunStatus::Cancelled,
        });
        Ok(status)
    }

    async fn drive(&self, mut run: Run, mut state: WorkflowState, start: Next) -> Result<RunOutcome> {
        let mut next = start;

        loop {
            let (node, skip_interrupt) = match next {
                Next::Run {
                    node,
                    skip_interrupt,
                } => (node, skip_interrupt),
                Next::RouteFrom(from) => (self.route(&mut state, &from)?, false),
            };

            if !skip_interrupt && self.graph.is_interrupt_before(&node) {
                state.workflow_context.current_step = Some(node.clone());
                let metadata = CheckpointMetadata {
                    status: RunStatus::PausedInterrupt,
                    node: node.clone(),
                    step: state.execution_metadata.step_count,
                    node_completed: false,
                    resume_node: Some(node.clone()),
                    interrupt: Some(InterruptKind::Before),
                };
                return self.pause(&mut run, state, metadata).await;
            }

            let in_handler = node == ERROR_HANDLER;
            if !in_handler && run.steps >= self.config.max_steps {
                warn!(thread_id = %run.thread_id, node = %node, max_steps = self.config.max_steps, "Step budget exhausted");
                let err = NodeError::fatal(
                    "max_steps_exceeded",
                    FlowgateError::MaxStepsExceeded(self.config.max_steps).to_string(),
                );
                self.divert_to_handler(&mut state, &node, &err);
                next = Next::Run {
                    node: ERROR_HANDLER.to_string(),
                    skip_interrupt: false,
                };
                continue;
            }
            run.steps += 1;

            self.event_bus.publish(FlowEvent::NodeStarted {
                thread_id: run.thread_id.clone(),
                node: node.clone(),
            });
            debug!(thread_id = %run.thread_id, node = %node, step = run.steps, "Executing node");
            let started = Instant::now();

            let result = self
                .execute_node(&node, state.clone())
                .await
                .and_then(|after| match state.check_ownership(&after, &node) {
                    Ok(()) => Ok(after),
                    Err(msg) => Err(NodeError::fatal("ownership_violation", msg)),
                });
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(after) => {
                    state = after;
                    let ctx = &mut state.workflow_context;
                    ctx.completed_steps.push(node.clone());
                    ctx.current_step = Some(node.clone());
                    let meta = &mut state.execution_metadata;
                    meta.step_count += 1;
                    *meta.node_executions.entry(node.clone()).or_insert(0) += 1;

                    self.event_bus.publish(FlowEvent::NodeCompleted {
                        thread_id: run.thread_id.clone(),
                        node: node.clone(),
                        elapsed_ms,
                    });

                    if self.graph.is_terminal(&node) {
                        return self.finish(&mut run, state, &node).await;
                    }

                    if self.graph.is_interrupt_after(&node) {
                        let metadata = CheckpointMetadata {
                            status: RunStatus::PausedInterrupt,
                            node: node.clone(),
                            step: state.execution_metadata.step_count,
                            node_completed: true,
                            resume_node: None,
                            interrupt: Some(InterruptKind::After),
                        };
                        return self.pause(&mut run, state, metadata).await;
                    }

                    if self.take_cancel_flag(&run.thread_id) {
                        state.workflow_context.cancel_requested = true;
                    }
                    if state.workflow_context.cancel_requested {
                        state.workflow_context.resumable = false;
                        let metadata = CheckpointMetadata {
                            status: RunStatus::Cancelled,
                            node: node.clone(),
                            step: state.execution_metadata.step_count,
                            node_completed: true,
                            resume_node: None,
                            interrupt: None,
                        };
                        let checkpoint_id = self.write_checkpoint(&mut run, &state, metadata).await?;
                        info!(thread_id = %run.thread_id, node = %node, "Workflow run cancelled");
                        self.event_bus.publish(FlowEvent::RunFinished {
                            thread_id: run.thread_id.clone(),
                            status: RunStatus::Cancelled,
                        });
                        return Ok(RunOutcome {
                            thread_id: run.thread_id,
                            status: RunStatus::Cancelled,
                            state,
                            checkpoint_id,
                            interrupted_at: None,
                        });
                    }

                    let metadata = CheckpointMetadata {
                        status: RunStatus::Running,
                        node: node.clone(),
                        step: state.execution_metadata.step_count,
                        node_completed: true,
                        resume_node: None,
                        interrupt: None,
                    };
                    self.write_checkpoint(&mut run, &state, metadata).await?;
                    next = Next::RouteFrom(node);
                }
                Err(err) => {
                    error!(
                        thread_id = %run.thread_id,
                        node = %node,
                        code = %err.code,
                        recoverable = err.recoverable,
                        error = %err.message,
                        "Node failed"
                    );
                    self.event_bus.publish(FlowEvent::NodeFailed {
                        thread_id: run.thread_id.clone(),
                        node: node.clone(),
                        code: err.code.clone(),
                        recoverable: err.recoverable,
                    });

                    if in_handler {
                        state.errors.push(StepError::new(
                            err.code,
                            err.message,
                            node.clone(),
                            false,
                        ));
                        state.workflow_context.resumable = false;
                        let metadata = CheckpointMetadata {
                            status: RunStatus::Failed,
                            node: node.clone(),
                            step: state.execution_metadata.step_count,
                            node_completed: false,
                            resume_node: None,
                            interrupt: None,
                        };
                        let checkpoint_id = self.write_checkpoint(&mut run, &state, metadata).await?;
                        self.event_bus.publish(FlowEvent::RunFinished {
                            thread_id: run.thread_id.clone(),
                            status: RunStatus::Failed,
                        });
                        return Ok(RunOutcome {
                            thread_id: run.thread_id,
                            status: RunStatus::Failed,
                            state,
                            checkpoint_id,
                            interrupted_at: None,
                        });
                    }

                    self.divert_to_handler(&mut state, &node, &err);
                    let metadata = CheckpointMetadata {
                        status: RunStatus::Running,
                        node: node.clone(),
                        step: state.execution_metadata.step_count,
                        node_completed: false,
                        resume_node: Some(ERROR_HANDLER.to_string()),
                        interrupt: None,
                    };
                    self.write_checkpoint(&mut run, &state, metadata).await?;
                    next = Next::Run {
                        node: ERROR_HANDLER.to_string(),
                        skip_interrupt: false,
                    };
                }
            }
        }
    }

    /// Run one node body, turning panics and timeouts into node errors.
    async fn execute_node(&self, name: &str, state: WorkflowState) -> NodeResult {
        let node = self
            .graph
            .node(name)
            .cloned()
            .ok_or_else(|| NodeError::fatal("unknown_node", format!("node '{}' is not registered", name)))?;

        let guarded = AssertUnwindSafe(node.run(state)).catch_unwind();
        let outcome = match self.config.node_timeout() {
            Some(limit) => match tokio::time::timeout(limit, guarded).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(NodeError::recoverable(
                        "node_timeout",
                        format!("node '{}' exceeded {:?}", name, limit),
                    ))
                }
            },
            None => guarded.await,
        };

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let detail = panic_detail(&*panic);
                Err(NodeError::recoverable(
                    "node_panic",
                    format!("node '{}' panicked: {}", name, detail),
                ))
            }
        }
    }

    /// Evaluate the routing table of `from` and return the next node.
    ///
    /// An unmapped label or a panicking router diverts to the error handler.
    fn route(&self, state: &mut WorkflowState, from: &str) -> Result<String> {
        let table = self.graph.edges_from(from).ok_or_else(|| {
            FlowgateError::InvalidState(format!("node '{}' has no edge table", from))
        })?;
        let routed = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let (label, target) = table.route(state);
            (label, target.map(str::to_string))
        }));
        let (label, target) = match routed {
            Ok(routed) => routed,
            Err(panic) => {
                let detail = panic_detail(&*panic);
                warn!(from = %from, panic = %detail, "Router panicked");
                let err = NodeError::fatal(
                    "router_panic",
                    format!("router of '{}' panicked: {}", from, detail),
                );
                self.divert_to_handler(state, from, &err);
                return Ok(ERROR_HANDLER.to_string());
            }
        };

        match target {
            Some(target) => {
                debug!(from = %from, label = %label, to = %target, "Routing");
                state.workflow_context.branch_history.push(BranchRecord {
                    from: from.to_string(),
                    label,
                    to: target.clone(),
                });
                state.workflow_context.current_step = Some(target.clone());
                Ok(target)
            }
            None => {
                warn!(from = %from, label = %label, "Router returned an unknown label");
                let err = NodeError::fatal(
                    "unknown_route",
                    format!("router of '{}' returned unmapped label '{}'", from, label),
                );
                self.divert_to_handler(state, from, &err);
                Ok(ERROR_HANDLER.to_string())
            }
        }
    }

    /// Record `err` against `node` and point the state at the error handler.
    fn divert_to_handler(&self, state: &mut WorkflowState, node: &str, err: &NodeError) {
        state.errors.push(StepError::new(
            err.code.clone(),
            err.message.clone(),
            node,
            err.recoverable,
        ));
        let ctx = &mut state.workflow_context;
        ctx.branch_history.push(BranchRecord {
            from: node.to_string(),
            label: ERROR_LABEL.to_string(),
            to: ERROR_HANDLER.to_string(),
        });
        ctx.current_step = Some(ERROR_HANDLER.to_string());
    }

    async fn pause(
        &self,
        run: &mut Run,
        state: WorkflowState,
        metadata: CheckpointMetadata,
    ) -> Result<RunOutcome> {
        let node = metadata.node.clone();
        let checkpoint_id = self.write_checkpoint(run, &state, metadata).await?;
        info!(thread_id = %run.thread_id, node = %node, "Workflow paused at interrupt");
        self.event_bus.publish(FlowEvent::Interrupted {
            thread_id: run.thread_id.clone(),
            node: node.clone(),
        });
        Ok(RunOutcome {
            thread_id: run.thread_id.clone(),
            status: RunStatus::PausedInterrupt,
            state,
            checkpoint_id,
            interrupted_at: Some(node),
        })
    }

    async fn finish(&self, run: &mut Run, mut state: WorkflowState, node: &str) -> Result<RunOutcome> {
        let fatal = state.errors[run.error_floor.min(state.errors.len())..]
            .iter()
            .any(|e| !e.recoverable);
        let status = if fatal {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        state.workflow_context.resumable = false;

        let metadata = CheckpointMetadata {
            status,
            node: node.to_string(),
            step: state.execution_metadata.step_count,
            node_completed: true,
            resume_node: None,
            interrupt: None,
        };
        let checkpoint_id = self.write_checkpoint(run, &state, metadata).await?;
        info!(
            thread_id = %run.thread_id,
            node = %node,
            status = %status,
            steps = run.steps,
            "Workflow run finished"
        );
        self.event_bus.publish(FlowEvent::RunFinished {
            thread_id: run.thread_id.clone(),
            status,
        });
        Ok(RunOutcome {
            thread_id: run.thread_id.clone(),
            status,
            state,
            checkpoint_id,
            interrupted_at: None,
        })
    }

    async fn write_checkpoint(
        &self,
        run: &mut Run,
        state: &WorkflowState,
        metadata: CheckpointMetadata,
    ) -> Result<String> {
        let status = metadata.status;
        let node = metadata.node.clone();
        let cp = Checkpoint::new(run.thread_id.clone(), run.head.clone(), state.clone(), metadata);
        let id = cp.checkpoint_id.clone();
        self.checkpoints.put(cp).await?;
        debug!(thread_id = %run.thread_id, node = %node, status = %status, checkpoint_id = %id, "Checkpoint written");
        run.head = Some(id.clone());
        Ok(id)
    }
}

fn panic_detail(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;
    use serde_json::json;

    use flowgate_core::checkpoint::{replay_completed_steps, verify_chain};
    use flowgate_core::types::Message;

    use super::*;
    use crate::graph::{node_fn, GraphBuilder};
    use crate::memory::MemoryCheckpointStore;

    type NodeFuture = BoxFuture<'static, NodeResult>;

    fn say(text: &'static str) -> impl Fn(WorkflowState) -> NodeFuture + Send + Sync + 'static {
        move |state: WorkflowState| {
            Box::pin(async move { Ok::<_, NodeError>(state.with_message(Message::assistant(text))) })
                as NodeFuture
        }
    }

    fn engine_with(builder: GraphBuilder, config: EngineConfig) -> ExecutionEngine {
        ExecutionEngine::new(
            builder.compile().unwrap(),
            Arc::new(MemoryCheckpointStore::new()),
            Arc::new(EventBus::default()),
            config,
        )
    }

    fn engine(builder: GraphBuilder) -> ExecutionEngine {
        engine_with(builder, EngineConfig::default())
    }

    fn linear() -> GraphBuilder {
        let mut b = GraphBuilder::new();
        b.add_node("a", node_fn(say("from a"))).unwrap();
        b.add_node("b", node_fn(say("from b"))).unwrap();
        b.add_node("c", node_fn(say("from c"))).unwrap();
        b.add_edge("a", "b").unwrap();
        b.add_edge("b", "c").unwrap();
        b.set_entry_point("a").unwrap();
        b.mark_terminal("c").unwrap();
        b
    }

    #[tokio::test]
    async fn runs_to_terminal_and_checkpoints_each_node() {
        let engine = engine(linear());
        let thread = ThreadId::from_string("t1");
        let out = engine
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();

        assert_eq!(out.status, RunStatus::Completed);
        assert_eq!(out.state.messages.len(), 4);
        assert_eq!(out.state.workflow_context.completed_steps, vec!["a", "b", "c"]);
        assert!(!out.state.workflow_context.resumable);
        assert_eq!(out.state.workflow_context.branch_history.len(), 2);
        assert_eq!(out.state.workflow_context.thread_id.as_deref(), Some("t1"));

        let history = engine.history(&thread).await.unwrap();
        assert_eq!(history.len(), 3);
        verify_chain(&history).unwrap();
        assert_eq!(
            replay_completed_steps(&history),
            out.state.workflow_context.completed_steps
        );
        assert_eq!(history.last().unwrap().checkpoint_id, out.checkpoint_id);
    }

    #[tokio::test]
    async fn conditional_edge_follows_router() {
        let mut b = GraphBuilder::new();
        b.add_node("start", node_fn(say("start"))).unwrap();
        b.add_node("short", node_fn(say("short"))).unwrap();
        b.add_node("long", node_fn(say("long"))).unwrap();
        b.add_conditional_edge(
            "start",
            |s: &WorkflowState| {
                let q = s.user_query().unwrap_or_default();
                if q.len() > 5 { "long" } else { "short" }.to_string()
            },
            [("long", "long"), ("short", "short")],
        )
        .unwrap();
        b.set_entry_point("start").unwrap();
        b.mark_terminal("short").unwrap();
        b.mark_terminal("long").unwrap();
        let engine = engine(b);

        let out = engine
            .invoke(WorkflowState::from_user_message("a long question"), ThreadId::new())
            .await
            .unwrap();
        assert_eq!(out.state.latest_message().unwrap().content, "long");
        let branch = &out.state.workflow_context.branch_history[0];
        assert_eq!((branch.from.as_str(), branch.label.as_str(), branch.to.as_str()), ("start", "long", "long"));
    }

    #[tokio::test]
    async fn interrupt_before_pauses_and_resume_executes_node() {
        let mut b = linear();
        b.mark_interrupt_before("b").unwrap();
        let engine = engine(b);
        let thread = ThreadId::new();

        let paused = engine
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();
        assert_eq!(paused.status, RunStatus::PausedInterrupt);
        assert_eq!(paused.interrupted_at.as_deref(), Some("b"));
        assert_eq!(paused.state.workflow_context.current_step.as_deref(), Some("b"));
        assert_eq!(paused.state.workflow_context.completed_steps, vec!["a"]);

        let status = engine.status(&thread).await.unwrap();
        assert_eq!(status.status, RunStatus::PausedInterrupt);
        assert!(status.resumable);
        assert_eq!(status.current_step.as_deref(), Some("b"));

        let done = engine.resume(&thread, StatePatch::default()).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.state.workflow_context.completed_steps, vec!["a", "b", "c"]);

        let history = engine.history(&thread).await.unwrap();
        verify_chain(&history).unwrap();
        assert_eq!(replay_completed_steps(&history), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn interrupt_after_pauses_then_routes_on_resume() {
        let mut b = linear();
        b.mark_interrupt_after("a").unwrap();
        let engine = engine(b);
        let thread = ThreadId::new();

        let paused = engine
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();
        assert_eq!(paused.status, RunStatus::PausedInterrupt);
        assert_eq!(paused.state.messages.len(), 2);

        let done = engine.resume(&thread, StatePatch::default()).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        // a is not executed again
        assert_eq!(done.state.execution_metadata.node_executions["a"], 1);
    }

    #[tokio::test]
    async fn resume_of_finished_thread_is_rejected() {
        let engine = engine(linear());
        let thread = ThreadId::new();
        engine
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();
        let before = engine.history(&thread).await.unwrap().len();

        let err = engine.resume(&thread, StatePatch::default()).await.unwrap_err();
        assert!(matches!(err, FlowgateError::ThreadNotResumable(_)));
        assert_eq!(engine.history(&thread).await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn resume_unknown_thread_is_not_found() {
        let engine = engine(linear());
        let err = engine
            .resume(&ThreadId::from_string("nope"), StatePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowgateError::ThreadNotFound(_)));
        assert!(matches!(
            engine.status(&ThreadId::from_string("nope")).await,
            Err(FlowgateError::ThreadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn returned_error_routes_to_default_handler() {
        let mut b = GraphBuilder::new();
        b.add_node("a", node_fn(say("a"))).unwrap();
        b.add_node(
            "flaky",
            node_fn(|_state: WorkflowState| {
                Box::pin(async move { Err(NodeError::recoverable("upstream", "service down")) })
                    as NodeFuture
            }),
        )
        .unwrap();
        b.add_node("done", node_fn(say("done"))).unwrap();
        b.add_edge("a", "flaky").unwrap();
        b.add_edge("flaky", "done").unwrap();
        b.set_entry_point("a").unwrap();
        b.mark_terminal("done").unwrap();
        let engine = engine(b);
        let thread = ThreadId::new();

        let out = engine
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::Completed);
        assert_eq!(out.state.errors.len(), 1);
        assert_eq!(out.state.errors[0].code, "upstream");
        assert_eq!(out.state.errors[0].step, "flaky");
        assert!(out.state.errors[0].recoverable);

        let fallbacks = out
            .state
            .messages
            .iter()
            .filter(|m| m.source() == Some(ERROR_HANDLER))
            .count();
        assert_eq!(fallbacks, 1);
        assert!(!out.state.messages.iter().any(|m| m.content == "done"));
        assert!(!out.state.workflow_context.resumable);

        let history = engine.history(&thread).await.unwrap();
        verify_chain(&history).unwrap();
        assert_eq!(
            replay_completed_steps(&history),
            out.state.workflow_context.completed_steps
        );
    }

    #[tokio::test]
    async fn panic_is_recorded_as_recoverable() {
        let mut b = GraphBuilder::new();
        b.add_node(
            "boom",
            node_fn(|_state: WorkflowState| {
                Box::pin(async move {
                    if true {
                        panic!("kaboom");
                    }
                    Ok::<_, NodeError>(WorkflowState::new())
                }) as NodeFuture
            }),
        )
        .unwrap();
        b.set_entry_point("boom").unwrap();
        b.mark_terminal("boom").unwrap();
        let engine = engine(b);

        let out = engine
            .invoke(WorkflowState::from_user_message("hi"), ThreadId::new())
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::Completed);
        assert_eq!(out.state.errors[0].code, "node_panic");
        assert!(out.state.errors[0].message.contains("kaboom"));
        assert!(out.state.errors[0].recoverable);
    }

    #[tokio::test]
    async fn fatal_error_fails_the_run() {
        let mut b = GraphBuilder::new();
        b.add_node(
            "bad",
            node_fn(|_state: WorkflowState| {
                Box::pin(async move { Err(NodeError::fatal("corrupt", "bad input")) }) as NodeFuture
            }),
        )
        .unwrap();
        b.set_entry_point("bad").unwrap();
        b.mark_terminal("bad").unwrap();
        let engine = engine(b);
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
    async fn failing_error_handler_ends_run() {
        let mut b = GraphBuilder::new();
        b.add_node(
            "bad",
            node_fn(|_state: WorkflowState| {
                Box::pin(async move { Err(NodeError::recoverable("x", "first")) }) as NodeFuture
            }),
        )
        .unwrap();
        b.add_node(
            ERROR_HANDLER,
            node_fn(|_state: WorkflowState| {
                Box::pin(async move { Err(NodeError::recoverable("y", "second")) }) as NodeFuture
            }),
        )
        .unwrap();
        b.set_entry_point("bad").unwrap();
        b.mark_terminal("bad").unwrap();
        let engine = engine(b);

        let out = engine
            .invoke(WorkflowState::from_user_message("hi"), ThreadId::new())
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::Failed);
        assert_eq!(out.state.errors.len(), 2);
        assert_eq!(out.state.errors[1].step, ERROR_HANDLER);
        assert!(!out.state.workflow_context.resumable);
    }

    #[tokio::test]
    async fn unknown_label_is_fatal() {
        let mut b = GraphBuilder::new();
        b.add_node("a", node_fn(say("a"))).unwrap();
        b.add_node("b", node_fn(say("b"))).unwrap();
        b.add_conditional_edge("a", |_| "elsewhere".to_string(), [("b", "b")])
            .unwrap();
        b.set_entry_point("a").unwrap();
        b.mark_terminal("b").unwrap();
        let engine = engine(b);

        let out = engine
            .invoke(WorkflowState::from_user_message("hi"), ThreadId::new())
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::Failed);
        assert_eq!(out.state.errors[0].code, "unknown_route");
        assert!(!out.state.errors[0].recoverable);
    }

    #[tokio::test]
    async fn panicking_router_is_fatal_and_handled() {
        let mut b = GraphBuilder::new();
        b.add_node("a", node_fn(say("a"))).unwrap();
        b.add_node("b", node_fn(say("b"))).unwrap();
        b.add_conditional_edge(
            "a",
            |_: &WorkflowState| -> String { panic!("router exploded") },
            [("b", "b")],
        )
        .unwrap();
        b.set_entry_point("a").unwrap();
        b.mark_terminal("b").unwrap();
        let engine = engine(b);
        let thread = ThreadId::new();

        let out = engine
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::Failed);
        assert_eq!(out.state.errors.len(), 1);
        assert_eq!(out.state.errors[0].code, "router_panic");
        assert_eq!(out.state.errors[0].step, "a");
        assert!(!out.state.errors[0].recoverable);
        assert!(out.state.errors[0].message.contains("router exploded"));
        assert_eq!(
            out.state.latest_message().unwrap().source(),
            Some(ERROR_HANDLER)
        );

        let status = engine.status(&thread).await.unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert!(!status.resumable);
        assert!(matches!(
            engine.resume(&thread, StatePatch::default()).await,
            Err(FlowgateError::ThreadNotResumable(_))
        ));
    }

    fn fatal_then_done() -> GraphBuilder {
        let mut b = GraphBuilder::new();
        b.add_node(
            "broken",
            node_fn(|_: WorkflowState| {
                Box::pin(async { Err(NodeError::fatal("corrupt", "bad input")) }) as NodeFuture
            }),
        )
        .unwrap();
        b.add_node("done", node_fn(say("done"))).unwrap();
        b.add_edge("broken", "done").unwrap();
        b.set_entry_point("broken").unwrap();
        b.mark_terminal("done").unwrap();
        b
    }

    #[tokio::test]
    async fn fatal_error_survives_crash_before_handler() {
        let thread = ThreadId::new();
        let first = engine(fatal_then_done());
        first
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();
        let history = first.history(&thread).await.unwrap();
        let diverted = history[0].clone();
        assert_eq!(diverted.metadata.resume_node.as_deref(), Some(ERROR_HANDLER));

        // Only the diversion checkpoint made it to storage.
        let store = Arc::new(MemoryCheckpointStore::new());
        store.put(diverted).await.unwrap();
        let restarted = ExecutionEngine::new(
            fatal_then_done().compile().unwrap(),
            store,
            Arc::new(EventBus::default()),
            EngineConfig::default(),
        );

        let out = restarted.resume(&thread, StatePatch::default()).await.unwrap();
        assert_eq!(out.status, RunStatus::Failed);
        assert_eq!(out.state.errors.len(), 1);
        assert!(!out.state.workflow_context.resumable);
        let handler_messages = out
            .state
            .messages
            .iter()
            .filter(|m| m.source() == Some(ERROR_HANDLER))
            .count();
        assert_eq!(handler_messages, 1);
    }

    #[tokio::test]
    async fn max_steps_bounds_cycles() {
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let mut b = GraphBuilder::new();
        b.add_node(
            "loop",
            node_fn(move |state: WorkflowState| {
                seen.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Ok::<_, NodeError>(state) }) as NodeFuture
            }),
        )
        .unwrap();
        b.add_edge("loop", "loop").unwrap();
        b.set_entry_point("loop").unwrap();
        let engine = engine_with(
            b,
            EngineConfig {
                max_steps: 4,
                node_timeout_secs: 0,
            },
        );

        let out = engine
            .invoke(WorkflowState::from_user_message("hi"), ThreadId::new())
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(out.status, RunStatus::Failed);
        assert_eq!(out.state.errors[0].code, "max_steps_exceeded");
        assert_eq!(
            out.state.latest_message().unwrap().source(),
            Some(ERROR_HANDLER)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_node_times_out() {
        let mut b = GraphBuilder::new();
        b.add_node(
            "slow",
            node_fn(|state: WorkflowState| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, NodeError>(state)
                }) as NodeFuture
            }),
        )
        .unwrap();
        b.set_entry_point("slow").unwrap();
        b.mark_terminal("slow").unwrap();
        let engine = engine_with(
            b,
            EngineConfig {
                max_steps: 25,
                node_timeout_secs: 1,
            },
        );

        let out = engine
            .invoke(WorkflowState::from_user_message("hi"), ThreadId::new())
            .await
            .unwrap();
        assert_eq!(out.state.errors[0].code, "node_timeout");
        assert!(out.state.errors[0].recoverable);
        assert_eq!(out.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn ownership_violation_is_fatal() {
        let mut b = GraphBuilder::new();
        b.add_node(
            "meddler",
            node_fn(|mut state: WorkflowState| {
                Box::pin(async move {
                    state.active_step_context.set("someone_else", json!(1));
                    Ok::<_, NodeError>(state)
                }) as NodeFuture
            }),
        )
        .unwrap();
        b.set_entry_point("meddler").unwrap();
        b.mark_terminal("meddler").unwrap();
        let engine = engine(b);

        let out = engine
            .invoke(WorkflowState::from_user_message("hi"), ThreadId::new())
            .await
            .unwrap();
        assert_eq!(out.status, RunStatus::Failed);
        assert_eq!(out.state.errors[0].code, "ownership_violation");
        assert!(out.state.active_step_context.get("someone_else").is_none());
    }

    #[tokio::test]
    async fn cancel_paused_thread_appends_cancelled_checkpoint() {
        let mut b = linear();
        b.mark_interrupt_before("b").unwrap();
        let engine = engine(b);
        let thread = ThreadId::new();
        engine
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();

        let status = engine.cancel(&thread).await.unwrap();
        assert_eq!(status.status, RunStatus::Cancelled);
        assert!(!status.resumable);
        assert!(matches!(
            engine.resume(&thread, StatePatch::default()).await,
            Err(FlowgateError::ThreadNotResumable(_))
        ));

        // cancelling again leaves the finished thread untouched
        let len = engine.history(&thread).await.unwrap().len();
        engine.cancel(&thread).await.unwrap();
        assert_eq!(engine.history(&thread).await.unwrap().len(), len);
    }

    #[tokio::test]
    async fn cancel_patch_stops_at_next_routing() {
        let mut b = linear();
        b.mark_interrupt_before("b").unwrap();
        let engine = engine(b);
        let thread = ThreadId::new();
        engine
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();

        let patch = StatePatch {
            cancel: Some(true),
            ..StatePatch::default()
        };
        let out = engine.resume(&thread, patch).await.unwrap();
        assert_eq!(out.status, RunStatus::Cancelled);
        assert_eq!(out.state.workflow_context.completed_steps, vec!["a", "b"]);
        assert!(out.state.workflow_context.cancel_requested);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_resumes_run_the_node_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let seen = runs.clone();
        let mut b = GraphBuilder::new();
        b.add_node("a", node_fn(say("a"))).unwrap();
        b.add_node(
            "gate",
            node_fn(move |state: WorkflowState| {
                seen.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, NodeError>(state.with_message(Message::assistant("passed")))
                }) as NodeFuture
            }),
        )
        .unwrap();
        b.add_edge("a", "gate").unwrap();
        b.set_entry_point("a").unwrap();
        b.mark_terminal("gate").unwrap();
        b.mark_interrupt_before("gate").unwrap();
        let engine = Arc::new(engine(b));
        let thread = ThreadId::new();
        engine
            .invoke(WorkflowState::from_user_message("hi"), thread.clone())
            .await
            .unwrap();

        let (e1, t1) = (engine.clone(), thread.clone());
        let (e2, t2) = (engine.clone(), thread.clone());
        let first = tokio::spawn(async move { e1.resume(&t1, StatePatch::default()).await });
        let second = tokio::spawn(async move { e2.resume(&t2, StatePatch::default()).await });
        let results = [first.await.unwrap(), second.await.unwrap()];

        let finished = results.iter().filter(|r| r.is_ok()).count();
        let refused = results
            .iter()
            .filter(|r| matches!(r, Err(FlowgateError::ThreadNotResumable(_))))
            .count();
        assert_eq!((finished, refused), (1, 1));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let history = engine.history(&thread).await.unwrap();
        verify_chain(&history).unwrap();
        assert_eq!(replay_completed_steps(&history), vec!["a", "gate"]);
        assert!(engine.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_stops_in_flight_run_at_next_routing() {
        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let (entered_tx, release_rx) = (entered.clone(), release.clone());
        let mut b = GraphBuilder::new();
        b.add_node(
            "a",
            node_fn(move |state: WorkflowState| {
                let (entered, release) = (entered_tx.clone(), release_rx.clone());
                Box::pin(async move {
                    entered.notify_one();
                    release.notified().await;
                    Ok::<_, NodeError>(state)
                }) as NodeFuture
            }),
        )
        .unwrap();
        b.add_node("b", node_fn(say("from b"))).unwrap();
        b.add_edge("a", "b").unwrap();
        b.set_entry_point("a").unwrap();
        b.mark_terminal("b").unwrap();
        let engine = Arc::new(engine(b));
        let thread = ThreadId::new();

        let (e, t) = (engine.clone(), thread.clone());
        let run = tokio::spawn(async move {
            e.invoke(WorkflowState::from_user_message("hi"), t).await
        });
        entered.notified().await;

        let (e, t) = (engine.clone(), thread.clone());
        let cancel = tokio::spawn(async move { e.cancel(&t).await });
        while !engine.cancel_flags.lock().unwrap().contains(&thread) {
            tokio::task::yield_now().await;
        }
        release.notify_one();

        let out = run.await.unwrap().unwrap();
        assert_eq!(out.status, RunStatus::Cancelled);
        assert_eq!(out.state.workflow_context.completed_steps, vec!["a"]);
        assert!(out.state.workflow_context.cancel_requested);
        assert!(!out.state.workflow_context.resumable);

        let status = cancel.await.unwrap().unwrap();
        assert_eq!(status.status, RunStatus::Cancelled);
        assert_eq!(engine.history(&thread).await.unwrap().len(), 1);
        assert!(engine.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_invoke_extends_the_same_chain() {
        let engine = engine(linear());
        let thread = ThreadId::new();
        let first = engine
            .invoke(WorkflowState::from_user_message("one"), thread.clone())
            .await
            .unwrap();
        let next_state = first.state.with_message(Message::user("two"));
        engine.invoke(next_state, thread.clone()).await.unwrap();

        let history = engine.history(&thread).await.unwrap();
        assert_eq!(history.len(), 6);
        verify_chain(&history).unwrap();
        assert_eq!(replay_completed_steps(&history).len(), 6);
    }
}
