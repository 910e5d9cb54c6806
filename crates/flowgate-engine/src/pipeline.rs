//! The reference conversational pipeline.
//!
//! ```text
//! retrieve → persona → reason → assess_risk ─┬─ simple ──────────────────────→ finalize
//!                                             └─ sensitive → human_approval ──→ finalize
//! ```
//!
//! `human_approval` is an interrupt-before node: a sensitive draft pauses
//! the thread until a reviewer decision is supplied through `resume`.
//! The three collaborators (retrieval, persona, response drafting) are
//! traits so deployments can swap in real backends.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use flowgate_core::approval::ApprovalStatus;
use flowgate_core::config::{DocumentConfig, PersonaConfig, PipelineConfig};
use flowgate_core::error::Result;
use flowgate_core::state::{StepContext, WorkflowState};
use flowgate_core::types::{Message, NodeError};

use crate::approval::{
    approval_route, ApprovalAssessNode, ApprovalManager, HumanApprovalNode, SENSITIVE, SIMPLE,
};
use crate::graph::{CompiledGraph, GraphBuilder, Node, NodeResult};

pub const RETRIEVE: &str = "retrieve";
pub const PERSONA: &str = "persona";
pub const REASON: &str = "reason";
pub const ASSESS_RISK: &str = "assess_risk";
pub const HUMAN_APPROVAL: &str = "human_approval";
pub const FINALIZE: &str = "finalize";

/// A document returned by a retriever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    pub text: String,
    pub score: f64,
}

/// How the assistant presents itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaProfile {
    pub name: String,
    pub tone: String,
    #[serde(default)]
    pub instructions: Option<String>,
}

/// Finds documents relevant to a query.
pub trait Retriever: Send + Sync + 'static {
    fn retrieve<'a>(
        &'a self,
        query: &'a str,
        top_k: usize,
    ) -> BoxFuture<'a, Result<Vec<RetrievedDocument>>>;
}

/// Supplies the persona for the current conversation.
pub trait PersonaProvider: Send + Sync + 'static {
    fn profile(&self) -> PersonaProfile;
}

/// Drafts an answer from the query and the step context gathered so far.
pub trait Responder: Send + Sync + 'static {
    fn respond<'a>(
        &'a self,
        query: &'a str,
        context: &'a StepContext,
    ) -> BoxFuture<'a, Result<String>>;
}

// ── Default collaborators ───────────────────────────────────────────

fn tokens(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

/// Ranks configured documents by query-term overlap.
pub struct KeywordRetriever {
    documents: Vec<DocumentConfig>,
}

impl KeywordRetriever {
    pub fn new(documents: Vec<DocumentConfig>) -> Self {
        Self { documents }
    }
}

impl Retriever for KeywordRetriever {
    fn retrieve<'a>(
        &'a self,
        query: &'a str,
        top_k: usize,
    ) -> BoxFuture<'a, Result<Vec<RetrievedDocument>>> {
        Box::pin(async move {
            let wanted = tokens(query);
            if wanted.is_empty() {
                return Ok(Vec::new());
            }
            let mut hits: Vec<RetrievedDocument> = self
                .documents
                .iter()
                .filter_map(|doc| {
                    let mut haystack = doc.text.clone();
                    if let Some(title) = &doc.title {
                        haystack.push(' ');
                        haystack.push_str(title);
                    }
                    let have = tokens(&haystack);
                    let overlap = wanted.intersection(&have).count();
                    (overlap > 0).then(|| RetrievedDocument {
                        id: doc.id.clone(),
                        title: doc.title.clone(),
                        text: doc.text.clone(),
                        score: overlap as f64 / wanted.len() as f64,
                    })
                })
                .collect();
            hits.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            hits.truncate(top_k);
            Ok(hits)
        })
    }
}

/// Persona taken straight from configuration.
pub struct StaticPersona {
    profile: PersonaProfile,
}

impl StaticPersona {
    pub fn new(config: &PersonaConfig) -> Self {
        Self {
            profile: PersonaProfile {
                name: config.name.clone(),
                tone: config.tone.clone(),
                instructions: config.instructions.clone(),
            },
        }
    }
}

impl PersonaProvider for StaticPersona {
    fn profile(&self) -> PersonaProfile {
        self.profile.clone()
    }
}

/// Builds a draft by quoting the best retrieved document.
#[derive(Debug, Default)]
pub struct ExtractiveResponder;

impl Responder for ExtractiveResponder {
    fn respond<'a>(
        &'a self,
        query: &'a str,
        context: &'a StepContext,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let best = context
                .get(RETRIEVE)
                .and_then(|v| v.get("documents"))
                .and_then(|v| v.as_array())
                .and_then(|docs| docs.first())
                .and_then(|doc| doc.get("text"))
                .and_then(|t| t.as_str());
            let name = context.get_str(PERSONA, "name").unwrap_or("assistant");

            Ok(match best {
                Some(text) => {
                    let first = text.split_inclusive('.').next().unwrap_or(text).trim();
                    format!("{} here. Regarding \"{}\": {}", name, query.trim(), first)
                }
                None => format!(
                    "{} here. I could not find anything specific about \"{}\".",
                    name,
                    query.trim()
                ),
            })
        })
    }
}

// ── Nodes ───────────────────────────────────────────────────────────

fn require_query(state: &WorkflowState) -> std::result::Result<String, NodeError> {
    state
        .user_query()
        .filter(|q| !q.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| NodeError::recoverable("missing_query", "no user message in state"))
}

pub struct RetrieveNode {
    retriever: Arc<dyn Retriever>,
    top_k: usize,
}

impl Node for RetrieveNode {
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let query = require_query(&state)?;
            let documents = self
                .retriever
                .retrieve(&query, self.top_k)
                .await
                .map_err(|e| NodeError::recoverable("retrieval_failed", e.to_string()))?;
            debug!(hits = documents.len(), "Documents retrieved");
            Ok(state.with_step_context(
                RETRIEVE,
                json!({ "query": query, "documents": documents }),
            ))
        })
    }
}

pub struct PersonaNode {
    provider: Arc<dyn PersonaProvider>,
}

impl Node for PersonaNode {
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let profile = self.provider.profile();
            Ok(state.with_step_context(PERSONA, json!(profile)))
        })
    }
}

pub struct ReasonNode {
    responder: Arc<dyn Responder>,
}

impl Node for ReasonNode {
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let query = require_query(&state)?;
            let draft = self
                .responder
                .respond(&query, &state.active_step_context)
                .await
                .map_err(|e| NodeError::recoverable("response_failed", e.to_string()))?;
            Ok(state.with_step_context(REASON, json!({ "draft": draft })))
        })
    }
}

/// Emits the final assistant message according to the approval outcome.
pub struct FinalizeNode;

impl FinalizeNode {
    fn compose(state: &WorkflowState) -> (String, &'static str) {
        let draft = state
            .active_step_context
            .get_str(REASON, "draft")
            .unwrap_or_default()
            .to_string();
        match state.approval_status() {
            None | Some(ApprovalStatus::Approved) => (draft, "delivered"),
            Some(ApprovalStatus::Rejected) => (
                "A reviewer declined to release this answer. Please rephrase or contact support."
                    .to_string(),
                "rejected",
            ),
            Some(ApprovalStatus::Timeout) => (
                "This answer needed a review that did not happen in time. Please ask again."
                    .to_string(),
                "expired",
            ),
            Some(ApprovalStatus::Pending) | Some(ApprovalStatus::Escalated) => (
                "This answer is still waiting for review.".to_string(),
                "withheld",
            ),
        }
    }
}

impl Node for FinalizeNode {
    fn run(&self, state: WorkflowState) -> BoxFuture<'_, NodeResult> {
        Box::pin(async move {
            let (content, outcome) = Self::compose(&state);
            if content.is_empty() {
                return Err(NodeError::recoverable("missing_content", "no draft to deliver"));
            }
            let msg = Message::assistant(content)
                .with_meta("source", json!(FINALIZE))
                .with_meta("outcome", json!(outcome));
            Ok(state
                .with_message(msg)
                .with_step_context(FINALIZE, json!({ "outcome": outcome })))
        })
    }
}

// ── Graph ───────────────────────────────────────────────────────────

/// The pluggable parts of the pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub retriever: Arc<dyn Retriever>,
    pub persona: Arc<dyn PersonaProvider>,
    pub responder: Arc<dyn Responder>,
    pub top_k: usize,
}

impl Collaborators {
    /// Default collaborators built from `[pipeline]` settings.
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            retriever: Arc::new(KeywordRetriever::new(config.documents.clone())),
            persona: Arc::new(StaticPersona::new(&config.persona)),
            responder: Arc::new(ExtractiveResponder),
            top_k: config.top_k,
        }
    }
}

/// Build and compile the reference pipeline.
pub fn conversation_graph(
    collaborators: Collaborators,
    approvals: ApprovalManager,
) -> Result<CompiledGraph> {
    let mut b = GraphBuilder::new();
    b.add_node(
        RETRIEVE,
        RetrieveNode {
            retriever: collaborators.retriever,
            top_k: collaborators.top_k,
        },
    )?
    .add_node(
        PERSONA,
        PersonaNode {
            provider: collaborators.persona,
        },
    )?
    .add_node(
        REASON,
        ReasonNode {
            responder: collaborators.responder,
        },
    )?
    .add_node(
        ASSESS_RISK,
        ApprovalAssessNode::new(approvals.clone())
            .named(ASSESS_RISK)
            .with_content_from(REASON, "draft"),
    )?
    .add_node(
        HUMAN_APPROVAL,
        HumanApprovalNode::new(approvals).named(HUMAN_APPROVAL),
    )?
    .add_node(FINALIZE, FinalizeNode)?;

    b.add_edge(RETRIEVE, PERSONA)?
        .add_edge(PERSONA, REASON)?
        .add_edge(REASON, ASSESS_RISK)?
        .add_conditional_edge(
            ASSESS_RISK,
            approval_route,
            [(SIMPLE, FINALIZE), (SENSITIVE, HUMAN_APPROVAL)],
        )?
        .add_edge(HUMAN_APPROVAL, FINALIZE)?;

    b.set_entry_point(RETRIEVE)?
        .mark_terminal(FINALIZE)?
        .mark_interrupt_before(HUMAN_APPROVAL)?;
    b.compile()
}
