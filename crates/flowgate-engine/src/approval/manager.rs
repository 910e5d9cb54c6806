use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use flowgate_core::approval::{
    ApprovalDecision, ApprovalRequest, ApprovalStatus, AuditEntry, Resolution, RiskLevel,
};
use flowgate_core::config::ApprovalConfig;
use flowgate_core::error::{FlowgateError, Result};
use flowgate_core::event::{EventBus, FlowEvent};
use flowgate_core::traits::{ApprovalRepository, Clock, RiskScorer};

use super::risk::content_hash;

const SYSTEM_ACTOR: &str = "system";
const SUPERSEDED_ACTOR: &str = "system:superseded";
const TIMEOUT_ACTOR: &str = "system:timeout";

/// Coordinates approval requests: risk routing, dedup, deadlines,
/// escalation and reviewer decisions.
///
/// The repository is the source of truth. Every status change goes through
/// its `compare_and_set_status`, so a deadline timer and a reviewer racing
/// on the same request produce exactly one terminal status. The in-memory
/// index of pending requests is a cache rebuilt by `restore()`.
#[derive(Clone)]
pub struct ApprovalManager {
    inner: Arc<Inner>,
}

struct Inner {
    repo: Arc<dyn ApprovalRepository>,
    scorer: Arc<dyn RiskScorer>,
    clock: Arc<dyn Clock>,
    event_bus: Arc<EventBus>,
    config: ApprovalConfig,
    index: Mutex<HashMap<String, ApprovalRequest>>,
    timers: Mutex<HashMap<String, CancellationToken>>,
    shutdown: CancellationToken,
}

/// Clamp a raw score into [0, 1]; NaN is treated as maximum risk.
fn normalize_score(raw: f64) -> f64 {
    if raw.is_nan() {
        1.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

fn secs(n: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

/// `from + ttl`, or a config error when the deadline leaves chrono's range.
fn deadline(from: DateTime<Utc>, ttl: chrono::Duration) -> Result<DateTime<Utc>> {
    from.checked_add_signed(ttl).ok_or_else(|| {
        FlowgateError::Config(format!(
            "approval deadline of {}s from {} is out of range",
            ttl.num_seconds(),
            from
        ))
    })
}

impl ApprovalManager {
    pub fn new(
        repo: Arc<dyn ApprovalRepository>,
        scorer: Arc<dyn RiskScorer>,
        clock: Arc<dyn Clock>,
        event_bus: Arc<EventBus>,
        config: ApprovalConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                scorer,
                clock,
                event_bus,
                config,
                index: Mutex::new(HashMap::new()),
                timers: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn config(&self) -> &ApprovalConfig {
        &self.inner.config
    }

    /// Deadline length for a risk tier.
    pub fn tier_timeout(&self, level: RiskLevel) -> chrono::Duration {
        let cfg = &self.inner.config;
        match level {
            RiskLevel::Critical => secs(cfg.critical_timeout_secs),
            RiskLevel::High => secs(cfg.high_timeout_secs),
            RiskLevel::Medium | RiskLevel::Low => secs(cfg.default_timeout_secs),
        }
    }

    /// Score `content` and either approve it outright, reuse an identical
    /// pending request, or open a new one.
    pub async fn assess_and_submit(&self, thread_id: &str, content: &str) -> Result<ApprovalDecision> {
        let cfg = &self.inner.config;
        let raw = self.inner.scorer.score(content).await?;
        let score = normalize_score(raw);
        let level = RiskLevel::classify(
            score,
            cfg.auto_approve_threshold,
            cfg.high_risk_threshold,
            cfg.critical_risk_threshold,
        );

        if score <= cfg.auto_approve_threshold {
            debug!(thread_id, score, "Content auto-approved");
            return Ok(ApprovalDecision::AutoApproved {
                risk_score: score,
                risk_level: level,
            });
        }

        let now = self.now();
        let hash = content_hash(content);
        let since = now
            .checked_sub_signed(secs(cfg.dedup_window_secs))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if let Some(existing) = self.inner.repo.find_pending(thread_id, &hash, since).await? {
            if existing.is_expired(now) {
                self.on_timeout(&existing.id).await?;
            } else {
                debug!(thread_id, approval_id = %existing.id, "Reusing identical pending request");
                return Ok(ApprovalDecision::Existing { request: existing });
            }
        }

        self.supersede_pending(thread_id).await?;

        let escalated = score >= cfg.escalation_threshold;
        let ttl = self.tier_timeout(level);
        let mut expires_at = deadline(now, ttl)?;
        if escalated {
            expires_at = deadline(expires_at, ttl)?;
        }
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            content_hash: hash,
            risk_level: level,
            risk_score: score,
            status: ApprovalStatus::Pending,
            submitted_at: now,
            expires_at,
            escalated,
            reviewer_id: None,
            resolved_at: None,
            response_latency_ms: None,
        };
        self.inner.repo.insert(request.clone()).await?;
        self.audit(&request.id, "submit", SYSTEM_ACTOR, ApprovalStatus::Pending, ApprovalStatus::Pending)
            .await?;
        if escalated {
            self.audit(&request.id, "escalate", SYSTEM_ACTOR, ApprovalStatus::Pending, ApprovalStatus::Escalated)
                .await?;
        }

        self.index_insert(&request);
        self.arm_timer(&request);
        info!(
            thread_id,
            approval_id = %request.id,
            risk_level = %level,
            score,
            escalated,
            expires_at = %request.expires_at,
            "Approval requested"
        );
        self.inner.event_bus.publish(FlowEvent::ApprovalRequested {
            approval_id: request.id.clone(),
            thread_id: thread_id.to_string(),
            escalated,
        });
        Ok(ApprovalDecision::Pending { request })
    }

    /// Reject every pending request of `thread_id`; a thread has at most one
    /// live request.
    async fn supersede_pending(&self, thread_id: &str) -> Result<()> {
        for old in self.inner.repo.list_pending(Some(thread_id)).await? {
            let resolution = Resolution {
                reviewer_id: Some(SUPERSEDED_ACTOR.to_string()),
                resolved_at: Some(self.now()),
                response_latency_ms: None,
            };
            let won = self
                .inner
                .repo
                .compare_and_set_status(&old.id, ApprovalStatus::Pending, ApprovalStatus::Rejected, resolution)
                .await?;
            if won {
                info!(thread_id, approval_id = %old.id, "Superseded pending approval");
                self.settle(&old.id, "supersede", SUPERSEDED_ACTOR, ApprovalStatus::Rejected)
                    .await?;
            }
        }
        Ok(())
    }

    /// Record a reviewer decision.
    ///
    /// Fails with `InvalidStateTransition` without mutating anything when the
    /// request is no longer pending, including when a timer won the race.
    pub async fn on_decision(
        &self,
        id: &str,
        approved: bool,
        reviewer_id: &str,
    ) -> Result<ApprovalRequest> {
        let current = self.get(id).await?;
        let target = if approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        if current.status != ApprovalStatus::Pending {
            return Err(FlowgateError::InvalidStateTransition {
                approval_id: id.to_string(),
                from: current.status.to_string(),
                to: target.to_string(),
            });
        }

        let now = self.now();
        let resolution = Resolution {
            reviewer_id: Some(reviewer_id.to_string()),
            resolved_at: Some(now),
            response_latency_ms: Some((now - current.submitted_at).num_milliseconds().max(0)),
        };
        let won = self
            .inner
            .repo
            .compare_and_set_status(id, ApprovalStatus::Pending, target, resolution)
            .await?;
        if !won {
            let latest = self.get(id).await?;
            warn!(approval_id = %id, status = %latest.status, "Decision lost the race");
            return Err(FlowgateError::InvalidStateTransition {
                approval_id: id.to_string(),
                from: latest.status.to_string(),
                to: target.to_string(),
            });
        }

        let action = if approved { "approve" } else { "reject" };
        self.settle(id, action, reviewer_id, target).await?;
        info!(approval_id = %id, reviewer_id, status = %target, "Approval decided");
        self.get(id).await
    }

    /// Move a pending request to `timeout`. Returns `false` when another
    /// transition already landed.
    pub async fn on_timeout(&self, id: &str) -> Result<bool> {
        let Some(current) = self.inner.repo.get(id).await? else {
            return Ok(false);
        };
        if current.status != ApprovalStatus::Pending {
            return Ok(false);
        }
        let now = self.now();
        let resolution = Resolution {
            reviewer_id: None,
            resolved_at: Some(now),
            response_latency_ms: Some((now - current.submitted_at).num_milliseconds().max(0)),
        };
        let won = self
            .inner
            .repo
            .compare_and_set_status(id, ApprovalStatus::Pending, ApprovalStatus::Timeout, resolution)
            .await?;
        if !won {
            debug!(approval_id = %id, "Timeout lost the race");
            return Ok(false);
        }
        self.settle(id, "timeout", TIMEOUT_ACTOR, ApprovalStatus::Timeout)
            .await?;
        info!(approval_id = %id, "Approval timed out");
        Ok(true)
    }

    /// Extend the deadline of a pending request by its tier timeout.
    ///
    /// The stored status stays `pending`; the audit trail records the
    /// `pending → escalated` step.
    pub async fn escalate(&self, id: &str, actor: &str) -> Result<ApprovalRequest> {
        let current = self.get(id).await?;
        if current.status != ApprovalStatus::Pending {
            return Err(FlowgateError::InvalidStateTransition {
                approval_id: id.to_string(),
                from: current.status.to_string(),
                to: ApprovalStatus::Escalated.to_string(),
            });
        }

        let base = current.expires_at.max(self.now());
        let expires_at = deadline(base, self.tier_timeout(current.risk_level))?;
        if !self.inner.repo.extend_expiry(id, expires_at).await? {
            let latest = self.get(id).await?;
            return Err(FlowgateError::InvalidStateTransition {
                approval_id: id.to_string(),
                from: latest.status.to_string(),
                to: ApprovalStatus::Escalated.to_string(),
            });
        }
        self.audit(id, "escalate", actor, ApprovalStatus::Pending, ApprovalStatus::Escalated)
            .await?;

        let updated = self.get(id).await?;
        self.index_insert(&updated);
        self.arm_timer(&updated);
        info!(approval_id = %id, actor, expires_at = %expires_at, "Approval escalated");
        self.inner.event_bus.publish(FlowEvent::ApprovalEscalated {
            approval_id: id.to_string(),
        });
        Ok(updated)
    }

    /// Time out `id` if its deadline has passed, then return its current state.
    pub async fn check_expired(&self, id: &str) -> Result<ApprovalRequest> {
        let current = self.get(id).await?;
        if current.is_expired(self.now()) {
            self.on_timeout(id).await?;
            return self.get(id).await;
        }
        Ok(current)
    }

    /// Time out every overdue pending request. Returns how many moved.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = self.now();
        let mut expired = 0;
        for request in self.inner.repo.list_pending(None).await? {
            if request.is_expired(now) && self.on_timeout(&request.id).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Rebuild the pending index from the repository and re-arm deadlines.
    ///
    /// Requests that expired while the process was down are timed out
    /// immediately. Returns the number of requests still pending.
    pub async fn restore(&self) -> Result<usize> {
        let pending = self.inner.repo.list_pending(None).await?;
        self.inner
            .index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let now = self.now();
        let mut live = 0;
        for request in pending {
            if request.is_expired(now) {
                self.on_timeout(&request.id).await?;
            } else {
                self.index_insert(&request);
                self.arm_timer(&request);
                live += 1;
            }
        }
        info!(pending = live, "Approval index restored");
        Ok(live)
    }

    pub async fn get(&self, id: &str) -> Result<ApprovalRequest> {
        self.inner
            .repo
            .get(id)
            .await?
            .ok_or_else(|| FlowgateError::ApprovalNotFound(id.to_string()))
    }

    /// Pending requests, read from the repository.
    pub async fn pending(&self) -> Result<Vec<ApprovalRequest>> {
        self.inner.repo.list_pending(None).await
    }

    pub async fn pending_for_thread(&self, thread_id: &str) -> Result<Vec<ApprovalRequest>> {
        self.inner.repo.list_pending(Some(thread_id)).await
    }

    /// Pending requests as seen by the in-memory index.
    pub fn cached_pending(&self) -> Vec<ApprovalRequest> {
        let index = self.inner.index.lock().unwrap_or_else(PoisonError::into_inner);
        let mut requests: Vec<_> = index.values().cloned().collect();
        requests.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        requests
    }

    pub async fn audit_trail(&self, id: &str) -> Result<Vec<AuditEntry>> {
        self.inner.repo.audit_trail(id).await
    }

    /// Disarm every deadline timer.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Bookkeeping after a successful pending → terminal transition.
    async fn settle(&self, id: &str, action: &str, actor: &str, new_status: ApprovalStatus) -> Result<()> {
        self.disarm_timer(id);
        self.inner
            .index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        self.audit(id, action, actor, ApprovalStatus::Pending, new_status)
            .await?;
        self.inner.event_bus.publish(FlowEvent::ApprovalResolved {
            approval_id: id.to_string(),
            status: new_status,
        });
        Ok(())
    }

    async fn audit(
        &self,
        id: &str,
        action: &str,
        actor: &str,
        previous_status: ApprovalStatus,
        new_status: ApprovalStatus,
    ) -> Result<()> {
        self.inner
            .repo
            .append_audit(AuditEntry {
                approval_id: id.to_string(),
                action: action.to_string(),
                actor: actor.to_string(),
                previous_status,
                new_status,
                timestamp: self.now(),
            })
            .await
    }

    fn index_insert(&self, request: &ApprovalRequest) {
        self.inner
            .index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.id.clone(), request.clone());
    }

    fn arm_timer(&self, request: &ApprovalRequest) {
        let token = self.inner.shutdown.child_token();
        let previous = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request.id.clone(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let delay = (request.expires_at - self.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let manager = self.clone();
        let id = request.id.clone();
        debug!(approval_id = %id, delay_secs = delay.as_secs(), "Deadline timer armed");

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(approval_id = %id, "Deadline timer disarmed");
                }
                _ = tokio::time::sleep(delay) => {
                    match manager.on_timeout(&id).await {
                        Ok(true) => {}
                        Ok(false) => debug!(approval_id = %id, "Deadline fired after resolution"),
                        Err(e) => warn!(approval_id = %id, error = %e, "Deadline handling failed"),
                    }
                }
            }
        });
    }

    fn disarm_timer(&self, id: &str) {
        let token = self
            .inner
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if let Some(token) = token {
            token.cancel();
        }
    }
}
