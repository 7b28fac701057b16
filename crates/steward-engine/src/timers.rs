//! Timer/SLA service
//!
//! Scheduling, atomic claim/mark-fired, lease-based reclaim, and SLA
//! recalculation with its audit trail.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use steward_core::{
    AuditKind, AuditRecord, EngineError, StepStatus, Timer, TimerPurpose,
};
use steward_storage::Storage;

use crate::engine::ExecutionEngine;

/// Request to recalculate the current step's SLA
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaRecalcRequest {
    pub organization_id: Uuid,
    pub execution_id: Uuid,

    /// New deadline, in hours relative to the current step's start
    pub sla_override_hours: i64,

    #[serde(default)]
    pub recalc_reason: Option<String>,
    pub recalc_by: String,

    /// Explicit override needed to move a deadline into the past
    #[serde(default)]
    pub allow_past: bool,
}

/// Receipt for an SLA recalculation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaRecalcReceipt {
    pub old_due_at: Option<DateTime<Utc>>,
    pub new_due_at: DateTime<Utc>,
}

/// Manages timers: SLA deadlines, retry firings, reminders, wait delays
pub struct TimerService<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> TimerService<S> {
    pub(crate) fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub async fn schedule(&self, timer: Timer) -> Result<Timer, EngineError> {
        self.storage.insert_timer(&timer).await?;
        debug!(timer_id = %timer.timer_id, purpose = %timer.purpose, fire_at = %timer.fire_at, "timer scheduled");
        Ok(timer)
    }

    /// Atomically claim due timers for a sweep worker
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Vec<Timer>, EngineError> {
        Ok(self
            .storage
            .claim_due_timers(now, limit, worker_id, lease)
            .await?)
    }

    /// Transition `fired` false -> true, exactly once
    pub async fn mark_fired(&self, timer_id: Uuid, worker_id: &str) -> Result<(), EngineError> {
        Ok(self.storage.mark_timer_fired(timer_id, worker_id).await?)
    }

    /// Give up a claim after a processing failure so another sweep retries
    pub async fn release(&self, timer_id: Uuid, worker_id: &str) -> Result<(), EngineError> {
        Ok(self.storage.release_timer_claim(timer_id, worker_id).await?)
    }

    /// Cancel unfired, unclaimed timers attached to one step instance.
    ///
    /// A timer currently claimed by a sweep worker is left alone: its
    /// handler re-checks instance/step state and marks it fired itself.
    pub(crate) async fn cancel_for_step_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_instance_id: Uuid,
    ) -> Result<(), EngineError> {
        let pending = self
            .storage
            .pending_timers_for_execution(organization_id, execution_id)
            .await?;
        for timer in pending {
            if timer.step_instance_id == Some(step_instance_id) && timer.claimed_by.is_none() {
                self.storage
                    .cancel_timer(organization_id, timer.timer_id)
                    .await?;
            }
        }
        Ok(())
    }

    /// Cancel every unfired, unclaimed timer of an execution (terminal
    /// cleanup)
    pub(crate) async fn cancel_all_pending(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let pending = self
            .storage
            .pending_timers_for_execution(organization_id, execution_id)
            .await?;
        for timer in pending {
            if timer.claimed_by.is_none() {
                self.storage
                    .cancel_timer(organization_id, timer.timer_id)
                    .await?;
            }
        }
        Ok(())
    }
}

impl<S: Storage> ExecutionEngine<S> {
    /// Recalculate the current step's SLA.
    ///
    /// Rewrites the open task's `due_at` and the pending `sla` timer, and
    /// appends exactly one audit record. The new deadline is derived from
    /// the step's start time; moving it before `now` requires the explicit
    /// `allow_past` flag.
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id))]
    pub async fn recalculate_sla(
        &self,
        request: SlaRecalcRequest,
    ) -> Result<SlaRecalcReceipt, EngineError> {
        let org = request.organization_id;
        self.authorize(
            &request.recalc_by,
            org,
            "workflow.sla_recalc",
            &request.execution_id.to_string(),
        )
        .await?;

        let instance = self.storage.get_instance(org, request.execution_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::invalid_transition(
                "recalculate sla",
                instance.status,
            ));
        }

        let step_id = instance.current_step_id.clone().ok_or_else(|| {
            EngineError::invalid_transition("recalculate sla", "no current step")
        })?;

        let step = self
            .storage
            .active_step_instance(org, request.execution_id, &step_id)
            .await?
            .filter(|s| s.status == StepStatus::Active)
            .ok_or_else(|| {
                EngineError::invalid_transition(
                    "recalculate sla",
                    format!("step {step_id} is not active"),
                )
            })?;

        let now = Utc::now();
        let new_due_at = step.started_at + chrono::Duration::hours(request.sla_override_hours);

        if new_due_at < now && !request.allow_past {
            return Err(EngineError::validation(format!(
                "recalculated due_at {new_due_at} is in the past; pass allow_past to override"
            )));
        }

        let task = self
            .storage
            .open_task_for_step(org, request.execution_id, &step_id)
            .await?;

        let sla_timer = self
            .storage
            .pending_timers_for_execution(org, request.execution_id)
            .await?
            .into_iter()
            .find(|t| t.purpose == TimerPurpose::Sla && t.step_instance_id == Some(step.id));

        let old_due_at = task
            .as_ref()
            .and_then(|t| t.due_at)
            .or(sla_timer.as_ref().map(|t| t.fire_at));

        if let Some(mut task) = task {
            task.due_at = Some(new_due_at);
            self.storage.update_task(&task).await?;
        }

        match sla_timer {
            Some(timer) => {
                self.storage
                    .reschedule_timer(org, timer.timer_id, new_due_at)
                    .await?;
            }
            None => {
                self.timers
                    .schedule(Timer::schedule(
                        org,
                        request.execution_id,
                        Some(step.id),
                        TimerPurpose::Sla,
                        new_due_at,
                    ))
                    .await?;
            }
        }

        let audit = AuditRecord::new(
            org,
            request.execution_id,
            AuditKind::SlaRecalculated,
            &request.recalc_by,
        )
        .with_due_change(old_due_at, Some(new_due_at))
        .with_reason(request.recalc_reason);
        self.storage.append_audit(&audit).await?;

        info!(?old_due_at, %new_due_at, "sla recalculated");
        Ok(SlaRecalcReceipt {
            old_due_at,
            new_due_at,
        })
    }
}
