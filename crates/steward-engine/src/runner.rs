//! Step runner: the advance loop and per-type step execution
//!
//! `advance` is the only place the state machine moves: it activates the
//! entry step, resolves next-step rules on completion, and finalizes the
//! instance. Task and wait steps block until their task/timer callback;
//! automated steps run when the scheduler claims their retry timer, so the
//! engine never blocks an API call on an external action.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use steward_core::{
    EffectRecord, EffectStatus, EngineError, ExecutionInstance, ExecutionStatus,
    PlaybookDefinition, StepDefinition, StepInstance, StepStatus, StepType, Task, Timer,
    TimerPurpose,
};
use steward_storage::{EffectFilter, Storage};

use crate::actions::ActionInvocation;
use crate::engine::{Commit, ExecutionEngine};

/// Request to re-dispatch failed effects of an automated step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEffectsRequest {
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    #[serde(default)]
    pub effect_filter: EffectFilter,
    #[serde(default)]
    pub force_retry: bool,
    pub retried_by: String,
}

/// Receipt for a retry-effects operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEffectsReceipt {
    /// Failed records that matched the filter
    pub matched: usize,
    /// Attempt number of the freshly appended record
    pub attempt: u32,
}

/// What one advance iteration did
enum AdvanceOutcome {
    /// State moved; keep driving synchronous progress
    Progressed,
    /// Waiting on a task, timer, or effect; nothing to do
    Blocked,
    /// Conditional write lost a race; reload and retry
    Conflict,
}

impl<S: Storage> ExecutionEngine<S> {
    /// Drive the execution forward until it blocks on external work or
    /// reaches a terminal state. Idempotent: re-entering while the current
    /// step is still active is a no-op.
    #[instrument(skip(self))]
    pub async fn advance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let mut conflicts = 0u32;
        loop {
            match self.advance_once(organization_id, execution_id).await? {
                AdvanceOutcome::Progressed => {
                    conflicts = 0;
                }
                AdvanceOutcome::Blocked => return Ok(()),
                AdvanceOutcome::Conflict => {
                    conflicts += 1;
                    if conflicts >= self.config.max_version_retries {
                        return Err(EngineError::ConcurrentModification {
                            execution_id,
                            attempts: conflicts,
                        });
                    }
                }
            }
        }
    }

    /// One state-machine iteration: a single version-checked transition.
    async fn advance_once(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<AdvanceOutcome, EngineError> {
        let mut instance = self.storage.get_instance(organization_id, execution_id).await?;

        if instance.status.is_terminal() || instance.status == ExecutionStatus::Paused {
            return Ok(AdvanceOutcome::Blocked);
        }

        // Cooperative-cancel checkpoint: finalize once no attempt is in
        // flight.
        if instance.cancel_requested {
            if self.has_inflight_attempt(&instance).await? {
                return Ok(AdvanceOutcome::Blocked);
            }
            self.finalize_cancelled(organization_id, execution_id, None, "engine")
                .await?;
            return Ok(AdvanceOutcome::Blocked);
        }

        let definition = self
            .definitions
            .get(organization_id, &instance.playbook_id, instance.playbook_version)
            .await?;

        // No current step yet: activate the entry step
        let Some(current_step_id) = instance.current_step_id.clone() else {
            let Some(entry) = definition.entry_step() else {
                return self
                    .fail_instance(&mut instance, "definition has no steps")
                    .await;
            };
            let entry = entry.clone();

            instance.current_step_id = Some(entry.id.clone());
            instance.status = ExecutionStatus::InProgress;
            match self.commit(&mut instance).await? {
                Commit::Conflict => return Ok(AdvanceOutcome::Conflict),
                Commit::Done => {}
            }

            self.record_status(
                &instance,
                Some(ExecutionStatus::Pending),
                ExecutionStatus::InProgress,
                None,
                "engine",
            )
            .await?;

            self.activate_step(&instance, &entry).await?;
            return Ok(AdvanceOutcome::Progressed);
        };

        let step_def = definition.step(&current_step_id).ok_or_else(|| {
            EngineError::validation(format!(
                "current step {current_step_id} is not part of {} v{}",
                instance.playbook_id, instance.playbook_version
            ))
        })?;

        match self
            .storage
            .latest_step_instance(organization_id, execution_id, &current_step_id)
            .await?
        {
            // Pointed at a step that was never instantiated (crash between
            // commit and activation): self-heal by activating it now.
            None => {
                self.activate_step(&instance, step_def).await?;
                Ok(AdvanceOutcome::Progressed)
            }

            Some(step) => match step.status {
                StepStatus::Pending | StepStatus::Active => Ok(AdvanceOutcome::Blocked),

                StepStatus::Completed | StepStatus::Skipped => {
                    self.move_to_next(&mut instance, &definition, step_def).await
                }

                StepStatus::Failed => {
                    if step_def.optional && step_def.step_type != StepType::Decision {
                        let mut step = step;
                        step.status = StepStatus::Skipped;
                        self.storage.update_step_instance(&step).await?;
                        info!(step_id = %step.step_id, "optional step failed; skipping");
                        Ok(AdvanceOutcome::Progressed)
                    } else {
                        let error = step
                            .error
                            .clone()
                            .unwrap_or_else(|| format!("step {} failed", step.step_id));
                        self.fail_instance(&mut instance, &error).await
                    }
                }
            },
        }
    }

    /// Resolve the completed step's routing rule and either activate the
    /// successor or complete the instance.
    async fn move_to_next(
        &self,
        instance: &mut ExecutionInstance,
        definition: &PlaybookDefinition,
        completed: &StepDefinition,
    ) -> Result<AdvanceOutcome, EngineError> {
        let context = instance.context_value();
        let next = match completed.next_step_rule.resolve(&context) {
            Err(()) => {
                return self
                    .fail_instance(
                        instance,
                        &format!("decision step {} has no matching branch", completed.id),
                    )
                    .await;
            }
            Ok(next) => next.map(str::to_string),
        };

        match next {
            Some(next_id) => {
                let Some(next_def) = definition.step(&next_id) else {
                    return self
                        .fail_instance(
                            instance,
                            &format!("step {} routes to unknown step {next_id}", completed.id),
                        )
                        .await;
                };
                let next_def = next_def.clone();

                instance.current_step_id = Some(next_id.clone());
                match self.commit(instance).await? {
                    Commit::Conflict => return Ok(AdvanceOutcome::Conflict),
                    Commit::Done => {}
                }

                debug!(from = %completed.id, to = %next_id, "moving to next step");
                self.activate_step(instance, &next_def).await?;
                Ok(AdvanceOutcome::Progressed)
            }
            None => self.complete_instance(instance, definition).await,
        }
    }

    /// Activate a step according to its type. Idempotent: an existing
    /// active step instance (and its open task) is reused, never
    /// duplicated — pausing and resuming mid-step must not create a second
    /// task.
    async fn activate_step(
        &self,
        instance: &ExecutionInstance,
        step_def: &StepDefinition,
    ) -> Result<(), EngineError> {
        let org = instance.organization_id;
        let execution_id = instance.execution_id;

        let step = match self
            .storage
            .active_step_instance(org, execution_id, &step_def.id)
            .await?
        {
            Some(existing) => existing,
            None => {
                let step = StepInstance::activate(org, execution_id, &step_def.id);
                self.storage.insert_step_instance(&step).await?;
                step
            }
        };

        match step_def.step_type {
            StepType::Task => {
                if self
                    .storage
                    .open_task_for_step(org, execution_id, &step_def.id)
                    .await?
                    .is_none()
                {
                    let due_at = step_def
                        .sla_hours
                        .map(|hours| step.started_at + chrono::Duration::hours(hours as i64));

                    let assignee = step_def
                        .assignee_role
                        .clone()
                        .map(steward_core::Assignee::Role)
                        .ok_or_else(|| {
                            EngineError::validation(format!(
                                "task step {} has no assignee_role",
                                step_def.id
                            ))
                        })?;

                    let task = Task::open(
                        org,
                        execution_id,
                        &step_def.id,
                        assignee,
                        due_at,
                        self.config.default_task_priority,
                    );
                    self.tasks.create(task).await?;

                    if let Some(due_at) = due_at {
                        self.timers
                            .schedule(Timer::schedule(
                                org,
                                execution_id,
                                Some(step.id),
                                TimerPurpose::Sla,
                                due_at,
                            ))
                            .await?;
                    }
                    debug!(step_id = %step_def.id, "task created");
                }
            }

            StepType::Automated => {
                let action = step_def.action.clone().ok_or_else(|| {
                    EngineError::validation(format!(
                        "automated step {} has no action",
                        step_def.id
                    ))
                })?;

                let existing = self
                    .storage
                    .list_effects(
                        org,
                        execution_id,
                        &EffectFilter {
                            step_id: Some(step_def.id.clone()),
                            ..Default::default()
                        },
                    )
                    .await?;

                if !existing.iter().any(|e| e.step_instance_id == step.id) {
                    self.dispatch_attempt(instance, &step, &action, 1, Utc::now())
                        .await?;
                }
            }

            StepType::Decision => {
                let context = instance.context_value();
                let mut step = step;
                match step_def.next_step_rule.resolve(&context) {
                    Ok(next) => {
                        step.status = StepStatus::Completed;
                        step.output = Some(json!({ "next_step_id": next }));
                        step.completed_at = Some(Utc::now());
                    }
                    Err(()) => {
                        step.status = StepStatus::Failed;
                        step.error = Some("no matching branch".to_string());
                        step.completed_at = Some(Utc::now());
                    }
                }
                self.storage.update_step_instance(&step).await?;
            }

            StepType::Wait => {
                let delay = step_def.wait_delay.ok_or_else(|| {
                    EngineError::validation(format!("wait step {} has no wait_delay", step_def.id))
                })?;

                let already_scheduled = self
                    .storage
                    .pending_timers_for_execution(org, execution_id)
                    .await?
                    .iter()
                    .any(|t| t.step_instance_id == Some(step.id) && t.purpose == TimerPurpose::Wait);

                if !already_scheduled {
                    let fire_at =
                        Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    self.timers
                        .schedule(Timer::schedule(
                            org,
                            execution_id,
                            Some(step.id),
                            TimerPurpose::Wait,
                            fire_at,
                        ))
                        .await?;
                }
            }
        }

        Ok(())
    }

    /// Append a pending effect record and schedule the timer that will
    /// execute it.
    async fn dispatch_attempt(
        &self,
        instance: &ExecutionInstance,
        step: &StepInstance,
        action: &str,
        attempt: u32,
        fire_at: chrono::DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let effect = EffectRecord::pending(
            instance.organization_id,
            instance.execution_id,
            step.id,
            &step.step_id,
            attempt,
            action,
        );
        self.storage.append_effect(&effect).await?;

        self.timers
            .schedule(Timer::schedule(
                instance.organization_id,
                instance.execution_id,
                Some(step.id),
                TimerPurpose::Retry,
                fire_at,
            ))
            .await?;

        debug!(step_id = %step.step_id, attempt, "attempt scheduled");
        Ok(())
    }

    /// Execute the automated attempt a claimed retry timer points at.
    ///
    /// Returns `true` when an attempt actually ran.
    pub(crate) async fn run_retry_timer(&self, timer: &Timer) -> Result<bool, EngineError> {
        let org = timer.organization_id;
        let execution_id = timer.execution_id;

        let instance = self.storage.get_instance(org, execution_id).await?;
        if instance.status.is_terminal() {
            return Ok(false);
        }

        let Some(step_instance_id) = timer.step_instance_id else {
            return Ok(false);
        };
        let mut step = self.storage.get_step_instance(org, step_instance_id).await?;
        if step.status != StepStatus::Active {
            return Ok(false);
        }

        let effects = self
            .storage
            .list_effects(
                org,
                execution_id,
                &EffectFilter {
                    step_id: Some(step.step_id.clone()),
                    status: Some(EffectStatus::Pending),
                    retryable: None,
                },
            )
            .await?;
        let Some(mut effect) = effects
            .into_iter()
            .filter(|e| e.step_instance_id == step_instance_id)
            .next_back()
        else {
            return Ok(false);
        };

        let definition = self
            .definitions
            .get(org, &instance.playbook_id, instance.playbook_version)
            .await?;
        let step_def = definition.step(&step.step_id).ok_or_else(|| {
            EngineError::validation(format!(
                "step {} is not part of {} v{}",
                step.step_id, instance.playbook_id, instance.playbook_version
            ))
        })?;

        let invocation = ActionInvocation {
            organization_id: org,
            execution_id,
            step_id: step.step_id.clone(),
            action: effect.action.clone(),
            attempt: effect.attempt,
            input: json!({
                "input": instance.input_data,
                "context": instance.context_value(),
            }),
        };

        info!(step_id = %step.step_id, attempt = effect.attempt, "executing automated step");
        let outcome = self.actions.execute(&invocation).await;

        // Re-read for the cooperative-cancel checkpoint: the instance may
        // have been cancelled while the action was in flight.
        let fresh = self.storage.get_instance(org, execution_id).await?;

        match outcome {
            Ok(output) => {
                effect.settle_success();
                self.storage.update_effect(&effect).await?;

                if fresh.cancel_requested || fresh.status.is_terminal() {
                    // Outcome recorded for audit, discarded for state
                    info!(step_id = %step.step_id, "attempt settled after cancellation; outcome discarded");
                    self.advance(org, execution_id).await?;
                    return Ok(true);
                }

                step.status = StepStatus::Completed;
                step.output = Some(output.clone());
                step.completed_at = Some(Utc::now());
                self.storage.update_step_instance(&step).await?;

                self.merge_context(org, execution_id, &step.step_id, output)
                    .await?;
                self.advance(org, execution_id).await?;
            }

            Err(failure) => {
                warn!(
                    step_id = %step.step_id,
                    attempt = effect.attempt,
                    retryable = failure.retryable,
                    "automated step attempt failed: {}",
                    failure.message
                );
                effect.settle_failure(&failure.message, failure.retryable);
                self.storage.update_effect(&effect).await?;

                if fresh.cancel_requested || fresh.status.is_terminal() {
                    self.advance(org, execution_id).await?;
                    return Ok(true);
                }

                if failure.retryable && step_def.retry_policy.has_attempts_remaining(effect.attempt)
                {
                    let next_attempt = effect.attempt + 1;
                    step.attempt_count = next_attempt;
                    self.storage.update_step_instance(&step).await?;

                    let delay = step_def.retry_policy.delay_for_attempt(next_attempt);
                    let fire_at =
                        Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    let action = effect.action.clone();
                    self.dispatch_attempt(&fresh, &step, &action, next_attempt, fire_at)
                        .await?;
                } else {
                    step.status = StepStatus::Failed;
                    step.error = Some(failure.message.clone());
                    step.completed_at = Some(Utc::now());
                    self.storage.update_step_instance(&step).await?;

                    self.advance(org, execution_id).await?;
                }
            }
        }

        Ok(true)
    }

    /// Complete the wait step a claimed wait timer points at.
    pub(crate) async fn complete_wait_step(&self, timer: &Timer) -> Result<(), EngineError> {
        let org = timer.organization_id;
        let Some(step_instance_id) = timer.step_instance_id else {
            return Ok(());
        };

        let instance = self.storage.get_instance(org, timer.execution_id).await?;
        if instance.status.is_terminal() {
            return Ok(());
        }

        let mut step = self.storage.get_step_instance(org, step_instance_id).await?;
        if step.status != StepStatus::Active {
            return Ok(());
        }

        step.status = StepStatus::Completed;
        step.completed_at = Some(Utc::now());
        self.storage.update_step_instance(&step).await?;

        debug!(step_id = %step.step_id, "wait step elapsed");
        self.advance(org, timer.execution_id).await?;
        Ok(())
    }

    /// Re-dispatch an automated step's failed effects as a fresh attempt.
    ///
    /// `force_retry` bypasses the retry policy's attempt cap. History is
    /// append-only: matched records are untouched, a new record is
    /// appended.
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id, step_id = %request.step_id))]
    pub async fn retry_effects(
        &self,
        request: RetryEffectsRequest,
    ) -> Result<RetryEffectsReceipt, EngineError> {
        let org = request.organization_id;
        self.authorize(
            &request.retried_by,
            org,
            "workflow.retry_effects",
            &request.execution_id.to_string(),
        )
        .await?;

        let instance = self.storage.get_instance(org, request.execution_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::invalid_transition(
                "retry effects",
                instance.status,
            ));
        }
        if instance.current_step_id.as_deref() != Some(request.step_id.as_str()) {
            return Err(EngineError::invalid_transition(
                "retry effects",
                format!("current step is {:?}", instance.current_step_id),
            ));
        }

        let definition = self
            .definitions
            .get(org, &instance.playbook_id, instance.playbook_version)
            .await?;
        let step_def = definition
            .step(&request.step_id)
            .ok_or_else(|| EngineError::not_found("step", &request.step_id))?;
        if step_def.step_type != StepType::Automated {
            return Err(EngineError::validation(format!(
                "step {} is not an automated step",
                request.step_id
            )));
        }
        let action = step_def.action.clone().ok_or_else(|| {
            EngineError::validation(format!("automated step {} has no action", request.step_id))
        })?;

        let mut filter = request.effect_filter.clone();
        filter.step_id = Some(request.step_id.clone());
        if filter.status.is_none() {
            filter.status = Some(EffectStatus::Failed);
        }
        let matched = self
            .storage
            .list_effects(org, request.execution_id, &filter)
            .await?;
        if matched.is_empty() {
            return Err(EngineError::not_found(
                "failed effects",
                format!("{}/{}", request.execution_id, request.step_id),
            ));
        }

        let all_for_step = self
            .storage
            .list_effects(
                org,
                request.execution_id,
                &EffectFilter {
                    step_id: Some(request.step_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        let max_attempt = all_for_step.iter().map(|e| e.attempt).max().unwrap_or(0);

        if !request.force_retry && !step_def.retry_policy.has_attempts_remaining(max_attempt) {
            return Err(EngineError::validation(format!(
                "attempt cap ({}) reached for step {}; pass force_retry to bypass",
                step_def.retry_policy.max_attempts, request.step_id
            )));
        }

        let mut step = self
            .storage
            .latest_step_instance(org, request.execution_id, &request.step_id)
            .await?
            .ok_or_else(|| EngineError::not_found("step instance", &request.step_id))?;

        if step.status != StepStatus::Active {
            step.status = StepStatus::Active;
            step.error = None;
            step.completed_at = None;
        }
        let next_attempt = max_attempt + 1;
        step.attempt_count = next_attempt;
        self.storage.update_step_instance(&step).await?;

        self.dispatch_attempt(&instance, &step, &action, next_attempt, Utc::now())
            .await?;

        info!(attempt = next_attempt, matched = matched.len(), "effects requeued");
        Ok(RetryEffectsReceipt {
            matched: matched.len(),
            attempt: next_attempt,
        })
    }

    /// Terminal completion: validate the output contract and finalize.
    async fn complete_instance(
        &self,
        instance: &mut ExecutionInstance,
        definition: &PlaybookDefinition,
    ) -> Result<AdvanceOutcome, EngineError> {
        let output = instance.context_value();

        if let Err(violations) = definition.output_contract.validate(&output) {
            return self
                .fail_instance(
                    instance,
                    &format!("output contract: {}", violations.join("; ")),
                )
                .await;
        }

        let previous = instance.status;
        instance.status = ExecutionStatus::Completed;
        instance.output_data = Some(output);
        instance.completed_at = Some(Utc::now());

        match self.commit(instance).await? {
            Commit::Conflict => return Ok(AdvanceOutcome::Conflict),
            Commit::Done => {}
        }

        self.record_status(
            instance,
            Some(previous),
            ExecutionStatus::Completed,
            None,
            "engine",
        )
        .await?;
        self.tasks
            .cancel_open_for_execution(instance.organization_id, instance.execution_id)
            .await?;
        self.timers
            .cancel_all_pending(instance.organization_id, instance.execution_id)
            .await?;

        info!(execution_id = %instance.execution_id, "execution completed");
        Ok(AdvanceOutcome::Blocked)
    }

    /// Terminal failure (retries exhausted, decision dead-end, contract
    /// violation).
    async fn fail_instance(
        &self,
        instance: &mut ExecutionInstance,
        error: &str,
    ) -> Result<AdvanceOutcome, EngineError> {
        let previous = instance.status;
        instance.status = ExecutionStatus::Failed;
        instance.error = Some(error.to_string());
        instance.completed_at = Some(Utc::now());

        match self.commit(instance).await? {
            Commit::Conflict => return Ok(AdvanceOutcome::Conflict),
            Commit::Done => {}
        }

        self.record_status(
            instance,
            Some(previous),
            ExecutionStatus::Failed,
            Some(error.to_string()),
            "engine",
        )
        .await?;
        self.tasks
            .cancel_open_for_execution(instance.organization_id, instance.execution_id)
            .await?;
        self.timers
            .cancel_all_pending(instance.organization_id, instance.execution_id)
            .await?;

        warn!(execution_id = %instance.execution_id, error, "execution failed");
        Ok(AdvanceOutcome::Blocked)
    }
}
