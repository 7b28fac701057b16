//! Execution engine: lifecycle operations
//!
//! The engine is the single serialization point per instance. Every
//! mutating operation reads the instance, validates the transition,
//! computes the new state, and writes conditionally on the optimistic-lock
//! `version`; conflicts are retried a bounded number of times before
//! surfacing `ConcurrentModificationError`.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use steward_core::{
    Assignee, AuditKind, EngineError, ExecutionInstance, ExecutionStatus, StatusChange,
    StepInstance, Task, Timer,
};
use steward_storage::{Storage, StorageError};

use crate::actions::ActionAdapter;
use crate::authz::AuthorizationAdapter;
use crate::config::{DedupPolicy, EngineConfig};
use crate::definitions::DefinitionStore;
use crate::tasks::TaskManager;
use crate::timers::TimerService;

/// Request to start a new execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub organization_id: Uuid,
    pub playbook_id: String,
    pub input_data: Value,
    pub initiated_by: String,
    #[serde(default)]
    pub owner_team: Option<String>,
    #[serde(default)]
    pub skip_input_validation: bool,
}

/// Receipt for a started execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartReceipt {
    pub execution_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseRequest {
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
    pub paused_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub resumed_by: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequest {
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    #[serde(default)]
    pub reason: Option<String>,
    pub cancelled_by: String,
}

/// Reassign the current task step of an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignRequest {
    pub organization_id: Uuid,
    pub execution_id: Uuid,
    pub new_assignee: Assignee,
    pub reassigned_by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReassignTaskRequest {
    pub organization_id: Uuid,
    pub task_id: Uuid,
    pub new_assignee: Assignee,
    pub reassigned_by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteTaskRequest {
    pub organization_id: Uuid,
    pub task_id: Uuid,
    pub completed_by: String,
}

/// What to include in an execution detail view
#[derive(Debug, Clone, Copy, Default)]
pub struct DescribeOptions {
    pub include_steps: bool,
    pub include_tasks: bool,
    pub include_timers: bool,
}

/// Detail view of one execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetail {
    pub instance: ExecutionInstance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<StepInstance>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<Task>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timers: Option<Vec<Timer>>,
}

/// Outcome of a single conditional write attempt
pub(crate) enum Commit {
    Done,
    Conflict,
}

/// The playbook execution engine.
///
/// All mutation paths (inbound API calls and scheduler sweeps) converge
/// here; the state machine lives in `advance` (see `runner`).
pub struct ExecutionEngine<S: Storage> {
    pub(crate) storage: Arc<S>,
    pub(crate) definitions: Arc<DefinitionStore<S>>,
    pub(crate) tasks: TaskManager<S>,
    pub(crate) timers: TimerService<S>,
    pub(crate) actions: Arc<dyn ActionAdapter>,
    pub(crate) authz: Arc<dyn AuthorizationAdapter>,
    pub(crate) config: EngineConfig,
}

impl<S: Storage> ExecutionEngine<S> {
    pub fn new(
        storage: Arc<S>,
        actions: Arc<dyn ActionAdapter>,
        authz: Arc<dyn AuthorizationAdapter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            definitions: Arc::new(DefinitionStore::new(storage.clone())),
            tasks: TaskManager::new(storage.clone()),
            timers: TimerService::new(storage.clone()),
            storage,
            actions,
            authz,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn definitions(&self) -> &DefinitionStore<S> {
        &self.definitions
    }

    pub fn tasks(&self) -> &TaskManager<S> {
        &self.tasks
    }

    pub fn timers(&self) -> &TimerService<S> {
        &self.timers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) async fn authorize(
        &self,
        actor: &str,
        organization_id: Uuid,
        action: &str,
        resource: &str,
    ) -> Result<(), EngineError> {
        if self
            .authz
            .can_perform(actor, organization_id, action, resource)
            .await
        {
            Ok(())
        } else {
            Err(EngineError::permission_denied(actor, action))
        }
    }

    /// Start a new execution.
    ///
    /// Validates the input contract, applies the duplicate-start policy,
    /// creates the instance in `pending`, and immediately advances to
    /// activate the entry step.
    #[instrument(skip(self, request), fields(playbook_id = %request.playbook_id))]
    pub async fn start(&self, request: StartRequest) -> Result<StartReceipt, EngineError> {
        let org = request.organization_id;
        self.authorize(
            &request.initiated_by,
            org,
            "workflow.start",
            &request.playbook_id,
        )
        .await?;

        let definition = self
            .definitions
            .latest_active(org, &request.playbook_id)
            .await?;

        if !request.skip_input_validation {
            definition
                .input_contract
                .validate(&request.input_data)
                .map_err(|violations| {
                    EngineError::Validation(format!("input contract: {}", violations.join("; ")))
                })?;
        }

        if self.config.dedup_policy == DedupPolicy::FullInputEquality {
            let window =
                chrono::Duration::milliseconds(self.config.dedup_window.as_millis() as i64);
            let window_start = Utc::now() - window;
            if let Some(existing) = self
                .storage
                .find_duplicate_start(
                    org,
                    &request.playbook_id,
                    &request.initiated_by,
                    &request.input_data,
                    window_start,
                )
                .await?
            {
                warn!(existing = %existing.execution_id, "duplicate start suppressed");
                return Err(EngineError::DuplicateExecution {
                    existing_execution_id: existing.execution_id,
                });
            }
        }

        let mut instance = ExecutionInstance::new(
            org,
            &request.playbook_id,
            definition.version,
            request.input_data,
            &request.initiated_by,
        );
        instance.owner_team = request.owner_team;

        self.storage.insert_instance(&instance).await?;
        self.record_status(
            &instance,
            None,
            ExecutionStatus::Pending,
            None,
            &request.initiated_by,
        )
        .await?;

        info!(execution_id = %instance.execution_id, "execution created");

        self.advance(org, instance.execution_id).await?;

        Ok(StartReceipt {
            execution_id: instance.execution_id,
        })
    }

    /// Pause an `in_progress` execution.
    ///
    /// Does not cancel an in-flight step attempt; the active step is
    /// allowed to finish, but no new step starts while paused.
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id))]
    pub async fn pause(&self, request: PauseRequest) -> Result<(), EngineError> {
        let org = request.organization_id;
        self.authorize(
            &request.paused_by,
            org,
            "workflow.pause",
            &request.execution_id.to_string(),
        )
        .await?;

        let instance = self
            .transition(org, request.execution_id, |instance| {
                if instance.status != ExecutionStatus::InProgress {
                    return Err(EngineError::invalid_transition("pause", instance.status));
                }
                instance.status = ExecutionStatus::Paused;
                Ok(())
            })
            .await?;

        self.record_status(
            &instance,
            Some(ExecutionStatus::InProgress),
            ExecutionStatus::Paused,
            request.reason,
            &request.paused_by,
        )
        .await?;

        info!("execution paused");
        Ok(())
    }

    /// Resume a paused execution from the exact step it paused on.
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id))]
    pub async fn resume(&self, request: ResumeRequest) -> Result<(), EngineError> {
        let org = request.organization_id;
        self.authorize(
            &request.resumed_by,
            org,
            "workflow.resume",
            &request.execution_id.to_string(),
        )
        .await?;

        let instance = self
            .transition(org, request.execution_id, |instance| {
                if instance.status != ExecutionStatus::Paused {
                    return Err(EngineError::invalid_transition("resume", instance.status));
                }
                instance.status = ExecutionStatus::InProgress;
                Ok(())
            })
            .await?;

        self.record_status(
            &instance,
            Some(ExecutionStatus::Paused),
            ExecutionStatus::InProgress,
            request.notes,
            &request.resumed_by,
        )
        .await?;

        info!(current_step = ?instance.current_step_id, "execution resumed");

        // Never restarts from step 1: advance picks up current_step_id and
        // no-ops if the step is still awaiting its task or timer.
        self.advance(org, request.execution_id).await?;
        Ok(())
    }

    /// Cancel an execution at the next safe checkpoint.
    ///
    /// With an automated attempt in flight the cancellation is cooperative:
    /// the attempt settles, its outcome is discarded, and the instance
    /// finalizes `cancelled`. Otherwise the instance finalizes immediately.
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id))]
    pub async fn cancel(&self, request: CancelRequest) -> Result<(), EngineError> {
        let org = request.organization_id;
        self.authorize(
            &request.cancelled_by,
            org,
            "workflow.cancel",
            &request.execution_id.to_string(),
        )
        .await?;

        let instance = self.storage.get_instance(org, request.execution_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::invalid_transition("cancel", instance.status));
        }

        if self.has_inflight_attempt(&instance).await? {
            self.transition(org, request.execution_id, |instance| {
                if instance.status.is_terminal() {
                    return Err(EngineError::invalid_transition("cancel", instance.status));
                }
                instance.cancel_requested = true;
                Ok(())
            })
            .await?;
            info!("cancellation requested; waiting for in-flight attempt to settle");
            return Ok(());
        }

        self.finalize_cancelled(org, request.execution_id, request.reason, &request.cancelled_by)
            .await?;
        Ok(())
    }

    /// Reassign the execution's current task step.
    ///
    /// Fails with `InvalidStateTransition` when the current step is not
    /// awaiting a task.
    #[instrument(skip(self, request), fields(execution_id = %request.execution_id))]
    pub async fn reassign(&self, request: ReassignRequest) -> Result<(), EngineError> {
        let org = request.organization_id;
        self.authorize(
            &request.reassigned_by,
            org,
            "workflow.reassign",
            &request.execution_id.to_string(),
        )
        .await?;

        let instance = self.storage.get_instance(org, request.execution_id).await?;
        if instance.status.is_terminal() {
            return Err(EngineError::invalid_transition("reassign", instance.status));
        }

        let current_step_id = instance
            .current_step_id
            .clone()
            .ok_or_else(|| EngineError::invalid_transition("reassign", instance.status))?;

        let task = self
            .storage
            .open_task_for_step(org, request.execution_id, &current_step_id)
            .await?
            .ok_or_else(|| {
                EngineError::invalid_transition("reassign", format!("step {current_step_id} is not awaiting a task"))
            })?;

        self.tasks
            .reassign(
                org,
                task.task_id,
                request.new_assignee.clone(),
                &request.reassigned_by,
                request.reason,
                AuditKind::ExecutionReassigned,
            )
            .await?;

        if let Assignee::Role(team) = &request.new_assignee {
            let team = team.clone();
            self.transition(org, request.execution_id, move |instance| {
                instance.owner_team = Some(team.clone());
                Ok(())
            })
            .await?;
        }

        Ok(())
    }

    /// Reassign a task directly (full replace, audit-logged)
    pub async fn reassign_task(&self, request: ReassignTaskRequest) -> Result<(), EngineError> {
        let org = request.organization_id;
        self.authorize(
            &request.reassigned_by,
            org,
            "task.reassign",
            &request.task_id.to_string(),
        )
        .await?;

        self.tasks
            .reassign(
                org,
                request.task_id,
                request.new_assignee,
                &request.reassigned_by,
                request.reason,
                AuditKind::TaskReassigned,
            )
            .await?;
        Ok(())
    }

    /// Complete a task; drives the owning step instance to `completed` and
    /// advances the execution.
    #[instrument(skip(self, request), fields(task_id = %request.task_id))]
    pub async fn complete_task(&self, request: CompleteTaskRequest) -> Result<(), EngineError> {
        let org = request.organization_id;
        self.authorize(
            &request.completed_by,
            org,
            "task.complete",
            &request.task_id.to_string(),
        )
        .await?;

        let task = self
            .tasks
            .complete(org, request.task_id, &request.completed_by)
            .await?;

        let Some(mut step) = self
            .storage
            .active_step_instance(org, task.execution_id, &task.step_id)
            .await?
        else {
            // Task completed but its step already settled (e.g. via an
            // earlier crash-recovery pass); nothing further to drive.
            warn!(step_id = %task.step_id, "completed task had no active step instance");
            return Ok(());
        };

        let output = serde_json::json!({
            "task_id": task.task_id,
            "completed_by": request.completed_by,
        });

        step.status = steward_core::StepStatus::Completed;
        step.output = Some(output.clone());
        step.completed_at = Some(Utc::now());
        self.storage.update_step_instance(&step).await?;

        // The step's SLA timer is moot once the task is done
        self.timers
            .cancel_for_step_instance(org, task.execution_id, step.id)
            .await?;

        self.merge_context(org, task.execution_id, &task.step_id, output)
            .await?;

        self.advance(org, task.execution_id).await?;
        Ok(())
    }

    /// Detail view with optional step/task/timer expansion
    pub async fn describe(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        options: DescribeOptions,
    ) -> Result<ExecutionDetail, EngineError> {
        let instance = self.storage.get_instance(organization_id, execution_id).await?;

        let steps = if options.include_steps {
            Some(
                self.storage
                    .list_step_instances(organization_id, execution_id)
                    .await?,
            )
        } else {
            None
        };

        let tasks = if options.include_tasks {
            Some(
                self.storage
                    .list_tasks(
                        organization_id,
                        &steward_storage::TaskFilter {
                            execution_id: Some(execution_id),
                            ..Default::default()
                        },
                        &steward_storage::Page::default(),
                    )
                    .await?,
            )
        } else {
            None
        };

        let timers = if options.include_timers {
            Some(
                self.storage
                    .pending_timers_for_execution(organization_id, execution_id)
                    .await?,
            )
        } else {
            None
        };

        Ok(ExecutionDetail {
            instance,
            steps,
            tasks,
            timers,
        })
    }

    // =========================================================================
    // Internal: conditional-write plumbing
    // =========================================================================

    /// Load-mutate-write loop with bounded conflict retries.
    ///
    /// `apply` must be a pure in-memory mutation; it may be called several
    /// times against freshly loaded state.
    pub(crate) async fn transition<F>(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        mut apply: F,
    ) -> Result<ExecutionInstance, EngineError>
    where
        F: FnMut(&mut ExecutionInstance) -> Result<(), EngineError>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut instance = self.storage.get_instance(organization_id, execution_id).await?;
            apply(&mut instance)?;

            match self.commit(&mut instance).await? {
                Commit::Done => return Ok(instance),
                Commit::Conflict if attempt < self.config.max_version_retries => continue,
                Commit::Conflict => {
                    return Err(EngineError::ConcurrentModification {
                        execution_id,
                        attempts: attempt,
                    })
                }
            }
        }
    }

    /// One conditional write: bump the version and write against the
    /// version that was read.
    pub(crate) async fn commit(
        &self,
        instance: &mut ExecutionInstance,
    ) -> Result<Commit, EngineError> {
        instance.touch(Utc::now());
        let expected = instance.version;
        instance.version = expected + 1;

        match self.storage.update_instance(instance, expected).await {
            Ok(()) => Ok(Commit::Done),
            Err(StorageError::VersionConflict { .. }) => Ok(Commit::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge a step's output into the instance context under the step id
    pub(crate) async fn merge_context(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
        output: Value,
    ) -> Result<(), EngineError> {
        let step_id = step_id.to_string();
        self.transition(organization_id, execution_id, move |instance| {
            instance.context.insert(step_id.clone(), output.clone());
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub(crate) async fn record_status(
        &self,
        instance: &ExecutionInstance,
        from: Option<ExecutionStatus>,
        to: ExecutionStatus,
        reason: Option<String>,
        changed_by: &str,
    ) -> Result<(), EngineError> {
        self.storage
            .append_status_change(&StatusChange::record(instance, from, to, reason, changed_by))
            .await?;
        Ok(())
    }

    /// Whether the current step has an automated attempt that may be
    /// executing right now
    pub(crate) async fn has_inflight_attempt(
        &self,
        instance: &ExecutionInstance,
    ) -> Result<bool, EngineError> {
        let Some(step_id) = instance.current_step_id.as_deref() else {
            return Ok(false);
        };

        let Some(step) = self
            .storage
            .active_step_instance(instance.organization_id, instance.execution_id, step_id)
            .await?
        else {
            return Ok(false);
        };

        let pending = self
            .storage
            .list_effects(
                instance.organization_id,
                instance.execution_id,
                &steward_storage::EffectFilter {
                    step_id: Some(step.step_id.clone()),
                    status: Some(steward_core::EffectStatus::Pending),
                    retryable: None,
                },
            )
            .await?;

        Ok(pending.iter().any(|e| e.step_instance_id == step.id))
    }

    /// Finalize a cancellation: settle open work and record the terminal
    /// status.
    pub(crate) async fn finalize_cancelled(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        reason: Option<String>,
        cancelled_by: &str,
    ) -> Result<(), EngineError> {
        let mut previous = None;
        let instance = self
            .transition(organization_id, execution_id, |instance| {
                if instance.status.is_terminal() {
                    return Err(EngineError::invalid_transition("cancel", instance.status));
                }
                previous = Some(instance.status);
                instance.status = ExecutionStatus::Cancelled;
                instance.cancel_requested = false;
                instance.completed_at = Some(Utc::now());
                Ok(())
            })
            .await?;

        self.tasks
            .cancel_open_for_execution(organization_id, execution_id)
            .await?;
        self.timers
            .cancel_all_pending(organization_id, execution_id)
            .await?;

        self.record_status(
            &instance,
            previous,
            ExecutionStatus::Cancelled,
            reason,
            cancelled_by,
        )
        .await?;

        info!(%execution_id, "execution cancelled");
        Ok(())
    }
}
