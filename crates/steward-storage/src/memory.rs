//! In-memory implementation of the storage adapter for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use steward_core::{
    AuditRecord, EffectRecord, ExecutionInstance, ExecutionStatus, PlaybookDefinition,
    StatusChange, StepInstance, StepStatus, Task, TaskState, Timer,
};

use super::adapter::*;

/// In-memory implementation of [`Storage`].
///
/// Primarily for testing. It stores all data in memory and provides the
/// same semantics as the PostgreSQL implementation, including atomic timer
/// claims and version-conditional instance updates.
///
/// # Example
///
/// ```
/// use steward_storage::InMemoryStorage;
///
/// let storage = InMemoryStorage::new();
/// ```
#[derive(Default)]
pub struct InMemoryStorage {
    definitions: RwLock<HashMap<(Uuid, String, u32), PlaybookDefinition>>,
    instances: RwLock<HashMap<Uuid, ExecutionInstance>>,
    steps: RwLock<HashMap<Uuid, StepInstance>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    timers: RwLock<HashMap<Uuid, Timer>>,
    effects: RwLock<Vec<EffectRecord>>,
    status_changes: RwLock<Vec<StatusChange>>,
    audits: RwLock<Vec<AuditRecord>>,
}

impl InMemoryStorage {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored instances
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Number of unfired timers
    pub fn unfired_timer_count(&self) -> usize {
        self.timers.read().values().filter(|t| !t.fired).count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.definitions.write().clear();
        self.instances.write().clear();
        self.steps.write().clear();
        self.tasks.write().clear();
        self.timers.write().clear();
        self.effects.write().clear();
        self.status_changes.write().clear();
        self.audits.write().clear();
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn put_definition(&self, definition: &PlaybookDefinition) -> Result<(), StorageError> {
        let key = (
            definition.organization_id,
            definition.id.clone(),
            definition.version,
        );
        let mut definitions = self.definitions.write();
        if definitions.contains_key(&key) {
            return Err(StorageError::Database(format!(
                "definition {} v{} already published",
                definition.id, definition.version
            )));
        }
        definitions.insert(key, definition.clone());
        Ok(())
    }

    async fn get_definition(
        &self,
        organization_id: Uuid,
        code: &str,
        version: u32,
    ) -> Result<PlaybookDefinition, StorageError> {
        self.definitions
            .read()
            .get(&(organization_id, code.to_string(), version))
            .cloned()
            .ok_or_else(|| StorageError::not_found("definition", format!("{code} v{version}")))
    }

    async fn latest_active_definition(
        &self,
        organization_id: Uuid,
        code: &str,
    ) -> Result<PlaybookDefinition, StorageError> {
        self.definitions
            .read()
            .values()
            .filter(|d| {
                d.organization_id == organization_id
                    && d.id == code
                    && d.status == steward_core::DefinitionStatus::Active
            })
            .max_by_key(|d| d.version)
            .cloned()
            .ok_or_else(|| StorageError::not_found("definition", code))
    }

    async fn insert_instance(&self, instance: &ExecutionInstance) -> Result<(), StorageError> {
        self.instances
            .write()
            .insert(instance.execution_id, instance.clone());
        Ok(())
    }

    async fn get_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<ExecutionInstance, StorageError> {
        self.instances
            .read()
            .get(&execution_id)
            .filter(|i| i.organization_id == organization_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("execution", execution_id))
    }

    async fn update_instance(
        &self,
        instance: &ExecutionInstance,
        expected_version: u64,
    ) -> Result<(), StorageError> {
        let mut instances = self.instances.write();
        let stored = instances
            .get_mut(&instance.execution_id)
            .filter(|i| i.organization_id == instance.organization_id)
            .ok_or_else(|| StorageError::not_found("execution", instance.execution_id))?;

        if stored.version != expected_version {
            return Err(StorageError::VersionConflict {
                expected: expected_version,
                actual: stored.version,
            });
        }

        *stored = instance.clone();
        Ok(())
    }

    async fn list_instances(
        &self,
        organization_id: Uuid,
        filter: &InstanceFilter,
        page: &Page,
    ) -> Result<Vec<ExecutionInstance>, StorageError> {
        let now = Utc::now();
        let overdue_executions: std::collections::HashSet<Uuid> = if filter.overdue.is_some() {
            self.tasks
                .read()
                .values()
                .filter(|t| t.is_overdue(now))
                .map(|t| t.execution_id)
                .collect()
        } else {
            Default::default()
        };

        let mut matches: Vec<ExecutionInstance> = self
            .instances
            .read()
            .values()
            .filter(|i| i.organization_id == organization_id)
            .filter(|i| {
                filter
                    .playbook_id
                    .as_ref()
                    .is_none_or(|p| &i.playbook_id == p)
            })
            .filter(|i| filter.status.is_none_or(|s| i.status == s))
            .filter(|i| {
                filter
                    .owner_team
                    .as_ref()
                    .is_none_or(|team| i.owner_team.as_ref() == Some(team))
            })
            .filter(|i| {
                filter
                    .paused
                    .is_none_or(|paused| (i.status == ExecutionStatus::Paused) == paused)
            })
            .filter(|i| {
                filter
                    .overdue
                    .is_none_or(|overdue| overdue_executions.contains(&i.execution_id) == overdue)
            })
            .filter(|i| filter.created_after.is_none_or(|t| i.started_at >= t))
            .filter(|i| filter.created_before.is_none_or(|t| i.started_at <= t))
            .cloned()
            .collect();

        matches.sort_by(|a, b| {
            let ordering = match filter.sort_by {
                InstanceSortKey::StartedAt => a.started_at.cmp(&b.started_at),
                InstanceSortKey::LastActivityAt => a.last_activity_at.cmp(&b.last_activity_at),
            };
            match filter.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        Ok(matches
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn find_duplicate_start(
        &self,
        organization_id: Uuid,
        playbook_id: &str,
        initiated_by: &str,
        input_data: &Value,
        started_after: DateTime<Utc>,
    ) -> Result<Option<ExecutionInstance>, StorageError> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| {
                i.organization_id == organization_id
                    && i.playbook_id == playbook_id
                    && i.initiated_by == initiated_by
                    && !i.status.is_terminal()
                    && i.started_at >= started_after
                    && &i.input_data == input_data
            })
            .max_by_key(|i| i.started_at)
            .cloned())
    }

    async fn stalled_instances(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ExecutionInstance>, StorageError> {
        let mut stalled: Vec<ExecutionInstance> = self
            .instances
            .read()
            .values()
            .filter(|i| {
                i.status == ExecutionStatus::InProgress && i.last_activity_at < stale_before
            })
            .cloned()
            .collect();

        stalled.sort_by_key(|i| i.last_activity_at);
        stalled.truncate(limit as usize);
        Ok(stalled)
    }

    async fn insert_step_instance(&self, step: &StepInstance) -> Result<(), StorageError> {
        self.steps.write().insert(step.id, step.clone());
        Ok(())
    }

    async fn update_step_instance(&self, step: &StepInstance) -> Result<(), StorageError> {
        let mut steps = self.steps.write();
        if !steps.contains_key(&step.id) {
            return Err(StorageError::not_found("step instance", step.id));
        }
        steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn get_step_instance(
        &self,
        organization_id: Uuid,
        id: Uuid,
    ) -> Result<StepInstance, StorageError> {
        self.steps
            .read()
            .get(&id)
            .filter(|s| s.organization_id == organization_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("step instance", id))
    }

    async fn active_step_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<StepInstance>, StorageError> {
        Ok(self
            .steps
            .read()
            .values()
            .find(|s| {
                s.organization_id == organization_id
                    && s.execution_id == execution_id
                    && s.step_id == step_id
                    && s.status == StepStatus::Active
            })
            .cloned())
    }

    async fn latest_step_instance(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<StepInstance>, StorageError> {
        Ok(self
            .steps
            .read()
            .values()
            .filter(|s| {
                s.organization_id == organization_id
                    && s.execution_id == execution_id
                    && s.step_id == step_id
            })
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn list_step_instances(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<StepInstance>, StorageError> {
        let mut steps: Vec<StepInstance> = self
            .steps
            .read()
            .values()
            .filter(|s| s.organization_id == organization_id && s.execution_id == execution_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.started_at);
        Ok(steps)
    }

    async fn insert_task(&self, task: &Task) -> Result<(), StorageError> {
        self.tasks.write().insert(task.task_id, task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), StorageError> {
        let mut tasks = self.tasks.write();
        if !tasks.contains_key(&task.task_id) {
            return Err(StorageError::not_found("task", task.task_id));
        }
        tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_task(&self, organization_id: Uuid, task_id: Uuid) -> Result<Task, StorageError> {
        self.tasks
            .read()
            .get(&task_id)
            .filter(|t| t.organization_id == organization_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("task", task_id))
    }

    async fn open_task_for_step(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<Task>, StorageError> {
        Ok(self
            .tasks
            .read()
            .values()
            .find(|t| {
                t.organization_id == organization_id
                    && t.execution_id == execution_id
                    && t.step_id == step_id
                    && t.state.is_open()
            })
            .cloned())
    }

    async fn list_tasks(
        &self,
        organization_id: Uuid,
        filter: &TaskFilter,
        page: &Page,
    ) -> Result<Vec<Task>, StorageError> {
        let now = Utc::now();
        let mut matches: Vec<Task> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.organization_id == organization_id)
            .filter(|t| filter.execution_id.is_none_or(|e| t.execution_id == e))
            .filter(|t| filter.state.is_none_or(|s| t.state == s))
            .filter(|t| {
                filter.assignee_role.as_ref().is_none_or(|role| {
                    matches!(&t.assignee, steward_core::Assignee::Role(r) if r == role)
                })
            })
            .filter(|t| {
                filter.assignee_user.as_ref().is_none_or(|user| {
                    matches!(&t.assignee, steward_core::Assignee::User(u) if u == user)
                })
            })
            .filter(|t| filter.priority.is_none_or(|p| t.priority == p))
            .filter(|t| filter.overdue.is_none_or(|o| t.is_overdue(now) == o))
            .cloned()
            .collect();

        matches.sort_by_key(|t| t.created_at);
        Ok(matches
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect())
    }

    async fn insert_timer(&self, timer: &Timer) -> Result<(), StorageError> {
        self.timers.write().insert(timer.timer_id, timer.clone());
        Ok(())
    }

    async fn get_timer(
        &self,
        organization_id: Uuid,
        timer_id: Uuid,
    ) -> Result<Timer, StorageError> {
        self.timers
            .read()
            .get(&timer_id)
            .filter(|t| t.organization_id == organization_id)
            .cloned()
            .ok_or_else(|| StorageError::not_found("timer", timer_id))
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<Timer>, StorageError> {
        let mut due: Vec<Timer> = self
            .timers
            .read()
            .values()
            .filter(|t| t.is_claimable(now, lease))
            .cloned()
            .collect();
        due.sort_by_key(|t| t.fire_at);
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn claim_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Vec<Timer>, StorageError> {
        // Single write lock makes the whole claim batch atomic.
        let mut timers = self.timers.write();

        let mut eligible: Vec<Uuid> = timers
            .values()
            .filter(|t| t.is_claimable(now, lease))
            .map(|t| t.timer_id)
            .collect();
        eligible.sort_by_key(|id| timers.get(id).map(|t| t.fire_at));
        eligible.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(eligible.len());
        for id in eligible {
            if let Some(timer) = timers.get_mut(&id) {
                timer.claimed_by = Some(worker_id.to_string());
                timer.claimed_at = Some(now);
                claimed.push(timer.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_timer_fired(&self, timer_id: Uuid, worker_id: &str) -> Result<(), StorageError> {
        let mut timers = self.timers.write();
        let timer = timers
            .get_mut(&timer_id)
            .ok_or_else(|| StorageError::not_found("timer", timer_id))?;

        if timer.fired || timer.claimed_by.as_deref() != Some(worker_id) {
            return Err(StorageError::ClaimLost { timer_id });
        }

        timer.fired = true;
        Ok(())
    }

    async fn release_timer_claim(
        &self,
        timer_id: Uuid,
        worker_id: &str,
    ) -> Result<(), StorageError> {
        let mut timers = self.timers.write();
        let timer = timers
            .get_mut(&timer_id)
            .ok_or_else(|| StorageError::not_found("timer", timer_id))?;

        if timer.claimed_by.as_deref() == Some(worker_id) && !timer.fired {
            timer.claimed_by = None;
            timer.claimed_at = None;
        }
        Ok(())
    }

    async fn pending_timers_for_execution(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<Timer>, StorageError> {
        let mut pending: Vec<Timer> = self
            .timers
            .read()
            .values()
            .filter(|t| {
                t.organization_id == organization_id
                    && t.execution_id == execution_id
                    && !t.fired
            })
            .cloned()
            .collect();
        pending.sort_by_key(|t| t.fire_at);
        Ok(pending)
    }

    async fn reschedule_timer(
        &self,
        organization_id: Uuid,
        timer_id: Uuid,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut timers = self.timers.write();
        let timer = timers
            .get_mut(&timer_id)
            .filter(|t| t.organization_id == organization_id && !t.fired)
            .ok_or_else(|| StorageError::not_found("timer", timer_id))?;
        timer.fire_at = fire_at;
        Ok(())
    }

    async fn cancel_timer(
        &self,
        organization_id: Uuid,
        timer_id: Uuid,
    ) -> Result<(), StorageError> {
        let mut timers = self.timers.write();
        match timers.get(&timer_id) {
            Some(t) if t.organization_id == organization_id && !t.fired => {
                timers.remove(&timer_id);
                Ok(())
            }
            _ => Err(StorageError::not_found("timer", timer_id)),
        }
    }

    async fn append_effect(&self, effect: &EffectRecord) -> Result<(), StorageError> {
        self.effects.write().push(effect.clone());
        Ok(())
    }

    async fn update_effect(&self, effect: &EffectRecord) -> Result<(), StorageError> {
        let mut effects = self.effects.write();
        let stored = effects
            .iter_mut()
            .find(|e| e.id == effect.id)
            .ok_or_else(|| StorageError::not_found("effect record", effect.id))?;
        *stored = effect.clone();
        Ok(())
    }

    async fn list_effects(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
        filter: &EffectFilter,
    ) -> Result<Vec<EffectRecord>, StorageError> {
        let mut matches: Vec<EffectRecord> = self
            .effects
            .read()
            .iter()
            .filter(|e| e.organization_id == organization_id && e.execution_id == execution_id)
            .filter(|e| filter.step_id.as_ref().is_none_or(|s| &e.step_id == s))
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| filter.retryable.is_none_or(|r| e.retryable == r))
            .cloned()
            .collect();
        matches.sort_by_key(|e| e.created_at);
        Ok(matches)
    }

    async fn append_status_change(&self, change: &StatusChange) -> Result<(), StorageError> {
        self.status_changes.write().push(change.clone());
        Ok(())
    }

    async fn status_history(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<StatusChange>, StorageError> {
        Ok(self
            .status_changes
            .read()
            .iter()
            .filter(|c| c.organization_id == organization_id && c.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StorageError> {
        self.audits.write().push(record.clone());
        Ok(())
    }

    async fn audit_trail(
        &self,
        organization_id: Uuid,
        execution_id: Uuid,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        Ok(self
            .audits
            .read()
            .iter()
            .filter(|a| a.organization_id == organization_id && a.execution_id == execution_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use steward_core::TimerPurpose;

    fn org() -> Uuid {
        Uuid::now_v7()
    }

    fn instance(organization_id: Uuid) -> ExecutionInstance {
        ExecutionInstance::new(
            organization_id,
            "onboarding",
            1,
            json!({"customer_id": "c-1"}),
            "alex@example.com",
        )
    }

    #[tokio::test]
    async fn test_tenancy_scopes_reads() {
        let storage = InMemoryStorage::new();
        let org_a = org();
        let org_b = org();

        let inst = instance(org_a);
        storage.insert_instance(&inst).await.unwrap();

        assert!(storage.get_instance(org_a, inst.execution_id).await.is_ok());
        assert!(matches!(
            storage.get_instance(org_b, inst.execution_id).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_conditional_update_detects_conflict() {
        let storage = InMemoryStorage::new();
        let organization_id = org();
        let mut inst = instance(organization_id);
        storage.insert_instance(&inst).await.unwrap();

        // First writer wins
        inst.version = 1;
        storage.update_instance(&inst, 0).await.unwrap();

        // Second writer with the stale version loses
        let mut stale = inst.clone();
        stale.version = 1;
        let result = storage.update_instance(&stale, 0).await;
        assert!(matches!(
            result,
            Err(StorageError::VersionConflict {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let storage = InMemoryStorage::new();
        let organization_id = org();
        let now = Utc::now();
        let timer = Timer::schedule(
            organization_id,
            Uuid::now_v7(),
            None,
            TimerPurpose::Retry,
            now - chrono::Duration::seconds(1),
        );
        storage.insert_timer(&timer).await.unwrap();

        let lease = Duration::from_secs(300);
        let first = storage.claim_due_timers(now, 10, "w1", lease).await.unwrap();
        let second = storage.claim_due_timers(now, 10, "w2", lease).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 0);
    }

    #[tokio::test]
    async fn test_mark_fired_exactly_once() {
        let storage = InMemoryStorage::new();
        let organization_id = org();
        let now = Utc::now();
        let timer = Timer::schedule(
            organization_id,
            Uuid::now_v7(),
            None,
            TimerPurpose::Wait,
            now - chrono::Duration::seconds(1),
        );
        storage.insert_timer(&timer).await.unwrap();

        let lease = Duration::from_secs(300);
        storage.claim_due_timers(now, 10, "w1", lease).await.unwrap();

        storage.mark_timer_fired(timer.timer_id, "w1").await.unwrap();
        assert!(matches!(
            storage.mark_timer_fired(timer.timer_id, "w1").await,
            Err(StorageError::ClaimLost { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_allows_reclaim() {
        let storage = InMemoryStorage::new();
        let organization_id = org();
        let now = Utc::now();
        let timer = Timer::schedule(
            organization_id,
            Uuid::now_v7(),
            None,
            TimerPurpose::Retry,
            now - chrono::Duration::minutes(10),
        );
        storage.insert_timer(&timer).await.unwrap();

        let lease = Duration::from_secs(300);
        storage.claim_due_timers(now, 10, "w1", lease).await.unwrap();

        // Six minutes later the lease has lapsed; another worker may reclaim
        let later = now + chrono::Duration::minutes(6);
        let reclaimed = storage
            .claim_due_timers(later, 10, "w2", lease)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);

        // The original worker can no longer mark it fired
        assert!(matches!(
            storage.mark_timer_fired(timer.timer_id, "w1").await,
            Err(StorageError::ClaimLost { .. })
        ));
        storage.mark_timer_fired(timer.timer_id, "w2").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_start_matches_structural_input() {
        let storage = InMemoryStorage::new();
        let organization_id = org();
        let mut inst = instance(organization_id);
        inst.status = ExecutionStatus::InProgress;
        storage.insert_instance(&inst).await.unwrap();

        let window_start = Utc::now() - chrono::Duration::minutes(5);

        let hit = storage
            .find_duplicate_start(
                organization_id,
                "onboarding",
                "alex@example.com",
                &json!({"customer_id": "c-1"}),
                window_start,
            )
            .await
            .unwrap();
        assert!(hit.is_some());

        let miss = storage
            .find_duplicate_start(
                organization_id,
                "onboarding",
                "alex@example.com",
                &json!({"customer_id": "c-2"}),
                window_start,
            )
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_open_task_for_step_ignores_settled_tasks() {
        let storage = InMemoryStorage::new();
        let organization_id = org();
        let execution_id = Uuid::now_v7();

        let mut done = Task::open(
            organization_id,
            execution_id,
            "review",
            steward_core::Assignee::role("ops"),
            None,
            Default::default(),
        );
        done.state = TaskState::Done;
        storage.insert_task(&done).await.unwrap();

        assert!(storage
            .open_task_for_step(organization_id, execution_id, "review")
            .await
            .unwrap()
            .is_none());
    }
}
