//! End-to-end engine scenarios against the in-memory storage adapter

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use steward_core::{
    Assignee, AuditKind, Branch, DataContract, EffectStatus, ExecutionStatus, FieldSpec,
    FieldType, PlaybookDefinition, Predicate, RetryPolicy, StepDefinition, TaskState, Timer,
    TimerPurpose,
};
use steward_engine::{
    ActionAdapter, ActionFailure, ActionInvocation, AllowAll, CancelRequest, CompleteTaskRequest,
    EngineConfig, ExecutionEngine, PauseRequest, ResumeRequest, RetryEffectsRequest, Scheduler,
    SlaRecalcRequest, StartRequest, SweepArgs, SweepConfig,
};
use steward_storage::{InMemoryStorage, Page, Storage, TaskFilter};

/// Action adapter that replays a scripted sequence of outcomes
struct ScriptedAdapter {
    outcomes: Mutex<VecDeque<Result<Value, ActionFailure>>>,
}

impl ScriptedAdapter {
    fn new(outcomes: Vec<Result<Value, ActionFailure>>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
        })
    }
}

#[async_trait]
impl ActionAdapter for ScriptedAdapter {
    async fn execute(&self, _invocation: &ActionInvocation) -> Result<Value, ActionFailure> {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({"ok": true})))
    }
}

struct Harness {
    org: Uuid,
    storage: Arc<InMemoryStorage>,
    engine: Arc<ExecutionEngine<InMemoryStorage>>,
    scheduler: Scheduler<InMemoryStorage>,
}

impl Harness {
    fn new(outcomes: Vec<Result<Value, ActionFailure>>) -> Self {
        let storage = Arc::new(InMemoryStorage::new());
        let engine = Arc::new(ExecutionEngine::new(
            storage.clone(),
            ScriptedAdapter::new(outcomes),
            Arc::new(AllowAll),
            EngineConfig::default(),
        ));
        let scheduler = Scheduler::new(
            engine.clone(),
            SweepConfig::new().with_worker_id("sweeper-test"),
        );
        Self {
            org: Uuid::now_v7(),
            storage,
            engine,
            scheduler,
        }
    }

    async fn publish(&self, definition: PlaybookDefinition) {
        self.engine
            .definitions()
            .publish(definition)
            .await
            .expect("definition should publish");
    }

    async fn start(&self, playbook_id: &str, input: Value, initiated_by: &str) -> Uuid {
        self.engine
            .start(StartRequest {
                organization_id: self.org,
                playbook_id: playbook_id.to_string(),
                input_data: input,
                initiated_by: initiated_by.to_string(),
                owner_team: None,
                skip_input_validation: false,
            })
            .await
            .expect("start should succeed")
            .execution_id
    }

    async fn status(&self, execution_id: Uuid) -> ExecutionStatus {
        self.storage
            .get_instance(self.org, execution_id)
            .await
            .unwrap()
            .status
    }

    async fn open_tasks(&self, execution_id: Uuid) -> Vec<steward_core::Task> {
        self.storage
            .list_tasks(
                self.org,
                &TaskFilter {
                    execution_id: Some(execution_id),
                    state: Some(TaskState::Open),
                    ..Default::default()
                },
                &Page::default(),
            )
            .await
            .unwrap()
    }

    async fn complete_open_task(&self, execution_id: Uuid, completed_by: &str) {
        let tasks = self.open_tasks(execution_id).await;
        assert_eq!(tasks.len(), 1, "expected exactly one open task");
        self.engine
            .complete_task(CompleteTaskRequest {
                organization_id: self.org,
                task_id: tasks[0].task_id,
                completed_by: completed_by.to_string(),
            })
            .await
            .expect("task completion should succeed");
    }

    async fn sweep(&self) -> steward_engine::SweepReport {
        self.scheduler.run_sweep(SweepArgs::default()).await
    }
}

// =============================================================================
// Scenario A: task -> automated -> task -> completed
// =============================================================================

#[tokio::test]
async fn scenario_a_task_automated_task() {
    let harness = Harness::new(vec![Ok(json!({"verified": true}))]);
    let definition = PlaybookDefinition::new(harness.org, "fulfilment", 1).with_steps(vec![
        StepDefinition::task("collect", "ops").then("verify"),
        StepDefinition::automated("verify", "kyc.check")
            .with_retry_policy(RetryPolicy::fixed(Duration::ZERO, 2))
            .then("approve"),
        StepDefinition::task("approve", "managers"),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("fulfilment", json!({"order": 7}), "alex").await;

    // Started: in progress, one open task on the first step
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::InProgress);
    let tasks = harness.open_tasks(execution_id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].step_id, "collect");

    // Completing the task fires the automated step on the next sweep
    harness.complete_open_task(execution_id, "alex").await;
    let report = harness.sweep().await;
    assert_eq!(report.effects_executed, 1);
    assert!(report.errors.is_empty(), "sweep errors: {:?}", report.errors);

    // Automated step succeeded and the second task exists
    let tasks = harness.open_tasks(execution_id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].step_id, "approve");

    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(instance.current_step_id.as_deref(), Some("approve"));
    assert_eq!(
        instance.context.get("verify"),
        Some(&json!({"verified": true}))
    );

    // Completing the second task completes the instance
    harness.complete_open_task(execution_id, "morgan").await;
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::Completed);

    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert!(instance.output_data.is_some());
    assert!(instance.completed_at.is_some());
}

// =============================================================================
// Scenario B: retries exhausted -> instance failed, full effect history
// =============================================================================

#[tokio::test]
async fn scenario_b_retry_exhaustion_fails_instance() {
    let harness = Harness::new(vec![
        Err(ActionFailure::retryable("upstream timeout")),
        Err(ActionFailure::retryable("upstream timeout")),
    ]);
    let definition = PlaybookDefinition::new(harness.org, "sync", 1).with_steps(vec![
        StepDefinition::automated("push", "crm.sync")
            .with_retry_policy(RetryPolicy::fixed(Duration::ZERO, 2)),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("sync", json!({}), "alex").await;

    // First attempt fails, second is scheduled
    harness.sweep().await;
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::InProgress);

    // Second attempt exhausts the policy
    harness.sweep().await;
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::Failed);

    let effects = harness
        .storage
        .list_effects(harness.org, execution_id, &Default::default())
        .await
        .unwrap();
    assert_eq!(effects.len(), 2);
    assert!(effects.iter().all(|e| e.status == EffectStatus::Failed));
    assert_eq!(effects[0].attempt, 1);
    assert_eq!(effects[1].attempt, 2);

    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert!(instance.error.as_deref().unwrap_or("").contains("timeout"));
}

// =============================================================================
// Scenario C: pause/resume does not duplicate the step's task
// =============================================================================

#[tokio::test]
async fn scenario_c_pause_resume_no_duplicate_task() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "review", 1)
        .with_steps(vec![StepDefinition::task("review", "ops")]);
    harness.publish(definition).await;

    let execution_id = harness.start("review", json!({}), "alex").await;
    let step_before = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap()
        .current_step_id;

    harness
        .engine
        .pause(PauseRequest {
            organization_id: harness.org,
            execution_id,
            reason: Some("holiday freeze".to_string()),
            paused_by: "alex".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::Paused);

    harness
        .engine
        .resume(ResumeRequest {
            organization_id: harness.org,
            execution_id,
            resumed_by: "alex".to_string(),
            notes: None,
        })
        .await
        .unwrap();

    // Resumes from the exact step, not step 1, and without a second task
    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(instance.status, ExecutionStatus::InProgress);
    assert_eq!(instance.current_step_id, step_before);

    let all_tasks = harness
        .storage
        .list_tasks(
            harness.org,
            &TaskFilter {
                execution_id: Some(execution_id),
                ..Default::default()
            },
            &Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(all_tasks.len(), 1);
}

#[tokio::test]
async fn pause_rejected_unless_in_progress() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "review", 1)
        .with_steps(vec![StepDefinition::task("review", "ops")]);
    harness.publish(definition).await;

    let execution_id = harness.start("review", json!({}), "alex").await;
    let pause = |by: &str| PauseRequest {
        organization_id: harness.org,
        execution_id,
        reason: None,
        paused_by: by.to_string(),
    };

    harness.engine.pause(pause("alex")).await.unwrap();
    let err = harness.engine.pause(pause("alex")).await.unwrap_err();
    assert!(matches!(
        err,
        steward_core::EngineError::InvalidStateTransition { .. }
    ));
}

// =============================================================================
// Scenario D: dry-run sweep reports without firing
// =============================================================================

#[tokio::test]
async fn scenario_d_dry_run_reports_without_firing() {
    let harness = Harness::new(vec![]);

    let now = Utc::now();
    for _ in 0..5 {
        harness
            .storage
            .insert_timer(&Timer::schedule(
                harness.org,
                Uuid::now_v7(),
                None,
                TimerPurpose::Reminder,
                now - chrono::Duration::minutes(1),
            ))
            .await
            .unwrap();
    }

    let report = harness
        .scheduler
        .run_sweep(SweepArgs {
            dry_run: true,
            max_instances_per_run: None,
        })
        .await;

    assert!(report.dry_run);
    assert_eq!(report.pending.len(), 5);
    assert_eq!(report.timers_claimed, 0);
    assert_eq!(report.timers_fired, 0);

    // Nothing fired, nothing claimed
    assert_eq!(harness.storage.unfired_timer_count(), 5);
    let unclaimed = harness
        .storage
        .due_timers(Utc::now(), 10, Duration::from_secs(300))
        .await
        .unwrap();
    assert_eq!(unclaimed.len(), 5);
}

// =============================================================================
// Duplicate-start window
// =============================================================================

#[tokio::test]
async fn duplicate_start_returns_existing_execution_id() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "onboard", 1)
        .with_steps(vec![StepDefinition::task("kyc", "ops")]);
    harness.publish(definition).await;

    let input = json!({"customer_id": "c-42"});
    let first = harness.start("onboard", input.clone(), "alex").await;

    let err = harness
        .engine
        .start(StartRequest {
            organization_id: harness.org,
            playbook_id: "onboard".to_string(),
            input_data: input,
            initiated_by: "alex".to_string(),
            owner_team: None,
            skip_input_validation: false,
        })
        .await
        .unwrap_err();

    match err {
        steward_core::EngineError::DuplicateExecution {
            existing_execution_id,
        } => assert_eq!(existing_execution_id, first),
        other => panic!("expected DuplicateExecution, got {other}"),
    }

    // Different input is not a duplicate
    let second = harness
        .start("onboard", json!({"customer_id": "c-43"}), "alex")
        .await;
    assert_ne!(second, first);
}

// =============================================================================
// Timer claim: exactly one winner under concurrency
// =============================================================================

#[tokio::test]
async fn concurrent_claims_have_single_winner() {
    let storage = Arc::new(InMemoryStorage::new());
    let now = Utc::now();
    let timer = Timer::schedule(
        Uuid::now_v7(),
        Uuid::now_v7(),
        None,
        TimerPurpose::Retry,
        now - chrono::Duration::seconds(5),
    );
    storage.insert_timer(&timer).await.unwrap();

    let mut handles = Vec::new();
    for worker in 0..8 {
        let storage = storage.clone();
        handles.push(tokio::spawn(async move {
            storage
                .claim_due_timers(now, 10, &format!("w{worker}"), Duration::from_secs(300))
                .await
                .unwrap()
                .len()
        }));
    }

    let mut total = 0;
    for handle in handles {
        total += handle.await.unwrap();
    }
    assert_eq!(total, 1, "exactly one worker must win the claim");
}

// =============================================================================
// SLA recalculation
// =============================================================================

#[tokio::test]
async fn sla_recalc_is_monotonic_and_audited() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "review", 1)
        .with_steps(vec![StepDefinition::task("review", "ops").with_sla_hours(24)]);
    harness.publish(definition).await;

    let execution_id = harness.start("review", json!({}), "alex").await;

    let task_before = &harness.open_tasks(execution_id).await[0];
    let old_due = task_before.due_at.expect("task should carry a due date");

    // Extend to 48 hours
    let receipt = harness
        .engine
        .recalculate_sla(SlaRecalcRequest {
            organization_id: harness.org,
            execution_id,
            sla_override_hours: 48,
            recalc_reason: Some("customer extension".to_string()),
            recalc_by: "morgan".to_string(),
            allow_past: false,
        })
        .await
        .unwrap();
    assert_eq!(receipt.old_due_at, Some(old_due));
    assert!(receipt.new_due_at > old_due);

    let task_after = &harness.open_tasks(execution_id).await[0];
    assert_eq!(task_after.due_at, Some(receipt.new_due_at));

    let audits = harness
        .storage
        .audit_trail(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(audits.len(), 1);
    assert_eq!(audits[0].kind, AuditKind::SlaRecalculated);

    // Moving the deadline into the past needs the explicit override
    let past = harness
        .engine
        .recalculate_sla(SlaRecalcRequest {
            organization_id: harness.org,
            execution_id,
            sla_override_hours: -1,
            recalc_reason: None,
            recalc_by: "morgan".to_string(),
            allow_past: false,
        })
        .await;
    assert!(matches!(
        past,
        Err(steward_core::EngineError::Validation(_))
    ));

    // A refused recalc appends no audit record
    let audits = harness
        .storage
        .audit_trail(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(audits.len(), 1);

    harness
        .engine
        .recalculate_sla(SlaRecalcRequest {
            organization_id: harness.org,
            execution_id,
            sla_override_hours: -1,
            recalc_reason: Some("escalate immediately".to_string()),
            recalc_by: "morgan".to_string(),
            allow_past: true,
        })
        .await
        .unwrap();

    let audits = harness
        .storage
        .audit_trail(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(audits.len(), 2);
}

// =============================================================================
// Decision routing
// =============================================================================

#[tokio::test]
async fn decision_routes_on_step_output() {
    let harness = Harness::new(vec![Ok(json!({"score": 80}))]);
    let definition = PlaybookDefinition::new(harness.org, "scoring", 1).with_steps(vec![
        StepDefinition::automated("score", "risk.score")
            .with_retry_policy(RetryPolicy::no_retry())
            .then("route"),
        StepDefinition::decision(
            "route",
            vec![
                Branch {
                    when: Predicate::Gt {
                        path: "score.score".to_string(),
                        value: 50.0,
                    },
                    next_step_id: Some("manual-review".to_string()),
                },
                Branch {
                    when: Predicate::Always,
                    next_step_id: None,
                },
            ],
        ),
        StepDefinition::task("manual-review", "risk-team"),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("scoring", json!({}), "alex").await;
    harness.sweep().await;

    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(instance.status, ExecutionStatus::InProgress);
    assert_eq!(instance.current_step_id.as_deref(), Some("manual-review"));

    let tasks = harness.open_tasks(execution_id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].assignee, Assignee::role("risk-team"));
}

#[tokio::test]
async fn decision_dead_end_fails_instance() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "strict", 1).with_steps(vec![
        StepDefinition::decision(
            "gate",
            vec![Branch {
                when: Predicate::Eq {
                    path: "gate.verdict".to_string(),
                    value: json!("approved"),
                },
                next_step_id: None,
            }],
        ),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("strict", json!({}), "alex").await;

    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(instance.status, ExecutionStatus::Failed);
    assert!(instance
        .error
        .as_deref()
        .unwrap_or("")
        .contains("no matching branch"));
}

// =============================================================================
// Optional steps, contracts, cancellation, waits
// =============================================================================

#[tokio::test]
async fn optional_step_failure_skips_and_advances() {
    let harness = Harness::new(vec![Err(ActionFailure::non_retryable("bad payload"))]);
    let definition = PlaybookDefinition::new(harness.org, "notify", 1).with_steps(vec![
        StepDefinition::automated("ping", "webhook.ping")
            .as_optional()
            .then("follow-up"),
        StepDefinition::task("follow-up", "ops"),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("notify", json!({}), "alex").await;
    harness.sweep().await;

    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(instance.status, ExecutionStatus::InProgress);
    assert_eq!(instance.current_step_id.as_deref(), Some("follow-up"));

    let steps = harness
        .storage
        .list_step_instances(harness.org, execution_id)
        .await
        .unwrap();
    let ping = steps.iter().find(|s| s.step_id == "ping").unwrap();
    assert_eq!(ping.status, steward_core::StepStatus::Skipped);
}

#[tokio::test]
async fn output_contract_violation_fails_instance() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "contracted", 1)
        .with_steps(vec![StepDefinition::task("work", "ops")])
        .with_output_contract(
            DataContract::empty().with_field(FieldSpec::required("approval", FieldType::Object)),
        );
    harness.publish(definition).await;

    let execution_id = harness.start("contracted", json!({}), "alex").await;
    harness.complete_open_task(execution_id, "alex").await;

    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(instance.status, ExecutionStatus::Failed);
    assert!(instance
        .error
        .as_deref()
        .unwrap_or("")
        .contains("output contract"));
}

#[tokio::test]
async fn input_contract_rejects_malformed_start() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "contracted", 1)
        .with_steps(vec![StepDefinition::task("work", "ops")])
        .with_input_contract(
            DataContract::empty().with_field(FieldSpec::required("customer_id", FieldType::String)),
        );
    harness.publish(definition).await;

    let err = harness
        .engine
        .start(StartRequest {
            organization_id: harness.org,
            playbook_id: "contracted".to_string(),
            input_data: json!({}),
            initiated_by: "alex".to_string(),
            owner_team: None,
            skip_input_validation: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, steward_core::EngineError::Validation(_)));

    // And no instance was created
    assert_eq!(harness.storage.instance_count(), 0);
}

#[tokio::test]
async fn cancel_settles_open_work() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "review", 1)
        .with_steps(vec![StepDefinition::task("review", "ops").with_sla_hours(4)]);
    harness.publish(definition).await;

    let execution_id = harness.start("review", json!({}), "alex").await;
    assert_eq!(harness.open_tasks(execution_id).await.len(), 1);

    harness
        .engine
        .cancel(CancelRequest {
            organization_id: harness.org,
            execution_id,
            reason: Some("customer withdrew".to_string()),
            cancelled_by: "alex".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(harness.status(execution_id).await, ExecutionStatus::Cancelled);
    assert!(harness.open_tasks(execution_id).await.is_empty());
    assert_eq!(harness.storage.unfired_timer_count(), 0);

    // Terminal states are final
    let err = harness
        .engine
        .cancel(CancelRequest {
            organization_id: harness.org,
            execution_id,
            reason: None,
            cancelled_by: "alex".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        steward_core::EngineError::InvalidStateTransition { .. }
    ));
}

#[tokio::test]
async fn cancel_with_inflight_attempt_is_cooperative() {
    let harness = Harness::new(vec![Ok(json!({"sent": true}))]);
    let definition = PlaybookDefinition::new(harness.org, "notify", 1).with_steps(vec![
        StepDefinition::automated("send", "email.send").then("after"),
        StepDefinition::task("after", "ops"),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("notify", json!({}), "alex").await;

    // Attempt is pending (scheduled but not yet executed): cancellation is
    // deferred to the next safe checkpoint
    harness
        .engine
        .cancel(CancelRequest {
            organization_id: harness.org,
            execution_id,
            reason: None,
            cancelled_by: "alex".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::InProgress);

    // The sweep settles the attempt, discards its outcome, and finalizes
    harness.sweep().await;

    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(instance.status, ExecutionStatus::Cancelled);
    assert!(instance.context.get("send").is_none(), "outcome must be discarded");

    // The attempt itself is still on the audit trail
    let effects = harness
        .storage
        .list_effects(harness.org, execution_id, &Default::default())
        .await
        .unwrap();
    assert_eq!(effects.len(), 1);
    assert_eq!(effects[0].status, EffectStatus::Succeeded);

    // No follow-up task was created
    assert!(harness.open_tasks(execution_id).await.is_empty());
}

#[tokio::test]
async fn wait_step_completes_on_timer() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "cooldown", 1).with_steps(vec![
        StepDefinition::wait("cooldown", Duration::ZERO).then("after"),
        StepDefinition::task("after", "ops"),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("cooldown", json!({}), "alex").await;
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::InProgress);
    assert!(harness.open_tasks(execution_id).await.is_empty());

    harness.sweep().await;

    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(instance.current_step_id.as_deref(), Some("after"));
    assert_eq!(harness.open_tasks(execution_id).await.len(), 1);
}

// =============================================================================
// Retry-effects operation
// =============================================================================

#[tokio::test]
async fn retry_effects_requires_current_step() {
    let harness = Harness::new(vec![
        Err(ActionFailure::non_retryable("gateway rejected")),
        Ok(json!({"sent": true})),
    ]);
    let definition = PlaybookDefinition::new(harness.org, "notify", 1).with_steps(vec![
        StepDefinition::automated("send", "email.send")
            .as_optional()
            .with_retry_policy(RetryPolicy::fixed(Duration::ZERO, 1))
            .then("after"),
        StepDefinition::task("after", "ops"),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("notify", json!({}), "alex").await;

    // Non-retryable failure: step skipped (optional), instance moves on
    harness.sweep().await;
    let instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    assert_eq!(instance.current_step_id.as_deref(), Some("after"));

    // Manual retry targets the settled step: cap is reached, so it needs
    // force_retry
    let request = RetryEffectsRequest {
        organization_id: harness.org,
        execution_id,
        step_id: "send".to_string(),
        effect_filter: Default::default(),
        force_retry: false,
        retried_by: "morgan".to_string(),
    };

    let err = harness.engine.retry_effects(request.clone()).await.unwrap_err();
    assert!(matches!(
        err,
        steward_core::EngineError::InvalidStateTransition { .. }
    ));
}

#[tokio::test]
async fn retry_effects_force_bypasses_attempt_cap() {
    let harness = Harness::new(vec![
        Err(ActionFailure::retryable("upstream timeout")),
        Ok(json!({"synced": true})),
    ]);
    let definition = PlaybookDefinition::new(harness.org, "sync", 1).with_steps(vec![
        StepDefinition::automated("push", "crm.sync")
            .with_retry_policy(RetryPolicy::fixed(Duration::ZERO, 1)),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("sync", json!({}), "alex").await;

    // Single attempt fails -> instance failed (cap is 1)
    harness.sweep().await;
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::Failed);

    // Terminal instances cannot be retried
    let err = harness
        .engine
        .retry_effects(RetryEffectsRequest {
            organization_id: harness.org,
            execution_id,
            step_id: "push".to_string(),
            effect_filter: Default::default(),
            force_retry: true,
            retried_by: "morgan".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        steward_core::EngineError::InvalidStateTransition { .. }
    ));
}

#[tokio::test]
async fn retry_effects_redispatches_current_step() {
    // Cap of 2 but only one attempt consumed: the step is still current and
    // active after one failure scheduled its retry; cancel that by using a
    // long backoff so the retry timer is far in the future.
    let harness = Harness::new(vec![
        Err(ActionFailure::retryable("upstream timeout")),
        Ok(json!({"synced": true})),
    ]);
    let definition = PlaybookDefinition::new(harness.org, "sync", 1).with_steps(vec![
        StepDefinition::automated("push", "crm.sync")
            .with_retry_policy(RetryPolicy::fixed(Duration::from_secs(3600), 3)),
    ]);
    harness.publish(definition).await;

    let execution_id = harness.start("sync", json!({}), "alex").await;

    // First attempt fails; the backoff retry is an hour away
    harness.sweep().await;
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::InProgress);

    // Operator retries immediately instead of waiting for the backoff
    let receipt = harness
        .engine
        .retry_effects(RetryEffectsRequest {
            organization_id: harness.org,
            execution_id,
            step_id: "push".to_string(),
            effect_filter: Default::default(),
            force_retry: false,
            retried_by: "morgan".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(receipt.matched, 1);
    assert_eq!(receipt.attempt, 3);

    harness.sweep().await;
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::Completed);
}

// =============================================================================
// Concurrency: version conflicts
// =============================================================================

#[tokio::test]
async fn racing_pauses_serialize_to_one_winner() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "review", 1)
        .with_steps(vec![StepDefinition::task("review", "ops")]);
    harness.publish(definition).await;

    let execution_id = harness.start("review", json!({}), "alex").await;

    let request = |by: &str| PauseRequest {
        organization_id: harness.org,
        execution_id,
        reason: None,
        paused_by: by.to_string(),
    };

    let (a, b) = tokio::join!(
        harness.engine.pause(request("alex")),
        harness.engine.pause(request("morgan"))
    );

    assert!(
        a.is_ok() != b.is_ok(),
        "exactly one racing pause must win (a: {a:?}, b: {b:?})"
    );
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::Paused);
}

// =============================================================================
// Scheduler self-healing
// =============================================================================

#[tokio::test]
async fn sweep_nudges_stalled_instance() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "review", 1)
        .with_steps(vec![StepDefinition::task("review", "ops")]);
    harness.publish(definition).await;

    let execution_id = harness.start("review", json!({}), "alex").await;

    // Simulate a crash after the step settled but before advance ran: the
    // step is completed, the instance still points at it, activity is old.
    let steps = harness
        .storage
        .list_step_instances(harness.org, execution_id)
        .await
        .unwrap();
    let mut step = steps[0].clone();
    step.status = steward_core::StepStatus::Completed;
    step.completed_at = Some(Utc::now());
    harness.storage.update_step_instance(&step).await.unwrap();

    let mut instance = harness
        .storage
        .get_instance(harness.org, execution_id)
        .await
        .unwrap();
    instance.last_activity_at = Utc::now() - chrono::Duration::hours(2);
    let expected = instance.version;
    instance.version = expected + 1;
    harness
        .storage
        .update_instance(&instance, expected)
        .await
        .unwrap();

    let report = harness.sweep().await;
    assert_eq!(report.stalled_nudged, 1);
    assert_eq!(harness.status(execution_id).await, ExecutionStatus::Completed);
}

// =============================================================================
// Status history
// =============================================================================

#[tokio::test]
async fn status_history_is_append_only_and_complete() {
    let harness = Harness::new(vec![]);
    let definition = PlaybookDefinition::new(harness.org, "review", 1)
        .with_steps(vec![StepDefinition::task("review", "ops")]);
    harness.publish(definition).await;

    let execution_id = harness.start("review", json!({}), "alex").await;
    harness
        .engine
        .pause(PauseRequest {
            organization_id: harness.org,
            execution_id,
            reason: Some("freeze".to_string()),
            paused_by: "alex".to_string(),
        })
        .await
        .unwrap();
    harness
        .engine
        .resume(ResumeRequest {
            organization_id: harness.org,
            execution_id,
            resumed_by: "alex".to_string(),
            notes: None,
        })
        .await
        .unwrap();
    harness.complete_open_task(execution_id, "alex").await;

    let history = harness
        .storage
        .status_history(harness.org, execution_id)
        .await
        .unwrap();

    let transitions: Vec<ExecutionStatus> = history.iter().map(|c| c.to).collect();
    assert_eq!(
        transitions,
        vec![
            ExecutionStatus::Pending,
            ExecutionStatus::InProgress,
            ExecutionStatus::Paused,
            ExecutionStatus::InProgress,
            ExecutionStatus::Completed,
        ]
    );
}
