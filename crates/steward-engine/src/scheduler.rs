//! Scheduler: the periodic sweep
//!
//! Claims due timers (atomic, lease-guarded), routes each by purpose, and
//! nudges stalled instances. Every instance is processed in isolation: one
//! failure is recorded in the report and the sweep continues.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use steward_core::{Timer, TimerPurpose};
use steward_storage::Storage;

use crate::engine::ExecutionEngine;

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Worker id recorded on timer claims
    pub worker_id: String,

    /// Maximum timers claimed per sweep
    pub timer_batch: u32,

    /// Default cap on stalled instances nudged per sweep
    pub default_max_instances: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("sweeper-{}", Uuid::now_v7()),
            timer_batch: 50,
            default_max_instances: 100,
        }
    }
}

impl SweepConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_timer_batch(mut self, batch: u32) -> Self {
        self.timer_batch = batch.max(1);
        self
    }
}

/// Arguments for one sweep run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepArgs {
    /// Perform all read/decision logic but suppress every write; the
    /// report lists what would happen
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub max_instances_per_run: Option<u32>,
}

/// An action a dry-run sweep would have taken
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlannedAction {
    FireTimer {
        timer_id: Uuid,
        execution_id: Uuid,
        purpose: TimerPurpose,
    },
    NudgeInstance {
        execution_id: Uuid,
    },
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub timers_claimed: usize,
    pub timers_fired: usize,
    pub effects_executed: usize,
    pub overdue_alerts: usize,
    pub stalled_nudged: usize,
    pub errors: Vec<String>,
    /// Dry-run only: what a real sweep would do
    pub pending: Vec<PlannedAction>,
}

/// Periodic sweep driver.
///
/// Horizontally scalable: multiple schedulers may run concurrently; the
/// atomic timer claim and the engine's version checks keep them safe.
pub struct Scheduler<S: Storage> {
    engine: Arc<ExecutionEngine<S>>,
    config: SweepConfig,
}

impl<S: Storage> Scheduler<S> {
    pub fn new(engine: Arc<ExecutionEngine<S>>, config: SweepConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run one sweep. Never returns an error: failures are isolated per
    /// timer/instance and reported.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id, dry_run = args.dry_run))]
    pub async fn run_sweep(&self, args: SweepArgs) -> SweepReport {
        let now = Utc::now();
        let mut report = SweepReport {
            dry_run: args.dry_run,
            ..Default::default()
        };

        let lease = self.engine.config().timer_claim_lease;
        let staleness = self.engine.config().staleness_threshold;
        let stale_before =
            now - chrono::Duration::milliseconds(staleness.as_millis() as i64);
        let max_instances = args
            .max_instances_per_run
            .unwrap_or(self.config.default_max_instances);

        if args.dry_run {
            match self
                .engine
                .storage()
                .due_timers(now, self.config.timer_batch, lease)
                .await
            {
                Ok(due) => {
                    for timer in due {
                        report.pending.push(PlannedAction::FireTimer {
                            timer_id: timer.timer_id,
                            execution_id: timer.execution_id,
                            purpose: timer.purpose,
                        });
                    }
                }
                Err(e) => report.errors.push(format!("due timer scan: {e}")),
            }

            match self
                .engine
                .storage()
                .stalled_instances(stale_before, max_instances)
                .await
            {
                Ok(stalled) => {
                    for instance in stalled {
                        report.pending.push(PlannedAction::NudgeInstance {
                            execution_id: instance.execution_id,
                        });
                    }
                }
                Err(e) => report.errors.push(format!("stalled scan: {e}")),
            }

            info!(pending = report.pending.len(), "dry-run sweep complete");
            return report;
        }

        // Phase 1: claim and process due timers
        let claimed = match self
            .engine
            .timers()
            .claim_due(now, self.config.timer_batch, &self.config.worker_id, lease)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                report.errors.push(format!("timer claim: {e}"));
                Vec::new()
            }
        };
        report.timers_claimed = claimed.len();

        for timer in claimed {
            match self.process_timer(&timer, &mut report).await {
                Ok(()) => report.timers_fired += 1,
                Err(e) => {
                    warn!(timer_id = %timer.timer_id, "timer processing failed: {e}");
                    report
                        .errors
                        .push(format!("timer {}: {e}", timer.timer_id));
                    // Give the claim back so a later sweep retries
                    if let Err(release_err) = self
                        .engine
                        .timers()
                        .release(timer.timer_id, &self.config.worker_id)
                        .await
                    {
                        report
                            .errors
                            .push(format!("release {}: {release_err}", timer.timer_id));
                    }
                }
            }
        }

        // Phase 2: nudge stalled instances to self-heal stuck workflows
        match self
            .engine
            .storage()
            .stalled_instances(stale_before, max_instances)
            .await
        {
            Ok(stalled) => {
                for instance in stalled {
                    match self
                        .engine
                        .advance(instance.organization_id, instance.execution_id)
                        .await
                    {
                        Ok(()) => report.stalled_nudged += 1,
                        Err(e) => {
                            warn!(execution_id = %instance.execution_id, "nudge failed: {e}");
                            report
                                .errors
                                .push(format!("nudge {}: {e}", instance.execution_id));
                        }
                    }
                }
            }
            Err(e) => report.errors.push(format!("stalled scan: {e}")),
        }

        info!(
            timers_fired = report.timers_fired,
            stalled_nudged = report.stalled_nudged,
            errors = report.errors.len(),
            "sweep complete"
        );
        report
    }

    /// Route one claimed timer by purpose, then mark it fired.
    async fn process_timer(
        &self,
        timer: &Timer,
        report: &mut SweepReport,
    ) -> Result<(), steward_core::EngineError> {
        match timer.purpose {
            TimerPurpose::Retry => {
                if self.engine.run_retry_timer(timer).await? {
                    report.effects_executed += 1;
                }
            }
            TimerPurpose::Wait => {
                self.engine.complete_wait_step(timer).await?;
            }
            TimerPurpose::Sla => {
                warn!(
                    execution_id = %timer.execution_id,
                    due_at = %timer.fire_at,
                    "sla deadline passed"
                );
                report.overdue_alerts += 1;
            }
            TimerPurpose::Reminder => {
                info!(execution_id = %timer.execution_id, "reminder fired");
            }
        }

        self.engine
            .timers()
            .mark_fired(timer.timer_id, &self.config.worker_id)
            .await
    }
}
