//! Timers: SLA deadlines, retry backoff, reminders, and wait-step delays
//!
//! A timer fires exactly once. Firing is split into claim (atomic, one
//! worker wins) and mark-fired; a claim that is never marked fired becomes
//! reclaimable after the lease lapses.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Why the timer exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerPurpose {
    /// SLA deadline; firing raises an overdue alert
    Sla,
    /// Drives an automated-step attempt (first attempt or backoff retry)
    Retry,
    /// Informational nudge
    Reminder,
    /// Completes a wait step
    Wait,
}

impl std::fmt::Display for TimerPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sla => write!(f, "sla"),
            Self::Retry => write!(f, "retry"),
            Self::Reminder => write!(f, "reminder"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

impl std::str::FromStr for TimerPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sla" => Ok(Self::Sla),
            "retry" => Ok(Self::Retry),
            "reminder" => Ok(Self::Reminder),
            "wait" => Ok(Self::Wait),
            other => Err(format!("unknown timer purpose: {other}")),
        }
    }
}

/// A scheduled firing owned by an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub timer_id: Uuid,
    pub organization_id: Uuid,
    pub execution_id: Uuid,

    /// The step instance this timer drives, when purpose-specific
    pub step_instance_id: Option<Uuid>,

    pub purpose: TimerPurpose,
    pub fire_at: DateTime<Utc>,

    /// Transitions false -> true exactly once
    pub fired: bool,

    /// Scheduler worker currently holding the claim
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
}

impl Timer {
    pub fn schedule(
        organization_id: Uuid,
        execution_id: Uuid,
        step_instance_id: Option<Uuid>,
        purpose: TimerPurpose,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            timer_id: Uuid::now_v7(),
            organization_id,
            execution_id,
            step_instance_id,
            purpose,
            fire_at,
            fired: false,
            claimed_by: None,
            claimed_at: None,
        }
    }

    /// Whether a worker may claim this timer at `now`.
    ///
    /// Claimable when due and either unclaimed or held under a lease that
    /// has lapsed.
    pub fn is_claimable(&self, now: DateTime<Utc>, lease: Duration) -> bool {
        if self.fired || self.fire_at > now {
            return false;
        }
        match self.claimed_at {
            None => true,
            Some(claimed_at) => {
                let lease = chrono::Duration::milliseconds(lease.as_millis() as i64);
                claimed_at + lease <= now
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer(fire_at: DateTime<Utc>) -> Timer {
        Timer::schedule(
            Uuid::now_v7(),
            Uuid::now_v7(),
            None,
            TimerPurpose::Sla,
            fire_at,
        )
    }

    #[test]
    fn test_future_timer_not_claimable() {
        let now = Utc::now();
        let t = timer(now + chrono::Duration::minutes(5));
        assert!(!t.is_claimable(now, Duration::from_secs(300)));
    }

    #[test]
    fn test_due_unclaimed_timer_is_claimable() {
        let now = Utc::now();
        let t = timer(now - chrono::Duration::seconds(1));
        assert!(t.is_claimable(now, Duration::from_secs(300)));
    }

    #[test]
    fn test_live_claim_blocks_reclaim() {
        let now = Utc::now();
        let mut t = timer(now - chrono::Duration::minutes(1));
        t.claimed_by = Some("worker-1".to_string());
        t.claimed_at = Some(now - chrono::Duration::seconds(30));

        assert!(!t.is_claimable(now, Duration::from_secs(300)));
    }

    #[test]
    fn test_lapsed_lease_is_reclaimable() {
        let now = Utc::now();
        let mut t = timer(now - chrono::Duration::minutes(10));
        t.claimed_by = Some("worker-1".to_string());
        t.claimed_at = Some(now - chrono::Duration::minutes(6));

        assert!(t.is_claimable(now, Duration::from_secs(300)));
    }

    #[test]
    fn test_fired_timer_never_claimable() {
        let now = Utc::now();
        let mut t = timer(now - chrono::Duration::minutes(10));
        t.fired = true;
        assert!(!t.is_claimable(now, Duration::from_secs(300)));
    }
}
