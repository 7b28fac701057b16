//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use steward_core::TaskPriority;

/// How duplicate start requests are detected
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Structural equality of the full input payload
    #[default]
    FullInputEquality,
    /// No deduplication
    Disabled,
}

/// Tunables for the execution engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Window within which an identical start request is a duplicate
    #[serde(with = "duration_millis")]
    pub dedup_window: Duration,

    pub dedup_policy: DedupPolicy,

    /// Bounded internal retries for version-conflicted writes before
    /// surfacing `ConcurrentModificationError`
    pub max_version_retries: u32,

    /// An `in_progress` instance with no activity beyond this threshold is
    /// nudged by the scheduler sweep
    #[serde(with = "duration_millis")]
    pub staleness_threshold: Duration,

    /// How long a claimed-but-unfired timer stays claimed before another
    /// worker may reclaim it
    #[serde(with = "duration_millis")]
    pub timer_claim_lease: Duration,

    /// Priority assigned to generated tasks
    pub default_task_priority: TaskPriority,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(5 * 60),
            dedup_policy: DedupPolicy::default(),
            max_version_retries: 3,
            staleness_threshold: Duration::from_secs(30 * 60),
            timer_claim_lease: Duration::from_secs(5 * 60),
            default_task_priority: TaskPriority::Normal,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_dedup_policy(mut self, policy: DedupPolicy) -> Self {
        self.dedup_policy = policy;
        self
    }

    pub fn with_max_version_retries(mut self, retries: u32) -> Self {
        self.max_version_retries = retries.max(1);
        self
    }

    pub fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    pub fn with_timer_claim_lease(mut self, lease: Duration) -> Self {
        self.timer_claim_lease = lease;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dedup_window, Duration::from_secs(300));
        assert_eq!(config.max_version_retries, 3);
        assert_eq!(config.dedup_policy, DedupPolicy::FullInputEquality);
    }

    #[test]
    fn test_retries_floor_at_one() {
        let config = EngineConfig::new().with_max_version_retries(0);
        assert_eq!(config.max_version_retries, 1);
    }
}
