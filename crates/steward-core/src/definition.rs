//! Playbook definitions
//!
//! A playbook is the declarative template for a business process: an
//! ordered list of steps with routing rules and input/output contracts.
//! Definitions are immutable once published; an execution binds to the
//! exact version that was active when it started and is never upgraded
//! mid-flight.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::contract::DataContract;
use crate::retry::RetryPolicy;

/// Lifecycle status of a published definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Deprecated,
}

impl std::fmt::Display for DefinitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Deprecated => write!(f, "deprecated"),
        }
    }
}

impl std::str::FromStr for DefinitionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "deprecated" => Ok(Self::Deprecated),
            other => Err(format!("unknown definition status: {other}")),
        }
    }
}

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Human work item, tracked as a Task
    Task,
    /// External side effect via the action adapter, tracked as EffectRecords
    Automated,
    /// Synchronous branch over the instance context
    Decision,
    /// Timer-driven delay
    Wait,
}

/// A boolean predicate over the instance context.
///
/// Paths are dotted (`"approval.verdict"`) and resolve against the
/// accumulated step outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    Always,
    Eq { path: String, value: Value },
    Ne { path: String, value: Value },
    Gt { path: String, value: f64 },
    Lt { path: String, value: f64 },
    Exists { path: String },
    All { preds: Vec<Predicate> },
    Any { preds: Vec<Predicate> },
}

impl Predicate {
    /// Evaluate against an instance context (a JSON object)
    pub fn evaluate(&self, context: &Value) -> bool {
        match self {
            Self::Always => true,
            Self::Eq { path, value } => lookup(context, path) == Some(value),
            Self::Ne { path, value } => lookup(context, path) != Some(value),
            Self::Gt { path, value } => lookup(context, path)
                .and_then(Value::as_f64)
                .is_some_and(|v| v > *value),
            Self::Lt { path, value } => lookup(context, path)
                .and_then(Value::as_f64)
                .is_some_and(|v| v < *value),
            Self::Exists { path } => lookup(context, path).is_some(),
            Self::All { preds } => preds.iter().all(|p| p.evaluate(context)),
            Self::Any { preds } => preds.iter().any(|p| p.evaluate(context)),
        }
    }
}

/// Resolve a dotted path against a JSON value
fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// One branch of a decision rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub when: Predicate,
    /// `None` means the branch ends the playbook
    pub next_step_id: Option<String>,
}

/// Routing rule evaluated when a step completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NextStepRule {
    /// Unconditional successor; `None` ends the playbook
    Static { next_step_id: Option<String> },

    /// First matching branch wins. No match is a fatal definition error,
    /// never a runtime skip.
    Decision { branches: Vec<Branch> },
}

impl NextStepRule {
    pub fn end() -> Self {
        Self::Static { next_step_id: None }
    }

    pub fn then(next_step_id: impl Into<String>) -> Self {
        Self::Static {
            next_step_id: Some(next_step_id.into()),
        }
    }

    /// Resolve the successor step id for a given context.
    ///
    /// Returns `Err(())` when a decision rule has no matching branch.
    pub fn resolve(&self, context: &Value) -> Result<Option<&str>, ()> {
        match self {
            Self::Static { next_step_id } => Ok(next_step_id.as_deref()),
            Self::Decision { branches } => branches
                .iter()
                .find(|branch| branch.when.evaluate(context))
                .map(|branch| branch.next_step_id.as_deref())
                .ok_or(()),
        }
    }

    /// All step ids this rule can route to
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Static { next_step_id } => next_step_id.iter().map(String::as_str).collect(),
            Self::Decision { branches } => branches
                .iter()
                .filter_map(|b| b.next_step_id.as_deref())
                .collect(),
        }
    }
}

/// A unit of work within a playbook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    pub name: String,
    pub step_type: StepType,

    /// Role the generated task is assigned to; required for task steps
    pub assignee_role: Option<String>,

    /// Deadline in hours for the step's task, used to derive `due_at`
    pub sla_hours: Option<u32>,

    /// Retry policy for automated steps
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// When true, an unrecoverable failure skips the step instead of
    /// failing the whole execution
    #[serde(default)]
    pub optional: bool,

    /// Action adapter label; required for automated steps
    pub action: Option<String>,

    /// Delay before a wait step completes; required for wait steps
    #[serde(default, with = "option_duration_millis")]
    pub wait_delay: Option<Duration>,

    pub next_step_rule: NextStepRule,
}

impl StepDefinition {
    /// A task step assigned to a role
    pub fn task(id: impl Into<String>, assignee_role: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Task,
            assignee_role: Some(assignee_role.into()),
            sla_hours: None,
            retry_policy: RetryPolicy::no_retry(),
            optional: false,
            action: None,
            wait_delay: None,
            next_step_rule: NextStepRule::end(),
        }
    }

    /// An automated step invoking the named action
    pub fn automated(id: impl Into<String>, action: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Automated,
            assignee_role: None,
            sla_hours: None,
            retry_policy: RetryPolicy::default(),
            optional: false,
            action: Some(action.into()),
            wait_delay: None,
            next_step_rule: NextStepRule::end(),
        }
    }

    /// A decision step with the given branches
    pub fn decision(id: impl Into<String>, branches: Vec<Branch>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Decision,
            assignee_role: None,
            sla_hours: None,
            retry_policy: RetryPolicy::no_retry(),
            optional: false,
            action: None,
            wait_delay: None,
            next_step_rule: NextStepRule::Decision { branches },
        }
    }

    /// A wait step that completes after the given delay
    pub fn wait(id: impl Into<String>, delay: Duration) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            step_type: StepType::Wait,
            assignee_role: None,
            sla_hours: None,
            retry_policy: RetryPolicy::no_retry(),
            optional: false,
            action: None,
            wait_delay: Some(delay),
            next_step_rule: NextStepRule::end(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sla_hours(mut self, hours: u32) -> Self {
        self.sla_hours = Some(hours);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn as_optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn then(mut self, next_step_id: impl Into<String>) -> Self {
        self.next_step_rule = NextStepRule::then(next_step_id);
        self
    }
}

/// The declarative template describing a business process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    pub organization_id: Uuid,

    /// Stable external code (e.g. `"customer-onboarding"`)
    pub id: String,

    pub version: u32,
    pub name: String,
    pub status: DefinitionStatus,

    /// Ordered; the first step is the entry step
    pub steps: Vec<StepDefinition>,

    pub input_contract: DataContract,
    pub output_contract: DataContract,

    #[serde(default, with = "option_duration_millis")]
    pub estimated_duration: Option<Duration>,
}

impl PlaybookDefinition {
    pub fn new(organization_id: Uuid, id: impl Into<String>, version: u32) -> Self {
        let id = id.into();
        Self {
            organization_id,
            name: id.clone(),
            id,
            version,
            status: DefinitionStatus::Active,
            steps: Vec::new(),
            input_contract: DataContract::empty(),
            output_contract: DataContract::empty(),
            estimated_duration: None,
        }
    }

    pub fn with_steps(mut self, steps: Vec<StepDefinition>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_input_contract(mut self, contract: DataContract) -> Self {
        self.input_contract = contract;
        self
    }

    pub fn with_output_contract(mut self, contract: DataContract) -> Self {
        self.output_contract = contract;
        self
    }

    /// The entry step (first in order)
    pub fn entry_step(&self) -> Option<&StepDefinition> {
        self.steps.first()
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Publish-time validation. Collects every problem.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();

        if self.version == 0 {
            violations.push("definition version must be >= 1".to_string());
        }
        if self.steps.is_empty() {
            violations.push("definition must declare at least one step".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                violations.push(format!("duplicate step id: {}", step.id));
            }
        }

        for step in &self.steps {
            match step.step_type {
                StepType::Task => {
                    if step.assignee_role.is_none() {
                        violations.push(format!("task step {} requires assignee_role", step.id));
                    }
                }
                StepType::Automated => {
                    if step.action.is_none() {
                        violations.push(format!("automated step {} requires an action", step.id));
                    }
                    if step.retry_policy.max_attempts == 0 {
                        violations.push(format!(
                            "automated step {} requires max_attempts >= 1",
                            step.id
                        ));
                    }
                }
                StepType::Decision => {
                    if let NextStepRule::Static { .. } = step.next_step_rule {
                        violations.push(format!(
                            "decision step {} requires a decision rule",
                            step.id
                        ));
                    }
                }
                StepType::Wait => {
                    if step.wait_delay.is_none() {
                        violations.push(format!("wait step {} requires wait_delay", step.id));
                    }
                }
            }

            for target in step.next_step_rule.targets() {
                if self.step(target).is_none() {
                    violations.push(format!(
                        "step {} routes to unknown step {target}",
                        step.id
                    ));
                }
            }
        }

        for violation in self.input_contract.schema_violations() {
            violations.push(format!("input contract: {violation}"));
        }
        for violation in self.output_contract.schema_violations() {
            violations.push(format!("output contract: {violation}"));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn org() -> Uuid {
        Uuid::now_v7()
    }

    #[test]
    fn test_predicate_evaluation() {
        let context = json!({"approval": {"verdict": "approved", "score": 7.5}});

        assert!(Predicate::Eq {
            path: "approval.verdict".into(),
            value: json!("approved")
        }
        .evaluate(&context));

        assert!(Predicate::Gt {
            path: "approval.score".into(),
            value: 5.0
        }
        .evaluate(&context));

        assert!(!Predicate::Exists {
            path: "approval.missing".into()
        }
        .evaluate(&context));

        assert!(Predicate::Any {
            preds: vec![
                Predicate::Exists {
                    path: "nope".into()
                },
                Predicate::Always,
            ]
        }
        .evaluate(&context));
    }

    #[test]
    fn test_decision_rule_first_match_wins() {
        let rule = NextStepRule::Decision {
            branches: vec![
                Branch {
                    when: Predicate::Eq {
                        path: "verdict".into(),
                        value: json!("approved"),
                    },
                    next_step_id: Some("fulfil".into()),
                },
                Branch {
                    when: Predicate::Always,
                    next_step_id: Some("review".into()),
                },
            ],
        };

        assert_eq!(
            rule.resolve(&json!({"verdict": "approved"})),
            Ok(Some("fulfil"))
        );
        assert_eq!(rule.resolve(&json!({"verdict": "rejected"})), Ok(Some("review")));
    }

    #[test]
    fn test_decision_rule_no_match_is_error() {
        let rule = NextStepRule::Decision {
            branches: vec![Branch {
                when: Predicate::Eq {
                    path: "verdict".into(),
                    value: json!("approved"),
                },
                next_step_id: None,
            }],
        };

        assert_eq!(rule.resolve(&json!({"verdict": "rejected"})), Err(()));
    }

    #[test]
    fn test_validate_accepts_well_formed_definition() {
        let definition = PlaybookDefinition::new(org(), "onboarding", 1).with_steps(vec![
            StepDefinition::task("collect-docs", "ops").then("verify"),
            StepDefinition::automated("verify", "kyc.check"),
        ]);

        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_broken_definition() {
        let definition = PlaybookDefinition::new(org(), "broken", 0).with_steps(vec![
            StepDefinition {
                assignee_role: None,
                ..StepDefinition::task("a", "ops")
            }
            .then("ghost"),
            StepDefinition::task("a", "ops"),
        ]);

        let violations = definition.validate().unwrap_err();
        assert!(violations.iter().any(|v| v.contains("version")));
        assert!(violations.iter().any(|v| v.contains("duplicate step id")));
        assert!(violations.iter().any(|v| v.contains("assignee_role")));
        assert!(violations.iter().any(|v| v.contains("unknown step ghost")));
    }

    #[test]
    fn test_validate_rejects_wait_without_delay() {
        let mut step = StepDefinition::wait("cooldown", Duration::from_secs(60));
        step.wait_delay = None;
        let definition = PlaybookDefinition::new(org(), "waiting", 1).with_steps(vec![step]);

        let violations = definition.validate().unwrap_err();
        assert_eq!(violations, vec!["wait step cooldown requires wait_delay"]);
    }

    #[test]
    fn test_definition_serialization_round_trip() {
        let definition = PlaybookDefinition::new(org(), "onboarding", 2).with_steps(vec![
            StepDefinition::task("collect-docs", "ops")
                .with_sla_hours(24)
                .then("route"),
            StepDefinition::decision(
                "route",
                vec![Branch {
                    when: Predicate::Always,
                    next_step_id: None,
                }],
            ),
        ]);

        let json = serde_json::to_string(&definition).unwrap();
        let parsed: PlaybookDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(definition, parsed);
    }
}
