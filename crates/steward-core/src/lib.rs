//! # Steward Core
//!
//! Domain model for the playbook execution engine:
//!
//! - **Definitions**: playbooks, steps, next-step rules, data contracts
//! - **Executions**: instances, step instances, status history
//! - **Work items**: tasks, timers, effect records, audit records
//! - **Policies**: retry policy with exponential backoff
//!
//! This crate is pure data and validation logic; all I/O lives in
//! `steward-storage` and `steward-engine`.

pub mod audit;
pub mod contract;
pub mod definition;
pub mod effect;
pub mod error;
pub mod instance;
pub mod retry;
pub mod task;
pub mod timer;

pub use audit::{AuditKind, AuditRecord};
pub use contract::{DataContract, FieldSpec, FieldType};
pub use definition::{
    Branch, DefinitionStatus, NextStepRule, PlaybookDefinition, Predicate, StepDefinition,
    StepType,
};
pub use effect::{EffectRecord, EffectStatus};
pub use error::EngineError;
pub use instance::{ExecutionInstance, ExecutionStatus, StatusChange, StepInstance, StepStatus};
pub use retry::RetryPolicy;
pub use task::{Assignee, Task, TaskPriority, TaskState};
pub use timer::{Timer, TimerPurpose};
