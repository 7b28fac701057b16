//! # Steward Engine
//!
//! The playbook execution engine: runs multi-step, long-lived business
//! workflows as durable instances over the storage adapter.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionEngine                        │
//! │  (single state-machine implementation; every mutation is a  │
//! │   version-checked transition)                               │
//! └─────────────────────────────────────────────────────────────┘
//!         │                │                 │
//!         ▼                ▼                 ▼
//!   DefinitionStore   TaskManager      TimerService
//!         │                │                 │
//!         └────────────────┴─────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Storage adapter                        │
//! └─────────────────────────────────────────────────────────────┘
//!                          ▲
//!                          │ claims due timers, nudges stalled
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The scheduler sweep and inbound API calls converge on the same
//! `ExecutionEngine` entry points, so there is exactly one place where
//! state transitions are validated.

pub mod actions;
pub mod authz;
pub mod config;
pub mod definitions;
pub mod engine;
pub mod ops;
pub mod runner;
pub mod scheduler;
pub mod tasks;
pub mod timers;

pub use actions::{ActionAdapter, ActionFailure, ActionInvocation};
pub use authz::{AllowAll, AuthorizationAdapter};
pub use config::{DedupPolicy, EngineConfig};
pub use definitions::DefinitionStore;
pub use engine::{
    CancelRequest, CompleteTaskRequest, DescribeOptions, ExecutionDetail, ExecutionEngine,
    PauseRequest, ReassignRequest, ReassignTaskRequest, ResumeRequest, StartReceipt, StartRequest,
};
pub use ops::{Operation, OperationRegistry};
pub use runner::{RetryEffectsReceipt, RetryEffectsRequest};
pub use scheduler::{PlannedAction, Scheduler, SweepArgs, SweepConfig, SweepReport};
pub use tasks::TaskManager;
pub use timers::{SlaRecalcReceipt, SlaRecalcRequest, TimerService};
