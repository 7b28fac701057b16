//! # Steward Storage
//!
//! Storage adapter boundary for the playbook engine. The [`Storage`] trait
//! is the only interface the engine sees; every read is filtered by
//! `organization_id` and every instance write is conditional on the
//! optimistic-lock `version` — tenancy and write safety are enforced here,
//! not in the engine.
//!
//! Two implementations:
//! - [`InMemoryStorage`]: `parking_lot`-guarded maps, used by tests
//! - [`PostgresStorage`]: sqlx-backed production store

pub mod adapter;
pub mod memory;
pub mod postgres;

pub use adapter::{
    EffectFilter, InstanceFilter, InstanceSortKey, Page, SortOrder, Storage, StorageError,
    TaskFilter,
};
pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;
