//! Service layer: record lifecycle and migration orchestration.
//!
//! [`VersionedTable`] saves, deletes and reverts records of one live table
//! while keeping its shadow history. [`MigrationPropagator`] applies schema
//! changes and mirrors them onto shadow tables.

pub mod lifecycle;
pub mod migration;

pub use lifecycle::{SaveOutcome, VersionedTable};
pub use migration::{
    MigrationPropagator, MigrationReport, OperationOutcome, ShadowAction, ShadowPlan, SkipReason,
    plan_shadow_action,
};
