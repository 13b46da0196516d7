//! Data layer for migrations and their batch jobs.

pub mod batch_range;
pub mod batched_job;
pub mod batched_migration;

pub use batch_range::BatchRange;
pub use batched_job::{BatchedJob, NewBatchedJob};
pub use batched_migration::{
    normalize_class_name, BatchedMigration, MigrationConfiguration, NewBatchedMigration,
};
