//! # Registry Infrastructure
//!
//! Name-to-implementation lookup for the pluggable parts of a migration.
//!
//! ```text
//! MigrationRegistry
//! ├── job classes       (BatchedJobHandler: mutate one range)
//! └── strategies        (BatchingStrategy: compute the next range)
//! ```

pub mod plugin_registry;
pub mod traits;

pub use plugin_registry::{MigrationRegistry, RegistryStats};
pub use traits::{BatchRequest, BatchedJobHandler, BatchingStrategy, JobContext};
