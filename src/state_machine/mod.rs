//! # State Machines
//!
//! Lifecycle management for batched migrations and their batch jobs.
//!
//! Transitions are computed from an explicit `(state, event)` table, guard predicates are
//! evaluated before anything is written, and the new state is persisted through the
//! [`MigrationStore`](crate::store::MigrationStore). Violations come back as typed
//! [`StateMachineError`]s instead of being coerced.

pub mod errors;
pub mod events;
pub mod guards;
pub mod job_state_machine;
pub mod migration_state_machine;
pub mod states;

pub use errors::{GuardError, StateMachineError, StateMachineResult};
pub use events::{JobEvent, MigrationEvent};
pub use guards::{AllJobsSucceededGuard, AttemptsRemainingGuard, StateGuard};
pub use job_state_machine::JobStateMachine;
pub use migration_state_machine::MigrationStateMachine;
pub use states::{JobStatus, MigrationStatus};
