#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Batched Migrations
//!
//! Background data-migration engine for very large relational tables.
//!
//! ## Overview
//!
//! A batched migration mutates a table column across a full primary-key range without
//! holding long locks. The range is cut into small, independently executable batch jobs
//! that are dispatched one at a time by a polling executor, throttled by a minimum interval
//! between batches, and tuned by an adaptive batch-size optimizer. A failure-ratio circuit
//! breaker stops migrations that keep failing, and a timestamp-bounded "on hold" flag
//! suspends dispatch without changing status. Everything needed to resume after a restart
//! lives in two tables: migrations and their batch jobs.
//!
//! ## Module Organization
//!
//! - [`models`] - `BatchedMigration`, `BatchedJob`, and `BatchRange`
//! - [`state_machine`] - Migration and job lifecycle with guarded transitions
//! - [`resilience`] - Failure-ratio circuit breaker
//! - [`optimizer`] - Smoothed time efficiency and adaptive batch sizing
//! - [`registry`] - Typed plugin registry for job classes and batching strategies
//! - [`strategies`] - Built-in batching strategies
//! - [`store`] - Persistence seam with PostgreSQL and in-memory implementations
//! - [`execution`] - Migration runner and the polling executor loop
//! - [`services`] - Retry management and the administrative surface
//! - [`config`] - Layered configuration loading
//! - [`logging`] - Structured logging setup
//! - [`test_helpers`] - Job classes and an in-memory engine fixture for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batched_migrations::clock::SystemClock;
//! use batched_migrations::config::EngineConfig;
//! use batched_migrations::execution::MigrationExecutor;
//! use batched_migrations::registry::MigrationRegistry;
//! use batched_migrations::store::in_memory::InMemoryMigrationStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryMigrationStore::new());
//! let registry = Arc::new(MigrationRegistry::new());
//! let executor = MigrationExecutor::new(
//!     store,
//!     registry,
//!     Arc::new(SystemClock),
//!     EngineConfig::default(),
//! );
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! executor.run(shutdown_rx).await?;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod execution;
pub mod logging;
pub mod models;
pub mod optimizer;
pub mod registry;
pub mod resilience;
pub mod services;
pub mod state_machine;
pub mod store;
pub mod strategies;
pub mod test_helpers;

pub use config::{ConfigManager, EngineConfig};
pub use error::{MigrationError, Result};
pub use models::{BatchRange, BatchedJob, BatchedMigration, NewBatchedMigration};
pub use state_machine::{JobStatus, MigrationEvent, MigrationStatus};
