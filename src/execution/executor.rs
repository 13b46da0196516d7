//! # Migration Executor
//!
//! Polling control loop. Each tick claims the oldest executable migration of the configured
//! schema under a lease, runs one step of it through the [`BatchedMigrationRunner`], and
//! releases the lease. Several executors may poll the same store; the lease keeps them off
//! each other's migrations.

use super::runner::{BatchedMigrationRunner, RunOutcome};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::registry::MigrationRegistry;
use crate::store::MigrationStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one tick did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub migration_id: i64,
    pub outcome: RunOutcome,
}

/// Counters since the executor was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    pub ticks: u64,
    pub idle_ticks: u64,
    pub jobs_run: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
struct ExecutorCounters {
    ticks: AtomicU64,
    idle_ticks: AtomicU64,
    jobs_run: AtomicU64,
    errors: AtomicU64,
}

pub struct MigrationExecutor {
    executor_id: String,
    store: Arc<dyn MigrationStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    runner: BatchedMigrationRunner,
    counters: ExecutorCounters,
}

impl MigrationExecutor {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        registry: Arc<MigrationRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let runner =
            BatchedMigrationRunner::new(store.clone(), registry, clock.clone(), config.clone());
        Self {
            executor_id: format!("executor-{}", Uuid::new_v4()),
            store,
            clock,
            config,
            runner,
            counters: ExecutorCounters::default(),
        }
    }

    /// Identity used as the lease holder
    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    pub fn runner(&self) -> &BatchedMigrationRunner {
        &self.runner
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            idle_ticks: self.counters.idle_ticks.load(Ordering::Relaxed),
            jobs_run: self.counters.jobs_run.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }

    /// Claim, step and release one migration. `None` when nothing is executable.
    pub async fn run_once(&self) -> Result<Option<ExecutionReport>> {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        let claimed = self
            .store
            .claim_active_migration(
                &self.config.executor.schema,
                &self.executor_id,
                self.config.executor.lease(),
                self.clock.now(),
            )
            .await?;
        let Some(mut migration) = claimed else {
            self.counters.idle_ticks.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        debug!(executor_id = %self.executor_id, migration_id = migration.id, "Claimed migration");
        let result = self.runner.run_migration_job(&mut migration).await;
        let released = self
            .store
            .release_migration(migration.id, &self.executor_id)
            .await;

        let outcome = result?;
        released?;

        if matches!(
            outcome,
            RunOutcome::JobSucceeded { .. } | RunOutcome::JobFailed { .. }
        ) {
            self.counters.jobs_run.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Some(ExecutionReport {
            migration_id: migration.id,
            outcome,
        }))
    }

    /// Tick every `poll_interval` until `shutdown` turns true or its sender is dropped.
    ///
    /// Tick errors are logged and counted; the loop keeps polling.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            executor_id = %self.executor_id,
            schema = %self.config.executor.schema,
            poll_interval_ms = self.config.executor.poll_interval_ms,
            "Starting migration executor"
        );

        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(Some(report)) => {
                    debug!(
                        executor_id = %self.executor_id,
                        migration_id = report.migration_id,
                        outcome = ?report.outcome,
                        "Executor tick"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    error!(executor_id = %self.executor_id, error = %e, "Executor tick failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.executor.poll_interval()) => {},
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!(executor_id = %self.executor_id, "Shutdown sender dropped");
                        break;
                    }
                }
            }
        }

        info!(executor_id = %self.executor_id, stats = ?self.stats(), "Migration executor stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewBatchedMigration;
    use crate::state_machine::MigrationStatus;
    use crate::strategies::PrimaryKeyBatchingStrategy;
    use crate::test_helpers::{NoopJob, TestEngine};
    use std::time::Duration;

    fn executor(engine: &TestEngine) -> MigrationExecutor {
        MigrationExecutor::new(
            engine.store.clone(),
            engine.registry.clone(),
            engine.clock.clone(),
            engine.config.clone(),
        )
    }

    async fn queue_active(engine: &TestEngine, table: &str) -> i64 {
        engine
            .store
            .create_migration(
                NewBatchedMigration::new(
                    NoopJob::NAME,
                    PrimaryKeyBatchingStrategy::NAME,
                    table,
                    "id",
                    1,
                    100,
                )
                .with_batch_sizes(10, 10)
                .with_pause_ms(0)
                .with_status(MigrationStatus::Active),
                engine.clock.now(),
            )
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_run_once_idle() {
        let engine = TestEngine::new();
        let executor = executor(&engine);

        assert!(executor.run_once().await.unwrap().is_none());
        assert_eq!(
            executor.stats(),
            ExecutorStats {
                ticks: 1,
                idle_ticks: 1,
                ..ExecutorStats::default()
            }
        );
    }

    #[tokio::test]
    async fn test_run_once_runs_one_job_and_releases() {
        let engine = TestEngine::new();
        let executor = executor(&engine);
        let migration_id = queue_active(&engine, "events").await;

        let report = executor.run_once().await.unwrap().unwrap();

        assert_eq!(report.migration_id, migration_id);
        assert!(matches!(report.outcome, RunOutcome::JobSucceeded { .. }));
        assert_eq!(engine.store.lease_holder(migration_id), None);
        assert_eq!(executor.stats().jobs_run, 1);
    }

    #[tokio::test]
    async fn test_leased_migration_is_skipped() {
        let engine = TestEngine::new();
        let executor = executor(&engine);
        let first = queue_active(&engine, "events").await;
        let second = queue_active(&engine, "users").await;

        engine
            .store
            .claim_active_migration(
                "main",
                "other-executor",
                chrono::Duration::minutes(5),
                engine.clock.now(),
            )
            .await
            .unwrap();
        assert_eq!(engine.store.lease_holder(first).as_deref(), Some("other-executor"));

        let report = executor.run_once().await.unwrap().unwrap();
        assert_eq!(report.migration_id, second);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut engine = TestEngine::new();
        engine.config.executor.poll_interval_ms = 10;
        let executor = Arc::new(executor(&engine));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let executor = executor.clone();
            async move { executor.run(shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("executor did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert!(executor.stats().ticks >= 1);
    }

    #[tokio::test]
    async fn test_run_stops_when_sender_dropped() {
        let engine = TestEngine::new();
        let executor = executor(&engine);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);

        let result = tokio::time::timeout(Duration::from_secs(5), executor.run(shutdown_rx)).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
