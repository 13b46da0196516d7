// Test Helpers Module - shared fixtures for unit and integration tests
//
// Job classes with predictable behavior plus an engine fixture wired to the in-memory
// store and a manual clock, so tests can drive the executor deterministically.

use crate::clock::ManualClock;
use crate::config::EngineConfig;
use crate::error::JobFailure;
use crate::models::BatchRange;
use crate::registry::{BatchedJobHandler, JobContext, MigrationRegistry};
use crate::store::in_memory::InMemoryMigrationStore;
use crate::strategies::PrimaryKeyBatchingStrategy;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Succeeds without touching anything
#[derive(Debug, Default)]
pub struct NoopJob;

impl NoopJob {
    pub const NAME: &'static str = "NoopJob";
}

#[async_trait]
impl BatchedJobHandler for NoopJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn perform(&self, _context: &JobContext) -> Result<(), JobFailure> {
        Ok(())
    }
}

/// Succeeds and remembers every context it was given
#[derive(Debug, Default)]
pub struct RecordingJob {
    contexts: Mutex<Vec<JobContext>>,
}

impl RecordingJob {
    pub const NAME: &'static str = "RecordingJob";

    pub fn contexts(&self) -> Vec<JobContext> {
        self.contexts.lock().clone()
    }

    pub fn ranges(&self) -> Vec<BatchRange> {
        self.contexts.lock().iter().map(|c| c.range).collect()
    }
}

#[async_trait]
impl BatchedJobHandler for RecordingJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn perform(&self, context: &JobContext) -> Result<(), JobFailure> {
        self.contexts.lock().push(context.clone());
        Ok(())
    }
}

/// Fails on every range, or only on ranges containing one of `poisoned` values
#[derive(Debug)]
pub struct FailingJob {
    poisoned: Option<Vec<i64>>,
    retryable: bool,
    calls: AtomicUsize,
}

impl FailingJob {
    pub const NAME: &'static str = "FailingJob";

    pub fn always() -> Self {
        Self {
            poisoned: None,
            retryable: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on_values(poisoned: Vec<i64>) -> Self {
        Self {
            poisoned: Some(poisoned),
            retryable: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Report failures as non-retryable
    pub fn permanent(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fails_on(&self, range: BatchRange) -> bool {
        match &self.poisoned {
            None => true,
            Some(values) => values.iter().any(|value| range.contains(*value)),
        }
    }
}

#[async_trait]
impl BatchedJobHandler for FailingJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn perform(&self, context: &JobContext) -> Result<(), JobFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.fails_on(context.range) {
            return Ok(());
        }

        let reason = format!("poisoned row in {}", context.range);
        Err(if self.retryable {
            JobFailure::retryable(reason)
        } else {
            JobFailure::permanent(reason)
        })
    }
}

/// In-memory engine wiring shared by tests
pub struct TestEngine {
    pub store: Arc<InMemoryMigrationStore>,
    pub registry: Arc<MigrationRegistry>,
    pub clock: Arc<ManualClock>,
    pub config: EngineConfig,
}

impl TestEngine {
    /// Registry holds [`PrimaryKeyBatchingStrategy`] and [`NoopJob`]
    pub fn new() -> Self {
        let registry = Arc::new(MigrationRegistry::new());
        let _ = registry.register_strategy(Arc::new(PrimaryKeyBatchingStrategy));
        let _ = registry.register_job_class(Arc::new(NoopJob));

        Self {
            store: Arc::new(InMemoryMigrationStore::new()),
            registry,
            clock: Arc::new(ManualClock::frozen()),
            config: EngineConfig::default(),
        }
    }

    pub fn with_job_class(self, handler: Arc<dyn BatchedJobHandler>) -> Self {
        let _ = self.registry.register_job_class(handler);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
