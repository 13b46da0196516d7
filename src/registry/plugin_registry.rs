//! # Plugin Registry
//!
//! Typed registry mapping class names to job handlers and batching strategies.
//!
//! ## Overview
//!
//! Migrations reference their job class and batching strategy by name. Names are validated
//! when a plugin is registered and again when a migration is queued, so a missing class is
//! caught before any batch runs rather than at dispatch time.
//!
//! ## Usage
//!
//! ```rust
//! use batched_migrations::registry::MigrationRegistry;
//! use batched_migrations::strategies::PrimaryKeyBatchingStrategy;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = MigrationRegistry::new();
//! registry.register_strategy(Arc::new(PrimaryKeyBatchingStrategy))?;
//!
//! assert!(registry.strategy("PrimaryKeyBatchingStrategy").is_ok());
//! # Ok(())
//! # }
//! ```

use super::traits::{BatchedJobHandler, BatchingStrategy};
use crate::error::{MigrationError, Result};
use crate::models::normalize_class_name;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Registry statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub job_classes: usize,
    pub strategies: usize,
}

/// Registry for job classes and batching strategies
#[derive(Default)]
pub struct MigrationRegistry {
    job_classes: DashMap<String, Arc<dyn BatchedJobHandler>>,
    strategies: DashMap<String, Arc<dyn BatchingStrategy>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job class under its own name
    pub fn register_job_class(&self, handler: Arc<dyn BatchedJobHandler>) -> Result<()> {
        let name = validate_name(handler.name())?;
        if self.job_classes.contains_key(&name) {
            return Err(MigrationError::RegistryError(format!(
                "Job class '{name}' is already registered"
            )));
        }

        self.job_classes.insert(name.clone(), handler);
        info!(job_class_name = %name, "Registered job class");
        Ok(())
    }

    /// Register a batching strategy under its own name
    pub fn register_strategy(&self, strategy: Arc<dyn BatchingStrategy>) -> Result<()> {
        let name = validate_name(strategy.name())?;
        if self.strategies.contains_key(&name) {
            return Err(MigrationError::RegistryError(format!(
                "Batching strategy '{name}' is already registered"
            )));
        }

        self.strategies.insert(name.clone(), strategy);
        info!(batch_class_name = %name, "Registered batching strategy");
        Ok(())
    }

    pub fn job_class(&self, name: &str) -> Result<Arc<dyn BatchedJobHandler>> {
        let name = normalize_class_name(name);
        self.job_classes
            .get(&name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                MigrationError::RegistryError(format!("Job class '{name}' is not registered"))
            })
    }

    pub fn strategy(&self, name: &str) -> Result<Arc<dyn BatchingStrategy>> {
        let name = normalize_class_name(name);
        self.strategies
            .get(&name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                MigrationError::RegistryError(format!(
                    "Batching strategy '{name}' is not registered"
                ))
            })
    }

    /// Both classes a migration names must be registered
    pub fn validate_classes(&self, job_class_name: &str, batch_class_name: &str) -> Result<()> {
        self.job_class(job_class_name)?;
        self.strategy(batch_class_name)?;
        Ok(())
    }

    pub fn job_class_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .job_classes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn strategy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .strategies
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            job_classes: self.job_classes.len(),
            strategies: self.strategies.len(),
        }
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = normalize_class_name(name);
    if name.is_empty() {
        return Err(MigrationError::RegistryError(
            "Plugin name must not be empty".to_string(),
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(MigrationError::RegistryError(format!(
            "Plugin name '{name}' must not contain whitespace"
        )));
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobFailure;
    use crate::registry::traits::JobContext;
    use crate::strategies::PrimaryKeyBatchingStrategy;
    use async_trait::async_trait;

    struct NamedJob(&'static str);

    #[async_trait]
    impl BatchedJobHandler for NamedJob {
        fn name(&self) -> &str {
            self.0
        }

        async fn perform(&self, _context: &JobContext) -> std::result::Result<(), JobFailure> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup_normalizes_names() {
        let registry = MigrationRegistry::new();
        registry
            .register_job_class(Arc::new(NamedJob("::Jobs::CopyColumn")))
            .unwrap();

        assert!(registry.job_class("Jobs::CopyColumn").is_ok());
        assert!(registry.job_class("::Jobs::CopyColumn").is_ok());
        assert_eq!(registry.job_class_names(), vec!["Jobs::CopyColumn"]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let registry = MigrationRegistry::new();
        registry
            .register_strategy(Arc::new(PrimaryKeyBatchingStrategy))
            .unwrap();
        let result = registry.register_strategy(Arc::new(PrimaryKeyBatchingStrategy));
        assert!(matches!(result, Err(MigrationError::RegistryError(_))));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let registry = MigrationRegistry::new();
        assert!(registry.register_job_class(Arc::new(NamedJob(""))).is_err());
        assert!(registry
            .register_job_class(Arc::new(NamedJob("Copy Column")))
            .is_err());
    }

    #[test]
    fn test_validate_classes() {
        let registry = MigrationRegistry::new();
        registry
            .register_job_class(Arc::new(NamedJob("CopyColumn")))
            .unwrap();
        assert!(registry
            .validate_classes("CopyColumn", "PrimaryKeyBatchingStrategy")
            .is_err());

        registry
            .register_strategy(Arc::new(PrimaryKeyBatchingStrategy))
            .unwrap();
        assert!(registry
            .validate_classes("CopyColumn", "PrimaryKeyBatchingStrategy")
            .is_ok());
        assert_eq!(
            registry.stats(),
            RegistryStats {
                job_classes: 1,
                strategies: 1
            }
        );
    }
}
