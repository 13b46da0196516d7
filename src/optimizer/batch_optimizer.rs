use crate::config::OptimizerConfig;
use crate::constants::optimizer::EFFICIENCY_PRECISION;
use crate::error::Result;
use crate::models::BatchedMigration;
use crate::store::MigrationStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Exponentially weighted average of efficiencies, most recent first.
///
/// `None` with fewer than `number_of_jobs` samples or a zero divisor. Missing data is never
/// treated as zero.
pub fn smoothed_efficiency(efficiencies: &[f64], number_of_jobs: usize, alpha: f64) -> Option<f64> {
    if number_of_jobs == 0 || efficiencies.len() < number_of_jobs {
        return None;
    }

    let (dividend, divisor) = efficiencies
        .iter()
        .take(number_of_jobs)
        .enumerate()
        .fold((0.0, 0.0), |(dividend, divisor), (i, efficiency)| {
            let weight = (1.0 - alpha).powi(i as i32);
            (dividend + efficiency * weight, divisor + weight)
        });

    if divisor == 0.0 {
        return None;
    }

    Some(round_to(dividend / divisor, EFFICIENCY_PRECISION))
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Outcome of one optimizer pass that changed the sizing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSizeChange {
    pub efficiency: f64,
    pub multiplier: f64,
    pub previous_batch_size: i32,
    pub batch_size: i32,
    pub sub_batch_size: i32,
}

/// Adaptive batch sizing driven by smoothed time efficiency.
///
/// Time efficiency is assumed to be linear in the batch size, so the batch size is scaled by
/// `target_efficiency_max / efficiency`, capped at `max_multiplier` per step.
#[derive(Debug, Clone)]
pub struct BatchOptimizer {
    config: OptimizerConfig,
}

impl BatchOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Scale factor for `efficiency`; `None` when no change is warranted
    pub fn batch_size_multiplier(&self, efficiency: Option<f64>) -> Option<f64> {
        let efficiency = efficiency.filter(|efficiency| *efficiency != 0.0)?;

        if (self.config.target_efficiency_min..=self.config.target_efficiency_max)
            .contains(&efficiency)
        {
            return None;
        }

        Some((self.config.target_efficiency_max / efficiency).min(self.config.max_multiplier))
    }

    /// New `(batch_size, sub_batch_size)` after applying `multiplier`
    pub fn resize(&self, migration: &BatchedMigration, multiplier: f64) -> (i32, i32) {
        let lower = migration.min_batch_size.unwrap_or(self.config.min_batch_size);
        let upper = migration.max_batch_size.unwrap_or(self.config.max_batch_size);

        let scaled = (f64::from(migration.batch_size) * multiplier) as i64;
        let batch_size = scaled.max(i64::from(lower)).min(i64::from(upper)) as i32;
        let sub_batch_size = migration.sub_batch_size.min(batch_size);

        (batch_size, sub_batch_size)
    }

    /// Smoothed efficiency over the most recent succeeded jobs of `migration`
    pub async fn smoothed_time_efficiency(
        &self,
        migration: &BatchedMigration,
        store: &dyn MigrationStore,
        number_of_jobs: usize,
        alpha: f64,
    ) -> Result<Option<f64>> {
        let jobs = store
            .recent_successful_jobs(migration.id, number_of_jobs)
            .await?;
        if jobs.len() < number_of_jobs {
            return Ok(None);
        }

        let interval = migration.interval();
        let efficiencies: Vec<f64> = jobs
            .iter()
            .filter_map(|job| job.time_efficiency(interval))
            .collect();

        Ok(smoothed_efficiency(&efficiencies, number_of_jobs, alpha))
    }

    /// Adjust and persist the migration's batch sizing from recent efficiency.
    ///
    /// Only the sizing columns are written; status and hold stay whatever they are in storage.
    #[instrument(skip(self, migration, store), fields(migration_id = migration.id))]
    pub async fn optimize(
        &self,
        migration: &mut BatchedMigration,
        store: &dyn MigrationStore,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchSizeChange>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let efficiency = self
            .smoothed_time_efficiency(
                migration,
                store,
                self.config.number_of_jobs,
                self.config.alpha,
            )
            .await?;

        let Some(multiplier) = self.batch_size_multiplier(efficiency) else {
            debug!(?efficiency, "Batch size left unchanged");
            return Ok(None);
        };
        let efficiency = efficiency.unwrap_or_default();

        let previous_batch_size = migration.batch_size;
        let (batch_size, sub_batch_size) = self.resize(migration, multiplier);
        if batch_size == previous_batch_size && sub_batch_size == migration.sub_batch_size {
            return Ok(None);
        }

        store
            .update_batch_sizes(migration.id, batch_size, sub_batch_size, now)
            .await?;
        migration.batch_size = batch_size;
        migration.sub_batch_size = sub_batch_size;

        info!(
            migration_id = migration.id,
            efficiency = efficiency,
            multiplier = multiplier,
            previous_batch_size = previous_batch_size,
            batch_size = batch_size,
            sub_batch_size = sub_batch_size,
            "Batch size optimized"
        );

        Ok(Some(BatchSizeChange {
            efficiency,
            multiplier,
            previous_batch_size,
            batch_size,
            sub_batch_size,
        }))
    }
}

impl Default for BatchOptimizer {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::batched_migration::test_support::migration;

    #[test]
    fn test_smoothed_efficiency_reference_values() {
        let cases: [(&[f64], f64); 4] = [
            (&[1.1, 1.0, 0.95, 0.9, 0.8, 0.95, 0.9, 0.8, 0.9, 0.95], 0.96),
            (&[1.2, 1.1, 1.0, 1.0, 1.1, 1.0, 0.95, 0.9, 0.95, 0.9], 1.06),
            (&[0.9, 0.95, 1.0, 1.2, 1.1, 1.2, 1.1, 1.0, 1.1, 1.0], 1.03),
            (&[1.2, 0.9, 0.8, 0.9, 0.95, 0.9, 0.92, 0.9, 0.95, 0.9], 0.96),
        ];

        for (efficiencies, expected) in cases {
            assert_eq!(smoothed_efficiency(efficiencies, 10, 0.2), Some(expected));
        }
    }

    #[test]
    fn test_smoothed_efficiency_insufficient_samples() {
        let efficiencies = [1.0; 9];
        assert_eq!(smoothed_efficiency(&efficiencies, 10, 0.2), None);
        assert_eq!(smoothed_efficiency(&[], 10, 0.2), None);
    }

    #[test]
    fn test_multiplier() {
        let optimizer = BatchOptimizer::default();

        assert_eq!(optimizer.batch_size_multiplier(None), None);
        assert_eq!(optimizer.batch_size_multiplier(Some(0.0)), None);
        assert_eq!(optimizer.batch_size_multiplier(Some(0.9)), None);
        assert_eq!(optimizer.batch_size_multiplier(Some(0.95)), None);

        // Too fast: grow, capped
        assert_eq!(optimizer.batch_size_multiplier(Some(0.5)), Some(1.2));
        // Too slow: shrink proportionally
        let shrink = optimizer.batch_size_multiplier(Some(1.9)).unwrap();
        assert!((shrink - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_resize_clamps_to_bounds() {
        let optimizer = BatchOptimizer::default();
        let mut migration = migration(1);
        migration.batch_size = 10_000;
        migration.sub_batch_size = 500;

        assert_eq!(optimizer.resize(&migration, 1.2), (12_000, 500));
        assert_eq!(optimizer.resize(&migration, 0.01), (1_000, 500));

        migration.max_batch_size = Some(11_000);
        assert_eq!(optimizer.resize(&migration, 1.2), (11_000, 500));

        migration.batch_size = 1_000;
        migration.sub_batch_size = 1_000;
        migration.min_batch_size = Some(100);
        assert_eq!(optimizer.resize(&migration, 0.5), (500, 500));
    }
}
