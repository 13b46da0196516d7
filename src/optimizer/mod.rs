//! Adaptive batch sizing.
//!
//! After each successful batch the optimizer looks at the smoothed time efficiency of the
//! most recent succeeded jobs (run time as a fraction of the migration interval) and grows or
//! shrinks `batch_size` toward the target efficiency band.

pub mod batch_optimizer;

pub use batch_optimizer::{smoothed_efficiency, BatchOptimizer, BatchSizeChange};
