use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Inclusive `[min, max]` cursor bounds of one unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchRange {
    pub min: i64,
    pub max: i64,
}

impl BatchRange {
    pub fn new(min: i64, max: i64) -> Result<Self> {
        if min > max {
            return Err(MigrationError::ValidationError(format!(
                "Batch range minimum {min} is greater than maximum {max}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Number of cursor values covered, saturating at `i64::MAX` for the widest ranges
    pub fn len(&self) -> i64 {
        self.max.saturating_sub(self.min).saturating_add(1)
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }

    /// Where the following range has to start for contiguous coverage; `None` past `i64::MAX`
    pub fn next_min(&self) -> Option<i64> {
        self.max.checked_add(1)
    }

    /// Cap the upper bound; `None` when the range starts past `upper`
    pub fn clamp_max(&self, upper: i64) -> Option<BatchRange> {
        if self.min > upper {
            return None;
        }
        Some(BatchRange {
            min: self.min,
            max: self.max.min(upper),
        })
    }
}

impl fmt::Display for BatchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
