//! Built-in batching strategies.

pub mod primary_key;

pub use primary_key::{PgPrimaryKeyBatchingStrategy, PrimaryKeyBatchingStrategy};
