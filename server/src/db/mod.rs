//! Database module for PostgreSQL persistence.

mod pool;
mod snapshots;

pub use pool::*;
pub use snapshots::*;
