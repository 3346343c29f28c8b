//! Database module for SQLite persistence.

mod pool;
mod records;
mod values;

pub use pool::*;
pub use records::*;
pub use values::*;
