//! Query execution and cursor management.

mod continuation;
mod executor;

pub use continuation::{ContinuationTokenCache, InMemoryContinuationTokenCache};
pub use executor::QueryExecutor;
