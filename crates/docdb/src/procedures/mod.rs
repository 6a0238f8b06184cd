//! Server-side atomic procedures.
//!
//! Each procedure has two halves: a [`StoredProcedure`](crate::client::StoredProcedure)
//! body that the store runs atomically within one partition, and a
//! client-side wrapper that builds its arguments and classifies its failures.

mod hard_delete;
mod upsert;

pub use hard_delete::{HardDeleteArgs, HardDeleteProcedure, HardDeleteResource};
pub use upsert::{UpsertArgs, UpsertProcedure, UpsertWithHistory};
