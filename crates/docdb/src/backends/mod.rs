//! Document store bindings.
//!
//! Each binding implements [`DocumentClient`](crate::client::DocumentClient).
//! Bindings for external stores are gated behind a feature flag.
//!
//! | Binding | Feature | Description |
//! |---------|---------|-------------|
//! | Memory | (always) | Process-local store for tests and development |
//! | MongoDB | `mongodb` | MongoDB replica set or sharded cluster |

pub mod memory;

#[cfg(feature = "mongodb")]
pub mod mongodb;
