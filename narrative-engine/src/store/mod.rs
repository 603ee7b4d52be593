//! Persistence layer: the store contract and an in-memory implementation.

pub mod memory;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use memory::MemoryStore;
pub use traits::{NarrativeStore, ScoreWrite, StoreError, StoreResult};
