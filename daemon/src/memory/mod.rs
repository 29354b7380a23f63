//! Memory module: presence flags and captured artifacts

mod store;

pub use store::{MemoryFlags, MemoryStore, StoreError, StoredFile};
