//! Store implementations shipped with the backend.
//!
//! The contracts live in `argus_core::store`; this module holds the
//! in-memory implementation used for dev mode and tests. Additional
//! backends (etcd) plug in behind the same traits.

pub mod memory;

pub use memory::{MemoryEventStore, MemoryQueue, MemoryStore};
