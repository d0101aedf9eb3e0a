//! Graph resolution support.
//!
//! Only the batching/caching layer lives here: the HTTP surface and the
//! schema are out of scope, but resolvers (wherever they are hosted)
//! need [`dataloader::Loaders`] to avoid N+1 store reads.

pub mod dataloader;

pub use dataloader::Loaders;
