//! # argus-core
//!
//! Core library for argus - a monitoring and observability backend.
//!
//! This crate provides the domain model and abstract contracts shared by the
//! backend daemons: entities, checks, events, handlers, filters, mutators,
//! and silencing rules, plus the in-process message bus and the store/queue
//! contracts the processing pipeline is built against.
//!
//! ## Example
//!
//! ```rust
//! use argus_core::check::CheckConfig;
//! use argus_core::meta::ObjectMeta;
//!
//! let check = CheckConfig {
//!     metadata: ObjectMeta::namespaced("default", "disk"),
//!     command: "check-disk.rb -w 80 -c 90".to_string(),
//!     interval: 30,
//!     subscriptions: vec!["linux".to_string()],
//!     ..CheckConfig::default()
//! };
//! assert!(check.validate().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod check;
pub mod entity;
pub mod event;
pub mod filter;
pub mod handler;
pub mod meta;
pub mod mutator;
pub mod queue;
pub mod silenced;
pub mod store;

/// Re-export commonly used types at the crate root.
pub use bus::MessageBus;
pub use check::{CheckConfig, CheckRequest};
pub use entity::Entity;
pub use event::Event;
pub use store::{EventStore, Store, StoreError};
