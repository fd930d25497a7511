//! Versioned request cache for offline support.
//!
//! - Namespaces are immutable generations named after the configured version
//! - Install eagerly populates a namespace from a fixed manifest
//! - Activation deletes every namespace of a superseded generation
//! - Strategies decide per request class whether network or cache goes first

mod storage;
mod store;
mod strategy;

pub use storage::{NamespaceStorage, SqliteNamespaceStorage};
pub(crate) use storage::parse_datetime;
pub use store::CacheStore;
pub use strategy::CacheStrategyExecutor;
