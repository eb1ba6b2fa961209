//! In-process data structures

pub mod ttl_cache;

pub use ttl_cache::{BoundedTtlCache, EvictionPolicy};
