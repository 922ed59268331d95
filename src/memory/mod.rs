//! Owned-address storage, per-address lease locks and the remote-read cache.

pub mod cache;
pub mod item;
pub mod lease;
pub mod manager;

pub use cache::Cache;
pub use item::MemoryItem;
pub use lease::LeaseLock;
pub use manager::{MemoryError, MemoryManager};
