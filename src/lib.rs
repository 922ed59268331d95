//! Distributed shared memory over TCP.
//!
//! A fixed cluster of peer servers presents a flat integer-addressed memory
//! to external clients. Every address has one home server; remote reads are
//! cached and kept coherent by a chained write-update protocol with failure
//! pruning; per-address lease locks provide mutual exclusion and stale-data
//! detection.

pub mod config;
pub mod memory;
pub mod net;
pub mod server;
pub mod types;

pub use config::{ClusterConfig, ConfigError};
pub use memory::{Cache, LeaseLock, MemoryItem, MemoryManager};
pub use net::{NetError, Reply, Request};
pub use server::Server;
pub use types::{Address, ItemStatus, NetAddress, Status, Value};
