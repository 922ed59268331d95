//! Static cluster configuration: the ordered server list and the equal-width
//! partitioning of the global address space. Immutable after construction.

use crate::types::{Address, NetAddress};
use std::time::Duration;
use thiserror::Error;

/// Default reference deployment: three servers on loopback.
pub const DEFAULT_SERVERS: [&str; 3] = ["127.0.0.1:6000", "127.0.0.1:6001", "127.0.0.1:6002"];

/// Total addressable cells across the cluster.
pub const DEFAULT_MEMORY_SIZE: i64 = 300;

/// Slots in each server's direct-mapped cache of remote addresses.
pub const DEFAULT_CACHE_SIZE: usize = 32;

/// Outbound peer connect timeout.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Lease applied when a remote read lock-validates against the home server.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cluster needs at least two servers, got {0}")]
    TooFewServers(usize),
    #[error("memory size must be positive, got {0}")]
    BadMemorySize(i64),
    #[error("cache size must be positive")]
    BadCacheSize,
    #[error("server index {index} out of range for {count} servers")]
    BadServerIndex { index: usize, count: usize },
    #[error("unparseable server endpoint {0:?}")]
    BadEndpoint(String),
}

/// Shared, read-only view of the cluster every server is started with.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    servers: Vec<NetAddress>,
    ranges: Vec<(Address, Address)>,
    memory_size: i64,
    cache_size: usize,
    connection_timeout: Duration,
    lease_timeout: Duration,
}

impl ClusterConfig {
    pub fn new(
        servers: Vec<NetAddress>,
        memory_size: i64,
        cache_size: usize,
        connection_timeout: Duration,
        lease_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if servers.len() < 2 {
            return Err(ConfigError::TooFewServers(servers.len()));
        }
        if memory_size <= 0 {
            return Err(ConfigError::BadMemorySize(memory_size));
        }
        if cache_size == 0 {
            return Err(ConfigError::BadCacheSize);
        }

        // Equal-width contiguous ranges by floor division; a remainder tail
        // is owned by nobody and classifies as an invalid address.
        let width = memory_size / servers.len() as i64;
        let ranges = (0..servers.len() as i64)
            .map(|i| (i * width, (i + 1) * width))
            .collect();

        Ok(Self {
            servers,
            ranges,
            memory_size,
            cache_size,
            connection_timeout,
            lease_timeout,
        })
    }

    /// Parse a comma-separated `host:port,host:port,...` server list.
    pub fn parse_servers(list: &str) -> Result<Vec<NetAddress>, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| NetAddress::parse(s).ok_or_else(|| ConfigError::BadEndpoint(s.to_string())))
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub fn servers(&self) -> &[NetAddress] {
        &self.servers
    }

    pub fn server(&self, index: usize) -> Result<&NetAddress, ConfigError> {
        self.servers.get(index).ok_or(ConfigError::BadServerIndex {
            index,
            count: self.servers.len(),
        })
    }

    /// The owned range `[lo, hi)` of server `index`.
    pub fn range(&self, index: usize) -> Result<(Address, Address), ConfigError> {
        self.ranges.get(index).copied().ok_or(ConfigError::BadServerIndex {
            index,
            count: self.servers.len(),
        })
    }

    pub fn memory_size(&self) -> i64 {
        self.memory_size
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// Index of the home server for `address`, scanning the configured
    /// ranges in order. `None` when no range contains the address.
    pub fn home_index(&self, address: Address) -> Option<usize> {
        self.ranges
            .iter()
            .position(|&(lo, hi)| address >= lo && address < hi)
    }

    /// Endpoint of the home server for `address`.
    pub fn home_server(&self, address: Address) -> Option<&NetAddress> {
        self.home_index(address).map(|i| &self.servers[i])
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let servers = DEFAULT_SERVERS
            .iter()
            .map(|s| NetAddress::parse(s).unwrap())
            .collect();
        Self::new(
            servers,
            DEFAULT_MEMORY_SIZE,
            DEFAULT_CACHE_SIZE,
            DEFAULT_CONNECTION_TIMEOUT,
            DEFAULT_LEASE_TIMEOUT,
        )
        .unwrap()
    }
}
