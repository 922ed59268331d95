//! Core types shared across the memory, network and server layers.

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A cell address in the global flat memory. Kept signed because the wire
/// carries plain JSON integers; range validation happens at classification.
pub type Address = i64;

/// Unix-epoch nanoseconds. Write and lock tags are seeded from this once at
/// process start so tags from different runs do not collide within a run.
pub fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

// =============================================================================
// WIRE STATUS CODES
// =============================================================================

/// Reply status carried as a bare integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    Error = 1,
    InvalidAddress = 2,
    InvalidOperation = 3,
}

impl Status {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Status::Success),
            1 => Some(Status::Error),
            2 => Some(Status::InvalidAddress),
            3 => Some(Status::InvalidOperation),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl Serialize for Status {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Status::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown status code {code}")))
    }
}

// =============================================================================
// MEMORY ITEM STATUS
// =============================================================================

/// Coherence status of one cell: `E` means no remote caches exist, `S` means
/// at least one copy-holder caches the cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    #[serde(rename = "E")]
    Exclusive,
    #[serde(rename = "S")]
    Shared,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Exclusive => write!(f, "E"),
            ItemStatus::Shared => write!(f, "S"),
        }
    }
}

// =============================================================================
// CELL VALUES
// =============================================================================

/// Value stored at one address. The wire carries either an integer or a
/// string and both must round-trip unchanged; unwritten cells hold `Null`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
    Text(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
        }
    }
}

// =============================================================================
// NETWORK ADDRESSES
// =============================================================================

/// A `(host, port)` endpoint as it appears on the wire: a two-element JSON
/// array. The port is signed because external clients identify themselves
/// with a `-1` placeholder port; only real endpoints are ever dialled or
/// recorded as copy-holders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "(String, i64)", into = "(String, i64)")]
pub struct NetAddress {
    pub host: String,
    pub port: i64,
}

impl NetAddress {
    pub fn new(host: impl Into<String>, port: i64) -> Self {
        Self { host: host.into(), port }
    }

    /// Placeholder identity used by external clients, which are never
    /// recorded as copy-holders.
    pub fn client() -> Self {
        Self { host: String::new(), port: -1 }
    }

    /// The `host:port` dial string, if the port is a valid TCP port.
    pub fn endpoint(&self) -> Option<String> {
        u16::try_from(self.port)
            .ok()
            .filter(|p| *p != 0)
            .map(|p| format!("{}:{}", self.host, p))
    }

    /// Parse `host:port`.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        Some(Self::new(host, i64::from(port)))
    }
}

impl From<(String, i64)> for NetAddress {
    fn from((host, port): (String, i64)) -> Self {
        Self { host, port }
    }
}

impl From<NetAddress> for (String, i64) {
    fn from(addr: NetAddress) -> Self {
        (addr.host, addr.port)
    }
}

impl From<std::net::SocketAddr> for NetAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), i64::from(addr.port()))
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
