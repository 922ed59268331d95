//! The cell stored at one address.

use crate::types::{ItemStatus, Value};
use serde::{Deserialize, Serialize};

/// One memory cell: opaque value, coherence status and monotonic write tag.
/// The same shape is cached verbatim on non-home servers; the cache never
/// synthesises tags of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub data: Value,
    #[serde(rename = "istatus")]
    pub status: ItemStatus,
    pub wtag: u64,
}

impl MemoryItem {
    pub fn new(data: Value, status: ItemStatus, wtag: u64) -> Self {
        Self { data, status, wtag }
    }

    /// Fresh unwritten cell, exclusive, tag seeded from the process clock.
    pub fn empty(wtag: u64) -> Self {
        Self {
            data: Value::Null,
            status: ItemStatus::Exclusive,
            wtag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_uses_istatus_key() {
        let item = MemoryItem::new(Value::Int(7), ItemStatus::Shared, 99);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["data"], 7);
        assert_eq!(json["istatus"], "S");
        assert_eq!(json["wtag"], 99);
    }
}
