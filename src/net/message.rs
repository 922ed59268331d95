//! Request and reply schema.
//!
//! A request is `{"type": <string>, "args": [<positional values…>]}`; a
//! reply is an object that always carries `status` and `message` plus
//! whatever fields the operation returns. Arguments are positional and
//! heterogeneous, so decoding is by hand rather than derived.

use super::NetError;
use crate::memory::MemoryItem;
use crate::types::{Address, ItemStatus, NetAddress, Status, Value};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

/// One decoded client or peer request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Disconnect,
    Read {
        holder: NetAddress,
        address: Address,
        cascade: bool,
        /// Lease override (milliseconds) for the cache-validation lock;
        /// absent means the configured default.
        lease_ms: Option<u64>,
    },
    Write {
        holder: NetAddress,
        address: Address,
        data: Value,
        cascade: bool,
    },
    AcquireLock {
        address: Address,
        lease_ms: u64,
        cascade: bool,
    },
    ReleaseLock {
        address: Address,
        ltag: u64,
        cascade: bool,
    },
    UpdateCache {
        chain: Vec<NetAddress>,
        address: Address,
        data: Value,
        status: ItemStatus,
        wtag: u64,
    },
    DumpCache,
    /// Recognised as a request, rejected by the dispatcher.
    Unknown(String),
}

fn arg<'a>(args: &'a [Json], index: usize, what: &str) -> Result<&'a Json, NetError> {
    args.get(index)
        .ok_or_else(|| NetError::Decode(format!("missing argument {index} ({what})")))
}

fn arg_str(args: &[Json], index: usize, what: &str) -> Result<String, NetError> {
    arg(args, index, what)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| NetError::Decode(format!("argument {index} ({what}) must be a string")))
}

fn arg_i64(args: &[Json], index: usize, what: &str) -> Result<i64, NetError> {
    arg(args, index, what)?
        .as_i64()
        .ok_or_else(|| NetError::Decode(format!("argument {index} ({what}) must be an integer")))
}

fn arg_u64(args: &[Json], index: usize, what: &str) -> Result<u64, NetError> {
    arg(args, index, what)?
        .as_u64()
        .ok_or_else(|| {
            NetError::Decode(format!("argument {index} ({what}) must be a non-negative integer"))
        })
}

fn arg_bool(args: &[Json], index: usize, what: &str) -> Result<bool, NetError> {
    arg(args, index, what)?
        .as_bool()
        .ok_or_else(|| NetError::Decode(format!("argument {index} ({what}) must be a boolean")))
}

fn arg_typed<T: serde::de::DeserializeOwned>(
    args: &[Json],
    index: usize,
    what: &str,
) -> Result<T, NetError> {
    serde_json::from_value(arg(args, index, what)?.clone())
        .map_err(|e| NetError::Decode(format!("argument {index} ({what}): {e}")))
}

impl Request {
    /// Decode a framed request body. Unrecognised types decode to
    /// [`Request::Unknown`] so the dispatcher can answer
    /// `INVALID_OPERATION`; malformed arguments are a decode error.
    pub fn from_wire(body: &Json) -> Result<Self, NetError> {
        let kind = body
            .get("type")
            .and_then(Json::as_str)
            .ok_or_else(|| NetError::Decode("request has no type field".into()))?;
        let empty = Vec::new();
        let args = body
            .get("args")
            .and_then(Json::as_array)
            .unwrap_or(&empty);

        match kind {
            "disconnect" => Ok(Request::Disconnect),
            "serve_read" => Ok(Request::Read {
                holder: NetAddress::new(
                    arg_str(args, 0, "copy holder host")?,
                    arg_i64(args, 1, "copy holder port")?,
                ),
                address: arg_i64(args, 2, "address")?,
                cascade: arg_bool(args, 3, "cascade")?,
                lease_ms: match args.get(4) {
                    Some(_) => Some(arg_u64(args, 4, "lease millis")?),
                    None => None,
                },
            }),
            "serve_write" => Ok(Request::Write {
                holder: NetAddress::new(
                    arg_str(args, 0, "copy holder host")?,
                    arg_i64(args, 1, "copy holder port")?,
                ),
                address: arg_i64(args, 2, "address")?,
                data: arg_typed(args, 3, "data")?,
                cascade: arg_bool(args, 4, "cascade")?,
            }),
            "serve_acquire_lock" => Ok(Request::AcquireLock {
                address: arg_i64(args, 0, "address")?,
                lease_ms: arg_u64(args, 1, "lease millis")?,
                cascade: arg_bool(args, 2, "cascade")?,
            }),
            "serve_release_lock" => Ok(Request::ReleaseLock {
                address: arg_i64(args, 0, "address")?,
                ltag: arg_u64(args, 1, "ltag")?,
                cascade: arg_bool(args, 2, "cascade")?,
            }),
            "serve_update_cache" => Ok(Request::UpdateCache {
                chain: arg_typed(args, 0, "holder chain")?,
                address: arg_i64(args, 1, "address")?,
                data: arg_typed(args, 2, "data")?,
                status: arg_typed(args, 3, "status")?,
                wtag: arg_u64(args, 4, "wtag")?,
            }),
            "serve_dump_cache" => Ok(Request::DumpCache),
            other => Ok(Request::Unknown(other.to_string())),
        }
    }

    pub fn to_wire(&self) -> Json {
        match self {
            Request::Disconnect => json!({"type": "disconnect", "args": []}),
            Request::Read {
                holder,
                address,
                cascade,
                lease_ms,
            } => {
                let mut args = vec![
                    json!(holder.host),
                    json!(holder.port),
                    json!(address),
                    json!(cascade),
                ];
                if let Some(ms) = lease_ms {
                    args.push(json!(ms));
                }
                json!({"type": "serve_read", "args": args})
            }
            Request::Write {
                holder,
                address,
                data,
                cascade,
            } => json!({
                "type": "serve_write",
                "args": [holder.host, holder.port, address, data, cascade],
            }),
            Request::AcquireLock {
                address,
                lease_ms,
                cascade,
            } => json!({
                "type": "serve_acquire_lock",
                "args": [address, lease_ms, cascade],
            }),
            Request::ReleaseLock {
                address,
                ltag,
                cascade,
            } => json!({
                "type": "serve_release_lock",
                "args": [address, ltag, cascade],
            }),
            Request::UpdateCache {
                chain,
                address,
                data,
                status,
                wtag,
            } => json!({
                "type": "serve_update_cache",
                "args": [chain, address, data, status, wtag],
            }),
            Request::DumpCache => json!({"type": "serve_dump_cache", "args": []}),
            Request::Unknown(kind) => json!({"type": kind, "args": []}),
        }
    }
}

/// One occupied cache slot in a `serve_dump_cache` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheLine {
    pub address: Address,
    #[serde(flatten)]
    pub item: MemoryItem,
}

/// Wire reply. Fields beyond `status` and `message` are present only when
/// the operation returns them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub istatus: Option<ItemStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wtag: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ltag: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret_val: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_address: Option<NetAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Vec<CacheLine>>,
}

impl Reply {
    fn bare(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
            istatus: None,
            wtag: None,
            ltag: None,
            ret_val: None,
            server_address: None,
            cache: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::bare(Status::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::bare(Status::Error, message)
    }

    pub fn invalid_address() -> Self {
        Self::bare(Status::InvalidAddress, "memory address out of range")
    }

    pub fn invalid_operation() -> Self {
        Self::bare(Status::InvalidOperation, "invalid message type")
    }

    pub fn read_ok(item: MemoryItem, ltag: u64) -> Self {
        let mut reply = Self::success("read successful");
        reply.data = Some(item.data);
        reply.istatus = Some(item.status);
        reply.wtag = Some(item.wtag);
        reply.ltag = Some(ltag);
        reply
    }

    pub fn acquire_ok(ltag: u64, wtag: u64) -> Self {
        let mut reply = Self::success("lock acquired");
        reply.ret_val = Some(true);
        reply.ltag = Some(ltag);
        reply.wtag = Some(wtag);
        reply
    }

    /// Release always reports `SUCCESS`; `ret_val=false` means the lock was
    /// already released, by the caller or by the lease timer.
    pub fn release_done(released: bool, ltag: u64, wtag: u64) -> Self {
        let mut reply = Self::success(if released {
            "lock released"
        } else {
            "lock was already released"
        });
        reply.ret_val = Some(released);
        reply.ltag = Some(ltag);
        reply.wtag = Some(wtag);
        reply
    }

    pub fn cache_dump(lines: Vec<CacheLine>) -> Self {
        let mut reply = Self::success("cache dumped");
        reply.cache = Some(lines);
        reply
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_round_trips_with_and_without_lease() {
        let without = Request::Read {
            holder: NetAddress::client(),
            address: 7,
            cascade: true,
            lease_ms: None,
        };
        let wire = without.to_wire();
        assert_eq!(wire["args"].as_array().unwrap().len(), 4);
        assert_eq!(Request::from_wire(&wire).unwrap(), without);

        let with = Request::Read {
            holder: NetAddress::new("127.0.0.1", 6001),
            address: 7,
            cascade: false,
            lease_ms: Some(2500),
        };
        let wire = with.to_wire();
        assert_eq!(wire["args"].as_array().unwrap().len(), 5);
        assert_eq!(Request::from_wire(&wire).unwrap(), with);
    }

    #[test]
    fn write_request_carries_int_or_string_data() {
        let int = Request::Write {
            holder: NetAddress::client(),
            address: 3,
            data: Value::Int(42),
            cascade: true,
        };
        assert_eq!(Request::from_wire(&int.to_wire()).unwrap(), int);

        let text = Request::Write {
            holder: NetAddress::client(),
            address: 3,
            data: Value::Text("hi".into()),
            cascade: true,
        };
        assert_eq!(Request::from_wire(&text.to_wire()).unwrap(), text);
    }

    #[test]
    fn update_cache_chain_round_trips() {
        let req = Request::UpdateCache {
            chain: vec![
                NetAddress::new("127.0.0.1", 6001),
                NetAddress::new("127.0.0.1", 6002),
            ],
            address: 12,
            data: Value::Int(9),
            status: ItemStatus::Shared,
            wtag: 77,
        };
        let wire = req.to_wire();
        assert_eq!(wire["args"][0][1], json!(["127.0.0.1", 6002]));
        assert_eq!(Request::from_wire(&wire).unwrap(), req);
    }

    #[test]
    fn unknown_types_decode_as_unknown() {
        let wire = json!({"type": "serve_nonsense", "args": [1, 2]});
        assert_eq!(
            Request::from_wire(&wire).unwrap(),
            Request::Unknown("serve_nonsense".into())
        );
    }

    #[test]
    fn malformed_arguments_are_decode_errors() {
        let wire = json!({"type": "serve_read", "args": ["", -1, "not-an-int", true]});
        assert!(Request::from_wire(&wire).is_err());
        let wire = json!({"type": "serve_acquire_lock", "args": [0]});
        assert!(Request::from_wire(&wire).is_err());
        let wire = json!({"args": []});
        assert!(Request::from_wire(&wire).is_err());
    }

    #[test]
    fn reply_omits_absent_fields() {
        let reply = Reply::success("write successful");
        let wire = serde_json::to_value(&reply).unwrap();
        assert_eq!(wire, json!({"status": 0, "message": "write successful"}));
    }

    #[test]
    fn read_reply_has_the_documented_shape() {
        let item = MemoryItem::new(Value::Int(42), ItemStatus::Exclusive, 10);
        let wire = serde_json::to_value(Reply::read_ok(item, 4)).unwrap();
        assert_eq!(wire["status"], 0);
        assert_eq!(wire["data"], 42);
        assert_eq!(wire["istatus"], "E");
        assert_eq!(wire["wtag"], 10);
        assert_eq!(wire["ltag"], 4);
    }

    #[test]
    fn dump_reply_flattens_cache_lines() {
        let line = CacheLine {
            address: 5,
            item: MemoryItem::new(Value::Text("x".into()), ItemStatus::Shared, 3),
        };
        let wire = serde_json::to_value(Reply::cache_dump(vec![line])).unwrap();
        assert_eq!(
            wire["cache"][0],
            json!({"address": 5, "data": "x", "istatus": "S", "wtag": 3})
        );
    }

    #[test]
    fn reply_round_trips_through_json() {
        let mut reply = Reply::error("no route");
        reply.server_address = Some(NetAddress::new("10.0.0.9", 6002));
        let text = serde_json::to_string(&reply).unwrap();
        let back: Reply = serde_json::from_str(&text).unwrap();
        assert_eq!(back.status, Status::Error);
        assert_eq!(back.server_address.unwrap().port, 6002);
        assert!(back.cache.is_none());
    }
}
