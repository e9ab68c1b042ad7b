//! Member and registration payload types

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Registration payload a worker writes under `namespace + name`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub address: String,
}

impl WorkerInfo {
    pub fn new<N: Into<String>, A: Into<String>>(name: N, address: A) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Serialize to the JSON value stored in the coordination store
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a stored value, keeping whatever fields can be recovered.
    ///
    /// A payload that is not valid `WorkerInfo` is logged and then mined for
    /// string `name` / `address` fields. A missing name falls back to the
    /// last segment of `key`. Returns `None` when nothing usable decoded.
    pub fn decode_lenient(key: &str, value: &str) -> Option<Self> {
        let (name, address) = match serde_json::from_str::<WorkerInfo>(value) {
            Ok(info) if info.name.is_empty() && info.address.is_empty() => {
                tracing::warn!("Worker info at '{}' carries no name or address", key);
                return None;
            }
            Ok(info) => (Some(info.name), Some(info.address)),
            Err(e) => {
                tracing::warn!("Failed to decode worker info at '{}': {}", key, e);

                let object = match serde_json::from_str::<Value>(value) {
                    Ok(Value::Object(object)) => object,
                    _ => return None,
                };
                let field = |name: &str| object.get(name).and_then(Value::as_str).map(String::from);
                let (name, address) = (field("name"), field("address"));

                if name.is_none() && address.is_none() {
                    return None;
                }
                (name, address)
            }
        };

        let name = name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| member_name(key).to_string());
        if name.is_empty() {
            return None;
        }

        Some(Self {
            name,
            address: address.unwrap_or_default(),
        })
    }
}

/// A worker as seen by the aggregator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub address: String,

    /// True while the worker's lease is believed live
    pub in_group: bool,
}

impl Member {
    pub fn from_info(info: &WorkerInfo) -> Self {
        Self {
            name: info.name.clone(),
            address: info.address.clone(),
            in_group: true,
        }
    }

    /// Apply a fresh registration payload
    pub fn refresh(&mut self, info: &WorkerInfo) {
        self.name = info.name.clone();
        self.address = info.address.clone();
        self.in_group = true;
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Member[name={}, address={}, in_group={}]",
            self.name, self.address, self.in_group
        )
    }
}

/// Member name encoded in a store key: its last path segment
pub fn member_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_name_from_key() {
        assert_eq!(member_name("/etcDiscovery/client1"), "client1");
        assert_eq!(member_name("/a/b/c"), "c");
        assert_eq!(member_name("client1"), "client1");
        assert_eq!(member_name("/etcDiscovery/"), "");
    }

    #[test]
    fn test_wire_format() {
        let info = WorkerInfo::new("client1", "10.18.110.1:8080");
        let encoded = info.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();

        assert_eq!(value["name"], "client1");
        assert_eq!(value["address"], "10.18.110.1:8080");
        assert_eq!(value.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_decode_valid_payload() {
        let info = WorkerInfo::decode_lenient(
            "/etcDiscovery/client1",
            r#"{"name":"client1","address":"10.0.0.1:9000"}"#,
        )
        .unwrap();
        assert_eq!(info, WorkerInfo::new("client1", "10.0.0.1:9000"));
    }

    #[test]
    fn test_decode_missing_name_uses_key() {
        let info =
            WorkerInfo::decode_lenient("/etcDiscovery/client2", r#"{"address":"10.0.0.2:9000"}"#)
                .unwrap();
        assert_eq!(info, WorkerInfo::new("client2", "10.0.0.2:9000"));
    }

    #[test]
    fn test_decode_partial_payload() {
        // `name` has the wrong type, `address` is still recoverable
        let info = WorkerInfo::decode_lenient(
            "/etcDiscovery/client3",
            r#"{"name":42,"address":"10.0.0.3:9000"}"#,
        )
        .unwrap();
        assert_eq!(info, WorkerInfo::new("client3", "10.0.0.3:9000"));
    }

    #[test]
    fn test_decode_garbage_is_skipped() {
        assert!(WorkerInfo::decode_lenient("/etcDiscovery/x", "not json").is_none());
        assert!(WorkerInfo::decode_lenient("/etcDiscovery/x", "").is_none());
        assert!(WorkerInfo::decode_lenient("/etcDiscovery/x", "[1,2]").is_none());
        assert!(WorkerInfo::decode_lenient("/etcDiscovery/x", r#"{"port":1}"#).is_none());
    }

    #[test]
    fn test_member_refresh() {
        let mut member = Member::from_info(&WorkerInfo::new("client1", "10.0.0.1:9000"));
        member.in_group = false;

        member.refresh(&WorkerInfo::new("client1", "10.0.0.9:9000"));
        assert_eq!(member.address, "10.0.0.9:9000");
        assert!(member.in_group);
        assert_eq!(
            member.to_string(),
            "Member[name=client1, address=10.0.0.9:9000, in_group=true]"
        );
    }
}
