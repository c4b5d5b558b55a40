//! walstore: the durable storage engine behind a tiller node.
//!
//! This crate supplies the concrete data model (values & commands), the
//! write-ahead log, the in-memory key-value state machine, and the index
//! observer machinery, all wired together as an implementation of the
//! [`tiller::RaftStorage`] trait.

mod index;
mod store;
mod wal;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

pub use crate::index::IndexObserver;
pub use crate::index::SearchHit;
pub use crate::index::SearchIndex;
pub use crate::store::KvStateMachine;
pub use crate::store::WalStore;
pub use crate::wal::Wal;
pub use crate::wal::WalError;
pub use crate::wal::WalIter;

/// A value stored under a key: a string, a 64-bit signed integer, or a map of
/// string to value. JSON is the canonical wire encoding, so the union is
/// untagged: numbers decode as integers, strings as strings, objects as maps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    String(String),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Borrow the inner string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the inner integer, if this is an integer value.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

/// A single key/value pair of a bulk write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KvPair {
    pub key: String,
    pub value: Value,
}

/// A state machine mutation carried by a log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Unconditionally set `key` to `value`.
    Set { key: String, value: Value },
    /// Remove `key`; a no-op if absent.
    Delete { key: String },
    /// Add `amount` to the integer at `key`, treating an absent key as 0.
    /// Fails at apply time if the existing value is not an integer.
    Incr { key: String, amount: i64 },
    /// Set every pair, atomically: either all of them take effect or none.
    BulkSet { items: Vec<KvPair> },
    /// No effect on the map. Used to establish commit ordering.
    Noop,
}

impl Command {
    /// The on-disk record tag for this command.
    pub fn tag(&self) -> u8 {
        match self {
            Command::Noop => 0,
            Command::Set { .. } => 1,
            Command::Delete { .. } => 2,
            Command::Incr { .. } => 3,
            Command::BulkSet { .. } => 4,
        }
    }
}

/// The application data carried through the Raft log.
///
/// `client_id` and `seq` implement idempotent retries: when both are present,
/// the state machine remembers the latest serial it has executed per client
/// and short-circuits a duplicate with the recorded response instead of
/// executing it twice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KvRequest {
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl KvRequest {
    /// A request with no client retry tracking.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            client_id: None,
            seq: None,
        }
    }

    /// A request tagged with a client serial for idempotent retries.
    pub fn with_serial(command: Command, client_id: impl Into<String>, seq: u64) -> Self {
        Self {
            command,
            client_id: Some(client_id.into()),
            seq: Some(seq),
        }
    }
}

impl tiller::AppData for KvRequest {}

/// A command-level apply failure.
///
/// These are ordinary response values as far as consensus is concerned: the
/// entry is still committed and applied; the failure belongs to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Error)]
pub enum ApplyError {
    #[error("type mismatch: key {key:?} does not hold an integer")]
    TypeMismatch { key: String },
}

/// The response produced by applying a [`KvRequest`] to the state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KvResponse {
    /// The mutation took effect.
    Ok,
    /// The mutation took effect and produced a value (e.g. the new counter
    /// value of an increment).
    Value(Value),
    /// The command failed at apply time; the state is unchanged.
    Err(ApplyError),
}

impl tiller::AppDataResponse for KvResponse {}

#[cfg(test)]
mod tests {
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_value_json_encoding_is_canonical() {
        let v = Value::Map(btreemap! {
            "name".to_string() => Value::String("sensor-7".to_string()),
            "reading".to_string() => Value::Integer(42),
        });
        let encoded = serde_json::to_string(&v).unwrap();
        assert_eq!(encoded, r#"{"name":"sensor-7","reading":42}"#);

        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn test_value_decodes_untagged() {
        let n: Value = serde_json::from_str("7").unwrap();
        assert_eq!(n, Value::Integer(7));
        let s: Value = serde_json::from_str(r#""seven""#).unwrap();
        assert_eq!(s, Value::String("seven".to_string()));
        let m: Value = serde_json::from_str(r#"{"k":1}"#).unwrap();
        assert_eq!(m, Value::Map(btreemap! {"k".to_string() => Value::Integer(1)}));
    }

    #[test]
    fn test_value_rejects_floats() {
        assert!(serde_json::from_str::<Value>("1.5").is_err());
    }

    #[test]
    fn test_command_round_trip() {
        let cmd = Command::BulkSet {
            items: vec![
                KvPair {
                    key: "a".to_string(),
                    value: Value::Integer(1),
                },
                KvPair {
                    key: "b".to_string(),
                    value: Value::String("two".to_string()),
                },
            ],
        };
        let encoded = serde_json::to_vec(&cmd).unwrap();
        let decoded: Command = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_command_tags_are_stable() {
        assert_eq!(Command::Noop.tag(), 0);
        assert_eq!(
            Command::Set {
                key: "k".into(),
                value: Value::Integer(0)
            }
            .tag(),
            1
        );
        assert_eq!(Command::Delete { key: "k".into() }.tag(), 2);
        assert_eq!(Command::Incr { key: "k".into(), amount: 1 }.tag(), 3);
        assert_eq!(Command::BulkSet { items: vec![] }.tag(), 4);
    }
}
