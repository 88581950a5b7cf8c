use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: i64 = 2;

/// A unit of work as it travels over the wire. Immutable once constructed:
/// either built by a producer before `submit`, or decoded from a fetch reply.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Job {
    pub jid: String,
    pub jobtype: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<BTreeMap<String, Value>>,
}

impl Job {
    pub fn new(jid: impl Into<String>, jobtype: impl Into<String>) -> Self {
        Self {
            jid: jid.into(),
            jobtype: jobtype.into(),
            args: Vec::new(),
            custom: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: Value) -> Self {
        self.custom
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }
}

/// The document carried by the broker's `+HI` greeting, received once per
/// connection. `s` and `i` are the optional password challenge.
#[derive(Clone, Debug, Deserialize)]
pub struct Handshake {
    #[serde(rename = "v")]
    pub version: i64,
    #[serde(rename = "s", default)]
    pub nonce: Option<String>,
    #[serde(rename = "i", default)]
    pub iterations: Option<u32>,
}

/// The document sent with `HELLO`, once per connection. Absent fields are
/// omitted from the serialized form.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub wid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(rename = "pwdhash", skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(rename = "v")]
    pub version: i64,
}

impl ConnectOptions {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            hostname: std::env::var("HOSTNAME").ok(),
            wid: worker_id.into(),
            pid: Some(std::process::id()),
            labels: None,
            password_hash: None,
            version: PROTOCOL_VERSION,
        }
    }
}
