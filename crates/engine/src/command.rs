//! Command and event wire types
//!
//! Commands are the units proposed through the consensus substrate; events
//! are what gets broadcast to local subscriptions and persisted as durable
//! log rows. Both are JSON-compatible. Command kinds form a closed tagged
//! enum over the recognized names, so an unknown `cmd_name` is a decode
//! error surfaced as a non-fatal per-entry result, never a runtime type
//! assertion.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::types::SubscriptionId;

/// Current command wire version
pub const WIRE_VERSION: u64 = 1;

/// A command proposed through consensus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Wire version of the command encoding
    #[serde(rename = "cmd_version")]
    pub version: u64,
    /// The command payload, discriminated by `cmd_name`
    #[serde(flatten)]
    pub kind: CommandKind,
}

/// Recognized command kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd_name", content = "data", rename_all = "kebab-case")]
pub enum CommandKind {
    /// Activate a subscription on the replica that created it
    StartSubscription(StartSubscriptionData),
    /// Publish a message to all local subscriptions of every replica
    PublishMessage {
        /// Message payload
        payload: serde_json::Value,
    },
    /// Record the announced shard leader
    UpdateLeader {
        /// Replica id of the new leader
        replica_id: u64,
    },
    /// A peer came online
    NotifyOnline {
        /// Peer name
        peer: String,
    },
    /// A peer went offline
    NotifyOffline {
        /// Peer name
        peer: String,
    },
}

impl CommandKind {
    /// The wire name of this command kind
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::StartSubscription(_) => "start-subscription",
            CommandKind::PublishMessage { .. } => "publish-message",
            CommandKind::UpdateLeader { .. } => "update-leader",
            CommandKind::NotifyOnline { .. } => "notify-online",
            CommandKind::NotifyOffline { .. } => "notify-offline",
        }
    }
}

/// Payload of a `start-subscription` command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartSubscriptionData {
    /// The subscription to activate
    pub subscription_id: SubscriptionId,
    /// The replica that owns the subscription's channel
    pub replica_id: u64,
}

impl Command {
    /// Create a command with the current wire version
    pub fn new(kind: CommandKind) -> Self {
        Self {
            version: WIRE_VERSION,
            kind,
        }
    }

    /// Create a `start-subscription` command
    pub fn start_subscription(subscription_id: SubscriptionId, replica_id: u64) -> Self {
        Self::new(CommandKind::StartSubscription(StartSubscriptionData {
            subscription_id,
            replica_id,
        }))
    }

    /// Create a `publish-message` command
    pub fn publish(payload: serde_json::Value) -> Self {
        Self::new(CommandKind::PublishMessage { payload })
    }

    /// Create an `update-leader` command
    pub fn update_leader(replica_id: u64) -> Self {
        Self::new(CommandKind::UpdateLeader { replica_id })
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> EngineResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode from the JSON wire form
    pub fn decode(data: &[u8]) -> EngineResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// An event broadcast to local subscriptions and persisted as a log row
///
/// Event ids are drawn from a counter advanced inside the same commit
/// boundary as the rows themselves, so replay from the durable log
/// reproduces an identical event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event id, strictly increasing per topic
    #[serde(rename = "evt_id")]
    pub id: u64,
    /// Event name, mirrors the command name that produced it
    #[serde(rename = "evt_name")]
    pub name: String,
    /// Wire version
    #[serde(rename = "evt_version")]
    pub version: u64,
    /// Event payload
    pub data: serde_json::Value,
    /// Server timestamp in milliseconds since the Unix epoch
    #[serde(rename = "evt_ts_ms")]
    pub timestamp_ms: u64,
}

impl Event {
    /// Encode to the JSON wire form
    pub fn encode(&self) -> EngineResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode from the JSON wire form
    pub fn decode(data: &[u8]) -> EngineResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Per-entry result returned to whoever proposed the command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum CommandResult {
    /// The command was applied on this replica
    Applied {
        /// Id of the event produced, if any
        event_id: Option<u64>,
    },
    /// The command was valid but a no-op on this replica
    Ignored {
        /// Why the command was ignored
        reason: String,
    },
    /// The command could not be applied; never fatal to the state machine
    Error {
        /// Error message
        message: String,
    },
}

/// A committed log entry delivered by the consensus substrate
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Consensus log index; strictly increasing across delivered batches
    pub index: u64,
    /// Encoded command
    pub payload: Bytes,
}

impl Entry {
    /// Create an entry from an already-encoded command
    pub fn new(index: u64, payload: Bytes) -> Self {
        Self { index, payload }
    }

    /// Create an entry by encoding a command
    pub fn from_command(index: u64, command: &Command) -> EngineResult<Self> {
        Ok(Self {
            index,
            payload: command.encode()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_shape_uses_tagged_names() {
        let id = SubscriptionId::new();
        let cmd = Command::start_subscription(id, 3);
        let json: serde_json::Value = serde_json::from_slice(&cmd.encode().unwrap()).unwrap();

        assert_eq!(json["cmd_name"], "start-subscription");
        assert_eq!(json["cmd_version"], 1);
        assert_eq!(json["data"]["replica_id"], 3);
        assert_eq!(json["data"]["subscription_id"], id.to_string());
    }

    #[test]
    fn command_round_trips() {
        let cmd = Command::publish(serde_json::json!({"body": "hello"}));
        let decoded = Command::decode(&cmd.encode().unwrap()).unwrap();
        assert_eq!(cmd, decoded);
    }

    #[test]
    fn unknown_command_name_fails_to_decode() {
        let raw = br#"{"cmd_version":1,"cmd_name":"drop-table","data":{}}"#;
        assert!(Command::decode(raw).is_err());
    }

    #[test]
    fn event_wire_shape() {
        let event = Event {
            id: 7,
            name: "publish-message".to_string(),
            version: WIRE_VERSION,
            data: serde_json::json!({"body": "hi"}),
            timestamp_ms: 1234,
        };
        let json: serde_json::Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(json["evt_id"], 7);
        assert_eq!(json["evt_name"], "publish-message");
        assert_eq!(json["evt_version"], 1);
        assert_eq!(json["evt_ts_ms"], 1234);

        let decoded = Event::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(event, decoded);
    }
}
