//! Replicated topic/broker engine
//!
//! A pub/sub log driven through a consensus substrate: every replica applies
//! the same ordered sequence of commands to its local topic, while each
//! replica independently manages the ephemeral subscriber channels that
//! cannot be replicated. Event rows and replication metadata are persisted
//! atomically with each applied batch, and broadcasts are deferred until the
//! batch is durably committed.
//!
//! The consensus substrate itself (leader election, log matching, quorum) is
//! an external collaborator behind the [`consensus::Substrate`] trait; this
//! crate supplies a deterministic in-process implementation for tests and
//! embedded single-replica deployments.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Command and event wire types
pub mod command;

/// Engine configuration
pub mod config;

/// Consensus substrate seam
pub mod consensus;

/// Error types
pub mod error;

/// Application hook contract
pub mod hook;

/// Durable metadata and event-log binding
pub mod persistence;

/// Client-facing topic service
pub mod service;

/// Consensus state machine adapter
pub mod state_machine;

/// One consumer's channel-backed listener
pub mod subscription;

/// In-process registry and fan-out broadcast
pub mod topic;

/// Identifier and time types
pub mod types;

pub use {
    command::{Command, CommandKind, CommandResult, Entry, Event},
    config::EngineConfig,
    consensus::{LocalSubstrate, Substrate},
    error::{EngineResult, Error, ErrorKind},
    hook::{ApplicationHook, Deferred, DurableHook},
    persistence::{AppliedState, EventFilter},
    service::{SubscriptionHandle, TopicService},
    state_machine::{LookupRequest, LookupResponse, TopicMetadata, TopicStateMachine},
    subscription::{DeliveryMode, Subscription, SubscriptionError},
    topic::{Topic, TopicConfig},
    types::{ReplicaId, ShardId, SubscriptionId},
};
