//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::topic::TopicConfig;

/// Configuration for one replica's topic engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consensus shard the topic belongs to
    pub shard_id: u64,
    /// This replica's id within the shard
    pub replica_id: u64,
    /// How long a proposal may wait for commit and local apply
    pub propose_timeout: Duration,
    /// Local topic registry settings
    pub topic: TopicConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_id: 1,
            replica_id: 1,
            propose_timeout: Duration::from_secs(5),
            topic: TopicConfig::default(),
        }
    }
}
