//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::types::NodeId;

/// Bounded exponential backoff for outbound sends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,

    /// Upper bound for the doubling delay.
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based), doubling and capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Configuration for the cluster client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Node id of this API node, used as the sender of every signal.
    pub node_id: NodeId,

    /// Base wait for one blocking round.
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,

    /// Rounds a blocking execute waits before giving up.
    ///
    /// Total wait is `max_wait_rounds * response_timeout`.
    pub max_wait_rounds: u32,

    /// Wait for scan confirmations.
    ///
    /// Scans may legitimately take much longer than key operations.
    #[serde(with = "duration_ms")]
    pub scan_timeout: Duration,

    /// Slice used when a timeout of zero means "poll forever".
    #[serde(with = "duration_ms")]
    pub poll_slice: Duration,

    /// Send retry policy.
    pub retry: RetryPolicy,

    /// Carry oversized keys and attributes as long sections instead of
    /// KEYINFO/ATTRINFO continuation signals.
    pub use_long_sections: bool,

    /// Sections longer than this are sent as fragments.
    pub max_section_words: usize,

    /// Transaction records per session.
    pub transaction_pool_size: usize,

    /// Scan receivers per session.
    pub receiver_pool_size: usize,

    /// Parallelism used when a scan does not name one.
    pub default_scan_parallelism: u32,

    /// Batch size (rows per receiver) used when a scan does not name one.
    pub default_batch_rows: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId(0),
            response_timeout: Duration::from_secs(6),
            max_wait_rounds: 4,
            scan_timeout: Duration::from_secs(60),
            poll_slice: Duration::from_millis(10),
            retry: RetryPolicy::default(),
            use_long_sections: true,
            max_section_words: 2048,
            transaction_pool_size: 1024,
            receiver_pool_size: 256,
            default_scan_parallelism: 4,
            default_batch_rows: 64,
        }
    }
}

impl ClientConfig {
    /// Configuration for tests and a cluster on the same host.
    pub fn local_network() -> Self {
        Self {
            response_timeout: Duration::from_millis(500),
            max_wait_rounds: 4,
            scan_timeout: Duration::from_secs(5),
            poll_slice: Duration::from_millis(5),
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(20),
            },
            transaction_pool_size: 64,
            receiver_pool_size: 64,
            ..Self::default()
        }
    }

    /// Configuration for high-latency links.
    pub fn wan_network() -> Self {
        Self {
            response_timeout: Duration::from_secs(30),
            max_wait_rounds: 6,
            scan_timeout: Duration::from_secs(300),
            poll_slice: Duration::from_millis(50),
            retry: RetryPolicy {
                max_attempts: 5,
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(5),
            },
            ..Self::default()
        }
    }

    /// Parse a JSON document; absent fields take their defaults.
    pub fn from_json(text: &str) -> ClusterResult<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| ClusterError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Set the node id of this API node.
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Set the per-round response timeout.
    pub fn with_response_timeout(mut self, timeout: Duration, rounds: u32) -> Self {
        self.response_timeout = timeout;
        self.max_wait_rounds = rounds;
        self
    }

    /// Set the scan timeout.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Total time a blocking execute may wait.
    pub fn execute_deadline(&self) -> Duration {
        self.response_timeout.saturating_mul(self.max_wait_rounds)
    }

    /// Check the configuration for values that would make waits or pools
    /// unusable.
    pub fn validate(&self) -> ClusterResult<()> {
        let fail = |message: &str| {
            Err(ClusterError::Config {
                message: message.to_string(),
            })
        };
        if self.response_timeout.is_zero() || self.scan_timeout.is_zero() {
            return fail("timeouts must be non-zero");
        }
        if self.poll_slice.is_zero() {
            return fail("poll_slice must be non-zero");
        }
        if self.max_wait_rounds == 0 {
            return fail("max_wait_rounds must be at least 1");
        }
        if self.transaction_pool_size == 0 || self.receiver_pool_size == 0 {
            return fail("pool sizes must be non-zero");
        }
        if self.max_section_words == 0 {
            return fail("max_section_words must be non-zero");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry.max_attempts must be at least 1");
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return fail("retry.initial_backoff exceeds retry.max_backoff");
        }
        if self.default_scan_parallelism == 0 || self.default_batch_rows == 0 {
            return fail("scan defaults must be non-zero");
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
