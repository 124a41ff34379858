//! Raft configuration parameters

use std::time::Duration;

/// Configuration for Raft timing parameters and limits
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by leader (default: 150ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms)
    pub election_timeout_max: Duration,
    /// Number of applied log entries before triggering automatic snapshot (default: 1000)
    /// Set to 0 to disable automatic snapshots
    pub snapshot_threshold: u64,
    /// How long a proposal may wait for commit before the caller gets `Timeout` (default: 5s)
    pub proposal_timeout: Duration,
    /// Deadline for a single peer RPC (default: 500ms)
    pub rpc_timeout: Duration,
    /// First retry delay after a peer RPC fails (default: 50ms)
    pub backoff_base: Duration,
    /// Upper bound for the retry delay (default: 2s)
    pub backoff_max: Duration,
    /// Maximum entries carried by one AppendEntries (default: 256)
    pub max_append_entries: usize,
    /// Maximum proposals appended per replication round (default: 64)
    pub max_proposal_batch: usize,
    /// Abort a leadership transfer that has not completed by then (default: 2s)
    pub transfer_timeout: Duration,
    /// Largest peer message the HTTP server accepts, snapshots included (default: 64 MiB)
    pub max_message_bytes: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            snapshot_threshold: 1000,
            proposal_timeout: Duration::from_secs(5),
            rpc_timeout: Duration::from_millis(500),
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_secs(2),
            max_append_entries: 256,
            max_proposal_batch: 64,
            transfer_timeout: Duration::from_secs(2),
            max_message_bytes: 64 * 1024 * 1024,
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Create a new config with custom snapshot threshold
    /// Set to 0 to disable automatic snapshots
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_proposal_timeout(mut self, timeout: Duration) -> Self {
        self.proposal_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Retry delays double from `base` up to `max` while a peer keeps failing
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_max_append_entries(mut self, max: usize) -> Self {
        self.max_append_entries = max.max(1);
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms.max(min_ms));
        Duration::from_millis(timeout_ms)
    }

    /// Delay before retrying a peer after `failures` consecutive failures
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_election_timeout_within_range() {
        let config = RaftConfig::default()
            .with_election_timeout(Duration::from_millis(100), Duration::from_millis(200));
        for _ in 0..100 {
            let t = config.random_election_timeout();
            assert!(t >= Duration::from_millis(100) && t <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RaftConfig::default()
            .with_backoff(Duration::from_millis(10), Duration::from_millis(75));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(40));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(75));
        assert_eq!(config.backoff_delay(40), Duration::from_millis(75));
    }
}
