// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

/// What a data-integrity failure does to the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the run on the first failure
    FailFast,
    /// Skip only the offending feature
    #[default]
    BestEffort,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" | "abort" => Ok(FailurePolicy::FailFast),
            "best-effort" | "besteffort" | "skip" => Ok(FailurePolicy::BestEffort),
            other => Err(Error::Config(format!("unknown failure policy '{}'", other))),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Workers kept alive while idle.
    pub min_workers: usize,
    /// Upper bound on concurrent workers.
    pub max_workers: usize,
    /// Capacity of the bounded submission queue.
    pub queue_capacity: usize,
    /// Idle time after which a surplus worker exits, in milliseconds.
    pub worker_keep_alive_ms: u64,
    pub failure_policy: FailurePolicy,
    /// Ids reserved per sequence round-trip on import.
    pub id_block_size: usize,
    /// Prepared features buffered by the import writer before a flush.
    pub write_batch_size: usize,
    /// Longest reference chain followed before giving up.
    pub max_reference_chain: usize,
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let max_workers: usize = std::env::var("CITYDB_MAX_WORKERS")
            .unwrap_or_else(|_| num_cpus::get().to_string())
            .parse()
            .unwrap_or_else(|_| num_cpus::get());
        let max_workers = max_workers.max(1);
        Self {
            min_workers: std::env::var("CITYDB_MIN_WORKERS")
                .unwrap_or_else(|_| "1".into())
                .parse::<usize>()
                .unwrap_or(1)
                .clamp(1, max_workers),
            max_workers,
            queue_capacity: std::env::var("CITYDB_QUEUE_CAPACITY")
                .unwrap_or_else(|_| "256".into())
                .parse::<usize>()
                .unwrap_or(256)
                .max(1),
            worker_keep_alive_ms: std::env::var("CITYDB_WORKER_KEEP_ALIVE_MS")
                .unwrap_or_else(|_| "5000".into())
                .parse()
                .unwrap_or(5000),
            failure_policy: std::env::var("CITYDB_FAILURE_POLICY")
                .unwrap_or_else(|_| "best-effort".into())
                .parse()
                .unwrap_or_default(),
            id_block_size: std::env::var("CITYDB_ID_BLOCK_SIZE")
                .unwrap_or_else(|_| "100".into())
                .parse::<usize>()
                .unwrap_or(100)
                .max(1),
            write_batch_size: std::env::var("CITYDB_WRITE_BATCH_SIZE")
                .unwrap_or_else(|_| "200".into())
                .parse::<usize>()
                .unwrap_or(200)
                .max(1),
            max_reference_chain: std::env::var("CITYDB_MAX_REFERENCE_CHAIN")
                .unwrap_or_else(|_| "64".into())
                .parse::<usize>()
                .unwrap_or(64)
                .max(1),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.worker_keep_alive_ms)
    }

    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.max_workers = max.max(1);
        self.min_workers = min.clamp(1, self.max_workers);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_keep_alive_ms(mut self, ms: u64) -> Self {
        self.worker_keep_alive_ms = ms;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_id_block_size(mut self, size: usize) -> Self {
        self.id_block_size = size.max(1);
        self
    }

    pub fn with_write_batch_size(mut self, size: usize) -> Self {
        self.write_batch_size = size.max(1);
        self
    }

    pub fn with_max_reference_chain(mut self, limit: usize) -> Self {
        self.max_reference_chain = limit.max(1);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parsing() {
        assert_eq!("fail-fast".parse::<FailurePolicy>().unwrap(), FailurePolicy::FailFast);
        assert_eq!(" Best-Effort ".parse::<FailurePolicy>().unwrap(), FailurePolicy::BestEffort);
        assert!("sometimes".parse::<FailurePolicy>().is_err());
    }

    #[test]
    fn setters_clamp() {
        let config = EngineConfig::default().with_workers(8, 2).with_queue_capacity(0);
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.min_workers, 2);
        assert_eq!(config.queue_capacity, 1);
    }
}
