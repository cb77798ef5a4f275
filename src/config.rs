use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{MeshError, Result};

/// Message bus tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Bounded inbox size per endpoint
    pub inbox_capacity: usize,
    /// How long a send may wait for inbox capacity before the recipient is
    /// reported unreachable
    pub send_timeout_ms: u64,
    /// Buffered departure notifications per watcher
    pub departure_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 256,
            send_timeout_ms: 1000,
            departure_capacity: 64,
        }
    }
}

impl BusConfig {
    /// Inbox size, never below one slot.
    pub fn inbox_capacity(&self) -> usize {
        self.inbox_capacity.max(1)
    }

    pub fn departure_capacity(&self) -> usize {
        self.departure_capacity.max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.inbox_capacity == 0 {
            return Err(MeshError::InvalidConfig(
                "inbox capacity must be at least 1".to_string(),
            ));
        }
        if self.departure_capacity == 0 {
            return Err(MeshError::InvalidConfig(
                "departure capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Master coordinator settings.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Period of the dispatch/stall/prune sweep
    pub sweep_interval_ms: u64,
    /// How long a job may wait for nodes before callers see
    /// `InsufficientCapacity`
    pub capacity_timeout_ms: u64,
    /// How long finished jobs stay queryable
    pub finished_retention_secs: u64,
    /// Maximum number of tracked jobs
    pub max_jobs: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 200,
            capacity_timeout_ms: 5000,
            finished_retention_secs: 600,
            max_jobs: 10_000,
        }
    }
}

impl MasterConfig {
    /// Sweep period, never shorter than one millisecond.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_ms == 0 {
            return Err(MeshError::InvalidConfig(
                "sweep interval must be at least 1ms".to_string(),
            ));
        }
        if self.max_jobs == 0 {
            return Err(MeshError::InvalidConfig(
                "max jobs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the command-backed fetcher.
///
/// Fetch commands run through the shell, without any sandboxing.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Shell used to run fetch commands
    pub shell: String,
    /// Upper bound on a single fetch, in milliseconds
    pub timeout_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout_ms: 30_000,
        }
    }
}

/// A master plus a fixed population of role nodes in one process.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub fetchers: usize,
    pub workers: usize,
    pub collectors: usize,
    pub bus: BusConfig,
    pub master: MasterConfig,
    pub fetch: FetchConfig,
    /// Address for the HTTP API, if it should be served
    pub api_addr: Option<SocketAddr>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            fetchers: 1,
            workers: 1,
            collectors: 1,
            bus: BusConfig::default(),
            master: MasterConfig::default(),
            fetch: FetchConfig::default(),
            api_addr: None,
        }
    }
}

impl ClusterConfig {
    pub fn new(fetchers: usize, workers: usize, collectors: usize) -> Self {
        Self {
            fetchers,
            workers,
            collectors,
            ..Default::default()
        }
    }

    pub fn with_api(mut self, addr: SocketAddr) -> Self {
        self.api_addr = Some(addr);
        self
    }

    pub fn with_master(mut self, master: MasterConfig) -> Self {
        self.master = master;
        self
    }

    pub fn total_nodes(&self) -> usize {
        self.fetchers + self.workers + self.collectors
    }

    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        self.bus.validate()?;
        self.master.validate()?;
        if self.fetch.timeout_ms == 0 {
            return Err(MeshError::InvalidConfig(
                "fetch timeout must be at least 1ms".to_string(),
            ));
        }
        Ok(())
    }
}
