use crate::error::{FabricError, Result};

use std::net::SocketAddr;
use std::time::Duration;

pub const DEFAULT_REBALANCE_LOCK: &str = "fabric.rebalance";
pub const DEFAULT_RECOVERY_LOCK: &str = "fabric.recovery";

const HTTP_PORT_OFFSET: u16 = 1000;

/// Settings of one member's execution fabric.
///
/// Validated once by [`FabricConfig::validate`] when the executor is built.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Workers in the local pool.
    pub worker_count: usize,
    /// Ceiling for every member call (dispatch, size collection, steal).
    pub remote_call_timeout: Duration,
    pub rebalance_interval: Duration,
    pub rebalance_enabled: bool,
    pub recovery_interval: Duration,
    /// Ledger entries younger than this are never treated as lost.
    pub recovery_min_age: Duration,
    /// How long a cluster lock survives a holder that never releases it.
    pub lock_lease: Duration,
    pub rebalance_lock_name: String,
    pub recovery_lock_name: String,
    /// Buffered outcomes per subscriber before the slowest one lags.
    pub outcome_capacity: usize,
}

impl Default for FabricConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            remote_call_timeout: Duration::from_secs(30),
            rebalance_interval: Duration::from_secs(30),
            rebalance_enabled: true,
            recovery_interval: Duration::from_secs(6),
            recovery_min_age: Duration::from_secs(60),
            lock_lease: Duration::from_secs(300),
            rebalance_lock_name: DEFAULT_REBALANCE_LOCK.to_string(),
            recovery_lock_name: DEFAULT_RECOVERY_LOCK.to_string(),
            outcome_capacity: 1024,
        }
    }
}

impl FabricConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(FabricError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if self.remote_call_timeout.is_zero() {
            return Err(FabricError::InvalidConfig(
                "remote_call_timeout must be positive".to_string(),
            ));
        }
        if self.rebalance_interval.is_zero() || self.recovery_interval.is_zero() {
            return Err(FabricError::InvalidConfig(
                "periodic intervals must be positive".to_string(),
            ));
        }
        // A dispatch still in flight must not look lost to the sweep.
        if self.recovery_min_age <= self.remote_call_timeout {
            return Err(FabricError::InvalidConfig(format!(
                "recovery_min_age ({:?}) must exceed remote_call_timeout ({:?})",
                self.recovery_min_age, self.remote_call_timeout
            )));
        }
        if self.lock_lease.is_zero() {
            return Err(FabricError::InvalidConfig(
                "lock_lease must be positive".to_string(),
            ));
        }
        if self.rebalance_lock_name.is_empty() || self.recovery_lock_name.is_empty() {
            return Err(FabricError::InvalidConfig(
                "lock names must not be empty".to_string(),
            ));
        }
        if self.rebalance_lock_name == self.recovery_lock_name {
            return Err(FabricError::InvalidConfig(
                "rebalance and recovery must use different locks".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }
}

/// Everything a node binary needs to join a cluster.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    /// Gossip addresses of existing members.
    pub seeds: Vec<String>,
    pub fabric: FabricConfig,
}

impl NodeConfig {
    pub fn new(gossip_addr: SocketAddr, http_addr: SocketAddr) -> Self {
        Self {
            gossip_addr,
            http_addr,
            seeds: Vec::new(),
            fabric: FabricConfig::default(),
        }
    }

    /// HTTP address used when none is given: the gossip port plus 1000.
    pub fn default_http_addr(gossip_addr: SocketAddr) -> Result<SocketAddr> {
        let port = gossip_addr.port().checked_add(HTTP_PORT_OFFSET).ok_or_else(|| {
            FabricError::InvalidConfig(format!(
                "gossip port {} leaves no room for the HTTP port, pass it explicitly",
                gossip_addr.port()
            ))
        })?;
        Ok(SocketAddr::new(gossip_addr.ip(), port))
    }

    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.seeds.push(seed.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = FabricConfig::default();
        assert!(cfg.worker_count > 0);
        assert_eq!(cfg.remote_call_timeout, Duration::from_secs(30));
        assert_eq!(cfg.recovery_interval, Duration::from_secs(6));
        assert!(cfg.rebalance_enabled);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = FabricConfig::default().with_workers(0);
        assert!(matches!(cfg.validate(), Err(FabricError::InvalidConfig(_))));
    }

    #[test]
    fn recovery_age_must_exceed_call_timeout() {
        let cfg = FabricConfig {
            remote_call_timeout: Duration::from_secs(30),
            recovery_min_age: Duration::from_secs(30),
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("recovery_min_age"));
    }

    #[test]
    fn shared_lock_name_rejected() {
        let cfg = FabricConfig {
            recovery_lock_name: DEFAULT_REBALANCE_LOCK.to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn node_config_builder() {
        let cfg = NodeConfig::new(
            "127.0.0.1:7000".parse().unwrap(),
            "127.0.0.1:8000".parse().unwrap(),
        )
        .with_seed("127.0.0.1:7001");
        assert_eq!(cfg.seeds, vec!["127.0.0.1:7001".to_string()]);
        assert!(cfg.fabric.validate().is_ok());
    }

    #[test]
    fn default_http_port_is_offset_from_gossip() {
        let gossip: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(
            NodeConfig::default_http_addr(gossip).unwrap(),
            "127.0.0.1:6000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn default_http_port_rejects_overflow() {
        let gossip: SocketAddr = "127.0.0.1:65000".parse().unwrap();
        assert!(matches!(
            NodeConfig::default_http_addr(gossip),
            Err(FabricError::InvalidConfig(_))
        ));
    }
}
