//! Raft runtime configuration.

use rand::thread_rng;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Default election timeout minimum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default election timeout maximum, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default maximum number of entries per AppendEntries payload.
pub const DEFAULT_MAX_PAYLOAD_ENTRIES: u64 = 300;
/// Default threshold of entries behind the leader's log before a replication
/// stream is considered lagging.
pub const DEFAULT_REPLICATION_LAG_THRESHOLD: u64 = 1000;

/// Error variants related to configuration.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The election timeout min & max are invalid: max must be greater than min.
    #[error("given values for election timeout min & max are invalid: max must be greater than min")]
    InvalidElectionTimeoutMinMax,
    /// The given value for heartbeat interval is invalid: it must be less than
    /// the election timeout minimum, else followers will spuriously time out.
    #[error("given value for heartbeat interval is invalid: it must be less than election timeout min")]
    InvalidHeartbeatInterval,
}

/// The runtime configuration for a Raft node.
///
/// The default values used by this type should generally work well for Raft
/// clusters which will be running with nodes in multiple datacenter
/// availability zones with low latency between zones. These values should
/// typically be made configurable from the perspective of the application
/// which is being built on top of Raft.
///
/// When building the Raft configuration for your application, remember this
/// inequality from the Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The interval at which leaders will send heartbeats to followers to
    /// avoid election timeout, in milliseconds.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per payload allowed to be transmitted
    /// during replication.
    pub max_payload_entries: u64,
    /// The distance behind in log replication before the target node is
    /// considered to be lagging.
    pub replication_lag_threshold: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_payload_entries: None,
            replication_lag_threshold: None,
        }
    }

    /// Generate a new random election timeout within the configured min & max.
    pub fn new_rand_election_timeout(&self) -> u64 {
        thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A configuration builder to ensure that runtime config is valid.
///
/// For election timeout config & heartbeat interval configuration, it is
/// recommended that `{ election_timeout_min >= 3 * heartbeat_interval }`.
#[derive(Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_payload_entries: Option<u64>,
    replication_lag_threshold: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `election_timeout_min`.
    pub fn election_timeout_min(mut self, val: u64) -> Self {
        self.election_timeout_min = Some(val);
        self
    }

    /// Set the desired value for `election_timeout_max`.
    pub fn election_timeout_max(mut self, val: u64) -> Self {
        self.election_timeout_max = Some(val);
        self
    }

    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `max_payload_entries`.
    pub fn max_payload_entries(mut self, val: u64) -> Self {
        self.max_payload_entries = Some(val);
        self
    }

    /// Set the desired value for `replication_lag_threshold`.
    pub fn replication_lag_threshold(mut self, val: u64) -> Self {
        self.replication_lag_threshold = Some(val);
        self
    }

    /// Validate the state of this builder, returning a new `Config` on success.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN);
        let election_timeout_max = self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutMinMax);
        }
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if election_timeout_min <= heartbeat_interval {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            max_payload_entries: self.max_payload_entries.unwrap_or(DEFAULT_MAX_PAYLOAD_ENTRIES),
            replication_lag_threshold: self
                .replication_lag_threshold
                .unwrap_or(DEFAULT_REPLICATION_LAG_THRESHOLD),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        assert_eq!(cfg.cluster_name, "cluster0");
        assert_eq!(cfg.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(cfg.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(cfg.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
    }

    #[test]
    fn test_invalid_election_timeout_config_produces_expected_error() {
        let res = Config::build("cluster0".into())
            .election_timeout_min(1000)
            .election_timeout_max(700)
            .validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeoutMinMax);
    }

    #[test]
    fn test_invalid_heartbeat_interval_produces_expected_error() {
        let res = Config::build("cluster0".into()).heartbeat_interval(200).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidHeartbeatInterval);
    }

    #[test]
    fn test_rand_election_timeout_is_in_range() {
        let cfg = Config::build("cluster0".into()).validate().unwrap();
        for _ in 0..100 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min);
            assert!(t < cfg.election_timeout_max);
        }
    }
}
