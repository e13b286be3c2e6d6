//! Membership runtime configuration.

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;

/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default multiplier over the heartbeat interval forming the joining-peer liveness window.
pub const DEFAULT_JOIN_RESPONSE_LIMIT: u64 = 20;
/// Default maximum number of log entries packed into one log-sync payload.
pub const DEFAULT_LOG_SYNC_BATCH_SIZE: u64 = 300;
/// Default commit gap under which catch-up of a joining member is declared complete.
pub const DEFAULT_LOG_SYNC_STOP_GAP: u64 = 10;

/// The runtime configuration for the membership core of a Raft node.
///
/// The interesting trade-off here is `log_sync_stop_gap`: a joining member is
/// only proposed into the cluster configuration once its log is within this
/// many entries of the leader's commit index. Too large and a freshly added
/// member lags far behind the moment it becomes a voter; too small and a
/// write-heavy cluster may take many log-sync rounds to converge. The default
/// works well for clusters where the apply rate is far below
/// `log_sync_batch_size` entries per round trip.
#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    ///
    /// This does not influence the protocol in any way, but is useful for observability.
    pub cluster_name: String,
    /// The heartbeat interval in milliseconds at which the leader pings followers.
    ///
    /// The membership core does not send heartbeats itself; the value bounds
    /// the liveness window for an in-progress join (see `join_response_limit`)
    /// and must match the replication loop's setting.
    pub heartbeat_interval: u64,
    /// How many heartbeat intervals a joining member may stay silent before a
    /// competing `AddServer` request is allowed to supersede it.
    pub join_response_limit: u64,
    /// The maximum number of consecutive log entries packed into a single
    /// log-sync payload while a joining member catches up.
    pub log_sync_batch_size: u64,
    /// Catch-up is complete once the gap between the joining member's log
    /// position and the leader's commit index falls below this value.
    pub log_sync_stop_gap: u64,
}

impl Config {
    /// Start the builder process for a new `Config` instance. Call `validate` when done.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            heartbeat_interval: None,
            join_response_limit: None,
            log_sync_batch_size: None,
            log_sync_stop_gap: None,
        }
    }

    /// The liveness window for an in-progress join, in milliseconds.
    pub fn join_liveness_window(&self) -> u64 {
        self.join_response_limit * self.heartbeat_interval
    }
}

/// A configuration builder to ensure that runtime config is valid.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBuilder {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The heartbeat interval, in milliseconds.
    pub heartbeat_interval: Option<u64>,
    /// The joining-peer liveness multiplier.
    pub join_response_limit: Option<u64>,
    /// The maximum number of entries per log-sync payload.
    pub log_sync_batch_size: Option<u64>,
    /// The commit gap under which catch-up completes.
    pub log_sync_stop_gap: Option<u64>,
}

impl ConfigBuilder {
    /// Set the desired value for `heartbeat_interval`.
    pub fn heartbeat_interval(mut self, val: u64) -> Self {
        self.heartbeat_interval = Some(val);
        self
    }

    /// Set the desired value for `join_response_limit`.
    pub fn join_response_limit(mut self, val: u64) -> Self {
        self.join_response_limit = Some(val);
        self
    }

    /// Set the desired value for `log_sync_batch_size`.
    pub fn log_sync_batch_size(mut self, val: u64) -> Self {
        self.log_sync_batch_size = Some(val);
        self
    }

    /// Set the desired value for `log_sync_stop_gap`.
    pub fn log_sync_stop_gap(mut self, val: u64) -> Self {
        self.log_sync_stop_gap = Some(val);
        self
    }

    /// Validate the state of this builder and produce a new `Config` instance if valid.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
        if heartbeat_interval == 0 {
            return Err(ConfigError::HeartbeatIntervalTooSmall);
        }
        let join_response_limit = self.join_response_limit.unwrap_or(DEFAULT_JOIN_RESPONSE_LIMIT);
        if join_response_limit == 0 {
            return Err(ConfigError::JoinResponseLimitTooSmall);
        }
        let log_sync_batch_size = self.log_sync_batch_size.unwrap_or(DEFAULT_LOG_SYNC_BATCH_SIZE);
        if log_sync_batch_size == 0 {
            return Err(ConfigError::LogSyncBatchSizeTooSmall);
        }
        let log_sync_stop_gap = self.log_sync_stop_gap.unwrap_or(DEFAULT_LOG_SYNC_STOP_GAP);
        Ok(Config {
            cluster_name: self.cluster_name,
            heartbeat_interval,
            join_response_limit,
            log_sync_batch_size,
            log_sync_stop_gap,
        })
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////
// Unit Tests ////////////////////////////////////////////////////////////////////////////////////
