//! Routing configuration
//!
//! Every option the routing core recognises, with its default. The structure is
//! validated once at startup and treated as immutable afterwards.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during configuration validation
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid level count: must be >= 1, got {0}")]
    InvalidLevels(usize),

    #[error("Invalid group size: must be 2-65536, got {0}")]
    InvalidGroupSize(usize),

    #[error("Address space of {group_size}^{levels} does not fit in 64 bits")]
    AddressSpaceOverflow { levels: usize, group_size: usize },

    #[error("Invalid route capacity: {0} must be >= 1")]
    InvalidRouteCapacity(&'static str),

    #[error("Invalid interval: {0} must be > 0")]
    ZeroInterval(&'static str),

    #[error("Reply wait ({wait_ms} ms) must be shorter than the probe interval ({interval_ms} ms)")]
    ReplyWaitTooLong { wait_ms: u64, interval_ms: u64 },

    #[error("Invalid probe bouquet: must send at least one probe per round")]
    EmptyBouquet,

    #[error("Invalid thresholds: removal ({remove}) must come after staleness ({stale})")]
    InvalidThresholds { stale: u32, remove: u32 },

    #[error("Invalid neighbour cap: must be >= 1")]
    InvalidMaxNeighbours,

    #[error("Invalid quality change ratio: must be > 0, got {0}")]
    InvalidChangeRatio(f64),

    #[error("Invalid metric weights: {0}")]
    InvalidWeights(String),

    #[error("Invalid metric ceiling: {0} must be > 0")]
    InvalidCeiling(&'static str),

    #[error("Malformed configuration: {0}")]
    Parse(String),
}

// ============================================================================
// METRIC WEIGHTS
// ============================================================================

/// Weights of the composite route metric
///
/// Latency counts twice as much as either bandwidth direction. The same weights
/// are used as smoothing factors when a fresh sample is folded into a running
/// estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricWeights {
    pub rtt: f64,
    pub up: f64,
    pub down: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            rtt: 0.5,
            up: 0.25,
            down: 0.25,
        }
    }
}

impl MetricWeights {
    fn validate(&self) -> Result<(), ConfigError> {
        for (name, w) in [("rtt", self.rtt), ("up", self.up), ("down", self.down)] {
            if !w.is_finite() || w <= 0.0 || w > 1.0 {
                return Err(ConfigError::InvalidWeights(format!(
                    "{} weight must be in (0, 1], got {}",
                    name, w
                )));
            }
        }
        let sum = self.rtt + self.up + self.down;
        if (sum - 1.0).abs() > 1e-9 {
            return Err(ConfigError::InvalidWeights(format!(
                "weights must sum to 1.0, got {}",
                sum
            )));
        }
        Ok(())
    }
}

// ============================================================================
// ROUTING CONFIG
// ============================================================================

/// Startup configuration of a routing node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Number of hierarchy levels (L)
    pub levels: usize,
    /// Slots per level (G)
    pub group_size: usize,
    /// Candidate routes kept per destination at level 0
    pub max_routes: usize,
    /// Candidate routes kept per foreign gnode at the upper levels
    pub upper_level_routes: usize,
    /// Time between two probe rounds
    pub probe_interval_ms: u64,
    /// Probes broadcast per device in one round
    pub probes_per_round: u32,
    /// How long a round collects replies before it is closed
    pub reply_wait_ms: u64,
    /// Missed rounds before a neighbour is considered stale
    pub stale_after_missed: u32,
    /// Missed rounds before a neighbour is removed
    pub remove_after_missed: u32,
    /// Maximum number of tracked neighbours
    pub max_neighbours: usize,
    /// Relative link-cost variation that is reported as a quality change
    pub quality_change_ratio: f64,
    /// Deadline for the collision reconciliation handshake
    pub reconcile_timeout_ms: u64,
    /// Composite metric weights
    pub weights: MetricWeights,
    /// Latency treated as the worst possible value
    pub rtt_ceiling_ms: f64,
    /// Bandwidth treated as the best possible value
    pub bandwidth_ceiling_kbps: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            levels: 4,
            group_size: 256,
            max_routes: 4,
            upper_level_routes: 1,
            probe_interval_ms: 1000,
            probes_per_round: 4,
            reply_wait_ms: 400,
            stale_after_missed: 1,
            remove_after_missed: 3,
            max_neighbours: 16,
            quality_change_ratio: 0.1,
            reconcile_timeout_ms: 2000,
            weights: MetricWeights::default(),
            rtt_ceiling_ms: 60_000.0, // 1 minute
            bandwidth_ceiling_kbps: 1_000_000.0, // 1 Gbit/s
        }
    }
}

impl RoutingConfig {
    /// Parse a JSON document; missing options take their defaults
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RoutingConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate every option; called once before a node is built
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.levels == 0 {
            return Err(ConfigError::InvalidLevels(self.levels));
        }
        if self.group_size < 2 || self.group_size > 65536 {
            return Err(ConfigError::InvalidGroupSize(self.group_size));
        }
        if self.address_space().is_none() {
            return Err(ConfigError::AddressSpaceOverflow {
                levels: self.levels,
                group_size: self.group_size,
            });
        }

        if self.max_routes == 0 {
            return Err(ConfigError::InvalidRouteCapacity("max_routes"));
        }
        if self.upper_level_routes == 0 {
            return Err(ConfigError::InvalidRouteCapacity("upper_level_routes"));
        }

        if self.probe_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("probe_interval_ms"));
        }
        if self.reply_wait_ms == 0 {
            return Err(ConfigError::ZeroInterval("reply_wait_ms"));
        }
        if self.reconcile_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("reconcile_timeout_ms"));
        }
        if self.reply_wait_ms >= self.probe_interval_ms {
            return Err(ConfigError::ReplyWaitTooLong {
                wait_ms: self.reply_wait_ms,
                interval_ms: self.probe_interval_ms,
            });
        }
        if self.probes_per_round == 0 {
            return Err(ConfigError::EmptyBouquet);
        }

        if self.stale_after_missed == 0 || self.remove_after_missed <= self.stale_after_missed {
            return Err(ConfigError::InvalidThresholds {
                stale: self.stale_after_missed,
                remove: self.remove_after_missed,
            });
        }
        if self.max_neighbours == 0 {
            return Err(ConfigError::InvalidMaxNeighbours);
        }
        if !self.quality_change_ratio.is_finite() || self.quality_change_ratio <= 0.0 {
            return Err(ConfigError::InvalidChangeRatio(self.quality_change_ratio));
        }

        self.weights.validate()?;
        if !self.rtt_ceiling_ms.is_finite() || self.rtt_ceiling_ms <= 0.0 {
            return Err(ConfigError::InvalidCeiling("rtt_ceiling_ms"));
        }
        if !self.bandwidth_ceiling_kbps.is_finite() || self.bandwidth_ceiling_kbps <= 0.0 {
            return Err(ConfigError::InvalidCeiling("bandwidth_ceiling_kbps"));
        }

        Ok(())
    }

    /// Total number of addresses, `group_size ^ levels`, if it fits in a u64
    pub fn address_space(&self) -> Option<u64> {
        let levels = u32::try_from(self.levels).ok()?;
        (self.group_size as u64).checked_pow(levels)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn reply_wait(&self) -> Duration {
        Duration::from_millis(self.reply_wait_ms)
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_millis(self.reconcile_timeout_ms)
    }

    /// Route capacity of a destination at the given level
    pub fn route_capacity(&self, level: usize) -> usize {
        if level == 0 {
            self.max_routes
        } else {
            self.upper_level_routes
        }
    }
}
