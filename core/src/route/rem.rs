//! Route efficiency measure (REM) and the composite metric

use crate::address::Nip;
use crate::config::{MetricWeights, RoutingConfig};
use serde::{Deserialize, Serialize};

/// Raw quality of a link or path
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rem {
    /// Round-trip latency in milliseconds
    pub rtt_ms: f64,
    /// Upload bandwidth in kbit/s
    pub up_kbps: f64,
    /// Download bandwidth in kbit/s
    pub down_kbps: f64,
}

impl Rem {
    pub fn new(rtt_ms: f64, up_kbps: f64, down_kbps: f64) -> Self {
        Self {
            rtt_ms,
            up_kbps,
            down_kbps,
        }
    }

    /// Cost of reaching ourselves: no latency, unbounded bandwidth
    pub fn local() -> Self {
        Self::new(0.0, f64::INFINITY, f64::INFINITY)
    }

    /// Concatenate with the path that follows this one
    ///
    /// Latency adds up, bandwidth is limited by the narrowest segment.
    pub fn then(&self, next: &Rem) -> Rem {
        Rem {
            rtt_ms: self.rtt_ms + next.rtt_ms,
            up_kbps: self.up_kbps.min(next.up_kbps),
            down_kbps: self.down_kbps.min(next.down_kbps),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rtt_ms.is_finite()
            && self.rtt_ms >= 0.0
            && !self.up_kbps.is_nan()
            && self.up_kbps >= 0.0
            && !self.down_kbps.is_nan()
            && self.down_kbps >= 0.0
    }
}

/// Composite metric used to rank routes; lower cost is better
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Metric {
    weights: MetricWeights,
    rtt_ceiling_ms: f64,
    bandwidth_ceiling_kbps: f64,
}

impl Metric {
    pub fn new(weights: MetricWeights, rtt_ceiling_ms: f64, bandwidth_ceiling_kbps: f64) -> Self {
        Self {
            weights,
            rtt_ceiling_ms,
            bandwidth_ceiling_kbps,
        }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(
            config.weights,
            config.rtt_ceiling_ms,
            config.bandwidth_ceiling_kbps,
        )
    }

    /// Weighted cost in `[0, 1]`
    ///
    /// Every term is normalised against its ceiling. Bandwidth enters as the
    /// missing fraction of the ceiling, so more bandwidth means lower cost.
    pub fn cost(&self, rem: &Rem) -> f64 {
        let rtt = (rem.rtt_ms / self.rtt_ceiling_ms).clamp(0.0, 1.0);
        let up = (rem.up_kbps / self.bandwidth_ceiling_kbps).clamp(0.0, 1.0);
        let down = (rem.down_kbps / self.bandwidth_ceiling_kbps).clamp(0.0, 1.0);
        self.weights.rtt * rtt + self.weights.up * (1.0 - up) + self.weights.down * (1.0 - down)
    }

    /// Fold a fresh sample into a running estimate (exponential moving average)
    pub fn fold(&self, old: &Rem, sample: &Rem) -> Rem {
        fn ema(old: f64, sample: f64, weight: f64) -> f64 {
            if !old.is_finite() || !sample.is_finite() {
                return sample;
            }
            old + weight * (sample - old)
        }
        Rem {
            rtt_ms: ema(old.rtt_ms, sample.rtt_ms, self.weights.rtt),
            up_kbps: ema(old.up_kbps, sample.up_kbps, self.weights.up),
            down_kbps: ema(old.down_kbps, sample.down_kbps, self.weights.down),
        }
    }
}

impl Default for Metric {
    fn default() -> Self {
        Self::from_config(&RoutingConfig::default())
    }
}

/// One candidate route towards a destination gnode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Neighbour used as next hop
    pub gateway: Nip,
    /// Cost the gateway advertised for its own path to the destination
    pub advertised: Rem,
    /// Cost of the link to the gateway
    pub link: Rem,
    pub hops: u8,
}

impl Route {
    /// Route to a neighbour's own gnode
    pub fn direct(gateway: Nip, link: Rem) -> Self {
        Self {
            gateway,
            advertised: Rem::local(),
            link,
            hops: 1,
        }
    }

    /// End-to-end quality of the route
    pub fn rem(&self) -> Rem {
        self.link.then(&self.advertised)
    }
}
