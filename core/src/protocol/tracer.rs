//! Tracer messages
//!
//! The unit of route exchange between neighbours. A tracer carries only the
//! destinations whose best route changed at the sender, grouped by level, plus
//! the trail of nodes the change travelled through.

use crate::address::Nip;
use crate::error::{MeshError, Result};
use crate::route::Rem;
use serde::{Deserialize, Serialize};

/// Routes longer than this are treated as unreachable
pub const MAX_HOPS: u8 = 64;

/// One advertised destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub dest: usize,
    /// Sender's best path quality, `None` when withdrawn
    pub rem: Option<Rem>,
    pub hops: u8,
}

impl DeltaEntry {
    pub fn reachable(dest: usize, rem: Rem, hops: u8) -> Self {
        Self {
            dest,
            rem: Some(rem),
            hops,
        }
    }

    pub fn withdrawn(dest: usize) -> Self {
        Self {
            dest,
            rem: None,
            hops: 0,
        }
    }
}

/// Changes of one level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelDelta {
    pub level: usize,
    pub entries: Vec<DeltaEntry>,
}

/// A node the change passed through, with the accumulated link cost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailHop {
    pub nip: Nip,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerMessage {
    pub sender: Nip,
    pub netid: u64,
    pub deltas: Vec<LevelDelta>,
    pub trail: Vec<TrailHop>,
    /// Ask the receiver to answer with better routes it holds
    pub interest: bool,
}

impl TracerMessage {
    pub fn entry_count(&self) -> usize {
        self.deltas.iter().map(|d| d.entries.len()).sum()
    }

    /// Accumulated cost at the sender, 0 for a fresh trail
    pub fn trail_cost(&self) -> f64 {
        self.trail.last().map(|h| h.cost).unwrap_or(0.0)
    }

    /// Check every address, level and id before the message touches any state
    pub fn validate(&self, levels: usize, group_size: usize) -> Result<()> {
        if !self.sender.is_valid(levels, group_size) {
            return Err(MeshError::Protocol(format!(
                "invalid sender address {}",
                self.sender
            )));
        }
        for delta in &self.deltas {
            if delta.level >= levels {
                return Err(MeshError::Protocol(format!(
                    "delta for level {} (levels: {})",
                    delta.level, levels
                )));
            }
            for entry in &delta.entries {
                if entry.dest >= group_size {
                    return Err(MeshError::Protocol(format!(
                        "destination {} at level {} out of range",
                        entry.dest, delta.level
                    )));
                }
                if entry.hops > MAX_HOPS {
                    return Err(MeshError::Protocol(format!(
                        "hop count {} exceeds {}",
                        entry.hops, MAX_HOPS
                    )));
                }
                if let Some(rem) = &entry.rem {
                    if !rem.is_valid() {
                        return Err(MeshError::Protocol(format!(
                            "invalid metric for destination {}",
                            entry.dest
                        )));
                    }
                }
            }
        }
        if self.trail.len() > MAX_HOPS as usize {
            return Err(MeshError::Protocol(format!(
                "trail of {} hops",
                self.trail.len()
            )));
        }
        for hop in &self.trail {
            if !hop.nip.is_valid(levels, group_size) || !hop.cost.is_finite() || hop.cost < 0.0 {
                return Err(MeshError::Protocol(format!("invalid trail hop {}", hop.nip)));
            }
        }
        Ok(())
    }
}
