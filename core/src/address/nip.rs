//! Hierarchical node address (NIP)
//!
//! A NIP holds one digit per level, level 0 first. Digit `i` is the position of
//! the node inside its level-`i` group. The flat form is positional base-G with
//! level 0 as the least significant digit.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Per-level digit sequence identifying a node in the hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nip(Vec<u16>);

impl Nip {
    pub fn new(digits: Vec<u16>) -> Self {
        Nip(digits)
    }

    /// Decode a flat id into `levels` base-`group_size` digits
    ///
    /// Callers are expected to keep `flat < group_size ^ levels`; the map checks
    /// this before calling.
    pub fn from_flat(flat: u64, levels: usize, group_size: usize) -> Self {
        let g = group_size as u64;
        let mut rest = flat;
        let mut digits = Vec::with_capacity(levels);
        for _ in 0..levels {
            digits.push((rest % g) as u16);
            rest /= g;
        }
        Nip(digits)
    }

    /// Encode back into the flat id
    pub fn to_flat(&self, group_size: usize) -> u64 {
        let g = group_size as u64;
        self.0
            .iter()
            .rev()
            .fold(0u64, |acc, &d| acc.wrapping_mul(g).wrapping_add(d as u64))
    }

    pub fn levels(&self) -> usize {
        self.0.len()
    }

    pub fn digits(&self) -> &[u16] {
        &self.0
    }

    /// Digit at `level`, 0 when the level is beyond the address length
    pub fn digit(&self, level: usize) -> usize {
        self.0.get(level).map(|&d| d as usize).unwrap_or(0)
    }

    /// Copy of this address with one digit replaced
    pub fn with_digit(&self, level: usize, id: usize) -> Nip {
        let mut digits = self.0.clone();
        if let Some(d) = digits.get_mut(level) {
            *d = id as u16;
        }
        Nip(digits)
    }

    /// Highest level at which the two addresses differ
    ///
    /// `None` means the addresses are identical. Scanning starts at the top
    /// level, so the result also tells in which level-`k` group the two nodes
    /// part ways.
    pub fn highest_diff_level(&self, other: &Nip) -> Option<usize> {
        let len = self.0.len().max(other.0.len());
        (0..len).rev().find(|&l| self.0.get(l) != other.0.get(l))
    }

    /// True if both addresses lie in the same level-`level` gnode
    ///
    /// Two nodes share a level-`l` gnode when their digits agree at every level
    /// `>= l`. At level 0 this only holds for identical addresses.
    pub fn same_gnode(&self, other: &Nip, level: usize) -> bool {
        match self.highest_diff_level(other) {
            None => true,
            Some(k) => k < level,
        }
    }

    /// Check every digit against the hierarchy shape
    pub fn is_valid(&self, levels: usize, group_size: usize) -> bool {
        self.0.len() == levels && self.0.iter().all(|&d| (d as usize) < group_size)
    }
}

// Highest level is the most significant, so ordering matches the flat id.
impl Ord for Nip {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.iter().rev().cmp(other.0.iter().rev()))
    }
}

impl PartialOrd for Nip {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Nip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Parses the dotted form printed by `Display`, level 0 first
impl FromStr for Nip {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split('.')
            .map(|part| part.trim().parse::<u16>())
            .collect::<Result<Vec<_>, _>>()
            .map(Nip)
    }
}

impl From<Vec<u16>> for Nip {
    fn from(digits: Vec<u16>) -> Self {
        Nip(digits)
    }
}
