//! Partition collision bookkeeping
//!
//! Two fragments that grew apart may claim overlapping address space. When a
//! neighbour reports a foreign netid its top-level gnode is marked contested
//! until a reconciliation handshake settles which side renumbers.

use crate::address::Nip;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What each side announces during reconciliation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContestInfo {
    pub nip: Nip,
    pub netid: u64,
    /// Number of destinations reachable from this side
    pub size: u64,
    /// Top-level gnode ids this side knows to be in use, its own included
    pub occupied: Vec<usize>,
}

impl ContestInfo {
    /// Address and every listed gnode id fit the hierarchy
    pub fn is_valid(&self, levels: usize, group_size: usize) -> bool {
        self.nip.is_valid(levels, group_size) && self.occupied.iter().all(|&id| id < group_size)
    }
}

/// Outcome of a finished (or abandoned) reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// We moved to a new top-level gnode id and adopted the peer's netid
    Renumbered { old: Nip, new: Nip, netid: u64 },
    /// The peer is expected to renumber
    PeerYields,
    /// Nothing to do anymore: the peer is gone or already agrees with us
    Aborted,
}

/// True if the `local` side must renumber
///
/// The smaller fragment yields; equal sizes fall back to the lower netid.
pub fn yields(local: &ContestInfo, remote: &ContestInfo) -> bool {
    (local.size, local.netid) < (remote.size, remote.netid)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Contest {
    gnode: usize,
    netid: u64,
}

/// Neighbours currently in a collision, with their top-level gnode
#[derive(Debug, Default)]
pub struct Contests {
    open: BTreeMap<Nip, Contest>,
}

impl Contests {
    /// Mark a neighbour as contested; false if it already was
    pub fn mark(&mut self, nip: Nip, netid: u64, gnode: usize) -> bool {
        self.open.insert(nip, Contest { gnode, netid }).is_none()
    }

    pub fn clear(&mut self, nip: &Nip) -> bool {
        self.open.remove(nip).is_some()
    }

    pub fn clear_all(&mut self) {
        self.open.clear();
    }

    pub fn contains(&self, nip: &Nip) -> bool {
        self.open.contains_key(nip)
    }

    /// Netid claimed by a contested neighbour
    pub fn netid_of(&self, nip: &Nip) -> Option<u64> {
        self.open.get(nip).map(|c| c.netid)
    }

    /// True if some contested neighbour sits in this top-level gnode
    pub fn is_contested_gnode(&self, gnode: usize) -> bool {
        self.open.values().any(|c| c.gnode == gnode)
    }

    pub fn gnodes(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.open.values().map(|c| c.gnode).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}
