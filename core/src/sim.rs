//! In-memory network simulation
//!
//! `SimNetwork` wires several `Node`s together over point-to-point links with a
//! fixed round-trip time, and drives probe rounds on a virtual clock. Frames go
//! through the real wire codec and are delivered in timestamp order, so a run is
//! fully deterministic. Collision handshakes complete over the same links.

use crate::address::Nip;
use crate::config::RoutingConfig;
use crate::error::{MeshError, Result};
use crate::node::{Device, Node, NodeOutput, Outbound};
use crate::protocol::{encode_frame, WireMessage};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use tracing::{debug, info, warn};

pub type NodeId = usize;

/// Nominal bandwidth of simulated devices
pub const SIM_BANDWIDTH_KBPS: f64 = 10_000.0;

/// Supported generated topologies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Line,
    Ring,
    Star,
}

/// Counters over the whole run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimStats {
    pub rounds: u64,
    pub frames: u64,
    pub tracers: u64,
    pub dropped: u64,
    pub route_changes: u64,
    pub renumbered: u64,
}

struct SimNode {
    node: Node,
    devices: Vec<Device>,
}

struct SimLink {
    ends: [(NodeId, String); 2],
    rtt_ms: u64,
    up: bool,
}

struct Delivery {
    at: u64,
    seq: u64,
    to: NodeId,
    device: String,
    frame: Vec<u8>,
}

impl PartialEq for Delivery {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delivery {}

impl PartialOrd for Delivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delivery {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.at, self.seq).cmp(&(other.at, other.seq))
    }
}

pub struct SimNetwork {
    config: RoutingConfig,
    nodes: Vec<SimNode>,
    links: Vec<SimLink>,
    queue: BinaryHeap<Reverse<Delivery>>,
    now: u64,
    seq: u64,
    stats: SimStats,
}

impl SimNetwork {
    pub fn new(config: RoutingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            nodes: Vec::new(),
            links: Vec::new(),
            queue: BinaryHeap::new(),
            now: 0,
            seq: 0,
            stats: SimStats::default(),
        })
    }

    /// `count` nodes with consecutive addresses, wired as `topology`
    ///
    /// A star keeps every node in one level-0 gnode, so `count` may not exceed
    /// the group size.
    pub fn generate(
        config: RoutingConfig,
        topology: Topology,
        count: usize,
        rtt_ms: u64,
        netid: u64,
    ) -> Result<Self> {
        let mut net = Self::new(config)?;
        if topology == Topology::Star && count > net.config.group_size {
            return Err(MeshError::ResourceExhausted { level: 0 });
        }
        let ids = (0..count)
            .map(|i| net.add_node(net.flat_nip(i as u64)?, netid))
            .collect::<Result<Vec<_>>>()?;

        match topology {
            Topology::Line | Topology::Ring => {
                for pair in ids.windows(2) {
                    net.connect(pair[0], pair[1], rtt_ms)?;
                }
                if topology == Topology::Ring && count > 2 {
                    net.connect(ids[count - 1], ids[0], rtt_ms)?;
                }
            }
            Topology::Star => {
                for &leaf in ids.iter().skip(1) {
                    net.connect(ids[0], leaf, rtt_ms)?;
                }
            }
        }
        Ok(net)
    }

    fn flat_nip(&self, flat: u64) -> Result<Nip> {
        match self.config.address_space() {
            Some(space) if flat < space => Ok(Nip::from_flat(
                flat,
                self.config.levels,
                self.config.group_size,
            )),
            _ => Err(MeshError::ResourceExhausted {
                level: self.config.levels - 1,
            }),
        }
    }

    pub fn add_node(&mut self, nip: Nip, netid: u64) -> Result<NodeId> {
        let node = Node::new(self.config.clone(), nip, netid)?;
        self.nodes.push(SimNode {
            node,
            devices: Vec::new(),
        });
        Ok(self.nodes.len() - 1)
    }

    /// Wire two nodes with a dedicated device on each side
    pub fn connect(&mut self, a: NodeId, b: NodeId, rtt_ms: u64) -> Result<usize> {
        if a == b || a >= self.nodes.len() || b >= self.nodes.len() {
            return Err(MeshError::Link(format!("cannot connect {} to {}", a, b)));
        }
        let index = self.links.len();
        let mut ends = Vec::with_capacity(2);
        for id in [a, b] {
            let name = format!("sim{}", index);
            self.nodes[id]
                .devices
                .push(Device::new(name.clone(), SIM_BANDWIDTH_KBPS));
            ends.push((id, name));
        }
        let (Some(second), Some(first)) = (ends.pop(), ends.pop()) else {
            return Err(MeshError::Link("link ends missing".into()));
        };
        self.links.push(SimLink {
            ends: [first, second],
            rtt_ms,
            up: true,
        });
        Ok(index)
    }

    /// Take the link between `a` and `b` down; frames in flight still arrive
    pub fn cut(&mut self, a: NodeId, b: NodeId) -> bool {
        self.set_link(a, b, false)
    }

    pub fn restore(&mut self, a: NodeId, b: NodeId) -> bool {
        self.set_link(a, b, true)
    }

    fn set_link(&mut self, a: NodeId, b: NodeId, up: bool) -> bool {
        let Some(link) = self.links.iter_mut().find(|l| {
            let (x, y) = (l.ends[0].0, l.ends[1].0);
            (x, y) == (a, b) || (x, y) == (b, a)
        }) else {
            return false;
        };
        link.up = up;
        info!("Link {} <-> {} {}", a, b, if up { "restored" } else { "cut" });
        true
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id].node
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().map(|n| &n.node)
    }

    pub fn stats(&self) -> SimStats {
        self.stats
    }

    pub fn now_ms(&self) -> u64 {
        self.now
    }

    fn id_of(&self, nip: &Nip) -> Option<NodeId> {
        self.nodes.iter().position(|n| n.node.nip() == nip)
    }

    /// Nodes visited when forwarding from `from` to `to` along best routes
    pub fn path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        let target = self.node(to).nip().clone();
        let mut path = vec![from];
        let mut current = from;
        while current != to {
            if path.len() > self.nodes.len() {
                warn!("Forwarding loop from {} towards {}", from, to);
                return None;
            }
            let route = self.node(current).route_to(&target)?;
            current = self.id_of(&route.gateway)?;
            path.push(current);
        }
        Some(path)
    }

    pub fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        self.path(from, to).is_some()
    }

    /// True if every node reaches every other node
    pub fn fully_connected(&self) -> bool {
        (0..self.len()).all(|a| (0..self.len()).all(|b| a == b || self.reachable(a, b)))
    }

    // ========================================================================
    // DRIVING
    // ========================================================================

    /// One probe round followed by delivery of everything it triggers
    ///
    /// Returns the number of route changes observed during the round.
    pub fn run_round(&mut self) -> u64 {
        let before = self.stats.route_changes;
        let start = self.now;
        let close = start + self.config.reply_wait_ms;
        let next = start + self.config.probe_interval_ms;

        for id in 0..self.nodes.len() {
            let devices = self.nodes[id].devices_up(&self.links);
            let probes = self.nodes[id].node.begin_probe_round(&devices, start);
            self.send(id, probes, start);
        }
        self.deliver_until(close);

        for id in 0..self.nodes.len() {
            let output = self.nodes[id].node.end_probe_round(close);
            self.handle_output(id, output, close);
        }
        self.deliver_until(next.saturating_sub(1));

        self.now = next;
        self.stats.rounds += 1;
        self.stats.route_changes - before
    }

    pub fn run_rounds(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.run_round();
        }
    }

    /// Run until `quiet` consecutive rounds change nothing
    ///
    /// Returns the number of rounds run, or `None` if `max_rounds` was reached.
    pub fn run_until_quiet(&mut self, quiet: usize, max_rounds: usize) -> Option<usize> {
        let mut calm = 0;
        for round in 1..=max_rounds {
            let tracers = self.stats.tracers;
            let changes = self.run_round();
            if changes == 0 && self.stats.tracers == tracers && self.queue.is_empty() {
                calm += 1;
                if calm >= quiet {
                    return Some(round);
                }
            } else {
                calm = 0;
            }
        }
        None
    }

    fn deliver_until(&mut self, limit: u64) {
        while let Some(Reverse(head)) = self.queue.peek() {
            if head.at > limit {
                break;
            }
            let Some(Reverse(delivery)) = self.queue.pop() else {
                break;
            };
            let to = delivery.to;
            match self.nodes[to]
                .node
                .handle_frame(&delivery.device, &delivery.frame, delivery.at)
            {
                Ok(output) => self.handle_output(to, output, delivery.at),
                Err(e) => warn!("Node {} dropped frame: {}", to, e),
            }
        }
    }

    fn handle_output(&mut self, id: NodeId, output: NodeOutput, at: u64) {
        let NodeOutput {
            outbound,
            route_changes,
            contests,
            contest_replies,
            aborted: _,
            renumbered,
        } = output;

        self.stats.route_changes += route_changes.len() as u64;
        if let Some((old, new)) = renumbered {
            info!("Node {} renumbered {} -> {}", id, old, new);
            self.stats.renumbered += 1;
        }
        self.send(id, outbound, at);

        for peer in contests {
            if let Some(contest) = self.nodes[id].node.start_reconcile(&peer) {
                self.send(id, vec![contest], at);
            }
        }
        for remote in contest_replies {
            match self.nodes[id].node.reconcile(&remote) {
                Ok((outcome, output)) => {
                    debug!("Node {} reconciled with {}: {:?}", id, remote.nip, outcome);
                    self.handle_output(id, output, at);
                }
                Err(e) => warn!("Node {} failed to reconcile: {}", id, e),
            }
        }
    }

    fn send(&mut self, from: NodeId, outbound: Vec<Outbound>, at: u64) {
        for out in outbound {
            let Some(link) = self
                .links
                .iter()
                .find(|l| l.ends.iter().any(|(id, dev)| *id == from && dev == out.device()))
            else {
                warn!("Node {} has no device {}", from, out.device());
                continue;
            };
            if !link.up {
                self.stats.dropped += 1;
                continue;
            }
            let Some((peer, peer_device)) = link.ends.iter().find(|(id, _)| *id != from).cloned()
            else {
                continue;
            };
            let frame = match encode_frame(out.message()) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Node {} cannot encode {}: {}", from, out.message().kind(), e);
                    continue;
                }
            };
            if matches!(out.message(), WireMessage::Tracer(_)) {
                self.stats.tracers += 1;
            }
            self.stats.frames += 1;
            self.seq += 1;
            self.queue.push(Reverse(Delivery {
                at: at + link.rtt_ms / 2,
                seq: self.seq,
                to: peer,
                device: peer_device,
                frame,
            }));
        }
    }
}

impl SimNode {
    fn devices_up(&self, links: &[SimLink]) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| {
                links
                    .iter()
                    .any(|l| l.up && l.ends.iter().any(|(_, dev)| *dev == d.name))
            })
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("nodes", &self.nodes.len())
            .field("links", &self.links.len())
            .field("now", &self.now)
            .field("stats", &self.stats)
            .finish()
    }
}
