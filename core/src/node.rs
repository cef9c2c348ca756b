//! Node aggregate
//!
//! A `Node` exclusively owns the neighbour table, the route table (built on the
//! address map) and the routing engine of one routing instance. It turns probe
//! rounds and inbound frames into outbound messages and route notifications;
//! the I/O itself is left to the caller.

use crate::address::{AddressMap, Nip};
use crate::config::RoutingConfig;
use crate::engine::{ContestInfo, EngineOutput, ReconcileOutcome, RouteChange, RoutingEngine};
use crate::error::{MeshError, Result};
use crate::neighbour::{DeviceId, NeighbourEvent, NeighbourTable};
use crate::protocol::{decode_frame, TracerMessage, WireMessage};
use crate::route::{Rem, Route, RouteNode, RouteTable};
use std::collections::HashMap;
use tracing::{debug, info};

/// A local link device and its nominal bandwidth
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub name: DeviceId,
    pub bandwidth_kbps: f64,
}

impl Device {
    pub fn new(name: impl Into<DeviceId>, bandwidth_kbps: f64) -> Self {
        Self {
            name: name.into(),
            bandwidth_kbps,
        }
    }
}

/// A message to put on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Broadcast {
        device: DeviceId,
        message: WireMessage,
    },
    Unicast {
        device: DeviceId,
        to: Nip,
        message: WireMessage,
    },
}

impl Outbound {
    pub fn device(&self) -> &str {
        match self {
            Outbound::Broadcast { device, .. } | Outbound::Unicast { device, .. } => device,
        }
    }

    pub fn message(&self) -> &WireMessage {
        match self {
            Outbound::Broadcast { message, .. } | Outbound::Unicast { message, .. } => message,
        }
    }
}

/// Result of one node step
#[derive(Debug, Default)]
pub struct NodeOutput {
    pub outbound: Vec<Outbound>,
    pub route_changes: Vec<RouteChange>,
    /// Neighbours that need a reconciliation handshake
    pub contests: Vec<Nip>,
    /// Contest replies for handshakes waiting on them
    pub contest_replies: Vec<ContestInfo>,
    /// Contested neighbours that left; pending waits on them must be cancelled
    pub aborted: Vec<Nip>,
    /// Local address change after yielding a collision
    pub renumbered: Option<(Nip, Nip)>,
}

impl NodeOutput {
    pub fn absorb(&mut self, other: NodeOutput) {
        self.outbound.extend(other.outbound);
        self.route_changes.extend(other.route_changes);
        self.contests.extend(other.contests);
        self.contest_replies.extend(other.contest_replies);
        self.aborted.extend(other.aborted);
        if other.renumbered.is_some() {
            self.renumbered = other.renumbered;
        }
    }
}

pub struct Node {
    config: RoutingConfig,
    neighbours: NeighbourTable,
    routes: RouteTable,
    engine: RoutingEngine,
    devices: HashMap<DeviceId, f64>,
    next_seq: u32,
    pending_probes: HashMap<u32, u64>,
    pending_contests: HashMap<Nip, ContestInfo>,
}

impl Node {
    /// Build a node; the configuration and address are validated here
    pub fn new(config: RoutingConfig, me: Nip, netid: u64) -> Result<Self> {
        config.validate()?;
        let routes = RouteTable::new(&config, me.clone())?;
        Ok(Self {
            neighbours: NeighbourTable::new(&config, me.clone(), netid),
            engine: RoutingEngine::new(&config, me, netid),
            routes,
            config,
            devices: HashMap::new(),
            next_seq: 0,
            pending_probes: HashMap::new(),
            pending_contests: HashMap::new(),
        })
    }

    pub fn nip(&self) -> &Nip {
        self.engine.me()
    }

    pub fn netid(&self) -> u64 {
        self.engine.netid()
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn neighbours(&self) -> &NeighbourTable {
        &self.neighbours
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn address_map(&self) -> &AddressMap<RouteNode> {
        self.routes.map()
    }

    pub fn engine(&self) -> &RoutingEngine {
        &self.engine
    }

    pub fn best(&self, level: usize, dest: usize) -> Option<&Route> {
        self.routes.best(level, dest)
    }

    /// Best route towards the gnode that contains `target`
    pub fn route_to(&self, target: &Nip) -> Option<&Route> {
        let level = self.nip().highest_diff_level(target)?;
        self.routes.best(level, target.digit(level))
    }

    // ========================================================================
    // PROBING
    // ========================================================================

    /// Open a probe round: a bouquet of probes on every device
    pub fn begin_probe_round(&mut self, devices: &[Device], now_ms: u64) -> Vec<Outbound> {
        self.devices = devices
            .iter()
            .map(|d| (d.name.clone(), d.bandwidth_kbps))
            .collect();
        self.pending_probes.clear();
        self.neighbours.begin_round();

        let mut out = Vec::new();
        for device in devices {
            for _ in 0..self.config.probes_per_round {
                let seq = self.next_seq;
                self.next_seq = self.next_seq.wrapping_add(1);
                self.pending_probes.insert(seq, now_ms);
                out.push(Outbound::Broadcast {
                    device: device.name.clone(),
                    message: WireMessage::Probe {
                        seq,
                        nip: self.nip().clone(),
                    },
                });
            }
        }
        out
    }

    /// Close the probe round and react to neighbour changes
    pub fn end_probe_round(&mut self, now_ms: u64) -> NodeOutput {
        let events = self.neighbours.end_round(now_ms);
        let mut output = NodeOutput::default();
        for event in &events {
            if let NeighbourEvent::Removed { nip } = event {
                self.pending_contests.remove(nip);
            }
            let step = self
                .engine
                .on_neighbour_event(&mut self.routes, &self.neighbours, event);
            output.absorb(self.engine_output(step));
        }
        output
    }

    // ========================================================================
    // INBOUND FRAMES
    // ========================================================================

    /// Process one frame received on `device`
    ///
    /// Undecodable or malformed frames are rejected without touching state.
    pub fn handle_frame(&mut self, device: &str, frame: &[u8], now_ms: u64) -> Result<NodeOutput> {
        let message = decode_frame(frame)?;
        self.handle_message(device, message, now_ms)
    }

    pub fn handle_message(
        &mut self,
        device: &str,
        message: WireMessage,
        now_ms: u64,
    ) -> Result<NodeOutput> {
        let levels = self.config.levels;
        let group_size = self.config.group_size;
        let mut output = NodeOutput::default();

        match message {
            WireMessage::Probe { seq, nip } => {
                if !nip.is_valid(levels, group_size) {
                    return Err(MeshError::Protocol(format!("probe from invalid address {}", nip)));
                }
                if &nip == self.nip() {
                    return Ok(output);
                }
                output.outbound.push(Outbound::Unicast {
                    device: device.to_string(),
                    to: nip,
                    message: WireMessage::ProbeReply {
                        seq,
                        nip: self.nip().clone(),
                        netid: self.netid(),
                        bandwidth_kbps: self.device_bandwidth(device),
                    },
                });
            }
            WireMessage::ProbeReply {
                seq,
                nip,
                netid,
                bandwidth_kbps,
            } => {
                if !nip.is_valid(levels, group_size) || bandwidth_kbps.is_nan() || bandwidth_kbps < 0.0 {
                    return Err(MeshError::Protocol(format!("malformed probe reply from {}", nip)));
                }
                let Some(&sent_at) = self.pending_probes.get(&seq) else {
                    debug!("Probe reply {} from {} outside the current round", seq, nip);
                    return Ok(output);
                };
                let sample = Rem::new(
                    now_ms.saturating_sub(sent_at) as f64,
                    self.device_bandwidth(device),
                    bandwidth_kbps,
                );
                self.neighbours
                    .record_reply(device, nip, netid, sample, now_ms);
            }
            WireMessage::Tracer(tracer) => {
                tracer.validate(levels, group_size)?;
                output = self.handle_tracer(&tracer);
            }
            WireMessage::Contest(remote) => {
                if !remote.is_valid(levels, group_size) {
                    return Err(MeshError::Protocol(format!("malformed contest from {}", remote.nip)));
                }
                let local = self.contest_info();
                output.outbound.push(Outbound::Unicast {
                    device: device.to_string(),
                    to: remote.nip.clone(),
                    message: WireMessage::ContestReply(local.clone()),
                });
                if remote.netid != self.netid() {
                    let (_, step) = self.settle(&local, &remote)?;
                    output.absorb(step);
                }
            }
            WireMessage::ContestReply(remote) => {
                if !remote.is_valid(levels, group_size) {
                    return Err(MeshError::Protocol(format!("malformed contest reply from {}", remote.nip)));
                }
                output.contest_replies.push(remote);
            }
        }
        Ok(output)
    }

    fn handle_tracer(&mut self, tracer: &TracerMessage) -> NodeOutput {
        let step = self
            .engine
            .on_tracer(&mut self.routes, &self.neighbours, tracer);
        self.engine_output(step)
    }

    fn device_bandwidth(&self, device: &str) -> f64 {
        self.devices.get(device).copied().unwrap_or(0.0)
    }

    // Address engine tracers to the device their recipient is reachable on
    fn engine_output(&self, step: EngineOutput) -> NodeOutput {
        let mut output = NodeOutput {
            route_changes: step.changes,
            contests: step.contests,
            aborted: step.aborted,
            ..Default::default()
        };
        for tracer in step.tracers {
            match self.neighbours.best_device(&tracer.to) {
                Some(device) => output.outbound.push(Outbound::Unicast {
                    device: device.clone(),
                    to: tracer.to,
                    message: WireMessage::Tracer(tracer.message),
                }),
                None => debug!("No device towards {}, tracer dropped", tracer.to),
            }
        }
        output
    }

    // ========================================================================
    // COLLISION RECONCILIATION
    // ========================================================================

    pub fn contest_info(&self) -> ContestInfo {
        self.engine.contest_info(&self.routes)
    }

    /// Open a reconciliation with a contested neighbour
    pub fn start_reconcile(&mut self, peer: &Nip) -> Option<Outbound> {
        if !self.engine.contests().contains(peer) {
            return None;
        }
        let device = self.neighbours.best_device(peer)?.clone();
        let local = self.contest_info();
        self.pending_contests.insert(peer.clone(), local.clone());
        Some(Outbound::Unicast {
            device,
            to: peer.clone(),
            message: WireMessage::Contest(local),
        })
    }

    /// Finish a reconciliation with the peer's reply
    pub fn reconcile(&mut self, remote: &ContestInfo) -> Result<(ReconcileOutcome, NodeOutput)> {
        let local = match self.pending_contests.remove(&remote.nip) {
            Some(sent) => sent,
            None => self.contest_info(),
        };
        self.settle(&local, remote)
    }

    /// Give up on a reconciliation; the collision is raised again next round
    pub fn abort_reconcile(&mut self, peer: &Nip) {
        if self.pending_contests.remove(peer).is_some() {
            info!("Reconciliation with {} abandoned", peer);
        }
        self.neighbours.reset_collision(peer);
    }

    fn settle(
        &mut self,
        local: &ContestInfo,
        remote: &ContestInfo,
    ) -> Result<(ReconcileOutcome, NodeOutput)> {
        let (outcome, step) = self.engine.reconcile(&mut self.routes, local, remote)?;
        let mut output = self.engine_output(step);
        if let ReconcileOutcome::Renumbered { old, new, netid } = &outcome {
            self.neighbours.set_local(new.clone(), *netid);
            self.neighbours.reannounce_all();
            self.pending_contests.clear();
            output.renumbered = Some((old.clone(), new.clone()));
        }
        Ok((outcome, output))
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("engine", &self.engine)
            .field("neighbours", &self.neighbours)
            .field("routes", &self.routes)
            .finish()
    }
}
