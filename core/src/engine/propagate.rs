//! Route propagation
//!
//! The engine reacts to neighbour changes and inbound tracers, updates the
//! route table and produces the tracers to send next. Only destinations whose
//! best route changed are re-advertised, and never back to the neighbour the
//! change came from. A delta whose best route goes through the recipient is
//! sent to it as a withdrawal.
//!
//! Each level is either idle or has changed destinations queued for the next
//! flush. Every public entry point finishes its update and flushes before it
//! returns, so callers always observe idle levels.

use super::collision::{yields, ContestInfo, Contests, ReconcileOutcome};
use crate::address::Nip;
use crate::config::RoutingConfig;
use crate::error::Result;
use crate::neighbour::{NeighbourEvent, NeighbourTable};
use crate::protocol::{DeltaEntry, LevelDelta, TracerMessage, TrailHop, MAX_HOPS};
use crate::route::{Metric, Rem, Route, RouteTable};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelState {
    Idle,
    /// Changed destinations are queued for propagation
    Propagating,
}

/// Best-route notification for the forwarding layer
#[derive(Debug, Clone, PartialEq)]
pub struct RouteChange {
    pub level: usize,
    pub dest: usize,
    /// New best route, `None` when the destination became unreachable
    pub route: Option<Route>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundTracer {
    pub to: Nip,
    pub message: TracerMessage,
}

/// Everything an engine step wants done
#[derive(Debug, Default)]
pub struct EngineOutput {
    pub tracers: Vec<OutboundTracer>,
    pub changes: Vec<RouteChange>,
    /// Contested neighbours that need a reconciliation handshake
    pub contests: Vec<Nip>,
    /// Reconciliations abandoned because the neighbour went away
    pub aborted: Vec<Nip>,
}

impl EngineOutput {
    pub fn absorb(&mut self, other: EngineOutput) {
        self.tracers.extend(other.tracers);
        self.changes.extend(other.changes);
        self.contests.extend(other.contests);
        self.aborted.extend(other.aborted);
    }

    pub fn is_empty(&self) -> bool {
        self.tracers.is_empty()
            && self.changes.is_empty()
            && self.contests.is_empty()
            && self.aborted.is_empty()
    }
}

pub struct RoutingEngine {
    me: Nip,
    netid: u64,
    levels: usize,
    metric: Metric,
    contests: Contests,
    states: Vec<LevelState>,
    pending: Vec<BTreeSet<usize>>,
}

impl RoutingEngine {
    pub fn new(config: &RoutingConfig, me: Nip, netid: u64) -> Self {
        Self {
            me,
            netid,
            levels: config.levels,
            metric: Metric::from_config(config),
            contests: Contests::default(),
            states: vec![LevelState::Idle; config.levels],
            pending: vec![BTreeSet::new(); config.levels],
        }
    }

    pub fn me(&self) -> &Nip {
        &self.me
    }

    pub fn netid(&self) -> u64 {
        self.netid
    }

    pub fn level_states(&self) -> &[LevelState] {
        &self.states
    }

    pub fn contests(&self) -> &Contests {
        &self.contests
    }

    // ========================================================================
    // NEIGHBOUR EVENTS
    // ========================================================================

    pub fn on_neighbour_event(
        &mut self,
        routes: &mut RouteTable,
        neighbours: &NeighbourTable,
        event: &NeighbourEvent,
    ) -> EngineOutput {
        match event {
            NeighbourEvent::Up { nip, rem } => self.neighbour_up(routes, neighbours, nip, *rem),
            NeighbourEvent::QualityChanged { nip, new, .. } => {
                let mut changed = routes.rebase_gateway(nip, *new);
                if let Some(level) = self.me.highest_diff_level(nip) {
                    let gnode = (level, nip.digit(level));
                    if !changed.contains(&gnode) {
                        changed.push(gnode);
                    }
                }
                self.restore_direct(routes, neighbours, &changed);
                self.mark_all(changed);
                self.flush(routes, neighbours, None, self.fresh_trail())
            }
            NeighbourEvent::Removed { nip } => {
                let aborted = self.contests.clear(nip);
                let changed = routes.remove_via(nip);
                self.restore_direct(routes, neighbours, &changed);
                self.mark_all(changed);
                let mut out = self.flush(routes, neighbours, None, self.fresh_trail());
                if aborted {
                    info!("Reconciliation with {} aborted: neighbour removed", nip);
                    out.aborted.push(nip.clone());
                }
                out
            }
            NeighbourEvent::Collision { nip, netid } => {
                let gnode = nip.digit(self.levels - 1);
                if self.contests.mark(nip.clone(), *netid, gnode) {
                    warn!(
                        "Top-level gnode {} contested by {} (netid {:016x})",
                        gnode, nip, netid
                    );
                    let changed = routes.suspend_gateway(nip);
                    self.mark_all(changed);
                }
                let mut out = self.flush(routes, neighbours, None, self.fresh_trail());
                out.contests.push(nip.clone());
                out
            }
        }
    }

    fn neighbour_up(
        &mut self,
        routes: &mut RouteTable,
        neighbours: &NeighbourTable,
        nip: &Nip,
        rem: Rem,
    ) -> EngineOutput {
        if self.contests.clear(nip) {
            info!("Collision with {} resolved", nip);
            let resumed = routes.resume_gateway(nip);
            self.mark_all(resumed);
        }

        let Some(level) = self.me.highest_diff_level(nip) else {
            warn!("Neighbour claims our own address {}", nip);
            return EngineOutput::default();
        };
        let dest = nip.digit(level);
        match routes.apply(level, dest, Route::direct(nip.clone(), rem)) {
            Ok(up) if up.best_changed => self.mark(level, dest),
            Ok(_) => {}
            Err(e) => warn!("Direct route to {} rejected: {}", nip, e),
        }

        let mut out = self.flush(routes, neighbours, None, self.fresh_trail());
        if let Some(tracer) = self.bootstrap(routes, nip) {
            debug!(
                "Bootstrapping {} with {} routes",
                nip,
                tracer.message.entry_count()
            );
            out.tracers.push(tracer);
        }
        out
    }

    // Offer again the direct routes of usable neighbours inside `gnodes`. Above
    // level 0 the table keeps a single candidate, so a second neighbour in the
    // same foreign gnode is only stored once the better one is gone.
    fn restore_direct(
        &mut self,
        routes: &mut RouteTable,
        neighbours: &NeighbourTable,
        gnodes: &[(usize, usize)],
    ) {
        for peer in neighbours.usable() {
            if self.contests.contains(&peer) {
                continue;
            }
            let Some(level) = self.me.highest_diff_level(&peer) else {
                continue;
            };
            let dest = peer.digit(level);
            if !gnodes.contains(&(level, dest)) {
                continue;
            }
            let Some(link) = neighbours.link_rem(&peer) else {
                continue;
            };
            match routes.apply(level, dest, Route::direct(peer.clone(), link)) {
                Ok(up) if up.best_changed => self.mark(level, dest),
                Ok(_) => {}
                Err(e) => warn!("Direct route to {} rejected: {}", peer, e),
            }
        }
    }

    // One-off tracer with our current best routes for a new neighbour
    fn bootstrap(&self, routes: &RouteTable, peer: &Nip) -> Option<OutboundTracer> {
        let k = self.me.highest_diff_level(peer)?;
        let entries: Vec<(usize, DeltaEntry)> = routes
            .best_routes()
            .into_iter()
            .filter(|(level, dest, route)| {
                *level >= k && *dest != peer.digit(*level) && &route.gateway != peer
            })
            .map(|(level, dest, route)| {
                (level, DeltaEntry::reachable(dest, route.rem(), route.hops))
            })
            .collect();
        if entries.is_empty() {
            return None;
        }
        Some(self.tracer_to(peer, group_by_level(entries), self.fresh_trail(), false))
    }

    // ========================================================================
    // INBOUND TRACERS
    // ========================================================================

    /// Merge a validated tracer
    pub fn on_tracer(
        &mut self,
        routes: &mut RouteTable,
        neighbours: &NeighbourTable,
        msg: &TracerMessage,
    ) -> EngineOutput {
        let sender = &msg.sender;
        if msg.netid != self.netid {
            debug!("Dropping tracer from {} with foreign netid", sender);
            return EngineOutput::default();
        }
        if self.contests.contains(sender) {
            debug!("Dropping tracer from contested neighbour {}", sender);
            return EngineOutput::default();
        }
        let Some(link) = neighbours.link_rem(sender) else {
            debug!("Dropping tracer from non-neighbour {}", sender);
            return EngineOutput::default();
        };
        let Some(k) = self.me.highest_diff_level(sender) else {
            return EngineOutput::default();
        };

        let arrival = msg.trail_cost() + self.metric.cost(&link);
        let top = self.levels - 1;
        let mut interested: Vec<(usize, usize, Option<Rem>)> = Vec::new();

        for delta in &msg.deltas {
            let level = delta.level;
            // Below the divergence level the sender talks about its own gnode
            if level < k {
                continue;
            }
            let looped = self.trail_loops(&msg.trail, level, arrival);

            for entry in &delta.entries {
                let dest = entry.dest;
                if dest == self.me.digit(level) {
                    continue;
                }
                if level == top && self.contests.is_contested_gnode(dest) {
                    continue;
                }

                let advertised = entry.rem.filter(|_| entry.hops < MAX_HOPS);
                let result = match advertised {
                    Some(_) if looped => continue,
                    Some(rem) => routes.apply(
                        level,
                        dest,
                        Route {
                            gateway: sender.clone(),
                            advertised: rem,
                            link,
                            hops: entry.hops + 1,
                        },
                    ),
                    None => routes.withdraw(level, dest, sender),
                };

                match result {
                    Ok(up) => {
                        if up.best_changed {
                            self.mark(level, dest);
                        }
                        if up.entry_changed && msg.interest {
                            interested.push((level, dest, advertised));
                        }
                    }
                    Err(e) => warn!("Delta ({}, {}) from {} rejected: {}", level, dest, sender, e),
                }
            }
        }

        let mut trail = msg.trail.clone();
        trail.push(TrailHop {
            nip: self.me.clone(),
            cost: arrival,
        });
        let mut out = self.flush(routes, neighbours, Some(sender), trail);
        if let Some(reply) = self.interest_reply(routes, sender, &interested) {
            out.tracers.push(reply);
        }
        out
    }

    // True if the change left our level-`level` gnode and came back into it
    fn trail_loops(&self, trail: &[TrailHop], level: usize, arrival: f64) -> bool {
        let mut visited = false;
        for hop in trail {
            if self.me.same_gnode(&hop.nip, level) {
                if hop.cost <= arrival {
                    visited = true;
                }
            } else if visited {
                return true;
            }
        }
        false
    }

    // Tell the sender about strictly better routes we hold elsewhere
    fn interest_reply(
        &self,
        routes: &RouteTable,
        sender: &Nip,
        interested: &[(usize, usize, Option<Rem>)],
    ) -> Option<OutboundTracer> {
        let mut entries = Vec::new();
        for &(level, dest, advertised) in interested {
            let Some(best) = routes.best(level, dest) else {
                continue;
            };
            if &best.gateway == sender {
                continue;
            }
            let ours = best.rem();
            let better = match advertised {
                None => true,
                Some(theirs) => self.metric.cost(&ours) < self.metric.cost(&theirs),
            };
            if better {
                entries.push((level, DeltaEntry::reachable(dest, ours, best.hops)));
            }
        }
        if entries.is_empty() {
            return None;
        }
        Some(self.tracer_to(sender, group_by_level(entries), self.fresh_trail(), false))
    }

    // ========================================================================
    // PROPAGATION
    // ========================================================================

    fn mark(&mut self, level: usize, dest: usize) {
        self.pending[level].insert(dest);
        self.states[level] = LevelState::Propagating;
    }

    fn mark_all(&mut self, changed: Vec<(usize, usize)>) {
        for (level, dest) in changed {
            self.mark(level, dest);
        }
    }

    fn fresh_trail(&self) -> Vec<TrailHop> {
        vec![TrailHop {
            nip: self.me.clone(),
            cost: 0.0,
        }]
    }

    fn tracer_to(
        &self,
        peer: &Nip,
        deltas: Vec<LevelDelta>,
        trail: Vec<TrailHop>,
        interest: bool,
    ) -> OutboundTracer {
        OutboundTracer {
            to: peer.clone(),
            message: TracerMessage {
                sender: self.me.clone(),
                netid: self.netid,
                deltas,
                trail,
                interest,
            },
        }
    }

    // Drain queued destinations into route notifications and per-neighbour tracers
    fn flush(
        &mut self,
        routes: &RouteTable,
        neighbours: &NeighbourTable,
        origin: Option<&Nip>,
        trail: Vec<TrailHop>,
    ) -> EngineOutput {
        let mut changed = Vec::new();
        for level in 0..self.levels {
            for dest in std::mem::take(&mut self.pending[level]) {
                changed.push((level, dest));
            }
            self.states[level] = LevelState::Idle;
        }

        let mut out = EngineOutput::default();
        if changed.is_empty() {
            return out;
        }
        out.changes = changed
            .iter()
            .map(|&(level, dest)| RouteChange {
                level,
                dest,
                route: routes.best(level, dest).cloned(),
            })
            .collect();

        if trail.len() > MAX_HOPS as usize {
            debug!("Trail exhausted, {} changes not forwarded", changed.len());
            return out;
        }

        for peer in neighbours.usable() {
            if origin == Some(&peer) || self.contests.contains(&peer) {
                continue;
            }
            let Some(k) = self.me.highest_diff_level(&peer) else {
                continue;
            };
            let entries: Vec<(usize, DeltaEntry)> = changed
                .iter()
                .filter(|&&(level, dest)| level >= k && dest != peer.digit(level))
                .map(|&(level, dest)| {
                    let entry = match routes.best(level, dest) {
                        Some(route) if route.gateway != peer => {
                            DeltaEntry::reachable(dest, route.rem(), route.hops)
                        }
                        _ => DeltaEntry::withdrawn(dest),
                    };
                    (level, entry)
                })
                .collect();
            if entries.is_empty() {
                continue;
            }
            out.tracers
                .push(self.tracer_to(&peer, group_by_level(entries), trail.clone(), true));
        }
        out
    }

    // ========================================================================
    // COLLISION RECONCILIATION
    // ========================================================================

    /// What we announce in a reconciliation handshake
    pub fn contest_info(&self, routes: &RouteTable) -> ContestInfo {
        let top = self.levels - 1;
        let mut occupied: Vec<usize> = routes
            .best_routes()
            .into_iter()
            .filter(|(level, _, _)| *level == top)
            .map(|(_, dest, _)| dest)
            .collect();
        occupied.push(self.me.digit(top));
        occupied.sort_unstable();
        occupied.dedup();
        ContestInfo {
            nip: self.me.clone(),
            netid: self.netid,
            size: routes.reachable_count() as u64,
            occupied,
        }
    }

    /// Settle a collision with `remote`
    ///
    /// The yielding side moves to the lowest top-level id that is free in its
    /// own map and in the peer's fragment, drops every route and adopts the
    /// peer's netid. Fails with `ResourceExhausted` when no such id is left.
    pub fn reconcile(
        &mut self,
        routes: &mut RouteTable,
        local: &ContestInfo,
        remote: &ContestInfo,
    ) -> Result<(ReconcileOutcome, EngineOutput)> {
        if !self.contests.contains(&remote.nip) {
            debug!("No open contest with {}", remote.nip);
            return Ok((ReconcileOutcome::Aborted, EngineOutput::default()));
        }
        if remote.netid == self.netid {
            debug!("Already sharing netid with {}", remote.nip);
            return Ok((ReconcileOutcome::Aborted, EngineOutput::default()));
        }
        if !yields(local, remote) {
            info!(
                "Collision with {}: peer yields (sizes {} vs {})",
                remote.nip, local.size, remote.size
            );
            return Ok((ReconcileOutcome::PeerYields, EngineOutput::default()));
        }

        let top = self.levels - 1;
        let mut taken = remote.occupied.clone();
        taken.push(remote.nip.digit(top));
        taken.push(self.me.digit(top));
        let new_id = routes.map().lowest_free(top, &taken)?;
        let old = self.me.clone();
        let new = old.with_digit(top, new_id);
        let cleared = routes.reset(new.clone())?;

        warn!(
            "Renumbering {} -> {} and adopting netid {:016x}",
            old, new, remote.netid
        );
        self.me = new.clone();
        self.netid = remote.netid;
        self.contests.clear_all();
        for level in 0..self.levels {
            self.pending[level].clear();
            self.states[level] = LevelState::Idle;
        }

        let out = EngineOutput {
            changes: cleared
                .into_iter()
                .map(|(level, dest)| RouteChange {
                    level,
                    dest,
                    route: None,
                })
                .collect(),
            ..Default::default()
        };
        Ok((
            ReconcileOutcome::Renumbered {
                old,
                new,
                netid: remote.netid,
            },
            out,
        ))
    }
}

fn group_by_level(entries: Vec<(usize, DeltaEntry)>) -> Vec<LevelDelta> {
    let mut levels: BTreeMap<usize, Vec<DeltaEntry>> = BTreeMap::new();
    for (level, entry) in entries {
        levels.entry(level).or_default().push(entry);
    }
    levels
        .into_iter()
        .map(|(level, entries)| LevelDelta { level, entries })
        .collect()
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("me", &self.me)
            .field("netid", &self.netid)
            .field("states", &self.states)
            .field("contests", &self.contests)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;

    const NETID: u64 = 0x5eed;

    fn config() -> RoutingConfig {
        RoutingConfig {
            levels: 3,
            group_size: 16,
            ..Default::default()
        }
    }

    fn nip(d: [u16; 3]) -> Nip {
        Nip::new(d.to_vec())
    }

    fn link(rtt: f64) -> Rem {
        Rem::new(rtt, 10_000.0, 10_000.0)
    }

    struct Harness {
        routes: RouteTable,
        neighbours: NeighbourTable,
        engine: RoutingEngine,
        now: u64,
    }

    impl Harness {
        fn new(me: Nip) -> Self {
            let config = config();
            Self {
                routes: RouteTable::new(&config, me.clone()).unwrap(),
                neighbours: NeighbourTable::new(&config, me.clone(), NETID),
                engine: RoutingEngine::new(&config, me, NETID),
                now: 0,
            }
        }

        // One probe round in which the given peers answer
        fn round(&mut self, peers: &[(Nip, u64, f64)]) -> EngineOutput {
            self.now += 1000;
            self.neighbours.begin_round();
            for (peer, netid, rtt) in peers {
                self.neighbours
                    .record_reply("eth0", peer.clone(), *netid, link(*rtt), self.now);
            }
            let events = self.neighbours.end_round(self.now + 400);
            let mut out = EngineOutput::default();
            for event in &events {
                out.absorb(
                    self.engine
                        .on_neighbour_event(&mut self.routes, &self.neighbours, event),
                );
            }
            out
        }

        fn tracer(&mut self, msg: &TracerMessage) -> EngineOutput {
            self.engine
                .on_tracer(&mut self.routes, &self.neighbours, msg)
        }
    }

    fn tracer(sender: Nip, deltas: Vec<LevelDelta>) -> TracerMessage {
        TracerMessage {
            trail: vec![TrailHop {
                nip: sender.clone(),
                cost: 0.0,
            }],
            sender,
            netid: NETID,
            deltas,
            interest: true,
        }
    }

    fn level0(entries: Vec<DeltaEntry>) -> Vec<LevelDelta> {
        vec![LevelDelta { level: 0, entries }]
    }

    fn sent_to<'a>(out: &'a EngineOutput, peer: &Nip) -> Vec<&'a TracerMessage> {
        out.tracers
            .iter()
            .filter(|t| &t.to == peer)
            .map(|t| &t.message)
            .collect()
    }

    #[test]
    fn test_neighbour_up_adds_direct_route() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let a = nip([1, 0, 0]);
        let out = h.round(&[(a.clone(), NETID, 10.0)]);

        let best = h.routes.best(0, 1).unwrap();
        assert_eq!(best.gateway, a);
        assert_eq!(best.hops, 1);
        assert_eq!(out.changes.len(), 1);
        assert_eq!(out.changes[0].route.as_ref().unwrap().gateway, a);
        assert!(h.engine.level_states().iter().all(|s| *s == LevelState::Idle));
    }

    #[test]
    fn test_neighbour_in_other_gnode_routes_upper_level() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let far = nip([5, 3, 0]);
        h.round(&[(far.clone(), NETID, 10.0)]);

        assert!(h.routes.best(0, 5).is_none());
        assert_eq!(h.routes.best(1, 3).unwrap().gateway, far);
    }

    #[test]
    fn test_changes_propagate_to_other_neighbours() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let a = nip([1, 0, 0]);
        let b = nip([2, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0)]);
        let out = h.round(&[(a.clone(), NETID, 10.0), (b.clone(), NETID, 20.0)]);

        // a learns about b
        let to_a = sent_to(&out, &a);
        assert_eq!(to_a.len(), 1);
        assert_eq!(to_a[0].deltas[0].entries[0].dest, 2);
        assert!(to_a[0].interest);

        // b is bootstrapped with the route to a
        let to_b = sent_to(&out, &b);
        assert_eq!(to_b.len(), 1);
        assert!(!to_b[0].interest);
        assert_eq!(to_b[0].deltas[0].entries[0].dest, 1);
    }

    #[test]
    fn test_tracer_merge_costs_and_hops() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let a = nip([1, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0)]);

        let msg = tracer(
            a.clone(),
            level0(vec![DeltaEntry::reachable(7, link(5.0), 2)]),
        );
        let out = h.tracer(&msg);

        let best = h.routes.best(0, 7).unwrap();
        assert_eq!(best.gateway, a);
        assert_eq!(best.hops, 3);
        assert_eq!(best.rem().rtt_ms, 15.0);
        assert_eq!(out.changes.len(), 1);
        // The only neighbour is the origin
        assert!(out.tracers.is_empty());
    }

    #[test]
    fn test_replayed_tracer_is_fixpoint() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let a = nip([1, 0, 0]);
        let b = nip([2, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0), (b.clone(), NETID, 10.0)]);

        let msg = tracer(
            a.clone(),
            level0(vec![DeltaEntry::reachable(7, link(5.0), 2)]),
        );
        let first = h.tracer(&msg);
        assert_eq!(sent_to(&first, &b).len(), 1);

        let second = h.tracer(&msg);
        assert!(second.is_empty());
    }

    #[test]
    fn test_poisoned_reverse() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let a = nip([1, 0, 0]);
        let b = nip([2, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0), (b.clone(), NETID, 10.0)]);

        let msg = tracer(
            b.clone(),
            level0(vec![DeltaEntry::reachable(7, link(5.0), 1)]),
        );
        h.tracer(&msg);

        // a offers a better path, which b hears about
        let msg = tracer(
            a.clone(),
            level0(vec![DeltaEntry::reachable(7, link(1.0), 1)]),
        );
        let out = h.tracer(&msg);
        assert_eq!(h.routes.best(0, 7).unwrap().gateway, a);
        let to_b = sent_to(&out, &b);
        assert_eq!(to_b[0].deltas[0].entries[0].rem.unwrap().rtt_ms, 11.0);

        // b's advertisement is now worse than ours; when a withdraws, the best
        // goes through b and b gets poisoned
        let msg = tracer(a.clone(), level0(vec![DeltaEntry::withdrawn(7)]));
        let out = h.tracer(&msg);
        assert_eq!(h.routes.best(0, 7).unwrap().gateway, b);
        let to_b = sent_to(&out, &b);
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].deltas[0].entries[0], DeltaEntry::withdrawn(7));
        assert!(sent_to(&out, &a).iter().all(|m| !m.interest));
    }

    #[test]
    fn test_interest_reply_offers_better_route() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let a = nip([1, 0, 0]);
        let b = nip([2, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0), (b.clone(), NETID, 10.0)]);

        h.tracer(&tracer(
            b.clone(),
            level0(vec![DeltaEntry::reachable(7, link(5.0), 1)]),
        ));
        // a advertises a much worse path to 7
        let out = h.tracer(&tracer(
            a.clone(),
            level0(vec![DeltaEntry::reachable(7, link(500.0), 4)]),
        ));

        let to_a = sent_to(&out, &a);
        assert_eq!(to_a.len(), 1);
        assert!(!to_a[0].interest);
        assert_eq!(to_a[0].deltas[0].entries[0].rem.unwrap().rtt_ms, 15.0);
        assert_eq!(to_a[0].deltas[0].entries[0].hops, 2);
    }

    #[test]
    fn test_ignores_levels_below_divergence() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let far = nip([4, 2, 0]);
        h.round(&[(far.clone(), NETID, 10.0)]);

        let msg = tracer(
            far.clone(),
            vec![
                LevelDelta {
                    level: 0,
                    entries: vec![DeltaEntry::reachable(9, link(1.0), 1)],
                },
                LevelDelta {
                    level: 1,
                    entries: vec![DeltaEntry::reachable(6, link(1.0), 1)],
                },
            ],
        );
        h.tracer(&msg);
        assert!(h.routes.best(0, 9).is_none());
        assert_eq!(h.routes.best(1, 6).unwrap().gateway, far);
    }

    #[test]
    fn test_drops_tracer_from_unknown_or_foreign_sender() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let stranger = nip([3, 0, 0]);
        let out = h.tracer(&tracer(
            stranger,
            level0(vec![DeltaEntry::reachable(7, link(1.0), 1)]),
        ));
        assert!(out.is_empty());

        let a = nip([1, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0)]);
        let mut msg = tracer(a, level0(vec![DeltaEntry::reachable(7, link(1.0), 1)]));
        msg.netid = NETID + 1;
        assert!(h.tracer(&msg).is_empty());
        assert!(h.routes.best(0, 7).is_none());
    }

    #[test]
    fn test_trail_loop_suppresses_advertisements_only() {
        let me = nip([0, 0, 0]);
        let mut h = Harness::new(me.clone());
        let a = nip([1, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0)]);

        let mut msg = tracer(a.clone(), level0(vec![DeltaEntry::reachable(7, link(1.0), 3)]));
        msg.trail = vec![
            TrailHop { nip: me.clone(), cost: 0.0 },
            TrailHop { nip: nip([5, 0, 0]), cost: 0.001 },
            TrailHop { nip: a.clone(), cost: 0.002 },
        ];
        assert!(h.tracer(&msg).is_empty());
        assert!(h.routes.best(0, 7).is_none());

        // Withdrawals pass through
        h.tracer(&tracer(a.clone(), level0(vec![DeltaEntry::reachable(7, link(1.0), 1)])));
        assert!(h.routes.best(0, 7).is_some());
        msg.deltas = level0(vec![DeltaEntry::withdrawn(7)]);
        h.tracer(&msg);
        assert!(h.routes.best(0, 7).is_none());
    }

    #[test]
    fn test_hop_limit_withdraws() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let a = nip([1, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0)]);
        h.tracer(&tracer(a.clone(), level0(vec![DeltaEntry::reachable(7, link(1.0), 1)])));
        assert!(h.routes.best(0, 7).is_some());

        h.tracer(&tracer(
            a.clone(),
            level0(vec![DeltaEntry::reachable(7, link(1.0), MAX_HOPS)]),
        ));
        assert!(h.routes.best(0, 7).is_none());
    }

    #[test]
    fn test_removed_neighbour_falls_back() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let a = nip([1, 0, 0]);
        let b = nip([2, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0), (b.clone(), NETID, 10.0)]);
        h.tracer(&tracer(a.clone(), level0(vec![DeltaEntry::reachable(7, link(1.0), 1)])));
        h.tracer(&tracer(b.clone(), level0(vec![DeltaEntry::reachable(7, link(50.0), 1)])));
        assert_eq!(h.routes.best(0, 7).unwrap().gateway, a);

        let out = h.engine.on_neighbour_event(
            &mut h.routes,
            &h.neighbours,
            &NeighbourEvent::Removed { nip: a.clone() },
        );
        assert_eq!(h.routes.best(0, 7).unwrap().gateway, b);
        assert!(out
            .changes
            .iter()
            .any(|c| c.level == 0 && c.dest == 1 && c.route.is_none()));
    }

    #[test]
    fn test_collision_suspends_and_reconciles() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let a = nip([1, 0, 0]);
        let foreign = nip([2, 0, 0]);
        h.round(&[(a.clone(), NETID, 10.0)]);

        let out = h.round(&[(a.clone(), NETID, 10.0), (foreign.clone(), 0xffff, 10.0)]);
        assert_eq!(out.contests, vec![foreign.clone()]);
        assert!(h.engine.contests().is_contested_gnode(0));
        assert!(h.routes.best(0, 2).is_none());

        // The peer's fragment is larger: we yield
        let local = h.engine.contest_info(&h.routes);
        assert_eq!(local.size, 1);
        let remote = ContestInfo {
            nip: foreign.clone(),
            netid: 0xffff,
            size: 10,
            occupied: vec![0],
        };
        let (outcome, out) = h.engine.reconcile(&mut h.routes, &local, &remote).unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Renumbered {
                old: nip([0, 0, 0]),
                new: nip([0, 0, 1]),
                netid: 0xffff
            }
        );
        assert_eq!(h.engine.netid(), 0xffff);
        assert_eq!(h.routes.reachable_count(), 0);
        assert_eq!(out.changes.len(), 1);
    }

    #[test]
    fn test_renumbering_skips_gnodes_of_the_winner() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let foreign = nip([2, 0, 0]);
        h.round(&[(foreign.clone(), 0xffff, 10.0)]);

        let local = h.engine.contest_info(&h.routes);
        assert_eq!(local.occupied, vec![0]);
        let remote = ContestInfo {
            nip: foreign,
            netid: 0xffff,
            size: 10,
            occupied: vec![0, 1, 2, 4],
        };
        let (outcome, _) = h.engine.reconcile(&mut h.routes, &local, &remote).unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Renumbered {
                old: nip([0, 0, 0]),
                new: nip([0, 0, 3]),
                netid: 0xffff
            }
        );
    }

    #[test]
    fn test_renumbering_fails_when_top_level_is_full() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let foreign = nip([2, 0, 0]);
        h.round(&[(foreign.clone(), 0xffff, 10.0)]);

        let local = h.engine.contest_info(&h.routes);
        let remote = ContestInfo {
            nip: foreign.clone(),
            netid: 0xffff,
            size: 10,
            occupied: (0..16).collect(),
        };
        let result = h.engine.reconcile(&mut h.routes, &local, &remote);
        assert!(matches!(result, Err(MeshError::ResourceExhausted { level: 2 })));
        assert_eq!(h.engine.me(), &nip([0, 0, 0]));
        assert!(h.engine.contests().contains(&foreign));
    }

    #[test]
    fn test_contest_info_lists_known_top_level_gnodes() {
        let mut h = Harness::new(nip([0, 0, 1]));
        h.round(&[(nip([0, 0, 3]), NETID, 10.0), (nip([1, 0, 1]), NETID, 10.0)]);
        let info = h.engine.contest_info(&h.routes);
        assert_eq!(info.occupied, vec![1, 3]);
        assert_eq!(info.size, 2);
    }

    #[test]
    fn test_removed_gateway_falls_back_to_other_neighbour_in_same_gnode() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let near = nip([1, 4, 0]);
        let far = nip([2, 4, 0]);
        h.round(&[(near.clone(), NETID, 10.0), (far.clone(), NETID, 100.0)]);
        // One candidate per foreign gnode above level 0
        assert_eq!(h.routes.routes(1, 4).len(), 1);
        assert_eq!(h.routes.best(1, 4).unwrap().gateway, near);

        // near goes silent and is removed after three missed rounds
        let mut changes = Vec::new();
        for _ in 0..3 {
            changes.extend(h.round(&[(far.clone(), NETID, 100.0)]).changes);
        }
        assert!(h.neighbours.get(&near).is_none());
        assert_eq!(h.routes.best(1, 4).unwrap().gateway, far);
        let last = changes.iter().rev().find(|c| c.level == 1 && c.dest == 4).unwrap();
        assert_eq!(last.route.as_ref().unwrap().gateway, far);
    }

    #[test]
    fn test_reconcile_without_contest_is_aborted() {
        let mut h = Harness::new(nip([0, 0, 0]));
        let local = h.engine.contest_info(&h.routes);
        let remote = ContestInfo {
            nip: nip([2, 0, 0]),
            netid: 0xffff,
            size: 10,
            occupied: vec![0],
        };
        let (outcome, out) = h.engine.reconcile(&mut h.routes, &local, &remote).unwrap();
        assert_eq!(outcome, ReconcileOutcome::Aborted);
        assert!(out.is_empty());
    }
}
