//! Neighbour table
//!
//! Tracks the directly reachable peers discovered by probing. Each probe round
//! collects replies through `record_reply`; `end_round` folds the samples into
//! the link estimates, drives the per-neighbour state machine and reports what
//! changed:
//!
//! ```text
//! Discovered ──reply──▶ Active ──missed──▶ Stale ──missed × N──▶ removed
//!                         ▲                  │
//!                         └──────reply───────┘
//! ```

use super::quality::{LinkQuality, RoundSamples};
use crate::address::Nip;
use crate::config::RoutingConfig;
use crate::route::{Metric, Rem};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Name of a local link device
pub type DeviceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighbourState {
    /// First reply seen, round not closed yet
    Discovered,
    /// Replying every round
    Active,
    /// Missed at least one round
    Stale,
}

/// Changes reported to the routing engine
#[derive(Debug, Clone, PartialEq)]
pub enum NeighbourEvent {
    /// Neighbour became usable with the given link quality
    Up { nip: Nip, rem: Rem },
    /// Link quality moved beyond the configured ratio
    QualityChanged { nip: Nip, old: Rem, new: Rem },
    /// Neighbour went silent or was evicted
    Removed { nip: Nip },
    /// Neighbour claims a different network id
    Collision { nip: Nip, netid: u64 },
}

#[derive(Debug, Clone)]
pub struct Neighbour {
    pub nip: Nip,
    pub netid: u64,
    pub state: NeighbourState,
    pub best_device: Option<DeviceId>,
    pub last_seen_ms: u64,
    devices: BTreeMap<DeviceId, LinkQuality>,
    round: BTreeMap<DeviceId, RoundSamples>,
    missed_rounds: u32,
    reported: Option<Rem>,
    announced: bool,
    collided: bool,
}

impl Neighbour {
    fn new(nip: Nip, netid: u64, now_ms: u64) -> Self {
        Self {
            nip,
            netid,
            state: NeighbourState::Discovered,
            best_device: None,
            last_seen_ms: now_ms,
            devices: BTreeMap::new(),
            round: BTreeMap::new(),
            missed_rounds: 0,
            reported: None,
            announced: false,
            collided: false,
        }
    }

    /// Smoothed quality of every device that ever answered
    pub fn devices(&self) -> impl Iterator<Item = (&DeviceId, &LinkQuality)> {
        self.devices.iter()
    }

    /// Current estimate over the best device
    pub fn link_estimate(&self) -> Option<Rem> {
        self.best_device
            .as_ref()
            .and_then(|d| self.devices.get(d))
            .and_then(|q| q.estimate())
    }

    /// Link quality last reported to the engine
    pub fn reported_rem(&self) -> Option<Rem> {
        self.reported
    }

    pub fn missed_rounds(&self) -> u32 {
        self.missed_rounds
    }

    pub fn is_collided(&self) -> bool {
        self.collided
    }

    /// Announced with a matching network id
    pub fn is_usable(&self) -> bool {
        self.announced && !self.collided
    }
}

pub struct NeighbourTable {
    me: Nip,
    netid: u64,
    metric: Metric,
    neighbours: BTreeMap<Nip, Neighbour>,
    stale_after_missed: u32,
    remove_after_missed: u32,
    max_neighbours: usize,
    quality_change_ratio: f64,
}

impl NeighbourTable {
    pub fn new(config: &RoutingConfig, me: Nip, netid: u64) -> Self {
        Self {
            me,
            netid,
            metric: Metric::from_config(config),
            neighbours: BTreeMap::new(),
            stale_after_missed: config.stale_after_missed,
            remove_after_missed: config.remove_after_missed,
            max_neighbours: config.max_neighbours,
            quality_change_ratio: config.quality_change_ratio,
        }
    }

    /// Update the local identity after renumbering or adopting a network id
    pub fn set_local(&mut self, me: Nip, netid: u64) {
        self.me = me;
        self.netid = netid;
    }

    pub fn netid(&self) -> u64 {
        self.netid
    }

    /// Start a probe round; samples of the previous round are discarded
    pub fn begin_round(&mut self) {
        for n in self.neighbours.values_mut() {
            n.round.clear();
        }
    }

    /// Record one probe reply
    ///
    /// Creates the neighbour on its first reply. Returns false for replies
    /// claiming our own address.
    pub fn record_reply(
        &mut self,
        device: &str,
        nip: Nip,
        netid: u64,
        sample: Rem,
        now_ms: u64,
    ) -> bool {
        if nip == self.me {
            debug!("Ignoring probe reply carrying our own address {}", nip);
            return false;
        }

        let n = self.neighbours.entry(nip.clone()).or_insert_with(|| {
            debug!("Discovered neighbour {} on {}", nip, device);
            Neighbour::new(nip.clone(), netid, now_ms)
        });
        n.netid = netid;
        n.last_seen_ms = now_ms;
        n.round.entry(device.to_string()).or_default().record(&sample);
        true
    }

    /// Close the current probe round and report the resulting changes
    pub fn end_round(&mut self, now_ms: u64) -> Vec<NeighbourEvent> {
        let mut replied = BTreeSet::new();
        let mut silent = Vec::new();

        for (nip, n) in self.neighbours.iter_mut() {
            let round = std::mem::take(&mut n.round);
            let answered: Vec<(DeviceId, Rem)> = round
                .into_iter()
                .filter_map(|(dev, samples)| samples.average().map(|avg| (dev, avg)))
                .collect();

            if answered.is_empty() {
                n.missed_rounds += 1;
                if n.missed_rounds >= self.remove_after_missed {
                    silent.push(nip.clone());
                } else if n.missed_rounds >= self.stale_after_missed
                    && n.state == NeighbourState::Active
                {
                    debug!(
                        "Neighbour {} is stale, silent for {} ms",
                        nip,
                        now_ms.saturating_sub(n.last_seen_ms)
                    );
                    n.state = NeighbourState::Stale;
                }
                continue;
            }

            let mut best: Option<(DeviceId, f64)> = None;
            for (dev, avg) in answered {
                let estimate = n.devices.entry(dev.clone()).or_default().update(&self.metric, avg);
                let cost = self.metric.cost(&estimate);
                if best.as_ref().map(|(_, c)| cost < *c).unwrap_or(true) {
                    best = Some((dev, cost));
                }
            }
            n.best_device = best.map(|(dev, _)| dev);
            n.missed_rounds = 0;
            if n.state != NeighbourState::Active {
                debug!("Neighbour {} is active", nip);
                n.state = NeighbourState::Active;
            }
            replied.insert(nip.clone());
        }

        let mut events = Vec::new();
        for nip in silent {
            self.drop_neighbour(&nip, "silent", &mut events);
        }
        while self.neighbours.len() > self.max_neighbours {
            let Some(worst) = self.worst_neighbour() else {
                break;
            };
            self.drop_neighbour(&worst, "evicted", &mut events);
        }

        for nip in replied {
            let Some(n) = self.neighbours.get_mut(&nip) else {
                continue;
            };
            let Some(current) = n.link_estimate() else {
                continue;
            };

            if n.netid != self.netid {
                if !n.collided {
                    warn!(
                        "Neighbour {} claims netid {:016x}, ours is {:016x}",
                        nip, n.netid, self.netid
                    );
                    n.collided = true;
                    n.announced = true;
                    events.push(NeighbourEvent::Collision {
                        nip: nip.clone(),
                        netid: n.netid,
                    });
                }
            } else if n.collided || !n.announced {
                info!("Neighbour {} up", nip);
                n.collided = false;
                n.announced = true;
                n.reported = Some(current);
                events.push(NeighbourEvent::Up {
                    nip: nip.clone(),
                    rem: current,
                });
            } else if let Some(old) = n.reported {
                let old_cost = self.metric.cost(&old);
                let new_cost = self.metric.cost(&current);
                if (new_cost - old_cost).abs() > self.quality_change_ratio * old_cost.max(f64::EPSILON) {
                    debug!(
                        "Neighbour {} link cost {:.4} -> {:.4}",
                        nip, old_cost, new_cost
                    );
                    n.reported = Some(current);
                    events.push(NeighbourEvent::QualityChanged {
                        nip: nip.clone(),
                        old,
                        new: current,
                    });
                }
            }
        }

        events
    }

    fn drop_neighbour(&mut self, nip: &Nip, reason: &str, events: &mut Vec<NeighbourEvent>) {
        if let Some(n) = self.neighbours.remove(nip) {
            info!("Neighbour {} removed ({})", nip, reason);
            if n.announced {
                events.push(NeighbourEvent::Removed { nip: nip.clone() });
            }
        }
    }

    // Highest link cost loses; neighbours without an estimate go first.
    fn worst_neighbour(&self) -> Option<Nip> {
        self.neighbours
            .values()
            .max_by(|a, b| {
                let ca = a.link_estimate().map(|r| self.metric.cost(&r)).unwrap_or(f64::INFINITY);
                let cb = b.link_estimate().map(|r| self.metric.cost(&r)).unwrap_or(f64::INFINITY);
                ca.total_cmp(&cb).then_with(|| a.nip.cmp(&b.nip))
            })
            .map(|n| n.nip.clone())
    }

    /// Forget that a collision was reported so the next round raises it again
    pub fn reset_collision(&mut self, nip: &Nip) {
        if let Some(n) = self.neighbours.get_mut(nip) {
            if n.collided {
                n.collided = false;
                n.announced = false;
            }
        }
    }

    /// Report every neighbour afresh at the next round
    pub fn reannounce_all(&mut self) {
        for n in self.neighbours.values_mut() {
            n.collided = false;
            n.announced = false;
        }
    }

    pub fn get(&self, nip: &Nip) -> Option<&Neighbour> {
        self.neighbours.get(nip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbour> {
        self.neighbours.values()
    }

    pub fn len(&self) -> usize {
        self.neighbours.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbours.is_empty()
    }

    /// Link cost used for routes through `nip`
    pub fn link_rem(&self, nip: &Nip) -> Option<Rem> {
        self.neighbours
            .get(nip)
            .filter(|n| n.is_usable())
            .and_then(|n| n.reported)
    }

    pub fn best_device(&self, nip: &Nip) -> Option<&DeviceId> {
        self.neighbours.get(nip).and_then(|n| n.best_device.as_ref())
    }

    /// Neighbours that take part in route propagation
    pub fn usable(&self) -> Vec<Nip> {
        self.neighbours
            .values()
            .filter(|n| n.is_usable())
            .map(|n| n.nip.clone())
            .collect()
    }
}

impl std::fmt::Debug for NeighbourTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighbourTable")
            .field("me", &self.me)
            .field("netid", &self.netid)
            .field("neighbours", &self.neighbours.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NETID: u64 = 0xfeed;

    fn config() -> RoutingConfig {
        RoutingConfig {
            levels: 2,
            group_size: 16,
            stale_after_missed: 1,
            remove_after_missed: 3,
            ..Default::default()
        }
    }

    fn nip(id: u16) -> Nip {
        Nip::new(vec![id, 0])
    }

    fn sample(rtt: f64) -> Rem {
        Rem::new(rtt, 10_000.0, 10_000.0)
    }

    fn table() -> NeighbourTable {
        NeighbourTable::new(&config(), nip(0), NETID)
    }

    #[test]
    fn test_state_machine() {
        let mut table = table();
        table.begin_round();
        assert!(table.record_reply("eth0", nip(1), NETID, sample(10.0), 100));
        assert_eq!(table.get(&nip(1)).unwrap().state, NeighbourState::Discovered);

        let events = table.end_round(400);
        assert_eq!(
            events,
            vec![NeighbourEvent::Up {
                nip: nip(1),
                rem: sample(10.0)
            }]
        );
        assert_eq!(table.get(&nip(1)).unwrap().state, NeighbourState::Active);
        assert_eq!(table.link_rem(&nip(1)), Some(sample(10.0)));

        // One silent round: stale, still present
        table.begin_round();
        assert!(table.end_round(1400).is_empty());
        assert_eq!(table.get(&nip(1)).unwrap().state, NeighbourState::Stale);

        // Reply brings it back without a new Up
        table.begin_round();
        table.record_reply("eth0", nip(1), NETID, sample(10.0), 2100);
        assert!(table.end_round(2400).is_empty());
        assert_eq!(table.get(&nip(1)).unwrap().state, NeighbourState::Active);

        // Three silent rounds remove it
        for round in 0..3u64 {
            table.begin_round();
            let events = table.end_round(3400 + round * 1000);
            if round < 2 {
                assert!(events.is_empty());
            } else {
                assert_eq!(events, vec![NeighbourEvent::Removed { nip: nip(1) }]);
            }
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_bouquet_is_averaged() {
        let mut table = table();
        table.begin_round();
        for rtt in [10.0, 20.0, 30.0, 40.0] {
            table.record_reply("eth0", nip(2), NETID, sample(rtt), 100);
        }
        table.end_round(400);
        assert_eq!(table.link_rem(&nip(2)).unwrap().rtt_ms, 25.0);
    }

    #[test]
    fn test_best_device_selection() {
        let mut table = table();
        table.begin_round();
        table.record_reply("wlan0", nip(3), NETID, sample(80.0), 100);
        table.record_reply("eth0", nip(3), NETID, sample(5.0), 100);
        table.end_round(400);

        assert_eq!(table.best_device(&nip(3)).map(String::as_str), Some("eth0"));
        assert_eq!(table.get(&nip(3)).unwrap().devices().count(), 2);
    }

    #[test]
    fn test_collision_reported_once() {
        let mut table = table();
        table.begin_round();
        table.record_reply("eth0", nip(4), 0xbad, sample(10.0), 100);
        let events = table.end_round(400);
        assert_eq!(
            events,
            vec![NeighbourEvent::Collision {
                nip: nip(4),
                netid: 0xbad
            }]
        );
        assert!(table.link_rem(&nip(4)).is_none());
        assert!(table.usable().is_empty());

        table.begin_round();
        table.record_reply("eth0", nip(4), 0xbad, sample(10.0), 1100);
        assert!(table.end_round(1400).is_empty());

        // After adopting the same netid the neighbour comes up
        table.set_local(nip(0), 0xbad);
        table.begin_round();
        table.record_reply("eth0", nip(4), 0xbad, sample(10.0), 2100);
        let events = table.end_round(2400);
        assert!(matches!(events.as_slice(), [NeighbourEvent::Up { .. }]));
        assert_eq!(table.usable(), vec![nip(4)]);
    }

    #[test]
    fn test_reset_collision_raises_again() {
        let mut table = table();
        table.begin_round();
        table.record_reply("eth0", nip(4), 0xbad, sample(10.0), 100);
        table.end_round(400);

        table.reset_collision(&nip(4));
        table.begin_round();
        table.record_reply("eth0", nip(4), 0xbad, sample(10.0), 1100);
        let events = table.end_round(1400);
        assert!(matches!(events.as_slice(), [NeighbourEvent::Collision { .. }]));
    }

    #[test]
    fn test_quality_change_threshold() {
        let mut table = table();
        table.begin_round();
        table.record_reply("eth0", nip(5), NETID, Rem::new(100.0, 1000.0, 1000.0), 100);
        table.end_round(400);

        // Small drift stays below the 10% ratio
        table.begin_round();
        table.record_reply("eth0", nip(5), NETID, Rem::new(102.0, 1000.0, 1000.0), 1100);
        assert!(table.end_round(1400).is_empty());

        // Latency spike is reported
        table.begin_round();
        table.record_reply("eth0", nip(5), NETID, Rem::new(30_000.0, 1000.0, 1000.0), 2100);
        let events = table.end_round(2400);
        assert!(matches!(
            events.as_slice(),
            [NeighbourEvent::QualityChanged { .. }]
        ));
    }

    #[test]
    fn test_neighbour_cap_evicts_worst() {
        let config = RoutingConfig {
            max_neighbours: 2,
            ..config()
        };
        let mut table = NeighbourTable::new(&config, nip(0), NETID);
        table.begin_round();
        table.record_reply("eth0", nip(1), NETID, sample(10.0), 100);
        table.record_reply("eth0", nip(2), NETID, sample(20.0), 100);
        table.end_round(400);

        table.begin_round();
        table.record_reply("eth0", nip(1), NETID, sample(10.0), 1100);
        table.record_reply("eth0", nip(2), NETID, sample(20.0), 1100);
        table.record_reply("eth0", nip(3), NETID, sample(500.0), 1100);
        table.record_reply("eth0", nip(4), NETID, sample(5.0), 1100);
        let events = table.end_round(1400);

        assert_eq!(table.len(), 2);
        assert!(table.get(&nip(1)).is_some());
        assert!(table.get(&nip(4)).is_some());
        // nip(2) had been announced, nip(3) never was
        assert!(events.contains(&NeighbourEvent::Removed { nip: nip(2) }));
        assert!(!events.contains(&NeighbourEvent::Removed { nip: nip(3) }));
        let newcomer = nip(4);
        assert!(events
            .iter()
            .any(|e| matches!(e, NeighbourEvent::Up { nip: n, .. } if *n == newcomer)));
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut table = table();
        table.begin_round();
        assert!(!table.record_reply("eth0", nip(0), NETID, sample(1.0), 100));
        assert!(table.end_round(400).is_empty());
        assert!(table.is_empty());
    }
}
