//! Ranked route table
//!
//! For every level and destination gnode the table keeps a short list of
//! candidate routes, best first. The list holds at most one route per gateway
//! and at most `max_routes` entries at level 0, `upper_level_routes` above it.
//!
//! Ranking is a total order: composite cost, then hop count, then gateway
//! address. Routes through suspended gateways stay in the list but are skipped
//! by `best()`.

use super::rem::{Metric, Rem, Route};
use crate::address::{AddressMap, Nip};
use crate::config::RoutingConfig;
use crate::error::Result;
use std::cmp::Ordering;
use std::collections::HashSet;

/// Candidate routes of one destination gnode
#[derive(Debug, Clone, Default)]
pub struct RouteNode {
    routes: Vec<Route>,
}

impl RouteNode {
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Result of inserting or withdrawing one route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Upsert {
    /// The stored candidate list changed
    pub entry_changed: bool,
    /// The route returned by `best()` changed
    pub best_changed: bool,
}

pub struct RouteTable {
    map: AddressMap<RouteNode>,
    metric: Metric,
    max_routes: usize,
    upper_level_routes: usize,
    suspended: HashSet<Nip>,
}

impl RouteTable {
    pub fn new(config: &RoutingConfig, me: Nip) -> Result<Self> {
        let mut map: AddressMap<RouteNode> = AddressMap::new(
            config.levels,
            config.group_size,
            Box::new(|_, _| RouteNode::default()),
        );
        map.set_me(me)?;
        Ok(Self {
            map,
            metric: Metric::from_config(config),
            max_routes: config.max_routes,
            upper_level_routes: config.upper_level_routes,
            suspended: HashSet::new(),
        })
    }

    pub fn map(&self) -> &AddressMap<RouteNode> {
        &self.map
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }

    pub fn levels(&self) -> usize {
        self.map.levels()
    }

    fn capacity(&self, level: usize) -> usize {
        if level == 0 {
            self.max_routes
        } else {
            self.upper_level_routes
        }
    }

    fn rank(&self, a: &Route, b: &Route) -> Ordering {
        self.metric
            .cost(&a.rem())
            .total_cmp(&self.metric.cost(&b.rem()))
            .then_with(|| a.hops.cmp(&b.hops))
            .then_with(|| a.gateway.cmp(&b.gateway))
    }

    fn sort(&self, routes: &mut [Route]) {
        routes.sort_by(|a, b| self.rank(a, b));
    }

    fn best_in<'a>(&self, routes: &'a [Route]) -> Option<&'a Route> {
        routes.iter().find(|r| !self.suspended.contains(&r.gateway))
    }

    /// Insert or refresh a route; returns whether the best route changed
    pub fn upsert(&mut self, level: usize, dest: usize, route: Route) -> Result<bool> {
        Ok(self.apply(level, dest, route)?.best_changed)
    }

    /// Insert or refresh a route
    ///
    /// A route from a gateway already present replaces that gateway's entry.
    /// A new gateway is added when there is room or it outranks the current
    /// worst entry, which is then evicted; otherwise it is discarded.
    pub fn apply(&mut self, level: usize, dest: usize, route: Route) -> Result<Upsert> {
        self.map.check(level, dest)?;
        let mut routes = self.take(level, dest);
        let before = self.best_in(&routes).cloned();

        let entry_changed = match routes.iter().position(|r| r.gateway == route.gateway) {
            Some(i) if routes[i] == route => false,
            Some(i) => {
                routes[i] = route;
                self.sort(&mut routes);
                true
            }
            None => {
                let gateway = route.gateway.clone();
                routes.push(route);
                self.sort(&mut routes);
                routes.truncate(self.capacity(level));
                routes.iter().any(|r| r.gateway == gateway)
            }
        };

        let best_changed = self.best_in(&routes).cloned() != before;
        self.store(level, dest, routes);
        Ok(Upsert {
            entry_changed,
            best_changed,
        })
    }

    /// Drop the route through `gateway`, if any
    pub fn withdraw(&mut self, level: usize, dest: usize, gateway: &Nip) -> Result<Upsert> {
        self.map.check(level, dest)?;
        let mut routes = self.take(level, dest);
        let before = self.best_in(&routes).cloned();

        let len = routes.len();
        routes.retain(|r| &r.gateway != gateway);
        let entry_changed = routes.len() != len;

        let best_changed = self.best_in(&routes).cloned() != before;
        self.store(level, dest, routes);
        Ok(Upsert {
            entry_changed,
            best_changed,
        })
    }

    /// Purge every route through `gateway`
    ///
    /// Returns the destinations whose best route changed.
    pub fn remove_via(&mut self, gateway: &Nip) -> Vec<(usize, usize)> {
        self.rewrite_gateway(gateway, |routes| routes.retain(|r| &r.gateway != gateway))
    }

    /// Replace the link cost of every route through `gateway`
    pub fn rebase_gateway(&mut self, gateway: &Nip, link: Rem) -> Vec<(usize, usize)> {
        self.rewrite_gateway(gateway, |routes| {
            for r in routes.iter_mut().filter(|r| &r.gateway == gateway) {
                r.link = link;
            }
        })
    }

    /// Exclude routes through `gateway` from `best()`
    pub fn suspend_gateway(&mut self, gateway: &Nip) -> Vec<(usize, usize)> {
        let touched = self.destinations_via(gateway);
        let before = self.bests(&touched);
        self.suspended.insert(gateway.clone());
        self.changed_since(touched, before)
    }

    /// Make routes through `gateway` eligible again
    pub fn resume_gateway(&mut self, gateway: &Nip) -> Vec<(usize, usize)> {
        let touched = self.destinations_via(gateway);
        let before = self.bests(&touched);
        self.suspended.remove(gateway);
        self.changed_since(touched, before)
    }

    pub fn is_suspended(&self, gateway: &Nip) -> bool {
        self.suspended.contains(gateway)
    }

    /// Best eligible route, or `None` when unreachable
    pub fn best(&self, level: usize, dest: usize) -> Option<&Route> {
        match self.map.get(level, dest) {
            Ok(Some(node)) => self.best_in(&node.routes),
            _ => None,
        }
    }

    /// All candidates for a destination, best first
    pub fn routes(&self, level: usize, dest: usize) -> &[Route] {
        match self.map.get(level, dest) {
            Ok(Some(node)) => &node.routes,
            _ => &[],
        }
    }

    /// Every reachable destination with its best route, level by level
    pub fn best_routes(&self) -> Vec<(usize, usize, &Route)> {
        let mut out = Vec::new();
        for level in 0..self.map.levels() {
            for (dest, node) in self.map.iter_level(level) {
                if let Some(route) = self.best_in(&node.routes) {
                    out.push((level, dest, route));
                }
            }
        }
        out
    }

    /// Number of reachable destinations over all levels
    pub fn reachable_count(&self) -> usize {
        self.best_routes().len()
    }

    /// Forget a destination; returns whether it was reachable
    pub fn remove_destination(&mut self, level: usize, dest: usize) -> Result<bool> {
        self.map.check(level, dest)?;
        let routes = self.take(level, dest);
        Ok(self.best_in(&routes).is_some())
    }

    /// Drop every route and move to a new local address
    ///
    /// Returns the destinations that were reachable before.
    pub fn reset(&mut self, me: Nip) -> Result<Vec<(usize, usize)>> {
        let reachable: Vec<(usize, usize)> = self
            .best_routes()
            .into_iter()
            .map(|(level, dest, _)| (level, dest))
            .collect();
        for level in 0..self.map.levels() {
            let ids: Vec<usize> = self.map.iter_level(level).map(|(id, _)| id).collect();
            for id in ids {
                self.take(level, id);
            }
        }
        self.suspended.clear();
        self.map.set_me(me)?;
        Ok(reachable)
    }

    // Move the candidate list out of the map; the slot is released unless it
    // belongs to the local node.
    fn take(&mut self, level: usize, dest: usize) -> Vec<Route> {
        let routes = match self.map.get_mut(level, dest) {
            Ok(Some(node)) => std::mem::take(&mut node.routes),
            _ => Vec::new(),
        };
        if !self.map.is_reserved(level, dest) {
            let _ = self.map.remove(level, dest);
        }
        routes
    }

    fn store(&mut self, level: usize, dest: usize, routes: Vec<Route>) {
        if routes.is_empty() {
            return;
        }
        if let Ok(node) = self.map.get_or_add(level, dest) {
            node.routes = routes;
        }
    }

    fn destinations_via(&self, gateway: &Nip) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for level in 0..self.map.levels() {
            for (dest, node) in self.map.iter_level(level) {
                if node.routes.iter().any(|r| &r.gateway == gateway) {
                    out.push((level, dest));
                }
            }
        }
        out
    }

    fn bests(&self, dests: &[(usize, usize)]) -> Vec<Option<Route>> {
        dests
            .iter()
            .map(|&(level, dest)| self.best(level, dest).cloned())
            .collect()
    }

    fn changed_since(
        &self,
        dests: Vec<(usize, usize)>,
        before: Vec<Option<Route>>,
    ) -> Vec<(usize, usize)> {
        dests
            .into_iter()
            .zip(before)
            .filter(|((level, dest), old)| self.best(*level, *dest) != old.as_ref())
            .map(|(d, _)| d)
            .collect()
    }

    fn rewrite_gateway(
        &mut self,
        gateway: &Nip,
        edit: impl Fn(&mut Vec<Route>),
    ) -> Vec<(usize, usize)> {
        let touched = self.destinations_via(gateway);
        let before = self.bests(&touched);
        for &(level, dest) in &touched {
            let mut routes = self.take(level, dest);
            edit(&mut routes);
            self.sort(&mut routes);
            self.store(level, dest, routes);
        }
        self.changed_since(touched, before)
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("map", &self.map)
            .field("reachable", &self.reachable_count())
            .field("suspended", &self.suspended)
            .finish()
    }
}
