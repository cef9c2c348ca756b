//! Node service
//!
//! Drives one `Node` on a single-threaded cooperative runtime. Every task runs
//! on the same `LocalSet` and only yields at `.await` points; the node is
//! borrowed for one synchronous step at a time and never across an await, so
//! no locking is needed.
//!
//! Tasks:
//! - radar: opens a probe round every `probe_interval`, closes it after `reply_wait`
//! - inbound loop: feeds received frames to the node
//! - reconciliation: one per contested neighbour, waits for the contest reply

use super::channel::{broadcast, BroadcastReceiver, BroadcastSender, BufferedReceiver};
use super::link::{Clock, InboundFrame, Link};
use super::waiters::{wait_reply, ReplyWaiters};
use crate::address::Nip;
use crate::engine::{ContestInfo, RouteChange};
use crate::error::{MeshError, Result};
use crate::node::{Node, NodeOutput, Outbound};
use crate::protocol::encode_frame;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::LocalSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Capacity of the route change channel
const CHANGE_CHANNEL_CAPACITY: usize = 256;

struct Shared<L, C> {
    node: RefCell<Node>,
    link: L,
    clock: C,
    waiters: RefCell<ReplyWaiters<Nip, ContestInfo>>,
    changes: BroadcastSender<RouteChange>,
    probe_interval: Duration,
    reply_wait: Duration,
    reconcile_timeout: Duration,
}

pub struct NodeService<L, C> {
    shared: Rc<Shared<L, C>>,
}

impl<L, C> Clone for NodeService<L, C> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<L: Link + 'static, C: Clock + 'static> NodeService<L, C> {
    pub fn new(node: Node, link: L, clock: C) -> Self {
        let config = node.config();
        let (probe_interval, reply_wait, reconcile_timeout) = (
            config.probe_interval(),
            config.reply_wait(),
            config.reconcile_timeout(),
        );
        let (changes, _) = broadcast(CHANGE_CHANNEL_CAPACITY);
        Self {
            shared: Rc::new(Shared {
                node: RefCell::new(node),
                link,
                clock,
                waiters: RefCell::new(ReplyWaiters::new()),
                changes,
                probe_interval,
                reply_wait,
                reconcile_timeout,
            }),
        }
    }

    /// Best-route changes, for the forwarding layer
    pub fn subscribe(&self) -> BroadcastReceiver<RouteChange> {
        self.shared.changes.subscribe()
    }

    /// Read the node state between steps
    pub fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> R {
        f(&self.shared.node.borrow())
    }

    pub fn link(&self) -> &L {
        &self.shared.link
    }

    /// Reconciliation handshakes still waiting for a reply
    pub fn pending_reconciliations(&self) -> usize {
        self.shared.waiters.borrow().pending()
    }

    /// Run until the inbound channel closes
    ///
    /// Must be polled inside a `LocalSet`.
    pub async fn run(&self, mut inbound: BufferedReceiver<InboundFrame>) -> Result<()> {
        let radar = tokio::task::spawn_local(radar(Rc::clone(&self.shared)));
        info!("Node {} running", self.with_node(|n| n.nip().clone()));

        while let Some(frame) = inbound.recv().await {
            let now = self.shared.clock.now_ms();
            let step = self
                .shared
                .node
                .borrow_mut()
                .handle_frame(&frame.device, &frame.bytes, now);
            match step {
                Ok(output) => dispatch(&self.shared, output).await,
                Err(e) => warn!("Dropping frame on {}: {}", frame.device, e),
            }
        }

        radar.abort();
        info!("Inbound channel closed, node stopped");
        Ok(())
    }
}

// ============================================================================
// TASKS
// ============================================================================

async fn radar<L: Link + 'static, C: Clock + 'static>(shared: Rc<Shared<L, C>>) {
    let mut ticker = tokio::time::interval(shared.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let devices = shared.link.devices();
        let probes = shared
            .node
            .borrow_mut()
            .begin_probe_round(&devices, shared.clock.now_ms());
        send_all(&shared, probes).await;

        tokio::time::sleep(shared.reply_wait).await;
        let output = shared
            .node
            .borrow_mut()
            .end_probe_round(shared.clock.now_ms());
        dispatch(&shared, output).await;
    }
}

async fn dispatch<L: Link + 'static, C: Clock + 'static>(
    shared: &Rc<Shared<L, C>>,
    output: NodeOutput,
) {
    let NodeOutput {
        outbound,
        route_changes,
        contests,
        contest_replies,
        aborted,
        renumbered,
    } = output;

    send_all(shared, outbound).await;
    for change in route_changes {
        // No subscriber is fine
        let _ = shared.changes.send(change);
    }
    if let Some((old, new)) = renumbered {
        info!("Address changed {} -> {}", old, new);
    }
    for reply in contest_replies {
        let nip = reply.nip.clone();
        if !shared.waiters.borrow_mut().complete(&nip, reply) {
            debug!("Unsolicited contest reply from {}", nip);
        }
    }
    for peer in aborted {
        if shared.waiters.borrow_mut().cancel(&peer) {
            debug!("Cancelled reconciliation wait on {}", peer);
        }
    }
    spawn_reconciliations(shared, contests);
}

async fn send_all<L: Link, C>(shared: &Shared<L, C>, outbound: Vec<Outbound>) {
    for out in outbound {
        let frame = match encode_frame(out.message()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot encode {}: {}", out.message().kind(), e);
                continue;
            }
        };
        let to = match &out {
            Outbound::Broadcast { .. } => None,
            Outbound::Unicast { to, .. } => Some(to.clone()),
        };
        if let Err(e) = shared.link.send(out.device(), to, frame).await {
            warn!("Send on {} failed: {}", out.device(), e);
        }
    }
}

// Kept synchronous so the reconciliation task does not nest inside dispatch
fn spawn_reconciliations<L: Link + 'static, C: Clock + 'static>(
    shared: &Rc<Shared<L, C>>,
    peers: Vec<Nip>,
) {
    for peer in peers {
        if shared.waiters.borrow().is_waiting(&peer) {
            continue;
        }
        let Some(contest) = shared.node.borrow_mut().start_reconcile(&peer) else {
            continue;
        };
        let reply = shared.waiters.borrow_mut().register(peer.clone());
        let shared = Rc::clone(shared);
        tokio::task::spawn_local(async move {
            send_all(&shared, vec![contest]).await;
            match wait_reply(reply, shared.reconcile_timeout).await {
                Ok(remote) => {
                    let settled = shared.node.borrow_mut().reconcile(&remote);
                    match settled {
                        Ok((outcome, output)) => {
                            info!("Reconciliation with {}: {:?}", peer, outcome);
                            dispatch(&shared, output).await;
                        }
                        Err(e) => warn!("Reconciliation with {} failed: {}", peer, e),
                    }
                }
                Err(MeshError::Timeout) => {
                    shared.waiters.borrow_mut().cancel(&peer);
                    shared.node.borrow_mut().abort_reconcile(&peer);
                    info!("Reconciliation with {} timed out", peer);
                }
                Err(e) => warn!("Reconciliation with {} failed: {}", peer, e),
            }
        });
    }
}

/// Run `future` to completion on a fresh single-threaded runtime
pub fn run_local<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .map_err(|e| MeshError::Link(format!("cannot start runtime: {}", e)))?;
    let local = LocalSet::new();
    Ok(local.block_on(&runtime, future))
}
