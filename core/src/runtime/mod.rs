//! Cooperative single-threaded runtime for a node

pub mod channel;
pub mod link;
pub mod service;
pub mod waiters;

pub use channel::{
    broadcast, buffered, rendezvous, BroadcastReceiver, BroadcastSender, BufferedReceiver,
    BufferedSender, RendezvousReceiver, RendezvousSender,
};
pub use link::{ChannelLink, Clock, InboundFrame, Link, SystemClock, TokioClock, WireSwitch};
pub use service::{run_local, NodeService};
pub use waiters::{wait_reply, ReplyWaiters};
