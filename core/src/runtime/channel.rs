//! Task channels
//!
//! Three flavours cover every hand-off between node tasks:
//! - `rendezvous()`: `send` completes only once a receiver has taken the value
//! - `buffered(cap)`: bounded queue, `send` returns as soon as the value is queued
//! - `broadcast(cap)`: every subscriber observes every value

use crate::error::{MeshError, Result};
use tokio::sync::{broadcast as fanout, mpsc, oneshot};

pub type BufferedSender<T> = mpsc::Sender<T>;
pub type BufferedReceiver<T> = mpsc::Receiver<T>;
pub type BroadcastSender<T> = fanout::Sender<T>;
pub type BroadcastReceiver<T> = fanout::Receiver<T>;

/// Bounded queue of `capacity` values (at least one)
pub fn buffered<T>(capacity: usize) -> (BufferedSender<T>, BufferedReceiver<T>) {
    mpsc::channel(capacity.max(1))
}

/// Fan-out channel; slow subscribers lose the oldest values
pub fn broadcast<T: Clone>(capacity: usize) -> (BroadcastSender<T>, BroadcastReceiver<T>) {
    fanout::channel(capacity.max(1))
}

/// Synchronous hand-off between two tasks
pub fn rendezvous<T>() -> (RendezvousSender<T>, RendezvousReceiver<T>) {
    let (tx, rx) = mpsc::channel(1);
    (RendezvousSender { tx }, RendezvousReceiver { rx })
}

type Handoff<T> = (T, oneshot::Sender<()>);

pub struct RendezvousSender<T> {
    tx: mpsc::Sender<Handoff<T>>,
}

impl<T> Clone for RendezvousSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> RendezvousSender<T> {
    /// Suspend until a receiver takes `value`
    pub async fn send(&self, value: T) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((value, ack_tx))
            .await
            .map_err(|_| MeshError::ChannelClosed)?;
        ack_rx.await.map_err(|_| MeshError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct RendezvousReceiver<T> {
    rx: mpsc::Receiver<Handoff<T>>,
}

impl<T> RendezvousReceiver<T> {
    /// Take the next value; `None` once every sender is gone
    pub async fn recv(&mut self) -> Option<T> {
        let (value, ack) = self.rx.recv().await?;
        let _ = ack.send(());
        Some(value)
    }

    /// Take a value only if a sender is already waiting
    pub fn try_recv(&mut self) -> Option<T> {
        let (value, ack) = self.rx.try_recv().ok()?;
        let _ = ack.send(());
        Some(value)
    }
}
