//! Link and clock collaborators
//!
//! The routing core never performs I/O itself. A `Link` enumerates the local
//! devices and puts frames on the wire without blocking; inbound frames are
//! delivered on a buffered channel. A `Clock` timestamps probe samples.

use super::channel::{buffered, BufferedReceiver, BufferedSender};
use crate::address::Nip;
use crate::error::{MeshError, Result};
use crate::neighbour::DeviceId;
use crate::node::Device;
use async_trait::async_trait;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// A frame received on a local device
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub device: DeviceId,
    pub bytes: Vec<u8>,
}

// ============================================================================
// COLLABORATOR TRAITS
// ============================================================================

#[async_trait(?Send)]
pub trait Link {
    /// Devices currently up, with their nominal bandwidth
    fn devices(&self) -> Vec<Device>;

    /// Queue `frame` on `device`, addressed to `to` or broadcast when `None`
    ///
    /// Must not wait on the remote side; a lost frame is not an error.
    async fn send(&self, device: &str, to: Option<Nip>, frame: Vec<u8>) -> Result<()>;
}

#[cfg_attr(test, mockall::automock)]
pub trait Clock {
    /// Milliseconds on a monotonic scale
    fn now_ms(&self) -> u64;
}

/// Milliseconds since creation on the OS monotonic clock
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Milliseconds since creation on tokio's clock; follows paused test time
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

// ============================================================================
// IN-MEMORY LINK
// ============================================================================

/// Up/down switch shared by both ends of an in-memory wire
#[derive(Debug, Clone)]
pub struct WireSwitch {
    up: Rc<Cell<bool>>,
}

impl WireSwitch {
    pub fn set_up(&self, up: bool) {
        self.up.set(up);
    }

    pub fn is_up(&self) -> bool {
        self.up.get()
    }
}

struct Port {
    device: Device,
    peer_device: DeviceId,
    peer_inbound: BufferedSender<InboundFrame>,
    switch: WireSwitch,
}

/// Point-to-point in-memory link: each device is wired to exactly one peer
pub struct ChannelLink {
    inbound: BufferedSender<InboundFrame>,
    ports: RefCell<Vec<Port>>,
}

impl ChannelLink {
    /// New link and the receiver its node reads inbound frames from
    pub fn new(capacity: usize) -> (Self, BufferedReceiver<InboundFrame>) {
        let (tx, rx) = buffered(capacity);
        (
            Self {
                inbound: tx,
                ports: RefCell::new(Vec::new()),
            },
            rx,
        )
    }

    /// Wire device `a_dev` of `a` to device `b_dev` of `b`
    pub fn connect(
        a: &ChannelLink,
        a_dev: &str,
        b: &ChannelLink,
        b_dev: &str,
        bandwidth_kbps: f64,
    ) -> WireSwitch {
        let switch = WireSwitch {
            up: Rc::new(Cell::new(true)),
        };
        a.ports.borrow_mut().push(Port {
            device: Device::new(a_dev, bandwidth_kbps),
            peer_device: b_dev.to_string(),
            peer_inbound: b.inbound.clone(),
            switch: switch.clone(),
        });
        b.ports.borrow_mut().push(Port {
            device: Device::new(b_dev, bandwidth_kbps),
            peer_device: a_dev.to_string(),
            peer_inbound: a.inbound.clone(),
            switch: switch.clone(),
        });
        switch
    }

    fn try_send(&self, device: &str, frame: Vec<u8>) -> Result<()> {
        let ports = self.ports.borrow();
        let port = ports
            .iter()
            .find(|p| p.device.name == device)
            .ok_or_else(|| MeshError::Link(format!("unknown device {}", device)))?;
        if !port.switch.is_up() {
            debug!("Device {} is down, frame lost", device);
            return Ok(());
        }
        let inbound = InboundFrame {
            device: port.peer_device.clone(),
            bytes: frame,
        };
        match port.peer_inbound.try_send(inbound) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Peer queue on {} full, frame lost", device);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(MeshError::Link(format!(
                "peer on {} has shut down",
                device
            ))),
        }
    }
}

#[async_trait(?Send)]
impl Link for ChannelLink {
    fn devices(&self) -> Vec<Device> {
        self.ports
            .borrow()
            .iter()
            .filter(|p| p.switch.is_up())
            .map(|p| p.device.clone())
            .collect()
    }

    async fn send(&self, device: &str, _to: Option<Nip>, frame: Vec<u8>) -> Result<()> {
        self.try_send(device, frame)
    }
}
