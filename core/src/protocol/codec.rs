// Wire codec: versioned frames with size limits

use super::tracer::TracerMessage;
use crate::address::Nip;
use crate::engine::ContestInfo;
use crate::error::{MeshError, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};

/// Version byte prefixed to every frame
pub const WIRE_VERSION: u8 = 1;

/// Maximum frame size: 64 KB
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Every message exchanged between neighbours
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Presence probe, broadcast on a device
    Probe { seq: u32, nip: Nip },
    /// Answer to a probe, sent back to the prober
    ProbeReply {
        seq: u32,
        nip: Nip,
        netid: u64,
        bandwidth_kbps: f64,
    },
    Tracer(TracerMessage),
    /// Opens a collision reconciliation
    Contest(ContestInfo),
    ContestReply(ContestInfo),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Probe { .. } => "probe",
            WireMessage::ProbeReply { .. } => "probe-reply",
            WireMessage::Tracer(_) => "tracer",
            WireMessage::Contest(_) => "contest",
            WireMessage::ContestReply(_) => "contest-reply",
        }
    }
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .reject_trailing_bytes()
}

/// Serialize a message into a frame
pub fn encode_frame(msg: &WireMessage) -> Result<Vec<u8>> {
    let payload = options()
        .serialize(msg)
        .map_err(|e| MeshError::Codec(e.to_string()))?;

    if payload.len() + 1 > MAX_FRAME_SIZE {
        return Err(MeshError::Codec(format!(
            "Encoded frame too large: {} bytes (max {})",
            payload.len() + 1,
            MAX_FRAME_SIZE
        )));
    }

    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(WIRE_VERSION);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Deserialize a frame
pub fn decode_frame(frame: &[u8]) -> Result<WireMessage> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(MeshError::Codec(format!(
            "Frame too large: {} bytes (max {})",
            frame.len(),
            MAX_FRAME_SIZE
        )));
    }

    let (version, payload) = frame
        .split_first()
        .ok_or_else(|| MeshError::Codec("Empty frame".into()))?;
    if *version != WIRE_VERSION {
        return Err(MeshError::Codec(format!(
            "Unsupported wire version {} (expected {})",
            version, WIRE_VERSION
        )));
    }

    options()
        .deserialize(payload)
        .map_err(|e| MeshError::Codec(e.to_string()))
}
