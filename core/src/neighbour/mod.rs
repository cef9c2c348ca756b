//! Neighbour discovery and link-quality estimation

pub mod quality;
pub mod table;

pub use quality::{LinkQuality, RoundSamples};
pub use table::{DeviceId, Neighbour, NeighbourEvent, NeighbourState, NeighbourTable};
