//! Hierarchical addressing
//!
//! - `nip`: per-level node addresses and their flat encoding
//! - `map`: the fractal slot map every routing structure is built on

pub mod map;
pub mod nip;

pub use map::{AddressMap, RecordFactory, SlotChange};
pub use nip::Nip;
