//! Wire protocol
//!
//! - `tracer`: route-delta messages and their validation
//! - `codec`: versioned framing of every message kind

pub mod codec;
pub mod tracer;

pub use codec::{decode_frame, encode_frame, WireMessage, MAX_FRAME_SIZE, WIRE_VERSION};
pub use tracer::{DeltaEntry, LevelDelta, TracerMessage, TrailHop, MAX_HOPS};
