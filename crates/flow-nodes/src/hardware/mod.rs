//! Hardware nodes
//!
//! Pin-level reads and writes against the node's bound device.

mod analog;
mod digital;

pub use analog::{AnalogReadNode, PwmWriteNode};
pub use digital::{DigitalReadNode, DigitalWriteNode};
