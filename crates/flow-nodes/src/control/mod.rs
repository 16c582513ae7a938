//! Control nodes
//!
//! Nodes that shape the control flow of an experiment: repetition,
//! branching, ordered fan-out, waiting on a device and latching state.
//! Flow functions and the periodic timer live here too.

mod branch;
mod function;
mod loop_node;
mod sequence;
mod timer;
mod toggle;
mod wait_for_input;

pub use branch::BranchNode;
pub use function::{EndFunctionNode, FunctionCallNode, StartFunctionNode};
pub use loop_node::LoopNode;
pub use sequence::SequenceNode;
pub use timer::TimerNode;
pub use toggle::ToggleNode;
pub use wait_for_input::{ThresholdDirection, ThresholdMode, WaitForInputNode};
