//! Flow Nodes
//!
//! Built-in node types for the flow execution engine. Each node is a
//! self-describing [`NodeOperation`](flow_engine::NodeOperation) that can
//! be composed into experiment graphs.
//!
//! # Categories
//!
//! - **Experiment**: start, end, delay, and single device writes/reads
//! - **Control**: loops, branches, sequences, waiting on inputs, toggles,
//!   timers and flow functions
//! - **Hardware**: digital and analog pin operations
//! - **Logic**: reactive arithmetic, ranges, comparisons and PID control

pub mod control;
pub mod experiment;
pub mod hardware;
pub mod logic;
pub mod setup;

pub use control::*;
pub use experiment::*;
pub use hardware::*;
pub use logic::*;
pub use setup::{builtin_registry, register_builtins};
