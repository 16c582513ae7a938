//! Experiment nodes
//!
//! The skeleton of an experiment: where it starts, where it ends, waiting,
//! and single-shot device writes and reads.

mod delay;
mod end;
mod input;
mod output;
mod start;

pub use delay::DelayNode;
pub use end::EndExperimentNode;
pub use input::InputNode;
pub use output::OutputNode;
pub use start::StartExperimentNode;
