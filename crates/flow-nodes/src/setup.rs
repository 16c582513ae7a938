//! Built-in node registration
//!
//! Hosts call [`register_builtins`] at startup, or take a ready-made
//! registry from [`builtin_registry`], before handing the registry to a
//! `FlowEngine`. Plugin node types are registered into the same registry
//! afterwards.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = flow_engine::NodeRegistry::new();
//! flow_nodes::register_builtins(&mut registry);
//! let engine = FlowEngine::with_registry(Arc::new(registry));
//! ```

use flow_engine::NodeRegistry;

use crate::control::{
    BranchNode, EndFunctionNode, FunctionCallNode, LoopNode, SequenceNode, StartFunctionNode,
    TimerNode, ToggleNode, WaitForInputNode,
};
use crate::experiment::{DelayNode, EndExperimentNode, InputNode, OutputNode, StartExperimentNode};
use crate::hardware::{AnalogReadNode, DigitalReadNode, DigitalWriteNode, PwmWriteNode};
use crate::logic::{
    AddNode, ClampNode, DivideNode, InRangeNode, MapRangeNode, MultiplyNode, PidNode,
    SubtractNode, ThresholdNode,
};

/// Register every built-in node type
pub fn register_builtins(registry: &mut NodeRegistry) {
    // Experiment
    registry.register_node::<StartExperimentNode>();
    registry.register_node::<EndExperimentNode>();
    registry.register_node::<DelayNode>();
    registry.register_node::<OutputNode>();
    registry.register_node::<InputNode>();

    // Control
    registry.register_node::<LoopNode>();
    registry.register_node::<BranchNode>();
    registry.register_node::<SequenceNode>();
    registry.register_node::<WaitForInputNode>();
    registry.register_node::<ToggleNode>();
    registry.register_node::<TimerNode>();
    registry.register_node::<StartFunctionNode>();
    registry.register_node::<EndFunctionNode>();
    registry.register_node::<FunctionCallNode>();

    // Hardware
    registry.register_node::<DigitalWriteNode>();
    registry.register_node::<DigitalReadNode>();
    registry.register_node::<AnalogReadNode>();
    registry.register_node::<PwmWriteNode>();

    // Logic
    registry.register_node::<AddNode>();
    registry.register_node::<SubtractNode>();
    registry.register_node::<MultiplyNode>();
    registry.register_node::<DivideNode>();
    registry.register_node::<MapRangeNode>();
    registry.register_node::<ClampNode>();
    registry.register_node::<ThresholdNode>();
    registry.register_node::<InRangeNode>();
    registry.register_node::<PidNode>();

    log::debug!("Registered {} built-in node types", registry.len());
}

/// A registry holding only the built-in node types
pub fn builtin_registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_builtins(&mut registry);
    registry
}
