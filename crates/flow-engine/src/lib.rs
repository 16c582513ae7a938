//! Flow Engine - node graph execution for lab hardware experiments
//!
//! This crate runs directed graphs of typed nodes against physical or
//! simulated devices. It provides:
//!
//! - A graph store that rejects structurally invalid edits atomically
//! - Reactive value propagation in topological order
//! - A control sequencer with pause, cancellation and fan-out paths
//! - Device binding with per-pin ownership and error policies
//! - A run state machine with cooperative and emergency stop
//! - An event bus and telemetry sampling for presentation layers
//!
//! # Architecture
//!
//! Nodes come in two execution modes. Reactive nodes implement
//! `NodeOperation::recompute` and are re-evaluated whenever an upstream
//! Data output changes. Imperative nodes implement `NodeOperation::execute`
//! and run when a Control connection reaches them.
//!
//! - `FlowGraph`: nodes, ports and connections
//! - `NodeRegistry`: node type definitions and operations
//! - `HardwareManager`: boards, devices and pin ownership
//! - `FlowEngine`: the control surface tying everything together
//!
//! # Example
//!
//! ```ignore
//! use flow_engine::{EngineConfig, FlowEngine, GraphBuilder, HardwareManager};
//!
//! let description = GraphBuilder::new("blink")
//!     .node("start", "StartExperiment")
//!     .node("on", "Output").with_device("led")
//!     .connect("start", "next", "on", "exec")
//!     .build(&registry)?;
//! let engine = FlowEngine::new(Arc::new(registry), hardware, EngineConfig::default());
//! engine.load(&description)?;
//! engine.start().await?;
//! ```

pub mod binding;
pub mod builder;
pub mod config;
pub mod context;
pub mod description;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod hardware;
mod propagation;
pub mod registry;
mod run;
mod sequencer;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod undo;
pub mod validation;

pub use binding::BindingLayer;
pub use builder::GraphBuilder;
pub use config::{EngineConfig, HardwareConfig};
pub use context::{Fired, HardwareAction, NodeContext, RecomputeContext};
pub use description::{GraphDescription, NodeDescription, PortShape, PortSummary, SCHEMA_VERSION};
pub use descriptor::{ErrorPolicy, HardwareRequirement, NodeDefinition, NodeDescriptor};
pub use engine::FlowEngine;
pub use error::{FlowEngineError, GraphError, HardwareError, HwResult, Result, Severity};
pub use events::{
    ChannelEventSink, EngineEvent, EventBus, EventCategory, EventError, EventSink,
    NullEventSink, Subscription, VecEventSink,
};
pub use graph::{FlowGraph, GraphChange, Node};
pub use hardware::{
    Board, BoardCapabilities, BoardConfig, BoardEvent, ConnectionState, DeviceConfig,
    DeviceHandle, DriverRegistry, HardwareManager, MockBoard, PinDirection, PinKind, PinManager,
};
pub use registry::{CallbackInput, CallbackOutput, NodeOperation, NodeRegistry};
pub use run::RunFailure;
pub use state::EngineState;
pub use telemetry::{spawn_sampler, OutputSample, TelemetrySample, TelemetrySampler};
pub use types::{
    Connection, ConnectionId, ConnectionSpec, DataType, DeviceId, ExecutionMode, NodeCategory,
    NodeId, Port, PortDefinition, PortDirection, PortKind, Position, is_truthy, value_as_bool,
    value_as_f64,
};
pub use undo::UndoStack;
pub use validation::ValidationError;
