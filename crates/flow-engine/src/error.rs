//! Error types for the flow engine
//!
//! Errors fall into three groups:
//!
//! - [`GraphError`]: structural problems rejected synchronously by graph edits and loads
//! - [`HardwareError`]: per-node device failures, handled by the node's error policy
//! - [`FlowEngineError`]: the crate-wide error, which also carries engine-level faults
//!   (propagation depth, invariant violations) that move a run into `Error`

use std::time::Duration;

use thiserror::Error;

use crate::state::EngineState;
use crate::types::{ConnectionId, NodeId, PortDirection};

/// Result type alias using FlowEngineError
pub type Result<T> = std::result::Result<T, FlowEngineError>;

/// Result type alias for device calls
pub type HwResult<T> = std::result::Result<T, HardwareError>;

/// Structural errors. Raised at edit or load time, never at runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    #[error("Unknown node type '{0}'")]
    UnknownNodeType(String),

    #[error("Unknown node '{0}'")]
    UnknownNode(NodeId),

    #[error("Duplicate node id '{0}'")]
    DuplicateNode(NodeId),

    #[error("Unknown connection '{0}'")]
    UnknownConnection(ConnectionId),

    #[error("Duplicate connection id '{0}'")]
    DuplicateConnection(ConnectionId),

    #[error("Node '{node_id}' has no {direction} port {index}")]
    UnknownEndpoint {
        node_id: NodeId,
        direction: PortDirection,
        index: usize,
    },

    #[error("Node '{node_id}' has no port named '{port}'")]
    UnknownPortName { node_id: NodeId, port: String },

    #[error("Type mismatch: {from} cannot connect to {to}")]
    TypeMismatch { from: String, to: String },

    #[error("Input {index} on node '{node_id}' already has an incoming connection")]
    PortOccupied { node_id: NodeId, index: usize },

    #[error("Connection would create a data cycle through node '{0}'")]
    CycleDetected(NodeId),

    #[error("Node '{0}' cannot connect to itself")]
    SelfConnection(NodeId),

    #[error("Input {index} on node '{node_id}' is driven by a connection")]
    PortDriven { node_id: NodeId, index: usize },

    #[error("Port {index} on node '{node_id}' is not a data port")]
    NotADataPort { node_id: NodeId, index: usize },

    #[error("Value {value} is not a valid {expected} for input {index} on node '{node_id}'")]
    InvalidValue {
        node_id: NodeId,
        index: usize,
        expected: String,
        value: String,
    },

    #[error("Port shape of node '{node_id}' does not match type '{node_type}'")]
    PortShapeMismatch { node_id: NodeId, node_type: String },

    #[error("Connection '{connection_id}' rejected: {reason}")]
    InvalidConnection {
        connection_id: ConnectionId,
        reason: Box<GraphError>,
    },

    /// The edit would disturb a run in progress
    #[error("Cannot {0} while a run is active")]
    RunActive(String),
}

/// How severe a hardware error is for the node's error policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Local failure; the path may continue
    Soft,
    /// The device can no longer be trusted; the path halts
    Critical,
}

/// Device and node-level failures
///
/// User-code faults inside a node operation are converted to
/// [`HardwareError::NodeFault`] at the invocation boundary.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    #[error("Hardware call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Device '{0}' is disconnected")]
    Disconnected(String),

    #[error("Capability violation: {0}")]
    Capability(String),

    #[error("Pin {pin} is already claimed by '{existing}', cannot assign to '{requested}'")]
    PinConflict {
        pin: u32,
        existing: String,
        requested: String,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Node fault: {0}")]
    NodeFault(String),

    #[error("Node '{0}' has no bound device")]
    NotBound(NodeId),

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Unknown board '{0}'")]
    UnknownBoard(String),

    #[error("Unknown driver '{0}'")]
    UnknownDriver(String),
}

impl HardwareError {
    /// Create a device error with a message
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    /// Severity used by `ErrorPolicy::BySeverity`
    pub fn severity(&self) -> Severity {
        match self {
            Self::Timeout(_) | Self::Device(_) | Self::InvalidValue(_) => Severity::Soft,
            _ => Severity::Critical,
        }
    }
}

/// Errors that can occur in the flow engine
#[derive(Debug, Error)]
pub enum FlowEngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error("Propagation depth {depth} exceeded at node '{node_id}'")]
    PropagationDepthExceeded { node_id: NodeId, depth: usize },

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Path halted at node '{node_id}': {message}")]
    PathHalted { node_id: NodeId, message: String },

    #[error("Graph validation failed: {0}")]
    Validation(String),

    #[error("Task execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowEngineError {
    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::ExecutionFailed(msg.into())
    }

    /// Create an invariant violation error
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Engine-level faults corrupt run-wide invariants and end the run in `Error`
    pub fn is_engine_level(&self) -> bool {
        matches!(
            self,
            Self::PropagationDepthExceeded { .. } | Self::Invariant(_)
        )
    }
}
