//! Node type descriptors
//!
//! A [`NodeDefinition`] is the registered shape of a node type: its
//! ports, default properties, how the engine drives it, how it reacts to
//! hardware failures and which device kinds it may be bound to. Node
//! implementations describe themselves through [`NodeDescriptor`], so the
//! definition and the behaviour live next to each other.
//!
//! # Example
//!
//! ```ignore
//! impl NodeDescriptor for DelayNode {
//!     fn descriptor() -> NodeDefinition {
//!         NodeDefinition::new("Delay", NodeCategory::Experiment, ExecutionMode::Imperative)
//!             .with_input(PortDefinition::control("exec"))
//!             .with_input(PortDefinition::data("duration", DataType::Float))
//!             .with_output(PortDefinition::control("next"))
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HardwareError, Severity};
use crate::hardware::{PinDirection, PinKind};
use crate::types::{ExecutionMode, NodeCategory, PortDefinition, PortKind};

/// Trait for node implementations that describe their own definition
pub trait NodeDescriptor {
    fn descriptor() -> NodeDefinition
    where
        Self: Sized;
}

/// What a node does when one of its operations fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Halt the control path and surface the error to the run controller
    Halt,
    /// Record the error and still fire the node's default control output
    Continue,
    /// Halt on critical errors, continue on soft ones
    #[default]
    BySeverity,
}

impl ErrorPolicy {
    pub fn should_halt(&self, error: &HardwareError) -> bool {
        match self {
            Self::Halt => true,
            Self::Continue => false,
            Self::BySeverity => error.severity() == Severity::Critical,
        }
    }
}

/// Device kinds and direction a node type can be bound to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareRequirement {
    pub kinds: Vec<PinKind>,
    pub direction: PinDirection,
}

impl HardwareRequirement {
    pub fn output(kinds: &[PinKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            direction: PinDirection::Output,
        }
    }

    pub fn input(kinds: &[PinKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
            direction: PinDirection::Input,
        }
    }

    pub fn accepts(&self, kind: PinKind, direction: PinDirection) -> bool {
        self.direction == direction && self.kinds.contains(&kind)
    }
}

/// Complete definition of a node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDefinition {
    /// Unique type identifier (e.g., "Delay")
    pub node_type: String,
    pub category: NodeCategory,
    /// Human-readable label, also the default node title
    pub label: String,
    pub description: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
    pub execution_mode: ExecutionMode,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    #[serde(default)]
    pub default_properties: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareRequirement>,
    /// Whether two control paths may be inside this node at once
    #[serde(default)]
    pub reentrant: bool,
    /// Runs only when another node calls it, never as a run entry
    #[serde(default)]
    pub on_demand: bool,
}

impl NodeDefinition {
    pub fn new(
        node_type: impl Into<String>,
        category: NodeCategory,
        execution_mode: ExecutionMode,
    ) -> Self {
        let node_type = node_type.into();
        Self {
            label: node_type.clone(),
            node_type,
            category,
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            execution_mode,
            error_policy: ErrorPolicy::default(),
            default_properties: Map::new(),
            hardware: None,
            reentrant: false,
            on_demand: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn with_output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.default_properties.insert(key.into(), value);
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_hardware(mut self, requirement: HardwareRequirement) -> Self {
        self.hardware = Some(requirement);
        self
    }

    pub fn reentrant(mut self) -> Self {
        self.reentrant = true;
        self
    }

    pub fn on_demand(mut self) -> Self {
        self.on_demand = true;
        self
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }

    /// First control output, fired when an error is recovered by policy
    pub fn default_control_output(&self) -> Option<usize> {
        self.outputs.iter().position(|p| p.kind == PortKind::Control)
    }

    pub fn has_control_ports(&self) -> bool {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .any(|p| p.kind == PortKind::Control)
    }
}
