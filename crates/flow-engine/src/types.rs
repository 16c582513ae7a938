//! Core types for experiment graphs
//!
//! These types define ports, connections and the small value helpers
//! every node implementation relies on. Port values are carried as
//! `serde_json::Value` and checked against a [`DataType`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier for a node
pub type NodeId = String;

/// Unique identifier for a connection
pub type ConnectionId = String;

/// Unique identifier for a configured device
pub type DeviceId = String;

/// The two port kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortKind {
    /// Carries a typed value, updated reactively
    Data,
    /// Carries only a fired flag, drives sequencing
    Control,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Data => write!(f, "data"),
            Self::Control => write!(f, "control"),
        }
    }
}

/// Which side of a node a port sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

impl std::fmt::Display for PortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Semantic type of a data port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Int,
    Float,
    Bool,
    String,
    /// Accepts any type
    Any,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Any => "any",
        };
        write!(f, "{}", name)
    }
}

impl DataType {
    /// Check if an output of this type can feed an input of `target` type
    pub fn is_compatible_with(&self, target: &DataType) -> bool {
        if matches!(self, DataType::Any) || matches!(target, DataType::Any) {
            return true;
        }

        // Int widens into Float
        if matches!(self, DataType::Int) && matches!(target, DataType::Float) {
            return true;
        }

        self == target
    }

    /// Convert a value into this type, or `None` when it cannot represent it
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match self {
            DataType::Any => Some(value.clone()),
            DataType::Float => value_as_f64(value).and_then(|f| {
                serde_json::Number::from_f64(f).map(Value::Number)
            }),
            DataType::Int => value_as_f64(value)
                .filter(|f| f.is_finite())
                .map(|f| Value::from(f.round() as i64)),
            DataType::Bool => value_as_bool(value).map(Value::Bool),
            DataType::String => match value {
                Value::Null => None,
                Value::String(s) => Some(Value::String(s.clone())),
                other => Some(Value::String(other.to_string())),
            },
        }
    }

    /// The value a port of this type holds before anything is written
    pub fn zero_value(&self) -> Value {
        match self {
            DataType::Int => Value::from(0),
            DataType::Float => Value::from(0.0),
            DataType::Bool => Value::Bool(false),
            DataType::String => Value::String(String::new()),
            DataType::Any => Value::Null,
        }
    }
}

/// Category for palette grouping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    /// Nodes that talk to devices
    Hardware,
    /// Pure computations and control constructs
    Logic,
    /// Dashboard-facing nodes
    Interface,
    /// Experiment skeleton (start, end, delay, output, input)
    Experiment,
}

/// How the engine drives a node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Recomputed by value propagation whenever a data input changes
    Reactive,
    /// Invoked by the control sequencer when a control path reaches it
    Imperative,
}

/// Canvas position of a node
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<(f64, f64)> for Position {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// Definition of a port on a registered node type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDefinition {
    /// Port name, unique per side of the node
    pub name: String,
    pub kind: PortKind,
    /// Semantic type, `None` for control ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
    /// Default value (data inputs only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl PortDefinition {
    /// Create a data port
    pub fn data(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Data,
            data_type: Some(data_type),
            default_value: None,
            description: String::new(),
        }
    }

    /// Create a control port
    pub fn control(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: PortKind::Control,
            data_type: None,
            default_value: None,
            description: String::new(),
        }
    }

    /// Set a default value for this port
    ///
    /// Ignored on control ports, which never carry a value.
    pub fn with_default(mut self, value: Value) -> Self {
        if self.kind == PortKind::Data {
            self.default_value = Some(value);
        }
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// A live port on a node in the graph
#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub index: usize,
    pub name: String,
    pub kind: PortKind,
    pub data_type: Option<DataType>,
    /// Current value; always `Null` on control ports
    pub value: Value,
    /// Whether this control output fired during the current run
    pub fired: bool,
    pub default_value: Option<Value>,
}

impl Port {
    /// Build a port from its registered definition
    pub fn from_definition(index: usize, definition: &PortDefinition) -> Self {
        let value = match (definition.kind, &definition.default_value, definition.data_type) {
            (PortKind::Control, _, _) => Value::Null,
            (PortKind::Data, Some(default), _) => default.clone(),
            (PortKind::Data, None, Some(data_type)) => data_type.zero_value(),
            (PortKind::Data, None, None) => Value::Null,
        };
        Self {
            index,
            name: definition.name.clone(),
            kind: definition.kind,
            data_type: definition.data_type,
            value,
            fired: false,
            default_value: definition.default_value.clone(),
        }
    }

    pub fn is_data(&self) -> bool {
        self.kind == PortKind::Data
    }

    pub fn is_control(&self) -> bool {
        self.kind == PortKind::Control
    }
}

/// A connection between two ports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: ConnectionId,
    pub source: NodeId,
    pub source_port: usize,
    pub target: NodeId,
    pub target_port: usize,
    pub kind: PortKind,
}

/// Request to connect two ports
///
/// The kind is inferred from the endpoint ports; when given it must match.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSpec {
    pub id: Option<ConnectionId>,
    pub source: NodeId,
    pub source_port: usize,
    pub target: NodeId,
    pub target_port: usize,
    pub kind: Option<PortKind>,
}

impl ConnectionSpec {
    pub fn new(
        source: impl Into<NodeId>,
        source_port: usize,
        target: impl Into<NodeId>,
        target_port: usize,
    ) -> Self {
        Self {
            id: None,
            source: source.into(),
            source_port,
            target: target.into(),
            target_port,
            kind: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<ConnectionId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_kind(mut self, kind: PortKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

impl From<&Connection> for ConnectionSpec {
    fn from(connection: &Connection) -> Self {
        Self {
            id: Some(connection.id.clone()),
            source: connection.source.clone(),
            source_port: connection.source_port,
            target: connection.target.clone(),
            target_port: connection.target_port,
            kind: Some(connection.kind),
        }
    }
}

/// Read a value as a float the way lab inputs expect
///
/// Booleans map to 0/1 and numeric strings are parsed.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Read a value as a digital level
///
/// Accepts booleans, numbers (non-zero is high) and the usual
/// `HIGH`/`LOW`, `on`/`off`, `true`/`false` spellings.
pub fn value_as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "high" | "true" | "on" | "1" => Some(true),
            "low" | "false" | "off" | "0" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Check if a value is truthy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
