//! Graph store
//!
//! [`FlowGraph`] owns the nodes and connections of one experiment and
//! enforces the structural rules on every edit:
//!
//! - connection endpoints reference live nodes and ports of the same kind
//! - a data input has at most one writer, a control input at most one entry
//! - data connections never form a cycle
//!
//! Every edit either succeeds completely or returns a [`GraphError`] and
//! leaves the graph untouched. Successful edits queue a [`GraphChange`]
//! that the engine drains and forwards to subscribers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::descriptor::NodeDefinition;
use crate::error::GraphError;
use crate::registry::NodeRegistry;
use crate::types::{
    Connection, ConnectionId, ConnectionSpec, DeviceId, ExecutionMode, NodeId, Port,
    PortDirection, PortKind, Position,
};

/// Property key holding a node's display title
pub const TITLE_PROPERTY: &str = "title";
/// Property key holding the device a hardware node is bound to
pub const DEVICE_PROPERTY: &str = "device";

/// Notification of a successful graph edit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GraphChange {
    #[serde(rename_all = "camelCase")]
    NodeAdded { node_id: NodeId },
    #[serde(rename_all = "camelCase")]
    NodeRemoved {
        node_id: NodeId,
        connections: Vec<ConnectionId>,
    },
    #[serde(rename_all = "camelCase")]
    ConnectionAdded { connection_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    ConnectionRemoved { connection_id: ConnectionId },
    #[serde(rename_all = "camelCase")]
    InputSet { node_id: NodeId, index: usize },
    #[serde(rename_all = "camelCase")]
    PropertySet { node_id: NodeId, key: String },
    #[serde(rename_all = "camelCase")]
    DeviceBound {
        node_id: NodeId,
        device_id: Option<DeviceId>,
    },
    Cleared,
}

/// A node in the graph
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub node_type: String,
    pub title: String,
    pub position: Position,
    pub properties: Map<String, Value>,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    /// Opaque per-node state owned by the node's operation
    pub state: Map<String, Value>,
    /// Device the node is configured to bind to
    pub device: Option<DeviceId>,
    /// Last error recorded for this node
    pub error: Option<String>,
    pub execution_mode: ExecutionMode,
}

impl Node {
    fn from_definition(
        id: NodeId,
        definition: &NodeDefinition,
        position: Position,
        initial_properties: Map<String, Value>,
    ) -> Result<Self, GraphError> {
        let mut properties = definition.default_properties.clone();
        properties.extend(initial_properties);

        let title = properties
            .get(TITLE_PROPERTY)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| definition.label.clone());
        let device = properties
            .get(DEVICE_PROPERTY)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());

        let mut inputs: Vec<Port> = definition
            .inputs
            .iter()
            .enumerate()
            .map(|(i, def)| Port::from_definition(i, def))
            .collect();
        let outputs = definition
            .outputs
            .iter()
            .enumerate()
            .map(|(i, def)| Port::from_definition(i, def))
            .collect();

        // Properties named after a data input seed that input
        for port in inputs.iter_mut().filter(|p| p.is_data()) {
            if let Some(value) = properties.get(&port.name) {
                port.value = coerce_for_port(&id, port, value)?;
            }
        }

        Ok(Self {
            id,
            node_type: definition.node_type.clone(),
            title,
            position,
            properties,
            inputs,
            outputs,
            state: Map::new(),
            device,
            error: None,
            execution_mode: definition.execution_mode,
        })
    }

    pub fn is_reactive(&self) -> bool {
        self.execution_mode == ExecutionMode::Reactive
    }

    pub fn input(&self, index: usize) -> Option<&Port> {
        self.inputs.get(index)
    }

    pub fn output(&self, index: usize) -> Option<&Port> {
        self.outputs.get(index)
    }

    pub fn input_index(&self, name: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.name == name)
    }

    pub fn output_index(&self, name: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.name == name)
    }

    pub fn input_values(&self) -> Vec<Value> {
        self.inputs.iter().map(|p| p.value.clone()).collect()
    }

    fn port(&self, direction: PortDirection, index: usize) -> Option<&Port> {
        match direction {
            PortDirection::Input => self.inputs.get(index),
            PortDirection::Output => self.outputs.get(index),
        }
    }
}

pub(crate) fn coerce_for_port(node_id: &str, port: &Port, value: &Value) -> Result<Value, GraphError> {
    let data_type = match (port.kind, port.data_type) {
        (PortKind::Data, Some(data_type)) => data_type,
        (PortKind::Data, None) => return Ok(value.clone()),
        (PortKind::Control, _) => {
            return Err(GraphError::NotADataPort {
                node_id: node_id.to_string(),
                index: port.index,
            })
        }
    };
    data_type.coerce(value).ok_or_else(|| GraphError::InvalidValue {
        node_id: node_id.to_string(),
        index: port.index,
        expected: data_type.to_string(),
        value: value.to_string(),
    })
}

/// Nodes and connections of one experiment
pub struct FlowGraph {
    id: String,
    name: String,
    registry: Arc<NodeRegistry>,
    nodes: HashMap<NodeId, Node>,
    order: Vec<NodeId>,
    connections: Vec<Connection>,
    changes: Vec<GraphChange>,
}

impl std::fmt::Debug for FlowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowGraph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("nodes", &self.nodes)
            .field("order", &self.order)
            .field("connections", &self.connections)
            .field("changes", &self.changes)
            .finish_non_exhaustive()
    }
}

impl FlowGraph {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: "Untitled".to_string(),
            registry,
            nodes: HashMap::new(),
            order: Vec::new(),
            connections: Vec::new(),
            changes: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_id(&mut self, id: impl Into<String>) {
        self.id = id.into();
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn definition(&self, node_type: &str) -> Option<&NodeDefinition> {
        self.registry.get_definition(node_type)
    }

    /// Create a node of a registered type
    pub fn add_node(
        &mut self,
        node_type: &str,
        position: Position,
        initial_properties: Map<String, Value>,
    ) -> Result<NodeId, GraphError> {
        let id = Uuid::new_v4().to_string();
        self.add_node_with_id(id, node_type, position, initial_properties)
    }

    /// Create a node with a caller-chosen id
    pub fn add_node_with_id(
        &mut self,
        id: impl Into<NodeId>,
        node_type: &str,
        position: Position,
        initial_properties: Map<String, Value>,
    ) -> Result<NodeId, GraphError> {
        let id = id.into();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        let definition = self
            .registry
            .get_definition(node_type)
            .ok_or_else(|| GraphError::UnknownNodeType(node_type.to_string()))?;
        let node = Node::from_definition(id.clone(), definition, position, initial_properties)?;

        log::debug!("Added node '{}' of type '{}'", id, node_type);
        self.nodes.insert(id.clone(), node);
        self.order.push(id.clone());
        self.changes.push(GraphChange::NodeAdded {
            node_id: id.clone(),
        });
        Ok(id)
    }

    /// Remove a node together with every incident connection
    pub fn remove_node(&mut self, id: &str) -> Result<Node, GraphError> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))?;
        self.order.retain(|n| n != id);

        let mut removed = Vec::new();
        self.connections.retain(|c| {
            if c.source == id || c.target == id {
                removed.push(c.id.clone());
                false
            } else {
                true
            }
        });

        log::debug!("Removed node '{}' and {} connection(s)", id, removed.len());
        self.changes.push(GraphChange::NodeRemoved {
            node_id: id.to_string(),
            connections: removed,
        });
        Ok(node)
    }

    /// Check a connection request without applying it
    ///
    /// Returns the kind of the connection when it is valid.
    pub fn check_connection(&self, spec: &ConnectionSpec) -> Result<PortKind, GraphError> {
        let source_port = self.endpoint(&spec.source, PortDirection::Output, spec.source_port)?;
        let target_port = self.endpoint(&spec.target, PortDirection::Input, spec.target_port)?;

        if spec.source == spec.target {
            return Err(GraphError::SelfConnection(spec.source.clone()));
        }

        if source_port.kind != target_port.kind {
            return Err(GraphError::TypeMismatch {
                from: format!("{} port '{}'", source_port.kind, source_port.name),
                to: format!("{} port '{}'", target_port.kind, target_port.name),
            });
        }
        if let Some(kind) = spec.kind {
            if kind != source_port.kind {
                return Err(GraphError::TypeMismatch {
                    from: format!("{} connection", kind),
                    to: format!("{} port '{}'", source_port.kind, source_port.name),
                });
            }
        }

        if source_port.kind == PortKind::Data {
            if let (Some(from), Some(to)) = (source_port.data_type, target_port.data_type) {
                if !from.is_compatible_with(&to) {
                    return Err(GraphError::TypeMismatch {
                        from: format!("{} output '{}'", from, source_port.name),
                        to: format!("{} input '{}'", to, target_port.name),
                    });
                }
            }
        }

        // Single writer per data input, single entry per control input
        if self
            .connections
            .iter()
            .any(|c| c.target == spec.target && c.target_port == spec.target_port)
        {
            return Err(GraphError::PortOccupied {
                node_id: spec.target.clone(),
                index: spec.target_port,
            });
        }

        if source_port.kind == PortKind::Data && self.data_path_exists(&spec.target, &spec.source)
        {
            return Err(GraphError::CycleDetected(spec.target.clone()));
        }

        if let Some(id) = &spec.id {
            if self.connections.iter().any(|c| &c.id == id) {
                return Err(GraphError::DuplicateConnection(id.clone()));
            }
        }

        Ok(source_port.kind)
    }

    /// Connect two ports
    pub fn add_connection(&mut self, spec: ConnectionSpec) -> Result<ConnectionId, GraphError> {
        let kind = self.check_connection(&spec)?;
        let id = spec.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        log::debug!(
            "Connected {}[{}] -> {}[{}] ({})",
            spec.source,
            spec.source_port,
            spec.target,
            spec.target_port,
            kind
        );
        self.connections.push(Connection {
            id: id.clone(),
            source: spec.source,
            source_port: spec.source_port,
            target: spec.target,
            target_port: spec.target_port,
            kind,
        });
        self.changes.push(GraphChange::ConnectionAdded {
            connection_id: id.clone(),
        });
        Ok(id)
    }

    /// Connect two ports by name
    pub fn connect_by_name(
        &mut self,
        source: &str,
        source_port: &str,
        target: &str,
        target_port: &str,
    ) -> Result<ConnectionId, GraphError> {
        let source_node = self.require_node(source)?;
        let source_index =
            source_node
                .output_index(source_port)
                .ok_or_else(|| GraphError::UnknownPortName {
                    node_id: source.to_string(),
                    port: source_port.to_string(),
                })?;
        let target_node = self.require_node(target)?;
        let target_index =
            target_node
                .input_index(target_port)
                .ok_or_else(|| GraphError::UnknownPortName {
                    node_id: target.to_string(),
                    port: target_port.to_string(),
                })?;
        self.add_connection(ConnectionSpec::new(
            source,
            source_index,
            target,
            target_index,
        ))
    }

    pub fn remove_connection(&mut self, id: &str) -> Result<Connection, GraphError> {
        let position = self
            .connections
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| GraphError::UnknownConnection(id.to_string()))?;
        let connection = self.connections.remove(position);
        self.changes.push(GraphChange::ConnectionRemoved {
            connection_id: id.to_string(),
        });
        Ok(connection)
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub(crate) fn get_node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    /// Resolve a node by id, then by title
    pub fn find_node(&self, reference: &str) -> Option<&Node> {
        self.nodes.get(reference).or_else(|| {
            self.order
                .iter()
                .filter_map(|id| self.nodes.get(id))
                .find(|n| n.title == reference)
        })
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.order.iter().filter_map(move |id| self.nodes.get(id))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.id == id)
    }

    /// The connection driving an input, if any
    pub fn incoming(&self, node_id: &str, index: usize) -> Option<&Connection> {
        self.connections
            .iter()
            .find(|c| c.target == node_id && c.target_port == index)
    }

    /// Connections leaving an output
    pub fn outgoing(&self, node_id: &str, index: usize) -> Vec<&Connection> {
        self.connections
            .iter()
            .filter(|c| c.source == node_id && c.source_port == index)
            .collect()
    }

    /// Nodes entered by a fired control output, in connection order
    /// Nodes reached by a Control output, with the input port each is entered through
    pub fn control_targets(&self, node_id: &str, index: usize) -> Vec<(NodeId, usize)> {
        self.outgoing(node_id, index)
            .into_iter()
            .filter(|c| c.kind == PortKind::Control)
            .map(|c| (c.target.clone(), c.target_port))
            .collect()
    }

    /// Entry points: no incoming control connection, at least one control output
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|node| node.outputs.iter().any(|p| p.is_control()))
            .filter(|node| !self.is_on_demand(node))
            .filter(|node| {
                !self
                    .connections
                    .iter()
                    .any(|c| c.kind == PortKind::Control && c.target == node.id)
            })
            .map(|node| node.id.clone())
            .collect()
    }

    /// Nodes that only run when called, such as function bodies
    pub fn on_demand_nodes(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|node| self.is_on_demand(node))
            .map(|node| node.id.clone())
            .collect()
    }

    fn is_on_demand(&self, node: &Node) -> bool {
        self.definition(&node.node_type)
            .is_some_and(|d| d.on_demand)
    }

    pub fn get_input(&self, node_id: &str, index: usize) -> Result<Value, GraphError> {
        let port = self.endpoint(node_id, PortDirection::Input, index)?;
        Ok(port.value.clone())
    }

    pub fn get_output(&self, node_id: &str, index: usize) -> Result<Value, GraphError> {
        let port = self.endpoint(node_id, PortDirection::Output, index)?;
        Ok(port.value.clone())
    }

    /// Store a value on an unconnected data input
    ///
    /// This does not run propagation; the engine does that after the edit.
    pub fn set_input(&mut self, node_id: &str, index: usize, value: Value) -> Result<(), GraphError> {
        if self.incoming(node_id, index).is_some() {
            return Err(GraphError::PortDriven {
                node_id: node_id.to_string(),
                index,
            });
        }
        self.store_input(node_id, index, value)?;
        self.changes.push(GraphChange::InputSet {
            node_id: node_id.to_string(),
            index,
        });
        Ok(())
    }

    /// Store a value on a data input regardless of its writer
    pub(crate) fn store_input(
        &mut self,
        node_id: &str,
        index: usize,
        value: Value,
    ) -> Result<bool, GraphError> {
        let port = self.endpoint(node_id, PortDirection::Input, index)?;
        let coerced = coerce_for_port(node_id, port, &value)?;
        let changed = port.value != coerced;
        if let Some(port) = self
            .nodes
            .get_mut(node_id)
            .and_then(|n| n.inputs.get_mut(index))
        {
            port.value = coerced;
        }
        Ok(changed)
    }

    /// Store a data output value, returning whether it changed
    pub(crate) fn store_output(
        &mut self,
        node_id: &str,
        index: usize,
        value: Value,
    ) -> Result<bool, GraphError> {
        let port = self.endpoint(node_id, PortDirection::Output, index)?;
        if !port.is_data() {
            return Err(GraphError::NotADataPort {
                node_id: node_id.to_string(),
                index,
            });
        }
        let value = match port.data_type {
            Some(data_type) => data_type.coerce(&value).unwrap_or(value),
            None => value,
        };
        let changed = port.value != value;
        if let Some(port) = self
            .nodes
            .get_mut(node_id)
            .and_then(|n| n.outputs.get_mut(index))
        {
            port.value = value;
        }
        Ok(changed)
    }

    /// Set a node property
    ///
    /// Properties named after an unconnected data input also update that input.
    pub fn set_property(&mut self, node_id: &str, key: &str, value: Value) -> Result<(), GraphError> {
        let node = self.require_node(node_id)?;
        let seeded_input = node
            .input_index(key)
            .filter(|i| node.inputs[*i].is_data() && self.incoming(node_id, *i).is_none());
        if let Some(index) = seeded_input {
            self.store_input(node_id, index, value.clone())?;
        }

        if let Some(node) = self.nodes.get_mut(node_id) {
            match key {
                TITLE_PROPERTY => {
                    if let Some(title) = value.as_str() {
                        node.title = title.to_string();
                    }
                }
                DEVICE_PROPERTY => {
                    node.device = value.as_str().filter(|s| !s.is_empty()).map(String::from);
                }
                _ => {}
            }
            node.properties.insert(key.to_string(), value);
        }
        self.changes.push(GraphChange::PropertySet {
            node_id: node_id.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    /// Record the device a node is configured to bind to
    pub(crate) fn set_device(&mut self, node_id: &str, device: Option<DeviceId>) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| GraphError::UnknownNode(node_id.to_string()))?;
        node.device = device.clone();
        match &device {
            Some(id) => {
                node.properties
                    .insert(DEVICE_PROPERTY.to_string(), Value::String(id.clone()));
            }
            None => {
                node.properties.remove(DEVICE_PROPERTY);
            }
        }
        self.changes.push(GraphChange::DeviceBound {
            node_id: node_id.to_string(),
            device_id: device,
        });
        Ok(())
    }

    pub(crate) fn set_error(&mut self, node_id: &str, error: Option<String>) {
        if let Some(node) = self.nodes.get_mut(node_id) {
            node.error = error;
        }
    }

    /// Reset run-scoped flags and errors before a run
    pub(crate) fn reset_run_flags(&mut self) {
        for node in self.nodes.values_mut() {
            node.error = None;
            for port in node.outputs.iter_mut() {
                port.fired = false;
            }
        }
    }

    pub(crate) fn clear_errors(&mut self) {
        for node in self.nodes.values_mut() {
            node.error = None;
        }
    }

    pub(crate) fn mark_fired(&mut self, node_id: &str, index: usize) {
        if let Some(port) = self
            .nodes
            .get_mut(node_id)
            .and_then(|n| n.outputs.get_mut(index))
        {
            port.fired = true;
        }
    }

    /// Remove every node and connection
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.order.clear();
        self.connections.clear();
        self.changes.push(GraphChange::Cleared);
    }

    /// Drain pending change notifications
    pub fn take_changes(&mut self) -> Vec<GraphChange> {
        std::mem::take(&mut self.changes)
    }

    /// Reactive nodes reachable from a node's data outputs
    pub(crate) fn data_dependents(&self, node_id: &str) -> Vec<NodeId> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![node_id];
        let mut result = Vec::new();
        while let Some(current) = stack.pop() {
            for connection in self
                .connections
                .iter()
                .filter(|c| c.kind == PortKind::Data && c.source == current)
            {
                if seen.insert(connection.target.as_str()) {
                    result.push(connection.target.clone());
                    stack.push(connection.target.as_str());
                }
            }
        }
        result
    }

    fn data_path_exists(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        self.data_dependents(from).iter().any(|n| n == to)
    }

    fn require_node(&self, id: &str) -> Result<&Node, GraphError> {
        self.nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))
    }

    fn endpoint(&self, node_id: &str, direction: PortDirection, index: usize) -> Result<&Port, GraphError> {
        let node = self.require_node(node_id)?;
        node.port(direction, index)
            .ok_or_else(|| GraphError::UnknownEndpoint {
                node_id: node_id.to_string(),
                direction,
                index,
            })
    }
}
