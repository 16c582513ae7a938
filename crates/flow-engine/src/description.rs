//! Serialized graph descriptions
//!
//! [`GraphDescription`] is the persisted and exchanged form of a graph.
//! Loading rebuilds a fresh [`FlowGraph`] through the normal edit
//! operations, so every structural rule is enforced again; the caller
//! swaps the result in only when the whole description is valid.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::descriptor::NodeDefinition;
use crate::error::{GraphError, Result};
use crate::graph::{FlowGraph, Node};
use crate::registry::NodeRegistry;
use crate::types::{
    Connection, ConnectionSpec, DataType, DeviceId, NodeId, Port, PortDefinition, PortKind,
    Position,
};

pub const SCHEMA_VERSION: &str = "1.0.0";

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

/// Name, kind and type of one port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSummary {
    pub name: String,
    pub kind: PortKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
}

impl From<&Port> for PortSummary {
    fn from(port: &Port) -> Self {
        Self {
            name: port.name.clone(),
            kind: port.kind,
            data_type: port.data_type,
        }
    }
}

impl From<&PortDefinition> for PortSummary {
    fn from(port: &PortDefinition) -> Self {
        Self {
            name: port.name.clone(),
            kind: port.kind,
            data_type: port.data_type,
        }
    }
}

/// Port layout of a node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortShape {
    pub inputs: Vec<PortSummary>,
    pub outputs: Vec<PortSummary>,
}

impl PortShape {
    pub fn of_definition(definition: &NodeDefinition) -> Self {
        Self {
            inputs: definition.inputs.iter().map(PortSummary::from).collect(),
            outputs: definition.outputs.iter().map(PortSummary::from).collect(),
        }
    }

    fn of_node(node: &Node) -> Self {
        Self {
            inputs: node.inputs.iter().map(PortSummary::from).collect(),
            outputs: node.outputs.iter().map(PortSummary::from).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescription {
    pub id: NodeId,
    pub node_type: String,
    pub title: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Checked against the registry on load when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortShape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceId>,
    /// Values of unconnected Data inputs that differ from the port default
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
}

/// Complete description of a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDescription {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub id: String,
    pub name: String,
    pub nodes: Vec<NodeDescription>,
    pub connections: Vec<Connection>,
}

impl GraphDescription {
    /// Describe a graph
    pub fn from_graph(graph: &FlowGraph) -> Self {
        let nodes = graph
            .nodes()
            .map(|node| {
                let definition = graph.definition(&node.node_type);
                let inputs = node
                    .inputs
                    .iter()
                    .filter(|port| port.is_data())
                    .filter(|port| graph.incoming(&node.id, port.index).is_none())
                    .filter(|port| !node.properties.contains_key(&port.name))
                    .filter(|port| {
                        let default = definition
                            .and_then(|d| d.inputs.get(port.index))
                            .map(|d| Port::from_definition(port.index, d).value);
                        default.as_ref() != Some(&port.value)
                    })
                    .map(|port| (port.name.clone(), port.value.clone()))
                    .collect();

                NodeDescription {
                    id: node.id.clone(),
                    node_type: node.node_type.clone(),
                    title: node.title.clone(),
                    position: node.position,
                    properties: node.properties.clone(),
                    ports: Some(PortShape::of_node(node)),
                    device: node.device.clone(),
                    inputs,
                }
            })
            .collect();

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            id: graph.id().to_string(),
            name: graph.name().to_string(),
            nodes,
            connections: graph.connections().to_vec(),
        }
    }

    /// Rebuild a graph, rejecting the whole description on the first error
    pub fn to_graph(&self, registry: Arc<NodeRegistry>) -> std::result::Result<FlowGraph, GraphError> {
        let mut graph = FlowGraph::new(registry);
        graph.set_id(self.id.clone());
        graph.set_name(self.name.clone());

        for described in &self.nodes {
            let definition = graph
                .definition(&described.node_type)
                .ok_or_else(|| GraphError::UnknownNodeType(described.node_type.clone()))?;
            if let Some(ports) = &described.ports {
                if *ports != PortShape::of_definition(definition) {
                    return Err(GraphError::PortShapeMismatch {
                        node_id: described.id.clone(),
                        node_type: described.node_type.clone(),
                    });
                }
            }

            graph.add_node_with_id(
                described.id.clone(),
                &described.node_type,
                described.position,
                described.properties.clone(),
            )?;
            if let Some(node) = graph.get_node_mut(&described.id) {
                node.title = described.title.clone();
            }
            if described.device.is_some() {
                graph.set_device(&described.id, described.device.clone())?;
            }
            for (name, value) in &described.inputs {
                let index = graph
                    .get_node(&described.id)
                    .and_then(|n| n.input_index(name))
                    .ok_or_else(|| GraphError::UnknownPortName {
                        node_id: described.id.clone(),
                        port: name.clone(),
                    })?;
                graph.store_input(&described.id, index, value.clone())?;
            }
        }

        for connection in &self.connections {
            graph
                .add_connection(ConnectionSpec::from(connection))
                .map_err(|reason| GraphError::InvalidConnection {
                    connection_id: connection.id.clone(),
                    reason: Box::new(reason),
                })?;
        }

        graph.take_changes();
        Ok(graph)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&json)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        tokio::fs::write(path.as_ref(), self.to_json()?).await?;
        Ok(())
    }
}
