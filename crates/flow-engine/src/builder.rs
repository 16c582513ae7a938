//! Fluent builder for graph descriptions
//!
//! Lets tests and embedding code describe a graph with port names instead
//! of indices. Names are resolved against a registry when the description
//! is built.

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::description::{GraphDescription, NodeDescription, SCHEMA_VERSION};
use crate::error::GraphError;
use crate::graph::TITLE_PROPERTY;
use crate::registry::NodeRegistry;
use crate::types::{Connection, DeviceId, Position};

struct PendingConnection {
    id: Option<String>,
    source: String,
    source_port: String,
    target: String,
    target_port: String,
}

/// Fluent builder producing a [`GraphDescription`]
///
/// # Example
///
/// ```ignore
/// let description = GraphBuilder::new("blink")
///     .node("start", "StartExperiment")
///     .node("on", "Output")
///     .with_device("led")
///     .with_property("value", json!(true))
///     .connect("start", "next", "on", "exec")
///     .build(&registry)?;
/// ```
pub struct GraphBuilder {
    id: String,
    name: String,
    nodes: Vec<NodeDescription>,
    connections: Vec<PendingConnection>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            nodes: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a node; later `with_*` calls apply to it
    pub fn node(mut self, id: impl Into<String>, node_type: impl Into<String>) -> Self {
        let x = self.nodes.len() as f64 * 200.0;
        self.nodes.push(NodeDescription {
            id: id.into(),
            node_type: node_type.into(),
            title: String::new(),
            position: Position::new(x, 0.0),
            properties: Map::new(),
            ports: None,
            device: None,
            inputs: Map::new(),
        });
        self
    }

    pub fn at(mut self, position: impl Into<Position>) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.position = position.into();
        }
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.title = title.into();
        }
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.properties.insert(key.into(), value);
        }
        self
    }

    pub fn with_device(mut self, device: impl Into<DeviceId>) -> Self {
        if let Some(node) = self.nodes.last_mut() {
            node.device = Some(device.into());
        }
        self
    }

    /// Connect two ports by name
    pub fn connect(
        mut self,
        source: impl Into<String>,
        source_port: impl Into<String>,
        target: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        self.connections.push(PendingConnection {
            id: None,
            source: source.into(),
            source_port: source_port.into(),
            target: target.into(),
            target_port: target_port.into(),
        });
        self
    }

    pub fn connect_with_id(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        source_port: impl Into<String>,
        target: impl Into<String>,
        target_port: impl Into<String>,
    ) -> Self {
        self.connections.push(PendingConnection {
            id: Some(id.into()),
            source: source.into(),
            source_port: source_port.into(),
            target: target.into(),
            target_port: target_port.into(),
        });
        self
    }

    /// Resolve types and port names against `registry`
    ///
    /// Only names are checked here; structural rules are enforced when the
    /// description is loaded.
    pub fn build(self, registry: &NodeRegistry) -> Result<GraphDescription, GraphError> {
        let mut nodes = self.nodes;
        for node in nodes.iter_mut() {
            let definition = registry
                .get_definition(&node.node_type)
                .ok_or_else(|| GraphError::UnknownNodeType(node.node_type.clone()))?;
            if node.title.is_empty() {
                node.title = node
                    .properties
                    .get(TITLE_PROPERTY)
                    .and_then(|v| v.as_str())
                    .unwrap_or(&definition.label)
                    .to_string();
            }
        }

        let mut connections = Vec::with_capacity(self.connections.len());
        for (n, pending) in self.connections.into_iter().enumerate() {
            let source_type = node_type(&nodes, &pending.source)?;
            let target_type = node_type(&nodes, &pending.target)?;
            let source_definition = registry
                .get_definition(source_type)
                .ok_or_else(|| GraphError::UnknownNodeType(source_type.to_string()))?;
            let target_definition = registry
                .get_definition(target_type)
                .ok_or_else(|| GraphError::UnknownNodeType(target_type.to_string()))?;

            let source_port = source_definition
                .output_index(&pending.source_port)
                .ok_or_else(|| GraphError::UnknownPortName {
                    node_id: pending.source.clone(),
                    port: pending.source_port.clone(),
                })?;
            let target_port = target_definition
                .input_index(&pending.target_port)
                .ok_or_else(|| GraphError::UnknownPortName {
                    node_id: pending.target.clone(),
                    port: pending.target_port.clone(),
                })?;

            connections.push(Connection {
                id: pending.id.unwrap_or_else(|| format!("c{}", n + 1)),
                source: pending.source,
                source_port,
                target: pending.target,
                target_port,
                kind: source_definition.outputs[source_port].kind,
            });
        }

        Ok(GraphDescription {
            schema_version: SCHEMA_VERSION.to_string(),
            id: self.id,
            name: self.name,
            nodes,
            connections,
        })
    }
}

fn node_type<'a>(nodes: &'a [NodeDescription], id: &str) -> Result<&'a str, GraphError> {
    nodes
        .iter()
        .find(|n| n.id == id)
        .map(|n| n.node_type.as_str())
        .ok_or_else(|| GraphError::UnknownNode(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::NodeDefinition;
    use crate::types::{DataType, ExecutionMode, NodeCategory, PortDefinition, PortKind};
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> NodeRegistry {
        let mut registry = NodeRegistry::new();
        registry.register_callback(
            NodeDefinition::new("Wait", NodeCategory::Experiment, ExecutionMode::Imperative)
                .with_label("Wait a While")
                .with_input(PortDefinition::control("exec"))
                .with_input(PortDefinition::data("duration", DataType::Float))
                .with_output(PortDefinition::control("next")),
            |_| async { Ok(Default::default()) },
        );
        registry
    }

    #[test]
    fn test_build_resolves_names() {
        let registry = registry();
        let description = GraphBuilder::new("waits")
            .node("w1", "Wait")
            .with_property("duration", json!(0.5))
            .node("w2", "Wait")
            .with_title("Second wait")
            .connect("w1", "next", "w2", "exec")
            .build(&registry)
            .unwrap();

        assert_eq!(description.nodes[0].title, "Wait a While");
        assert_eq!(description.nodes[1].title, "Second wait");
        let connection = &description.connections[0];
        assert_eq!((connection.source_port, connection.target_port), (0, 0));
        assert_eq!(connection.kind, PortKind::Control);

        let graph = description.to_graph(Arc::new(registry)).unwrap();
        assert_eq!(graph.get_input("w1", 1).unwrap(), json!(0.5));
        assert_eq!(graph.entry_nodes(), vec!["w1".to_string()]);
    }

    #[test]
    fn test_build_rejects_unknown_names() {
        let registry = registry();
        let err = GraphBuilder::new("bad")
            .node("w1", "Wait")
            .connect("w1", "after", "w1", "exec")
            .build(&registry)
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownPortName { .. }));

        let err = GraphBuilder::new("bad")
            .node("w1", "Sleep")
            .build(&registry)
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownNodeType("Sleep".into()));
    }
}
