//! Pre-run graph validation
//!
//! Edits already keep the graph structurally sound. Validation checks the
//! things that only matter when a run starts: that there is somewhere to
//! begin, that every hardware node points at a usable device and that no
//! two devices in use share a pin. It reports every problem at once.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::binding::BindingLayer;
use crate::graph::FlowGraph;
use crate::hardware::{HardwareManager, PinId};
use crate::types::PortKind;

/// A problem found in a graph before a run
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// No node can start a control path
    NoEntryNode,
    /// Data connections form a cycle
    DataCycle { node_id: String },
    /// A hardware node has no device configured
    UnboundHardwareNode { node_id: String, node_type: String },
    /// A node references a device the hardware manager does not know
    UnknownDevice { node_id: String, device_id: String },
    /// The configured device cannot serve the node type
    IncompatibleDevice {
        node_id: String,
        device_id: String,
        reason: String,
    },
    /// Two devices used by the graph sit on the same pin
    PinConflict {
        board_id: String,
        pin: PinId,
        devices: Vec<String>,
    },
    /// An imperative node no control path can reach
    UnreachableNode { node_id: String },
}

impl ValidationError {
    /// Fatal problems abort `start()`; the rest are warnings
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnreachableNode { .. })
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoEntryNode => write!(f, "Graph has no entry node"),
            Self::DataCycle { node_id } => {
                write!(f, "Data connections form a cycle through node '{}'", node_id)
            }
            Self::UnboundHardwareNode { node_id, node_type } => {
                write!(
                    f,
                    "Hardware node '{}' ({}) has no device configured",
                    node_id, node_type
                )
            }
            Self::UnknownDevice { node_id, device_id } => {
                write!(f, "Node '{}' references unknown device '{}'", node_id, device_id)
            }
            Self::IncompatibleDevice {
                node_id,
                device_id,
                reason,
            } => {
                write!(
                    f,
                    "Device '{}' cannot be used by node '{}': {}",
                    device_id, node_id, reason
                )
            }
            Self::PinConflict {
                board_id,
                pin,
                devices,
            } => {
                write!(
                    f,
                    "Pin {} on board '{}' is used by several devices: {}",
                    pin,
                    board_id,
                    devices.join(", ")
                )
            }
            Self::UnreachableNode { node_id } => {
                write!(f, "Node '{}' is not reachable from any entry node", node_id)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a graph against the available hardware
///
/// Returns all problems found, fatal or not.
pub fn validate_graph(graph: &FlowGraph, hardware: &HardwareManager) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    let entries = graph.entry_nodes();
    if entries.is_empty() {
        errors.push(ValidationError::NoEntryNode);
    }
    detect_data_cycles(graph, &mut errors);
    validate_devices(graph, hardware, &mut errors);
    let mut roots = entries;
    roots.extend(graph.on_demand_nodes());
    find_unreachable(graph, &roots, &mut errors);

    errors
}

/// Kahn's algorithm over Data connections; leftover nodes sit on a cycle
fn detect_data_cycles(graph: &FlowGraph, errors: &mut Vec<ValidationError>) {
    let mut in_degree: HashMap<&str, usize> = graph.nodes().map(|n| (n.id.as_str(), 0)).collect();
    for connection in graph.connections().iter().filter(|c| c.kind == PortKind::Data) {
        if let Some(degree) = in_degree.get_mut(connection.target.as_str()) {
            *degree += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;

    while let Some(node_id) = queue.pop_front() {
        visited += 1;
        for connection in graph
            .connections()
            .iter()
            .filter(|c| c.kind == PortKind::Data && c.source == node_id)
        {
            if let Some(degree) = in_degree.get_mut(connection.target.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(connection.target.as_str());
                }
            }
        }
    }

    if visited < in_degree.len() {
        let mut stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(id, _)| *id)
            .collect();
        stuck.sort_unstable();
        errors.push(ValidationError::DataCycle {
            node_id: stuck.first().map(|s| s.to_string()).unwrap_or_default(),
        });
    }
}

fn validate_devices(graph: &FlowGraph, hardware: &HardwareManager, errors: &mut Vec<ValidationError>) {
    let mut pins: HashMap<(String, PinId), Vec<String>> = HashMap::new();

    for node in graph.nodes() {
        let Some(definition) = graph.definition(&node.node_type) else {
            continue;
        };
        if definition.hardware.is_none() {
            continue;
        }
        let Some(device_id) = &node.device else {
            errors.push(ValidationError::UnboundHardwareNode {
                node_id: node.id.clone(),
                node_type: node.node_type.clone(),
            });
            continue;
        };
        let Some(device) = hardware.device(device_id) else {
            errors.push(ValidationError::UnknownDevice {
                node_id: node.id.clone(),
                device_id: device_id.clone(),
            });
            continue;
        };

        let compatible = hardware
            .validate_device(device_id)
            .and_then(|_| BindingLayer::check_compatible(definition, &device));
        if let Err(e) = compatible {
            errors.push(ValidationError::IncompatibleDevice {
                node_id: node.id.clone(),
                device_id: device_id.clone(),
                reason: e.to_string(),
            });
            continue;
        }

        let users = pins.entry((device.board_id.clone(), device.pin)).or_default();
        if !users.contains(&device.id) {
            users.push(device.id.clone());
        }
    }

    let mut conflicts: Vec<ValidationError> = pins
        .into_iter()
        .filter(|(_, devices)| devices.len() > 1)
        .map(|((board_id, pin), mut devices)| {
            devices.sort();
            ValidationError::PinConflict {
                board_id,
                pin,
                devices,
            }
        })
        .collect();
    conflicts.sort_by_key(|c| c.to_string());
    errors.extend(conflicts);
}

fn find_unreachable(graph: &FlowGraph, entries: &[String], errors: &mut Vec<ValidationError>) {
    let mut reached: HashSet<&str> = HashSet::new();
    let mut stack: Vec<&str> = entries.iter().map(|s| s.as_str()).collect();
    while let Some(node_id) = stack.pop() {
        if !reached.insert(node_id) {
            continue;
        }
        for connection in graph
            .connections()
            .iter()
            .filter(|c| c.kind == PortKind::Control && c.source == node_id)
        {
            stack.push(connection.target.as_str());
        }
    }

    for node in graph.nodes() {
        let has_control = node.inputs.iter().any(|p| p.is_control());
        if has_control && !reached.contains(node.id.as_str()) {
            errors.push(ValidationError::UnreachableNode {
                node_id: node.id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{HardwareRequirement, NodeDefinition};
    use crate::hardware::{DeviceConfig, MockBoard, PinKind};
    use crate::registry::NodeRegistry;
    use crate::types::{ConnectionSpec, ExecutionMode, NodeCategory, PortDefinition, Position};
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn registry() -> Arc<NodeRegistry> {
        let mut registry = NodeRegistry::new();
        registry.register_callback(
            NodeDefinition::new("Start", NodeCategory::Experiment, ExecutionMode::Imperative)
                .with_output(PortDefinition::control("next")),
            |_| async { Ok(Default::default()) },
        );
        registry.register_callback(
            NodeDefinition::new("Led", NodeCategory::Hardware, ExecutionMode::Imperative)
                .with_input(PortDefinition::control("exec"))
                .with_output(PortDefinition::control("next"))
                .with_hardware(HardwareRequirement::output(&[PinKind::Digital])),
            |_| async { Ok(Default::default()) },
        );
        Arc::new(registry)
    }

    fn hardware() -> HardwareManager {
        let hardware = HardwareManager::new();
        hardware.add_board(Arc::new(MockBoard::new("uno")));
        hardware
            .add_device(DeviceConfig::digital_output("led", "uno", 13))
            .unwrap();
        hardware
            .add_device(DeviceConfig::digital_output("also_13", "uno", 13))
            .unwrap();
        hardware
            .add_device(DeviceConfig::input("button", "uno", 2, PinKind::Digital))
            .unwrap();
        hardware
    }

    fn with_device(device: &str) -> Map<String, serde_json::Value> {
        let mut props = Map::new();
        props.insert("device".into(), json!(device));
        props
    }

    #[test]
    fn test_empty_graph_has_no_entry() {
        let graph = FlowGraph::new(registry());
        assert_eq!(validate_graph(&graph, &hardware()), vec![ValidationError::NoEntryNode]);
    }

    #[test]
    fn test_valid_graph() {
        let mut graph = FlowGraph::new(registry());
        graph
            .add_node_with_id("start", "Start", Position::default(), Map::new())
            .unwrap();
        graph
            .add_node_with_id("on", "Led", Position::default(), with_device("led"))
            .unwrap();
        graph.add_connection(ConnectionSpec::new("start", 0, "on", 0)).unwrap();
        assert!(validate_graph(&graph, &hardware()).is_empty());
    }

    #[test]
    fn test_device_problems_are_fatal() {
        let mut graph = FlowGraph::new(registry());
        graph
            .add_node_with_id("start", "Start", Position::default(), Map::new())
            .unwrap();
        graph
            .add_node_with_id("bare", "Led", Position::default(), Map::new())
            .unwrap();
        graph
            .add_node_with_id("ghost", "Led", Position::default(), with_device("nope"))
            .unwrap();
        graph
            .add_node_with_id("wrong", "Led", Position::default(), with_device("button"))
            .unwrap();
        graph
            .add_node_with_id("a", "Led", Position::default(), with_device("led"))
            .unwrap();
        graph
            .add_node_with_id("b", "Led", Position::default(), with_device("also_13"))
            .unwrap();

        let errors = validate_graph(&graph, &hardware());
        assert!(errors.contains(&ValidationError::UnboundHardwareNode {
            node_id: "bare".into(),
            node_type: "Led".into()
        }));
        assert!(errors.contains(&ValidationError::UnknownDevice {
            node_id: "ghost".into(),
            device_id: "nope".into()
        }));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::IncompatibleDevice { node_id, .. } if node_id == "wrong")));
        assert!(errors.contains(&ValidationError::PinConflict {
            board_id: "uno".into(),
            pin: 13,
            devices: vec!["also_13".into(), "led".into()],
        }));
        assert!(errors.iter().any(|e| !e.is_fatal()));
    }
}
