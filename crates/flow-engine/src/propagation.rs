//! Reactive value propagation
//!
//! When a Data output changes, every reactive node that depends on it,
//! directly or through other reactive nodes, is recomputed in one pass:
//!
//! 1. Walk Data connections from the changed node to collect the affected
//!    reactive set.
//! 2. Order the induced subgraph with Kahn's algorithm.
//! 3. Recompute each node exactly once; changed outputs are stored, pushed
//!    to their targets and announced as `OutputChanged`.
//!
//! Imperative targets receive new input values but are never recomputed.
//! Values fed back with `feed_input` start nested passes one level deeper,
//! bounded by `max_propagation_depth`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use serde_json::Value;

use crate::context::{Feed, RecomputeContext};
use crate::error::{FlowEngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::graph::FlowGraph;
use crate::types::{NodeId, PortKind};

enum Seed {
    /// Outputs of this node were already stored and announced
    OutputsChanged(NodeId),
    /// Inputs of this node changed; recompute it if reactive
    InputsChanged(NodeId),
}

impl Seed {
    fn node_id(&self) -> &str {
        match self {
            Seed::OutputsChanged(id) | Seed::InputsChanged(id) => id,
        }
    }
}

pub(crate) struct Propagator<'a> {
    events: &'a EventBus,
    max_depth: usize,
    elapsed: Duration,
}

impl<'a> Propagator<'a> {
    pub(crate) fn new(events: &'a EventBus, max_depth: usize, elapsed: Duration) -> Self {
        Self {
            events,
            max_depth,
            elapsed,
        }
    }

    /// Store a Data output written by an imperative node and propagate it
    pub(crate) fn set_output(
        &self,
        graph: &mut FlowGraph,
        node_id: &str,
        index: usize,
        value: Value,
    ) -> Result<()> {
        if !graph.store_output(node_id, index, value)? {
            return Ok(());
        }
        self.announce_output(graph, node_id, index);
        self.drain(graph, Seed::OutputsChanged(node_id.to_string()))
    }

    /// Recompute a node after one of its inputs or properties changed
    pub(crate) fn inputs_changed(&self, graph: &mut FlowGraph, node_id: &str) -> Result<()> {
        self.drain(graph, Seed::InputsChanged(node_id.to_string()))
    }

    fn drain(&self, graph: &mut FlowGraph, seed: Seed) -> Result<()> {
        let mut queue: VecDeque<(Seed, usize)> = VecDeque::new();
        queue.push_back((seed, 0));

        while let Some((seed, depth)) = queue.pop_front() {
            if depth > self.max_depth {
                log::error!(
                    "Propagation depth {} exceeded at node '{}'",
                    depth,
                    seed.node_id()
                );
                return Err(FlowEngineError::PropagationDepthExceeded {
                    node_id: seed.node_id().to_string(),
                    depth,
                });
            }

            for feed in self.pass(graph, seed) {
                match graph.store_input(&feed.node_id, feed.index, feed.value) {
                    Ok(_) => queue.push_back((Seed::InputsChanged(feed.node_id), depth + 1)),
                    Err(e) => log::warn!("Dropped fed value: {}", e),
                }
            }
        }
        Ok(())
    }

    /// One propagation pass; returns values fed back for nested passes
    fn pass(&self, graph: &mut FlowGraph, seed: Seed) -> Vec<Feed> {
        let frontier = match &seed {
            Seed::OutputsChanged(id) => push_outputs(graph, id, None),
            Seed::InputsChanged(id) => vec![id.clone()],
        };

        let affected = affected_reactive(graph, &frontier);
        let order = topological_order(graph, &affected);
        let mut feeds = Vec::new();

        for node_id in order {
            let changed = self.recompute(graph, &node_id, &mut feeds);
            for index in changed {
                push_outputs(graph, &node_id, Some(index));
            }
        }
        feeds
    }

    /// Recompute one node, returning the indices of outputs that changed
    fn recompute(&self, graph: &mut FlowGraph, node_id: &str, feeds: &mut Vec<Feed>) -> Vec<usize> {
        let (operation, properties, mut state, inputs, output_count, had_error) = {
            let node = match graph.get_node(node_id) {
                Some(node) => node,
                None => return Vec::new(),
            };
            let operation = match graph.registry().get_operation(&node.node_type) {
                Some(operation) => operation,
                None => return Vec::new(),
            };
            (
                operation,
                node.properties.clone(),
                node.state.clone(),
                node.input_values(),
                node.outputs.len(),
                node.error.is_some(),
            )
        };

        let mut ctx = RecomputeContext::new(
            node_id,
            inputs,
            &properties,
            &mut state,
            output_count,
            self.elapsed,
        );
        let result = operation.recompute(&mut ctx);
        let (outputs, error, fed) = ctx.into_parts();

        if let Some(node) = graph.get_node_mut(node_id) {
            node.state = state;
        }

        if let Err(e) = result {
            self.node_error(graph, node_id, &e.to_string());
            return Vec::new();
        }
        match error {
            Some(message) => self.node_error(graph, node_id, &message),
            None if had_error => graph.set_error(node_id, None),
            None => {}
        }
        feeds.extend(fed);

        let mut changed = Vec::new();
        for (index, value) in outputs.into_iter().enumerate() {
            let Some(value) = value else { continue };
            match graph.store_output(node_id, index, value) {
                Ok(true) => {
                    self.announce_output(graph, node_id, index);
                    changed.push(index);
                }
                Ok(false) => {}
                Err(e) => log::warn!("Node '{}' output {}: {}", node_id, index, e),
            }
        }
        changed
    }

    fn announce_output(&self, graph: &FlowGraph, node_id: &str, index: usize) {
        if let Some(port) = graph.get_node(node_id).and_then(|n| n.output(index)) {
            self.events.emit(EngineEvent::output_changed(
                node_id,
                index,
                &port.name,
                port.value.clone(),
                self.elapsed.as_millis() as u64,
            ));
        }
    }

    fn node_error(&self, graph: &mut FlowGraph, node_id: &str, message: &str) {
        log::warn!("Node '{}' recompute failed: {}", node_id, message);
        graph.set_error(node_id, Some(message.to_string()));
        self.events.emit(EngineEvent::node_error(
            node_id,
            message,
            self.elapsed.as_millis() as u64,
        ));
    }
}

/// Copy a node's Data outputs into connected inputs; returns the targets
fn push_outputs(graph: &mut FlowGraph, node_id: &str, only: Option<usize>) -> Vec<NodeId> {
    let deliveries: Vec<(NodeId, usize, Value)> = graph
        .connections()
        .iter()
        .filter(|c| c.kind == PortKind::Data && c.source == node_id)
        .filter(|c| only.map_or(true, |i| c.source_port == i))
        .filter_map(|c| {
            graph
                .get_output(node_id, c.source_port)
                .ok()
                .map(|value| (c.target.clone(), c.target_port, value))
        })
        .collect();

    let mut targets = Vec::new();
    for (target, index, value) in deliveries {
        if let Err(e) = graph.store_input(&target, index, value) {
            log::warn!("Could not deliver value to '{}' input {}: {}", target, index, e);
        }
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
    targets
}

/// Reactive nodes reachable from the frontier through reactive nodes
fn affected_reactive(graph: &FlowGraph, frontier: &[NodeId]) -> HashSet<NodeId> {
    let mut affected = HashSet::new();
    let mut stack: Vec<NodeId> = frontier.to_vec();
    while let Some(node_id) = stack.pop() {
        let reactive = graph
            .get_node(&node_id)
            .map(|n| n.is_reactive())
            .unwrap_or(false);
        if !reactive || !affected.insert(node_id.clone()) {
            continue;
        }
        for connection in graph.connections() {
            if connection.kind == PortKind::Data && connection.source == node_id {
                stack.push(connection.target.clone());
            }
        }
    }
    affected
}

/// Kahn's algorithm over the subgraph induced by `affected`
///
/// Ties are broken by graph insertion order so passes are deterministic.
fn topological_order(graph: &FlowGraph, affected: &HashSet<NodeId>) -> Vec<NodeId> {
    let mut in_degree: HashMap<&str, usize> = affected.iter().map(|id| (id.as_str(), 0)).collect();
    for connection in graph.connections() {
        if connection.kind == PortKind::Data
            && affected.contains(&connection.source)
            && affected.contains(&connection.target)
        {
            if let Some(degree) = in_degree.get_mut(connection.target.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut queue: VecDeque<NodeId> = graph
        .nodes()
        .filter(|n| in_degree.get(n.id.as_str()) == Some(&0))
        .map(|n| n.id.clone())
        .collect();
    let mut order = Vec::with_capacity(affected.len());

    while let Some(node_id) = queue.pop_front() {
        for connection in graph.connections() {
            if connection.kind != PortKind::Data || connection.source != node_id {
                continue;
            }
            if let Some(degree) = in_degree.get_mut(connection.target.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(connection.target.clone());
                }
            }
        }
        order.push(node_id);
    }
    order
}
