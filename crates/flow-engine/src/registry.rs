//! Node type registry
//!
//! Maps node type strings to their [`NodeDefinition`] and the
//! [`NodeOperation`] that implements them. A registry is populated at
//! startup, wrapped in an `Arc` and handed to the engine; it is never
//! mutated while a run is in progress.
//!
//! # Usage
//!
//! ```ignore
//! let mut registry = NodeRegistry::new();
//! registry.register_node::<DelayNode>();
//! registry.merge(plugin_registry);
//! let engine = FlowEngine::new(Arc::new(registry), hardware, EngineConfig::default());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::context::{Fired, NodeContext, RecomputeContext};
use crate::descriptor::{NodeDefinition, NodeDescriptor};
use crate::error::Result;
use crate::types::NodeCategory;

/// Behaviour of a node type
///
/// Reactive types implement `recompute`, which runs synchronously inside
/// a propagation pass. Imperative types implement `execute`, which the
/// sequencer awaits and which returns the control outputs to fire.
/// Per-node state lives in the node's state blob, so one operation
/// instance is shared by every node of its type.
#[async_trait]
pub trait NodeOperation: Send + Sync {
    fn recompute(&self, _ctx: &mut RecomputeContext<'_>) -> Result<()> {
        Ok(())
    }

    async fn execute(&self, _ctx: &NodeContext) -> Result<Fired> {
        Ok(Fired::none())
    }
}

/// Inputs handed to a callback-backed node
#[derive(Debug, Clone)]
pub struct CallbackInput {
    pub node_id: String,
    pub inputs: Vec<Value>,
    pub properties: Map<String, Value>,
}

/// What a callback-backed node produced
#[derive(Debug, Clone, Default)]
pub struct CallbackOutput {
    /// Output writes by port index
    pub outputs: Vec<(usize, Value)>,
    pub fired: Fired,
}

type BoxedCallback = Box<
    dyn Fn(CallbackInput) -> Pin<Box<dyn Future<Output = Result<CallbackOutput>> + Send>>
        + Send
        + Sync,
>;

/// Opaque user-supplied node body behind the operation contract
///
/// Faults inside the callback, including panics, are caught at the
/// invocation boundary like any other node operation.
pub struct CallbackNodeOperation {
    callback: BoxedCallback,
}

#[async_trait]
impl NodeOperation for CallbackNodeOperation {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let input = CallbackInput {
            node_id: ctx.node_id().to_string(),
            inputs: ctx.inputs(),
            properties: ctx.properties(),
        };
        let output = (self.callback)(input).await?;
        for (index, value) in output.outputs {
            ctx.set_output(index, value)?;
        }
        Ok(output.fired)
    }
}

/// Reactive node backed by a plain function
pub struct FnRecompute {
    recompute: Box<dyn Fn(&mut RecomputeContext<'_>) -> Result<()> + Send + Sync>,
}

#[async_trait]
impl NodeOperation for FnRecompute {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        (self.recompute)(ctx)
    }
}

struct RegistryEntry {
    definition: NodeDefinition,
    operation: Arc<dyn NodeOperation>,
}

/// Registry of node types with their definitions and operations
pub struct NodeRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl NodeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a node type, replacing any previous registration
    pub fn register(&mut self, definition: NodeDefinition, operation: Arc<dyn NodeOperation>) {
        log::debug!("Registering node type '{}'", definition.node_type);
        self.entries.insert(
            definition.node_type.clone(),
            RegistryEntry {
                definition,
                operation,
            },
        );
    }

    /// Register a self-describing node implementation
    pub fn register_node<T>(&mut self)
    where
        T: NodeDescriptor + NodeOperation + Default + 'static,
    {
        self.register(T::descriptor(), Arc::new(T::default()));
    }

    /// Register an imperative node type backed by an async callback
    pub fn register_callback<F, Fut>(&mut self, definition: NodeDefinition, callback: F)
    where
        F: Fn(CallbackInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallbackOutput>> + Send + 'static,
    {
        let operation = CallbackNodeOperation {
            callback: Box::new(move |input| Box::pin(callback(input))),
        };
        self.register(definition, Arc::new(operation));
    }

    /// Register a reactive node type backed by a recompute function
    pub fn register_fn<F>(&mut self, definition: NodeDefinition, recompute: F)
    where
        F: Fn(&mut RecomputeContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        let operation = FnRecompute {
            recompute: Box::new(recompute),
        };
        self.register(definition, Arc::new(operation));
    }

    pub fn get_definition(&self, node_type: &str) -> Option<&NodeDefinition> {
        self.entries.get(node_type).map(|e| &e.definition)
    }

    pub fn get_operation(&self, node_type: &str) -> Option<Arc<dyn NodeOperation>> {
        self.entries.get(node_type).map(|e| e.operation.clone())
    }

    pub fn all_definitions(&self) -> Vec<&NodeDefinition> {
        let mut all: Vec<&NodeDefinition> = self.entries.values().map(|e| &e.definition).collect();
        all.sort_by(|a, b| a.node_type.cmp(&b.node_type));
        all
    }

    /// Definitions grouped by category
    pub fn definitions_by_category(&self) -> HashMap<NodeCategory, Vec<&NodeDefinition>> {
        let mut grouped: HashMap<NodeCategory, Vec<&NodeDefinition>> = HashMap::new();
        for definition in self.all_definitions() {
            grouped
                .entry(definition.category.clone())
                .or_default()
                .push(definition);
        }
        grouped
    }

    pub fn has_node_type(&self, node_type: &str) -> bool {
        self.entries.contains_key(node_type)
    }

    /// Registered type names, sorted
    pub fn node_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge another registry into this one
    ///
    /// Entries from `other` override entries in `self` with the same type name.
    pub fn merge(&mut self, other: NodeRegistry) {
        self.entries.extend(other.entries);
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, ExecutionMode, PortDefinition};
    use serde_json::json;

    fn doubler() -> NodeDefinition {
        NodeDefinition::new("Double", NodeCategory::Logic, ExecutionMode::Reactive)
            .with_input(PortDefinition::data("in", DataType::Float))
            .with_output(PortDefinition::data("out", DataType::Float))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = NodeRegistry::new();
        registry.register_fn(doubler(), |ctx| {
            let value = ctx.input_f64(0, 0.0);
            ctx.set_output(0, json!(value * 2.0));
            Ok(())
        });

        assert!(registry.has_node_type("Double"));
        assert!(!registry.has_node_type("Triple"));
        assert!(registry.get_operation("Double").is_some());
        assert_eq!(registry.get_definition("Double").unwrap().inputs.len(), 1);
    }

    #[test]
    fn test_merge_overrides() {
        let mut base = NodeRegistry::new();
        base.register_fn(doubler(), |_| Ok(()));

        let mut plugin = NodeRegistry::new();
        plugin.register_fn(doubler().with_label("Plugin Double"), |_| Ok(()));
        plugin.register_fn(
            NodeDefinition::new("Noop", NodeCategory::Logic, ExecutionMode::Reactive),
            |_| Ok(()),
        );

        base.merge(plugin);
        assert_eq!(base.len(), 2);
        assert_eq!(base.get_definition("Double").unwrap().label, "Plugin Double");
        assert_eq!(base.node_types(), vec!["Double", "Noop"]);
    }

    #[test]
    fn test_by_category() {
        let mut registry = NodeRegistry::new();
        registry.register_fn(doubler(), |_| Ok(()));
        registry.register_callback(
            NodeDefinition::new("Beep", NodeCategory::Hardware, ExecutionMode::Imperative),
            |_input| async { Ok(CallbackOutput::default()) },
        );

        let grouped = registry.definitions_by_category();
        assert_eq!(grouped[&NodeCategory::Logic].len(), 1);
        assert_eq!(grouped[&NodeCategory::Hardware].len(), 1);
    }
}
