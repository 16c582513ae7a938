//! Flow Function Nodes
//!
//! A flow function is a named chain of nodes that starts at a
//! `StartFunction` node. The chain never runs on its own; a `FunctionCall`
//! with the same `function_name` runs it and waits until every path it
//! started has finished, `EndFunction` being the conventional last step.

use std::time::Duration;

use async_trait::async_trait;
use flow_engine::{
    ExecutionMode, Fired, HardwareError, NodeCategory, NodeContext, NodeDefinition,
    NodeDescriptor, NodeOperation, PortDefinition, Result,
};
use serde_json::{json, Value};

const FUNCTION_NAME: &str = "function_name";
const DEFAULT_FUNCTION: &str = "MyFunction";

fn function_name(ctx: &NodeContext) -> Value {
    ctx.property(FUNCTION_NAME)
        .unwrap_or_else(|| json!(DEFAULT_FUNCTION))
}

/// Entry point of a flow function
///
/// # Properties
/// - `function_name` - name callers refer to, default `MyFunction`
#[derive(Debug, Default, Clone, Copy)]
pub struct StartFunctionNode;

impl StartFunctionNode {
    pub const NODE_TYPE: &'static str = "StartFunction";
    pub const PORT_NEXT: &'static str = "next";
}

impl NodeDescriptor for StartFunctionNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Logic, ExecutionMode::Imperative)
            .with_label("Start Function")
            .with_description("Entry point of a reusable flow function")
            .with_output(PortDefinition::control(Self::PORT_NEXT))
            .with_property(FUNCTION_NAME, json!(DEFAULT_FUNCTION))
            .on_demand()
    }
}

#[async_trait]
impl NodeOperation for StartFunctionNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        log::debug!("Function {} entered at '{}'", function_name(ctx), ctx.node_id());
        Ok(Fired::one(0))
    }
}

/// Marks the end of a flow function
#[derive(Debug, Default, Clone, Copy)]
pub struct EndFunctionNode;

impl EndFunctionNode {
    pub const NODE_TYPE: &'static str = "EndFunction";
    pub const PORT_EXEC: &'static str = "exec";
}

impl NodeDescriptor for EndFunctionNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Logic, ExecutionMode::Imperative)
            .with_label("End Function")
            .with_description("Completes a flow function")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
    }
}

#[async_trait]
impl NodeOperation for EndFunctionNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        log::debug!("Function path ended at '{}'", ctx.node_id());
        Ok(Fired::none())
    }
}

/// Run a flow function, then fire `next`
///
/// # Properties
/// - `function_name` - the `StartFunction` to run
/// - `timeout` - seconds to wait for the function, 0 waits forever
///
/// A timed-out call records an error on the node and continues; the
/// function keeps running in the background until it finishes or the run
/// stops.
#[derive(Debug, Default, Clone, Copy)]
pub struct FunctionCallNode;

impl FunctionCallNode {
    pub const NODE_TYPE: &'static str = "FunctionCall";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_NEXT: &'static str = "next";

    const OUTPUT_NEXT: usize = 0;
    const DEFAULT_TIMEOUT_SECONDS: f64 = 60.0;
}

impl NodeDescriptor for FunctionCallNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Logic, ExecutionMode::Imperative)
            .with_label("Call Function")
            .with_description("Run a flow function and wait for it to finish")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_output(PortDefinition::control(Self::PORT_NEXT))
            .with_property(FUNCTION_NAME, json!(DEFAULT_FUNCTION))
            .with_property("timeout", json!(Self::DEFAULT_TIMEOUT_SECONDS))
    }
}

#[async_trait]
impl NodeOperation for FunctionCallNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let name = function_name(ctx);
        let Some(entry) = ctx.find_node(StartFunctionNode::NODE_TYPE, FUNCTION_NAME, &name) else {
            return Err(HardwareError::NodeFault(format!("No function named {}", name)).into());
        };

        let seconds = ctx.property_f64("timeout", Self::DEFAULT_TIMEOUT_SECONDS);
        let timeout = (seconds.is_finite() && seconds > 0.0).then(|| Duration::from_secs_f64(seconds));
        log::debug!("FunctionCall '{}': running {} from '{}'", ctx.node_id(), name, entry);

        let call = ctx.call_path(&entry);
        match timeout {
            None => call.await?,
            Some(timeout) => tokio::select! {
                result = call => result?,
                slept = ctx.sleep(timeout) => {
                    slept?;
                    log::warn!(
                        "FunctionCall '{}': {} still running after {:?}",
                        ctx.node_id(),
                        name,
                        timeout
                    );
                    ctx.set_error(format!("Function {} did not finish within {:?}", name, timeout));
                }
            },
        }
        Ok(Fired::one(Self::OUTPUT_NEXT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_function_only_runs_when_called() {
        let def = StartFunctionNode::descriptor();
        assert!(def.on_demand);
        assert!(def.inputs.is_empty());
        assert_eq!(def.default_properties.get("function_name"), Some(&json!("MyFunction")));
    }

    #[test]
    fn test_call_descriptor() {
        let def = FunctionCallNode::descriptor();
        assert!(!def.on_demand);
        assert_eq!(def.output_index("next"), Some(FunctionCallNode::OUTPUT_NEXT));
        assert_eq!(def.default_properties.get("timeout"), Some(&json!(60.0)));
        assert!(EndFunctionNode::descriptor().outputs.is_empty());
    }
}
