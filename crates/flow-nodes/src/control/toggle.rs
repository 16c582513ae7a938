//! Toggle Node
//!
//! A latch driven by control flow. Which input the path arrives through
//! decides the new state; the state persists across invocations within
//! the node's state blob.

use async_trait::async_trait;
use flow_engine::{
    DataType, ExecutionMode, Fired, NodeCategory, NodeContext, NodeDefinition, NodeDescriptor,
    NodeOperation, PortDefinition, Result,
};
use serde_json::{json, Value};

/// Flip, set or clear a boolean and fire `on` or `off` accordingly
#[derive(Debug, Default, Clone, Copy)]
pub struct ToggleNode;

impl ToggleNode {
    pub const NODE_TYPE: &'static str = "Toggle";
    pub const PORT_TOGGLE: &'static str = "toggle";
    pub const PORT_SET_ON: &'static str = "set_on";
    pub const PORT_SET_OFF: &'static str = "set_off";
    pub const PORT_ON: &'static str = "on";
    pub const PORT_OFF: &'static str = "off";
    pub const PORT_STATE: &'static str = "state";

    const INPUT_SET_ON: usize = 1;
    const INPUT_SET_OFF: usize = 2;
    const OUTPUT_ON: usize = 0;
    const OUTPUT_OFF: usize = 1;
    const OUTPUT_STATE: usize = 2;
    const STATE_KEY: &'static str = "toggle_state";
}

impl NodeDescriptor for ToggleNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Logic, ExecutionMode::Imperative)
            .with_description("Toggle state on each trigger")
            .with_input(PortDefinition::control(Self::PORT_TOGGLE))
            .with_input(PortDefinition::control(Self::PORT_SET_ON))
            .with_input(PortDefinition::control(Self::PORT_SET_OFF))
            .with_output(PortDefinition::control(Self::PORT_ON))
            .with_output(PortDefinition::control(Self::PORT_OFF))
            .with_output(PortDefinition::data(Self::PORT_STATE, DataType::Bool))
    }
}

#[async_trait]
impl NodeOperation for ToggleNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let current = ctx
            .state(Self::STATE_KEY)
            .as_ref()
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let next = match ctx.trigger() {
            Some(Self::INPUT_SET_ON) => true,
            Some(Self::INPUT_SET_OFF) => false,
            _ => !current,
        };

        ctx.set_state(Self::STATE_KEY, json!(next));
        ctx.set_output(Self::OUTPUT_STATE, json!(next))?;
        Ok(Fired::one(if next {
            Self::OUTPUT_ON
        } else {
            Self::OUTPUT_OFF
        }))
    }
}
