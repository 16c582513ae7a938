//! Input Node
//!
//! Reads the bound input device once per invocation.

use async_trait::async_trait;
use flow_engine::{
    DataType, ExecutionMode, Fired, HardwareRequirement, NodeCategory, NodeContext,
    NodeDefinition, NodeDescriptor, NodeOperation, PinKind, PortDefinition, Result,
};

/// Reads the bound device into `value`, then fires `next`
#[derive(Debug, Default, Clone, Copy)]
pub struct InputNode;

impl InputNode {
    pub const NODE_TYPE: &'static str = "Input";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_NEXT: &'static str = "next";
    pub const PORT_VALUE: &'static str = "value";

    const OUTPUT_VALUE: usize = 1;
}

impl NodeDescriptor for InputNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Experiment, ExecutionMode::Imperative)
            .with_description("Read from a device (digital or analog)")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_output(PortDefinition::control(Self::PORT_NEXT))
            .with_output(
                PortDefinition::data(Self::PORT_VALUE, DataType::Any).with_description("Read value"),
            )
            .with_hardware(HardwareRequirement::input(&[PinKind::Digital, PinKind::Analog]))
    }
}

#[async_trait]
impl NodeOperation for InputNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let value = ctx.read_device().await?;
        log::debug!("Input '{}': read {}", ctx.node_id(), value);
        ctx.set_output(Self::OUTPUT_VALUE, value)?;
        Ok(Fired::one(0))
    }
}
