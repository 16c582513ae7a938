//! Digital Nodes
//!
//! HIGH/LOW writes and reads on digital pins.

use async_trait::async_trait;
use flow_engine::{
    value_as_bool, DataType, ExecutionMode, Fired, HardwareRequirement, NodeCategory,
    NodeContext, NodeDefinition, NodeDescriptor, NodeOperation, PinKind, PortDefinition, Result,
};
use serde_json::{json, Value};

/// Write HIGH or LOW to a digital output
#[derive(Debug, Default, Clone, Copy)]
pub struct DigitalWriteNode;

impl DigitalWriteNode {
    pub const NODE_TYPE: &'static str = "DigitalWrite";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_VALUE: &'static str = "value";
    pub const PORT_NEXT: &'static str = "next";

    const INPUT_VALUE: usize = 1;
}

impl NodeDescriptor for DigitalWriteNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Hardware, ExecutionMode::Imperative)
            .with_label("Digital Write")
            .with_description("Write HIGH or LOW to a digital output pin")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_input(
                PortDefinition::data(Self::PORT_VALUE, DataType::Bool)
                    .with_default(json!(false))
                    .with_description("Value to write (true = HIGH)"),
            )
            .with_output(PortDefinition::control(Self::PORT_NEXT))
            .with_hardware(HardwareRequirement::output(&[PinKind::Digital]))
    }
}

#[async_trait]
impl NodeOperation for DigitalWriteNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let level = ctx.input_bool(Self::INPUT_VALUE, false);
        ctx.write_device(Value::Bool(level)).await?;
        Ok(Fired::one(0))
    }
}

/// Read HIGH or LOW from a digital input
#[derive(Debug, Default, Clone, Copy)]
pub struct DigitalReadNode;

impl DigitalReadNode {
    pub const NODE_TYPE: &'static str = "DigitalRead";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_NEXT: &'static str = "next";
    pub const PORT_VALUE: &'static str = "value";

    const OUTPUT_VALUE: usize = 1;
}

impl NodeDescriptor for DigitalReadNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Hardware, ExecutionMode::Imperative)
            .with_label("Digital Read")
            .with_description("Read HIGH or LOW from a digital input pin")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_output(PortDefinition::control(Self::PORT_NEXT))
            .with_output(PortDefinition::data(Self::PORT_VALUE, DataType::Bool))
            .with_hardware(HardwareRequirement::input(&[PinKind::Digital]))
    }
}

#[async_trait]
impl NodeOperation for DigitalReadNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let sample = ctx.read_device().await?;
        let level = value_as_bool(&sample).unwrap_or(false);
        ctx.set_output(Self::OUTPUT_VALUE, Value::Bool(level))?;
        Ok(Fired::one(0))
    }
}
