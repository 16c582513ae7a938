//! Output Node
//!
//! Writes a value to the node's bound output device.

use async_trait::async_trait;
use flow_engine::{
    DataType, ErrorPolicy, ExecutionMode, Fired, HardwareRequirement, NodeCategory, NodeContext,
    NodeDefinition, NodeDescriptor, NodeOperation, PinKind, PortDefinition, Result,
};
use serde_json::json;

/// Writes `value` to the bound device, then fires `next`
///
/// `value` comes from the `value` property (HIGH by default) unless a data
/// connection drives it. Digital devices take it as a level, PWM and servo
/// devices as a number.
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputNode;

impl OutputNode {
    pub const NODE_TYPE: &'static str = "Output";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_VALUE: &'static str = "value";
    pub const PORT_NEXT: &'static str = "next";

    const INPUT_VALUE: usize = 1;
}

impl NodeDescriptor for OutputNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Experiment, ExecutionMode::Imperative)
            .with_description("Write HIGH/LOW or a level to a device")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_input(
                PortDefinition::data(Self::PORT_VALUE, DataType::Any)
                    .with_default(json!(true))
                    .with_description("HIGH (true) or LOW (false), or a PWM level"),
            )
            .with_output(PortDefinition::control(Self::PORT_NEXT))
            .with_property(Self::PORT_VALUE, json!(true))
            .with_hardware(HardwareRequirement::output(&[
                PinKind::Digital,
                PinKind::Pwm,
                PinKind::Servo,
            ]))
            .with_error_policy(ErrorPolicy::BySeverity)
    }
}

#[async_trait]
impl NodeOperation for OutputNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let value = ctx.input(Self::INPUT_VALUE);
        log::debug!("Output '{}': writing {}", ctx.node_id(), value);
        ctx.write_device(value).await?;
        Ok(Fired::one(0))
    }
}
