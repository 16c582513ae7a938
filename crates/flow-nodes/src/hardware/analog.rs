//! Analog Nodes
//!
//! ADC reads and PWM writes.

use async_trait::async_trait;
use flow_engine::{
    value_as_f64, DataType, ExecutionMode, Fired, HardwareError, HardwareRequirement,
    NodeCategory, NodeContext, NodeDefinition, NodeDescriptor, NodeOperation, PinKind,
    PortDefinition, Result,
};
use serde_json::json;

/// Full-scale reading of a 10-bit ADC
pub const ADC_MAX: f64 = 1023.0;
/// ADC reference voltage
pub const REFERENCE_VOLTAGE: f64 = 5.0;
/// Largest 8-bit PWM duty value
pub const PWM_MAX: f64 = 255.0;

/// Convert a raw ADC reading to volts
pub fn to_voltage(raw: f64) -> f64 {
    raw * REFERENCE_VOLTAGE / ADC_MAX
}

/// Read an analog input
///
/// # Outputs
/// - `next`
/// - `value` - raw reading, 0 to 1023
/// - `voltage` - the reading scaled to 0 to 5 V
#[derive(Debug, Default, Clone, Copy)]
pub struct AnalogReadNode;

impl AnalogReadNode {
    pub const NODE_TYPE: &'static str = "AnalogRead";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_NEXT: &'static str = "next";
    pub const PORT_VALUE: &'static str = "value";
    pub const PORT_VOLTAGE: &'static str = "voltage";

    const OUTPUT_VALUE: usize = 1;
    const OUTPUT_VOLTAGE: usize = 2;
}

impl NodeDescriptor for AnalogReadNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Hardware, ExecutionMode::Imperative)
            .with_label("Analog Read")
            .with_description("Read analog value (0-1023 for 10-bit ADC)")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_output(PortDefinition::control(Self::PORT_NEXT))
            .with_output(PortDefinition::data(Self::PORT_VALUE, DataType::Int))
            .with_output(PortDefinition::data(Self::PORT_VOLTAGE, DataType::Float))
            .with_hardware(HardwareRequirement::input(&[PinKind::Analog]))
    }
}

#[async_trait]
impl NodeOperation for AnalogReadNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let sample = ctx.read_device().await?;
        let raw = value_as_f64(&sample).ok_or_else(|| {
            HardwareError::InvalidValue(format!("{} is not an analog reading", sample))
        })?;
        ctx.set_output(Self::OUTPUT_VALUE, json!(raw.round() as i64))?;
        ctx.set_output(Self::OUTPUT_VOLTAGE, json!(to_voltage(raw)))?;
        Ok(Fired::one(0))
    }
}

/// Write an 8-bit PWM duty cycle, clamped to 0 to 255
#[derive(Debug, Default, Clone, Copy)]
pub struct PwmWriteNode;

impl PwmWriteNode {
    pub const NODE_TYPE: &'static str = "PwmWrite";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_VALUE: &'static str = "value";
    pub const PORT_NEXT: &'static str = "next";

    const INPUT_VALUE: usize = 1;
}

impl NodeDescriptor for PwmWriteNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Hardware, ExecutionMode::Imperative)
            .with_label("PWM Write")
            .with_description("Write PWM value (0-255 for 8-bit PWM)")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_input(PortDefinition::data(Self::PORT_VALUE, DataType::Int).with_default(json!(0)))
            .with_output(PortDefinition::control(Self::PORT_NEXT))
            .with_hardware(HardwareRequirement::output(&[PinKind::Pwm]))
    }
}

#[async_trait]
impl NodeOperation for PwmWriteNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let duty = ctx.input_f64(Self::INPUT_VALUE, 0.0).clamp(0.0, PWM_MAX).round() as i64;
        ctx.write_device(json!(duty)).await?;
        Ok(Fired::one(0))
    }
}
