//! Comparison Nodes

use flow_engine::{
    DataType, ExecutionMode, NodeCategory, NodeDefinition, NodeDescriptor, NodeOperation,
    PortDefinition, RecomputeContext, Result,
};
use serde_json::{json, Value};

/// Compare `value` against `threshold`, with hysteresis
///
/// While below, `value` must exceed `threshold + hysteresis` to switch
/// above. While above, it must fall to `threshold - hysteresis` or lower
/// to switch back.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdNode;

impl ThresholdNode {
    const STATE_ABOVE: &'static str = "above";
}

impl NodeDescriptor for ThresholdNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new("Threshold", NodeCategory::Logic, ExecutionMode::Reactive)
            .with_description("Check if value exceeds threshold with optional hysteresis")
            .with_input(PortDefinition::data("value", DataType::Float).with_default(json!(0.0)))
            .with_input(PortDefinition::data("threshold", DataType::Float).with_default(json!(50.0)))
            .with_input(PortDefinition::data("hysteresis", DataType::Float).with_default(json!(0.0)))
            .with_output(PortDefinition::data("above", DataType::Bool))
            .with_output(PortDefinition::data("below", DataType::Bool))
    }
}

impl NodeOperation for ThresholdNode {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        let value = ctx.input_f64(0, 0.0);
        let threshold = ctx.input_f64(1, 50.0);
        let hysteresis = ctx.input_f64(2, 0.0).abs();
        let was_above = ctx
            .state_value(Self::STATE_ABOVE)
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let above = if was_above {
            value > threshold - hysteresis
        } else {
            value > threshold + hysteresis
        };
        ctx.set_state(Self::STATE_ABOVE, json!(above));
        ctx.set_output(0, json!(above));
        ctx.set_output(1, json!(!above));
        Ok(())
    }
}

/// Whether `value` lies in `[min, max]`
#[derive(Debug, Default, Clone, Copy)]
pub struct InRangeNode;

impl NodeDescriptor for InRangeNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new("InRange", NodeCategory::Logic, ExecutionMode::Reactive)
            .with_label("In Range")
            .with_description("Check if value is within min/max range")
            .with_input(PortDefinition::data("value", DataType::Float).with_default(json!(0.0)))
            .with_input(PortDefinition::data("min", DataType::Float).with_default(json!(0.0)))
            .with_input(PortDefinition::data("max", DataType::Float).with_default(json!(100.0)))
            .with_output(PortDefinition::data("in_range", DataType::Bool))
            .with_output(PortDefinition::data("out_of_range", DataType::Bool))
    }
}

impl NodeOperation for InRangeNode {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        let value = ctx.input_f64(0, 0.0);
        let inside = (ctx.input_f64(1, 0.0)..=ctx.input_f64(2, 100.0)).contains(&value);
        ctx.set_output(0, json!(inside));
        ctx.set_output(1, json!(!inside));
        Ok(())
    }
}
