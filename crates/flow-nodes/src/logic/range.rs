//! Range Nodes

use flow_engine::{
    DataType, ExecutionMode, NodeCategory, NodeDefinition, NodeDescriptor, NodeOperation,
    PortDefinition, RecomputeContext, Result,
};
use serde_json::json;

fn float_input(name: &str, default: f64) -> PortDefinition {
    PortDefinition::data(name, DataType::Float).with_default(json!(default))
}

/// Linearly map `value` from `[in_min, in_max]` onto `[out_min, out_max]`
///
/// The result is not clamped. An empty input range maps everything to
/// `out_min`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MapRangeNode;

impl NodeDescriptor for MapRangeNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new("MapRange", NodeCategory::Logic, ExecutionMode::Reactive)
            .with_label("Map Range")
            .with_description("Map value from input range to output range")
            .with_input(float_input("value", 0.0))
            .with_input(float_input("in_min", 0.0))
            .with_input(float_input("in_max", 1023.0))
            .with_input(float_input("out_min", 0.0))
            .with_input(float_input("out_max", 255.0))
            .with_output(PortDefinition::data("result", DataType::Float))
    }
}

impl NodeOperation for MapRangeNode {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        let value = ctx.input_f64(0, 0.0);
        let (in_min, in_max) = (ctx.input_f64(1, 0.0), ctx.input_f64(2, 1023.0));
        let (out_min, out_max) = (ctx.input_f64(3, 0.0), ctx.input_f64(4, 255.0));

        let result = if in_max == in_min {
            out_min
        } else {
            (value - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
        };
        ctx.set_output(0, json!(result));
        Ok(())
    }
}

/// Limit `value` to `[min, max]`
#[derive(Debug, Default, Clone, Copy)]
pub struct ClampNode;

impl NodeDescriptor for ClampNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new("Clamp", NodeCategory::Logic, ExecutionMode::Reactive)
            .with_description("Clamp value between min and max")
            .with_input(float_input("value", 0.0))
            .with_input(float_input("min", 0.0))
            .with_input(float_input("max", 100.0))
            .with_output(PortDefinition::data("result", DataType::Float))
    }
}

impl NodeOperation for ClampNode {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        let value = ctx.input_f64(0, 0.0);
        let (min, max) = (ctx.input_f64(1, 0.0), ctx.input_f64(2, 100.0));
        // min wins when the bounds cross
        ctx.set_output(0, json!(value.min(max).max(min)));
        Ok(())
    }
}
