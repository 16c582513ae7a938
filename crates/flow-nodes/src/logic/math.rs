//! Arithmetic Nodes
//!
//! Two-operand arithmetic on `a` and `b`, written to `result`.

use flow_engine::{
    DataType, ExecutionMode, NodeCategory, NodeDefinition, NodeDescriptor, NodeOperation,
    PortDefinition, RecomputeContext, Result,
};
use serde_json::json;

pub const PORT_A: &str = "a";
pub const PORT_B: &str = "b";
pub const PORT_RESULT: &str = "result";

fn binary(node_type: &str, description: &str, b_default: f64) -> NodeDefinition {
    NodeDefinition::new(node_type, NodeCategory::Logic, ExecutionMode::Reactive)
        .with_description(description)
        .with_input(PortDefinition::data(PORT_A, DataType::Float).with_default(json!(0.0)))
        .with_input(PortDefinition::data(PORT_B, DataType::Float).with_default(json!(b_default)))
        .with_output(PortDefinition::data(PORT_RESULT, DataType::Float))
}

fn operands(ctx: &RecomputeContext<'_>, b_default: f64) -> (f64, f64) {
    (ctx.input_f64(0, 0.0), ctx.input_f64(1, b_default))
}

/// `a + b`
#[derive(Debug, Default, Clone, Copy)]
pub struct AddNode;

impl NodeDescriptor for AddNode {
    fn descriptor() -> NodeDefinition {
        binary("Add", "Add two numbers: a + b", 0.0)
    }
}

impl NodeOperation for AddNode {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        let (a, b) = operands(ctx, 0.0);
        ctx.set_output(0, json!(a + b));
        Ok(())
    }
}

/// `a - b`
#[derive(Debug, Default, Clone, Copy)]
pub struct SubtractNode;

impl NodeDescriptor for SubtractNode {
    fn descriptor() -> NodeDefinition {
        binary("Subtract", "Subtract two numbers: a - b", 0.0)
    }
}

impl NodeOperation for SubtractNode {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        let (a, b) = operands(ctx, 0.0);
        ctx.set_output(0, json!(a - b));
        Ok(())
    }
}

/// `a * b`
#[derive(Debug, Default, Clone, Copy)]
pub struct MultiplyNode;

impl NodeDescriptor for MultiplyNode {
    fn descriptor() -> NodeDefinition {
        binary("Multiply", "Multiply two numbers: a * b", 1.0)
    }
}

impl NodeOperation for MultiplyNode {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        let (a, b) = operands(ctx, 1.0);
        ctx.set_output(0, json!(a * b));
        Ok(())
    }
}

/// `a / b`; dividing by zero outputs 0 and flags the node
#[derive(Debug, Default, Clone, Copy)]
pub struct DivideNode;

impl NodeDescriptor for DivideNode {
    fn descriptor() -> NodeDefinition {
        binary("Divide", "Divide two numbers: a / b", 1.0)
    }
}

impl NodeOperation for DivideNode {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        let (a, b) = operands(ctx, 1.0);
        if b == 0.0 {
            ctx.set_error("Division by zero");
            ctx.set_output(0, json!(0.0));
        } else {
            ctx.set_output(0, json!(a / b));
        }
        Ok(())
    }
}
