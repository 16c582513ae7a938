//! Branch Node

use async_trait::async_trait;
use flow_engine::{
    DataType, ExecutionMode, Fired, NodeCategory, NodeContext, NodeDefinition, NodeDescriptor,
    NodeOperation, PortDefinition, Result,
};
use serde_json::json;

/// Fires exactly one of `true` / `false` depending on `condition`
#[derive(Debug, Default, Clone, Copy)]
pub struct BranchNode;

impl BranchNode {
    pub const NODE_TYPE: &'static str = "Branch";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_CONDITION: &'static str = "condition";
    pub const PORT_TRUE: &'static str = "true";
    pub const PORT_FALSE: &'static str = "false";

    const INPUT_CONDITION: usize = 1;
    const OUTPUT_TRUE: usize = 0;
    const OUTPUT_FALSE: usize = 1;
}

impl NodeDescriptor for BranchNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Logic, ExecutionMode::Imperative)
            .with_description("Route the control flow on a boolean condition")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_input(
                PortDefinition::data(Self::PORT_CONDITION, DataType::Bool).with_default(json!(false)),
            )
            .with_output(PortDefinition::control(Self::PORT_TRUE))
            .with_output(PortDefinition::control(Self::PORT_FALSE))
    }
}

#[async_trait]
impl NodeOperation for BranchNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let condition = ctx.input_bool(Self::INPUT_CONDITION, false);
        log::debug!("Branch '{}': condition is {}", ctx.node_id(), condition);
        Ok(Fired::one(if condition {
            Self::OUTPUT_TRUE
        } else {
            Self::OUTPUT_FALSE
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor() {
        let def = BranchNode::descriptor();
        assert_eq!(def.input_index("condition"), Some(BranchNode::INPUT_CONDITION));
        assert_eq!(def.output_index("false"), Some(BranchNode::OUTPUT_FALSE));
    }
}
