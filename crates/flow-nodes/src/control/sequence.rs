//! Sequence Node

use async_trait::async_trait;
use flow_engine::{
    ExecutionMode, Fired, NodeCategory, NodeContext, NodeDefinition, NodeDescriptor,
    NodeOperation, PortDefinition, Result,
};

/// Runs `then_0` to `then_3` one after another
///
/// Each output's paths run to completion before the next output fires.
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceNode;

impl SequenceNode {
    pub const NODE_TYPE: &'static str = "Sequence";
    pub const PORT_EXEC: &'static str = "exec";
    pub const STEPS: usize = 4;
}

impl NodeDescriptor for SequenceNode {
    fn descriptor() -> NodeDefinition {
        (0..Self::STEPS).fold(
            NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Logic, ExecutionMode::Imperative)
                .with_description("Execute outputs in order")
                .with_input(PortDefinition::control(Self::PORT_EXEC)),
            |def, step| def.with_output(PortDefinition::control(format!("then_{}", step))),
        )
    }
}

#[async_trait]
impl NodeOperation for SequenceNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        for step in 0..Self::STEPS {
            ctx.fire_and_wait(step).await?;
        }
        Ok(Fired::none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor() {
        let def = SequenceNode::descriptor();
        let names: Vec<&str> = def.outputs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["then_0", "then_1", "then_2", "then_3"]);
    }
}
