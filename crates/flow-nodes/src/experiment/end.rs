//! End Experiment Node

use async_trait::async_trait;
use flow_engine::{
    ExecutionMode, Fired, NodeCategory, NodeContext, NodeDefinition, NodeDescriptor,
    NodeOperation, PortDefinition, Result,
};

/// Terminates the control path that reaches it
#[derive(Debug, Default, Clone, Copy)]
pub struct EndExperimentNode;

impl EndExperimentNode {
    pub const NODE_TYPE: &'static str = "EndExperiment";
    pub const PORT_EXEC: &'static str = "exec";
}

impl NodeDescriptor for EndExperimentNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Experiment, ExecutionMode::Imperative)
            .with_label("End Experiment")
            .with_description("Exit point, ends the experiment path")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
    }
}

#[async_trait]
impl NodeOperation for EndExperimentNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        log::info!(
            "Experiment path ended at node '{}' after {:?}",
            ctx.node_id(),
            ctx.elapsed()
        );
        Ok(Fired::none())
    }
}
