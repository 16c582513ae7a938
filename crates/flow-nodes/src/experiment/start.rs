//! Start Experiment Node
//!
//! Entry point of an experiment flow.

use async_trait::async_trait;
use flow_engine::{
    ExecutionMode, Fired, NodeCategory, NodeContext, NodeDefinition, NodeDescriptor,
    NodeOperation, PortDefinition, Result,
};

/// Fires `next` as soon as the run starts
///
/// Having no control input, every instance is an entry node and starts
/// its own control path.
#[derive(Debug, Default, Clone, Copy)]
pub struct StartExperimentNode;

impl StartExperimentNode {
    pub const NODE_TYPE: &'static str = "StartExperiment";
    /// Port ID for the control output
    pub const PORT_NEXT: &'static str = "next";
}

impl NodeDescriptor for StartExperimentNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Experiment, ExecutionMode::Imperative)
            .with_label("Start Experiment")
            .with_description("Entry point, begins the experiment flow")
            .with_output(PortDefinition::control(Self::PORT_NEXT))
    }
}

#[async_trait]
impl NodeOperation for StartExperimentNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        log::info!("Experiment started at node '{}'", ctx.node_id());
        Ok(Fired::one(0))
    }
}
