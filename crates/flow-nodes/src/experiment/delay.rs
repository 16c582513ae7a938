//! Delay Node
//!
//! Waits for a number of seconds before continuing the path. The wait is
//! pause-aware: pausing the run freezes the remaining time.

use std::time::Duration;

use async_trait::async_trait;
use flow_engine::{
    DataType, ExecutionMode, Fired, NodeCategory, NodeContext, NodeDefinition, NodeDescriptor,
    NodeOperation, PortDefinition, Result,
};
use serde_json::json;

/// Sleeps for `duration` seconds, then fires `next`
///
/// # Inputs
/// - `exec` - control
/// - `duration` - seconds; seeded from the `duration` property (default 1.0)
///   unless a data connection drives it
///
/// # Outputs
/// - `next` - fired once the delay elapses
#[derive(Debug, Default, Clone, Copy)]
pub struct DelayNode;

impl DelayNode {
    pub const NODE_TYPE: &'static str = "Delay";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_DURATION: &'static str = "duration";
    pub const PORT_NEXT: &'static str = "next";

    const INPUT_DURATION: usize = 1;
    const DEFAULT_SECONDS: f64 = 1.0;
}

impl NodeDescriptor for DelayNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Experiment, ExecutionMode::Imperative)
            .with_description("Wait for a duration in seconds")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_input(
                PortDefinition::data(Self::PORT_DURATION, DataType::Float)
                    .with_default(json!(Self::DEFAULT_SECONDS))
                    .with_description("Duration in seconds"),
            )
            .with_output(PortDefinition::control(Self::PORT_NEXT))
            .with_property(Self::PORT_DURATION, json!(Self::DEFAULT_SECONDS))
    }
}

#[async_trait]
impl NodeOperation for DelayNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let seconds = ctx.input_f64(Self::INPUT_DURATION, Self::DEFAULT_SECONDS);
        let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
        log::debug!("Delay '{}': waiting {}s", ctx.node_id(), seconds);
        ctx.sleep(Duration::from_secs_f64(seconds)).await?;
        Ok(Fired::one(0))
    }
}
