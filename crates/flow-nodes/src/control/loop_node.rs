//! Loop Node
//!
//! Repeats its `body` output a fixed number of times, or until the run is
//! stopped. Each iteration waits for every path started by `body` to
//! finish before the next one begins.

use std::time::Duration;

use async_trait::async_trait;
use flow_engine::{
    DataType, ExecutionMode, Fired, NodeCategory, NodeContext, NodeDefinition, NodeDescriptor,
    NodeOperation, PortDefinition, Result,
};
use serde_json::json;

/// Repeat `body` `count` times (0 = until stopped), then fire `done`
///
/// # Properties
/// - `count` - iterations, 0 for infinite
/// - `delay` - seconds to wait between iterations, default 0.0
///
/// # Outputs
/// - `body` - fired once per iteration
/// - `done` - fired after the last iteration
/// - `iteration` - zero-based index of the current iteration
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopNode;

impl LoopNode {
    pub const NODE_TYPE: &'static str = "Loop";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_BODY: &'static str = "body";
    pub const PORT_DONE: &'static str = "done";
    pub const PORT_ITERATION: &'static str = "iteration";

    const OUTPUT_BODY: usize = 0;
    const OUTPUT_DONE: usize = 1;
    const OUTPUT_ITERATION: usize = 2;
}

impl NodeDescriptor for LoopNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Logic, ExecutionMode::Imperative)
            .with_description("Repeat actions N times (0 = infinite)")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_output(PortDefinition::control(Self::PORT_BODY))
            .with_output(PortDefinition::control(Self::PORT_DONE))
            .with_output(PortDefinition::data(Self::PORT_ITERATION, DataType::Int))
            .with_property("count", json!(0))
            .with_property("delay", json!(0.0))
    }
}

#[async_trait]
impl NodeOperation for LoopNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let count = ctx.property_f64("count", 0.0).max(0.0) as u64;
        let delay = ctx.property_f64("delay", 0.0);
        let delay = (delay.is_finite() && delay > 0.0).then(|| Duration::from_secs_f64(delay));
        log::debug!(
            "Loop '{}': count {} (0 = infinite), delay {:?}",
            ctx.node_id(),
            count,
            delay
        );

        let mut iteration: u64 = 0;
        while count == 0 || iteration < count {
            ctx.set_output(Self::OUTPUT_ITERATION, json!(iteration))?;
            ctx.fire_and_wait(Self::OUTPUT_BODY).await?;
            iteration += 1;

            match delay {
                Some(delay) if count == 0 || iteration < count => ctx.sleep(delay).await?,
                // an empty body must not starve the runtime
                _ => tokio::task::yield_now().await,
            }
        }

        log::debug!("Loop '{}' completed after {} iteration(s)", ctx.node_id(), iteration);
        Ok(Fired::one(Self::OUTPUT_DONE))
    }
}
