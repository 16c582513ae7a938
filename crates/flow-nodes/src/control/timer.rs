//! Timer Node
//!
//! Starts with the run and fires `tick` every `interval` seconds while
//! `enabled` is true, until the run stops. A tick waits for the paths it
//! starts, so a body slower than the interval stretches the period instead
//! of overlapping itself.

use std::time::Duration;

use async_trait::async_trait;
use flow_engine::{
    DataType, ExecutionMode, Fired, NodeCategory, NodeContext, NodeDefinition, NodeDescriptor,
    NodeOperation, PortDefinition, Result,
};
use serde_json::json;

/// Periodic `tick` source
///
/// # Inputs
/// - `interval` - seconds between ticks, at least 0.01 (default 1.0)
/// - `enabled` - ticks are skipped while false
///
/// # Outputs
/// - `tick`
/// - `count` - ticks fired so far
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerNode;

impl TimerNode {
    pub const NODE_TYPE: &'static str = "Timer";
    pub const PORT_INTERVAL: &'static str = "interval";
    pub const PORT_ENABLED: &'static str = "enabled";
    pub const PORT_TICK: &'static str = "tick";
    pub const PORT_COUNT: &'static str = "count";

    const INPUT_INTERVAL: usize = 0;
    const INPUT_ENABLED: usize = 1;
    const OUTPUT_TICK: usize = 0;
    const OUTPUT_COUNT: usize = 1;
    const DEFAULT_SECONDS: f64 = 1.0;
    const MIN_SECONDS: f64 = 0.01;
}

impl NodeDescriptor for TimerNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Logic, ExecutionMode::Imperative)
            .with_description("Fire periodically while enabled")
            .with_input(
                PortDefinition::data(Self::PORT_INTERVAL, DataType::Float)
                    .with_default(json!(Self::DEFAULT_SECONDS))
                    .with_description("Seconds between ticks"),
            )
            .with_input(
                PortDefinition::data(Self::PORT_ENABLED, DataType::Bool).with_default(json!(true)),
            )
            .with_output(PortDefinition::control(Self::PORT_TICK))
            .with_output(PortDefinition::data(Self::PORT_COUNT, DataType::Int))
            .with_property(Self::PORT_INTERVAL, json!(Self::DEFAULT_SECONDS))
            .with_property(Self::PORT_ENABLED, json!(true))
    }
}

fn tick_interval(seconds: f64) -> Duration {
    if seconds.is_finite() {
        Duration::from_secs_f64(seconds.max(TimerNode::MIN_SECONDS))
    } else {
        Duration::from_secs_f64(TimerNode::DEFAULT_SECONDS)
    }
}

#[async_trait]
impl NodeOperation for TimerNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let mut count: u64 = 0;
        ctx.set_output(Self::OUTPUT_COUNT, json!(count))?;

        loop {
            let interval = tick_interval(ctx.input_f64(Self::INPUT_INTERVAL, Self::DEFAULT_SECONDS));
            ctx.sleep(interval).await?;
            if !ctx.input_bool(Self::INPUT_ENABLED, true) {
                continue;
            }

            count += 1;
            log::trace!("Timer '{}' tick {}", ctx.node_id(), count);
            ctx.set_output(Self::OUTPUT_COUNT, json!(count))?;
            ctx.fire_and_wait(Self::OUTPUT_TICK).await?;
        }
    }
}
