//! Wait For Input Node
//!
//! Polls the bound input device until a trigger condition holds or a
//! timeout expires.
//!
//! In digital mode the trigger is a rising edge. A level that is already
//! HIGH on the first sample counts as an edge, since the level before the
//! node started waiting is unknown and taken as LOW. In analog mode the
//! trigger is the sample crossing `threshold` in the configured direction.

use std::time::Duration;

use async_trait::async_trait;
use flow_engine::{
    value_as_bool, value_as_f64, DataType, ExecutionMode, Fired, FlowEngineError, HardwareError,
    HardwareRequirement, NodeCategory, NodeContext, NodeDefinition, NodeDescriptor,
    NodeOperation, PinKind, PortDefinition, Result,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How a sample is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Rising edge of a digital level
    #[default]
    Digital,
    /// Sample compared against `threshold`
    Analog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    #[default]
    Above,
    Below,
}

/// Settings read from node properties at each invocation
#[derive(Debug, Clone, PartialEq)]
struct WaitSettings {
    /// `None` waits forever
    timeout: Option<Duration>,
    poll_interval: Duration,
    mode: ThresholdMode,
    threshold: f64,
    direction: ThresholdDirection,
}

impl WaitSettings {
    fn from_properties(ctx: &NodeContext) -> Self {
        let seconds = |key: &str, default: f64| {
            let value = ctx.property_f64(key, default);
            (value.is_finite() && value > 0.0).then(|| Duration::from_secs_f64(value))
        };

        Self {
            timeout: seconds("timeout", 0.0),
            poll_interval: seconds("poll_interval", WaitForInputNode::DEFAULT_POLL_SECONDS)
                .unwrap_or(Duration::from_millis(1)),
            mode: parse_property(ctx, "threshold_mode").unwrap_or_default(),
            threshold: ctx.property_f64("threshold", WaitForInputNode::DEFAULT_THRESHOLD),
            direction: parse_property(ctx, "direction").unwrap_or_default(),
        }
    }
}

fn parse_property<T: DeserializeOwned>(ctx: &NodeContext, key: &str) -> Option<T> {
    ctx.property(key).and_then(|v| serde_json::from_value(v).ok())
}

/// Tracks the trigger condition across samples
#[derive(Debug)]
struct Detector {
    mode: ThresholdMode,
    threshold: f64,
    direction: ThresholdDirection,
    previous_high: bool,
}

impl Detector {
    fn new(settings: &WaitSettings) -> Self {
        Self {
            mode: settings.mode,
            threshold: settings.threshold,
            direction: settings.direction,
            previous_high: false,
        }
    }

    fn triggered(&mut self, sample: &Value) -> bool {
        match self.mode {
            ThresholdMode::Digital => {
                let high = value_as_bool(sample).unwrap_or(false);
                let rising = high && !self.previous_high;
                self.previous_high = high;
                rising
            }
            ThresholdMode::Analog => match value_as_f64(sample) {
                Some(level) => match self.direction {
                    ThresholdDirection::Above => level > self.threshold,
                    ThresholdDirection::Below => level < self.threshold,
                },
                None => false,
            },
        }
    }
}

/// Block the path until the bound input triggers
///
/// # Properties
/// - `timeout` - seconds, 0 waits forever
/// - `poll_interval` - seconds between samples, default 0.05
/// - `threshold_mode` - `digital` or `analog`
/// - `threshold` - analog trigger level, default 512
/// - `direction` - `above` or `below`
///
/// # Outputs
/// - `triggered` - fired with `value` set to the triggering sample
/// - `timeout` - fired when the timeout expires first
/// - `value`
#[derive(Debug, Default, Clone, Copy)]
pub struct WaitForInputNode;

impl WaitForInputNode {
    pub const NODE_TYPE: &'static str = "WaitForInput";
    pub const PORT_EXEC: &'static str = "exec";
    pub const PORT_TRIGGERED: &'static str = "triggered";
    pub const PORT_TIMEOUT: &'static str = "timeout";
    pub const PORT_VALUE: &'static str = "value";

    /// Consecutive failed reads before the node gives up
    pub const MAX_READ_ERRORS: usize = 3;

    const OUTPUT_TRIGGERED: usize = 0;
    const OUTPUT_TIMEOUT: usize = 1;
    const OUTPUT_VALUE: usize = 2;
    const DEFAULT_POLL_SECONDS: f64 = 0.05;
    const DEFAULT_THRESHOLD: f64 = 512.0;
}

impl NodeDescriptor for WaitForInputNode {
    fn descriptor() -> NodeDefinition {
        NodeDefinition::new(Self::NODE_TYPE, NodeCategory::Logic, ExecutionMode::Imperative)
            .with_description("Wait for input trigger (digital edge or analog threshold)")
            .with_input(PortDefinition::control(Self::PORT_EXEC))
            .with_output(PortDefinition::control(Self::PORT_TRIGGERED))
            .with_output(PortDefinition::control(Self::PORT_TIMEOUT))
            .with_output(
                PortDefinition::data(Self::PORT_VALUE, DataType::Any)
                    .with_description("Read value when triggered"),
            )
            .with_property("timeout", json!(0.0))
            .with_property("poll_interval", json!(Self::DEFAULT_POLL_SECONDS))
            .with_property("threshold_mode", json!("digital"))
            .with_property("threshold", json!(Self::DEFAULT_THRESHOLD))
            .with_property("direction", json!("above"))
            .with_hardware(HardwareRequirement::input(&[PinKind::Digital, PinKind::Analog]))
    }
}

#[async_trait]
impl NodeOperation for WaitForInputNode {
    async fn execute(&self, ctx: &NodeContext) -> Result<Fired> {
        let settings = WaitSettings::from_properties(ctx);
        log::debug!("WaitForInput '{}': {:?}", ctx.node_id(), settings);

        let mut detector = Detector::new(&settings);
        let started = ctx.active_elapsed();
        let mut errors = 0;

        loop {
            // Read time counts toward the timeout, pauses do not
            let waited = ctx.active_elapsed().saturating_sub(started);
            if settings.timeout.is_some_and(|timeout| waited >= timeout) {
                log::info!("WaitForInput '{}' timed out after {:?}", ctx.node_id(), waited);
                return Ok(Fired::one(Self::OUTPUT_TIMEOUT));
            }

            match ctx.read_device().await {
                Ok(sample) => {
                    errors = 0;
                    if detector.triggered(&sample) {
                        log::info!("WaitForInput '{}' triggered by {}", ctx.node_id(), sample);
                        ctx.set_output(Self::OUTPUT_VALUE, sample)?;
                        return Ok(Fired::one(Self::OUTPUT_TRIGGERED));
                    }
                }
                Err(FlowEngineError::Hardware(error)) => {
                    errors += 1;
                    log::warn!(
                        "WaitForInput '{}' read failed ({}/{}): {}",
                        ctx.node_id(),
                        errors,
                        Self::MAX_READ_ERRORS,
                        error
                    );
                    if errors >= Self::MAX_READ_ERRORS {
                        return Err(HardwareError::NodeFault(format!(
                            "Device polling failed after {} consecutive errors: {}",
                            errors, error
                        ))
                        .into());
                    }
                }
                Err(other) => return Err(other),
            }

            ctx.sleep(settings.poll_interval).await?;
        }
    }
}
