//! PID Controller Node
//!
//! Proportional-integral-derivative control on `setpoint` and
//! `process_value`. The integral, the previous error and the time of the
//! previous sample live in the node's state blob, so they persist between
//! recomputes and are captured by graph snapshots.

use flow_engine::{
    DataType, ExecutionMode, NodeCategory, NodeDefinition, NodeDescriptor, NodeOperation,
    PortDefinition, RecomputeContext, Result,
};
use serde_json::{json, Value};

/// Output saturation limit, symmetric around zero
pub const OUTPUT_LIMIT: f64 = 255.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct PidState {
    integral: f64,
    last_error: f64,
    /// Seconds on the engine clock at the previous sample
    last_time: Option<f64>,
}

impl PidState {
    fn load(ctx: &RecomputeContext<'_>) -> Self {
        let number = |key: &str| ctx.state_value(key).and_then(Value::as_f64);
        Self {
            integral: number("integral").unwrap_or(0.0),
            last_error: number("last_error").unwrap_or(0.0),
            last_time: number("last_time"),
        }
    }

    fn store(&self, ctx: &mut RecomputeContext<'_>) {
        ctx.set_state("integral", json!(self.integral));
        ctx.set_state("last_error", json!(self.last_error));
        if let Some(time) = self.last_time {
            ctx.set_state("last_time", json!(time));
        }
    }

    /// Advance one sample; returns the clamped controller output
    fn step(&mut self, gains: (f64, f64, f64), error: f64, now: f64) -> f64 {
        let (kp, ki, kd) = gains;
        let dt = self.last_time.map(|last| now - last);
        self.last_time = Some(now);

        let (accumulated, derivative) = match dt {
            Some(dt) => {
                let dt = if dt > 0.0 { dt } else { 0.001 };
                (error * dt, (error - self.last_error) / dt)
            }
            None => (0.0, 0.0),
        };
        self.integral += accumulated;
        self.last_error = error;

        let raw = kp * error + ki * self.integral + kd * derivative;
        let output = raw.clamp(-OUTPUT_LIMIT, OUTPUT_LIMIT);
        // anti-windup: a saturated output stops integrating
        if output.abs() >= OUTPUT_LIMIT {
            self.integral -= accumulated;
        }
        output
    }
}

/// PID controller with ±255 output and anti-windup
///
/// # Inputs
/// - `setpoint`, `process_value`
/// - `kp` (1.0), `ki` (0.0), `kd` (0.0)
///
/// # Outputs
/// - `output` - clamped controller output
/// - `error` - `setpoint - process_value`
#[derive(Debug, Default, Clone, Copy)]
pub struct PidNode;

impl NodeDescriptor for PidNode {
    fn descriptor() -> NodeDefinition {
        let input = |name: &str, default: f64| {
            PortDefinition::data(name, DataType::Float).with_default(json!(default))
        };
        NodeDefinition::new("Pid", NodeCategory::Logic, ExecutionMode::Reactive)
            .with_label("PID Controller")
            .with_description("Proportional-Integral-Derivative controller")
            .with_input(input("setpoint", 0.0))
            .with_input(input("process_value", 0.0))
            .with_input(input("kp", 1.0))
            .with_input(input("ki", 0.0))
            .with_input(input("kd", 0.0))
            .with_output(PortDefinition::data("output", DataType::Float))
            .with_output(PortDefinition::data("error", DataType::Float))
    }
}

impl NodeOperation for PidNode {
    fn recompute(&self, ctx: &mut RecomputeContext<'_>) -> Result<()> {
        let error = ctx.input_f64(0, 0.0) - ctx.input_f64(1, 0.0);
        let gains = (
            ctx.input_f64(2, 1.0),
            ctx.input_f64(3, 0.0),
            ctx.input_f64(4, 0.0),
        );
        let now = ctx.elapsed().as_secs_f64();

        let mut state = PidState::load(ctx);
        let output = state.step(gains, error, now);
        state.store(ctx);

        ctx.set_output(0, json!(output));
        ctx.set_output(1, json!(error));
        Ok(())
    }
}
