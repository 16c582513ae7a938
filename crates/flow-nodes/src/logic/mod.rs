//! Logic nodes
//!
//! Reactive computations. Each node recomputes whenever one of its data
//! inputs changes and never takes part in control flow.

mod comparison;
mod math;
mod pid;
mod range;

pub use comparison::{InRangeNode, ThresholdNode};
pub use math::{AddNode, DivideNode, MultiplyNode, SubtractNode};
pub use pid::PidNode;
pub use range::{ClampNode, MapRangeNode};

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use flow_engine::{EngineEvent, EventCategory, FlowEngine};
    use serde_json::{json, Map, Value};

    use crate::setup::builtin_registry;

    fn engine_with(node_type: &str) -> FlowEngine {
        let engine = FlowEngine::with_registry(Arc::new(builtin_registry()));
        engine
            .add_node_with_id("n", node_type, (0.0, 0.0), Map::new())
            .unwrap();
        engine
    }

    fn apply(engine: &FlowEngine, inputs: &[(usize, Value)]) {
        for (index, value) in inputs {
            engine.set_input("n", *index, value.clone()).unwrap();
        }
    }

    fn output(engine: &FlowEngine, index: usize) -> Value {
        engine.get_output("n", index).unwrap()
    }

    #[test]
    fn test_arithmetic() {
        for (node_type, expected) in [
            ("Add", 8.0),
            ("Subtract", 4.0),
            ("Multiply", 12.0),
            ("Divide", 3.0),
        ] {
            let engine = engine_with(node_type);
            apply(&engine, &[(0, json!(6)), (1, json!(2))]);
            assert_eq!(output(&engine, 0), json!(expected), "{}", node_type);
        }
    }

    #[test]
    fn test_divide_by_zero_flags_and_outputs_zero() {
        let engine = engine_with("Divide");
        let mut errors = engine.subscribe(&[EventCategory::NodeError]);
        apply(&engine, &[(0, json!(5)), (1, json!(0))]);

        assert_eq!(output(&engine, 0), json!(0.0));
        assert_eq!(engine.node_error("n").as_deref(), Some("Division by zero"));
        assert!(matches!(
            &errors.drain()[..],
            [EngineEvent::NodeError { message, .. }] if message == "Division by zero"
        ));

        apply(&engine, &[(1, json!(2))]);
        assert_eq!(output(&engine, 0), json!(2.5));
        assert!(engine.node_error("n").is_none());
    }

    #[test]
    fn test_map_range() {
        let engine = engine_with("MapRange");
        apply(&engine, &[(0, json!(1023))]);
        assert_eq!(output(&engine, 0), json!(255.0));

        apply(&engine, &[(1, json!(10)), (2, json!(10))]);
        assert_eq!(output(&engine, 0), json!(0.0));
    }

    #[test]
    fn test_clamp() {
        let engine = engine_with("Clamp");
        apply(&engine, &[(0, json!(150))]);
        assert_eq!(output(&engine, 0), json!(100.0));
        apply(&engine, &[(0, json!(-3))]);
        assert_eq!(output(&engine, 0), json!(0.0));
    }

    #[test]
    fn test_threshold_hysteresis() {
        let engine = engine_with("Threshold");
        apply(&engine, &[(1, json!(50)), (2, json!(5))]);

        let levels = [52.0, 56.0, 48.0, 44.0, 53.0];
        let mut seen = Vec::new();
        for level in levels {
            apply(&engine, &[(0, json!(level))]);
            seen.push(output(&engine, 0));
        }
        assert_eq!(
            seen,
            vec![json!(false), json!(true), json!(true), json!(false), json!(false)]
        );
        assert_eq!(output(&engine, 1), json!(true));
    }

    #[test]
    fn test_in_range() {
        let engine = engine_with("InRange");
        apply(&engine, &[(0, json!(100))]);
        assert_eq!(output(&engine, 0), json!(true));
        apply(&engine, &[(0, json!(100.5))]);
        assert_eq!(output(&engine, 0), json!(false));
        assert_eq!(output(&engine, 1), json!(true));
    }

    #[test]
    fn test_pid_outputs_error() {
        let engine = engine_with("Pid");
        apply(&engine, &[(2, json!(2.0)), (0, json!(40))]);
        assert_eq!(output(&engine, 1), json!(40.0));
        assert_eq!(output(&engine, 0), json!(80.0));

        apply(&engine, &[(0, json!(1000))]);
        assert_eq!(output(&engine, 0), json!(255.0));
    }
}
